//! Application state for the healthdesk CLI.
//!
//! `App` wires configuration, token storage, the identity service and the
//! API client into one `SessionManager`, and implements each CLI command on
//! top of it.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use healthdesk_core::api::{ApiClient, ApiError, HttpIdentityService, Registration, UserProfile};
use healthdesk_core::auth::{Phase, RouteAccess, RouteGuard, SessionManager, SessionSnapshot};
use healthdesk_core::Config;

/// Environment variables for non-interactive login
const ENV_EMAIL: &str = "HEALTHDESK_EMAIL";
const ENV_PASSWORD: &str = "HEALTHDESK_PASSWORD";

pub struct App {
    pub config: Config,
    pub api: ApiClient,
    pub session: SessionManager,
}

impl App {
    /// Create a new application instance and restore any stored session
    pub async fn new(config: Config) -> Result<Self> {
        debug!(api = %config.api_base_url, storage = ?config.token_storage, "Config loaded");

        let api = ApiClient::new(&config.api_base_url, config.request_timeout())?;
        let identity = HttpIdentityService::with_client(api.http().clone(), &config.api_base_url);
        let store = config.token_store()?;

        let session = SessionManager::new(Arc::new(identity), store, Arc::new(api.clone()))
            .with_request_timeout(config.request_timeout());

        let phase = session.initialize().await;
        debug!(%phase, "Startup session check finished");

        Ok(Self {
            config,
            api,
            session,
        })
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.session.snapshot()
    }

    /// Print the session state and what a protected view would do with it
    pub fn status(&self) {
        let snapshot = self.snapshot();
        let verdict = RouteGuard::check(&snapshot, RouteAccess::Protected);

        println!("Session: {}", snapshot.phase);
        if let Some(ref credential) = snapshot.credential {
            println!("Signed in as {} <{}>", credential.greeting_name(), credential.email());
            println!("Doctor: {}", if credential.is_privileged_actor() { "yes" } else { "no" });
            if let Some(expiry) = credential.expires_at_utc() {
                println!("Access token expires: {}", expiry.to_rfc3339());
            }
        }
        match RouteGuard::redirect_target(verdict) {
            Some(target) => println!("Protected views: redirect to {}", target),
            None => println!("Protected views: {:?}", verdict),
        }
    }

    /// Login with email from args/env/config and password from env or prompt
    pub async fn login(&mut self, email: Option<String>) -> Result<()> {
        let email = email
            .or_else(|| std::env::var(ENV_EMAIL).ok())
            .or_else(|| self.config.last_email.clone())
            .map(Ok)
            .unwrap_or_else(|| prompt("Email: "))?;

        let password = match std::env::var(ENV_PASSWORD) {
            Ok(p) if !p.is_empty() => p,
            _ => rpassword::prompt_password("Password: ")?,
        };

        if email.trim().is_empty() || password.is_empty() {
            return Err(anyhow::anyhow!("Email and password required"));
        }

        match self.session.login(email.trim(), &password).await {
            Ok(credential) => {
                self.config.last_email = Some(email.trim().to_string());
                if let Err(e) = self.config.save() {
                    warn!(error = %e, "Failed to save config");
                }
                info!("Login successful");
                println!("Welcome, {}", credential.greeting_name());
                Ok(())
            }
            Err(e) => Err(anyhow::anyhow!(e.user_message())),
        }
    }

    pub async fn logout(&self) {
        self.session.logout().await;
        println!("Logged out");
    }

    pub async fn refresh(&self) -> Result<()> {
        self.session
            .refresh()
            .await
            .context("Session could not be renewed; please log in again")?;
        println!("Access token refreshed");
        Ok(())
    }

    pub async fn register(&self) -> Result<()> {
        let first_name = prompt("First name: ")?;
        let last_name = prompt("Last name: ")?;
        let email = prompt("Email: ")?;
        let password = rpassword::prompt_password("Password: ")?;
        let password2 = rpassword::prompt_password("Confirm password: ")?;
        let is_doctor = !prompt("Register as a doctor? [Y/n]: ")?
            .trim()
            .eq_ignore_ascii_case("n");

        let registration = Registration {
            is_doctor,
            ..Registration::new(first_name, last_name, email, password, password2)
        };

        match self.session.register(&registration).await {
            Ok(()) => {
                println!("Registered. You can now log in.");
                Ok(())
            }
            Err(e) => Err(anyhow::anyhow!("Registration failed: {}", e)),
        }
    }

    /// Fetch the signed-in profile, renewing the access token once on 401
    pub async fn whoami(&self) -> Result<()> {
        let Some(sent) = self.api.default_credential() else {
            return Err(anyhow::anyhow!("Not logged in"));
        };

        let profile = match self.api.current_user().await {
            Ok(profile) => profile,
            Err(e) if is_unauthorized(&e) => {
                info!("Access token rejected, attempting refresh");
                if !self.session.handle_unauthorized(&sent).await {
                    return Err(anyhow::anyhow!("Session expired. Please log in again."));
                }
                self.api.current_user().await?
            }
            Err(e) => return Err(e),
        };

        print_profile(&profile);
        Ok(())
    }

    pub fn is_authenticated(&self) -> bool {
        self.snapshot().phase == Phase::Authenticated
    }
}

fn is_unauthorized(err: &anyhow::Error) -> bool {
    err.downcast_ref::<ApiError>()
        .map(ApiError::is_unauthorized)
        .unwrap_or(false)
}

fn print_profile(profile: &UserProfile) {
    let name = [profile.first_name.as_deref(), profile.last_name.as_deref()]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" ");
    println!("Id: {}", profile.id);
    println!("Name: {}", if name.is_empty() { "-" } else { &name });
    println!("Email: {}", profile.email);
    println!("Doctor: {}", if profile.is_doctor { "yes" } else { "no" });
}

fn prompt(label: &str) -> Result<String> {
    use std::io::Write;

    eprint!("{}", label);
    std::io::stderr().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}
