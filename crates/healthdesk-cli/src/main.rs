//! healthdesk - terminal front end for the health-information service.
//!
//! Signs a doctor in against the API, keeps the session across runs and
//! renews it silently when the access token has expired.

mod app;

use std::io;
use std::process::ExitCode;

use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use app::App;
use healthdesk_core::Config;

const USAGE: &str = "\
Usage: healthdesk <command>

Commands:
  status            Show the current session
  login [email]     Sign in (password from HEALTHDESK_PASSWORD or prompt)
  logout            Sign out and forget stored tokens
  refresh           Renew the access token now
  register          Create a new account
  whoami            Fetch your profile from the API";

/// Log file name inside the configured log directory
const LOG_FILE: &str = "healthdesk.log";

enum Command {
    Status,
    Login(Option<String>),
    Logout,
    Refresh,
    Register,
    Whoami,
}

impl Command {
    fn parse(args: &[String]) -> Option<Self> {
        match args.first().map(String::as_str) {
            None | Some("status") => Some(Command::Status),
            Some("login") => Some(Command::Login(args.get(1).cloned())),
            Some("logout") => Some(Command::Logout),
            Some("refresh") => Some(Command::Refresh),
            Some("register") => Some(Command::Register),
            Some("whoami") => Some(Command::Whoami),
            Some(_) => None,
        }
    }
}

/// Initialize the tracing subscriber for logging.
/// The returned guard must stay alive for file logs to be flushed.
fn init_tracing(log_dir: Option<&std::path::Path>) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::never(dir, LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_ansi(false).with_writer(writer)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "-h" || a == "--help") {
        println!("{}", USAGE);
        return ExitCode::SUCCESS;
    }
    let Some(command) = Command::parse(&args) else {
        eprintln!("{}", USAGE);
        return ExitCode::from(2);
    };

    let (config, load_error) = match Config::load() {
        Ok(config) => (config, None),
        Err(e) => (Config::default(), Some(e)),
    };
    let _log_guard = init_tracing(config.log_dir.as_deref());
    info!("healthdesk starting");
    if let Some(e) = load_error {
        warn!(error = %e, "Failed to load config, using defaults");
    }

    let result = match App::new(config).await {
        Ok(mut app) => run(&mut app, command).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => {
            info!("healthdesk shutting down");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(app: &mut App, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Status => {
            app.status();
            Ok(())
        }
        Command::Login(email) => app.login(email).await,
        Command::Logout => {
            app.logout().await;
            Ok(())
        }
        Command::Refresh => app.refresh().await,
        Command::Register => app.register().await,
        Command::Whoami if !app.is_authenticated() => {
            Err(anyhow::anyhow!("Not logged in. Run `healthdesk login` first."))
        }
        Command::Whoami => app.whoami().await,
    }
}
