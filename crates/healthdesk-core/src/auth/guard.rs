//! Navigation policy for protected views.

use serde::Serialize;

use super::{Phase, SessionSnapshot};

/// Where denied navigation is sent.
pub const LOGIN_ROUTE: &str = "/login";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum Verdict {
    Allow,
    DenyRedirectToLogin,
    PendingShowLoadingIndicator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteAccess {
    Public,
    Protected,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RouteGuard;

impl RouteGuard {
    /// Verdict for a protected view.
    ///
    /// Until the startup check has finished the answer is always "pending", so
    /// a returning user never sees a login redirect flash by. A view attempted
    /// while a refresh is running is denied for now and should be re-evaluated
    /// when the next snapshot arrives.
    pub fn evaluate(phase: Phase, initialized: bool) -> Verdict {
        if !initialized || phase == Phase::Initializing {
            return Verdict::PendingShowLoadingIndicator;
        }
        match phase {
            Phase::Authenticated => Verdict::Allow,
            Phase::Unauthenticated | Phase::Refreshing => Verdict::DenyRedirectToLogin,
            Phase::Initializing => Verdict::PendingShowLoadingIndicator,
        }
    }

    pub fn check(snapshot: &SessionSnapshot, access: RouteAccess) -> Verdict {
        match access {
            RouteAccess::Public => Verdict::Allow,
            RouteAccess::Protected => Self::evaluate(snapshot.phase, snapshot.initialized),
        }
    }

    /// Redirect target for a verdict, if any.
    pub fn redirect_target(verdict: Verdict) -> Option<&'static str> {
        match verdict {
            Verdict::DenyRedirectToLogin => Some(LOGIN_ROUTE),
            _ => None,
        }
    }
}
