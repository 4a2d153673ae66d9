//! Correlation states sent to the upstream provider.
//!
//! Both the broker authorization flow and the API-key login flow round-trip
//! through the same upstream callback. Each flow mints states in its own
//! namespace so the callback can tell them apart without probing both
//! tables, and a state from one flow is never accepted by the other.

use calbridge_store::secret::generate_token;

use crate::error::Result;

/// Prefix of authorization-session states.
pub const AUTHORIZATION_PREFIX: &str = "as.";
/// Prefix of login-flow states.
pub const LOGIN_PREFIX: &str = "ls.";

const STATE_BYTES: usize = 32;

/// Which flow a callback state belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackFlow {
    Authorization,
    Login,
}

impl CallbackFlow {
    /// Classify a state by its prefix. Unprefixed or empty states belong to
    /// no flow.
    pub fn of(state: &str) -> Option<Self> {
        let (flow, rest) = if let Some(rest) = state.strip_prefix(AUTHORIZATION_PREFIX) {
            (Self::Authorization, rest)
        } else if let Some(rest) = state.strip_prefix(LOGIN_PREFIX) {
            (Self::Login, rest)
        } else {
            return None;
        };
        (!rest.is_empty()).then_some(flow)
    }

    fn prefix(self) -> &'static str {
        match self {
            Self::Authorization => AUTHORIZATION_PREFIX,
            Self::Login => LOGIN_PREFIX,
        }
    }

    /// Mint a fresh, unguessable state in this flow's namespace.
    pub fn new_state(self) -> Result<String> {
        Ok(format!("{}{}", self.prefix(), generate_token(STATE_BYTES)?))
    }
}
