//! Broker timing configuration.

use std::time::Duration;

/// Lifetimes and intervals used by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    /// How long an authorization session (and a login state) stays usable.
    pub session_ttl: Duration,
    /// Lifetime of a broker-issued access token.
    pub access_token_ttl: Duration,
    /// How long after access-token expiry a refresh token is still honoured
    /// and the pair kept in the store.
    pub refresh_grace: Duration,
    /// Period of the background sweep.
    pub sweep_interval: Duration,
    /// Upstream tokens this close to expiry are refreshed before use.
    pub upstream_refresh_margin: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            session_ttl: Duration::from_secs(10 * 60),
            access_token_ttl: Duration::from_secs(60 * 60),
            refresh_grace: Duration::from_secs(7 * 24 * 60 * 60),
            sweep_interval: Duration::from_secs(10 * 60),
            upstream_refresh_margin: Duration::from_secs(60),
        }
    }
}

/// Whole seconds of `d` as a unix-time delta.
pub(crate) fn secs(d: Duration) -> i64 {
    i64::try_from(d.as_secs()).unwrap_or(i64::MAX)
}
