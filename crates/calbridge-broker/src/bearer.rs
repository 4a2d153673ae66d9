//! Maps an `Authorization: Bearer` credential to a subject.

use calbridge_store::SubjectStore;
use tracing::{debug, instrument};

use crate::error::{BrokerError, Result};
use crate::tokens::TokenIssuer;

/// Which kind of credential resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BearerSource {
    /// A broker-issued access token.
    AccessToken,
    /// A legacy per-subject API key.
    ApiKey,
}

/// A bearer credential that resolved to a subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedBearer {
    pub subject: String,
    pub source: BearerSource,
}

#[derive(Clone)]
pub struct BearerResolver {
    issuer: TokenIssuer,
    subjects: SubjectStore,
}

impl BearerResolver {
    pub fn new(issuer: TokenIssuer, subjects: SubjectStore) -> Self {
        Self { issuer, subjects }
    }

    /// Try broker-issued access tokens first, then legacy API keys.
    ///
    /// Every rejection is [`BrokerError::Unauthenticated`] whichever branch
    /// rejected it. Storage failures still propagate as such.
    #[instrument(skip_all)]
    pub async fn resolve(&self, bearer: &str) -> Result<ResolvedBearer> {
        if bearer.is_empty() {
            return Err(BrokerError::Unauthenticated);
        }

        match self.issuer.validate(bearer).await {
            Ok(subject) => {
                return Ok(ResolvedBearer {
                    subject,
                    source: BearerSource::AccessToken,
                });
            }
            Err(BrokerError::InvalidToken | BrokerError::ExpiredToken) => {}
            Err(other) => return Err(other),
        }

        match self.subjects.find_by_api_key(bearer).await? {
            Some(record) => {
                debug!("bearer resolved via legacy API key");
                Ok(ResolvedBearer {
                    subject: record.subject,
                    source: BearerSource::ApiKey,
                })
            }
            None => Err(BrokerError::Unauthenticated),
        }
    }
}
