//! OAuth 2.0 identity broker for calbridge.
//!
//! The broker plays two roles at once:
//!
//! - an **authorization server** toward third-party clients: dynamic client
//!   registration (RFC 7591), authorization codes with mandatory S256 PKCE
//!   (RFC 7636), and rotating access/refresh tokens;
//! - an **OAuth client** toward a single upstream identity provider
//!   (Google), whose per-subject tokens it stores and refreshes.
//!
//! All state lives in the [`calbridge_store`] database; every component here
//! is cheap to clone and stateless between calls.
//!
//! # Architecture
//!
//! ```text
//! Broker
//! ├── ClientRegistry    (dynamic client registration)
//! ├── SessionManager    (authorize → callback → code redemption)
//! ├── TokenIssuer       (issue / validate / rotate / sweep)
//! ├── BearerResolver    (access tokens, then legacy API keys)
//! └── UpstreamProvider  (GoogleProvider, or a fake in tests)
//! ```
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use calbridge_broker::{Broker, BrokerConfig, GoogleConfig, GoogleCredentials, GoogleProvider};
//! use calbridge_store::Database;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::open_and_migrate("data/calbridge.db").await?;
//! let credentials = GoogleCredentials::from_file("credentials.json")?;
//! let upstream = GoogleProvider::new(GoogleConfig::new(
//!     credentials,
//!     "http://localhost:8080/auth/callback",
//! ))?;
//! let broker = Broker::new(db, Arc::new(upstream), BrokerConfig::default());
//!
//! let client = broker
//!     .register("My Agent", vec!["http://127.0.0.1:9000/callback".into()])
//!     .await?;
//! println!("client_id: {}", client.client_id);
//! # Ok(())
//! # }
//! ```

pub mod bearer;
pub mod broker;
pub mod callback_state;
pub mod config;
pub mod error;
pub mod pkce;
pub mod registry;
pub mod session;
pub mod tokens;
pub mod upstream;

pub use bearer::{BearerResolver, BearerSource, ResolvedBearer};
pub use broker::{AuthorizeParams, Broker, CallbackOutcome, CallbackParams, TokenParams};
pub use callback_state::CallbackFlow;
pub use config::BrokerConfig;
pub use error::{BrokerError, ErrorKind, Result};
pub use registry::ClientRegistry;
pub use session::{BeginAuthorization, RedeemCode, SessionManager};
pub use tokens::{SweepReport, TokenGrant, TokenIssuer};
pub use upstream::{GoogleConfig, GoogleCredentials, GoogleProvider, UpstreamProvider};
