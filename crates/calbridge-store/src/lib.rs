//! # calbridge-store
//!
//! Credential store for calbridge.
//!
//! SQLite-backed persistence (WAL mode, one serialized writer) for every
//! piece of state the broker keeps between requests:
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  ClientStore        registered OAuth clients  │
//! │  AuthSessionStore   in-flight authorizations  │
//! │  TokenStore         access/refresh pair hashes│
//! │  SubjectStore       upstream tokens, API keys │
//! │  LoginStateStore    API-key login states      │
//! ├──────────────────────────────────────────────┤
//! │  Database (rusqlite WAL, spawn_blocking)      │
//! │  Migrations (versioned, transactional)        │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Secrets never reach the database in the clear: callers pass hashes, and
//! the subject store hashes API keys itself.
//!
//! ## Quick start
//!
//! ```ignore
//! use calbridge_store::{Database, ClientStore};
//!
//! let db = Database::open_and_migrate("data/calbridge.db").await?;
//! let clients = ClientStore::new(db.clone());
//! let client = clients.get("abc").await?;
//! ```

pub mod auth_session;
pub mod client_store;
pub mod db;
pub mod error;
pub mod login_state;
pub mod migration;
pub mod secret;
pub mod subject_store;
pub mod token_store;

// ── re-exports ───────────────────────────────────────────────────────

pub use auth_session::{AuthSession, AuthSessionStore, NewAuthSession, Redemption, SessionPhase};
pub use client_store::{Client, ClientStore, NewClient};
pub use db::Database;
pub use error::{StoreError, StoreResult};
pub use login_state::LoginStateStore;
pub use subject_store::{SubjectRecord, SubjectStore, SubjectUpdate, UpstreamToken};
pub use token_store::{NewTokenPair, Replacement, Rotation, TokenPair, TokenStore};
