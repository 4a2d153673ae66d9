//! Versioned schema for the broker tables.
//!
//! Applied versions are recorded in `_migrations`, so opening an existing
//! database only runs what is new. A database written by the older
//! single-binary server has a `users(email, api_key, token_json)` table; it
//! is set aside before migrating and folded into the new `users` table by
//! [`import_legacy_users`].

use rusqlite::{Connection, OptionalExtension};
use serde::Deserialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::secret::{API_KEY_PREFIX, hash_secret};
use crate::subject_store::UpstreamToken;

const LEGACY_USERS: &str = "legacy_users";

struct Migration {
    version: u32,
    description: &'static str,
    /// One or more `;`-separated statements.
    sql: &'static str,
}

/// Append only; versions are strictly increasing.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "authorization server: registered clients, authorization sessions, token pairs",
        sql: r#"
            CREATE TABLE oauth_clients (
                id                 TEXT PRIMARY KEY,
                client_id          TEXT NOT NULL UNIQUE,
                client_secret_hash TEXT,
                client_name        TEXT NOT NULL DEFAULT '',
                redirect_uris      TEXT NOT NULL,
                created_at         INTEGER NOT NULL
            );

            CREATE TABLE auth_sessions (
                id                    TEXT PRIMARY KEY,
                state                 TEXT NOT NULL UNIQUE,
                client_id             TEXT NOT NULL REFERENCES oauth_clients(client_id),
                redirect_uri          TEXT NOT NULL,
                code_challenge        TEXT NOT NULL,
                code_challenge_method TEXT NOT NULL DEFAULT 'S256' CHECK(code_challenge_method IN ('S256')),
                caller_state          TEXT,
                code_hash             TEXT UNIQUE,
                subject               TEXT,
                expires_at            INTEGER NOT NULL,
                used                  BOOLEAN NOT NULL DEFAULT 0,
                created_at            INTEGER NOT NULL
            );
            CREATE INDEX idx_auth_sessions_expires ON auth_sessions(expires_at);

            CREATE TABLE token_pairs (
                id           TEXT PRIMARY KEY,
                client_id    TEXT NOT NULL,
                subject      TEXT NOT NULL,
                access_hash  TEXT NOT NULL UNIQUE,
                refresh_hash TEXT NOT NULL UNIQUE,
                expires_at   INTEGER NOT NULL,
                created_at   INTEGER NOT NULL
            );
            CREATE INDEX idx_token_pairs_expires ON token_pairs(expires_at);
        "#,
    },
    Migration {
        version: 2,
        description: "subjects: per-user upstream credentials and legacy API key hashes",
        sql: r#"
            CREATE TABLE users (
                id             TEXT PRIMARY KEY,
                subject        TEXT NOT NULL UNIQUE,
                api_key_hash   TEXT NOT NULL UNIQUE,
                upstream_token TEXT NOT NULL,
                created_at     INTEGER NOT NULL,
                updated_at     INTEGER NOT NULL
            );
        "#,
    },
    Migration {
        version: 3,
        description: "login states: pending correlation states of the API-key login flow",
        sql: r#"
            CREATE TABLE login_states (
                state      TEXT PRIMARY KEY,
                expires_at INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            );
        "#,
    },
];

/// Schema version after every migration in [`MIGRATIONS`] has run.
pub const LATEST_VERSION: u32 = 3;

/// Apply every migration newer than the recorded version, each in its own
/// transaction. Synchronous; call it from the blocking pool.
pub fn run_all(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version     INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at  INTEGER NOT NULL
        );",
    )
    .map_err(|e| failed(0, "create _migrations", e))?;

    let current = current_version(conn)?;
    set_aside_legacy_users(conn)?;
    let mut applied = 0;
    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        apply(conn, migration)?;
        applied += 1;
    }

    if applied == 0 {
        debug!(version = current, "schema up to date");
    } else {
        info!(from = current, to = LATEST_VERSION, applied, "schema migrated");
    }
    Ok(())
}

/// Rename an old-layout `users` table out of the way so migration 2 can
/// create the current one. The old layout is recognised by its `api_key`
/// column.
fn set_aside_legacy_users(conn: &Connection) -> StoreResult<()> {
    let old_layout: i64 = conn.query_row(
        "SELECT count(*) FROM pragma_table_info('users') WHERE name = 'api_key'",
        [],
        |row| row.get(0),
    )?;
    if old_layout > 0 {
        conn.execute_batch(&format!("ALTER TABLE users RENAME TO {LEGACY_USERS}"))?;
        info!("old users table set aside for import");
    }
    Ok(())
}

/// Token JSON as the older server wrote it.
#[derive(Debug, Deserialize)]
struct LegacyToken {
    access_token: String,
    #[serde(default)]
    token_type: String,
    #[serde(default)]
    refresh_token: String,
    /// RFC 3339; the zero time means no expiry.
    #[serde(default)]
    expiry: Option<String>,
}

impl LegacyToken {
    fn into_upstream(self) -> UpstreamToken {
        let expires_at = self
            .expiry
            .as_deref()
            .and_then(|raw| chrono::DateTime::parse_from_rfc3339(raw).ok())
            .map(|at| at.timestamp())
            .filter(|ts| *ts > 0);
        UpstreamToken {
            access_token: self.access_token,
            refresh_token: Some(self.refresh_token).filter(|t| !t.is_empty()),
            token_type: if self.token_type.is_empty() {
                "Bearer".to_string()
            } else {
                self.token_type
            },
            expires_at,
            scopes: Vec::new(),
        }
    }
}

/// Move every row of the set-aside legacy table into `users`, then drop it.
///
/// Keys still stored in plaintext (`gcal_…`) are hashed on the way; values
/// without the prefix are already digests and are copied as is. Rows whose
/// token cannot be read are skipped, and their subjects sign in again. Runs
/// in one transaction and returns the number of imported subjects.
pub fn import_legacy_users(conn: &Connection) -> StoreResult<usize> {
    let present = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [LEGACY_USERS],
            |_| Ok(()),
        )
        .optional()?
        .is_some();
    if !present {
        return Ok(0);
    }

    let tx = conn.unchecked_transaction()?;
    let rows: Vec<(String, String, String)> = {
        let mut stmt = tx.prepare(&format!(
            "SELECT email, api_key, token_json FROM {LEGACY_USERS}"
        ))?;
        stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<Result<Vec<_>, _>>()?
    };

    let now = chrono::Utc::now().timestamp();
    let mut imported = 0;
    for (subject, api_key, token_json) in rows {
        let token = match serde_json::from_str::<LegacyToken>(&token_json) {
            Ok(token) => token.into_upstream(),
            Err(e) => {
                warn!(%subject, error = %e, "skipping legacy user with unreadable token");
                continue;
            }
        };
        let api_key_hash = if api_key.starts_with(API_KEY_PREFIX) {
            hash_secret(&api_key)
        } else {
            api_key
        };
        imported += tx.execute(
            "INSERT INTO users (id, subject, api_key_hash, upstream_token, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?5) ON CONFLICT(subject) DO NOTHING",
            rusqlite::params![
                Uuid::now_v7().to_string(),
                subject,
                api_key_hash,
                serde_json::to_string(&token)?,
                now
            ],
        )?;
    }
    tx.execute_batch(&format!("DROP TABLE {LEGACY_USERS}"))?;
    tx.commit()?;
    Ok(imported)
}

/// Latest applied migration version, or 0 on a fresh database.
pub fn current_version(conn: &Connection) -> StoreResult<u32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _migrations",
        [],
        |row| row.get(0),
    )
    .map_err(|e| failed(0, "read current version", e))
}

fn apply(conn: &Connection, migration: &Migration) -> StoreResult<()> {
    let version = migration.version;
    debug!(version, description = migration.description, "applying migration");

    // Dropping `tx` without commit rolls the migration back.
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| failed(version, "begin", e))?;
    tx.execute_batch(migration.sql)
        .map_err(|e| failed(version, "execute", e))?;
    tx.execute(
        "INSERT INTO _migrations (version, description, applied_at) VALUES (?1, ?2, ?3)",
        rusqlite::params![version, migration.description, chrono::Utc::now().timestamp()],
    )
    .map_err(|e| failed(version, "record", e))?;
    tx.commit().map_err(|e| failed(version, "commit", e))
}

fn failed(version: u32, step: &str, err: rusqlite::Error) -> StoreError {
    warn!(version, step, error = %err, "migration step failed");
    StoreError::Migration {
        version,
        message: format!("{step}: {err}"),
    }
}

// ── tests ────────────────────────────────────────────────────────────
