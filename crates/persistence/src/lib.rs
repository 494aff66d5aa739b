#![deny(warnings)]

//! Persistence layer: versioned city records with optimistic transactions.
//!
//! Every record carries a version. A commit names the version it read and is
//! rejected with [`StoreError::Conflict`] when another writer committed in
//! between, so read-modify-write cycles on one city serialize without holding
//! a lock across the caller's work.

use realm_core::{City, CityId};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::HashMap;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

/// Embedded schema migrations.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Returns the default SQLite URL used for local saves.
pub fn default_sqlite_url() -> &'static str {
    realm_core::DEFAULT_DATABASE_URL
}

/// Errors surfaced by city stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No record under this id.
    #[error("city not found: {0}")]
    NotFound(CityId),
    /// Insert of an id that is already taken.
    #[error("city already exists: {0}")]
    AlreadyExists(CityId),
    /// The record moved on since it was read; the whole operation may be retried.
    #[error("write conflict on city {id}: expected version {expected}, found {found}")]
    Conflict {
        id: CityId,
        expected: u64,
        found: u64,
    },
    /// Record body could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// A value together with the record version it was read at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Versioned<T> {
    pub version: u64,
    pub value: T,
}

/// Keyed city records with compare-and-swap commits.
pub trait CityStore {
    /// Fresh copy of a record, `None` if absent.
    fn load(
        &self,
        id: &CityId,
    ) -> impl Future<Output = Result<Option<Versioned<City>>, StoreError>> + Send;

    /// Replace a record if it is still at `expected`; returns the new version.
    fn commit(
        &self,
        id: &CityId,
        expected: u64,
        city: &City,
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;

    /// Create a record at version 1.
    fn insert(&self, city: &City) -> impl Future<Output = Result<u64, StoreError>> + Send;

    /// All record ids in ascending order.
    fn list(&self) -> impl Future<Output = Result<Vec<CityId>, StoreError>> + Send;
}

/// Run `apply` against a freshly loaded copy of a city and commit the result
/// under the version that was read.
///
/// Nothing is written when `apply` fails or the commit conflicts. There is no
/// retry here; a [`StoreError::Conflict`] reaches the caller unchanged.
pub async fn with_transaction<S, T, E, F>(store: &S, id: &CityId, apply: F) -> Result<T, E>
where
    S: CityStore,
    F: FnOnce(&mut City) -> Result<T, E>,
    E: From<StoreError>,
{
    let Versioned {
        version,
        value: mut city,
    } = store
        .load(id)
        .await?
        .ok_or_else(|| StoreError::NotFound(id.clone()))?;
    let out = apply(&mut city)?;
    let committed = store.commit(id, version, &city).await?;
    tracing::trace!(city = %id, from = version, to = committed, "transaction committed");
    Ok(out)
}

#[derive(Debug, Clone)]
struct Record {
    version: u64,
    bytes: Vec<u8>,
}

fn encode(city: &City) -> Result<Vec<u8>, StoreError> {
    bincode::serialize(city).map_err(|e| StoreError::Codec(e.to_string()))
}

fn decode(bytes: &[u8]) -> Result<City, StoreError> {
    bincode::deserialize(bytes).map_err(|e| StoreError::Codec(e.to_string()))
}

/// In-process store. Records are kept encoded so every load hands out an
/// independent copy.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<CityId, Record>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CityStore for MemoryStore {
    async fn load(&self, id: &CityId) -> Result<Option<Versioned<City>>, StoreError> {
        let records = self.records.lock().await;
        match records.get(id) {
            Some(rec) => Ok(Some(Versioned {
                version: rec.version,
                value: decode(&rec.bytes)?,
            })),
            None => Ok(None),
        }
    }

    async fn commit(&self, id: &CityId, expected: u64, city: &City) -> Result<u64, StoreError> {
        let bytes = encode(city)?;
        let mut records = self.records.lock().await;
        let rec = records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        if rec.version != expected {
            return Err(StoreError::Conflict {
                id: id.clone(),
                expected,
                found: rec.version,
            });
        }
        rec.version += 1;
        rec.bytes = bytes;
        Ok(rec.version)
    }

    async fn insert(&self, city: &City) -> Result<u64, StoreError> {
        let bytes = encode(city)?;
        let mut records = self.records.lock().await;
        if records.contains_key(&city.id) {
            return Err(StoreError::AlreadyExists(city.id.clone()));
        }
        records.insert(city.id.clone(), Record { version: 1, bytes });
        Ok(1)
    }

    async fn list(&self) -> Result<Vec<CityId>, StoreError> {
        let records = self.records.lock().await;
        let mut ids: Vec<CityId> = records.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

/// Open (creating if needed) a SQLite database and run migrations.
pub async fn init_db(url: &str) -> Result<SqlitePool, StoreError> {
    let opts = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(opts)
        .await?;
    MIGRATOR.run(&pool).await?;
    tracing::info!(url, "database ready");
    Ok(pool)
}

/// Private in-memory database; a single pinned connection keeps it alive.
pub async fn init_memory_db() -> Result<SqlitePool, StoreError> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None::<Duration>)
        .max_lifetime(None::<Duration>)
        .connect("sqlite::memory:")
        .await?;
    MIGRATOR.run(&pool).await?;
    Ok(pool)
}

/// SQLite-backed store. Bodies are stored as JSON next to the version.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn to_db_version(version: u64) -> Result<i64, StoreError> {
    i64::try_from(version).map_err(|_| StoreError::Codec(format!("version {version} out of range")))
}

fn from_db_version(version: i64) -> Result<u64, StoreError> {
    u64::try_from(version).map_err(|_| StoreError::Codec(format!("version {version} out of range")))
}

impl CityStore for SqliteStore {
    async fn load(&self, id: &CityId) -> Result<Option<Versioned<City>>, StoreError> {
        let row = sqlx::query("SELECT version, body FROM cities WHERE id = ?")
            .bind(id.0.as_str())
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let version: i64 = row.try_get("version")?;
        let body: String = row.try_get("body")?;
        let city: City =
            serde_json::from_str(&body).map_err(|e| StoreError::Codec(e.to_string()))?;
        Ok(Some(Versioned {
            version: from_db_version(version)?,
            value: city,
        }))
    }

    async fn commit(&self, id: &CityId, expected: u64, city: &City) -> Result<u64, StoreError> {
        let body = serde_json::to_string(city).map_err(|e| StoreError::Codec(e.to_string()))?;
        let done = sqlx::query(
            "UPDATE cities SET body = ?, version = version + 1 WHERE id = ? AND version = ?",
        )
        .bind(body)
        .bind(id.0.as_str())
        .bind(to_db_version(expected)?)
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 1 {
            return Ok(expected + 1);
        }

        // Nothing updated: either the row is gone or its version moved on.
        let current = sqlx::query("SELECT version FROM cities WHERE id = ?")
            .bind(id.0.as_str())
            .fetch_optional(&self.pool)
            .await?;
        match current {
            None => Err(StoreError::NotFound(id.clone())),
            Some(row) => {
                let found: i64 = row.try_get("version")?;
                Err(StoreError::Conflict {
                    id: id.clone(),
                    expected,
                    found: from_db_version(found)?,
                })
            }
        }
    }

    async fn insert(&self, city: &City) -> Result<u64, StoreError> {
        let body = serde_json::to_string(city).map_err(|e| StoreError::Codec(e.to_string()))?;
        let done = sqlx::query("INSERT OR IGNORE INTO cities (id, version, body) VALUES (?, 1, ?)")
            .bind(city.id.0.as_str())
            .bind(body)
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists(city.id.clone()));
        }
        Ok(1)
    }

    async fn list(&self) -> Result<Vec<CityId>, StoreError> {
        let rows = sqlx::query("SELECT id FROM cities ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> Result<CityId, StoreError> { Ok(CityId(row.try_get("id")?)) })
            .collect()
    }
}
