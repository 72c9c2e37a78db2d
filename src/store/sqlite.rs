use std::str::FromStr;
use std::time::Duration;

use base64::Engine;
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use crate::errors::StoreError;

/// Links older than this are removed by the sweep job.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 3600);

/// One initial attempt plus three retries on slug collision.
pub const MAX_SLUG_ATTEMPTS: u32 = 4;

/// Random bytes drawn per slug, before base64url encoding.
const SLUG_ENTROPY_BYTES: usize = 128;

/// A published link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlugRecord {
    pub slug: String,
    pub resource_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct LinkRow {
    slug: String,
    resource_id: String,
    created_at: i64,
}

impl From<LinkRow> for SlugRecord {
    fn from(row: LinkRow) -> Self {
        Self {
            slug: row.slug,
            resource_id: row.resource_id,
            created_at: DateTime::from_timestamp(row.created_at, 0).unwrap_or_default(),
        }
    }
}

/// 128 bytes from the OS CSPRNG, base64url without padding.
pub fn generate_slug() -> String {
    let mut bytes = [0u8; SLUG_ENTROPY_BYTES];
    OsRng.fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Durable slug → resource mapping plus the key/value side-table.
///
/// Cloning is cheap; clones share the same pool.
#[derive(Clone)]
pub struct SlugStore {
    pool: SqlitePool,
    mint: fn() -> String,
}

impl SlugStore {
    /// Opens (creating if needed) the database and ensures the schema exists.
    ///
    /// `sqlite::memory:` URLs get a single long-lived connection so every
    /// query sees the same in-memory database.
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = if database_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(8)
                .connect_with(options)
                .await?
        };

        let store = Self::from_pool(pool);
        store.init_schema().await?;
        Ok(store)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            mint: generate_slug,
        }
    }

    /// Replaces the slug generator. Collision handling is exercised this way.
    pub fn with_slug_generator(mut self, mint: fn() -> String) -> Self {
        self.mint = mint;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn init_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS links (
                slug TEXT NOT NULL UNIQUE,
                resource_id TEXT NOT NULL UNIQUE,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS key_val (
                key TEXT NOT NULL PRIMARY KEY,
                val TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    // -- Link Operations --

    /// Returns the slug already published for `resource_id`, minting one if needed.
    pub async fn get_or_create_slug(&self, resource_id: &str) -> Result<String, StoreError> {
        if let Some(slug) = self.slug_for_resource(resource_id).await? {
            return Ok(slug);
        }

        for attempt in 1..=MAX_SLUG_ATTEMPTS {
            let candidate = (self.mint)();
            let inserted = sqlx::query_scalar::<_, String>(
                r#"INSERT INTO links (slug, resource_id, created_at)
                   VALUES (?, ?, ?)
                   ON CONFLICT(resource_id) DO NOTHING
                   RETURNING slug"#,
            )
            .bind(&candidate)
            .bind(resource_id)
            .bind(Utc::now().timestamp())
            .fetch_optional(&self.pool)
            .await;

            match inserted {
                Ok(Some(slug)) => {
                    tracing::info!(attempt, "published new link");
                    return Ok(slug);
                }
                // Another request published the same resource first.
                Ok(None) => {
                    if let Some(slug) = self.slug_for_resource(resource_id).await? {
                        return Ok(slug);
                    }
                }
                Err(sqlx::Error::Database(ref e)) if e.is_unique_violation() => {
                    if attempt < MAX_SLUG_ATTEMPTS {
                        tracing::warn!(attempt, "slug collision, retrying");
                    } else {
                        tracing::error!(attempt, "slug collision, giving up");
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(StoreError::SlugGenerationExhausted {
            attempts: MAX_SLUG_ATTEMPTS,
        })
    }

    /// `Ok(None)` means the slug is unknown, not that the store failed.
    pub async fn resolve_slug(&self, slug: &str) -> Result<Option<String>, StoreError> {
        let resource_id =
            sqlx::query_scalar::<_, String>("SELECT resource_id FROM links WHERE slug = ?")
                .bind(slug)
                .fetch_optional(&self.pool)
                .await?;
        Ok(resource_id)
    }

    pub async fn get_record(&self, slug: &str) -> Result<Option<SlugRecord>, StoreError> {
        let row = sqlx::query_as::<_, LinkRow>(
            "SELECT slug, resource_id, created_at FROM links WHERE slug = ?",
        )
        .bind(slug)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(SlugRecord::from))
    }

    async fn slug_for_resource(&self, resource_id: &str) -> Result<Option<String>, StoreError> {
        let slug = sqlx::query_scalar::<_, String>("SELECT slug FROM links WHERE resource_id = ?")
            .bind(resource_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(slug)
    }

    /// Deletes a link immediately. Returns false when the slug was unknown.
    pub async fn revoke_slug(&self, slug: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM links WHERE slug = ?")
            .bind(slug)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Deletes links older than `retention`. Returns the number removed.
    pub async fn purge_expired(&self, retention: Duration) -> Result<u64, StoreError> {
        let horizon = i64::try_from(retention.as_secs()).unwrap_or(i64::MAX);
        let cutoff = Utc::now().timestamp().saturating_sub(horizon);
        self.purge_created_before(cutoff).await
    }

    async fn purge_created_before(&self, cutoff: i64) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM links WHERE created_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // -- Key/Value Operations --

    pub async fn kv_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let val = sqlx::query_scalar::<_, String>("SELECT val FROM key_val WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(val)
    }

    pub async fn kv_set(&self, key: &str, val: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO key_val (key, val) VALUES (?, ?)
               ON CONFLICT(key) DO UPDATE SET val = excluded.val"#,
        )
        .bind(key)
        .bind(val)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
