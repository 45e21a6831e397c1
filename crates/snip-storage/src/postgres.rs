use async_trait::async_trait;
use snip_core::{
    Backend, BackendKind, DeletionBatch, LinkId, OwnedLink, OwnershipStore, Result, ShortCode,
    Stats, StorageError, UserId,
};
use snip_generator::CodeGenerator;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use typed_builder::TypedBuilder;

/// Upper bound for a connectivity check.
pub const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Schema statements, applied in order by [`PostgresBackend::ensure_schema`].
const SCHEMA: [&str; 5] = [
    include_str!("../ddl/postgres/links.sql"),
    include_str!("../ddl/postgres/links_inner_link.sql"),
    include_str!("../ddl/postgres/users.sql"),
    include_str!("../ddl/postgres/users_links.sql"),
    include_str!("../ddl/postgres/users_links_unique.sql"),
];

#[derive(Debug, Clone, Copy, TypedBuilder)]
pub struct PostgresSettings {
    #[builder(default = 5)]
    pub max_connections: u32,
    /// Bounds both the initial connect and every pool checkout.
    #[builder(default = Duration::from_secs(5))]
    pub connect_timeout: Duration,
}

impl Default for PostgresSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// PostgreSQL implementation of the backend contract.
///
/// Links live in `links`, users in `users`, and ownership edges with their
/// soft-delete flag in `users_links`. `links.InnerLink` holds the rendered
/// short URL (`<base_url>/<code>`), `links.OutterLink` the original URL.
///
/// Lookups are keyed on the rendered short URL, so the base URL must stay
/// the same for the lifetime of a database. Links stored under another base
/// URL are not found.
#[derive(Debug, Clone)]
pub struct PostgresBackend {
    pool: PgPool,
    base_url: String,
    generator: Arc<CodeGenerator>,
}

impl PostgresBackend {
    /// Creates a backend from an existing PostgreSQL connection pool.
    pub fn new(pool: PgPool, base_url: impl Into<String>, generator: Arc<CodeGenerator>) -> Self {
        Self {
            pool,
            base_url: base_url.into(),
            generator,
        }
    }

    /// Creates a backend by opening a new PostgreSQL connection pool.
    pub async fn connect(
        database_url: &str,
        base_url: impl Into<String>,
        generator: Arc<CodeGenerator>,
        settings: PostgresSettings,
    ) -> Result<Self> {
        let connecting = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .acquire_timeout(settings.connect_timeout)
            .connect(database_url);

        let pool = tokio::time::timeout(settings.connect_timeout, connecting)
            .await
            .map_err(|_| StorageError::Timeout("connecting to postgres".to_string()))?
            .map_err(map_sqlx_error)?;

        Ok(Self::new(pool, base_url, generator))
    }

    /// Creates the tables and indexes this backend needs if they are missing.
    pub async fn ensure_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
        }
        info!("postgres schema is in place");
        Ok(())
    }

    /// Returns a reference to the underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn inner_link(&self, code: &ShortCode) -> String {
        code.to_url(&self.base_url)
    }
}

fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(|e| e.is_foreign_key_violation())
}

fn map_sqlx_error(err: sqlx::Error) -> StorageError {
    let message = err.to_string();

    match err {
        sqlx::Error::PoolTimedOut => StorageError::Timeout(message),
        sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_) => StorageError::Unavailable(message),
        sqlx::Error::ColumnIndexOutOfBounds { .. }
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::TypeNotFound { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::RowNotFound => StorageError::InvalidData(message),
        _ => StorageError::Query(message),
    }
}

fn code_from_inner_link(inner_link: &str) -> Result<ShortCode> {
    ShortCode::from_short_url(inner_link).map_err(|e| {
        StorageError::InvalidData(format!("stored short url '{inner_link}' is malformed: {e}"))
    })
}

fn link_from_row(row: &PgRow) -> Result<(LinkId, ShortCode)> {
    let id: i32 = row.try_get("link_id").map_err(map_sqlx_error)?;
    let inner_link: String = row.try_get("inner_link").map_err(map_sqlx_error)?;
    Ok((LinkId(id), code_from_inner_link(&inner_link)?))
}

async fn inner_link_exists(pool: &PgPool, inner_link: &str) -> Result<bool> {
    let exists = sqlx::query(
        r#"
        SELECT 1
        FROM links
        WHERE InnerLink = $1
        LIMIT 1
        "#,
    )
    .bind(inner_link)
    .fetch_optional(pool)
    .await
    .map_err(map_sqlx_error)?
    .is_some();

    Ok(exists)
}

#[async_trait]
impl Backend for PostgresBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Postgres
    }

    async fn create(&self, original_url: &str, user: UserId) -> Result<ShortCode> {
        let pool = &self.pool;
        let candidate = self
            .generator
            .new_code_async(|code| {
                let inner_link = self.inner_link(&code);
                async move { inner_link_exists(pool, &inner_link).await }
            })
            .await?;

        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO links (InnerLink, OutterLink)
            VALUES ($1, $2)
            ON CONFLICT (OutterLink) DO NOTHING
            RETURNING Id AS link_id, InnerLink AS inner_link
            "#,
        )
        .bind(self.inner_link(&candidate))
        .bind(original_url)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        let row = match inserted {
            Some(row) => row,
            None => sqlx::query(
                r#"
                SELECT Id AS link_id, InnerLink AS inner_link
                FROM links
                WHERE OutterLink = $1
                "#,
            )
            .bind(original_url)
            .fetch_one(&mut *tx)
            .await
            .map_err(map_sqlx_error)?,
        };
        let (link, code) = link_from_row(&row)?;

        let owned = sqlx::query(
            r#"
            INSERT INTO users_links (Id, LinkId, is_deleted)
            VALUES ($1, $2, FALSE)
            ON CONFLICT (Id, LinkId) DO NOTHING
            "#,
        )
        .bind(user.get())
        .bind(link.get())
        .execute(&mut *tx)
        .await;

        let added = match owned {
            Ok(result) => result.rows_affected() > 0,
            Err(err) if is_foreign_key_violation(&err) => {
                return Err(StorageError::NotFound(format!("user {user}")));
            }
            Err(err) => return Err(map_sqlx_error(err)),
        };

        tx.commit().await.map_err(map_sqlx_error)?;

        if !added {
            return Err(StorageError::AlreadyExists(code));
        }
        debug!(user = %user, link = %link, code = %code, "link added to user");
        Ok(code)
    }

    async fn resolve(&self, code: &ShortCode, user: Option<UserId>) -> Result<String> {
        let inner_link = self.inner_link(code);

        let Some(user) = user else {
            let row = sqlx::query(
                r#"
                SELECT OutterLink AS original_url
                FROM links
                WHERE InnerLink = $1
                LIMIT 1
                "#,
            )
            .bind(&inner_link)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?
            .ok_or_else(|| StorageError::NotFound(code.to_string()))?;

            return row.try_get("original_url").map_err(map_sqlx_error);
        };

        let row = sqlx::query(
            r#"
            SELECT l.OutterLink AS original_url, ul.is_deleted AS is_deleted
            FROM links l
            LEFT JOIN users_links ul ON ul.LinkId = l.Id AND ul.Id = $2
            WHERE l.InnerLink = $1
            LIMIT 1
            "#,
        )
        .bind(&inner_link)
        .bind(user.get())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?
        .ok_or_else(|| StorageError::NotFound(code.to_string()))?;

        let deleted: Option<bool> = row.try_get("is_deleted").map_err(map_sqlx_error)?;
        if deleted == Some(true) {
            return Err(StorageError::Deleted(code.clone()));
        }

        row.try_get("original_url").map_err(map_sqlx_error)
    }

    async fn owned_links(&self, user: UserId) -> Result<Vec<OwnedLink>> {
        let rows = sqlx::query(
            r#"
            SELECT l.InnerLink AS inner_link, l.OutterLink AS original_url
            FROM users_links ul
            JOIN links l ON l.Id = ul.LinkId
            WHERE ul.Id = $1
              AND ul.is_deleted IS NOT TRUE
            ORDER BY l.Id
            "#,
        )
        .bind(user.get())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        if rows.is_empty() {
            return Err(StorageError::NotFound(format!("links of user {user}")));
        }

        rows.iter()
            .map(|row| -> Result<OwnedLink> {
                let inner_link: String = row.try_get("inner_link").map_err(map_sqlx_error)?;
                Ok(OwnedLink {
                    code: code_from_inner_link(&inner_link)?,
                    original_url: row.try_get("original_url").map_err(map_sqlx_error)?,
                })
            })
            .collect()
    }

    async fn next_user_id(&self) -> Result<UserId> {
        let row = sqlx::query(
            r#"
            INSERT INTO users (creation)
            VALUES (current_timestamp)
            RETURNING Id AS user_id
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        let id: i32 = row.try_get("user_id").map_err(map_sqlx_error)?;
        Ok(UserId(id))
    }

    async fn ping(&self) -> bool {
        let ping = sqlx::query("SELECT 1").execute(&self.pool);
        match tokio::time::timeout(PING_TIMEOUT, ping).await {
            Ok(Ok(_)) => true,
            Ok(Err(err)) => {
                debug!(error = %err, "postgres ping failed");
                false
            }
            Err(_) => {
                debug!("postgres ping timed out");
                false
            }
        }
    }

    async fn stats(&self) -> Result<Stats> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM users) AS users,
                (SELECT COUNT(*) FROM links) AS urls
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        let users: i64 = row.try_get("users").map_err(map_sqlx_error)?;
        let urls: i64 = row.try_get("urls").map_err(map_sqlx_error)?;
        Ok(Stats {
            users: users.max(0) as u64,
            urls: urls.max(0) as u64,
        })
    }
}

#[async_trait]
impl OwnershipStore for PostgresBackend {
    async fn resolve_owned_link_id(&self, user: UserId, code: &str) -> Result<Option<LinkId>> {
        if !user.is_valid() {
            return Ok(None);
        }
        let Ok(code) = ShortCode::new(code) else {
            return Ok(None);
        };

        let row = sqlx::query(
            r#"
            SELECT ul.LinkId AS link_id
            FROM users_links ul
            JOIN links l ON l.Id = ul.LinkId
            WHERE l.InnerLink = $1
              AND ul.Id = $2
            LIMIT 1
            "#,
        )
        .bind(self.inner_link(&code))
        .bind(user.get())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        row.map(|row| row.try_get::<i32, _>("link_id").map(LinkId))
            .transpose()
            .map_err(map_sqlx_error)
    }

    async fn begin_deletion(&self) -> Result<Box<dyn DeletionBatch>> {
        let tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        Ok(Box::new(PostgresDeletionBatch { tx }))
    }
}

/// A deletion batch backed by one database transaction.
///
/// Dropping it without committing rolls the transaction back.
struct PostgresDeletionBatch {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl DeletionBatch for PostgresDeletionBatch {
    async fn mark_deleted(&mut self, user: UserId, link: LinkId) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE users_links
            SET is_deleted = TRUE
            WHERE Id = $1
              AND LinkId = $2
            "#,
        )
        .bind(user.get())
        .bind(link.get())
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)?;

        debug!(user = %user, link = %link, "marked link deleted");
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let batch = *self;
        batch.tx.commit().await.map_err(map_sqlx_error)
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let batch = *self;
        batch.tx.rollback().await.map_err(map_sqlx_error)
    }
}
