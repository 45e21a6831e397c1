use crate::memory::InMemoryBackend;
use crate::pipeline::{DeletionPipeline, DeletionReport, DeletionSettings};
use crate::postgres::{PostgresBackend, PostgresSettings};
use crate::snapshot;
use snip_core::{
    Backend, BackendKind, OwnedLink, Result, ShortCode, Stats, StorageError, UserId,
};
use snip_generator::{CodeGenerator, CodeGeneratorSettings};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};
use typed_builder::TypedBuilder;

pub const DEFAULT_BASE_URL: &str = "http://localhost:8080";

#[derive(Debug, Clone, TypedBuilder)]
pub struct StorageSettings {
    /// PostgreSQL connection string. Without one the storage runs in memory.
    #[builder(default)]
    pub database_dsn: Option<String>,
    /// Prefix of rendered short URLs.
    #[builder(default = DEFAULT_BASE_URL.to_string(), setter(into))]
    pub base_url: String,
    #[builder(default)]
    pub postgres: PostgresSettings,
    #[builder(default)]
    pub generator: CodeGeneratorSettings,
    #[builder(default)]
    pub deletion: DeletionSettings,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Entry point of the storage engine.
///
/// The backend is chosen once, when the storage is opened, and every
/// operation is delegated to it. Clones share the same backend.
#[derive(Clone)]
pub struct Storage {
    backend: Arc<dyn Backend>,
    memory: Option<InMemoryBackend>,
    pipeline: Arc<DeletionPipeline<dyn Backend>>,
    base_url: String,
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage")
            .field("backend", &self.backend.kind())
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl Storage {
    /// Opens the storage described by `settings`.
    ///
    /// With a DSN configured this connects to PostgreSQL and creates the
    /// schema. If either step fails the storage falls back to memory for
    /// the rest of its lifetime.
    pub async fn open(settings: StorageSettings) -> Self {
        let Some(dsn) = settings.database_dsn.clone() else {
            info!("no database configured, storing links in memory");
            return Self::in_memory(settings);
        };

        let generator = Arc::new(CodeGenerator::new(settings.generator));
        match connect(&dsn, &settings, generator).await {
            Ok(backend) => {
                info!("storing links in postgres");
                Self::with_postgres(backend, settings)
            }
            Err(err) => {
                warn!(error = %err, "postgres is unavailable, falling back to memory");
                Self::in_memory(settings)
            }
        }
    }

    pub fn in_memory(settings: StorageSettings) -> Self {
        let memory = InMemoryBackend::new(Arc::new(CodeGenerator::new(settings.generator)));
        Self::assemble(Arc::new(memory.clone()), Some(memory), settings)
    }

    /// Wraps an already connected backend. The schema is expected to exist.
    pub fn with_postgres(backend: PostgresBackend, settings: StorageSettings) -> Self {
        Self::assemble(Arc::new(backend), None, settings)
    }

    fn assemble(
        backend: Arc<dyn Backend>,
        memory: Option<InMemoryBackend>,
        settings: StorageSettings,
    ) -> Self {
        let pipeline = DeletionPipeline::new(Arc::clone(&backend), settings.deletion);
        Self {
            backend,
            memory,
            pipeline: Arc::new(pipeline),
            base_url: settings.base_url,
        }
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Renders the public short URL for `code`.
    pub fn short_url(&self, code: &ShortCode) -> String {
        code.to_url(&self.base_url)
    }

    /// Shortens `original_url` for `user`.
    ///
    /// Shortening the same URL again yields the same code. If `user` already
    /// owns it the code comes back inside [`StorageError::AlreadyExists`].
    pub async fn create_short_url(&self, original_url: &str, user: UserId) -> Result<ShortCode> {
        self.backend.create(original_url, user).await
    }

    /// Shortens every URL in `originals`, returning one outcome per input in
    /// the same order. A failed item does not stop the rest.
    pub async fn create_short_urls<I, S>(&self, originals: I, user: UserId) -> Vec<Result<ShortCode>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut outcomes = Vec::new();
        for original in originals {
            outcomes.push(self.backend.create(original.as_ref(), user).await);
        }
        outcomes
    }

    /// Resolves `code` to its original URL, optionally as seen by `user`.
    ///
    /// A malformed code is reported as [`StorageError::NotFound`].
    pub async fn get_url(&self, code: &str, user: Option<UserId>) -> Result<String> {
        let code = ShortCode::new(code)
            .map_err(|_| StorageError::NotFound(format!("short code {code}")))?;
        self.backend.resolve(&code, user).await
    }

    pub async fn get_user_urls(&self, user: UserId) -> Result<Vec<OwnedLink>> {
        self.backend.owned_links(user).await
    }

    /// Soft-deletes the given codes for `user` as one unit.
    ///
    /// Codes the user does not own are skipped and listed in the report.
    pub async fn delete_user_urls(&self, user: UserId, codes: Vec<String>) -> Result<DeletionReport> {
        self.pipeline.run(user, codes).await
    }

    pub async fn get_new_user_id(&self) -> Result<UserId> {
        self.backend.next_user_id().await
    }

    /// Reports whether a database is connected and reachable. Always `false`
    /// when running in memory.
    pub async fn ping_db(&self) -> bool {
        self.backend.ping().await
    }

    pub async fn stats(&self) -> Result<Stats> {
        self.backend.stats().await
    }

    /// Writes the in-memory links to `path`. Does nothing when PostgreSQL is
    /// the active backend.
    pub async fn save_to_file(&self, path: impl AsRef<Path>) -> Result<usize> {
        match &self.memory {
            Some(memory) => snapshot::save(memory, path).await,
            None => {
                debug!("postgres is active, skipping snapshot save");
                Ok(0)
            }
        }
    }

    /// Loads links saved by [`Storage::save_to_file`]. A missing file restores
    /// nothing. Does nothing when PostgreSQL is the active backend.
    pub async fn restore_from_file(&self, path: impl AsRef<Path>) -> Result<usize> {
        match &self.memory {
            Some(memory) => snapshot::restore(memory, path).await,
            None => {
                debug!("postgres is active, skipping snapshot restore");
                Ok(0)
            }
        }
    }
}

async fn connect(
    dsn: &str,
    settings: &StorageSettings,
    generator: Arc<CodeGenerator>,
) -> Result<PostgresBackend> {
    let backend =
        PostgresBackend::connect(dsn, settings.base_url.clone(), generator, settings.postgres)
            .await?;
    backend.ensure_schema().await?;
    Ok(backend)
}
