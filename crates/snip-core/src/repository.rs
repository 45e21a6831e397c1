use crate::error::Result;
use crate::ids::{LinkId, UserId};
use crate::shortcode::ShortCode;
use async_trait::async_trait;
use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// A link owned by a user, as returned by [`Backend::owned_links`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnedLink {
    pub code: ShortCode,
    pub original_url: String,
}

/// A minted user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserRecord {
    pub id: UserId,
    pub created_at: Timestamp,
}

/// Service-wide counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub users: u64,
    pub urls: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Memory,
    Postgres,
}

impl Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Memory => write!(f, "memory"),
            BackendKind::Postgres => write!(f, "postgres"),
        }
    }
}

/// Ownership lookups and soft-deletion, as needed by the deletion pipeline.
#[async_trait]
pub trait OwnershipStore: Send + Sync + 'static {
    /// Resolves `code` to the id of a link owned by `user`.
    ///
    /// Returns `Ok(None)` when the user id is invalid, the code is malformed,
    /// or the user does not own the code.
    async fn resolve_owned_link_id(&self, user: UserId, code: &str) -> Result<Option<LinkId>>;

    /// Opens a unit of work in which soft-deletes are staged and then applied
    /// all at once by [`DeletionBatch::commit`].
    async fn begin_deletion(&self) -> Result<Box<dyn DeletionBatch>>;
}

/// A pending set of soft-deletes. Dropping a batch without committing
/// discards it.
#[async_trait]
pub trait DeletionBatch: Send {
    /// Marks the ownership edge `(user, link)` as deleted within the batch.
    async fn mark_deleted(&mut self, user: UserId, link: LinkId) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// One of the interchangeable storage implementations.
#[async_trait]
pub trait Backend: OwnershipStore {
    fn kind(&self) -> BackendKind;

    /// Shortens `original_url` on behalf of `user`.
    ///
    /// The same original URL always yields the same code. Returns
    /// `Err(AlreadyExists(code))` if `user` already owns that code.
    async fn create(&self, original_url: &str, user: UserId) -> Result<ShortCode>;

    /// Resolves a short code to its original URL.
    ///
    /// With `user` set, returns `Err(Deleted)` when that user's ownership of
    /// the link has been soft-deleted. Other owners are unaffected.
    async fn resolve(&self, code: &ShortCode, user: Option<UserId>) -> Result<String>;

    /// Lists the links a user owns and has not deleted.
    /// Returns `Err(NotFound)` if there are none.
    async fn owned_links(&self, user: UserId) -> Result<Vec<OwnedLink>>;

    /// Mints a new user id.
    async fn next_user_id(&self) -> Result<UserId>;

    /// Reports whether the backend is reachable.
    async fn ping(&self) -> bool;

    async fn stats(&self) -> Result<Stats>;
}
