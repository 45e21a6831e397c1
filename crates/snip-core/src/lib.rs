//! Core types and traits for the snip URL shortener.
//!
//! This crate provides the domain types shared by the code generator,
//! the storage backends and the storage facade.

pub mod error;
pub mod ids;
pub mod repository;
pub mod shortcode;

pub use error::{CoreError, Result, StorageError};
pub use ids::{LinkId, UserId};
pub use repository::{
    Backend, BackendKind, DeletionBatch, OwnedLink, OwnershipStore, Stats, UserRecord,
};
pub use shortcode::{ShortCode, SHORT_CODE_LENGTH};
