//! Tessera Storage Library
//!
//! Two kinds of byte storage live here:
//!
//! - [`Storage`]: permanent storage for finished uploads and their variants.
//! - [`ChunkStore`]: append-only staging files, one per in-flight upload session.
//!
//! # Storage key format
//!
//! - **Finished upload**: `uploads/{owner}/{upload_id}` with an optional `.{ext}`
//! - **Variant**: `thumbs/{upload_id}/{variant}.png`
//!
//! Keys must not contain `..` or a leading `/`. Key generation is centralized in the
//! `keys` module.

pub mod chunk;
pub mod factory;
pub mod keys;
pub mod local;
pub mod traits;

// Re-export commonly used types
pub use chunk::{ChunkStore, LocalChunkStore};
pub use factory::{create_chunk_store, create_storage};
pub use local::LocalStorage;
pub use traits::{Storage, StorageError, StorageResult};
