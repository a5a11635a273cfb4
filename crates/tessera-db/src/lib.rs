//! Tessera Database Layer
//!
//! Persistence for `file_uploads` records.

pub mod db;

pub use db::{FileUploadRepository, InMemoryMetadataStore, MetadataStore};

/// Embedded migrations for the `file_uploads` schema
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
