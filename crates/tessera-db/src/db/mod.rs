//! Upload record persistence
//!
//! [`MetadataStore`] is the contract the upload services depend on. Two
//! implementations exist: PostgreSQL ([`FileUploadRepository`]) and an
//! in-memory store for development and tests.

pub mod file_upload;
pub mod memory;
pub mod metadata_store;

pub use file_upload::FileUploadRepository;
pub use memory::InMemoryMetadataStore;
pub use metadata_store::MetadataStore;
