//! Tessera Core Library
//!
//! Domain models, error types and configuration shared by every Tessera crate.

pub mod config;
pub mod constants;
pub mod error;
pub mod models;
pub mod task_error;

// Re-export commonly used types
pub use config::{BaseConfig, Config, ThumbnailSize, UploadServiceConfig};
pub use error::{AppError, ErrorMetadata, LogLevel};
pub use task_error::{TaskError, TaskResultExt};
