//! Tessera API Library
//!
//! HTTP surface of the upload service: the resumable upload protocol under
//! `/tus`, the JSON records API and the application setup.

mod api_doc;
mod handlers;
mod middleware;

pub mod auth;
pub mod error;
pub mod services;
pub mod setup;
pub mod state;

// Re-exports
pub use error::ErrorResponse;
pub use services::TusService;
pub use state::AppState;
