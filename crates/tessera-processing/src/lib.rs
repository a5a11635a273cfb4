//! Tessera Processing Library
//!
//! Content inspection and variant generation for finished uploads. Everything
//! here is synchronous and CPU-bound; callers run it on a blocking thread.

pub mod document;
pub mod pipeline;
pub mod sniff;
pub mod thumbnail;
pub mod validator;

pub use pipeline::{processor_for, ContentProcessor, ProcessingInput, Variant};
pub use sniff::{detect, Detected};
pub use validator::ValidationError;
