pub mod tus;

pub use tus::tus_resumable_middleware;
