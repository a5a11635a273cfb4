pub mod tus;

pub use tus::TusService;
