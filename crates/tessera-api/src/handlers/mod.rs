pub mod health;
pub mod tus;
pub mod uploads;
