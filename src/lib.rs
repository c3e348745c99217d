// Core modules
pub mod config;
pub mod controller;
pub mod data;
pub mod error;
pub mod exchange;
pub mod indicators;
pub mod models;
pub mod notification;
pub mod rate_limiter;
pub mod runner;
pub mod shutdown;
pub mod strategy;

// Re-export commonly used types
pub use config::AppConfig;
pub use error::{Error, Result};
pub use models::*;
pub use runner::AlertBot;
pub use strategy::Strategy;
