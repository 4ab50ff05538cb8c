//! Authentication and session core

pub mod auth;
pub mod clock;
pub mod config;
pub mod db;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AuthConfig, ConfigError, ServerConfig};
