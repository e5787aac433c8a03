pub mod config;
pub use config::{BasaltConfig, ConfigError};
