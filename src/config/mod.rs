pub mod env;
mod loader;

pub use env::{AppConfig, ConfigError, ConnectorConfig, DigestConfig, DirectoryConfig, QueueConfig};
pub use loader::load_config;
