//! Process bootstrap for a ModHost server: layered configuration, logging
//! initialization, and home directory resolution.

pub mod config;
pub mod config_provider;
pub mod logging;
pub mod paths;

pub use config::{default_logging_config, AppConfig, CliArgs, LoggingConfig, Section, ServerConfig};
pub use config_provider::{AppConfigProvider, ConfigProvider};
pub use paths::home_dir::{resolve_home_dir, HomeDirError};
