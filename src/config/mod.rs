pub mod cli;
#[allow(clippy::module_inception)]
pub mod config;
pub mod settings;
pub mod types;
pub mod users;

pub use cli::CliConfig;
pub use config::{Config, ConfigError};
pub use settings::{
    BackendSettings, CacheConfig, PoolConfig, RateLimitConfig, SessionConfig, Settings,
    SettingsError,
};
pub use types::LogLevel;
pub use users::{UserRecord, UsersConfig, UsersError};
