use std::{
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;

use super::{
    cli::CliConfig,
    settings::{Settings, SettingsError},
    types::LogLevel,
    users::{UsersConfig, UsersError},
};

// -----------------------------------------------------------------------------
// ----- Config ----------------------------------------------------------------

/// Everything the process needs at start-up. Loaded once and passed down.
#[derive(Clone, Debug)]
pub struct Config {
    pub log_level: LogLevel,
    pub settings: Settings,
    pub users: UsersConfig,
}

// -----------------------------------------------------------------------------
// ----- Config: Static --------------------------------------------------------

impl Config {
    pub async fn load(cli: &CliConfig) -> Result<Config, ConfigError> {
        must_exist_file(&cli.config_file_location, "--config / objgate.toml")?;
        must_exist_file(&cli.users_file_location, "--users / users.toml")?;

        let settings = Settings::from_file_async(&cli.config_file_location).await?;
        let users = UsersConfig::from_file_async(&cli.users_file_location).await?;

        Ok(Config {
            log_level: cli.log_level,
            settings,
            users,
        })
    }
}

// -----------------------------------------------------------------------------
// ----- Private Utils ---------------------------------------------------------

fn must_exist_file(path: &Path, hint: &'static str) -> Result<(), ConfigError> {
    let md = fs::metadata(path).map_err(|_| ConfigError::MissingFile {
        path: path.to_path_buf(),
        hint,
    })?;

    if !md.is_file() {
        return Err(ConfigError::NotAFile {
            path: path.to_path_buf(),
            hint,
        });
    }
    Ok(())
}

// -----------------------------------------------------------------------------
// ----- Errors ----------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("required file missing: {} (from {hint})", .path.display())]
    MissingFile { path: PathBuf, hint: &'static str },

    #[error("path is not a file: {} (from {hint})", .path.display())]
    NotAFile { path: PathBuf, hint: &'static str },

    #[error("gateway settings: {0}")]
    Settings(#[from] SettingsError),

    #[error("users: {0}")]
    Users(#[from] UsersError),
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
