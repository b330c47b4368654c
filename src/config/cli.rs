use clap::Parser;
use std::path::PathBuf;

use super::types::LogLevel;

// -----------------------------------------------------------------------------
// ----- CliConfig -------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct CliConfig {
    pub config_file_location: PathBuf,
    pub users_file_location: PathBuf,
    pub log_level: LogLevel,
}

impl CliConfig {
    /// Parses process arguments; exits with clap's usage message on error.
    pub fn from_args() -> Self {
        Self::from(Args::parse())
    }

    pub fn try_from_iter<I, T>(iter: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        Args::try_parse_from(iter).map(Self::from)
    }
}

impl From<Args> for CliConfig {
    fn from(args: Args) -> Self {
        Self {
            config_file_location: args.config_file,
            users_file_location: args.users_file,
            log_level: args.log_level,
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Args ------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "objgate", version, about = "Business-object backend gateway")]
struct Args {
    // Not required via CLI or ENV (defaults to info).
    #[arg(long = "log", default_value = "info", env = "OBJGATE_LOG")]
    log_level: LogLevel,

    // Must exist; no defaults.
    #[arg(long = "config", env = "OBJGATE_CONFIG_FILE")]
    config_file: PathBuf,

    // Must exist; no defaults.
    #[arg(long = "users", env = "OBJGATE_USERS_FILE")]
    users_file: PathBuf,
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
