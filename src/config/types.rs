use std::time::Duration;

use serde::{Deserialize, Deserializer};

// -------------------------------------------------------------------------------------------------
// ---- LogLevel -----------------------------------------------------------------------------------

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

// -------------------------------------------------------------------------------------------------
// ---- Durations ----------------------------------------------------------------------------------

/// `"30s"`, `"1h 30m"`, `"250ms"`.
pub fn de_duration<'de, D>(d: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(d)?;
    humantime::parse_duration(raw.trim())
        .map_err(|e| serde::de::Error::custom(format!("invalid duration '{raw}': {e}")))
}

pub fn de_opt_duration<'de, D>(d: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(d)?;
    match raw {
        Some(raw) => humantime::parse_duration(raw.trim())
            .map(Some)
            .map_err(|e| serde::de::Error::custom(format!("invalid duration '{raw}': {e}"))),
        None => Ok(None),
    }
}

// -------------------------------------------------------------------------------------------------
// -------------------------------------------------------------------------------------------------
