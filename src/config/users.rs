use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::{collections::HashMap, path::Path};
use thiserror::Error;
use tokio::fs;

use crate::backend::{Authenticator, BackendError, Credentials};

// -----------------------------------------------------------------------------
// ----- UsersConfig -----------------------------------------------------------

#[derive(Debug, Clone)]
pub struct UsersConfig {
    by_username: HashMap<String, UserRecord>,
}

// -----------------------------------------------------------------------------
// ----- UserRecord ------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct UserRecord {
    pub username: String,
    pub password: SecretString,
    pub principal_id: i64,
    pub disabled: bool,
}

// -----------------------------------------------------------------------------
// ----- UsersConfig: Static ---------------------------------------------------

impl UsersConfig {
    pub async fn from_file_async(path: &Path) -> Result<UsersConfig, UsersError> {
        let raw = fs::read_to_string(path).await.map_err(|e| UsersError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<UsersConfig, UsersError> {
        let mut doc: UsersFile = toml::from_str(raw).map_err(|e| UsersError::Toml { source: e })?;

        if doc.users.is_empty() {
            return Err(UsersError::EmptyConfig);
        }

        let mut by_username = HashMap::with_capacity(doc.users.len());
        for user in doc.users.drain(..) {
            validate(&user)?;

            let record = UserRecord {
                username: user.username.clone(),
                password: SecretString::new(user.password.into_boxed_str()),
                principal_id: user.principal_id,
                disabled: user.disabled,
            };

            if by_username.insert(record.username.clone(), record).is_some() {
                return Err(UsersError::DuplicateUser {
                    username: user.username,
                });
            }
        }

        Ok(UsersConfig { by_username })
    }
}

// -----------------------------------------------------------------------------
// ----- UsersConfig: Public ---------------------------------------------------

impl UsersConfig {
    pub fn verify(&self, username: &str, password: &str) -> Result<&UserRecord, UsersError> {
        let user = self
            .by_username
            .get(username)
            .ok_or_else(|| UsersError::UnknownUser {
                username: username.to_string(),
            })?;

        if user.password.expose_secret() != password {
            return Err(UsersError::BadPassword);
        }

        if user.disabled {
            return Err(UsersError::Disabled {
                username: username.to_string(),
            });
        }

        Ok(user)
    }

    pub fn len(&self) -> usize {
        self.by_username.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_username.is_empty()
    }
}

#[async_trait]
impl Authenticator for UsersConfig {
    async fn authenticate(&self, credentials: &Credentials) -> Result<i64, BackendError> {
        self.verify(&credentials.login, credentials.password.expose_secret())
            .map(|user| user.principal_id)
            .map_err(|e| match e {
                UsersError::Disabled { .. } => BackendError::rejected(e.to_string()),
                _ => BackendError::rejected("invalid login or password"),
            })
    }
}

// -----------------------------------------------------------------------------
// ----- Internal: On-disk format ----------------------------------------------

#[derive(Debug, Clone, Deserialize)]
struct UsersFile {
    #[serde(default)]
    users: Vec<UsersFileEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct UsersFileEntry {
    #[serde(alias = "login")]
    username: String,

    password: String,

    principal_id: i64,

    #[serde(default)]
    disabled: bool,
}

// -----------------------------------------------------------------------------
// ----- Internal: Helpers -----------------------------------------------------

fn validate(u: &UsersFileEntry) -> Result<(), UsersError> {
    if u.username.trim().is_empty() {
        return Err(UsersError::InvalidField("username".into()));
    }
    if u.password.is_empty() {
        return Err(UsersError::InvalidField("password".into()));
    }
    Ok(())
}

// -----------------------------------------------------------------------------
// ----- Errors ----------------------------------------------------------------

#[derive(Debug, Error)]
pub enum UsersError {
    #[error("users config is empty")]
    EmptyConfig,

    #[error("duplicate [[users]] entry for user '{username}'")]
    DuplicateUser { username: String },

    #[error("unknown user '{username}'")]
    UnknownUser { username: String },

    #[error("user '{username}' is disabled")]
    Disabled { username: String },

    #[error("invalid or missing field '{0}'")]
    InvalidField(String),

    #[error("bad password")]
    BadPassword,

    #[error("read error for {path:?}: {source}")]
    Io {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[error("toml parse error: {source}")]
    Toml { source: toml::de::Error },
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
