//! Configuration manager for sigil.
//!
//! Non-secret settings live in `config.yaml`. The five signing and
//! encryption secrets only come from the environment.

use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::claims::MAX_LIFETIME;

const DEFAULT_CONFIG_PATH: &str = "config.yaml";
const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Environment variable overriding the configuration file path.
pub const CONFIG_PATH_ENV: &str = "SIGIL_CONFIG";

pub const ACCOUNT_ACCESS_SECRET_ENV: &str = "ACCOUNT_ACCESS_TOKEN_SECRET_KEY";
pub const ACCOUNT_REFRESH_SECRET_ENV: &str = "ACCOUNT_REFRESH_TOKEN_SECRET_KEY";
pub const SERVICE_ACCESS_SECRET_ENV: &str = "SERVICE_ACCESS_TOKEN_SECRET_KEY";
pub const SERVICE_REFRESH_SECRET_ENV: &str = "SERVICE_REFRESH_TOKEN_SECRET_KEY";
pub const VAULT_SECRET_ENV: &str = "SERVICE_ENCRYPT_SECRET_KEY";

const DEFAULT_ACCESS_TTL: i64 = 60 * 15; // 15 minutes.
const DEFAULT_REFRESH_TTL: i64 = 60 * 60 * 24 * 7; // 7 days.

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing `{0}` environment variable")]
    MissingSecret(&'static str),
    #[error("`{first}` and `{second}` share the same value")]
    SharedSecret {
        first: &'static str,
        second: &'static str,
    },
    #[error("invalid token lifetimes: {0}")]
    Lifetime(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Instance name.
    pub name: String,
    /// Socket address the HTTP server listens on.
    pub address: String,
    #[serde(skip_deserializing)]
    version: String,
    #[serde(skip)]
    path: PathBuf,
    /// Related to PostgreSQL configuration.
    #[serde(skip_serializing)]
    pub postgres: Option<Postgres>,
    /// Token lifetimes per principal kind.
    pub token: TokenLifetimes,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            name: "sigil".into(),
            address: "0.0.0.0:8888".into(),
            version: VERSION.to_owned(),
            path: PathBuf::default(),
            postgres: None,
            token: TokenLifetimes::default(),
        }
    }
}

/// PostgreSQL configuration.
#[derive(Debug, Default, PartialEq, Clone, Serialize, Deserialize)]
pub struct Postgres {
    /// Hostname:(?port) for PostgreSQL instance.
    pub address: String,
    /// Database name.
    pub database: Option<String>,
    /// Username credential to connect.
    pub username: Option<String>,
    /// Password credential to connect.
    pub password: Option<String>,
    /// Maximum pool connections.
    pub pool_size: Option<u32>,
}

/// Lifetimes, in seconds, of the two token classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Lifetimes {
    pub access_ttl: i64,
    pub refresh_ttl: i64,
}

impl Default for Lifetimes {
    fn default() -> Self {
        Self {
            access_ttl: DEFAULT_ACCESS_TTL,
            refresh_ttl: DEFAULT_REFRESH_TTL,
        }
    }
}

impl Lifetimes {
    fn check(&self, kind: &str) -> Result<(), ConfigError> {
        if self.access_ttl <= 0 || self.refresh_ttl <= self.access_ttl {
            return Err(ConfigError::Lifetime(format!(
                "{kind} tokens need 0 < access_ttl ({}) < refresh_ttl ({})",
                self.access_ttl, self.refresh_ttl
            )));
        }
        if self.refresh_ttl > MAX_LIFETIME {
            return Err(ConfigError::Lifetime(format!(
                "{kind} refresh_ttl ({}) exceeds {MAX_LIFETIME} seconds",
                self.refresh_ttl
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenLifetimes {
    pub account: Lifetimes,
    pub service: Lifetimes,
}

impl TokenLifetimes {
    pub fn check(&self) -> Result<(), ConfigError> {
        self.account.check("account")?;
        self.service.check("service")
    }
}

impl Configuration {
    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn path(mut self, path: PathBuf) -> Self {
        self.path = path;
        self
    }

    /// Reads the `config.yaml` file from the specified path or the default
    /// location.
    pub fn read(self) -> Result<Arc<Self>, ConfigError> {
        let file_path = if self.path.is_file() {
            self.path.clone()
        } else {
            Path::new(DEFAULT_CONFIG_PATH).to_path_buf()
        };

        let config = match File::open(&file_path) {
            Ok(file) => match serde_yaml::from_reader::<_, Configuration>(file) {
                Ok(mut config) => {
                    config.version = VERSION.to_owned();
                    config.path = file_path;
                    config
                },
                Err(err) => self.error(err),
            },
            Err(err) => self.error(err),
        };

        config.token.check()?;
        Ok(Arc::new(config))
    }

    /// Return a default configuration as fallback.
    fn error(&self, err: impl std::error::Error) -> Self {
        tracing::error!(error = %err, "`config.yaml` file not found or invalid, using defaults");
        Self::default()
    }
}

/// The five deployment secrets. Guaranteed pairwise distinct once built.
#[derive(Clone)]
pub struct Secrets {
    pub account_access: Zeroizing<String>,
    pub account_refresh: Zeroizing<String>,
    pub service_access: Zeroizing<String>,
    pub service_refresh: Zeroizing<String>,
    pub vault: Zeroizing<String>,
}

impl Secrets {
    /// Read the secrets from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read the secrets through `lookup`, then refuse empty or shared values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let read = |name: &'static str| {
            lookup(name)
                .filter(|value| !value.is_empty())
                .map(Zeroizing::new)
                .ok_or(ConfigError::MissingSecret(name))
        };

        let secrets = Self {
            account_access: read(ACCOUNT_ACCESS_SECRET_ENV)?,
            account_refresh: read(ACCOUNT_REFRESH_SECRET_ENV)?,
            service_access: read(SERVICE_ACCESS_SECRET_ENV)?,
            service_refresh: read(SERVICE_REFRESH_SECRET_ENV)?,
            vault: read(VAULT_SECRET_ENV)?,
        };
        secrets.check()?;

        Ok(secrets)
    }

    fn entries(&self) -> [(&'static str, &str); 5] {
        [
            (ACCOUNT_ACCESS_SECRET_ENV, self.account_access.as_str()),
            (ACCOUNT_REFRESH_SECRET_ENV, self.account_refresh.as_str()),
            (SERVICE_ACCESS_SECRET_ENV, self.service_access.as_str()),
            (SERVICE_REFRESH_SECRET_ENV, self.service_refresh.as_str()),
            (VAULT_SECRET_ENV, self.vault.as_str()),
        ]
    }

    /// Reusing a secret across token classes collapses their isolation.
    pub fn check(&self) -> Result<(), ConfigError> {
        let entries = self.entries();

        for (i, (first, value)) in entries.iter().enumerate() {
            if let Some((second, _)) = entries[i + 1..].iter().find(|(_, other)| other == value) {
                tracing::error!(first = *first, second = *second, "two deployment secrets are identical");
                return Err(ConfigError::SharedSecret {
                    first: *first,
                    second: *second,
                });
            }
        }

        Ok(())
    }
}

impl fmt::Debug for Secrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secrets").finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;

    use super::*;

    pub fn secrets() -> Secrets {
        let env = HashMap::from([
            (ACCOUNT_ACCESS_SECRET_ENV, "account-access-secret"),
            (ACCOUNT_REFRESH_SECRET_ENV, "account-refresh-secret"),
            (SERVICE_ACCESS_SECRET_ENV, "service-access-secret"),
            (SERVICE_REFRESH_SECRET_ENV, "service-refresh-secret"),
            (VAULT_SECRET_ENV, "vault-secret"),
        ]);

        Secrets::from_lookup(|name| env.get(name).map(|v| v.to_string())).unwrap()
    }

    #[test]
    fn test_missing_secret() {
        let err = Secrets::from_lookup(|name| {
            (name != VAULT_SECRET_ENV).then(|| format!("{name}-value"))
        })
        .unwrap_err();

        assert!(matches!(err, ConfigError::MissingSecret(VAULT_SECRET_ENV)));
    }

    #[test]
    fn test_empty_secret() {
        let err = Secrets::from_lookup(|name| {
            if name == ACCOUNT_REFRESH_SECRET_ENV {
                Some(String::new())
            } else {
                Some(format!("{name}-value"))
            }
        })
        .unwrap_err();

        assert!(matches!(err, ConfigError::MissingSecret(ACCOUNT_REFRESH_SECRET_ENV)));
    }

    #[test]
    fn test_shared_secret() {
        let err = Secrets::from_lookup(|name| {
            if name == SERVICE_ACCESS_SECRET_ENV {
                Some("same".into())
            } else if name == ACCOUNT_ACCESS_SECRET_ENV {
                Some("same".into())
            } else {
                Some(format!("{name}-value"))
            }
        })
        .unwrap_err();

        assert!(matches!(
            err,
            ConfigError::SharedSecret {
                first: ACCOUNT_ACCESS_SECRET_ENV,
                second: SERVICE_ACCESS_SECRET_ENV,
            }
        ));
    }

    #[test]
    fn test_debug_is_redacted() {
        let debug = format!("{:?}", secrets());
        assert_eq!(debug, "Secrets { .. }");
    }

    #[test]
    fn test_yaml() {
        let config: Configuration = serde_yaml::from_str(
            r#"
name: sigil-test
token:
  account:
    access_ttl: 60
  service:
    access_ttl: 120
    refresh_ttl: 3600
"#,
        )
        .unwrap();

        assert_eq!(config.name, "sigil-test");
        assert_eq!(config.address, "0.0.0.0:8888");
        assert_eq!(config.token.account.access_ttl, 60);
        assert_eq!(config.token.account.refresh_ttl, DEFAULT_REFRESH_TTL);
        assert_eq!(config.token.service.refresh_ttl, 3600);
        assert!(config.token.check().is_ok());
    }

    #[test]
    fn test_lifetimes_check() {
        let lifetimes = TokenLifetimes {
            account: Lifetimes {
                access_ttl: 600,
                refresh_ttl: 600,
            },
            ..Default::default()
        };

        assert!(matches!(lifetimes.check(), Err(ConfigError::Lifetime(_))));
    }

    #[test]
    fn test_lifetimes_cap() {
        let capped = TokenLifetimes {
            service: Lifetimes {
                access_ttl: 900,
                refresh_ttl: MAX_LIFETIME,
            },
            ..Default::default()
        };
        assert!(capped.check().is_ok());

        let endless = TokenLifetimes {
            account: Lifetimes {
                access_ttl: 900,
                refresh_ttl: i64::MAX,
            },
            ..Default::default()
        };
        assert!(matches!(endless.check(), Err(ConfigError::Lifetime(_))));
    }

    #[test]
    fn test_missing_file_falls_back() {
        let config = Configuration::default()
            .path(PathBuf::from("does/not/exist.yaml"))
            .read()
            .unwrap();

        assert_eq!(config.token, TokenLifetimes::default());
    }
}
