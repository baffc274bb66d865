use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use murmur_crypto::keys::key_from_base64;
use murmur_crypto::{CryptoError, SecretKey};
use murmur_gateway::RetentionPolicy;

/// Placeholder master keys that MUST NOT be used.
const PLACEHOLDER_MASTER_KEYS: &[&str] = &[
    "change-me",
    "change-me-to-a-random-base64-key",
    "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("MURMUR_MASTER_KEY is unset or still a placeholder")]
    MissingMasterKey,

    #[error("MURMUR_MASTER_KEY is not a base64 32-byte key: {0}")]
    InvalidMasterKey(#[source] CryptoError),

    #[error("{var} must be a non-negative integer, got {value:?}")]
    InvalidNumber { var: &'static str, value: String },

    #[error("invalid bind address {0}")]
    InvalidAddress(String),

    #[error(transparent)]
    Retention(#[from] murmur_gateway::ConfigError),
}

pub struct ServerConfig {
    pub addr: SocketAddr,
    pub db_path: PathBuf,
    pub master_key: SecretKey,
    pub retention: RetentionPolicy,
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("addr", &self.addr)
            .field("db_path", &self.db_path)
            .field("master_key", &"<redacted>")
            .field("retention", &self.retention)
            .finish()
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build the config from any variable source. Unset variables take
    /// their defaults, except the master key which is required.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str, default: &str| lookup(name).unwrap_or_else(|| default.to_string());

        let host = var("MURMUR_HOST", "0.0.0.0");
        let port: u16 = parse("MURMUR_PORT", var("MURMUR_PORT", "3000"))?;
        let addr: SocketAddr = format!("{}:{}", host, port)
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(format!("{}:{}", host, port)))?;

        let master_key = lookup("MURMUR_MASTER_KEY")
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty() && !PLACEHOLDER_MASTER_KEYS.contains(&key.as_str()))
            .ok_or(ConfigError::MissingMasterKey)?;
        let master_key = key_from_base64(&master_key).map_err(ConfigError::InvalidMasterKey)?;
        if master_key.iter().all(|b| *b == 0) {
            return Err(ConfigError::MissingMasterKey);
        }

        let retention_days: u64 = parse("MURMUR_RETENTION_DAYS", var("MURMUR_RETENTION_DAYS", "60"))?;
        let warn_days: u64 = parse("MURMUR_WARN_DAYS", var("MURMUR_WARN_DAYS", "7"))?;
        let sweep_secs: u64 = parse(
            "MURMUR_SWEEP_INTERVAL_SECS",
            var("MURMUR_SWEEP_INTERVAL_SECS", "86400"),
        )?;
        let retention = RetentionPolicy::from_days(
            retention_days,
            warn_days,
            Duration::from_secs(sweep_secs),
        )?;

        Ok(Self {
            addr,
            db_path: var("MURMUR_DB_PATH", "murmur.db").into(),
            master_key,
            retention,
        })
    }
}

fn parse<T: std::str::FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidNumber { var, value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const KEY: &str = "MDEyMzQ1Njc4OWFiY2RlZjAxMjM0NTY3ODlhYmNkZWY=";

    fn load(vars: &[(&str, &str)]) -> Result<ServerConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_apply_when_only_key_is_set() {
        let config = load(&[("MURMUR_MASTER_KEY", KEY)]).unwrap();
        assert_eq!(config.addr, "0.0.0.0:3000".parse().unwrap());
        assert_eq!(config.db_path, PathBuf::from("murmur.db"));
        assert_eq!(config.master_key, *b"0123456789abcdef0123456789abcdef");
        assert_eq!(config.retention.delete_after().num_days(), 60);
        assert_eq!(config.retention.warn_before().num_days(), 7);
        assert_eq!(config.retention.sweep_interval(), Duration::from_secs(86400));
    }

    #[test]
    fn master_key_is_required() {
        assert!(matches!(load(&[]), Err(ConfigError::MissingMasterKey)));
        assert!(matches!(
            load(&[("MURMUR_MASTER_KEY", "change-me")]),
            Err(ConfigError::MissingMasterKey)
        ));
        assert!(matches!(
            load(&[("MURMUR_MASTER_KEY", "dG9vIHNob3J0")]),
            Err(ConfigError::InvalidMasterKey(_))
        ));
    }

    #[test]
    fn inconsistent_retention_is_rejected() {
        let err = load(&[
            ("MURMUR_MASTER_KEY", KEY),
            ("MURMUR_RETENTION_DAYS", "7"),
            ("MURMUR_WARN_DAYS", "7"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::Retention(_)));

        assert!(matches!(
            load(&[("MURMUR_MASTER_KEY", KEY), ("MURMUR_WARN_DAYS", "soon")]),
            Err(ConfigError::InvalidNumber { var: "MURMUR_WARN_DAYS", .. })
        ));
    }

    #[test]
    fn oversized_retention_fails_at_startup() {
        let err = load(&[
            ("MURMUR_MASTER_KEY", KEY),
            ("MURMUR_RETENTION_DAYS", "100000000"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::Retention(_)));
        assert!(err.to_string().contains("exceeds the maximum"));
    }
}
