use std::path::PathBuf;

use thiserror::Error;

use crate::credential::CredentialConfig;
use crate::service::ServiceConfig;

const DEFAULT_TOKEN_TTL_SECS: u64 = 24 * 3600;
const TOKEN_ISSUER: &str = "bookmyroom";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}

/// Bootstrap administrator created (or promoted) at startup.
#[derive(Debug, Clone)]
pub struct AdminSeed {
    pub email: String,
    pub password: String,
}

/// Process configuration, read once from `BOOKMYROOM_*` variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    /// Shared startup password for the pgwire transport.
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub admin: Option<AdminSeed>,
    pub credentials: CredentialConfig,
    pub service: ServiceConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| lookup(name).filter(|v| !v.is_empty());

        let secret = get("BOOKMYROOM_JWT_SECRET").ok_or(ConfigError::Missing("BOOKMYROOM_JWT_SECRET"))?;

        let admin = match (get("BOOKMYROOM_ADMIN_EMAIL"), get("BOOKMYROOM_ADMIN_PASSWORD")) {
            (Some(email), Some(password)) => Some(AdminSeed { email, password }),
            (None, None) => None,
            (Some(_), None) => return Err(ConfigError::Missing("BOOKMYROOM_ADMIN_PASSWORD")),
            (None, Some(_)) => return Err(ConfigError::Missing("BOOKMYROOM_ADMIN_EMAIL")),
        };

        Ok(Self {
            port: parse_or(&get, "BOOKMYROOM_PORT", 5433)?,
            bind: get("BOOKMYROOM_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: PathBuf::from(get("BOOKMYROOM_DATA_DIR").unwrap_or_else(|| "./data".into())),
            password: get("BOOKMYROOM_PASSWORD").unwrap_or_else(|| "bookmyroom".into()),
            max_connections: parse_or(&get, "BOOKMYROOM_MAX_CONNECTIONS", 256)?,
            compact_threshold: parse_or(&get, "BOOKMYROOM_COMPACT_THRESHOLD", 1000)?,
            metrics_port: parse_opt(&get, "BOOKMYROOM_METRICS_PORT")?,
            tls_cert: get("BOOKMYROOM_TLS_CERT"),
            tls_key: get("BOOKMYROOM_TLS_KEY"),
            admin,
            credentials: CredentialConfig {
                secret: secret.into_bytes(),
                ttl_secs: parse_or(&get, "BOOKMYROOM_TOKEN_TTL_SECS", DEFAULT_TOKEN_TTL_SECS)?,
                issuer: TOKEN_ISSUER.into(),
            },
            service: ServiceConfig {
                admit_inactive_rooms: parse_or(&get, "BOOKMYROOM_ADMIT_INACTIVE_ROOMS", false)?,
            },
        })
    }
}

fn parse_opt<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError> {
    match get(name) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { name, value }),
    }
}

fn parse_or<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    Ok(parse_opt(get, name)?.unwrap_or(default))
}
