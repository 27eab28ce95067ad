//! Control plane configuration.
//!
//! Configuration is loaded from environment variables. All sensitive
//! fields are redacted in Debug output.

use common::secret::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use thiserror::Error;

/// Default gateway (WebSocket + admin HTTP) bind address.
pub const DEFAULT_GATEWAY_BIND_ADDRESS: &str = "0.0.0.0:8080";

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default client heartbeat cadence (§6: `heartbeatCadenceSec`).
pub const DEFAULT_HEARTBEAT_CADENCE_SECONDS: u64 = 10;

/// Default minimum interval between `lastSeenAt` persistence writes.
pub const DEFAULT_HEARTBEAT_DB_COALESCE_SECONDS: u64 = 30;

/// Default per-participant watchdog timeout.
pub const DEFAULT_HEARTBEAT_GRACE_SECONDS: u64 = 45;

/// Default sweeper stale threshold.
pub const DEFAULT_STALE_SWEEP_SECONDS: u64 = 150;

/// Default hand-raise auto-expiry.
pub const DEFAULT_HAND_RAISE_TTL_SECONDS: u64 = 120;

/// Default SFU access-token lifetime.
pub const DEFAULT_SFU_TOKEN_TTL_SECONDS: u64 = 3600;

/// Default invite-code length.
pub const DEFAULT_INVITE_CODE_LEN: usize = 8;

/// Default instance ID prefix.
pub const DEFAULT_INSTANCE_ID_PREFIX: &str = "mc";

/// Default interval between JWKS key-set refreshes.
pub const DEFAULT_IDENTITY_KEYS_REFRESH_SECONDS: u64 = 300;

/// Control plane configuration.
///
/// Loaded from environment variables with sensible defaults. Sensitive
/// fields are redacted in Debug output.
#[derive(Clone)]
pub struct Config {
    /// PostgreSQL connection string for the document store.
    pub database_url: SecretString,

    /// Maximum number of pooled database connections.
    pub database_max_connections: u32,

    /// Gateway bind address (WebSocket upgrade + admin HTTP, default "0.0.0.0:8080").
    pub gateway_bind_address: String,

    /// Health endpoint bind address (default "0.0.0.0:8081").
    pub health_bind_address: String,

    /// Accepted WebSocket handshake origins. Empty means "accept any origin".
    pub allowed_origins: Vec<String>,

    /// Unique identifier for this control plane instance.
    pub instance_id: String,

    /// JWKS endpoint the Identity Provider publishes its signing keys at.
    /// Fetched at startup and refreshed periodically so key rotation is
    /// picked up without a restart.
    pub identity_jwks_url: String,

    /// How often to refresh the cached JWKS key set, in seconds (default 300).
    pub identity_keys_refresh_seconds: u64,

    /// Expected client heartbeat interval, in seconds (default 10).
    pub heartbeat_cadence_seconds: u64,

    /// Minimum interval between `lastSeenAt` persistence writes (default 30).
    pub heartbeat_db_coalesce_seconds: u64,

    /// Per-participant watchdog timeout (default 45).
    pub heartbeat_grace_seconds: u64,

    /// Sweeper stale threshold (default 150).
    pub stale_sweep_seconds: u64,

    /// Hand-raise auto-expiry, in seconds (default 120).
    pub hand_raise_ttl_seconds: u64,

    /// SFU access-token lifetime, in seconds (default 3600).
    pub sfu_token_ttl_seconds: u64,

    /// Invite-code length, in case-insensitive alphanumeric characters (default 8).
    pub invite_code_len: usize,

    /// Master secret used to sign SFU access tokens and Identity Provider
    /// JWKS-less shared-secret bearer tokens where applicable.
    pub signing_secret: SecretString,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("database_url", &"[REDACTED]")
            .field("database_max_connections", &self.database_max_connections)
            .field("gateway_bind_address", &self.gateway_bind_address)
            .field("health_bind_address", &self.health_bind_address)
            .field("allowed_origins", &self.allowed_origins)
            .field("instance_id", &self.instance_id)
            .field("identity_jwks_url", &self.identity_jwks_url)
            .field(
                "identity_keys_refresh_seconds",
                &self.identity_keys_refresh_seconds,
            )
            .field(
                "heartbeat_cadence_seconds",
                &self.heartbeat_cadence_seconds,
            )
            .field(
                "heartbeat_db_coalesce_seconds",
                &self.heartbeat_db_coalesce_seconds,
            )
            .field("heartbeat_grace_seconds", &self.heartbeat_grace_seconds)
            .field("stale_sweep_seconds", &self.stale_sweep_seconds)
            .field("hand_raise_ttl_seconds", &self.hand_raise_ttl_seconds)
            .field("sfu_token_ttl_seconds", &self.sfu_token_ttl_seconds)
            .field("invite_code_len", &self.invite_code_len)
            .field("signing_secret", &"[REDACTED]")
            .finish()
    }
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable was not set.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable was set but could not be parsed.
    #[error("invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a required variable is missing or a
    /// present variable fails to parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from an explicit map (used by tests).
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a required variable is missing or a
    /// present variable fails to parse.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let database_url = SecretString::from(
            vars.get("DATABASE_URL")
                .ok_or_else(|| ConfigError::MissingEnvVar("DATABASE_URL".to_string()))?
                .clone(),
        );

        let signing_secret = SecretString::from(
            vars.get("MC_SIGNING_SECRET")
                .ok_or_else(|| ConfigError::MissingEnvVar("MC_SIGNING_SECRET".to_string()))?
                .clone(),
        );

        let database_max_connections = parse_or_default(vars, "MC_DATABASE_MAX_CONNECTIONS", 10)?;

        let gateway_bind_address = vars
            .get("MC_GATEWAY_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_GATEWAY_BIND_ADDRESS.to_string());

        let health_bind_address = vars
            .get("MC_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let allowed_origins = vars
            .get("MC_ALLOWED_ORIGINS")
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let instance_id = vars.get("MC_INSTANCE_ID").cloned().unwrap_or_else(|| {
            let hostname = env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_INSTANCE_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        let identity_jwks_url = vars
            .get("MC_IDENTITY_JWKS_URL")
            .ok_or_else(|| ConfigError::MissingEnvVar("MC_IDENTITY_JWKS_URL".to_string()))?
            .clone();

        let identity_keys_refresh_seconds = parse_or_default(
            vars,
            "MC_IDENTITY_KEYS_REFRESH_SECONDS",
            DEFAULT_IDENTITY_KEYS_REFRESH_SECONDS,
        )?;

        let heartbeat_cadence_seconds = parse_or_default(
            vars,
            "MC_HEARTBEAT_CADENCE_SECONDS",
            DEFAULT_HEARTBEAT_CADENCE_SECONDS,
        )?;
        let heartbeat_db_coalesce_seconds = parse_or_default(
            vars,
            "MC_HEARTBEAT_DB_COALESCE_SECONDS",
            DEFAULT_HEARTBEAT_DB_COALESCE_SECONDS,
        )?;
        let heartbeat_grace_seconds = parse_or_default(
            vars,
            "MC_HEARTBEAT_GRACE_SECONDS",
            DEFAULT_HEARTBEAT_GRACE_SECONDS,
        )?;
        let stale_sweep_seconds = parse_or_default(
            vars,
            "MC_STALE_SWEEP_SECONDS",
            DEFAULT_STALE_SWEEP_SECONDS,
        )?;
        let hand_raise_ttl_seconds = parse_or_default(
            vars,
            "MC_HAND_RAISE_TTL_SECONDS",
            DEFAULT_HAND_RAISE_TTL_SECONDS,
        )?;
        let sfu_token_ttl_seconds = parse_or_default(
            vars,
            "MC_SFU_TOKEN_TTL_SECONDS",
            DEFAULT_SFU_TOKEN_TTL_SECONDS,
        )?;
        let invite_code_len: usize =
            parse_or_default(vars, "MC_INVITE_CODE_LEN", DEFAULT_INVITE_CODE_LEN as u64)? as usize;

        if heartbeat_grace_seconds >= stale_sweep_seconds {
            return Err(ConfigError::InvalidValue(
                "MC_HEARTBEAT_GRACE_SECONDS must be less than MC_STALE_SWEEP_SECONDS".to_string(),
            ));
        }

        Ok(Config {
            database_url,
            database_max_connections,
            gateway_bind_address,
            health_bind_address,
            allowed_origins,
            instance_id,
            identity_jwks_url,
            identity_keys_refresh_seconds,
            heartbeat_cadence_seconds,
            heartbeat_db_coalesce_seconds,
            heartbeat_grace_seconds,
            stale_sweep_seconds,
            hand_raise_ttl_seconds,
            sfu_token_ttl_seconds,
            invite_code_len,
            signing_secret,
        })
    }
}

fn parse_or_default(
    vars: &HashMap<String, String>,
    key: &str,
    default: u64,
) -> Result<u64, ConfigError> {
    match vars.get(key) {
        Some(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{key} must be an integer"))),
        None => Ok(default),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::secret::ExposeSecret;

    fn base_vars() -> HashMap<String, String> {
        HashMap::from([
            (
                "DATABASE_URL".to_string(),
                "postgres://localhost/classroom".to_string(),
            ),
            (
                "MC_SIGNING_SECRET".to_string(),
                "dGVzdC1zZWNyZXQtMTIzNDU2Nzg5MA==".to_string(),
            ),
            (
                "MC_IDENTITY_JWKS_URL".to_string(),
                "https://idp.example/.well-known/jwks.json".to_string(),
            ),
        ])
    }

    #[test]
    fn from_vars_success_with_defaults() {
        let vars = base_vars();
        let config = Config::from_vars(&vars).expect("config should load");

        assert_eq!(
            config.database_url.expose_secret(),
            "postgres://localhost/classroom"
        );
        assert_eq!(config.gateway_bind_address, DEFAULT_GATEWAY_BIND_ADDRESS);
        assert_eq!(config.health_bind_address, DEFAULT_HEALTH_BIND_ADDRESS);
        assert_eq!(
            config.heartbeat_cadence_seconds,
            DEFAULT_HEARTBEAT_CADENCE_SECONDS
        );
        assert_eq!(
            config.heartbeat_grace_seconds,
            DEFAULT_HEARTBEAT_GRACE_SECONDS
        );
        assert_eq!(config.stale_sweep_seconds, DEFAULT_STALE_SWEEP_SECONDS);
        assert_eq!(config.hand_raise_ttl_seconds, DEFAULT_HAND_RAISE_TTL_SECONDS);
        assert_eq!(config.sfu_token_ttl_seconds, DEFAULT_SFU_TOKEN_TTL_SECONDS);
        assert_eq!(config.invite_code_len, DEFAULT_INVITE_CODE_LEN);
        assert!(config.instance_id.starts_with("mc-"));
        assert!(config.allowed_origins.is_empty());
        assert_eq!(
            config.identity_jwks_url,
            "https://idp.example/.well-known/jwks.json"
        );
        assert_eq!(
            config.identity_keys_refresh_seconds,
            DEFAULT_IDENTITY_KEYS_REFRESH_SECONDS
        );
    }

    #[test]
    fn from_vars_missing_identity_jwks_url() {
        let mut vars = base_vars();
        vars.remove("MC_IDENTITY_JWKS_URL");

        let result = Config::from_vars(&vars);
        assert!(
            matches!(result, Err(ConfigError::MissingEnvVar(v)) if v == "MC_IDENTITY_JWKS_URL")
        );
    }

    #[test]
    fn from_vars_parses_custom_values() {
        let mut vars = base_vars();
        vars.insert("MC_HEARTBEAT_GRACE_SECONDS".to_string(), "20".to_string());
        vars.insert("MC_STALE_SWEEP_SECONDS".to_string(), "60".to_string());
        vars.insert(
            "MC_ALLOWED_ORIGINS".to_string(),
            "https://a.example, https://b.example".to_string(),
        );

        let config = Config::from_vars(&vars).expect("config should load");
        assert_eq!(config.heartbeat_grace_seconds, 20);
        assert_eq!(config.stale_sweep_seconds, 60);
        assert_eq!(
            config.allowed_origins,
            vec!["https://a.example", "https://b.example"]
        );
    }

    #[test]
    fn from_vars_missing_database_url() {
        let mut vars = base_vars();
        vars.remove("DATABASE_URL");

        let result = Config::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::MissingEnvVar(v)) if v == "DATABASE_URL"));
    }

    #[test]
    fn from_vars_rejects_grace_not_less_than_sweep() {
        let mut vars = base_vars();
        vars.insert("MC_HEARTBEAT_GRACE_SECONDS".to_string(), "200".to_string());
        vars.insert("MC_STALE_SWEEP_SECONDS".to_string(), "150".to_string());

        let result = Config::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn debug_redacts_sensitive_fields() {
        let vars = base_vars();
        let config = Config::from_vars(&vars).expect("config should load");

        let debug_output = format!("{config:?}");
        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("postgres://"));
        assert!(!debug_output.contains("dGVzdC1zZWNyZXQ"));
    }
}
