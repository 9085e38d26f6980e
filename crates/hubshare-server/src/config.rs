//! Hub configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the hub can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;

use hubshare_shared::constants::{DEFAULT_HUB_PORT, DOWNLOAD_TOKEN_TTL_SECS};

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Socket address for the HTTP/WebSocket server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:3000`
    pub http_addr: SocketAddr,

    /// SQLite database file.
    /// Env: `DATABASE_PATH`
    /// Default: `./hub_data.db`
    pub database_path: PathBuf,

    /// Ed25519 public key of the session credential authority (hex, 64 chars).
    /// Env: `HUB_AUTH_PUBKEY`
    /// Default: all-zeros, which rejects every session.
    pub auth_pubkey: [u8; 32],

    /// Lifetime of a download token in seconds.
    /// Env: `DOWNLOAD_TOKEN_TTL_SECS`
    pub token_ttl_secs: i64,

    /// How often expired download tokens are purged.
    /// Env: `TOKEN_PURGE_INTERVAL_SECS`
    pub token_purge_interval_secs: u64,

    /// Sustained requests per second allowed per client IP.
    /// Env: `RATE_LIMIT_PER_SEC`
    pub rate_limit_per_sec: f64,

    /// Burst capacity per client IP.
    /// Env: `RATE_LIMIT_BURST`
    pub rate_limit_burst: f64,

    /// Human-readable name for this hub instance.
    /// Env: `INSTANCE_NAME`
    pub instance_name: String,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HUB_PORT).into(),
            database_path: PathBuf::from("./hub_data.db"),
            auth_pubkey: [0u8; 32],
            token_ttl_secs: DOWNLOAD_TOKEN_TTL_SECS,
            token_purge_interval_secs: 60,
            rate_limit_per_sec: 10.0,
            rate_limit_burst: 30.0,
            instance_name: "hubshare hub".to_string(),
        }
    }
}

impl HubConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Ok(path) = std::env::var("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }

        if let Ok(hex_key) = std::env::var("HUB_AUTH_PUBKEY") {
            match parse_hex_pubkey(&hex_key) {
                Ok(key) => config.auth_pubkey = key,
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        "Invalid HUB_AUTH_PUBKEY, every session will be rejected"
                    );
                }
            }
        }

        if let Some(ttl) = parse_env::<i64>("DOWNLOAD_TOKEN_TTL_SECS").filter(|t| *t > 0) {
            config.token_ttl_secs = ttl;
        }

        if let Some(secs) = parse_env::<u64>("TOKEN_PURGE_INTERVAL_SECS").filter(|s| *s > 0) {
            config.token_purge_interval_secs = secs;
        }

        if let Some(rate) = parse_env::<f64>("RATE_LIMIT_PER_SEC") {
            config.rate_limit_per_sec = rate;
        }

        if let Some(burst) = parse_env::<f64>("RATE_LIMIT_BURST") {
            config.rate_limit_burst = burst;
        }

        if let Ok(name) = std::env::var("INSTANCE_NAME") {
            config.instance_name = name;
        }

        config
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "Ignoring unparsable setting");
            None
        }
    }
}

/// Parse a 64-character hex string into a 32-byte array.
pub fn parse_hex_pubkey(hex_str: &str) -> Result<[u8; 32], String> {
    let hex_str = hex_str.trim();
    if hex_str.len() != 64 {
        return Err(format!("expected 64 hex chars, got {}", hex_str.len()));
    }

    let bytes = hex::decode(hex_str).map_err(|e| e.to_string())?;
    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = HubConfig::default();
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 3000).into());
        assert_eq!(config.auth_pubkey, [0u8; 32]);
        assert_eq!(config.token_ttl_secs, 300);
    }

    #[test]
    fn test_parse_hex_pubkey() {
        let hex = "ab".repeat(32);
        assert_eq!(parse_hex_pubkey(&hex).unwrap(), [0xab; 32]);
    }

    #[test]
    fn test_parse_hex_pubkey_rejects_bad_input() {
        assert!(parse_hex_pubkey("abcd").is_err());
        assert!(parse_hex_pubkey(&"zz".repeat(32)).is_err());
    }
}
