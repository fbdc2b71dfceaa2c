//! Configuration for worklaned.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

/// Main service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub escrow: EscrowConfig,

    /// Settlement currency for escrow holds.
    #[serde(default = "default_currency")]
    pub currency: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            escrow: EscrowConfig::default(),
            currency: default_currency(),
        }
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address.
    pub listen_addr: SocketAddr,

    /// Enable CORS.
    #[serde(default = "default_true")]
    pub enable_cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8780".parse().expect("static addr"),
            enable_cors: true,
        }
    }
}

/// Ledger backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory ledger (development/testing only).
    Memory,

    /// PostgreSQL ledger.
    Postgres {
        url: String,

        #[serde(default = "default_pool_size")]
        max_connections: u32,

        #[serde(default = "default_connect_timeout")]
        connect_timeout_secs: u64,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Memory
    }
}

/// Escrow gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EscrowConfig {
    /// In-memory mock gateway (development/testing only).
    Mock,

    /// External payment processor over HTTP.
    Http {
        base_url: String,

        #[serde(default)]
        api_key: String,

        #[serde(default = "default_gateway_timeout")]
        request_timeout_secs: u64,

        #[serde(default = "default_gateway_retries")]
        max_retries: u32,
    },
}

impl Default for EscrowConfig {
    fn default() -> Self {
        Self::Mock
    }
}

impl ServiceConfig {
    /// Load configuration from a JSON file, or defaults when no path given.
    pub fn load(path: Option<&str>) -> anyhow::Result<Self> {
        match path {
            Some(path) => {
                let raw = std::fs::read_to_string(Path::new(path))?;
                Ok(serde_json::from_str(&raw)?)
            }
            None => Ok(Self::default()),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_currency() -> String {
    "USD".to_string()
}

fn default_pool_size() -> u32 {
    10
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_gateway_timeout() -> u64 {
    10
}

fn default_gateway_retries() -> u32 {
    2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_memory_and_mock() {
        let config = ServiceConfig::default();
        assert!(matches!(config.storage, StorageConfig::Memory));
        assert!(matches!(config.escrow, EscrowConfig::Mock));
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: ServiceConfig = serde_json::from_str(
            r#"{
                "storage": {"type": "postgres", "url": "postgres://localhost/worklane"},
                "currency": "EUR"
            }"#,
        )
        .unwrap();
        assert_eq!(config.currency, "EUR");
        match config.storage {
            StorageConfig::Postgres {
                max_connections, ..
            } => assert_eq!(max_connections, 10),
            StorageConfig::Memory => panic!("expected postgres"),
        }
    }
}
