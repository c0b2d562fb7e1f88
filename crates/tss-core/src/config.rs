//! Client configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{Chain, Network};
use crate::{Error, Result};

/// Settings shared by the coordinator transport and the session loops
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientConfig {
    /// Coordinator base URL, without the `/v1/tss` suffix
    pub base_url: String,
    pub poll_interval_ms: u64,
    pub request_timeout_secs: u64,
    pub chain: Chain,
    pub network: Network,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:3232/bws/api".to_string(),
            poll_interval_ms: 1000,
            request_timeout_secs: 30,
            chain: Chain::Btc,
            network: Network::Livenet,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<()> {
        if self.base_url.is_empty() {
            return Err(Error::InvalidConfig("base URL is empty".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::InvalidConfig("poll interval must be positive".into()));
        }
        if self.request_timeout_secs == 0 {
            return Err(Error::InvalidConfig("request timeout must be positive".into()));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ClientConfig::default();
        config.validate().unwrap();
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"baseUrl":"http://coord","network":"testnet"}"#).unwrap();
        assert_eq!(config.base_url, "http://coord");
        assert_eq!(config.network, Network::Testnet);
        assert_eq!(config.request_timeout_secs, 30);
    }

    #[test]
    fn test_zero_interval_is_rejected() {
        let config = ClientConfig {
            poll_interval_ms: 0,
            ..ClientConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }
}
