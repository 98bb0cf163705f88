use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::chain::NetworkDescriptor;
use crate::units::DEFAULT_DECIMALS;

/// Addresses of the four contracts the session binds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractAddresses {
    pub staking: Address,
    pub router: Address,

    /// Token paid into the swap (e.g. a stablecoin).
    #[serde(rename = "tokenA")]
    pub token_a: Address,

    /// Token bought and staked.
    #[serde(rename = "tokenB")]
    pub token_b: Address,
}

/// Startup configuration for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub network: NetworkDescriptor,

    pub contracts: ContractAddresses,

    /// Percentage shaved off the quoted swap output to get the minimum
    /// accepted output.
    #[serde(rename = "slippagePct")]
    #[serde(default = "default_slippage")]
    pub slippage_pct: u8,

    #[serde(rename = "defaultDecimals")]
    #[serde(default = "default_decimals")]
    pub default_decimals: u8,

    /// Switch networks as part of `connect()` instead of stopping in
    /// `WrongNetwork`.
    #[serde(rename = "autoSwitch")]
    #[serde(default = "default_auto_switch")]
    pub auto_switch: bool,
}

fn default_slippage() -> u8 {
    5
}

fn default_decimals() -> u8 {
    DEFAULT_DECIMALS
}

fn default_auto_switch() -> bool {
    true
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("slippage must be below 100%, got {0}%")]
    Slippage(u8),
}

impl SessionConfig {
    pub fn new(network: NetworkDescriptor, contracts: ContractAddresses) -> Self {
        Self {
            network,
            contracts,
            slippage_pct: default_slippage(),
            default_decimals: default_decimals(),
            auto_switch: default_auto_switch(),
        }
    }

    /// Parse and validate a configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.slippage_pct >= 100 {
            return Err(ConfigError::Slippage(self.slippage_pct));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainId;

    fn config_json(extra: &str) -> String {
        format!(
            r#"{{
                "network": {{
                    "chainId": "0x38",
                    "chainName": "Binance Smart Chain Mainnet",
                    "nativeCurrency": {{ "name": "BNB", "symbol": "BNB", "decimals": 18 }},
                    "rpcUrls": ["https://bsc-dataseed.binance.org/"],
                    "blockExplorerUrls": ["https://bscscan.com/"]
                }},
                "contracts": {{
                    "staking": "0x0000000000000000000000000000000000000001",
                    "router": "0x10ed43c718714eb63d5aa57b78b54704e256024e",
                    "tokenA": "0x55d398326f99059ff775485246999027b3197955",
                    "tokenB": "0x0000000000000000000000000000000000000004"
                }}{extra}
            }}"#
        )
    }

    #[test]
    fn test_defaults_applied() {
        let config = SessionConfig::from_json(&config_json("")).unwrap();
        assert_eq!(config.network.chain_id, ChainId(56));
        assert_eq!(config.network, NetworkDescriptor::bsc_mainnet());
        assert_eq!(config.slippage_pct, 5);
        assert_eq!(config.default_decimals, 18);
        assert!(config.auto_switch);
    }

    #[test]
    fn test_overrides() {
        let config = SessionConfig::from_json(&config_json(
            r#", "slippagePct": 1, "autoSwitch": false"#,
        ))
        .unwrap();
        assert_eq!(config.slippage_pct, 1);
        assert!(!config.auto_switch);
    }

    #[test]
    fn test_rejects_full_slippage() {
        let err = SessionConfig::from_json(&config_json(r#", "slippagePct": 100"#)).unwrap_err();
        assert!(matches!(err, ConfigError::Slippage(100)));
    }

    #[test]
    fn test_rejects_bad_address() {
        let json = config_json("").replace(
            "0x0000000000000000000000000000000000000004",
            "0x04",
        );
        assert!(matches!(
            SessionConfig::from_json(&json),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_json_round_trip() {
        let config = SessionConfig::from_json(&config_json("")).unwrap();
        let back = SessionConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(back, config);
    }
}
