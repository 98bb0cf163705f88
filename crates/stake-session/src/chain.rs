use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A chain identifier, written as a `0x`-prefixed lowercase hex
/// quantity (e.g. `0x38` for BNB Smart Chain).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChainId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid chain id: {0:?}")]
pub struct ChainIdParseError(pub String);

impl FromStr for ChainId {
    type Err = ChainIdParseError;

    /// Accepts hex quantities (`0x38`) as providers report them, and
    /// plain decimal strings.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(digits) if !digits.is_empty() => u64::from_str_radix(digits, 16),
            Some(_) => return Err(ChainIdParseError(s.to_string())),
            None => s.parse::<u64>(),
        };
        parsed
            .map(ChainId)
            .map_err(|_| ChainIdParseError(s.to_string()))
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl Serialize for ChainId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ChainId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(u64),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
            Raw::Number(n) => Ok(ChainId(n)),
        }
    }
}

/// Native currency of a network, as `wallet_addEthereumChain` expects it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeCurrency {
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
}

/// Everything a wallet needs to add an unknown network.
///
/// Serializes to the exact parameter object of `wallet_addEthereumChain`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkDescriptor {
    #[serde(rename = "chainId")]
    pub chain_id: ChainId,

    #[serde(rename = "chainName")]
    pub chain_name: String,

    #[serde(rename = "nativeCurrency")]
    pub native_currency: NativeCurrency,

    #[serde(rename = "rpcUrls")]
    pub rpc_urls: Vec<String>,

    #[serde(rename = "blockExplorerUrls")]
    #[serde(default)]
    pub block_explorer_urls: Vec<String>,
}

impl NetworkDescriptor {
    pub fn bsc_mainnet() -> Self {
        Self {
            chain_id: ChainId(56),
            chain_name: "Binance Smart Chain Mainnet".to_string(),
            native_currency: NativeCurrency {
                name: "BNB".to_string(),
                symbol: "BNB".to_string(),
                decimals: 18,
            },
            rpc_urls: vec!["https://bsc-dataseed.binance.org/".to_string()],
            block_explorer_urls: vec!["https://bscscan.com/".to_string()],
        }
    }
}
