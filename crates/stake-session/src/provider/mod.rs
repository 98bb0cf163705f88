use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::abi;
use crate::address::Address;
use crate::chain::{ChainId, NetworkDescriptor};

#[cfg(feature = "http-provider")]
pub mod http;
pub mod scripted;

pub use scripted::{Method, Request, ScriptedProvider};

/// A raw error as reported by the wallet or RPC node.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("provider error {code}: {message}")]
pub struct ProviderError {
    pub code: i64,
    pub message: String,
    /// Revert payload, when the node returned one.
    pub data: Option<Vec<u8>>,
}

impl ProviderError {
    pub const USER_REJECTED: i64 = 4001;
    pub const UNAUTHORIZED: i64 = 4100;
    pub const UNRECOGNIZED_CHAIN: i64 = 4902;
    pub const RPC_ERROR: i64 = -32000;
    pub const INTERNAL_ERROR: i64 = -32603;

    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = Some(data);
        self
    }

    pub fn user_rejected() -> Self {
        Self::new(Self::USER_REJECTED, "User rejected the request.")
    }

    pub fn unrecognized_chain(chain_id: ChainId) -> Self {
        Self::new(
            Self::UNRECOGNIZED_CHAIN,
            format!("Unrecognized chain ID \"{chain_id}\"."),
        )
    }

    /// A contract revert carrying an ABI-encoded `Error(string)` reason.
    pub fn reverted(reason: &str) -> Self {
        Self::new(Self::INTERNAL_ERROR, "execution reverted")
            .with_data(abi::encode_revert_reason(reason))
    }

    pub fn is_user_rejection(&self) -> bool {
        self.code == Self::USER_REJECTED
            || self.message.contains("User denied")
            || self.message.contains("User rejected")
    }

    pub fn is_revert(&self) -> bool {
        self.message.contains("execution reverted")
            || self
                .data
                .as_deref()
                .is_some_and(|d| d.starts_with(&abi::ERROR_STRING_SELECTOR))
    }

    /// The contract-supplied revert reason, when one can be extracted.
    pub fn revert_reason(&self) -> Option<String> {
        if let Some(reason) = reason_after(&self.message, "revert: ") {
            return Some(reason);
        }
        if let Some(reason) = self.data.as_deref().and_then(abi::decode_revert_reason) {
            return Some(reason);
        }
        reason_after(&self.message, "execution reverted: ")
    }
}

/// Text following `marker` up to the next `,` or `}`.
fn reason_after(message: &str, marker: &str) -> Option<String> {
    let start = message.find(marker)? + marker.len();
    let rest = &message[start..];
    let end = rest.find([',', '}']).unwrap_or(rest.len());
    let reason = rest[..end].trim();
    (!reason.is_empty()).then(|| reason.to_string())
}

/// Hash of a submitted transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxHash(pub [u8; 32]);

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl FromStr for TxHash {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix("0x").unwrap_or(s);
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(digits, &mut bytes).map_err(|e| {
            ProviderError::new(ProviderError::INTERNAL_ERROR, format!("bad tx hash {s:?}: {e}"))
        })?;
        Ok(TxHash(bytes))
    }
}

/// A mined transaction's outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub transaction_hash: TxHash,
    pub status: bool,
    pub block_number: Option<u64>,
}

/// A state-changing contract call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRequest {
    pub from: Address,
    pub to: Address,
    pub data: Vec<u8>,
}

/// Asynchronous notifications from the wallet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    AccountsChanged(Vec<Address>),
    ChainChanged(ChainId),
}

pub type EventSender = mpsc::UnboundedSender<ProviderEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<ProviderEvent>;

/// Channel over which a provider adapter forwards wallet events.
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Everything the session needs from an injected wallet.
///
/// Every method is a suspension point; none is retried by the caller.
#[async_trait]
pub trait ChainProvider: Send + Sync {
    /// Prompt the user for account access (`eth_requestAccounts`).
    async fn request_accounts(&self) -> Result<Vec<Address>, ProviderError>;

    /// Currently exposed accounts, without prompting (`eth_accounts`).
    async fn accounts(&self) -> Result<Vec<Address>, ProviderError>;

    async fn chain_id(&self) -> Result<ChainId, ProviderError>;

    /// `wallet_switchEthereumChain`. Fails with code 4902 when the
    /// wallet does not know the chain.
    async fn switch_chain(&self, chain_id: ChainId) -> Result<(), ProviderError>;

    /// `wallet_addEthereumChain`.
    async fn add_chain(&self, network: &NetworkDescriptor) -> Result<(), ProviderError>;

    /// Read-only contract call (`eth_call` at the latest block).
    async fn call(&self, to: Address, data: Vec<u8>) -> Result<Vec<u8>, ProviderError>;

    async fn send_transaction(&self, tx: TransactionRequest) -> Result<TxHash, ProviderError>;

    async fn transaction_receipt(&self, hash: TxHash) -> Result<Option<Receipt>, ProviderError>;
}
