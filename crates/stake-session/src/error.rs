use thiserror::Error;

use crate::provider::ProviderError;
use crate::session::SessionState;

/// Unified error type surfaced at every session operation boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("no wallet provider detected")]
    NoProvider,

    #[error("request rejected by user")]
    UserRejected,

    #[error("wallet refused to switch network: {0}")]
    NetworkSwitchRejected(String),

    #[error("wallet refused to add network: {0}")]
    NetworkAddRejected(String),

    #[error("wallet is not connected")]
    NotConnected,

    #[error("a connection attempt is already in progress")]
    ConnectInProgress,

    #[error("wallet disconnected while the connection was being set up")]
    ConnectionSuperseded,

    #[error("operation not allowed in state {0:?}")]
    UnexpectedState(SessionState),

    #[error("invalid amount: {0}")]
    InvalidAmountFormat(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("insufficient allowance: required {required}, current {current}")]
    InsufficientAllowance { required: String, current: String },

    #[error("contract call failed: {0}")]
    ContractCallFailed(String),

    #[error("{}", revert_message(.reason))]
    TransactionReverted { reason: Option<String> },

    #[error("transaction failed: {0}")]
    TransactionFailed(String),
}

fn revert_message(reason: &Option<String>) -> String {
    match reason {
        Some(reason) => format!("transaction reverted: {reason}"),
        None => "transaction failed on the contract (possibly slippage or an unmet condition)"
            .to_string(),
    }
}

/// Errors while decoding ABI-encoded return data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("return data too short: expected at least {expected} bytes, got {actual}")]
    DataTooShort { expected: usize, actual: usize },

    #[error("invalid ABI encoding: {0}")]
    InvalidEncoding(String),

    #[error("value out of range: {0}")]
    OutOfRange(String),
}

impl From<DecodeError> for Error {
    fn from(err: DecodeError) -> Self {
        Error::ContractCallFailed(err.to_string())
    }
}

impl Error {
    /// Classify a provider failure from a read-only call.
    pub fn from_read(err: ProviderError) -> Self {
        if err.is_user_rejection() {
            return Error::UserRejected;
        }
        if let Some(reason) = err.revert_reason() {
            return Error::ContractCallFailed(format!("execution reverted: {reason}"));
        }
        Error::ContractCallFailed(err.message)
    }

    /// Classify a provider failure from a state-changing call.
    pub fn from_send(err: ProviderError) -> Self {
        if err.is_user_rejection() {
            return Error::UserRejected;
        }
        if err.is_revert() {
            return Error::TransactionReverted {
                reason: err.revert_reason(),
            };
        }
        Error::TransactionFailed(friendly_hint(&err))
    }
}

fn friendly_hint(err: &ProviderError) -> String {
    let msg = err.message.as_str();
    if msg.contains("gas required exceeds allowance") {
        "not enough gas or gas limit too low".to_string()
    } else if msg.contains("insufficient funds for gas") {
        "native balance too low to pay for gas".to_string()
    } else if msg.contains("missing trie node") {
        "node data incomplete, retry or change the wallet RPC endpoint".to_string()
    } else if msg.contains("was not mined within 50 blocks") {
        "transaction pending too long, the network may be congested".to_string()
    } else if err.code == ProviderError::RPC_ERROR {
        format!("RPC error: {msg}")
    } else {
        msg.to_string()
    }
}
