use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{ChainProvider, ProviderError, Receipt, TransactionRequest, TxHash};
use crate::address::Address;
use crate::chain::{ChainId, NetworkDescriptor};

const TIMEOUT: Duration = Duration::from_secs(30);

/// Read-only provider over a plain JSON-RPC endpoint.
///
/// Anything that needs the user's signature fails with
/// [`ProviderError::UNAUTHORIZED`].
pub struct HttpProvider {
    client: reqwest::Client,
    rpc_url: String,
}

impl HttpProvider {
    pub fn new(rpc_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            rpc_url: rpc_url.into(),
        }
    }

    /// Use the first RPC URL of a network.
    pub fn for_network(network: &NetworkDescriptor) -> Option<Self> {
        network.rpc_urls.first().map(Self::new)
    }

    async fn rpc_call(&self, method: &str, params: Value) -> Result<Value, ProviderError> {
        let body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        });
        log::debug!("{method} -> {}", self.rpc_url);

        let resp = self
            .client
            .post(&self.rpc_url)
            .json(&body)
            .timeout(TIMEOUT)
            .send()
            .await
            .map_err(|e| transport(format!("RPC request failed: {e}")))?;

        let response: Value = resp
            .json()
            .await
            .map_err(|e| transport(format!("RPC response parse error: {e}")))?;

        parse_response(response)
    }

    fn unauthorized(method: &str) -> ProviderError {
        ProviderError::new(
            ProviderError::UNAUTHORIZED,
            format!("{method} needs a wallet; this provider is read-only"),
        )
    }
}

fn transport(message: String) -> ProviderError {
    ProviderError::new(ProviderError::INTERNAL_ERROR, message)
}

fn parse_response(mut response: Value) -> Result<Value, ProviderError> {
    if let Some(error) = response.get("error") {
        let code = error
            .get("code")
            .and_then(Value::as_i64)
            .unwrap_or(ProviderError::RPC_ERROR);
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown RPC error");
        let mut err = ProviderError::new(code, message);
        if let Some(data) = error.get("data").and_then(Value::as_str) {
            if let Ok(bytes) = decode_hex(data) {
                err = err.with_data(bytes);
            }
        }
        return Err(err);
    }

    response
        .get_mut("result")
        .map(Value::take)
        .ok_or_else(|| transport("RPC response missing 'result' field".to_string()))
}

fn decode_hex(s: &str) -> Result<Vec<u8>, ProviderError> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    hex::decode(digits).map_err(|e| transport(format!("invalid hex {s:?}: {e}")))
}

fn parse_quantity(value: &Value) -> Result<u64, ProviderError> {
    let s = value
        .as_str()
        .ok_or_else(|| transport(format!("expected hex quantity, got {value}")))?;
    u64::from_str_radix(s.strip_prefix("0x").unwrap_or(s), 16)
        .map_err(|e| transport(format!("invalid quantity {s:?}: {e}")))
}

fn parse_receipt(hash: TxHash, value: &Value) -> Result<Option<Receipt>, ProviderError> {
    if value.is_null() {
        return Ok(None);
    }
    let status = parse_quantity(value.get("status").unwrap_or(&Value::Null))?;
    let block_number = value
        .get("blockNumber")
        .filter(|v| !v.is_null())
        .map(parse_quantity)
        .transpose()?;
    Ok(Some(Receipt {
        transaction_hash: hash,
        status: status == 1,
        block_number,
    }))
}

#[async_trait]
impl ChainProvider for HttpProvider {
    async fn request_accounts(&self) -> Result<Vec<Address>, ProviderError> {
        Err(Self::unauthorized("eth_requestAccounts"))
    }

    async fn accounts(&self) -> Result<Vec<Address>, ProviderError> {
        Ok(Vec::new())
    }

    async fn chain_id(&self) -> Result<ChainId, ProviderError> {
        let result = self.rpc_call("eth_chainId", json!([])).await?;
        parse_quantity(&result).map(ChainId)
    }

    async fn switch_chain(&self, _chain_id: ChainId) -> Result<(), ProviderError> {
        Err(Self::unauthorized("wallet_switchEthereumChain"))
    }

    async fn add_chain(&self, _network: &NetworkDescriptor) -> Result<(), ProviderError> {
        Err(Self::unauthorized("wallet_addEthereumChain"))
    }

    async fn call(&self, to: Address, data: Vec<u8>) -> Result<Vec<u8>, ProviderError> {
        let result = self
            .rpc_call(
                "eth_call",
                json!([
                    { "to": to.to_lower_hex(), "data": format!("0x{}", hex::encode(data)) },
                    "latest"
                ]),
            )
            .await?;
        let s = result
            .as_str()
            .ok_or_else(|| transport("invalid eth_call result".to_string()))?;
        decode_hex(s)
    }

    async fn send_transaction(&self, _tx: TransactionRequest) -> Result<TxHash, ProviderError> {
        Err(Self::unauthorized("eth_sendTransaction"))
    }

    async fn transaction_receipt(&self, hash: TxHash) -> Result<Option<Receipt>, ProviderError> {
        let result = self
            .rpc_call("eth_getTransactionReceipt", json!([hash.to_string()]))
            .await?;
        parse_receipt(hash, &result)
    }
}
