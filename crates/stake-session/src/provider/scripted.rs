use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{ChainProvider, ProviderError, Receipt, TransactionRequest, TxHash};
use crate::abi;
use crate::address::{keccak256, Address};
use crate::chain::{ChainId, NetworkDescriptor};
use crate::units::TokenAmount;

/// Provider methods, for scripting failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    RequestAccounts,
    Accounts,
    ChainId,
    SwitchChain,
    AddChain,
    Call,
    SendTransaction,
    TransactionReceipt,
}

/// A request as observed by [`ScriptedProvider`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    RequestAccounts,
    Accounts,
    ChainId,
    SwitchChain(ChainId),
    AddChain(ChainId),
    Call { to: Address, selector: [u8; 4] },
    Send { to: Address, selector: [u8; 4], data: Vec<u8> },
    Receipt(TxHash),
}

#[derive(Default)]
struct State {
    accounts: Vec<Address>,
    chain_id: Option<ChainId>,
    known_chains: HashSet<ChainId>,
    failures: HashMap<Method, ProviderError>,
    responses: HashMap<(Address, [u8; 4]), Result<Vec<u8>, ProviderError>>,
    send_failures: HashMap<[u8; 4], ProviderError>,
    receipt_status: Option<bool>,
    pending_polls: usize,
    sent: u64,
    log: Vec<Request>,
}

/// In-memory provider that answers contract reads by selector and
/// records every request it sees.
pub struct ScriptedProvider {
    state: Mutex<State>,
}

impl ScriptedProvider {
    /// A wallet on `chain_id` exposing `accounts`. The current chain is
    /// always known to it.
    pub fn new(chain_id: ChainId, accounts: Vec<Address>) -> Self {
        let mut known_chains = HashSet::new();
        known_chains.insert(chain_id);
        Self {
            state: Mutex::new(State {
                accounts,
                chain_id: Some(chain_id),
                known_chains,
                receipt_status: Some(true),
                ..State::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark a chain as one the wallet can switch to without adding it.
    pub fn know_chain(&self, chain_id: ChainId) {
        self.state().known_chains.insert(chain_id);
    }

    pub fn set_accounts(&self, accounts: Vec<Address>) {
        self.state().accounts = accounts;
    }

    pub fn set_chain(&self, chain_id: ChainId) {
        let mut state = self.state();
        state.known_chains.insert(chain_id);
        state.chain_id = Some(chain_id);
    }

    /// Answer `signature` calls to `to` with raw return data.
    pub fn respond(&self, to: Address, signature: &str, data: Vec<u8>) {
        let selector = abi::selector_from_signature(signature);
        self.state().responses.insert((to, selector), Ok(data));
    }

    /// Answer `signature` calls to `to` with a single uint word.
    pub fn respond_uint(&self, to: Address, signature: &str, value: impl Into<TokenAmount>) {
        let word = value.into().to_word().map(|w| w.to_vec()).unwrap_or_default();
        self.respond(to, signature, word);
    }

    /// Answer `signature` calls to `to` with a `uint256[]`.
    pub fn respond_uint_array(&self, to: Address, signature: &str, values: &[TokenAmount]) {
        let data = abi::encode_uint_array(values).unwrap_or_default();
        self.respond(to, signature, data);
    }

    pub fn fail_call(&self, to: Address, signature: &str, err: ProviderError) {
        let selector = abi::selector_from_signature(signature);
        self.state().responses.insert((to, selector), Err(err));
    }

    pub fn fail_send(&self, signature: &str, err: ProviderError) {
        let selector = abi::selector_from_signature(signature);
        self.state().send_failures.insert(selector, err);
    }

    /// Fail every request of `method` until cleared.
    pub fn fail(&self, method: Method, err: ProviderError) {
        self.state().failures.insert(method, err);
    }

    pub fn clear_failure(&self, method: Method) {
        self.state().failures.remove(&method);
    }

    /// Status reported for mined transactions; `None` means pending.
    pub fn set_receipt_status(&self, status: Option<bool>) {
        self.state().receipt_status = status;
    }

    /// Report the next `polls` receipt queries as still pending.
    pub fn set_pending_polls(&self, polls: usize) {
        self.state().pending_polls = polls;
    }

    pub fn requests(&self) -> Vec<Request> {
        self.state().log.clone()
    }

    pub fn clear_requests(&self) {
        self.state().log.clear();
    }

    /// Number of recorded requests matching `pred`.
    pub fn count(&self, pred: impl Fn(&Request) -> bool) -> usize {
        self.state().log.iter().filter(|r| pred(r)).count()
    }

    /// Number of transactions sent with the given function signature.
    pub fn sends_of(&self, signature: &str) -> usize {
        let wanted = abi::selector_from_signature(signature);
        self.count(|r| matches!(r, Request::Send { selector, .. } if *selector == wanted))
    }

    fn begin(&self, method: Method, request: Request) -> Result<MutexGuard<'_, State>, ProviderError> {
        let mut state = self.state();
        state.log.push(request);
        if let Some(err) = state.failures.get(&method).cloned() {
            return Err(err);
        }
        Ok(state)
    }
}

fn selector_of(data: &[u8]) -> [u8; 4] {
    let mut selector = [0u8; 4];
    let n = data.len().min(4);
    selector[..n].copy_from_slice(&data[..n]);
    selector
}

#[async_trait]
impl ChainProvider for ScriptedProvider {
    async fn request_accounts(&self) -> Result<Vec<Address>, ProviderError> {
        let state = self.begin(Method::RequestAccounts, Request::RequestAccounts)?;
        Ok(state.accounts.clone())
    }

    async fn accounts(&self) -> Result<Vec<Address>, ProviderError> {
        let state = self.begin(Method::Accounts, Request::Accounts)?;
        Ok(state.accounts.clone())
    }

    async fn chain_id(&self) -> Result<ChainId, ProviderError> {
        let state = self.begin(Method::ChainId, Request::ChainId)?;
        state
            .chain_id
            .ok_or_else(|| ProviderError::new(ProviderError::INTERNAL_ERROR, "no chain"))
    }

    async fn switch_chain(&self, chain_id: ChainId) -> Result<(), ProviderError> {
        let mut state = self.begin(Method::SwitchChain, Request::SwitchChain(chain_id))?;
        if !state.known_chains.contains(&chain_id) {
            return Err(ProviderError::unrecognized_chain(chain_id));
        }
        state.chain_id = Some(chain_id);
        Ok(())
    }

    async fn add_chain(&self, network: &NetworkDescriptor) -> Result<(), ProviderError> {
        let mut state = self.begin(Method::AddChain, Request::AddChain(network.chain_id))?;
        state.known_chains.insert(network.chain_id);
        Ok(())
    }

    async fn call(&self, to: Address, data: Vec<u8>) -> Result<Vec<u8>, ProviderError> {
        let selector = selector_of(&data);
        let state = self.begin(Method::Call, Request::Call { to, selector })?;
        match state.responses.get(&(to, selector)) {
            Some(response) => response.clone(),
            None => Err(ProviderError::new(
                ProviderError::INTERNAL_ERROR,
                format!("no response scripted for 0x{} on {to}", hex::encode(selector)),
            )),
        }
    }

    async fn send_transaction(&self, tx: TransactionRequest) -> Result<TxHash, ProviderError> {
        let selector = selector_of(&tx.data);
        let mut state = self.begin(
            Method::SendTransaction,
            Request::Send {
                to: tx.to,
                selector,
                data: tx.data.clone(),
            },
        )?;
        if let Some(err) = state.send_failures.get(&selector) {
            return Err(err.clone());
        }
        state.sent += 1;
        Ok(TxHash(keccak256(&state.sent.to_be_bytes())))
    }

    async fn transaction_receipt(&self, hash: TxHash) -> Result<Option<Receipt>, ProviderError> {
        let mut state = self.begin(Method::TransactionReceipt, Request::Receipt(hash))?;
        if state.pending_polls > 0 {
            state.pending_polls -= 1;
            return Ok(None);
        }
        Ok(state.receipt_status.map(|status| Receipt {
            transaction_hash: hash,
            status,
            block_number: Some(state.sent),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8) -> Address {
        let mut bytes = [0u8; 20];
        bytes[19] = last;
        Address(bytes)
    }

    #[tokio::test]
    async fn test_unknown_chain_requires_add() {
        let provider = ScriptedProvider::new(ChainId(1), vec![addr(1)]);
        let err = provider.switch_chain(ChainId(56)).await.unwrap_err();
        assert_eq!(err.code, ProviderError::UNRECOGNIZED_CHAIN);

        provider.add_chain(&NetworkDescriptor::bsc_mainnet()).await.unwrap();
        provider.switch_chain(ChainId(56)).await.unwrap();
        assert_eq!(provider.chain_id().await.unwrap(), ChainId(56));
    }

    #[tokio::test]
    async fn test_call_dispatches_on_selector() {
        let provider = ScriptedProvider::new(ChainId(1), vec![]);
        provider.respond_uint(addr(9), "decimals()", 6u64);

        let data = abi::encode_call("decimals()", &[]).unwrap();
        let out = provider.call(addr(9), data.clone()).await.unwrap();
        assert_eq!(abi::decode_u8(&out).unwrap(), 6);

        assert!(provider.call(addr(8), data).await.is_err());
        assert_eq!(provider.count(|r| matches!(r, Request::Call { .. })), 2);
    }

    #[tokio::test]
    async fn test_pending_polls_count_down() {
        let provider = ScriptedProvider::new(ChainId(1), vec![]);
        let hash = TxHash([1u8; 32]);
        provider.set_pending_polls(1);
        assert_eq!(provider.transaction_receipt(hash).await.unwrap(), None);
        assert!(provider.transaction_receipt(hash).await.unwrap().unwrap().status);
    }

    #[tokio::test]
    async fn test_scripted_failure_is_recorded() {
        let provider = ScriptedProvider::new(ChainId(1), vec![]);
        provider.fail(Method::RequestAccounts, ProviderError::user_rejected());
        assert!(provider.request_accounts().await.is_err());
        assert_eq!(provider.requests(), vec![Request::RequestAccounts]);
    }
}
