use std::collections::HashMap;

use crate::address::Address;
use crate::chain::ChainId;
use crate::contracts::ContractBindings;
use crate::error::Error;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Disconnected,
    Connecting,
    WrongNetwork,
    Switching,
    Ready,
    Failed,
}

/// Decimal count discovered for one token during a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecimalSpec {
    pub decimals: u8,
    /// Set when `decimals()` could not be read and the default was used.
    pub fallback: bool,
}

/// One connected wallet for the lifetime of a page view. Never persisted.
#[derive(Debug, Clone)]
pub struct Session {
    state: SessionState,
    active_address: Option<Address>,
    active_chain_id: Option<ChainId>,
    bindings: Option<ContractBindings>,
    decimal_cache: HashMap<Address, DecimalSpec>,
    last_error: Option<Error>,
    // Bumped by every handshake start and every wallet disconnect.
    generation: u64,
}

/// Read-only copy of a session handed to the display surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub active_address: Option<Address>,
    pub active_chain_id: Option<ChainId>,
    pub decimals: HashMap<Address, DecimalSpec>,
    pub last_error: Option<Error>,
}

/// Everything a money operation needs, copied out of a `Ready` session.
#[derive(Clone)]
pub(crate) struct ReadyView {
    pub address: Address,
    pub bindings: ContractBindings,
    pub token_a_decimals: u8,
    pub token_b_decimals: u8,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            state: SessionState::Disconnected,
            active_address: None,
            active_chain_id: None,
            bindings: None,
            decimal_cache: HashMap::new(),
            last_error: None,
            generation: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn active_address(&self) -> Option<Address> {
        self.active_address
    }

    pub fn active_chain_id(&self) -> Option<ChainId> {
        self.active_chain_id
    }

    pub fn decimals_of(&self, token: &Address) -> Option<DecimalSpec> {
        self.decimal_cache.get(token).copied()
    }

    pub(crate) fn transition(&mut self, next: SessionState) {
        if self.state != next {
            log::debug!("session {:?} -> {:?}", self.state, next);
        }
        self.state = next;
    }

    /// Drop bindings and identity, keeping nothing from the old connection.
    pub(crate) fn clear(&mut self, next: SessionState) {
        self.active_address = None;
        self.active_chain_id = None;
        self.bindings = None;
        self.decimal_cache.clear();
        self.transition(next);
    }

    /// Identifies the handshake that last touched this session.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Start a handshake and return its generation.
    pub(crate) fn begin_connect(&mut self) -> u64 {
        self.generation += 1;
        self.last_error = None;
        self.clear(SessionState::Connecting);
        self.generation
    }

    /// The wallet revoked every account. Any handshake in flight is
    /// superseded.
    pub(crate) fn disconnect(&mut self) {
        self.generation += 1;
        self.last_error = None;
        self.clear(SessionState::Disconnected);
    }

    pub(crate) fn observe(&mut self, address: Option<Address>, chain_id: Option<ChainId>) {
        self.active_address = address;
        self.active_chain_id = chain_id;
    }

    pub(crate) fn fail(&mut self, error: Error) {
        self.clear(SessionState::Failed);
        self.last_error = Some(error);
    }

    /// Install a fresh set of bindings and decimals wholesale.
    pub(crate) fn commit(
        &mut self,
        address: Address,
        chain_id: ChainId,
        bindings: ContractBindings,
        decimal_cache: HashMap<Address, DecimalSpec>,
    ) {
        self.active_address = Some(address);
        self.active_chain_id = Some(chain_id);
        self.bindings = Some(bindings);
        self.decimal_cache = decimal_cache;
        self.last_error = None;
        self.transition(SessionState::Ready);
    }

    pub(crate) fn ready_view(&self) -> Result<ReadyView, Error> {
        let (SessionState::Ready, Some(address), Some(bindings)) =
            (self.state, self.active_address, self.bindings.as_ref())
        else {
            return Err(Error::NotConnected);
        };
        let decimals = |token: Address| {
            self.decimal_cache
                .get(&token)
                .map(|spec| spec.decimals)
                .ok_or(Error::NotConnected)
        };
        Ok(ReadyView {
            address,
            bindings: bindings.clone(),
            token_a_decimals: decimals(bindings.token_a.address())?,
            token_b_decimals: decimals(bindings.token_b.address())?,
        })
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            active_address: self.active_address,
            active_chain_id: self.active_chain_id,
            decimals: self.decimal_cache.clone(),
            last_error: self.last_error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::ContractAddresses;
    use crate::provider::ScriptedProvider;

    fn addr(last: u8) -> Address {
        let mut bytes = [0u8; 20];
        bytes[19] = last;
        Address(bytes)
    }

    fn bindings() -> ContractBindings {
        let provider = Arc::new(ScriptedProvider::new(ChainId(56), vec![]));
        ContractBindings::bind(
            provider,
            &ContractAddresses {
                staking: addr(1),
                router: addr(2),
                token_a: addr(3),
                token_b: addr(4),
            },
        )
    }

    fn decimals() -> HashMap<Address, DecimalSpec> {
        HashMap::from([
            (addr(3), DecimalSpec { decimals: 18, fallback: false }),
            (addr(4), DecimalSpec { decimals: 6, fallback: true }),
        ])
    }

    #[test]
    fn test_new_session_is_disconnected() {
        let session = Session::new();
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(matches!(session.ready_view(), Err(Error::NotConnected)));
    }

    #[test]
    fn test_commit_then_clear() {
        let mut session = Session::new();
        session.begin_connect();
        session.commit(addr(7), ChainId(56), bindings(), decimals());

        let view = session.ready_view().unwrap();
        assert_eq!(view.address, addr(7));
        assert_eq!(view.token_a_decimals, 18);
        assert_eq!(view.token_b_decimals, 6);
        assert!(session.decimals_of(&addr(4)).unwrap().fallback);

        session.clear(SessionState::Disconnected);
        let snapshot = session.snapshot();
        assert_eq!(snapshot.state, SessionState::Disconnected);
        assert_eq!(snapshot.active_address, None);
        assert!(snapshot.decimals.is_empty());
        assert!(matches!(session.ready_view(), Err(Error::NotConnected)));
    }

    #[test]
    fn test_failure_records_error() {
        let mut session = Session::new();
        session.begin_connect();
        session.fail(Error::UserRejected);
        let snapshot = session.snapshot();
        assert_eq!(snapshot.state, SessionState::Failed);
        assert_eq!(snapshot.last_error, Some(Error::UserRejected));

        session.begin_connect();
        assert_eq!(session.snapshot().last_error, None);
    }

    #[test]
    fn test_disconnect_supersedes_handshake() {
        let mut session = Session::new();
        let generation = session.begin_connect();
        session.disconnect();
        assert_ne!(session.generation(), generation);
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(session.begin_connect() > generation);
    }
}
