use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use time::OffsetDateTime;

use crate::address::Address;
use crate::chain::ChainId;
use crate::config::SessionConfig;
use crate::contracts::{ContractBindings, TokenContract};
use crate::error::{DecodeError, Error};
use crate::provider::{ChainProvider, EventReceiver, ProviderError, ProviderEvent, TxHash};
use crate::referral;
use crate::session::{DecimalSpec, ReadyView, Session, SessionSnapshot, SessionState};
use crate::stake::{format_wait, BuyOutcome, ClaimOutcome, StakeInfo};
use crate::surface::{DisplaySurface, Operation};
use crate::units::{self, TokenAmount};

const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Owns the one [`Session`] and every transition it goes through.
pub struct SessionManager {
    provider: Option<Arc<dyn ChainProvider>>,
    config: SessionConfig,
    surface: Arc<dyn DisplaySurface>,
    session: Mutex<Session>,
    // Held for the whole of a connect/switch handshake.
    transition: tokio::sync::Mutex<()>,
}

impl SessionManager {
    /// `provider` is `None` when no wallet was detected.
    pub fn new(
        provider: Option<Arc<dyn ChainProvider>>,
        config: SessionConfig,
        surface: Arc<dyn DisplaySurface>,
    ) -> Self {
        Self {
            provider,
            config,
            surface,
            session: Mutex::new(Session::new()),
            transition: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.session().snapshot()
    }

    pub fn state(&self) -> SessionState {
        self.session().state()
    }

    /// Apply `f` to the session and push the result to the surface.
    fn update<R>(&self, f: impl FnOnce(&mut Session) -> R) -> R {
        let (value, snapshot) = {
            let mut session = self.session();
            let value = f(&mut session);
            (value, session.snapshot())
        };
        self.surface.session_changed(&snapshot);
        value
    }

    /// [`update`](Self::update), but only while handshake `generation`
    /// still owns the session.
    fn advance(&self, generation: u64, f: impl FnOnce(&mut Session)) -> Result<(), Error> {
        let snapshot = {
            let mut session = self.session();
            if session.generation() != generation {
                return Err(Error::ConnectionSuperseded);
            }
            f(&mut session);
            session.snapshot()
        };
        self.surface.session_changed(&snapshot);
        Ok(())
    }

    fn provider(&self) -> Result<Arc<dyn ChainProvider>, Error> {
        self.provider.clone().ok_or(Error::NoProvider)
    }

    fn ready(&self) -> Result<ReadyView, Error> {
        self.session().ready_view()
    }

    /// Connect the wallet and bring the session to `Ready`.
    ///
    /// Rejected with [`Error::ConnectInProgress`] while another handshake
    /// is running.
    pub async fn connect(&self) -> Result<SessionSnapshot, Error> {
        let _guard = self.transition.try_lock().map_err(|_| {
            log::warn!("connect rejected: handshake already in flight");
            Error::ConnectInProgress
        })?;
        let generation = self.update(Session::begin_connect);
        let result = self.negotiate(generation).await;
        self.finish(Operation::Connect, generation, result).await
    }

    /// Ask the wallet to move to the expected network. Only valid in
    /// `WrongNetwork`.
    pub async fn request_switch(&self) -> Result<SessionSnapshot, Error> {
        let _guard = self
            .transition
            .try_lock()
            .map_err(|_| Error::ConnectInProgress)?;
        let state = self.state();
        if state != SessionState::WrongNetwork {
            return Err(Error::UnexpectedState(state));
        }
        let generation = self.session().generation();
        let result = self.switch_network(generation).await;
        self.finish(Operation::SwitchNetwork, generation, result).await
    }

    async fn negotiate(&self, generation: u64) -> Result<(), Error> {
        let provider = self.provider()?;

        log::info!("requesting wallet accounts");
        let accounts = provider
            .request_accounts()
            .await
            .map_err(Error::from_read)?;
        let address = *accounts.first().ok_or(Error::UserRejected)?;

        let chain_id = provider.chain_id().await.map_err(Error::from_read)?;
        self.advance(generation, |s| s.observe(Some(address), Some(chain_id)))?;

        let expected = self.config.network.chain_id;
        if chain_id == expected {
            return self.bind_contracts(provider, generation, address, chain_id).await;
        }

        log::warn!("wrong network: on {chain_id}, expected {expected}");
        self.advance(generation, |s| s.transition(SessionState::WrongNetwork))?;
        if self.config.auto_switch {
            self.switch_network(generation).await
        } else {
            Ok(())
        }
    }

    async fn switch_network(&self, generation: u64) -> Result<(), Error> {
        let provider = self.provider()?;
        let expected = self.config.network.chain_id;
        self.advance(generation, |s| s.transition(SessionState::Switching))?;

        log::info!("switching wallet to {expected}");
        match provider.switch_chain(expected).await {
            Ok(()) => {}
            Err(err) if err.code == ProviderError::UNRECOGNIZED_CHAIN => {
                log::info!("wallet does not know {expected}, adding it");
                provider
                    .add_chain(&self.config.network)
                    .await
                    .map_err(|e| Error::NetworkAddRejected(e.message))?;
                provider
                    .switch_chain(expected)
                    .await
                    .map_err(|e| Error::NetworkSwitchRejected(e.message))?;
            }
            Err(err) => return Err(Error::NetworkSwitchRejected(err.message)),
        }

        let accounts = provider.accounts().await.map_err(Error::from_read)?;
        let address = *accounts.first().ok_or(Error::UserRejected)?;
        self.advance(generation, |s| s.observe(Some(address), Some(expected)))?;
        self.bind_contracts(provider, generation, address, expected).await
    }

    async fn bind_contracts(
        &self,
        provider: Arc<dyn ChainProvider>,
        generation: u64,
        address: Address,
        chain_id: ChainId,
    ) -> Result<(), Error> {
        let bindings = ContractBindings::bind(provider, &self.config.contracts);

        let mut decimal_cache = HashMap::new();
        for token in [&bindings.token_a, &bindings.token_b] {
            let spec = self.discover_decimals(token.as_ref()).await;
            decimal_cache.insert(token.address(), spec);
        }

        self.advance(generation, |s| s.commit(address, chain_id, bindings, decimal_cache))?;
        log::info!("session ready for {address} on {chain_id}");
        Ok(())
    }

    async fn discover_decimals(&self, token: &dyn TokenContract) -> DecimalSpec {
        match token.decimals().await {
            Ok(decimals) => DecimalSpec {
                decimals,
                fallback: false,
            },
            Err(err) => {
                let decimals = self.config.default_decimals;
                log::warn!(
                    "decimals() failed for {}, assuming {decimals}: {err}",
                    token.address()
                );
                DecimalSpec {
                    decimals,
                    fallback: true,
                }
            }
        }
    }

    async fn finish(
        &self,
        op: Operation,
        generation: u64,
        result: Result<(), Error>,
    ) -> Result<SessionSnapshot, Error> {
        if let Err(err) = result {
            // A superseded handshake must not overwrite the newer state.
            let err = match self.advance(generation, |s| s.fail(err.clone())) {
                Ok(()) => err,
                Err(superseded) => superseded,
            };
            log::error!("{op:?} failed: {err}");
            self.surface.operation_failed(op, &err);
            return Err(err);
        }

        let snapshot = self.snapshot();
        if let (SessionState::Ready, Some(address)) = (snapshot.state, snapshot.active_address) {
            self.surface
                .operation_succeeded(op, &format!("connected {address}"));
            // Best effort; failures are reported by the call itself.
            let _ = self.query_stake_info().await;
        }
        Ok(snapshot)
    }

    /// React to a wallet event.
    ///
    /// An empty account list disconnects at once, superseding any
    /// handshake in flight. Any other event renegotiates from scratch,
    /// queued behind an in-flight handshake. Bindings never survive an
    /// account or network change.
    pub async fn handle_event(&self, event: ProviderEvent) {
        log::info!("wallet event: {event:?}");

        match event {
            ProviderEvent::AccountsChanged(accounts) if accounts.is_empty() => {
                self.update(Session::disconnect);
            }
            ProviderEvent::AccountsChanged(_) | ProviderEvent::ChainChanged(_) => {
                let _guard = self.transition.lock().await;
                let generation = self.update(Session::begin_connect);
                let result = self.negotiate(generation).await;
                let _ = self.finish(Operation::Connect, generation, result).await;
            }
        }
    }

    /// Drain wallet events until the sending side closes.
    pub async fn run_events(&self, mut events: EventReceiver) {
        while let Some(event) = events.recv().await {
            self.handle_event(event).await;
        }
    }

    /// `base?ref=<connected address>`, or `None` unless `Ready`.
    pub fn referral_link(&self, base: &str) -> Option<String> {
        let view = self.ready().ok()?;
        Some(referral::referral_link(base, view.address))
    }

    fn report<T>(
        &self,
        op: Operation,
        result: Result<T, Error>,
        message: impl FnOnce(&T) -> String,
    ) -> Result<T, Error> {
        match &result {
            Ok(value) => self.surface.operation_succeeded(op, &message(value)),
            Err(err) => {
                log::error!("{op:?} failed: {err}");
                self.surface.operation_failed(op, err);
            }
        }
        result
    }

    /// Record `referrer` against the connected account.
    pub async fn register_referrer(&self, referrer: &str) -> Result<TxHash, Error> {
        let result = self.try_register_referrer(referrer).await;
        self.report(Operation::RegisterReferrer, result, |tx| {
            format!("referrer registered ({tx})")
        })
    }

    async fn try_register_referrer(&self, referrer: &str) -> Result<TxHash, Error> {
        let view = self.ready()?;
        let referrer: Address = referrer.trim().parse()?;
        if referrer == view.address {
            return Err(Error::InvalidAddress(
                "referrer cannot be your own address".to_string(),
            ));
        }

        let tx = view
            .bindings
            .staking
            .set_referrer(view.address, referrer)
            .await?;
        log::info!("setReferrer sent: {tx}");
        self.confirm(tx).await
    }

    /// Poll until `tx` is mined. There is no timeout.
    async fn confirm(&self, tx: TxHash) -> Result<TxHash, Error> {
        let provider = self.provider()?;
        loop {
            let receipt = provider
                .transaction_receipt(tx)
                .await
                .map_err(Error::from_read)?;
            match receipt {
                Some(receipt) if receipt.status => return Ok(tx),
                Some(_) => {
                    log::warn!("{tx} reverted");
                    return Err(Error::TransactionReverted { reason: None });
                }
                None => {
                    log::debug!("{tx} pending");
                    tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
                }
            }
        }
    }

    /// Swap `amount` of token A into token B and stake it.
    ///
    /// When the staking contract's allowance is short this only submits
    /// an approval for exactly the needed amount; call again once it is
    /// mined.
    pub async fn buy_and_stake(&self, amount: &str) -> Result<BuyOutcome, Error> {
        let result = self.try_buy_and_stake(amount).await;
        let staked = matches!(result, Ok(BuyOutcome::Staked { .. }));
        let result = self.report(Operation::BuyAndStake, result, |outcome| match outcome {
            BuyOutcome::ApprovalSubmitted { .. } => {
                "approval submitted, buy again once it is confirmed to stake".to_string()
            }
            BuyOutcome::Staked { tx, .. } => format!("bought and staked ({tx})"),
        });
        if staked {
            let _ = self.query_stake_info().await;
        }
        result
    }

    async fn try_buy_and_stake(&self, amount: &str) -> Result<BuyOutcome, Error> {
        let view = self.ready()?;
        let amount_in = units::to_base_units(amount.trim(), i32::from(view.token_a_decimals))?;
        if amount_in.is_zero() {
            return Err(Error::InvalidAmountFormat(
                "amount must be greater than zero".to_string(),
            ));
        }

        let path = view.bindings.swap_path();
        let amounts = view.bindings.router.get_amounts_out(&amount_in, &path).await?;
        let expected_out = amounts
            .last()
            .filter(|_| amounts.len() == path.len())
            .ok_or_else(|| DecodeError::InvalidEncoding(format!(
                "router returned {} amounts for a {}-token path",
                amounts.len(),
                path.len()
            )))?;
        let min_out = expected_out.with_slippage(self.config.slippage_pct);
        log::info!(
            "quote: {} in -> {} out, accepting at least {} ({}% slippage)",
            display(&amount_in, view.token_a_decimals),
            display(expected_out, view.token_b_decimals),
            display(&min_out, view.token_b_decimals),
            self.config.slippage_pct,
        );

        let staking = &view.bindings.staking;
        match self.check_allowance(&view, &amount_in).await {
            Ok(()) => {}
            Err(Error::InsufficientAllowance { required, current }) => {
                log::info!("allowance {current} below {required}, approving");
                let tx = view
                    .bindings
                    .token_a
                    .approve(view.address, staking.address(), &amount_in)
                    .await?;
                return Ok(BuyOutcome::ApprovalSubmitted {
                    tx,
                    amount: amount_in,
                });
            }
            Err(err) => return Err(err),
        }

        let tx = staking
            .buy_and_stake(view.address, &amount_in, &min_out)
            .await?;
        log::info!("buyAndStake sent: {tx}");
        let tx = self.confirm(tx).await?;
        Ok(BuyOutcome::Staked {
            tx,
            amount_in,
            min_out,
        })
    }

    async fn check_allowance(&self, view: &ReadyView, required: &TokenAmount) -> Result<(), Error> {
        let current = view
            .bindings
            .token_a
            .allowance(view.address, view.bindings.staking.address())
            .await?;
        if current < *required {
            return Err(Error::InsufficientAllowance {
                required: required.to_string(),
                current: current.to_string(),
            });
        }
        Ok(())
    }

    /// Claim the staking reward if the claim interval has elapsed.
    pub async fn claim_reward(&self) -> Result<ClaimOutcome, Error> {
        let result = self.try_claim_reward().await;
        let claimed = matches!(result, Ok(ClaimOutcome::Claimed { .. }));
        let result = self.report(Operation::ClaimReward, result, |outcome| match outcome {
            ClaimOutcome::Claimed { tx } => format!("reward claimed ({tx})"),
            ClaimOutcome::NotYet { remaining } => {
                format!("next claim in {}", format_wait(*remaining))
            }
        });
        if claimed {
            let _ = self.query_stake_info().await;
        }
        result
    }

    async fn try_claim_reward(&self) -> Result<ClaimOutcome, Error> {
        let view = self.ready()?;
        let staking = &view.bindings.staking;

        let last_claim = staking.last_claim(view.address).await?.to_u64()?;
        let interval = staking.claim_interval().await?.to_u64()?;
        let next_claim = last_claim.saturating_add(interval);
        let now = u64::try_from(OffsetDateTime::now_utc().unix_timestamp()).unwrap_or(0);

        if now < next_claim {
            let remaining = Duration::from_secs(next_claim - now);
            log::info!("claim not yet available, {} left", format_wait(remaining));
            return Ok(ClaimOutcome::NotYet { remaining });
        }

        let tx = staking.claim_staking_reward(view.address).await?;
        log::info!("claimStakingReward sent: {tx}");
        let tx = self.confirm(tx).await?;
        Ok(ClaimOutcome::Claimed { tx })
    }

    /// Read the connected account's stake and push it to the surface.
    pub async fn query_stake_info(&self) -> Result<StakeInfo, Error> {
        let result = self.try_query_stake_info().await;
        if let Ok(info) = &result {
            self.surface.stake_info_loaded(info);
        }
        self.report(Operation::LoadStakeInfo, result, |info| {
            format!("staked {}", info.staked_display)
        })
    }

    async fn try_query_stake_info(&self) -> Result<StakeInfo, Error> {
        let view = self.ready()?;
        let staking = &view.bindings.staking;

        let staked = staking.staked_amount(view.address).await?;
        let staked_at = staking.last_stake_time(view.address).await?;
        let duration = staking.stake_duration().await?;

        let staked_display = units::from_base_units(&staked, i32::from(view.token_b_decimals))?;
        StakeInfo::new(staked, staked_display, &staked_at, &duration)
    }
}

fn display(amount: &TokenAmount, decimals: u8) -> String {
    units::from_base_units(amount, i32::from(decimals)).unwrap_or_else(|_| amount.to_string())
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::*;
    use crate::chain::NetworkDescriptor;
    use crate::config::ContractAddresses;
    use crate::contracts::signatures::*;
    use crate::provider::{event_channel, Method, Receipt, Request, ScriptedProvider, TransactionRequest};
    use crate::surface::{RecordingSurface, SurfaceEvent};

    const BSC: ChainId = ChainId(56);

    fn addr(last: u8) -> Address {
        let mut bytes = [0u8; 20];
        bytes[19] = last;
        Address(bytes)
    }

    fn staking() -> Address {
        addr(1)
    }
    fn router() -> Address {
        addr(2)
    }
    fn token_a() -> Address {
        addr(3)
    }
    fn token_b() -> Address {
        addr(4)
    }
    fn user() -> Address {
        "0x5aaeb6053f3e94c9b9a09f33669435e7ef1beaed".parse().unwrap()
    }

    fn config() -> SessionConfig {
        SessionConfig::new(
            NetworkDescriptor::bsc_mainnet(),
            ContractAddresses {
                staking: staking(),
                router: router(),
                token_a: token_a(),
                token_b: token_b(),
            },
        )
    }

    /// A wallet on `chain` with every contract read scripted.
    fn scripted(chain: ChainId) -> Arc<ScriptedProvider> {
        let provider = Arc::new(ScriptedProvider::new(chain, vec![user()]));
        provider.respond_uint(token_a(), DECIMALS, 18u64);
        provider.respond_uint(token_b(), DECIMALS, 9u64);
        provider.respond_uint_array(
            router(),
            GET_AMOUNTS_OUT,
            &[TokenAmount::from(10u64), TokenAmount::from(1_000_000u64)],
        );
        provider.respond_uint(token_a(), ALLOWANCE, 0u64);
        provider.respond_uint(staking(), STAKED_AMOUNT, 1_500_000_000u64);
        provider.respond_uint(staking(), LAST_STAKE_TIME, 1_766_151_741u64);
        provider.respond_uint(staking(), STAKE_DURATION, 86_400u64);
        provider.respond_uint(staking(), LAST_CLAIM, 0u64);
        provider.respond_uint(staking(), CLAIM_INTERVAL, 86_400u64);
        provider
    }

    fn manager_with(
        provider: Arc<ScriptedProvider>,
        config: SessionConfig,
    ) -> (SessionManager, Arc<RecordingSurface>) {
        let surface = Arc::new(RecordingSurface::new());
        let manager = SessionManager::new(Some(provider), config, surface.clone());
        (manager, surface)
    }

    async fn ready(provider: &Arc<ScriptedProvider>) -> (SessionManager, Arc<RecordingSurface>) {
        let (manager, surface) = manager_with(provider.clone(), config());
        manager.connect().await.unwrap();
        assert_eq!(manager.state(), SessionState::Ready);
        provider.clear_requests();
        (manager, surface)
    }

    fn switches(provider: &ScriptedProvider) -> usize {
        provider.count(|r| matches!(r, Request::SwitchChain(_)))
    }

    fn adds(provider: &ScriptedProvider) -> usize {
        provider.count(|r| matches!(r, Request::AddChain(_)))
    }

    #[tokio::test]
    async fn test_connect_on_expected_network() {
        let provider = scripted(BSC);
        let (manager, surface) = manager_with(provider.clone(), config());

        let snapshot = manager.connect().await.unwrap();
        assert_eq!(snapshot.state, SessionState::Ready);
        assert_eq!(snapshot.active_address, Some(user()));
        assert_eq!(snapshot.active_chain_id, Some(BSC));
        assert_eq!(snapshot.decimals[&token_a()].decimals, 18);
        assert_eq!(snapshot.decimals[&token_b()].decimals, 9);
        assert_eq!(switches(&provider), 0);

        let states: Vec<SessionState> = surface
            .events()
            .into_iter()
            .filter_map(|e| match e {
                SurfaceEvent::SessionChanged(s) => Some(s.state),
                _ => None,
            })
            .collect();
        assert_eq!(states.first(), Some(&SessionState::Connecting));
        assert_eq!(states.last(), Some(&SessionState::Ready));

        // stake info is loaded right after connecting
        let info = surface
            .events()
            .into_iter()
            .find_map(|e| match e {
                SurfaceEvent::StakeInfo(info) => Some(info),
                _ => None,
            })
            .unwrap();
        assert_eq!(info.staked_display, "1.5");
    }

    #[tokio::test]
    async fn test_no_provider() {
        let surface = Arc::new(RecordingSurface::new());
        let manager = SessionManager::new(None, config(), surface.clone());
        assert_eq!(manager.connect().await.unwrap_err(), Error::NoProvider);
        assert_eq!(manager.state(), SessionState::Failed);
        assert_eq!(
            surface.failures(),
            vec![(Operation::Connect, Error::NoProvider)]
        );
    }

    #[tokio::test]
    async fn test_user_rejects_accounts() {
        let provider = scripted(BSC);
        provider.fail(Method::RequestAccounts, ProviderError::user_rejected());
        let (manager, _) = manager_with(provider, config());

        assert_eq!(manager.connect().await.unwrap_err(), Error::UserRejected);
        let snapshot = manager.snapshot();
        assert_eq!(snapshot.state, SessionState::Failed);
        assert_eq!(snapshot.last_error, Some(Error::UserRejected));
    }

    #[tokio::test]
    async fn test_network_mismatch_switches_once() {
        let provider = scripted(ChainId(1));
        provider.know_chain(BSC);
        let (manager, _) = manager_with(provider.clone(), config());

        let snapshot = manager.connect().await.unwrap();
        assert_eq!(snapshot.state, SessionState::Ready);
        assert_eq!(snapshot.active_chain_id, Some(BSC));
        assert_eq!(switches(&provider), 1);
        assert_eq!(adds(&provider), 0);
    }

    #[tokio::test]
    async fn test_unknown_network_is_added_then_switched() {
        let provider = scripted(ChainId(1));
        let (manager, _) = manager_with(provider.clone(), config());

        manager.connect().await.unwrap();
        assert_eq!(manager.state(), SessionState::Ready);
        assert_eq!(switches(&provider), 2);
        assert_eq!(adds(&provider), 1);
    }

    #[tokio::test]
    async fn test_add_network_rejected() {
        let provider = scripted(ChainId(1));
        provider.fail(Method::AddChain, ProviderError::user_rejected());
        let (manager, _) = manager_with(provider, config());

        assert!(matches!(
            manager.connect().await.unwrap_err(),
            Error::NetworkAddRejected(_)
        ));
        assert_eq!(manager.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn test_switch_rejected() {
        let provider = scripted(ChainId(1));
        provider.fail(Method::SwitchChain, ProviderError::user_rejected());
        let (manager, _) = manager_with(provider.clone(), config());

        assert!(matches!(
            manager.connect().await.unwrap_err(),
            Error::NetworkSwitchRejected(_)
        ));
        assert_eq!(adds(&provider), 0);
        assert_eq!(manager.snapshot().active_address, None);
    }

    #[tokio::test]
    async fn test_manual_switch_when_auto_switch_off() {
        let provider = scripted(ChainId(1));
        provider.know_chain(BSC);
        let mut config = config();
        config.auto_switch = false;
        let (manager, _) = manager_with(provider.clone(), config);

        let snapshot = manager.connect().await.unwrap();
        assert_eq!(snapshot.state, SessionState::WrongNetwork);
        assert_eq!(switches(&provider), 0);
        assert_eq!(
            manager.buy_and_stake("1").await.unwrap_err(),
            Error::NotConnected
        );

        let snapshot = manager.request_switch().await.unwrap();
        assert_eq!(snapshot.state, SessionState::Ready);
        assert_eq!(switches(&provider), 1);
    }

    #[tokio::test]
    async fn test_request_switch_outside_wrong_network() {
        let (manager, _) = manager_with(scripted(BSC), config());
        assert_eq!(
            manager.request_switch().await.unwrap_err(),
            Error::UnexpectedState(SessionState::Disconnected)
        );
    }

    #[tokio::test]
    async fn test_decimals_fall_back_to_default() {
        let provider = scripted(BSC);
        provider.fail_call(
            token_b(),
            DECIMALS,
            ProviderError::new(ProviderError::INTERNAL_ERROR, "execution reverted"),
        );
        let (manager, surface) = manager_with(provider, config());

        let snapshot = manager.connect().await.unwrap();
        assert_eq!(snapshot.state, SessionState::Ready);
        let spec = snapshot.decimals[&token_b()];
        assert_eq!(spec.decimals, 18);
        assert!(spec.fallback);
        assert!(!snapshot.decimals[&token_a()].fallback);
        assert!(surface
            .failures()
            .iter()
            .all(|(op, _)| *op != Operation::Connect));
    }

    #[tokio::test]
    async fn test_buy_while_disconnected_touches_nothing() {
        let provider = scripted(BSC);
        let (manager, surface) = manager_with(provider.clone(), config());

        assert_eq!(
            manager.buy_and_stake("10").await.unwrap_err(),
            Error::NotConnected
        );
        assert_eq!(
            manager.claim_reward().await.unwrap_err(),
            Error::NotConnected
        );
        assert_eq!(
            manager.register_referrer(&addr(0x88).to_string()).await.unwrap_err(),
            Error::NotConnected
        );
        assert_eq!(
            manager.query_stake_info().await.unwrap_err(),
            Error::NotConnected
        );
        assert!(provider.requests().is_empty());
        assert_eq!(
            surface.failures()[0],
            (Operation::BuyAndStake, Error::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_insufficient_allowance_only_approves() {
        let provider = scripted(BSC);
        let (manager, _) = ready(&provider).await;

        let outcome = manager.buy_and_stake("2.5").await.unwrap();
        let expected_amount = TokenAmount::from(2_500_000_000_000_000_000u128);
        assert!(matches!(
            &outcome,
            BuyOutcome::ApprovalSubmitted { amount, .. } if *amount == expected_amount
        ));
        assert_eq!(provider.sends_of(APPROVE), 1);
        assert_eq!(provider.sends_of(BUY_AND_STAKE), 0);

        // approval for exactly the input amount, to the staking contract
        let approve = provider
            .requests()
            .into_iter()
            .find_map(|r| match r {
                Request::Send { to, data, .. } if to == token_a() => Some(data),
                _ => None,
            })
            .unwrap();
        assert_eq!(&approve[4 + 12..4 + 32], staking().as_bytes());
        assert_eq!(
            TokenAmount::from_be_bytes(&approve[4 + 32..4 + 64]),
            expected_amount
        );

        // once the approval is mined the second attempt stakes
        provider.respond_uint(token_a(), ALLOWANCE, expected_amount.clone());
        let outcome = manager.buy_and_stake("2.5").await.unwrap();
        match outcome {
            BuyOutcome::Staked {
                amount_in, min_out, ..
            } => {
                assert_eq!(amount_in, expected_amount);
                assert_eq!(min_out, TokenAmount::from(950_000u64));
            }
            other => panic!("expected stake, got {other:?}"),
        }
        assert_eq!(provider.sends_of(APPROVE), 1);
        assert_eq!(provider.sends_of(BUY_AND_STAKE), 1);
    }

    #[tokio::test]
    async fn test_buy_rejects_bad_amounts() {
        let provider = scripted(BSC);
        let (manager, _) = ready(&provider).await;

        for bad in ["0", "0.000", "abc", "-1", "1,5"] {
            assert!(
                matches!(
                    manager.buy_and_stake(bad).await,
                    Err(Error::InvalidAmountFormat(_))
                ),
                "{bad:?} accepted"
            );
        }
        assert!(provider.requests().is_empty());
    }

    #[tokio::test]
    async fn test_stake_revert_is_reported() {
        let provider = scripted(BSC);
        provider.respond_uint(token_a(), ALLOWANCE, u64::MAX);
        provider.fail_send(BUY_AND_STAKE, ProviderError::reverted("Pancake: K"));
        let (manager, surface) = ready(&provider).await;

        let err = manager.buy_and_stake("1").await.unwrap_err();
        assert_eq!(
            err,
            Error::TransactionReverted {
                reason: Some("Pancake: K".to_string())
            }
        );
        assert_eq!(
            surface.failures().last(),
            Some(&(Operation::BuyAndStake, err))
        );
    }

    #[tokio::test]
    async fn test_self_referral_rejected() {
        let provider = scripted(BSC);
        let (manager, _) = ready(&provider).await;

        let own = user().to_lower_hex().to_uppercase().replacen("0X", "0x", 1);
        assert!(matches!(
            manager.register_referrer(&own).await,
            Err(Error::InvalidAddress(_))
        ));
        assert!(matches!(
            manager.register_referrer("not-an-address").await,
            Err(Error::InvalidAddress(_))
        ));
        assert_eq!(provider.sends_of(SET_REFERRER), 0);
    }

    #[tokio::test]
    async fn test_register_referrer() {
        let provider = scripted(BSC);
        let (manager, surface) = ready(&provider).await;

        let referrer = addr(0x88);
        manager
            .register_referrer(&format!(" {} ", referrer.to_lower_hex()))
            .await
            .unwrap();
        assert_eq!(provider.sends_of(SET_REFERRER), 1);
        assert_eq!(
            surface.successes().last().map(|(op, _)| *op),
            Some(Operation::RegisterReferrer)
        );

        provider.set_receipt_status(Some(false));
        assert_eq!(
            manager
                .register_referrer(&referrer.to_string())
                .await
                .unwrap_err(),
            Error::TransactionReverted { reason: None }
        );
    }

    #[tokio::test]
    async fn test_claim_when_due() {
        let provider = scripted(BSC);
        let (manager, _) = ready(&provider).await;

        let outcome = manager.claim_reward().await.unwrap();
        assert!(matches!(outcome, ClaimOutcome::Claimed { .. }));
        assert_eq!(provider.sends_of(CLAIM_STAKING_REWARD), 1);
    }

    #[tokio::test]
    async fn test_claim_too_early() {
        let provider = scripted(BSC);
        provider.respond_uint(staking(), LAST_CLAIM, u64::from(u32::MAX) * 2);
        let (manager, surface) = ready(&provider).await;

        let outcome = manager.claim_reward().await.unwrap();
        assert!(matches!(outcome, ClaimOutcome::NotYet { remaining } if remaining.as_secs() > 0));
        assert_eq!(provider.sends_of(CLAIM_STAKING_REWARD), 0);
        let (op, message) = surface.successes().pop().unwrap();
        assert_eq!(op, Operation::ClaimReward);
        assert!(message.starts_with("next claim in"));
    }

    #[tokio::test]
    async fn test_stake_info() {
        let provider = scripted(BSC);
        let (manager, _) = ready(&provider).await;

        let info = manager.query_stake_info().await.unwrap();
        assert_eq!(info.staked, TokenAmount::from(1_500_000_000u64));
        assert_eq!(info.staked_display, "1.5");
        assert_eq!(
            crate::stake::format_timestamp(info.matures_at),
            "2025-12-20 13:42:21 UTC"
        );
    }

    #[tokio::test]
    async fn test_accounts_removed_disconnects() {
        let provider = scripted(BSC);
        let (manager, _) = ready(&provider).await;
        assert!(manager.referral_link("https://example.org/").is_some());

        manager
            .handle_event(ProviderEvent::AccountsChanged(vec![]))
            .await;
        let snapshot = manager.snapshot();
        assert_eq!(snapshot.state, SessionState::Disconnected);
        assert_eq!(snapshot.active_address, None);
        assert!(snapshot.decimals.is_empty());
        assert_eq!(manager.referral_link("https://example.org/"), None);
        assert_eq!(
            manager.buy_and_stake("1").await.unwrap_err(),
            Error::NotConnected
        );
        assert!(provider.requests().is_empty());
    }

    #[tokio::test]
    async fn test_account_change_renegotiates() {
        let provider = scripted(BSC);
        let (manager, _) = ready(&provider).await;

        provider.set_accounts(vec![addr(0x99)]);
        manager
            .handle_event(ProviderEvent::AccountsChanged(vec![addr(0x99)]))
            .await;
        let snapshot = manager.snapshot();
        assert_eq!(snapshot.state, SessionState::Ready);
        assert_eq!(snapshot.active_address, Some(addr(0x99)));
        assert_eq!(provider.count(|r| *r == Request::RequestAccounts), 1);
    }

    #[tokio::test]
    async fn test_chain_change_via_event_channel() {
        let provider = scripted(BSC);
        let (manager, _) = ready(&provider).await;

        // wallet moved away from the expected network and now refuses to come back
        provider.set_chain(ChainId(97));
        provider.fail(Method::SwitchChain, ProviderError::user_rejected());

        let (tx, rx) = event_channel();
        tx.send(ProviderEvent::ChainChanged(ChainId(97))).unwrap();
        drop(tx);
        manager.run_events(rx).await;

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.state, SessionState::Failed);
        assert!(matches!(
            snapshot.last_error,
            Some(Error::NetworkSwitchRejected(_))
        ));
        assert_eq!(
            manager.claim_reward().await.unwrap_err(),
            Error::NotConnected
        );
    }

    #[tokio::test]
    async fn test_regrant_after_disconnect_reconnects() {
        let provider = scripted(BSC);
        let (manager, _) = ready(&provider).await;

        manager
            .handle_event(ProviderEvent::AccountsChanged(vec![]))
            .await;
        assert_eq!(manager.state(), SessionState::Disconnected);

        manager
            .handle_event(ProviderEvent::AccountsChanged(vec![user()]))
            .await;
        let snapshot = manager.snapshot();
        assert_eq!(snapshot.state, SessionState::Ready);
        assert_eq!(snapshot.active_address, Some(user()));
        assert_eq!(provider.count(|r| *r == Request::RequestAccounts), 1);
    }

    #[tokio::test]
    async fn test_chain_change_before_connect_negotiates() {
        let provider = scripted(BSC);
        let (manager, _) = manager_with(provider.clone(), config());
        manager
            .handle_event(ProviderEvent::ChainChanged(BSC))
            .await;
        assert_eq!(manager.state(), SessionState::Ready);
    }

    fn reads_of(provider: &ScriptedProvider, signature: &str) -> usize {
        let wanted = crate::abi::selector_from_signature(signature);
        provider.count(|r| matches!(r, Request::Call { selector, .. } if *selector == wanted))
    }

    fn receipts(provider: &ScriptedProvider) -> usize {
        provider.count(|r| matches!(r, Request::Receipt(_)))
    }

    #[tokio::test]
    async fn test_stake_reverted_after_mining() {
        let provider = scripted(BSC);
        provider.respond_uint(token_a(), ALLOWANCE, u64::MAX);
        let (manager, surface) = ready(&provider).await;
        provider.set_receipt_status(Some(false));

        let err = manager.buy_and_stake("1").await.unwrap_err();
        assert_eq!(err, Error::TransactionReverted { reason: None });
        assert_eq!(provider.sends_of(BUY_AND_STAKE), 1);
        assert_eq!(receipts(&provider), 1);
        assert_eq!(reads_of(&provider, STAKED_AMOUNT), 0);
        assert_eq!(
            surface.failures().last(),
            Some(&(Operation::BuyAndStake, err))
        );
    }

    #[tokio::test]
    async fn test_claim_reverted_after_mining() {
        let provider = scripted(BSC);
        let (manager, _) = ready(&provider).await;
        provider.set_receipt_status(Some(false));

        assert_eq!(
            manager.claim_reward().await.unwrap_err(),
            Error::TransactionReverted { reason: None }
        );
        assert_eq!(provider.sends_of(CLAIM_STAKING_REWARD), 1);
        assert_eq!(receipts(&provider), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_receipt_is_polled_until_mined() {
        let provider = scripted(BSC);
        let (manager, _) = ready(&provider).await;
        provider.set_pending_polls(3);

        manager
            .register_referrer(&addr(0x88).to_string())
            .await
            .unwrap();
        assert_eq!(receipts(&provider), 4);

        provider.set_pending_polls(2);
        provider.set_receipt_status(Some(false));
        assert_eq!(
            manager.claim_reward().await.unwrap_err(),
            Error::TransactionReverted { reason: None }
        );
        assert_eq!(receipts(&provider), 7);
    }

    /// Holds `request_accounts` until released.
    struct GatedProvider {
        inner: Arc<ScriptedProvider>,
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl ChainProvider for GatedProvider {
        async fn request_accounts(&self) -> Result<Vec<Address>, ProviderError> {
            self.gate.notified().await;
            self.inner.request_accounts().await
        }
        async fn accounts(&self) -> Result<Vec<Address>, ProviderError> {
            self.inner.accounts().await
        }
        async fn chain_id(&self) -> Result<ChainId, ProviderError> {
            self.inner.chain_id().await
        }
        async fn switch_chain(&self, chain_id: ChainId) -> Result<(), ProviderError> {
            self.inner.switch_chain(chain_id).await
        }
        async fn add_chain(&self, network: &NetworkDescriptor) -> Result<(), ProviderError> {
            self.inner.add_chain(network).await
        }
        async fn call(&self, to: Address, data: Vec<u8>) -> Result<Vec<u8>, ProviderError> {
            self.inner.call(to, data).await
        }
        async fn send_transaction(&self, tx: TransactionRequest) -> Result<TxHash, ProviderError> {
            self.inner.send_transaction(tx).await
        }
        async fn transaction_receipt(
            &self,
            hash: TxHash,
        ) -> Result<Option<Receipt>, ProviderError> {
            self.inner.transaction_receipt(hash).await
        }
    }

    #[tokio::test]
    async fn test_second_connect_rejected_while_in_flight() {
        let inner = scripted(BSC);
        let gate = Arc::new(Notify::new());
        let provider = Arc::new(GatedProvider {
            inner: inner.clone(),
            gate: gate.clone(),
        });
        let manager = SessionManager::new(
            Some(provider),
            config(),
            Arc::new(RecordingSurface::new()),
        );

        let (first, second) = tokio::join!(manager.connect(), async {
            while manager.state() != SessionState::Connecting {
                tokio::task::yield_now().await;
            }
            let second = manager.connect().await;
            gate.notify_one();
            second
        });

        assert_eq!(second.unwrap_err(), Error::ConnectInProgress);
        assert_eq!(first.unwrap().state, SessionState::Ready);
        assert_eq!(inner.count(|r| *r == Request::RequestAccounts), 1);
    }

    #[tokio::test]
    async fn test_disconnect_during_handshake_wins() {
        let inner = scripted(BSC);
        let gate = Arc::new(Notify::new());
        let provider = Arc::new(GatedProvider {
            inner: inner.clone(),
            gate: gate.clone(),
        });
        let manager = SessionManager::new(
            Some(provider),
            config(),
            Arc::new(RecordingSurface::new()),
        );

        let (connected, ()) = tokio::join!(manager.connect(), async {
            while manager.state() != SessionState::Connecting {
                tokio::task::yield_now().await;
            }
            // applied at once even though the handshake holds the guard
            manager
                .handle_event(ProviderEvent::AccountsChanged(vec![]))
                .await;
            assert_eq!(manager.state(), SessionState::Disconnected);
            gate.notify_one();
        });

        assert_eq!(connected.unwrap_err(), Error::ConnectionSuperseded);
        let snapshot = manager.snapshot();
        assert_eq!(snapshot.state, SessionState::Disconnected);
        assert_eq!(snapshot.active_address, None);
        assert!(snapshot.decimals.is_empty());
        assert_eq!(snapshot.last_error, None);
        assert_eq!(
            manager.buy_and_stake("1").await.unwrap_err(),
            Error::NotConnected
        );
    }
}
