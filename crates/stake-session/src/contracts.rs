use std::sync::Arc;

use async_trait::async_trait;

use crate::abi::{self, Token};
use crate::address::Address;
use crate::config::ContractAddresses;
use crate::error::Error;
use crate::provider::{ChainProvider, TransactionRequest, TxHash};
use crate::units::TokenAmount;

/// Canonical signatures of every function this crate calls.
pub mod signatures {
    pub const DECIMALS: &str = "decimals()";
    pub const ALLOWANCE: &str = "allowance(address,address)";
    pub const APPROVE: &str = "approve(address,uint256)";
    pub const GET_AMOUNTS_OUT: &str = "getAmountsOut(uint256,address[])";
    pub const SET_REFERRER: &str = "setReferrer(address)";
    pub const BUY_AND_STAKE: &str = "buyAndStake(uint256,uint256)";
    pub const STAKED_AMOUNT: &str = "stakedAmount(address)";
    pub const LAST_STAKE_TIME: &str = "lastStakeTime(address)";
    pub const STAKE_DURATION: &str = "STAKE_DURATION()";
    pub const LAST_CLAIM: &str = "lastClaim(address)";
    pub const CLAIM_INTERVAL: &str = "CLAIM_INTERVAL()";
    pub const CLAIM_STAKING_REWARD: &str = "claimStakingReward()";
}

use signatures::*;

#[async_trait]
pub trait TokenContract: Send + Sync {
    fn address(&self) -> Address;
    async fn decimals(&self) -> Result<u8, Error>;
    async fn allowance(&self, owner: Address, spender: Address) -> Result<TokenAmount, Error>;
    async fn approve(&self, from: Address, spender: Address, amount: &TokenAmount)
        -> Result<TxHash, Error>;
}

#[async_trait]
pub trait RouterContract: Send + Sync {
    fn address(&self) -> Address;
    async fn get_amounts_out(
        &self,
        amount_in: &TokenAmount,
        path: &[Address],
    ) -> Result<Vec<TokenAmount>, Error>;
}

#[async_trait]
pub trait StakingContract: Send + Sync {
    fn address(&self) -> Address;
    async fn set_referrer(&self, from: Address, referrer: Address) -> Result<TxHash, Error>;
    async fn buy_and_stake(
        &self,
        from: Address,
        amount_in: &TokenAmount,
        min_out: &TokenAmount,
    ) -> Result<TxHash, Error>;
    async fn staked_amount(&self, user: Address) -> Result<TokenAmount, Error>;
    async fn last_stake_time(&self, user: Address) -> Result<TokenAmount, Error>;
    async fn stake_duration(&self) -> Result<TokenAmount, Error>;
    async fn last_claim(&self, user: Address) -> Result<TokenAmount, Error>;
    async fn claim_interval(&self) -> Result<TokenAmount, Error>;
    async fn claim_staking_reward(&self, from: Address) -> Result<TxHash, Error>;
}

/// A contract address plus the provider used to reach it.
#[derive(Clone)]
struct Handle {
    provider: Arc<dyn ChainProvider>,
    address: Address,
}

impl Handle {
    async fn read(&self, signature: &str, args: &[Token]) -> Result<Vec<u8>, Error> {
        let data = abi::encode_call(signature, args)?;
        log::debug!("eth_call {signature} on {}", self.address);
        self.provider
            .call(self.address, data)
            .await
            .map_err(Error::from_read)
    }

    async fn read_uint(&self, signature: &str, args: &[Token]) -> Result<TokenAmount, Error> {
        let out = self.read(signature, args).await?;
        Ok(abi::decode_uint(&out)?)
    }

    async fn send(&self, from: Address, signature: &str, args: &[Token]) -> Result<TxHash, Error> {
        let data = abi::encode_call(signature, args)?;
        log::debug!("sending {signature} to {} from {from}", self.address);
        let tx = TransactionRequest {
            from,
            to: self.address,
            data,
        };
        self.provider
            .send_transaction(tx)
            .await
            .map_err(Error::from_send)
    }
}

/// ERC-20 adapter.
#[derive(Clone)]
pub struct Erc20(Handle);

impl Erc20 {
    pub fn new(provider: Arc<dyn ChainProvider>, address: Address) -> Self {
        Self(Handle { provider, address })
    }
}

#[async_trait]
impl TokenContract for Erc20 {
    fn address(&self) -> Address {
        self.0.address
    }

    async fn decimals(&self) -> Result<u8, Error> {
        let out = self.0.read(DECIMALS, &[]).await?;
        Ok(abi::decode_u8(&out)?)
    }

    async fn allowance(&self, owner: Address, spender: Address) -> Result<TokenAmount, Error> {
        self.0
            .read_uint(ALLOWANCE, &[Token::Address(owner), Token::Address(spender)])
            .await
    }

    async fn approve(
        &self,
        from: Address,
        spender: Address,
        amount: &TokenAmount,
    ) -> Result<TxHash, Error> {
        self.0
            .send(
                from,
                APPROVE,
                &[Token::Address(spender), Token::Uint(amount.clone())],
            )
            .await
    }
}

/// Uniswap-V2-style router adapter.
#[derive(Clone)]
pub struct Router(Handle);

impl Router {
    pub fn new(provider: Arc<dyn ChainProvider>, address: Address) -> Self {
        Self(Handle { provider, address })
    }
}

#[async_trait]
impl RouterContract for Router {
    fn address(&self) -> Address {
        self.0.address
    }

    async fn get_amounts_out(
        &self,
        amount_in: &TokenAmount,
        path: &[Address],
    ) -> Result<Vec<TokenAmount>, Error> {
        let out = self
            .0
            .read(
                GET_AMOUNTS_OUT,
                &[Token::Uint(amount_in.clone()), Token::AddressArray(path.to_vec())],
            )
            .await?;
        Ok(abi::decode_uint_array(&out)?)
    }
}

/// Staking contract adapter.
#[derive(Clone)]
pub struct Staking(Handle);

impl Staking {
    pub fn new(provider: Arc<dyn ChainProvider>, address: Address) -> Self {
        Self(Handle { provider, address })
    }
}

#[async_trait]
impl StakingContract for Staking {
    fn address(&self) -> Address {
        self.0.address
    }

    async fn set_referrer(&self, from: Address, referrer: Address) -> Result<TxHash, Error> {
        self.0
            .send(from, SET_REFERRER, &[Token::Address(referrer)])
            .await
    }

    async fn buy_and_stake(
        &self,
        from: Address,
        amount_in: &TokenAmount,
        min_out: &TokenAmount,
    ) -> Result<TxHash, Error> {
        self.0
            .send(
                from,
                BUY_AND_STAKE,
                &[Token::Uint(amount_in.clone()), Token::Uint(min_out.clone())],
            )
            .await
    }

    async fn staked_amount(&self, user: Address) -> Result<TokenAmount, Error> {
        self.0.read_uint(STAKED_AMOUNT, &[Token::Address(user)]).await
    }

    async fn last_stake_time(&self, user: Address) -> Result<TokenAmount, Error> {
        self.0.read_uint(LAST_STAKE_TIME, &[Token::Address(user)]).await
    }

    async fn stake_duration(&self) -> Result<TokenAmount, Error> {
        self.0.read_uint(STAKE_DURATION, &[]).await
    }

    async fn last_claim(&self, user: Address) -> Result<TokenAmount, Error> {
        self.0.read_uint(LAST_CLAIM, &[Token::Address(user)]).await
    }

    async fn claim_interval(&self) -> Result<TokenAmount, Error> {
        self.0.read_uint(CLAIM_INTERVAL, &[]).await
    }

    async fn claim_staking_reward(&self, from: Address) -> Result<TxHash, Error> {
        self.0.send(from, CLAIM_STAKING_REWARD, &[]).await
    }
}

/// The four contract handles of one connection.
#[derive(Clone)]
pub struct ContractBindings {
    pub staking: Arc<dyn StakingContract>,
    pub router: Arc<dyn RouterContract>,
    pub token_a: Arc<dyn TokenContract>,
    pub token_b: Arc<dyn TokenContract>,
}

impl ContractBindings {
    pub fn bind(provider: Arc<dyn ChainProvider>, addresses: &ContractAddresses) -> Self {
        Self {
            staking: Arc::new(Staking::new(provider.clone(), addresses.staking)),
            router: Arc::new(Router::new(provider.clone(), addresses.router)),
            token_a: Arc::new(Erc20::new(provider.clone(), addresses.token_a)),
            token_b: Arc::new(Erc20::new(provider, addresses.token_b)),
        }
    }

    /// Swap path from the paid token to the staked token.
    pub fn swap_path(&self) -> [Address; 2] {
        [self.token_a.address(), self.token_b.address()]
    }
}

impl std::fmt::Debug for ContractBindings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContractBindings")
            .field("staking", &self.staking.address())
            .field("router", &self.router.address())
            .field("token_a", &self.token_a.address())
            .field("token_b", &self.token_b.address())
            .finish()
    }
}
