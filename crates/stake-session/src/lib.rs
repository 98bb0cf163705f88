pub mod abi;
pub mod address;
pub mod chain;
pub mod config;
pub mod contracts;
pub mod error;
pub mod manager;
pub mod provider;
pub mod referral;
pub mod session;
pub mod stake;
pub mod surface;
pub mod units;

use std::sync::Arc;

// Re-exports for convenience
pub use address::Address;
pub use chain::{ChainId, NetworkDescriptor};
pub use config::{ConfigError, ContractAddresses, SessionConfig};
pub use error::Error;
pub use manager::SessionManager;
pub use provider::{ChainProvider, ProviderError, ProviderEvent, TxHash};
pub use session::{SessionSnapshot, SessionState};
pub use stake::{BuyOutcome, ClaimOutcome, StakeInfo};
pub use surface::{DisplaySurface, NullSurface, Operation};
pub use units::{from_base_units, to_base_units, TokenAmount};

/// Build a session manager from a JSON configuration.
///
/// `provider` is `None` when no wallet is available; `connect()` then
/// fails with [`Error::NoProvider`].
pub fn session_from_json(
    provider: Option<Arc<dyn ChainProvider>>,
    config_json: &str,
    surface: Arc<dyn DisplaySurface>,
) -> Result<SessionManager, ConfigError> {
    let config = SessionConfig::from_json(config_json)?;
    log::info!(
        "session configured for {} ({})",
        config.network.chain_name,
        config.network.chain_id
    );
    Ok(SessionManager::new(provider, config, surface))
}
