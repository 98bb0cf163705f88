use std::time::Duration;

use time::macros::format_description;
use time::OffsetDateTime;

use crate::error::{DecodeError, Error};
use crate::provider::TxHash;
use crate::units::TokenAmount;

/// The caller's position in the staking contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StakeInfo {
    pub staked: TokenAmount,
    /// `staked` rendered with the staked token's decimals.
    pub staked_display: String,
    pub staked_at: OffsetDateTime,
    pub matures_at: OffsetDateTime,
}

impl StakeInfo {
    pub(crate) fn new(
        staked: TokenAmount,
        staked_display: String,
        last_stake_time: &TokenAmount,
        stake_duration: &TokenAmount,
    ) -> Result<Self, Error> {
        let start = last_stake_time.to_u64()?;
        let end = start
            .checked_add(stake_duration.to_u64()?)
            .ok_or_else(|| DecodeError::OutOfRange("maturity overflows u64".to_string()))?;
        Ok(Self {
            staked,
            staked_display,
            staked_at: timestamp(start)?,
            matures_at: timestamp(end)?,
        })
    }
}

fn timestamp(secs: u64) -> Result<OffsetDateTime, Error> {
    let secs = i64::try_from(secs)
        .map_err(|_| DecodeError::OutOfRange(format!("timestamp {secs} exceeds i64")))?;
    OffsetDateTime::from_unix_timestamp(secs)
        .map_err(|e| DecodeError::OutOfRange(format!("invalid timestamp: {e}")).into())
}

/// Render a UTC timestamp as `YYYY-MM-DD HH:MM:SS UTC`.
pub fn format_timestamp(dt: OffsetDateTime) -> String {
    let format = format_description!("[year]-[month]-[day] [hour]:[minute]:[second] UTC");
    dt.format(&format)
        .unwrap_or_else(|_| dt.unix_timestamp().to_string())
}

/// Result of a buy-and-stake attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuyOutcome {
    /// Allowance was short; an approval for exactly `amount` was
    /// submitted and the stake must be retried once it is mined.
    ApprovalSubmitted { tx: TxHash, amount: TokenAmount },

    Staked {
        tx: TxHash,
        amount_in: TokenAmount,
        min_out: TokenAmount,
    },
}

/// Result of a claim attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed { tx: TxHash },
    /// The claim interval has not elapsed; nothing was sent.
    NotYet { remaining: Duration },
}

/// Render a wait as hours and minutes, with minutes rounded up.
///
/// Hours are omitted when zero; minutes are omitted when zero and
/// hours are not.
pub fn format_wait(remaining: Duration) -> String {
    let total_minutes = remaining.as_secs().div_ceil(60);
    let hours = total_minutes / 60;
    let minutes = total_minutes % 60;

    let mut parts = Vec::new();
    if hours > 0 {
        parts.push(format!("{hours} h"));
    }
    if minutes > 0 || hours == 0 {
        parts.push(format!("{minutes} min"));
    }
    parts.join(" ")
}
