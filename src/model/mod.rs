use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub type AccountId = String;
pub type StakeId = String;
pub type Amount = u64;
/// Unix time in milliseconds.
pub type Timestamp = u64;

pub const TOKEN_SCALE: u64 = 100_000_000; // 1 token = 1e8 minimal units
pub const BPS_DENOMINATOR: u64 = 10_000;

/// One reward/lock period. Maturity and elapsed periods both use this length.
pub const PERIOD_MS: u64 = 30 * 24 * 60 * 60 * 1_000;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Account {
    pub id: AccountId,
    pub wallet_address: String,
    pub referral_code: String,
    pub referrer_id: Option<AccountId>,
    pub total_staked: Amount,
    pub total_earned: Amount,
    /// Pending, not yet claimed.
    pub referral_earnings: Amount,
    pub claimed_referral_earnings: Amount,
    pub total_referrals: u32,
    pub is_registered: bool,
    pub messaging_id: Option<String>,
    pub created_at: Timestamp,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LockDuration {
    ThreeMonths,
    SixMonths,
    TwelveMonths,
}

impl LockDuration {
    pub const ALL: [LockDuration; 3] = [
        LockDuration::ThreeMonths,
        LockDuration::SixMonths,
        LockDuration::TwelveMonths,
    ];

    pub fn months(self) -> u64 {
        match self {
            LockDuration::ThreeMonths => 3,
            LockDuration::SixMonths => 6,
            LockDuration::TwelveMonths => 12,
        }
    }

    pub fn from_months(months: u64) -> Option<Self> {
        Self::ALL.into_iter().find(|d| d.months() == months)
    }

    pub fn as_millis(self) -> u64 {
        self.months() * PERIOD_MS
    }
}

impl fmt::Display for LockDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}m", self.months())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unsupported lock duration {0:?} (expected 3m, 6m or 12m)")]
pub struct ParseLockDurationError(pub String);

impl FromStr for LockDuration {
    type Err = ParseLockDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits = trimmed.strip_suffix('m').unwrap_or(trimmed);
        digits
            .parse::<u64>()
            .ok()
            .and_then(LockDuration::from_months)
            .ok_or_else(|| ParseLockDurationError(s.to_string()))
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StakeState {
    Locked,
    Unlockable,
    Closed,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Stake {
    pub id: StakeId,
    pub account_id: AccountId,
    pub amount: Amount,
    pub lock_duration: LockDuration,
    pub apy_bps: u32,
    pub earned_amount: Amount,
    pub start_time: Timestamp,
    pub maturity_time: Timestamp,
    pub is_active: bool,
    pub is_unlockable: bool,
}

impl Stake {
    pub fn state(&self) -> StakeState {
        if !self.is_active {
            StakeState::Closed
        } else if self.is_unlockable {
            StakeState::Unlockable
        } else {
            StakeState::Locked
        }
    }

    /// State as of `now`, counting a passed maturity even if not yet persisted.
    pub fn state_at(&self, now: Timestamp) -> StakeState {
        match self.state() {
            StakeState::Locked if now >= self.maturity_time => StakeState::Unlockable,
            state => state,
        }
    }
}

/// Edges are keyed by `(referred, level)`: one edge per level per referred account.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReferralKey {
    pub referred_id: AccountId,
    pub level: u8,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReferralEdge {
    pub referrer_id: AccountId,
    pub referred_id: AccountId,
    pub level: u8,
    pub commission_bps: u32,
    pub earned: Amount,
    pub created_at: Timestamp,
}

impl ReferralEdge {
    pub fn key(&self) -> ReferralKey {
        ReferralKey {
            referred_id: self.referred_id.clone(),
            level: self.level,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Settings {
    pub paused: bool,
    pub emergency_unstake_enabled: bool,
    pub updated_at: Timestamp,
}

impl Settings {
    pub fn emergency_exit_open(&self) -> bool {
        self.paused && self.emergency_unstake_enabled
    }
}
