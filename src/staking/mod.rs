//! Stake lifecycle: `Locked -> Unlockable -> Closed`.
//!
//! Rewards are simple interest on the principal, paid per whole elapsed
//! period. A partial final period earns nothing.

use log::warn;

use crate::error::{LedgerError, Result};
use crate::model::{
    Account, Amount, LockDuration, Settings, Stake, StakeId, StakeState, Timestamp,
    BPS_DENOMINATOR, PERIOD_MS,
};
use crate::rates;
use crate::store::{AccountPatch, LedgerMutation, StakePatch};

pub fn parse_lock_duration(input: &str) -> Result<LockDuration> {
    input
        .parse::<LockDuration>()
        .map_err(|err| LedgerError::validation("unsupported_lock_duration", err.to_string()))
}

pub fn monthly_reward(principal: Amount, rate_bps: u32) -> Amount {
    (u128::from(principal) * u128::from(rate_bps) / u128::from(BPS_DENOMINATOR)) as Amount
}

/// Whole periods between `start` and `now`, floored.
pub fn whole_periods(start: Timestamp, now: Timestamp) -> u64 {
    now.saturating_sub(start) / PERIOD_MS
}

pub fn reward_at(stake: &Stake, now: Timestamp) -> Result<Amount> {
    monthly_reward(stake.amount, stake.apy_bps)
        .checked_mul(whole_periods(stake.start_time, now))
        .ok_or_else(|| LedgerError::validation("amount_overflow", format!("reward of {}", stake.id)))
}

pub fn new_stake(
    id: StakeId,
    account_id: &str,
    amount: Amount,
    lock_duration: LockDuration,
    now: Timestamp,
) -> Result<Stake> {
    if amount == 0 {
        return Err(LedgerError::validation(
            "non_positive_amount",
            "stake amount must be greater than zero",
        ));
    }
    let maturity_time = now
        .checked_add(lock_duration.as_millis())
        .ok_or_else(|| LedgerError::validation("timestamp_overflow", "maturity out of range"))?;
    Ok(Stake {
        id,
        account_id: account_id.to_string(),
        amount,
        lock_duration,
        apy_bps: rates::yield_bps(lock_duration),
        earned_amount: 0,
        start_time: now,
        maturity_time,
        is_active: true,
        is_unlockable: false,
    })
}

pub fn plan_create(owner: &Account, stake: Stake) -> Result<Vec<LedgerMutation>> {
    let total_staked = owner
        .total_staked
        .checked_add(stake.amount)
        .ok_or_else(|| LedgerError::validation("amount_overflow", "total staked"))?;
    Ok(vec![
        LedgerMutation::CreateStake(stake),
        LedgerMutation::UpdateAccount {
            id: owner.id.clone(),
            patch: AccountPatch {
                total_staked: Some(total_staked),
                ..Default::default()
            },
        },
    ])
}

/// The persisted flip to unlockable, if `now` has reached maturity and the
/// flag is not yet set. Closed stakes are never touched.
pub fn refresh_patch(stake: &Stake, now: Timestamp) -> Option<StakePatch> {
    if stake.is_active && !stake.is_unlockable && now >= stake.maturity_time {
        Some(StakePatch {
            is_unlockable: Some(true),
            ..Default::default()
        })
    } else {
        None
    }
}

fn released_principal(owner: &Account, stake: &Stake) -> Amount {
    owner.total_staked.checked_sub(stake.amount).unwrap_or_else(|| {
        warn!(
            "account {} total staked {} below principal {} of {}",
            owner.id, owner.total_staked, stake.amount, stake.id
        );
        0
    })
}

/// Plans a normal close. Returns the reward and the mutations.
pub fn plan_unstake(
    owner: &Account,
    stake: &Stake,
    now: Timestamp,
) -> Result<(Amount, Vec<LedgerMutation>)> {
    match stake.state_at(now) {
        StakeState::Closed => {
            return Err(LedgerError::conflict(
                "stake_closed",
                format!("stake {} is already closed", stake.id),
            ))
        }
        StakeState::Locked => {
            return Err(LedgerError::conflict(
                "stake_locked",
                format!("stake {} is locked until {}", stake.id, stake.maturity_time),
            ))
        }
        StakeState::Unlockable => {}
    }
    let reward = reward_at(stake, now)?;
    let total_earned = owner
        .total_earned
        .checked_add(reward)
        .ok_or_else(|| LedgerError::validation("amount_overflow", "total earned"))?;
    let mutations = vec![
        LedgerMutation::UpdateStake {
            id: stake.id.clone(),
            patch: StakePatch {
                earned_amount: Some(reward),
                is_active: Some(false),
                is_unlockable: Some(true),
            },
        },
        LedgerMutation::UpdateAccount {
            id: owner.id.clone(),
            patch: AccountPatch {
                total_staked: Some(released_principal(owner, stake)),
                total_earned: Some(total_earned),
                ..Default::default()
            },
        },
    ];
    Ok((reward, mutations))
}

/// Plans a principal-only close, available only while the operator has both
/// paused the system and opened the emergency exit.
pub fn plan_emergency_unstake(
    settings: &Settings,
    owner: &Account,
    stake: &Stake,
) -> Result<Vec<LedgerMutation>> {
    if !settings.emergency_exit_open() {
        return Err(LedgerError::conflict(
            "emergency_unstake_unavailable",
            format!(
                "paused={} emergency_unstake_enabled={}",
                settings.paused, settings.emergency_unstake_enabled
            ),
        ));
    }
    if !stake.is_active {
        return Err(LedgerError::conflict(
            "stake_closed",
            format!("stake {} is already closed", stake.id),
        ));
    }
    Ok(vec![
        LedgerMutation::UpdateStake {
            id: stake.id.clone(),
            patch: StakePatch {
                earned_amount: Some(0),
                is_active: Some(false),
                is_unlockable: None,
            },
        },
        LedgerMutation::UpdateAccount {
            id: owner.id.clone(),
            patch: AccountPatch {
                total_staked: Some(released_principal(owner, stake)),
                ..Default::default()
            },
        },
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn owner() -> Account {
        Account {
            id: "acct".into(),
            wallet_address: "w".into(),
            referral_code: "C".into(),
            referrer_id: None,
            total_staked: 1_000,
            total_earned: 0,
            referral_earnings: 0,
            claimed_referral_earnings: 0,
            total_referrals: 0,
            is_registered: true,
            messaging_id: None,
            created_at: 0,
        }
    }

    #[test]
    fn maturity_is_start_plus_duration() {
        for duration in LockDuration::ALL {
            let stake = new_stake("s".into(), "acct", 10, duration, 1_234).unwrap();
            assert_eq!(stake.maturity_time, 1_234 + duration.months() * PERIOD_MS);
            assert_eq!(stake.apy_bps, rates::yield_bps(duration));
            assert_eq!(stake.state(), StakeState::Locked);
        }
    }

    #[test]
    fn zero_amount_is_rejected() {
        let err = new_stake("s".into(), "acct", 0, LockDuration::SixMonths, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(err.reason_code(), "non_positive_amount");
    }

    #[test]
    fn unsupported_duration_is_a_validation_error() {
        let err = parse_lock_duration("9m").unwrap_err();
        assert_eq!(err.reason_code(), "unsupported_lock_duration");
    }

    #[test]
    fn reward_floors_partial_periods() {
        let stake = new_stake("s".into(), "acct", 1_000, LockDuration::ThreeMonths, 0).unwrap();
        assert_eq!(reward_at(&stake, 3 * PERIOD_MS).unwrap(), 300);
        assert_eq!(reward_at(&stake, 4 * PERIOD_MS - 1).unwrap(), 300);
        assert_eq!(reward_at(&stake, 4 * PERIOD_MS).unwrap(), 400);
    }

    #[test]
    fn refresh_only_flips_active_matured_stakes() {
        let mut stake = new_stake("s".into(), "acct", 1, LockDuration::ThreeMonths, 0).unwrap();
        assert!(refresh_patch(&stake, stake.maturity_time - 1).is_none());
        assert!(refresh_patch(&stake, stake.maturity_time).is_some());
        stake.is_unlockable = true;
        assert!(refresh_patch(&stake, stake.maturity_time).is_none());
        stake.is_unlockable = false;
        stake.is_active = false;
        assert!(refresh_patch(&stake, u64::MAX).is_none());
    }

    #[test]
    fn locked_stake_cannot_be_unstaked() {
        let stake = new_stake("s".into(), "acct", 1_000, LockDuration::TwelveMonths, 0).unwrap();
        let err = plan_unstake(&owner(), &stake, PERIOD_MS).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StateConflict);
        assert_eq!(err.reason_code(), "stake_locked");
    }

    #[test]
    fn unstake_releases_principal_and_credits_reward() {
        let stake = new_stake("s".into(), "acct", 1_000, LockDuration::ThreeMonths, 0).unwrap();
        let (reward, mutations) = plan_unstake(&owner(), &stake, 3 * PERIOD_MS).unwrap();
        assert_eq!(reward, 300);
        match &mutations[1] {
            LedgerMutation::UpdateAccount { patch, .. } => {
                assert_eq!(patch.total_staked, Some(0));
                assert_eq!(patch.total_earned, Some(300));
            }
            other => panic!("unexpected mutation {other:?}"),
        }
    }

    #[test]
    fn emergency_exit_requires_pause_and_flag() {
        let stake = new_stake("s".into(), "acct", 1_000, LockDuration::ThreeMonths, 0).unwrap();
        for (paused, enabled) in [(false, false), (true, false), (false, true)] {
            let settings = Settings {
                paused,
                emergency_unstake_enabled: enabled,
                updated_at: 0,
            };
            let err = plan_emergency_unstake(&settings, &owner(), &stake).unwrap_err();
            assert_eq!(err.reason_code(), "emergency_unstake_unavailable");
        }
        let open = Settings {
            paused: true,
            emergency_unstake_enabled: true,
            updated_at: 0,
        };
        let mutations = plan_emergency_unstake(&open, &owner(), &stake).unwrap();
        assert!(matches!(
            &mutations[0],
            LedgerMutation::UpdateStake { patch, .. } if patch.earned_amount == Some(0) && patch.is_active == Some(false)
        ));
    }
}
