//! Referral chain construction and commission accrual.
//!
//! Both planners read the store and return the mutations to apply; neither
//! writes anything itself.

use std::collections::{BTreeMap, BTreeSet};

use log::{debug, warn};
use serde::Serialize;

use crate::error::{LedgerError, Result};
use crate::model::{Account, AccountId, Amount, ReferralEdge, Timestamp, BPS_DENOMINATOR};
use crate::rates::{self, MAX_REFERRAL_DEPTH};
use crate::store::{
    AccountDirectory, AccountPatch, LedgerMutation, ReferralDirectory, ReferralPatch,
};

/// Walks upward from `start`, returning `start` and then each ancestor.
///
/// Stops after `limit` accounts, at the first account without a referrer, at
/// an ancestor missing from the store, or when an account repeats.
pub fn upline<S>(store: &S, start: &Account, limit: usize) -> Vec<Account>
where
    S: AccountDirectory + ?Sized,
{
    let mut chain = Vec::new();
    let mut visited = BTreeSet::new();
    let mut current = Some(start.clone());
    while let Some(account) = current.take() {
        if chain.len() >= limit {
            break;
        }
        if !visited.insert(account.id.clone()) {
            warn!("referral cycle through {} detected, walk stopped", account.id);
            break;
        }
        current = match &account.referrer_id {
            Some(parent_id) => {
                let parent = store.account(parent_id);
                if parent.is_none() {
                    warn!("account {} names missing referrer {}", account.id, parent_id);
                }
                parent
            }
            None => None,
        };
        chain.push(account);
    }
    chain
}

/// Plans the edges linking `new_account_id` to `direct_referrer` and every
/// ancestor above it, one edge per level with that level's frozen rate.
///
/// The direct referrer's `total_referrals` is bumped; deeper ancestors only
/// gain an edge. Must run once per account, at registration.
pub fn plan_chain<S>(
    store: &S,
    new_account_id: &AccountId,
    direct_referrer: &Account,
    now: Timestamp,
) -> Result<Vec<LedgerMutation>>
where
    S: AccountDirectory + ?Sized,
{
    let mut mutations = Vec::new();
    let chain = upline(store, direct_referrer, usize::from(MAX_REFERRAL_DEPTH));
    for (idx, referrer) in chain.iter().enumerate() {
        let level = (idx + 1) as u8;
        let Some(commission_bps) = rates::commission_bps(level) else {
            break;
        };
        if &referrer.id == new_account_id {
            warn!("account {new_account_id} found in its own upline, walk stopped");
            break;
        }
        mutations.push(LedgerMutation::CreateReferral(ReferralEdge {
            referrer_id: referrer.id.clone(),
            referred_id: new_account_id.clone(),
            level,
            commission_bps,
            earned: 0,
            created_at: now,
        }));
        if level == 1 {
            let total_referrals = referrer.total_referrals.checked_add(1).ok_or_else(|| {
                LedgerError::validation("counter_overflow", format!("{} referrals", referrer.id))
            })?;
            mutations.push(LedgerMutation::UpdateAccount {
                id: referrer.id.clone(),
                patch: AccountPatch {
                    total_referrals: Some(total_referrals),
                    ..Default::default()
                },
            });
        }
    }
    debug!(
        "planned {} referral edges for {}",
        mutations
            .iter()
            .filter(|m| matches!(m, LedgerMutation::CreateReferral(_)))
            .count(),
        new_account_id
    );
    Ok(mutations)
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct CommissionPayout {
    pub referrer_id: AccountId,
    pub level: u8,
    pub amount: Amount,
}

pub fn commission_share(base_amount: Amount, rate_bps: u32) -> Amount {
    (u128::from(base_amount) * u128::from(rate_bps) / u128::from(BPS_DENOMINATOR)) as Amount
}

/// Plans crediting each upline edge of `referred_id` with its share of
/// `base_amount`, and the matching pending earnings on each referrer.
pub fn plan_commission<S>(
    store: &S,
    referred_id: &str,
    base_amount: Amount,
) -> Result<(Vec<CommissionPayout>, Vec<LedgerMutation>)>
where
    S: AccountDirectory + ReferralDirectory + ?Sized,
{
    let mut payouts = Vec::new();
    let mut mutations = Vec::new();
    let mut per_referrer: BTreeMap<AccountId, Amount> = BTreeMap::new();

    for edge in store.referrals_by_referred(referred_id) {
        let amount = commission_share(base_amount, edge.commission_bps);
        if amount == 0 {
            continue;
        }
        let earned = edge
            .earned
            .checked_add(amount)
            .ok_or_else(|| LedgerError::validation("amount_overflow", "edge earnings"))?;
        mutations.push(LedgerMutation::UpdateReferral {
            key: edge.key(),
            patch: ReferralPatch {
                earned: Some(earned),
            },
        });
        let pending = per_referrer.entry(edge.referrer_id.clone()).or_default();
        *pending = pending
            .checked_add(amount)
            .ok_or_else(|| LedgerError::validation("amount_overflow", "commission total"))?;
        payouts.push(CommissionPayout {
            referrer_id: edge.referrer_id,
            level: edge.level,
            amount,
        });
    }

    for (referrer_id, amount) in per_referrer {
        let referrer = store
            .account(&referrer_id)
            .ok_or_else(|| LedgerError::not_found("account", referrer_id.clone()))?;
        let referral_earnings = referrer
            .referral_earnings
            .checked_add(amount)
            .ok_or_else(|| LedgerError::validation("amount_overflow", "referral earnings"))?;
        mutations.push(LedgerMutation::UpdateAccount {
            id: referrer_id,
            patch: AccountPatch {
                referral_earnings: Some(referral_earnings),
                ..Default::default()
            },
        });
    }
    Ok((payouts, mutations))
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct LevelSummary {
    pub level: u8,
    pub members: u32,
    pub rate_bps: u32,
    pub earned: Amount,
}

/// Groups a referrer's outgoing edges by level.
pub fn summarize_downline(edges: &[ReferralEdge]) -> Vec<LevelSummary> {
    let mut levels: BTreeMap<u8, LevelSummary> = BTreeMap::new();
    for edge in edges {
        let entry = levels.entry(edge.level).or_insert_with(|| LevelSummary {
            level: edge.level,
            members: 0,
            rate_bps: rates::commission_bps(edge.level).unwrap_or(edge.commission_bps),
            earned: 0,
        });
        entry.members += 1;
        entry.earned = entry.earned.saturating_add(edge.earned);
    }
    levels.into_values().collect()
}
