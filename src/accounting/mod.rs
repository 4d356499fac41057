//! Derived account totals.
//!
//! Every engine operation keeps the totals on `Account` current as it goes.
//! This module recomputes them from raw stakes and referral edges so drift
//! can be detected and repaired.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::model::{Account, AccountId, Amount};
use crate::store::{AccountPatch, LedgerMutation, LedgerStore};

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq, Default)]
pub struct Aggregates {
    pub total_staked: Amount,
    pub total_earned: Amount,
    pub referral_earnings: Amount,
    pub total_referrals: u32,
}

impl Aggregates {
    pub fn recorded(account: &Account) -> Self {
        Aggregates {
            total_staked: account.total_staked,
            total_earned: account.total_earned,
            referral_earnings: account.referral_earnings,
            total_referrals: account.total_referrals,
        }
    }
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct AggregateDrift {
    pub account_id: AccountId,
    pub recorded: Aggregates,
    pub derived: Aggregates,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq, Default)]
pub struct RepairReport {
    pub accounts_scanned: usize,
    pub repaired: Vec<AggregateDrift>,
}

/// Recomputes every account's totals from stakes and edges.
pub fn derive_all<S: LedgerStore + ?Sized>(store: &S) -> BTreeMap<AccountId, Aggregates> {
    let accounts = store.accounts();
    let mut derived: BTreeMap<AccountId, Aggregates> = accounts
        .iter()
        .map(|a| (a.id.clone(), Aggregates::default()))
        .collect();
    let mut edge_earnings: BTreeMap<AccountId, Amount> = BTreeMap::new();

    for stake in store.stakes() {
        if let Some(totals) = derived.get_mut(&stake.account_id) {
            if stake.is_active {
                totals.total_staked = totals.total_staked.saturating_add(stake.amount);
            } else {
                totals.total_earned = totals.total_earned.saturating_add(stake.earned_amount);
            }
        }
    }
    for edge in store.referrals() {
        let earned = edge_earnings.entry(edge.referrer_id.clone()).or_default();
        *earned = earned.saturating_add(edge.earned);
        if edge.level == 1 {
            if let Some(totals) = derived.get_mut(&edge.referrer_id) {
                totals.total_referrals += 1;
            }
        }
    }
    for account in &accounts {
        if let Some(totals) = derived.get_mut(&account.id) {
            let edges = edge_earnings.get(&account.id).copied().unwrap_or(0);
            totals.referral_earnings = edges.saturating_sub(account.claimed_referral_earnings);
            totals.total_earned = totals
                .total_earned
                .saturating_add(account.claimed_referral_earnings);
        }
    }
    derived
}

/// Direct-referral count per account: level-1 edges where it is referrer.
pub fn direct_referral_counts<S: LedgerStore + ?Sized>(store: &S) -> BTreeMap<AccountId, u32> {
    let mut counts: BTreeMap<AccountId, u32> =
        store.accounts().into_iter().map(|a| (a.id, 0)).collect();
    for edge in store.referrals() {
        if edge.level == 1 {
            *counts.entry(edge.referrer_id).or_default() += 1;
        }
    }
    counts
}

pub fn audit<S: LedgerStore + ?Sized>(store: &S) -> Vec<AggregateDrift> {
    let derived = derive_all(store);
    store
        .accounts()
        .into_iter()
        .filter_map(|account| {
            let recorded = Aggregates::recorded(&account);
            let expected = derived.get(&account.id).copied().unwrap_or_default();
            (recorded != expected).then(|| AggregateDrift {
                account_id: account.id,
                recorded,
                derived: expected,
            })
        })
        .collect()
}

pub fn repair_mutations(drifts: &[AggregateDrift]) -> Vec<LedgerMutation> {
    drifts
        .iter()
        .map(|drift| LedgerMutation::UpdateAccount {
            id: drift.account_id.clone(),
            patch: AccountPatch {
                total_staked: Some(drift.derived.total_staked),
                total_earned: Some(drift.derived.total_earned),
                referral_earnings: Some(drift.derived.referral_earnings),
                total_referrals: Some(drift.derived.total_referrals),
                ..Default::default()
            },
        })
        .collect()
}

/// Repairs only `total_referrals`. Returns `(account, recorded, derived)` per fix.
pub fn referral_count_repairs<S: LedgerStore + ?Sized>(
    store: &S,
) -> (Vec<(AccountId, u32, u32)>, Vec<LedgerMutation>) {
    let counts = direct_referral_counts(store);
    let mut fixes = Vec::new();
    let mut mutations = Vec::new();
    for account in store.accounts() {
        let derived = counts.get(&account.id).copied().unwrap_or(0);
        if derived != account.total_referrals {
            mutations.push(LedgerMutation::UpdateAccount {
                id: account.id.clone(),
                patch: AccountPatch {
                    total_referrals: Some(derived),
                    ..Default::default()
                },
            });
            fixes.push((account.id, account.total_referrals, derived));
        }
    }
    (fixes, mutations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LockDuration, ReferralEdge, Stake};
    use crate::store::{AccountDirectory, MemoryStore, ReferralDirectory, StakeDirectory};

    fn account(id: &str) -> Account {
        Account {
            id: id.into(),
            wallet_address: id.into(),
            referral_code: id.to_uppercase(),
            referrer_id: None,
            total_staked: 0,
            total_earned: 0,
            referral_earnings: 0,
            claimed_referral_earnings: 0,
            total_referrals: 0,
            is_registered: true,
            messaging_id: None,
            created_at: 0,
        }
    }

    fn stake(id: &str, owner: &str, amount: Amount, active: bool, earned: Amount) -> Stake {
        Stake {
            id: id.into(),
            account_id: owner.into(),
            amount,
            lock_duration: LockDuration::ThreeMonths,
            apy_bps: 1_000,
            earned_amount: earned,
            start_time: 0,
            maturity_time: LockDuration::ThreeMonths.as_millis(),
            is_active: active,
            is_unlockable: !active,
        }
    }

    fn edge(referrer: &str, referred: &str, level: u8, earned: Amount) -> ReferralEdge {
        ReferralEdge {
            referrer_id: referrer.into(),
            referred_id: referred.into(),
            level,
            commission_bps: 100,
            earned,
            created_at: 0,
        }
    }

    fn fixture() -> MemoryStore {
        let mut store = MemoryStore::new();
        let mut a = account("a");
        a.claimed_referral_earnings = 40;
        store.create_account(a).unwrap();
        store.create_account(account("b")).unwrap();
        store.create_account(account("c")).unwrap();
        store.create_stake(stake("s1", "a", 500, true, 0)).unwrap();
        store.create_stake(stake("s2", "a", 200, false, 60)).unwrap();
        store.create_referral(edge("b", "c", 1, 10)).unwrap();
        store.create_referral(edge("a", "c", 2, 100)).unwrap();
        store.create_referral(edge("a", "b", 1, 0)).unwrap();
        store
    }

    #[test]
    fn derives_totals_from_raw_records() {
        let store = fixture();
        let derived = derive_all(&store);
        assert_eq!(
            derived["a"],
            Aggregates {
                total_staked: 500,
                total_earned: 100,
                referral_earnings: 60,
                total_referrals: 1,
            }
        );
        assert_eq!(derived["b"].total_referrals, 1);
        assert_eq!(derived["b"].referral_earnings, 10);
        assert_eq!(derived["c"], Aggregates::default());
    }

    #[test]
    fn repair_clears_drift() {
        let mut store = fixture();
        let drifts = audit(&store);
        assert_eq!(drifts.len(), 2);
        store.apply(&repair_mutations(&drifts)).unwrap();
        assert!(audit(&store).is_empty());
        assert_eq!(store.account("a").unwrap().total_staked, 500);
        assert_eq!(store.stakes_by_owner("a").len(), 2);
        assert_eq!(store.referrals_by_referrer("a").len(), 2);
    }

    #[test]
    fn referral_count_repair_ignores_deeper_levels() {
        let mut store = fixture();
        store
            .update_account(
                "c",
                &AccountPatch {
                    total_referrals: Some(9),
                    ..Default::default()
                },
            )
            .unwrap();
        let (fixes, mutations) = referral_count_repairs(&store);
        assert_eq!(
            fixes,
            vec![
                ("a".to_string(), 0, 1),
                ("b".to_string(), 0, 1),
                ("c".to_string(), 9, 0)
            ]
        );
        store.apply(&mutations).unwrap();
        assert_eq!(store.account("a").unwrap().total_referrals, 1);
        assert_eq!(store.account("c").unwrap().total_referrals, 0);
    }
}
