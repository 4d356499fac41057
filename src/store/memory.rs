use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::Path;

use log::warn;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{
    AccountDirectory, AccountPatch, LedgerStore, ReferralDirectory, ReferralPatch, SettingsPatch,
    SettingsStore, StakeDirectory, StakePatch, StoreError,
};
use crate::model::{Account, AccountId, ReferralEdge, ReferralKey, Settings, Stake, StakeId};

/// Process-local store. Secondary indexes are rebuilt on load and never serialised.
#[derive(Default)]
pub struct MemoryStore {
    accounts: BTreeMap<AccountId, Account>,
    by_wallet: BTreeMap<String, AccountId>,
    by_code: BTreeMap<String, AccountId>,
    by_messaging: BTreeMap<String, AccountId>,
    stakes: BTreeMap<StakeId, Stake>,
    stakes_by_owner: BTreeMap<AccountId, BTreeSet<StakeId>>,
    referrals: BTreeMap<ReferralKey, ReferralEdge>,
    referrals_by_referrer: BTreeMap<AccountId, BTreeSet<ReferralKey>>,
    settings: Settings,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct MemorySnapshot {
    pub accounts: Vec<Account>,
    pub stakes: Vec<Stake>,
    pub referrals: Vec<ReferralEdge>,
    pub settings: Settings,
    /// Hex SHA-256 root over the entities above.
    pub state_root: String,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MemorySnapshot {
        MemorySnapshot {
            accounts: self.accounts.values().cloned().collect(),
            stakes: self.stakes.values().cloned().collect(),
            referrals: self.referrals.values().cloned().collect(),
            settings: self.settings.clone(),
            state_root: hex::encode(self.state_root()),
        }
    }

    pub fn from_snapshot(snapshot: MemorySnapshot) -> Result<Self, StoreError> {
        let mut store = MemoryStore::new();
        for account in snapshot.accounts {
            store.create_account(account)?;
        }
        for stake in snapshot.stakes {
            store.create_stake(stake)?;
        }
        for edge in snapshot.referrals {
            store.create_referral(edge)?;
        }
        store.settings = snapshot.settings;
        // Snapshots assembled by hand may leave the root empty.
        if !snapshot.state_root.is_empty() {
            let actual = hex::encode(store.state_root());
            if actual != snapshot.state_root {
                warn!(
                    "snapshot root {} does not match recomputed {actual}",
                    snapshot.state_root
                );
                return Err(StoreError::RootMismatch {
                    recorded: snapshot.state_root,
                    actual,
                });
            }
        }
        Ok(store)
    }

    /// Loads a JSON snapshot, or returns an empty store if `path` does not exist.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        if !path.exists() {
            return Ok(MemoryStore::new());
        }
        let bytes = fs::read(path)?;
        let snapshot: MemorySnapshot = serde_json::from_slice(&bytes)?;
        Self::from_snapshot(snapshot)
    }

    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_vec_pretty(&self.snapshot())?;
        let tmp = path.with_extension("json.tmp");
        let mut f = fs::File::create(&tmp)?;
        f.write_all(&json)?;
        f.sync_all()?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn state_root(&self) -> [u8; 32] {
        let mut leaves: Vec<[u8; 32]> = Vec::new();
        for account in self.accounts.values() {
            let mut hasher = Sha256::new();
            hasher.update(b"acct");
            put_str(&mut hasher, &account.id);
            put_str(&mut hasher, &account.wallet_address);
            put_str(&mut hasher, &account.referral_code);
            put_opt(&mut hasher, account.referrer_id.as_deref());
            hasher.update(account.total_staked.to_le_bytes());
            hasher.update(account.total_earned.to_le_bytes());
            hasher.update(account.referral_earnings.to_le_bytes());
            hasher.update(account.claimed_referral_earnings.to_le_bytes());
            hasher.update(account.total_referrals.to_le_bytes());
            hasher.update([u8::from(account.is_registered)]);
            put_opt(&mut hasher, account.messaging_id.as_deref());
            hasher.update(account.created_at.to_le_bytes());
            leaves.push(hasher.finalize().into());
        }
        for stake in self.stakes.values() {
            let mut hasher = Sha256::new();
            hasher.update(b"stake");
            put_str(&mut hasher, &stake.id);
            put_str(&mut hasher, &stake.account_id);
            hasher.update(stake.amount.to_le_bytes());
            hasher.update(stake.lock_duration.months().to_le_bytes());
            hasher.update(stake.apy_bps.to_le_bytes());
            hasher.update(stake.earned_amount.to_le_bytes());
            hasher.update(stake.start_time.to_le_bytes());
            hasher.update(stake.maturity_time.to_le_bytes());
            hasher.update([u8::from(stake.is_active), u8::from(stake.is_unlockable)]);
            leaves.push(hasher.finalize().into());
        }
        for edge in self.referrals.values() {
            let mut hasher = Sha256::new();
            hasher.update(b"edge");
            put_str(&mut hasher, &edge.referrer_id);
            put_str(&mut hasher, &edge.referred_id);
            hasher.update([edge.level]);
            hasher.update(edge.commission_bps.to_le_bytes());
            hasher.update(edge.earned.to_le_bytes());
            hasher.update(edge.created_at.to_le_bytes());
            leaves.push(hasher.finalize().into());
        }
        let mut hasher = Sha256::new();
        hasher.update(b"settings");
        hasher.update([
            u8::from(self.settings.paused),
            u8::from(self.settings.emergency_unstake_enabled),
        ]);
        hasher.update(self.settings.updated_at.to_le_bytes());
        leaves.push(hasher.finalize().into());
        build_merkle(leaves)
    }
}

fn put_str(hasher: &mut Sha256, value: &str) {
    hasher.update((value.len() as u64).to_le_bytes());
    hasher.update(value.as_bytes());
}

fn put_opt(hasher: &mut Sha256, value: Option<&str>) {
    match value {
        Some(value) => {
            hasher.update([1]);
            put_str(hasher, value);
        }
        None => hasher.update([0]),
    }
}

fn build_merkle(mut leaves: Vec<[u8; 32]>) -> [u8; 32] {
    if leaves.is_empty() {
        return Sha256::digest(b"stakenet-empty").into();
    }
    while leaves.len() > 1 {
        let mut next = Vec::with_capacity((leaves.len() + 1) / 2);
        for chunk in leaves.chunks(2) {
            let mut hasher = Sha256::new();
            hasher.update(b"node");
            hasher.update(chunk[0]);
            hasher.update(chunk.get(1).unwrap_or(&chunk[0]));
            next.push(hasher.finalize().into());
        }
        leaves = next;
    }
    leaves[0]
}

impl AccountDirectory for MemoryStore {
    fn account(&self, id: &str) -> Option<Account> {
        self.accounts.get(id).cloned()
    }

    fn account_by_wallet(&self, wallet: &str) -> Option<Account> {
        self.by_wallet.get(wallet).and_then(|id| self.account(id))
    }

    fn account_by_referral_code(&self, code: &str) -> Option<Account> {
        self.by_code.get(code).and_then(|id| self.account(id))
    }

    fn account_by_messaging_id(&self, handle: &str) -> Option<Account> {
        self.by_messaging.get(handle).and_then(|id| self.account(id))
    }

    fn accounts(&self) -> Vec<Account> {
        self.accounts.values().cloned().collect()
    }

    fn create_account(&mut self, account: Account) -> Result<(), StoreError> {
        if self.accounts.contains_key(&account.id) {
            return Err(StoreError::DuplicateAccount { id: account.id });
        }
        if self.by_wallet.contains_key(&account.wallet_address) {
            return Err(StoreError::WalletTaken {
                wallet: account.wallet_address,
            });
        }
        if self.by_code.contains_key(&account.referral_code) {
            return Err(StoreError::ReferralCodeTaken {
                code: account.referral_code,
            });
        }
        if let Some(handle) = &account.messaging_id {
            if self.by_messaging.contains_key(handle) {
                return Err(StoreError::MessagingIdTaken {
                    handle: handle.clone(),
                });
            }
            self.by_messaging.insert(handle.clone(), account.id.clone());
        }
        self.by_wallet
            .insert(account.wallet_address.clone(), account.id.clone());
        self.by_code
            .insert(account.referral_code.clone(), account.id.clone());
        self.accounts.insert(account.id.clone(), account);
        Ok(())
    }

    fn update_account(&mut self, id: &str, patch: &AccountPatch) -> Result<Account, StoreError> {
        if let Some(handle) = &patch.messaging_id {
            match self.by_messaging.get(handle) {
                Some(owner) if owner != id => {
                    return Err(StoreError::MessagingIdTaken {
                        handle: handle.clone(),
                    })
                }
                _ => {}
            }
        }
        let account = self
            .accounts
            .get_mut(id)
            .ok_or_else(|| StoreError::UnknownAccount { id: id.to_string() })?;
        if let (Some(old), Some(_)) = (&account.messaging_id, &patch.messaging_id) {
            self.by_messaging.remove(old);
        }
        patch.apply_to(account);
        if let Some(handle) = &patch.messaging_id {
            self.by_messaging.insert(handle.clone(), id.to_string());
        }
        Ok(account.clone())
    }
}

impl StakeDirectory for MemoryStore {
    fn stake(&self, id: &str) -> Option<Stake> {
        self.stakes.get(id).cloned()
    }

    fn stakes_by_owner(&self, account_id: &str) -> Vec<Stake> {
        self.stakes_by_owner
            .get(account_id)
            .map(|ids| ids.iter().filter_map(|id| self.stake(id)).collect())
            .unwrap_or_default()
    }

    fn stakes(&self) -> Vec<Stake> {
        self.stakes.values().cloned().collect()
    }

    fn create_stake(&mut self, stake: Stake) -> Result<(), StoreError> {
        if self.stakes.contains_key(&stake.id) {
            return Err(StoreError::DuplicateStake { id: stake.id });
        }
        self.stakes_by_owner
            .entry(stake.account_id.clone())
            .or_default()
            .insert(stake.id.clone());
        self.stakes.insert(stake.id.clone(), stake);
        Ok(())
    }

    fn update_stake(&mut self, id: &str, patch: &StakePatch) -> Result<Stake, StoreError> {
        let stake = self
            .stakes
            .get_mut(id)
            .ok_or_else(|| StoreError::UnknownStake { id: id.to_string() })?;
        patch.apply_to(stake);
        Ok(stake.clone())
    }
}

impl ReferralDirectory for MemoryStore {
    fn referral(&self, key: &ReferralKey) -> Option<ReferralEdge> {
        self.referrals.get(key).cloned()
    }

    fn referrals_by_referrer(&self, referrer_id: &str) -> Vec<ReferralEdge> {
        self.referrals_by_referrer
            .get(referrer_id)
            .map(|keys| keys.iter().filter_map(|key| self.referral(key)).collect())
            .unwrap_or_default()
    }

    fn referrals_by_referred(&self, referred_id: &str) -> Vec<ReferralEdge> {
        let from = ReferralKey {
            referred_id: referred_id.to_string(),
            level: 0,
        };
        let to = ReferralKey {
            referred_id: referred_id.to_string(),
            level: u8::MAX,
        };
        self.referrals
            .range(from..=to)
            .map(|(_, edge)| edge.clone())
            .collect()
    }

    fn referrals(&self) -> Vec<ReferralEdge> {
        self.referrals.values().cloned().collect()
    }

    fn create_referral(&mut self, edge: ReferralEdge) -> Result<(), StoreError> {
        let key = edge.key();
        if self.referrals.contains_key(&key) {
            return Err(StoreError::DuplicateReferral {
                referred_id: edge.referred_id,
                level: edge.level,
            });
        }
        self.referrals_by_referrer
            .entry(edge.referrer_id.clone())
            .or_default()
            .insert(key.clone());
        self.referrals.insert(key, edge);
        Ok(())
    }

    fn update_referral(
        &mut self,
        key: &ReferralKey,
        patch: &ReferralPatch,
    ) -> Result<ReferralEdge, StoreError> {
        let edge = self
            .referrals
            .get_mut(key)
            .ok_or_else(|| StoreError::UnknownReferral {
                referred_id: key.referred_id.clone(),
                level: key.level,
            })?;
        patch.apply_to(edge);
        Ok(edge.clone())
    }
}

impl SettingsStore for MemoryStore {
    fn settings(&self) -> Settings {
        self.settings.clone()
    }

    fn update_settings(&mut self, patch: &SettingsPatch) -> Settings {
        patch.apply_to(&mut self.settings);
        self.settings.clone()
    }
}

impl LedgerStore for MemoryStore {}
