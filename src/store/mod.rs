//! Storage capabilities consumed by the engine.
//!
//! The engine never writes through the directory traits directly. It plans a
//! batch of [`LedgerMutation`]s and hands it to [`LedgerStore::apply`], which
//! checks the whole batch against the current contents before the first write.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::model::{
    Account, AccountId, Amount, ReferralEdge, ReferralKey, Settings, Stake, StakeId, Timestamp,
};

pub mod memory;

pub use memory::{MemorySnapshot, MemoryStore};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("unknown account {id}")]
    UnknownAccount { id: AccountId },
    #[error("unknown stake {id}")]
    UnknownStake { id: StakeId },
    #[error("unknown referral edge for {referred_id} at level {level}")]
    UnknownReferral { referred_id: AccountId, level: u8 },
    #[error("account {id} already exists")]
    DuplicateAccount { id: AccountId },
    #[error("wallet {wallet} is already registered")]
    WalletTaken { wallet: String },
    #[error("referral code {code} is already taken")]
    ReferralCodeTaken { code: String },
    #[error("messaging id {handle} is already linked")]
    MessagingIdTaken { handle: String },
    #[error("stake {id} already exists")]
    DuplicateStake { id: StakeId },
    #[error("referral edge for {referred_id} at level {level} already exists")]
    DuplicateReferral { referred_id: AccountId, level: u8 },
    #[error("snapshot root {recorded} does not match its contents ({actual})")]
    RootMismatch { recorded: String, actual: String },
    #[error("snapshot io: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct AccountPatch {
    pub total_staked: Option<Amount>,
    pub total_earned: Option<Amount>,
    pub referral_earnings: Option<Amount>,
    pub claimed_referral_earnings: Option<Amount>,
    pub total_referrals: Option<u32>,
    pub messaging_id: Option<String>,
}

impl AccountPatch {
    pub fn is_empty(&self) -> bool {
        *self == AccountPatch::default()
    }

    pub fn apply_to(&self, account: &mut Account) {
        if let Some(v) = self.total_staked {
            account.total_staked = v;
        }
        if let Some(v) = self.total_earned {
            account.total_earned = v;
        }
        if let Some(v) = self.referral_earnings {
            account.referral_earnings = v;
        }
        if let Some(v) = self.claimed_referral_earnings {
            account.claimed_referral_earnings = v;
        }
        if let Some(v) = self.total_referrals {
            account.total_referrals = v;
        }
        if let Some(handle) = &self.messaging_id {
            account.messaging_id = Some(handle.clone());
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StakePatch {
    pub earned_amount: Option<Amount>,
    pub is_active: Option<bool>,
    pub is_unlockable: Option<bool>,
}

impl StakePatch {
    pub fn apply_to(&self, stake: &mut Stake) {
        if let Some(v) = self.earned_amount {
            stake.earned_amount = v;
        }
        if let Some(v) = self.is_active {
            stake.is_active = v;
        }
        if let Some(v) = self.is_unlockable {
            stake.is_unlockable = v;
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ReferralPatch {
    pub earned: Option<Amount>,
}

impl ReferralPatch {
    pub fn apply_to(&self, edge: &mut ReferralEdge) {
        if let Some(v) = self.earned {
            edge.earned = v;
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SettingsPatch {
    pub paused: Option<bool>,
    pub emergency_unstake_enabled: Option<bool>,
    pub updated_at: Option<Timestamp>,
}

impl SettingsPatch {
    pub fn apply_to(&self, settings: &mut Settings) {
        if let Some(v) = self.paused {
            settings.paused = v;
        }
        if let Some(v) = self.emergency_unstake_enabled {
            settings.emergency_unstake_enabled = v;
        }
        if let Some(v) = self.updated_at {
            settings.updated_at = v;
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerMutation {
    CreateAccount(Account),
    UpdateAccount { id: AccountId, patch: AccountPatch },
    CreateStake(Stake),
    UpdateStake { id: StakeId, patch: StakePatch },
    CreateReferral(ReferralEdge),
    UpdateReferral { key: ReferralKey, patch: ReferralPatch },
    UpdateSettings(SettingsPatch),
}

pub trait AccountDirectory {
    fn account(&self, id: &str) -> Option<Account>;
    fn account_by_wallet(&self, wallet: &str) -> Option<Account>;
    fn account_by_referral_code(&self, code: &str) -> Option<Account>;
    fn account_by_messaging_id(&self, handle: &str) -> Option<Account>;
    fn accounts(&self) -> Vec<Account>;
    fn create_account(&mut self, account: Account) -> Result<(), StoreError>;
    fn update_account(&mut self, id: &str, patch: &AccountPatch) -> Result<Account, StoreError>;
}

pub trait StakeDirectory {
    fn stake(&self, id: &str) -> Option<Stake>;
    fn stakes_by_owner(&self, account_id: &str) -> Vec<Stake>;
    fn stakes(&self) -> Vec<Stake>;
    fn create_stake(&mut self, stake: Stake) -> Result<(), StoreError>;
    fn update_stake(&mut self, id: &str, patch: &StakePatch) -> Result<Stake, StoreError>;
}

pub trait ReferralDirectory {
    fn referral(&self, key: &ReferralKey) -> Option<ReferralEdge>;
    fn referrals_by_referrer(&self, referrer_id: &str) -> Vec<ReferralEdge>;
    /// Edges pointing at `referred_id`, ordered by level.
    fn referrals_by_referred(&self, referred_id: &str) -> Vec<ReferralEdge>;
    fn referrals(&self) -> Vec<ReferralEdge>;
    fn create_referral(&mut self, edge: ReferralEdge) -> Result<(), StoreError>;
    fn update_referral(
        &mut self,
        key: &ReferralKey,
        patch: &ReferralPatch,
    ) -> Result<ReferralEdge, StoreError>;
}

pub trait SettingsStore {
    fn settings(&self) -> Settings;
    fn update_settings(&mut self, patch: &SettingsPatch) -> Settings;
}

pub trait LedgerStore: AccountDirectory + StakeDirectory + ReferralDirectory + SettingsStore {
    /// Checks every mutation in `batch` against the store plus the creates
    /// earlier in the same batch. Nothing is written.
    fn validate(&self, batch: &[LedgerMutation]) -> Result<(), StoreError> {
        let mut accounts = BTreeSet::new();
        let mut wallets = BTreeSet::new();
        let mut codes = BTreeSet::new();
        let mut handles = BTreeSet::new();
        let mut stakes = BTreeSet::new();
        let mut edges = BTreeSet::new();

        let account_known = |id: &str, pending: &BTreeSet<AccountId>| -> bool {
            pending.contains(id) || self.account(id).is_some()
        };

        for mutation in batch {
            match mutation {
                LedgerMutation::CreateAccount(account) => {
                    if self.account(&account.id).is_some() || !accounts.insert(account.id.clone()) {
                        return Err(StoreError::DuplicateAccount {
                            id: account.id.clone(),
                        });
                    }
                    if self.account_by_wallet(&account.wallet_address).is_some()
                        || !wallets.insert(account.wallet_address.clone())
                    {
                        return Err(StoreError::WalletTaken {
                            wallet: account.wallet_address.clone(),
                        });
                    }
                    if self.account_by_referral_code(&account.referral_code).is_some()
                        || !codes.insert(account.referral_code.clone())
                    {
                        return Err(StoreError::ReferralCodeTaken {
                            code: account.referral_code.clone(),
                        });
                    }
                    if let Some(handle) = &account.messaging_id {
                        if self.account_by_messaging_id(handle).is_some()
                            || !handles.insert(handle.clone())
                        {
                            return Err(StoreError::MessagingIdTaken {
                                handle: handle.clone(),
                            });
                        }
                    }
                    if let Some(referrer) = &account.referrer_id {
                        if !account_known(referrer.as_str(), &accounts) {
                            return Err(StoreError::UnknownAccount {
                                id: referrer.clone(),
                            });
                        }
                    }
                }
                LedgerMutation::UpdateAccount { id, patch } => {
                    if !account_known(id.as_str(), &accounts) {
                        return Err(StoreError::UnknownAccount { id: id.clone() });
                    }
                    if let Some(handle) = &patch.messaging_id {
                        let taken = self
                            .account_by_messaging_id(handle)
                            .map_or(false, |owner| &owner.id != id);
                        if taken || !handles.insert(handle.clone()) {
                            return Err(StoreError::MessagingIdTaken {
                                handle: handle.clone(),
                            });
                        }
                    }
                }
                LedgerMutation::CreateStake(stake) => {
                    if self.stake(&stake.id).is_some() || !stakes.insert(stake.id.clone()) {
                        return Err(StoreError::DuplicateStake {
                            id: stake.id.clone(),
                        });
                    }
                    if !account_known(stake.account_id.as_str(), &accounts) {
                        return Err(StoreError::UnknownAccount {
                            id: stake.account_id.clone(),
                        });
                    }
                }
                LedgerMutation::UpdateStake { id, .. } => {
                    if !stakes.contains(id) && self.stake(id).is_none() {
                        return Err(StoreError::UnknownStake { id: id.clone() });
                    }
                }
                LedgerMutation::CreateReferral(edge) => {
                    let key = edge.key();
                    if self.referral(&key).is_some() || !edges.insert(key) {
                        return Err(StoreError::DuplicateReferral {
                            referred_id: edge.referred_id.clone(),
                            level: edge.level,
                        });
                    }
                    for id in [&edge.referrer_id, &edge.referred_id] {
                        if !account_known(id.as_str(), &accounts) {
                            return Err(StoreError::UnknownAccount { id: id.clone() });
                        }
                    }
                }
                LedgerMutation::UpdateReferral { key, .. } => {
                    if !edges.contains(key) && self.referral(key).is_none() {
                        return Err(StoreError::UnknownReferral {
                            referred_id: key.referred_id.clone(),
                            level: key.level,
                        });
                    }
                }
                LedgerMutation::UpdateSettings(_) => {}
            }
        }
        Ok(())
    }

    /// Applies `batch` in order. Either every mutation lands or none does.
    fn apply(&mut self, batch: &[LedgerMutation]) -> Result<(), StoreError> {
        self.validate(batch)?;
        for mutation in batch {
            match mutation {
                LedgerMutation::CreateAccount(account) => self.create_account(account.clone())?,
                LedgerMutation::UpdateAccount { id, patch } => {
                    self.update_account(id, patch)?;
                }
                LedgerMutation::CreateStake(stake) => self.create_stake(stake.clone())?,
                LedgerMutation::UpdateStake { id, patch } => {
                    self.update_stake(id, patch)?;
                }
                LedgerMutation::CreateReferral(edge) => self.create_referral(edge.clone())?,
                LedgerMutation::UpdateReferral { key, patch } => {
                    self.update_referral(key, patch)?;
                }
                LedgerMutation::UpdateSettings(patch) => {
                    self.update_settings(patch);
                }
            }
        }
        Ok(())
    }
}

