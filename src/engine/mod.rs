//! The ledger facade exposed to the service layer.
//!
//! Every mutating call takes the store's write lock, reads what it needs,
//! plans one batch of mutations and applies it in a single call, so an
//! operation is either fully visible or not visible at all.

use log::{debug, info, warn};
use parking_lot::RwLock;
use rand::{rngs::OsRng, RngCore};
use serde::Deserialize;

use crate::accounting::{self, AggregateDrift, RepairReport};
use crate::clock::{Clock, SystemClock};
use crate::error::{LedgerError, Result};
use crate::model::{Account, AccountId, Amount, LockDuration, ReferralEdge, Settings, Stake};
use crate::rates::{self, CommissionTier};
use crate::referral::{self, CommissionPayout, LevelSummary};
use crate::staking;
use crate::store::{AccountPatch, LedgerMutation, LedgerStore, SettingsPatch};

pub const DEFAULT_REFERRAL_CODE_LEN: usize = 8;
pub const MIN_REFERRAL_CODE_LEN: usize = 6;
pub const MAX_REFERRAL_CODE_LEN: usize = 16;
/// Fresh ids and codes drawn before giving up on finding an unused one.
const MAX_DRAWS: usize = 64;

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct RegisterRequest {
    pub wallet_address: String,
    /// Code of the account that referred this one.
    pub referrer_code: Option<String>,
    /// Requested own code; generated when absent.
    pub referral_code: Option<String>,
    pub messaging_id: Option<String>,
}

impl RegisterRequest {
    pub fn new(wallet_address: impl Into<String>) -> Self {
        Self {
            wallet_address: wallet_address.into(),
            ..Default::default()
        }
    }

    pub fn referred_by(mut self, code: impl Into<String>) -> Self {
        self.referrer_code = Some(code.into());
        self
    }
}

pub struct Ledger<S, C = SystemClock> {
    store: RwLock<S>,
    clock: C,
    referral_code_len: usize,
}

impl<S: LedgerStore> Ledger<S, SystemClock> {
    pub fn with_system_clock(store: S) -> Self {
        Self::new(store, SystemClock)
    }
}

impl<S: LedgerStore, C: Clock> Ledger<S, C> {
    pub fn new(store: S, clock: C) -> Self {
        Self {
            store: RwLock::new(store),
            clock,
            referral_code_len: DEFAULT_REFERRAL_CODE_LEN,
        }
    }

    /// Length of generated referral codes, clamped to
    /// `MIN_REFERRAL_CODE_LEN..=MAX_REFERRAL_CODE_LEN`.
    pub fn with_referral_code_len(mut self, len: usize) -> Self {
        let clamped = len.clamp(MIN_REFERRAL_CODE_LEN, MAX_REFERRAL_CODE_LEN);
        if clamped != len {
            warn!("referral code length {len} out of range, using {clamped}");
        }
        self.referral_code_len = clamped;
        self
    }

    pub fn referral_code_len(&self) -> usize {
        self.referral_code_len
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Runs `f` against a consistent view of the store.
    pub fn read<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        f(&self.store.read())
    }

    pub fn into_store(self) -> S {
        self.store.into_inner()
    }

    fn commit(store: &mut S, op: &str, batch: &[LedgerMutation]) -> Result<()> {
        store.apply(batch)?;
        debug!("{op}: applied {} mutations", batch.len());
        Ok(())
    }

    // ---------------------------------------------------------------- accounts

    pub fn register(&self, request: RegisterRequest) -> Result<Account> {
        let wallet_address = normalize_wallet(&request.wallet_address)?;
        let referrer_code = request
            .referrer_code
            .as_deref()
            .map(normalize_referrer_code)
            .transpose()?;
        let requested_code = request
            .referral_code
            .as_deref()
            .map(normalize_own_code)
            .transpose()?;
        let messaging_id = request
            .messaging_id
            .as_deref()
            .map(normalize_handle)
            .transpose()?;

        let now = self.clock.now_ms();
        let mut store = self.store.write();

        if store.account_by_wallet(&wallet_address).is_some() {
            return Err(LedgerError::duplicate(
                "wallet_registered",
                format!("{wallet_address} is already registered"),
            ));
        }
        let referrer = match &referrer_code {
            Some(code) => Some(
                store
                    .account_by_referral_code(code)
                    .ok_or_else(|| LedgerError::not_found("referrer", code.clone()))?,
            ),
            None => None,
        };
        let referral_code = match requested_code {
            Some(code) => {
                if store.account_by_referral_code(&code).is_some() {
                    return Err(LedgerError::duplicate(
                        "referral_code_taken",
                        format!("{code} is already in use"),
                    ));
                }
                code
            }
            None => first_unused(
                || random_code(self.referral_code_len),
                |code| store.account_by_referral_code(code).is_some(),
            )
            .ok_or_else(|| {
                LedgerError::conflict(
                    "referral_code_exhausted",
                    format!(
                        "no unused {}-character referral code after {MAX_DRAWS} draws",
                        self.referral_code_len
                    ),
                )
            })?,
        };
        if let Some(handle) = &messaging_id {
            if store.account_by_messaging_id(handle).is_some() {
                return Err(LedgerError::duplicate(
                    "messaging_id_taken",
                    format!("{handle} is linked to another account"),
                ));
            }
        }
        let id = first_unused(|| random_id("acct"), |id| store.account(id).is_some())
            .ok_or_else(|| LedgerError::conflict("id_exhausted", "no unused account id"))?;

        let account = Account {
            id: id.clone(),
            wallet_address,
            referral_code,
            referrer_id: referrer.as_ref().map(|r| r.id.clone()),
            total_staked: 0,
            total_earned: 0,
            referral_earnings: 0,
            claimed_referral_earnings: 0,
            total_referrals: 0,
            is_registered: true,
            messaging_id,
            created_at: now,
        };
        let mut batch = vec![LedgerMutation::CreateAccount(account.clone())];
        if let Some(referrer) = &referrer {
            batch.extend(referral::plan_chain(&*store, &id, referrer, now)?);
        }
        Self::commit(&mut store, "register", &batch)?;
        info!(
            "registered {} ({}) referrer={}",
            account.id,
            account.wallet_address,
            account.referrer_id.as_deref().unwrap_or("-")
        );
        Ok(account)
    }

    pub fn link_messaging_id(&self, account_id: &str, handle: &str) -> Result<Account> {
        let handle = normalize_handle(handle)?;
        let mut store = self.store.write();
        let account = store
            .account(account_id)
            .ok_or_else(|| LedgerError::not_found("account", account_id))?;
        if let Some(owner) = store.account_by_messaging_id(&handle) {
            if owner.id != account.id {
                return Err(LedgerError::duplicate(
                    "messaging_id_taken",
                    format!("{handle} is linked to another account"),
                ));
            }
            return Ok(account);
        }
        let batch = [LedgerMutation::UpdateAccount {
            id: account.id.clone(),
            patch: AccountPatch {
                messaging_id: Some(handle),
                ..Default::default()
            },
        }];
        Self::commit(&mut store, "link_messaging_id", &batch)?;
        info!("linked messaging id to {}", account.id);
        store
            .account(account_id)
            .ok_or_else(|| LedgerError::not_found("account", account_id))
    }

    pub fn account(&self, id: &str) -> Result<Account> {
        self.store
            .read()
            .account(id)
            .ok_or_else(|| LedgerError::not_found("account", id))
    }

    pub fn account_by_wallet(&self, wallet: &str) -> Result<Account> {
        let wallet = normalize_wallet(wallet)?;
        self.store
            .read()
            .account_by_wallet(&wallet)
            .ok_or_else(|| LedgerError::not_found("account", wallet))
    }

    pub fn account_by_referral_code(&self, code: &str) -> Result<Account> {
        let code = normalize_referrer_code(code)?;
        self.store
            .read()
            .account_by_referral_code(&code)
            .ok_or_else(|| LedgerError::not_found("account", code))
    }

    // ---------------------------------------------------------------- stakes

    pub fn create_stake(
        &self,
        account_id: &str,
        amount: Amount,
        lock_duration: LockDuration,
    ) -> Result<Stake> {
        let now = self.clock.now_ms();
        let mut store = self.store.write();
        if store.settings().paused {
            return Err(LedgerError::conflict("paused", "staking is paused"));
        }
        let owner = store
            .account(account_id)
            .ok_or_else(|| LedgerError::not_found("account", account_id))?;
        let id = first_unused(|| random_id("stk"), |id| store.stake(id).is_some())
            .ok_or_else(|| LedgerError::conflict("id_exhausted", "no unused stake id"))?;
        let stake = staking::new_stake(id, &owner.id, amount, lock_duration, now)?;
        let batch = staking::plan_create(&owner, stake.clone())?;
        Self::commit(&mut store, "create_stake", &batch)?;
        info!(
            "stake {} opened: {} units for {} by {}, matures at {}",
            stake.id, stake.amount, stake.lock_duration, owner.id, stake.maturity_time
        );
        Ok(stake)
    }

    /// Single stake, with the unlockable flag brought up to date.
    pub fn stake(&self, stake_id: &str) -> Result<Stake> {
        let now = self.clock.now_ms();
        let mut store = self.store.write();
        let stake = store
            .stake(stake_id)
            .ok_or_else(|| LedgerError::not_found("stake", stake_id))?;
        Self::refresh(&mut store, vec![stake], now).map(|mut v| v.remove(0))
    }

    /// All stakes of an account, with matured ones flipped to unlockable.
    pub fn stakes_for(&self, account_id: &str) -> Result<Vec<Stake>> {
        let now = self.clock.now_ms();
        let mut store = self.store.write();
        if store.account(account_id).is_none() {
            return Err(LedgerError::not_found("account", account_id));
        }
        let stakes = store.stakes_by_owner(account_id);
        Self::refresh(&mut store, stakes, now)
    }

    fn refresh(store: &mut S, mut stakes: Vec<Stake>, now: u64) -> Result<Vec<Stake>> {
        let mut batch = Vec::new();
        for stake in &mut stakes {
            if let Some(patch) = staking::refresh_patch(stake, now) {
                patch.apply_to(stake);
                batch.push(LedgerMutation::UpdateStake {
                    id: stake.id.clone(),
                    patch,
                });
            }
        }
        if !batch.is_empty() {
            Self::commit(store, "refresh_unlockable", &batch)?;
            debug!("{} stakes became unlockable", batch.len());
        }
        Ok(stakes)
    }

    pub fn unstake(&self, stake_id: &str) -> Result<Stake> {
        let now = self.clock.now_ms();
        let mut store = self.store.write();
        let stake = store
            .stake(stake_id)
            .ok_or_else(|| LedgerError::not_found("stake", stake_id))?;
        let owner = store
            .account(&stake.account_id)
            .ok_or_else(|| LedgerError::not_found("account", stake.account_id.clone()))?;
        let (reward, batch) = staking::plan_unstake(&owner, &stake, now).map_err(|err| {
            warn!("unstake of {stake_id} rejected: {err}");
            err
        })?;
        Self::commit(&mut store, "unstake", &batch)?;
        info!("stake {stake_id} closed, reward {reward} credited to {}", owner.id);
        store
            .stake(stake_id)
            .ok_or_else(|| LedgerError::not_found("stake", stake_id))
    }

    pub fn emergency_unstake(&self, stake_id: &str) -> Result<Stake> {
        let mut store = self.store.write();
        let settings = store.settings();
        let stake = store
            .stake(stake_id)
            .ok_or_else(|| LedgerError::not_found("stake", stake_id))?;
        let owner = store
            .account(&stake.account_id)
            .ok_or_else(|| LedgerError::not_found("account", stake.account_id.clone()))?;
        let batch = staking::plan_emergency_unstake(&settings, &owner, &stake).map_err(|err| {
            warn!("emergency unstake of {stake_id} rejected: {err}");
            err
        })?;
        Self::commit(&mut store, "emergency_unstake", &batch)?;
        warn!("stake {stake_id} closed by emergency exit, reward forfeited");
        store
            .stake(stake_id)
            .ok_or_else(|| LedgerError::not_found("stake", stake_id))
    }

    // ---------------------------------------------------------------- referrals

    /// Credits the upline of `referred_id` with commission on `base_amount`.
    pub fn accrue_referral_commission(
        &self,
        referred_id: &str,
        base_amount: Amount,
    ) -> Result<Vec<CommissionPayout>> {
        if base_amount == 0 {
            return Err(LedgerError::validation(
                "non_positive_amount",
                "commission base must be greater than zero",
            ));
        }
        let mut store = self.store.write();
        if store.account(referred_id).is_none() {
            return Err(LedgerError::not_found("account", referred_id));
        }
        let (payouts, batch) = referral::plan_commission(&*store, referred_id, base_amount)?;
        if !batch.is_empty() {
            Self::commit(&mut store, "accrue_referral_commission", &batch)?;
        }
        info!(
            "commission on {base_amount} from {referred_id}: {} payouts",
            payouts.len()
        );
        Ok(payouts)
    }

    /// Moves pending referral earnings into total earned. Returns the account after the claim.
    pub fn claim_referral_earnings(&self, account_id: &str) -> Result<Account> {
        let mut store = self.store.write();
        let account = store
            .account(account_id)
            .ok_or_else(|| LedgerError::not_found("account", account_id))?;
        let pending = account.referral_earnings;
        if pending == 0 {
            return Err(LedgerError::conflict(
                "nothing_to_claim",
                format!("{account_id} has no pending referral earnings"),
            ));
        }
        let total_earned = account
            .total_earned
            .checked_add(pending)
            .ok_or_else(|| LedgerError::validation("amount_overflow", "total earned"))?;
        let claimed = account
            .claimed_referral_earnings
            .checked_add(pending)
            .ok_or_else(|| LedgerError::validation("amount_overflow", "claimed earnings"))?;
        let batch = [LedgerMutation::UpdateAccount {
            id: account.id.clone(),
            patch: AccountPatch {
                referral_earnings: Some(0),
                total_earned: Some(total_earned),
                claimed_referral_earnings: Some(claimed),
                ..Default::default()
            },
        }];
        Self::commit(&mut store, "claim_referral_earnings", &batch)?;
        info!("{account_id} claimed {pending} referral earnings");
        store
            .account(account_id)
            .ok_or_else(|| LedgerError::not_found("account", account_id))
    }

    /// Edges pointing at `account_id`, level 1 first.
    pub fn upline_edges(&self, account_id: &str) -> Result<Vec<ReferralEdge>> {
        let store = self.store.read();
        if store.account(account_id).is_none() {
            return Err(LedgerError::not_found("account", account_id));
        }
        Ok(store.referrals_by_referred(account_id))
    }

    pub fn referral_summary(&self, account_id: &str) -> Result<Vec<LevelSummary>> {
        let store = self.store.read();
        if store.account(account_id).is_none() {
            return Err(LedgerError::not_found("account", account_id));
        }
        Ok(referral::summarize_downline(
            &store.referrals_by_referrer(account_id),
        ))
    }

    pub fn commission_schedule(&self) -> Vec<CommissionTier> {
        rates::commission_schedule()
    }

    // ---------------------------------------------------------------- admin

    pub fn settings(&self) -> Settings {
        self.store.read().settings()
    }

    pub fn update_settings(&self, patch: SettingsPatch) -> Result<Settings> {
        let patch = SettingsPatch {
            updated_at: Some(self.clock.now_ms()),
            ..patch
        };
        let mut store = self.store.write();
        Self::commit(&mut store, "update_settings", &[LedgerMutation::UpdateSettings(patch)])?;
        let settings = store.settings();
        info!(
            "settings updated: paused={} emergency_unstake_enabled={}",
            settings.paused, settings.emergency_unstake_enabled
        );
        Ok(settings)
    }

    pub fn audit_aggregates(&self) -> Vec<AggregateDrift> {
        accounting::audit(&*self.store.read())
    }

    /// Recomputes every account's totals from raw records and repairs drift.
    pub fn recompute_aggregates(&self) -> Result<RepairReport> {
        let mut store = self.store.write();
        let accounts_scanned = store.accounts().len();
        let repaired = accounting::audit(&*store);
        if !repaired.is_empty() {
            Self::commit(
                &mut store,
                "recompute_aggregates",
                &accounting::repair_mutations(&repaired),
            )?;
            for drift in &repaired {
                warn!(
                    "repaired aggregates of {}: {:?} -> {:?}",
                    drift.account_id, drift.recorded, drift.derived
                );
            }
        }
        Ok(RepairReport {
            accounts_scanned,
            repaired,
        })
    }

    /// Resets each `total_referrals` to its count of level-1 edges.
    pub fn recalculate_referrals(&self) -> Result<Vec<(AccountId, u32, u32)>> {
        let mut store = self.store.write();
        let (fixes, batch) = accounting::referral_count_repairs(&*store);
        if !batch.is_empty() {
            Self::commit(&mut store, "recalculate_referrals", &batch)?;
        }
        for (id, recorded, derived) in &fixes {
            warn!("total_referrals of {id}: {recorded} -> {derived}");
        }
        Ok(fixes)
    }
}

fn first_unused(
    mut draw: impl FnMut() -> String,
    taken: impl Fn(&str) -> bool,
) -> Option<String> {
    (0..MAX_DRAWS).map(|_| draw()).find(|candidate| !taken(candidate))
}

fn random_id(prefix: &str) -> String {
    let mut bytes = [0u8; 8];
    OsRng.fill_bytes(&mut bytes);
    format!("{prefix}_{}", hex::encode(bytes))
}

fn random_code(len: usize) -> String {
    let mut bytes = vec![0u8; (len + 1) / 2];
    OsRng.fill_bytes(&mut bytes);
    let mut code = hex::encode_upper(bytes);
    code.truncate(len);
    code
}

/// `0x` + 40 hex digits, lowercased.
pub fn normalize_wallet(input: &str) -> Result<String> {
    let trimmed = input.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or("");
    if digits.len() != 40 || hex::decode(digits).is_err() {
        return Err(LedgerError::validation(
            "invalid_wallet_address",
            format!("{input:?} is not a 0x-prefixed 20-byte hex address"),
        ));
    }
    Ok(format!("0x{}", digits.to_ascii_lowercase()))
}

fn normalize_referrer_code(input: &str) -> Result<String> {
    let code = input.trim();
    if code.is_empty() || !code.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(LedgerError::validation(
            "invalid_referrer",
            format!("{input:?} is not a referral code"),
        ));
    }
    Ok(code.to_ascii_uppercase())
}

fn normalize_own_code(input: &str) -> Result<String> {
    let code = input.trim();
    if !(4..=16).contains(&code.len()) || !code.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(LedgerError::validation(
            "invalid_referral_code",
            "referral codes are 4-16 letters or digits",
        ));
    }
    Ok(code.to_ascii_uppercase())
}

fn normalize_handle(input: &str) -> Result<String> {
    let handle = input.trim();
    if handle.is_empty() {
        return Err(LedgerError::validation(
            "invalid_messaging_id",
            "messaging id must not be empty",
        ));
    }
    Ok(handle.to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::clock::ManualClock;
    use crate::error::ErrorKind;
    use crate::model::{StakeState, PERIOD_MS};
    use crate::store::{AccountDirectory, MemoryStore, StakeDirectory};

    fn wallet(n: usize) -> String {
        format!("0x{:040x}", n)
    }

    fn ledger() -> Ledger<MemoryStore, Arc<ManualClock>> {
        Ledger::new(MemoryStore::new(), Arc::new(ManualClock::new(1_000)))
    }

    #[test]
    fn three_generation_scenario() {
        let ledger = ledger();
        let a = ledger.register(RegisterRequest::new(wallet(1))).unwrap();
        let b = ledger
            .register(RegisterRequest::new(wallet(2)).referred_by(&a.referral_code))
            .unwrap();
        let c = ledger
            .register(RegisterRequest::new(wallet(3)).referred_by(&b.referral_code))
            .unwrap();

        let edges = ledger.upline_edges(&c.id).unwrap();
        let got: Vec<_> = edges
            .iter()
            .map(|e| (e.referrer_id.clone(), e.level, e.commission_bps))
            .collect();
        assert_eq!(got, vec![(b.id.clone(), 1, 1_200), (a.id.clone(), 2, 800)]);
        assert_eq!(ledger.account(&a.id).unwrap().total_referrals, 1);
        assert_eq!(ledger.account(&b.id).unwrap().total_referrals, 1);
        assert_eq!(ledger.account(&c.id).unwrap().total_referrals, 0);
    }

    #[test]
    fn duplicate_wallet_is_rejected_before_linking() {
        let ledger = ledger();
        let a = ledger.register(RegisterRequest::new(wallet(1))).unwrap();
        ledger
            .register(RegisterRequest::new(wallet(2)).referred_by(&a.referral_code))
            .unwrap();
        let upper = wallet(2).replace("0x", "0X");
        let err = ledger
            .register(RegisterRequest::new(upper).referred_by(&a.referral_code))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Duplicate);
        assert_eq!(err.reason_code(), "wallet_registered");
        assert_eq!(ledger.account(&a.id).unwrap().total_referrals, 1);
    }

    #[test]
    fn registration_input_validation() {
        let ledger = ledger();
        let err = ledger.register(RegisterRequest::new("0x1234")).unwrap_err();
        assert_eq!(err.reason_code(), "invalid_wallet_address");
        let err = ledger
            .register(RegisterRequest::new(wallet(1)).referred_by("no such!"))
            .unwrap_err();
        assert_eq!(err.reason_code(), "invalid_referrer");
        let err = ledger
            .register(RegisterRequest::new(wallet(1)).referred_by("ABCDEF12"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.reason_code(), "referrer_not_found");
        assert!(ledger.read(|s| s.accounts().is_empty()));
    }

    #[test]
    fn requested_code_and_messaging_id() {
        let ledger = ledger();
        let mut request = RegisterRequest::new(wallet(1));
        request.referral_code = Some("moon42".into());
        request.messaging_id = Some("@alice".into());
        let a = ledger.register(request).unwrap();
        assert_eq!(a.referral_code, "MOON42");
        assert_eq!(ledger.account_by_referral_code("moon42").unwrap().id, a.id);

        let mut clash = RegisterRequest::new(wallet(2));
        clash.referral_code = Some("MOON42".into());
        assert_eq!(
            ledger.register(clash).unwrap_err().reason_code(),
            "referral_code_taken"
        );

        let b = ledger.register(RegisterRequest::new(wallet(3))).unwrap();
        let err = ledger.link_messaging_id(&b.id, "@alice").unwrap_err();
        assert_eq!(err.reason_code(), "messaging_id_taken");
        let b = ledger.link_messaging_id(&b.id, "@bob").unwrap();
        assert_eq!(b.messaging_id.as_deref(), Some("@bob"));
    }

    #[test]
    fn generated_codes_have_configured_length() {
        let ledger = ledger().with_referral_code_len(10);
        let a = ledger.register(RegisterRequest::new(wallet(1))).unwrap();
        assert_eq!(a.referral_code.len(), 10);
        assert!(a.referral_code.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn code_length_is_clamped() {
        let ledger = ledger().with_referral_code_len(0);
        assert_eq!(ledger.referral_code_len(), MIN_REFERRAL_CODE_LEN);
        let a = ledger.register(RegisterRequest::new(wallet(1))).unwrap();
        let b = ledger.register(RegisterRequest::new(wallet(2))).unwrap();
        assert_eq!(a.referral_code.len(), MIN_REFERRAL_CODE_LEN);
        assert_ne!(a.referral_code, b.referral_code);
        assert_eq!(
            self::ledger().with_referral_code_len(64).referral_code_len(),
            MAX_REFERRAL_CODE_LEN
        );
    }

    #[test]
    fn draws_stop_when_every_candidate_is_taken() {
        let mut draws = 0;
        let found = first_unused(
            || {
                draws += 1;
                "AAAAAA".to_string()
            },
            |code| code == "AAAAAA",
        );
        assert_eq!(found, None);
        assert_eq!(draws, MAX_DRAWS);
        assert_eq!(
            first_unused(|| "BBBBBB".to_string(), |code| code == "AAAAAA").as_deref(),
            Some("BBBBBB")
        );
    }

    #[test]
    fn stake_lifecycle_with_simulated_time() {
        let ledger = ledger();
        let a = ledger.register(RegisterRequest::new(wallet(1))).unwrap();
        let stake = ledger
            .create_stake(&a.id, 1_000, LockDuration::ThreeMonths)
            .unwrap();
        assert_eq!(stake.maturity_time, 1_000 + 3 * PERIOD_MS);
        assert_eq!(ledger.account(&a.id).unwrap().total_staked, 1_000);

        let err = ledger.unstake(&stake.id).unwrap_err();
        assert_eq!(err.reason_code(), "stake_locked");

        ledger.clock().advance(3 * PERIOD_MS - 1);
        assert_eq!(ledger.stake(&stake.id).unwrap().state(), StakeState::Locked);
        ledger.clock().advance(1);
        let listed = ledger.stakes_for(&a.id).unwrap();
        assert_eq!(listed[0].state(), StakeState::Unlockable);
        assert!(ledger.read(|s| s.stake(&stake.id).unwrap().is_unlockable));

        ledger.clock().advance(PERIOD_MS / 2);
        let closed = ledger.unstake(&stake.id).unwrap();
        assert_eq!(closed.state(), StakeState::Closed);
        assert_eq!(closed.earned_amount, 300);
        let account = ledger.account(&a.id).unwrap();
        assert_eq!(account.total_earned, 300);
        assert_eq!(account.total_staked, 0);

        let err = ledger.unstake(&stake.id).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StateConflict);
        assert_eq!(ledger.stake(&stake.id).unwrap().earned_amount, 300);
        assert_eq!(ledger.account(&a.id).unwrap().total_earned, 300);
    }

    #[test]
    fn unstake_without_prior_listing_sees_maturity() {
        let ledger = ledger();
        let a = ledger.register(RegisterRequest::new(wallet(1))).unwrap();
        let stake = ledger
            .create_stake(&a.id, 2_000, LockDuration::SixMonths)
            .unwrap();
        ledger.clock().advance(6 * PERIOD_MS);
        let closed = ledger.unstake(&stake.id).unwrap();
        assert_eq!(closed.earned_amount, 2_000 * 1_200 / 10_000 * 6);
    }

    #[test]
    fn emergency_exit_forfeits_reward() {
        let ledger = ledger();
        let a = ledger.register(RegisterRequest::new(wallet(1))).unwrap();
        let stake = ledger
            .create_stake(&a.id, 1_000, LockDuration::TwelveMonths)
            .unwrap();
        assert_eq!(
            ledger.emergency_unstake(&stake.id).unwrap_err().reason_code(),
            "emergency_unstake_unavailable"
        );
        ledger
            .update_settings(SettingsPatch {
                paused: Some(true),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(
            ledger.emergency_unstake(&stake.id).unwrap_err().reason_code(),
            "emergency_unstake_unavailable"
        );
        assert_eq!(
            ledger
                .create_stake(&a.id, 5, LockDuration::ThreeMonths)
                .unwrap_err()
                .reason_code(),
            "paused"
        );
        let settings = ledger
            .update_settings(SettingsPatch {
                emergency_unstake_enabled: Some(true),
                ..Default::default()
            })
            .unwrap();
        assert!(settings.paused && settings.emergency_unstake_enabled);
        assert_eq!(settings.updated_at, 1_000);

        ledger.clock().advance(13 * PERIOD_MS);
        let closed = ledger.emergency_unstake(&stake.id).unwrap();
        assert_eq!(closed.earned_amount, 0);
        assert!(!closed.is_active);
        let account = ledger.account(&a.id).unwrap();
        assert_eq!(account.total_staked, 0);
        assert_eq!(account.total_earned, 0);
        assert_eq!(
            ledger.emergency_unstake(&stake.id).unwrap_err().reason_code(),
            "stake_closed"
        );
        assert_eq!(
            ledger.unstake(&stake.id).unwrap_err().reason_code(),
            "stake_closed"
        );
    }

    #[test]
    fn claim_moves_pending_into_total_earned() {
        let ledger = ledger();
        let a = ledger.register(RegisterRequest::new(wallet(1))).unwrap();
        let b = ledger
            .register(RegisterRequest::new(wallet(2)).referred_by(&a.referral_code))
            .unwrap();
        let payouts = ledger.accrue_referral_commission(&b.id, 1_250).unwrap();
        assert_eq!(payouts.len(), 1);
        assert_eq!(payouts[0].amount, 150);

        let stake = ledger
            .create_stake(&a.id, 500, LockDuration::ThreeMonths)
            .unwrap();
        ledger.clock().advance(3 * PERIOD_MS);
        ledger.unstake(&stake.id).unwrap();
        let before = ledger.account(&a.id).unwrap();
        assert_eq!(before.referral_earnings, 150);
        assert_eq!(before.total_earned, 150);

        let after = ledger.claim_referral_earnings(&a.id).unwrap();
        assert_eq!(after.referral_earnings, 0);
        assert_eq!(after.total_earned, 300);
        assert_eq!(after.claimed_referral_earnings, 150);
        assert_eq!(
            ledger.claim_referral_earnings(&a.id).unwrap_err().reason_code(),
            "nothing_to_claim"
        );
        assert!(ledger.audit_aggregates().is_empty());

        let summary = ledger.referral_summary(&a.id).unwrap();
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].earned, 150);
    }

    #[test]
    fn recompute_repairs_tampered_totals() {
        let ledger = ledger();
        let a = ledger.register(RegisterRequest::new(wallet(1))).unwrap();
        ledger
            .register(RegisterRequest::new(wallet(2)).referred_by(&a.referral_code))
            .unwrap();
        ledger
            .create_stake(&a.id, 700, LockDuration::SixMonths)
            .unwrap();
        assert!(ledger.audit_aggregates().is_empty());

        let mut store = ledger.into_store();
        store
            .apply(&[LedgerMutation::UpdateAccount {
                id: a.id.clone(),
                patch: AccountPatch {
                    total_staked: Some(1),
                    total_referrals: Some(5),
                    ..Default::default()
                },
            }])
            .unwrap();
        let ledger = Ledger::new(store, ManualClock::new(0));
        assert_eq!(ledger.audit_aggregates().len(), 1);
        let fixes = ledger.recalculate_referrals().unwrap();
        assert_eq!(fixes, vec![(a.id.clone(), 5, 1)]);
        let report = ledger.recompute_aggregates().unwrap();
        assert_eq!(report.accounts_scanned, 2);
        assert_eq!(report.repaired.len(), 1);
        assert_eq!(ledger.account(&a.id).unwrap().total_staked, 700);
        assert!(ledger.audit_aggregates().is_empty());
    }

    #[test]
    fn concurrent_sibling_registrations_keep_every_increment() {
        let ledger = Arc::new(ledger());
        let root = ledger.register(RegisterRequest::new(wallet(0))).unwrap();
        let handles: Vec<_> = (1..=32)
            .map(|n| {
                let ledger = Arc::clone(&ledger);
                let code = root.referral_code.clone();
                std::thread::spawn(move || {
                    ledger
                        .register(RegisterRequest::new(wallet(n)).referred_by(code))
                        .unwrap()
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(ledger.account(&root.id).unwrap().total_referrals, 32);
        assert!(ledger.audit_aggregates().is_empty());
    }
}
