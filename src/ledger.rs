// ledger.rs - Session ledger
//
// Owns per-account token balances, channel escrow rows and app-session
// sub-ledgers. Every public operation validates fully before the first
// mutation, so a returned error means nothing changed. The caller holds the
// write lock and persists after commit.

use std::collections::{HashMap, HashSet};

use alloy::primitives::{Address, B256, U256};

use crate::error::AppError;
use crate::model::{
    AppAllocation, AppDefinition, AppIntent, AppSession, AppStatus, LedgerTransaction, TxType,
};

// =============================================================================
// QUORUM
// =============================================================================

/// Sum the weights of valid signers and compare against the quorum. Signers
/// outside the participant list carry no weight; duplicates count once.
pub fn check_quorum(definition: &AppDefinition, signers: &[Address]) -> Result<(), AppError> {
    let unique: HashSet<Address> = signers.iter().copied().collect();
    let weight: u64 = unique.iter().map(|s| definition.weight_of(*s)).sum();
    if weight < definition.quorum {
        return Err(AppError::InsufficientSignatures {
            weight,
            quorum: definition.quorum,
        });
    }
    Ok(())
}

fn validate_definition(definition: &AppDefinition) -> Result<(), AppError> {
    if definition.participants.len() < 2 {
        return Err(AppError::InvalidParams(
            "app session needs at least two participants".into(),
        ));
    }
    if definition.weights.len() != definition.participants.len() {
        return Err(AppError::InvalidParams(
            "weights must parallel participants".into(),
        ));
    }
    let total: u64 = definition.weights.iter().sum();
    if definition.quorum == 0 || definition.quorum > total {
        return Err(AppError::InvalidParams(format!(
            "quorum {} unreachable with total weight {}",
            definition.quorum, total
        )));
    }
    Ok(())
}

// =============================================================================
// LEDGER
// =============================================================================

#[derive(Debug, Default)]
pub struct Ledger {
    /// account -> asset -> available balance
    accounts: HashMap<Address, HashMap<String, U256>>,
    /// account -> channels it participates in (status not VOID/FINAL)
    channel_sets: HashMap<Address, HashSet<B256>>,
    /// channel -> asset -> escrowed balance
    escrow: HashMap<B256, HashMap<String, U256>>,
    /// open and closed app sessions
    sessions: HashMap<B256, AppSession>,
    /// committed mutations, append-only
    journal: Vec<LedgerTransaction>,
    next_tx_id: u64,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    // -------------------------------------------------------------------------
    // reads
    // -------------------------------------------------------------------------

    pub fn balance(&self, account: Address, asset: &str) -> U256 {
        self.accounts
            .get(&account)
            .and_then(|row| row.get(asset))
            .copied()
            .unwrap_or(U256::ZERO)
    }

    /// All non-zero balances for an account, sorted by asset.
    pub fn balances(&self, account: Address) -> Vec<(String, U256)> {
        let mut rows: Vec<(String, U256)> = self
            .accounts
            .get(&account)
            .map(|row| {
                row.iter()
                    .filter(|(_, amount)| !amount.is_zero())
                    .map(|(asset, amount)| (asset.clone(), *amount))
                    .collect()
            })
            .unwrap_or_default();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }

    pub fn escrow_balance(&self, channel_id: B256, asset: &str) -> U256 {
        self.escrow
            .get(&channel_id)
            .and_then(|row| row.get(asset))
            .copied()
            .unwrap_or(U256::ZERO)
    }

    pub fn channels_of(&self, account: Address) -> Vec<B256> {
        self.channel_sets
            .get(&account)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn session(&self, id: B256) -> Option<&AppSession> {
        self.sessions.get(&id)
    }

    /// Journal length, used by callers to persist exactly the rows a
    /// committed operation appended.
    pub fn journal_len(&self) -> usize {
        self.journal.len()
    }

    pub fn journal_since(&self, mark: usize) -> &[LedgerTransaction] {
        &self.journal[mark.min(self.journal.len())..]
    }

    // -------------------------------------------------------------------------
    // internal mutation helpers
    // -------------------------------------------------------------------------

    fn credit(&mut self, account: Address, asset: &str, amount: U256) {
        if amount.is_zero() {
            return;
        }
        let row = self.accounts.entry(account).or_default();
        let entry = row.entry(asset.to_string()).or_insert(U256::ZERO);
        *entry += amount;
    }

    fn debit(&mut self, account: Address, asset: &str, amount: U256) -> Result<(), AppError> {
        if amount.is_zero() {
            return Ok(());
        }
        let available = self.balance(account, asset);
        if available < amount {
            return Err(AppError::InsufficientFunds {
                account: format!("0x{:x}", account),
                asset: asset.to_string(),
                available: available.to_string(),
                needed: amount.to_string(),
            });
        }
        let row = self.accounts.entry(account).or_default();
        let entry = row.entry(asset.to_string()).or_insert(U256::ZERO);
        *entry -= amount;
        Ok(())
    }

    fn record(
        &mut self,
        tx_type: TxType,
        from: Address,
        to: Address,
        asset: &str,
        amount: U256,
        now: u64,
    ) -> u64 {
        self.next_tx_id += 1;
        let id = self.next_tx_id;
        self.journal.push(LedgerTransaction {
            id,
            tx_type,
            from_account: from,
            to_account: to,
            asset: asset.to_string(),
            amount,
            created_at: now,
        });
        id
    }

    // -------------------------------------------------------------------------
    // account operations
    // -------------------------------------------------------------------------

    /// Credit an account from an observed on-chain deposit.
    pub fn deposit(&mut self, account: Address, asset: &str, amount: U256, now: u64) {
        self.credit(account, asset, amount);
        self.record(TxType::Deposit, Address::ZERO, account, asset, amount, now);
    }

    pub fn withdraw(
        &mut self,
        account: Address,
        asset: &str,
        amount: U256,
        now: u64,
    ) -> Result<(), AppError> {
        self.debit(account, asset, amount)?;
        self.record(TxType::Withdrawal, account, Address::ZERO, asset, amount, now);
        Ok(())
    }

    /// Direct off-chain move between two ledger accounts.
    pub fn transfer(
        &mut self,
        from: Address,
        to: Address,
        asset: &str,
        amount: U256,
        now: u64,
    ) -> Result<LedgerTransaction, AppError> {
        if from == to {
            return Err(AppError::InvalidParams("transfer to self".into()));
        }
        self.debit(from, asset, amount)?;
        self.credit(to, asset, amount);
        self.record(TxType::Transfer, from, to, asset, amount, now);
        Ok(self.journal.last().expect("just recorded").clone())
    }

    // -------------------------------------------------------------------------
    // channel escrow
    // -------------------------------------------------------------------------

    pub fn register_channel(&mut self, account: Address, channel_id: B256) {
        self.channel_sets.entry(account).or_default().insert(channel_id);
    }

    pub fn deregister_channel(&mut self, account: Address, channel_id: B256) {
        if let Some(set) = self.channel_sets.get_mut(&account) {
            set.remove(&channel_id);
        }
    }

    /// Atomically move account funds into a channel's escrow row.
    pub fn lock_to_channel(
        &mut self,
        account: Address,
        channel_id: B256,
        asset: &str,
        amount: U256,
        now: u64,
    ) -> Result<(), AppError> {
        self.debit(account, asset, amount)?;
        let row = self.escrow.entry(channel_id).or_default();
        *row.entry(asset.to_string()).or_insert(U256::ZERO) += amount;
        self.record(TxType::ChannelLock, account, Address::ZERO, asset, amount, now);
        Ok(())
    }

    /// Inverse of `lock_to_channel`: distribute escrow back to accounts.
    pub fn unlock_from_channel(
        &mut self,
        channel_id: B256,
        payouts: &[(Address, String, U256)],
        now: u64,
    ) -> Result<(), AppError> {
        // Validate the escrow covers every payout before mutating.
        let mut needed: HashMap<&str, U256> = HashMap::new();
        for (_, asset, amount) in payouts {
            *needed.entry(asset.as_str()).or_insert(U256::ZERO) += *amount;
        }
        for (asset, total) in &needed {
            let held = self.escrow_balance(channel_id, asset);
            if held < *total {
                return Err(AppError::AllocationMismatch(format!(
                    "escrow holds {} {}, payouts need {}",
                    held, asset, total
                )));
            }
        }
        for (account, asset, amount) in payouts {
            let row = self.escrow.entry(channel_id).or_default();
            let held = row.entry(asset.clone()).or_insert(U256::ZERO);
            *held -= *amount;
            self.credit(*account, asset, *amount);
            self.record(TxType::ChannelUnlock, Address::ZERO, *account, asset, *amount, now);
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // app sessions
    // -------------------------------------------------------------------------

    /// Open an app session: quorum over the initial allocation, funds moved
    /// from each funding participant's ledger into the session sub-ledger.
    pub fn create_app_session(
        &mut self,
        definition: AppDefinition,
        initial: Vec<AppAllocation>,
        signers: &[Address],
        now: u64,
    ) -> Result<&AppSession, AppError> {
        validate_definition(&definition)?;
        check_quorum(&definition, signers)?;

        let id = definition.session_id();
        if self.sessions.contains_key(&id) {
            return Err(AppError::InvalidParams(format!(
                "app session 0x{:x} already exists",
                id
            )));
        }

        let signer_set: HashSet<Address> = signers.iter().copied().collect();
        for allocation in &initial {
            if !definition.participants.contains(&allocation.participant) {
                return Err(AppError::InvalidParams(format!(
                    "allocation for non-participant 0x{:x}",
                    allocation.participant
                )));
            }
            // Moving a participant's funds requires that participant's signature.
            if !allocation.amount.is_zero() && !signer_set.contains(&allocation.participant) {
                return Err(AppError::InsufficientSignatures {
                    weight: 0,
                    quorum: definition.quorum,
                });
            }
            let available = self.balance(allocation.participant, &allocation.asset);
            if available < allocation.amount {
                return Err(AppError::InsufficientFunds {
                    account: format!("0x{:x}", allocation.participant),
                    asset: allocation.asset.clone(),
                    available: available.to_string(),
                    needed: allocation.amount.to_string(),
                });
            }
        }

        for allocation in &initial {
            self.debit(allocation.participant, &allocation.asset, allocation.amount)
                .expect("balance checked above");
            self.record(
                TxType::AppDeposit,
                allocation.participant,
                Address::ZERO,
                &allocation.asset,
                allocation.amount,
                now,
            );
        }

        let session = AppSession {
            id,
            definition,
            version: 1,
            status: AppStatus::Open,
            allocations: initial.into_iter().filter(|a| !a.amount.is_zero()).collect(),
        };
        self.sessions.insert(id, session);
        Ok(self.sessions.get(&id).expect("just inserted"))
    }

    /// Apply an app-session state update under quorum.
    ///
    /// OPERATE conserves the per-asset sum across participants; DEPOSIT
    /// moves the declared increase from participant ledgers into the
    /// session; WITHDRAW moves the decrease back out.
    pub fn submit_app_state(
        &mut self,
        id: B256,
        intent: AppIntent,
        version: u64,
        allocations: Vec<AppAllocation>,
        signers: &[Address],
        now: u64,
    ) -> Result<&AppSession, AppError> {
        let session = self
            .sessions
            .get(&id)
            .ok_or_else(|| AppError::ApplicationNotFound(format!("0x{:x}", id)))?;
        if session.status != AppStatus::Open {
            return Err(AppError::SessionClosed(format!("0x{:x}", id)));
        }
        check_quorum(&session.definition, signers)?;
        if version <= session.version {
            return Err(AppError::InvalidVersion {
                expected: session.version + 1,
                actual: version,
            });
        }
        for allocation in &allocations {
            if !session.definition.participants.contains(&allocation.participant) {
                return Err(AppError::InvalidParams(format!(
                    "allocation for non-participant 0x{:x}",
                    allocation.participant
                )));
            }
        }

        // Normalize over the union of (participant, asset) pairs; a pair
        // missing from the candidate is implicitly zero.
        let prior = pair_map(&session.allocations);
        let next = pair_map(&allocations);
        let mut pairs: HashSet<(Address, String)> = prior.keys().cloned().collect();
        pairs.extend(next.keys().cloned());

        let signer_set: HashSet<Address> = signers.iter().copied().collect();
        let mut ledger_moves: Vec<(Address, String, U256, bool)> = Vec::new();
        let mut sums_before: HashMap<String, U256> = HashMap::new();
        let mut sums_after: HashMap<String, U256> = HashMap::new();

        for (participant, asset) in &pairs {
            let key = (*participant, asset.clone());
            let before = prior.get(&key).copied().unwrap_or(U256::ZERO);
            let after = next.get(&key).copied().unwrap_or(U256::ZERO);
            *sums_before.entry(asset.clone()).or_insert(U256::ZERO) += before;
            *sums_after.entry(asset.clone()).or_insert(U256::ZERO) += after;

            match intent {
                AppIntent::Operate => {}
                AppIntent::Deposit => {
                    if after < before {
                        return Err(AppError::InvalidIntent(
                            "DEPOSIT cannot decrease an allocation".into(),
                        ));
                    }
                    if after > before {
                        let delta = after - before;
                        if !signer_set.contains(participant) {
                            return Err(AppError::InsufficientSignatures {
                                weight: 0,
                                quorum: session.definition.quorum,
                            });
                        }
                        let available = self.balance(*participant, asset);
                        if available < delta {
                            return Err(AppError::InsufficientFunds {
                                account: format!("0x{:x}", participant),
                                asset: asset.clone(),
                                available: available.to_string(),
                                needed: delta.to_string(),
                            });
                        }
                        ledger_moves.push((*participant, asset.clone(), delta, true));
                    }
                }
                AppIntent::Withdraw => {
                    if after > before {
                        return Err(AppError::InvalidIntent(
                            "WITHDRAW cannot increase an allocation".into(),
                        ));
                    }
                    if after < before {
                        ledger_moves.push((*participant, asset.clone(), before - after, false));
                    }
                }
            }
        }

        if intent == AppIntent::Operate {
            for (asset, before) in &sums_before {
                let after = sums_after.get(asset).copied().unwrap_or(U256::ZERO);
                if *before != after {
                    return Err(AppError::AllocationMismatch(format!(
                        "OPERATE changed the {} sum {} -> {}",
                        asset, before, after
                    )));
                }
            }
            for (asset, after) in &sums_after {
                if !sums_before.contains_key(asset) && !after.is_zero() {
                    return Err(AppError::AllocationMismatch(format!(
                        "OPERATE introduced {} out of nowhere",
                        asset
                    )));
                }
            }
        }

        // All checks passed: commit.
        for (participant, asset, amount, into_session) in &ledger_moves {
            if *into_session {
                self.debit(*participant, asset, *amount).expect("balance checked above");
                self.record(TxType::AppDeposit, *participant, Address::ZERO, asset, *amount, now);
            } else {
                self.credit(*participant, asset, *amount);
                self.record(TxType::AppWithdrawal, Address::ZERO, *participant, asset, *amount, now);
            }
        }
        let session = self.sessions.get_mut(&id).expect("looked up above");
        session.version = version;
        session.allocations = allocations.into_iter().filter(|a| !a.amount.is_zero()).collect();
        Ok(self.sessions.get(&id).expect("present"))
    }

    /// Close a session: quorum over the final allocation, session balances
    /// redistributed to participant ledgers.
    pub fn close_app_session(
        &mut self,
        id: B256,
        final_allocations: Vec<AppAllocation>,
        signers: &[Address],
        now: u64,
    ) -> Result<&AppSession, AppError> {
        let session = self
            .sessions
            .get(&id)
            .ok_or_else(|| AppError::ApplicationNotFound(format!("0x{:x}", id)))?;
        if session.status != AppStatus::Open {
            return Err(AppError::SessionClosed(format!("0x{:x}", id)));
        }
        check_quorum(&session.definition, signers)?;
        for allocation in &final_allocations {
            if !session.definition.participants.contains(&allocation.participant) {
                return Err(AppError::InvalidParams(format!(
                    "allocation for non-participant 0x{:x}",
                    allocation.participant
                )));
            }
        }

        // Final sums must match what the session holds, per asset.
        let mut held: HashMap<String, U256> = HashMap::new();
        for allocation in &session.allocations {
            *held.entry(allocation.asset.clone()).or_insert(U256::ZERO) += allocation.amount;
        }
        let mut paid: HashMap<String, U256> = HashMap::new();
        for allocation in &final_allocations {
            *paid.entry(allocation.asset.clone()).or_insert(U256::ZERO) += allocation.amount;
        }
        for asset in held.keys().chain(paid.keys()) {
            let h = held.get(asset).copied().unwrap_or(U256::ZERO);
            let p = paid.get(asset).copied().unwrap_or(U256::ZERO);
            if h != p {
                return Err(AppError::AllocationMismatch(format!(
                    "final {} allocation {} != session balance {}",
                    asset, p, h
                )));
            }
        }

        let payouts: Vec<AppAllocation> = final_allocations
            .iter()
            .filter(|a| !a.amount.is_zero())
            .cloned()
            .collect();
        for allocation in &payouts {
            self.credit(allocation.participant, &allocation.asset, allocation.amount);
            self.record(
                TxType::AppWithdrawal,
                Address::ZERO,
                allocation.participant,
                &allocation.asset,
                allocation.amount,
                now,
            );
        }

        let session = self.sessions.get_mut(&id).expect("looked up above");
        session.version += 1;
        session.status = AppStatus::Closed;
        session.allocations = payouts;
        Ok(self.sessions.get(&id).expect("present"))
    }

    // -------------------------------------------------------------------------
    // journal
    // -------------------------------------------------------------------------

    /// Journal rows touching `account` (either side), ordered by
    /// (created_at, id). `ascending = false` reverses both keys.
    pub fn transactions(
        &self,
        account: Option<Address>,
        asset: Option<&str>,
        ascending: bool,
        offset: usize,
        limit: usize,
    ) -> Vec<LedgerTransaction> {
        let mut rows: Vec<LedgerTransaction> = self
            .journal
            .iter()
            .filter(|tx| {
                account.map_or(true, |a| tx.from_account == a || tx.to_account == a)
                    && asset.map_or(true, |s| tx.asset == s)
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        if !ascending {
            rows.reverse();
        }
        rows.into_iter().skip(offset).take(limit).collect()
    }

    /// Restore helpers used by the persistence layer at boot.
    pub fn restore_balance(&mut self, account: Address, asset: &str, amount: U256) {
        if !amount.is_zero() {
            self.accounts
                .entry(account)
                .or_default()
                .insert(asset.to_string(), amount);
        }
    }

    pub fn restore_escrow(&mut self, channel_id: B256, asset: &str, amount: U256) {
        if !amount.is_zero() {
            self.escrow
                .entry(channel_id)
                .or_default()
                .insert(asset.to_string(), amount);
        }
    }

    pub fn restore_session(&mut self, session: AppSession) {
        self.sessions.insert(session.id, session);
    }

    pub fn restore_journal(&mut self, rows: Vec<LedgerTransaction>) {
        self.next_tx_id = rows.iter().map(|r| r.id).max().unwrap_or(0);
        self.journal = rows;
    }
}

fn pair_map(allocations: &[AppAllocation]) -> HashMap<(Address, String), U256> {
    let mut map = HashMap::new();
    for allocation in allocations {
        *map.entry((allocation.participant, allocation.asset.clone()))
            .or_insert(U256::ZERO) += allocation.amount;
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AppProtocol;
    use alloy::primitives::address;

    const A: Address = address!("1111111111111111111111111111111111111111");
    const B: Address = address!("2222222222222222222222222222222222222222");
    const C: Address = address!("3333333333333333333333333333333333333333");
    const D: Address = address!("4444444444444444444444444444444444444444");
    const BROKER: Address = address!("9999999999999999999999999999999999999999");

    fn definition(participants: Vec<Address>, weights: Vec<u64>, quorum: u64) -> AppDefinition {
        AppDefinition {
            application: "swap".into(),
            protocol: AppProtocol::V02,
            participants,
            weights,
            quorum,
            challenge: 0,
            nonce: 1,
        }
    }

    fn alloc(participant: Address, asset: &str, amount: u64) -> AppAllocation {
        AppAllocation {
            participant,
            asset: asset.into(),
            amount: U256::from(amount),
        }
    }

    // -------------------------------------------------------------------------
    // accounts
    // -------------------------------------------------------------------------

    #[test]
    fn deposit_then_withdraw_returns_to_start() {
        let mut ledger = Ledger::new();
        ledger.deposit(A, "usdc", U256::from(100u64), 1);
        assert_eq!(ledger.balance(A, "usdc"), U256::from(100u64));
        ledger.withdraw(A, "usdc", U256::from(100u64), 2).unwrap();
        assert_eq!(ledger.balance(A, "usdc"), U256::ZERO);
    }

    #[test]
    fn withdraw_beyond_balance_rejected() {
        let mut ledger = Ledger::new();
        ledger.deposit(A, "usdc", U256::from(50u64), 1);
        let err = ledger.withdraw(A, "usdc", U256::from(51u64), 2).unwrap_err();
        assert!(matches!(err, AppError::InsufficientFunds { .. }));
        // Nothing changed.
        assert_eq!(ledger.balance(A, "usdc"), U256::from(50u64));
    }

    #[test]
    fn transfer_moves_and_journals() {
        let mut ledger = Ledger::new();
        ledger.deposit(A, "usdc", U256::from(100u64), 1);
        let tx = ledger.transfer(A, B, "usdc", U256::from(40u64), 2).unwrap();
        assert_eq!(tx.tx_type, TxType::Transfer);
        assert_eq!(ledger.balance(A, "usdc"), U256::from(60u64));
        assert_eq!(ledger.balance(B, "usdc"), U256::from(40u64));
    }

    // -------------------------------------------------------------------------
    // channel escrow
    // -------------------------------------------------------------------------

    #[test]
    fn lock_unlock_round_trip() {
        let mut ledger = Ledger::new();
        let channel = B256::from([7u8; 32]);
        ledger.deposit(A, "usdc", U256::from(100u64), 1);
        ledger.lock_to_channel(A, channel, "usdc", U256::from(100u64), 2).unwrap();
        assert_eq!(ledger.balance(A, "usdc"), U256::ZERO);
        assert_eq!(ledger.escrow_balance(channel, "usdc"), U256::from(100u64));

        ledger
            .unlock_from_channel(channel, &[(A, "usdc".into(), U256::from(100u64))], 3)
            .unwrap();
        assert_eq!(ledger.balance(A, "usdc"), U256::from(100u64));
        assert_eq!(ledger.escrow_balance(channel, "usdc"), U256::ZERO);
    }

    #[test]
    fn unlock_cannot_exceed_escrow() {
        let mut ledger = Ledger::new();
        let channel = B256::from([7u8; 32]);
        ledger.deposit(A, "usdc", U256::from(50u64), 1);
        ledger.lock_to_channel(A, channel, "usdc", U256::from(50u64), 2).unwrap();
        assert!(ledger
            .unlock_from_channel(channel, &[(A, "usdc".into(), U256::from(60u64))], 3)
            .is_err());
    }

    #[test]
    fn channel_set_tracks_membership() {
        let mut ledger = Ledger::new();
        let channel = B256::from([7u8; 32]);
        ledger.register_channel(A, channel);
        assert_eq!(ledger.channels_of(A), vec![channel]);
        ledger.deregister_channel(A, channel);
        assert!(ledger.channels_of(A).is_empty());
    }

    // -------------------------------------------------------------------------
    // quorum (S5 / S6)
    // -------------------------------------------------------------------------

    #[test]
    fn broker_weight_alone_meets_quorum() {
        let def = definition(vec![BROKER, A, B, C, D], vec![100, 1, 1, 1, 1], 100);
        assert!(check_quorum(&def, &[BROKER]).is_ok());
        // Four non-broker participants: weight 4 < 100.
        let err = check_quorum(&def, &[A, B, C, D]).unwrap_err();
        assert!(matches!(
            err,
            AppError::InsufficientSignatures { weight: 4, quorum: 100 }
        ));
    }

    #[test]
    fn equal_weights_any_three_of_five() {
        let def = definition(vec![BROKER, A, B, C, D], vec![1, 1, 1, 1, 1], 3);
        assert!(check_quorum(&def, &[A, B, C]).is_ok());
        assert!(check_quorum(&def, &[A, B]).is_err());
        // Duplicates count once.
        assert!(check_quorum(&def, &[A, A, B]).is_err());
        // Outsiders carry no weight.
        let outsider = address!("AAaaAAaaAAaaAAaaAAaaAAaaAAaaAAaaAAaaAAaa");
        assert!(check_quorum(&def, &[A, B, outsider]).is_err());
    }

    // -------------------------------------------------------------------------
    // app sessions
    // -------------------------------------------------------------------------

    fn funded_swap_session(ledger: &mut Ledger) -> B256 {
        ledger.deposit(A, "eth", U256::from(500u64), 1);
        ledger.deposit(B, "usdc", U256::from(50_000u64), 1);
        let def = definition(vec![BROKER, A, B], vec![100, 1, 1], 100);
        let session = ledger
            .create_app_session(
                def,
                vec![alloc(A, "eth", 500), alloc(B, "usdc", 50_000)],
                &[BROKER, A, B],
                2,
            )
            .unwrap();
        session.id
    }

    #[test]
    fn create_session_moves_funds_in() {
        let mut ledger = Ledger::new();
        let id = funded_swap_session(&mut ledger);
        assert_eq!(ledger.balance(A, "eth"), U256::ZERO);
        assert_eq!(ledger.balance(B, "usdc"), U256::ZERO);
        let session = ledger.session(id).unwrap();
        assert_eq!(session.version, 1);
        assert_eq!(session.status, AppStatus::Open);
    }

    #[test]
    fn create_session_requires_funding_signatures() {
        let mut ledger = Ledger::new();
        ledger.deposit(A, "eth", U256::from(500u64), 1);
        ledger.deposit(B, "usdc", U256::from(50_000u64), 1);
        let def = definition(vec![BROKER, A, B], vec![100, 1, 1], 100);
        // Quorum met by the broker, but B's funds move without B's signature.
        let err = ledger
            .create_app_session(
                def,
                vec![alloc(A, "eth", 500), alloc(B, "usdc", 50_000)],
                &[BROKER, A],
                2,
            )
            .unwrap_err();
        assert!(matches!(err, AppError::InsufficientSignatures { .. }));
        // Atomicity: A's balance untouched.
        assert_eq!(ledger.balance(A, "eth"), U256::from(500u64));
    }

    #[test]
    fn pair_swap_conserves_and_settles() {
        // S1: broker swaps A's eth for B's usdc, then closes.
        let mut ledger = Ledger::new();
        let id = funded_swap_session(&mut ledger);

        // OPERATE v2: swapped allocations.
        ledger
            .submit_app_state(
                id,
                AppIntent::Operate,
                2,
                vec![alloc(A, "usdc", 50_000), alloc(B, "eth", 500)],
                &[BROKER],
                3,
            )
            .unwrap();

        // Close at v3 with the swapped allocation.
        ledger
            .close_app_session(
                id,
                vec![alloc(A, "usdc", 50_000), alloc(B, "eth", 500)],
                &[BROKER],
                4,
            )
            .unwrap();

        assert_eq!(ledger.balance(A, "usdc"), U256::from(50_000u64));
        assert_eq!(ledger.balance(B, "eth"), U256::from(500u64));
        assert_eq!(ledger.balance(A, "eth"), U256::ZERO);
        assert_eq!(ledger.balance(B, "usdc"), U256::ZERO);
        assert_eq!(ledger.session(id).unwrap().status, AppStatus::Closed);
    }

    #[test]
    fn operate_cannot_change_per_asset_sum() {
        let mut ledger = Ledger::new();
        let id = funded_swap_session(&mut ledger);
        let err = ledger
            .submit_app_state(
                id,
                AppIntent::Operate,
                2,
                vec![alloc(A, "eth", 400), alloc(B, "usdc", 50_000)],
                &[BROKER],
                3,
            )
            .unwrap_err();
        assert!(matches!(err, AppError::AllocationMismatch(_)));
    }

    #[test]
    fn version_must_strictly_increase() {
        let mut ledger = Ledger::new();
        let id = funded_swap_session(&mut ledger);
        let err = ledger
            .submit_app_state(
                id,
                AppIntent::Operate,
                1,
                vec![alloc(A, "eth", 500), alloc(B, "usdc", 50_000)],
                &[BROKER],
                3,
            )
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidVersion { .. }));
    }

    #[test]
    fn deposit_intent_pulls_from_signer_ledger() {
        let mut ledger = Ledger::new();
        let id = funded_swap_session(&mut ledger);
        ledger.deposit(A, "eth", U256::from(250u64), 3);

        // A tops up by 250; requires A's signature alongside quorum.
        ledger
            .submit_app_state(
                id,
                AppIntent::Deposit,
                2,
                vec![alloc(A, "eth", 750), alloc(B, "usdc", 50_000)],
                &[BROKER, A],
                4,
            )
            .unwrap();
        assert_eq!(ledger.balance(A, "eth"), U256::ZERO);

        // Without the depositor's signature the update is rejected.
        ledger.deposit(A, "eth", U256::from(10u64), 5);
        let err = ledger
            .submit_app_state(
                id,
                AppIntent::Deposit,
                3,
                vec![alloc(A, "eth", 760), alloc(B, "usdc", 50_000)],
                &[BROKER],
                6,
            )
            .unwrap_err();
        assert!(matches!(err, AppError::InsufficientSignatures { .. }));
    }

    #[test]
    fn withdraw_intent_pushes_back_to_ledger() {
        let mut ledger = Ledger::new();
        let id = funded_swap_session(&mut ledger);
        ledger
            .submit_app_state(
                id,
                AppIntent::Withdraw,
                2,
                vec![alloc(A, "eth", 100), alloc(B, "usdc", 50_000)],
                &[BROKER, A],
                3,
            )
            .unwrap();
        assert_eq!(ledger.balance(A, "eth"), U256::from(400u64));
    }

    #[test]
    fn close_requires_exact_redistribution() {
        let mut ledger = Ledger::new();
        let id = funded_swap_session(&mut ledger);
        let err = ledger
            .close_app_session(id, vec![alloc(A, "eth", 400), alloc(B, "usdc", 50_000)], &[BROKER], 3)
            .unwrap_err();
        assert!(matches!(err, AppError::AllocationMismatch(_)));
    }

    #[test]
    fn closed_session_rejects_updates() {
        let mut ledger = Ledger::new();
        let id = funded_swap_session(&mut ledger);
        ledger
            .close_app_session(
                id,
                vec![alloc(A, "eth", 500), alloc(B, "usdc", 50_000)],
                &[BROKER],
                3,
            )
            .unwrap();
        let err = ledger
            .submit_app_state(
                id,
                AppIntent::Operate,
                5,
                vec![alloc(A, "eth", 500), alloc(B, "usdc", 50_000)],
                &[BROKER],
                4,
            )
            .unwrap_err();
        assert!(matches!(err, AppError::SessionClosed(_)));
    }

    // -------------------------------------------------------------------------
    // journal
    // -------------------------------------------------------------------------

    #[test]
    fn transactions_order_and_paginate() {
        let mut ledger = Ledger::new();
        ledger.deposit(A, "usdc", U256::from(10u64), 100);
        ledger.deposit(A, "usdc", U256::from(20u64), 100);
        ledger.deposit(A, "usdc", U256::from(30u64), 200);

        let asc = ledger.transactions(Some(A), None, true, 0, 10);
        assert_eq!(asc.len(), 3);
        // Same created_at breaks ties by id.
        assert!(asc[0].id < asc[1].id);
        assert_eq!(asc[2].created_at, 200);

        let desc = ledger.transactions(Some(A), None, false, 0, 2);
        assert_eq!(desc.len(), 2);
        assert_eq!(desc[0].created_at, 200);

        let page = ledger.transactions(Some(A), None, true, 2, 10);
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].created_at, 200);
    }
}
