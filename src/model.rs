// model.rs - Data structures for the broker
//
// Internal state types use alloy primitives; wire-facing view types use
// strings for addresses and amounts, converted at the boundary only.

use alloy::primitives::{Address, Bytes, B256, U256};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

// =============================================================================
// CHANNEL TYPES
// =============================================================================

/// Intent carried by a channel state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    Initialize,
    Operate,
    Resize,
    Finalize,
}

impl Intent {
    /// Numeric wire/hash value.
    pub fn as_u8(self) -> u8 {
        match self {
            Intent::Initialize => 0,
            Intent::Operate => 1,
            Intent::Resize => 2,
            Intent::Finalize => 3,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Intent::Initialize),
            1 => Some(Intent::Operate),
            2 => Some(Intent::Resize),
            3 => Some(Intent::Finalize),
            _ => None,
        }
    }
}

/// Funds destined for an account when the channel terminates.
///
/// Token `Address::ZERO` denotes the native currency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub destination: Address,
    pub token: Address,
    pub amount: U256,
}

/// The immutable parameters of a channel. The channel id is a deterministic
/// function of this tuple; permuting participants yields a different id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub participants: [Address; 2],
    pub adjudicator: Address,
    pub challenge_duration: u64,
    pub nonce: u64,
}

impl Channel {
    pub fn id(&self) -> B256 {
        crate::crypto::channel_id(self)
    }
}

/// A channel state. Signatures are a parallel array to participants; an
/// entry may be empty for a participant that has not signed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    pub intent: Intent,
    pub version: u64,
    pub data: Bytes,
    pub allocations: [Allocation; 2],
    pub sigs: Vec<String>,
}

impl State {
    pub fn state_hash(&self, channel_id: B256) -> B256 {
        crate::crypto::state_hash(channel_id, self)
    }

    /// Sum of both allocation amounts. The state machine keeps this
    /// invariant under OPERATE and moves it by the signed delta under RESIZE.
    pub fn total(&self) -> U256 {
        self.allocations[0].amount + self.allocations[1].amount
    }

    /// Signature entry for participant `i`, if present.
    pub fn sig(&self, i: usize) -> Option<&str> {
        self.sigs.get(i).map(|s| s.as_str()).filter(|s| !s.is_empty())
    }
}

/// Channel lifecycle status. FINAL is ephemeral: the record is deleted in
/// the same step, so a stored channel is never FINAL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelStatus {
    Void,
    Initial,
    Active,
    Dispute,
    Final,
}

/// The broker's mirror of the on-chain channel record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub channel: Channel,
    pub status: ChannelStatus,
    /// Depositor wallets, per participant index.
    pub wallets: [Address; 2],
    pub expected_deposits: [U256; 2],
    pub actual_deposits: [U256; 2],
    /// Unix seconds; 0 when no challenge window is open.
    pub challenge_expiry: u64,
    pub last_state: State,
}

impl ChannelRecord {
    pub fn channel_id(&self) -> B256 {
        self.channel.id()
    }

    /// Both allocations carry the same token, checked at every transition.
    pub fn token(&self) -> Address {
        self.last_state.allocations[0].token
    }

    pub fn participant_index(&self, who: Address) -> Option<usize> {
        self.channel.participants.iter().position(|p| *p == who)
    }
}

// =============================================================================
// APP-SESSION TYPES
// =============================================================================

/// Protocol revision spoken inside an app session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppProtocol {
    #[serde(rename = "NitroRPC/0.2")]
    V02,
    #[serde(rename = "NitroRPC/0.4")]
    V04,
}

/// Intent of an app-session state update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppIntent {
    Operate,
    Deposit,
    Withdraw,
}

/// Definition of an off-chain multi-party sub-ledger. Weights are parallel
/// to participants; an update is authorized when the summed weight of valid
/// signers meets the quorum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppDefinition {
    pub application: String,
    pub protocol: AppProtocol,
    pub participants: Vec<Address>,
    pub weights: Vec<u64>,
    pub quorum: u64,
    pub challenge: u64,
    pub nonce: u64,
}

impl AppDefinition {
    pub fn session_id(&self) -> B256 {
        crate::crypto::app_session_id(self)
    }

    pub fn weight_of(&self, who: Address) -> u64 {
        self.participants
            .iter()
            .position(|p| *p == who)
            .map(|i| self.weights[i])
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppStatus {
    Open,
    Closed,
}

/// One (participant, asset) row of an app-session allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppAllocation {
    pub participant: Address,
    pub asset: String,
    pub amount: U256,
}

/// An app session: definition plus current allocation state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSession {
    pub id: B256,
    pub definition: AppDefinition,
    pub version: u64,
    pub status: AppStatus,
    pub allocations: Vec<AppAllocation>,
}

// =============================================================================
// ASSETS
// =============================================================================

/// A supported asset: on-chain token address plus the decimal exponent used
/// for wire-string conversion. Amounts are integers internally; decimal
/// strings exist only at the boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    pub token: Address,
    pub symbol: String,
    pub decimals: u8,
}

impl Asset {
    /// Parse a decimal string ("0.0005") into integer units.
    pub fn to_units(&self, text: &str) -> Result<U256, AppError> {
        let (whole, frac) = match text.split_once('.') {
            Some((w, f)) => (w, f),
            None => (text, ""),
        };
        if frac.len() > self.decimals as usize {
            return Err(AppError::InvalidParams(format!(
                "amount {} exceeds {} decimals for {}",
                text, self.decimals, self.symbol
            )));
        }
        let whole: U256 = if whole.is_empty() {
            U256::ZERO
        } else {
            whole.parse().map_err(|_| {
                AppError::InvalidParams(format!("invalid amount: {}", text))
            })?
        };
        let mut frac_units = U256::ZERO;
        if !frac.is_empty() {
            let padded = format!("{:0<width$}", frac, width = self.decimals as usize);
            frac_units = padded.parse().map_err(|_| {
                AppError::InvalidParams(format!("invalid amount: {}", text))
            })?;
        }
        let scale = U256::from(10u64).pow(U256::from(self.decimals));
        Ok(whole * scale + frac_units)
    }

    /// Render integer units as a decimal string, trimming trailing zeros.
    pub fn from_units(&self, units: U256) -> String {
        let scale = U256::from(10u64).pow(U256::from(self.decimals));
        let whole = units / scale;
        let frac = units % scale;
        if frac.is_zero() {
            return whole.to_string();
        }
        let frac = format!("{:0>width$}", frac, width = self.decimals as usize);
        let frac = frac.trim_end_matches('0');
        format!("{}.{}", whole, frac)
    }
}

// =============================================================================
// LEDGER JOURNAL
// =============================================================================

/// Kind of ledger mutation, one row per committed balance change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxType {
    Deposit,
    Withdrawal,
    Transfer,
    AppDeposit,
    AppWithdrawal,
    ChannelLock,
    ChannelUnlock,
}

impl TxType {
    pub fn as_str(self) -> &'static str {
        match self {
            TxType::Deposit => "deposit",
            TxType::Withdrawal => "withdrawal",
            TxType::Transfer => "transfer",
            TxType::AppDeposit => "app_deposit",
            TxType::AppWithdrawal => "app_withdrawal",
            TxType::ChannelLock => "channel_lock",
            TxType::ChannelUnlock => "channel_unlock",
        }
    }
}

/// One committed ledger mutation. Ordering is (created_at, id), both
/// monotone, which gives `get_ledger_transactions` a single deterministic
/// sort.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerTransaction {
    pub id: u64,
    pub tx_type: TxType,
    pub from_account: Address,
    pub to_account: Address,
    pub asset: String,
    pub amount: U256,
    pub created_at: u64,
}

// =============================================================================
// API VIEW TYPES
// =============================================================================
// JSON-friendly views; all amounts are decimal strings.

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceEntry {
    pub asset: String,
    pub amount: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelView {
    pub channel_id: String,
    pub status: ChannelStatus,
    pub participants: Vec<String>,
    pub token: String,
    pub version: u64,
    pub intent: Intent,
    pub amounts: Vec<String>,
    pub challenge_expiry: u64,
    pub adjudicator: String,
    pub challenge_duration: u64,
}

impl ChannelView {
    pub fn from_record(record: &ChannelRecord) -> Self {
        Self {
            channel_id: format!("0x{:x}", record.channel_id()),
            status: record.status,
            participants: record
                .channel
                .participants
                .iter()
                .map(|p| format!("0x{:x}", p))
                .collect(),
            token: format!("0x{:x}", record.token()),
            version: record.last_state.version,
            intent: record.last_state.intent,
            amounts: record
                .last_state
                .allocations
                .iter()
                .map(|a| a.amount.to_string())
                .collect(),
            challenge_expiry: record.challenge_expiry,
            adjudicator: format!("0x{:x}", record.channel.adjudicator),
            challenge_duration: record.channel.challenge_duration,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppAllocationView {
    pub participant: String,
    pub asset: String,
    pub amount: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSessionView {
    pub app_session_id: String,
    pub status: AppStatus,
    pub version: u64,
    pub participants: Vec<String>,
    pub allocations: Vec<AppAllocationView>,
}

impl AppSessionView {
    pub fn from_session(session: &AppSession) -> Self {
        Self {
            app_session_id: format!("0x{:x}", session.id),
            status: session.status,
            version: session.version,
            participants: session
                .definition
                .participants
                .iter()
                .map(|p| format!("0x{:x}", p))
                .collect(),
            allocations: session
                .allocations
                .iter()
                .map(|a| AppAllocationView {
                    participant: format!("0x{:x}", a.participant),
                    asset: a.asset.clone(),
                    amount: a.amount.to_string(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionView {
    pub id: u64,
    pub tx_type: String,
    pub from_account: String,
    pub to_account: String,
    pub asset: String,
    pub amount: String,
    pub created_at: u64,
}

impl TransactionView {
    pub fn from_tx(tx: &LedgerTransaction) -> Self {
        Self {
            id: tx.id,
            tx_type: tx.tx_type.as_str().to_string(),
            from_account: format!("0x{:x}", tx.from_account),
            to_account: format!("0x{:x}", tx.to_account),
            asset: tx.asset.clone(),
            amount: tx.amount.to_string(),
            created_at: tx.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetView {
    pub token: String,
    pub symbol: String,
    pub decimals: u8,
}

impl AssetView {
    pub fn from_asset(asset: &Asset) -> Self {
        Self {
            token: format!("0x{:x}", asset.token),
            symbol: asset.symbol.clone(),
            decimals: asset.decimals,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;

    fn usdc() -> Asset {
        Asset {
            token: address!("A0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48"),
            symbol: "usdc".into(),
            decimals: 6,
        }
    }

    #[test]
    fn decimal_string_to_units_and_back() {
        let asset = usdc();
        assert_eq!(asset.to_units("0.05").unwrap(), U256::from(50_000u64));
        assert_eq!(asset.to_units("100").unwrap(), U256::from(100_000_000u64));
        assert_eq!(asset.to_units("1.000001").unwrap(), U256::from(1_000_001u64));
        assert_eq!(asset.from_units(U256::from(50_000u64)), "0.05");
        assert_eq!(asset.from_units(U256::from(100_000_000u64)), "100");
    }

    #[test]
    fn too_many_decimals_rejected() {
        let asset = usdc();
        assert!(asset.to_units("0.0000001").is_err());
    }

    #[test]
    fn from_units_round_trips() {
        let asset = usdc();
        for raw in [0u64, 1, 999_999, 1_000_000, 123_456_789] {
            let units = U256::from(raw);
            let text = asset.from_units(units);
            assert_eq!(asset.to_units(&text).unwrap(), units);
        }
    }
}
