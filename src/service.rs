// service.rs - Broker orchestrator
//
// Composes the channel engine, the session ledger, the RPC protocol and the
// custody interface. Handlers call these functions; each one validates,
// commits against the in-memory state under the write lock, persists, and
// queues notifications for the affected addresses.

use std::collections::HashMap;
use std::sync::Arc;

use alloy::primitives::{Address, B256, I256, U256};
use alloy::signers::local::PrivateKeySigner;
use sqlx::SqlitePool;
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};

use crate::auth::{self, SessionAuth};
use crate::channel::{self, ChallengerSig, CloseOutcome, UnanimousAdjudicator};
use crate::config::Config;
use crate::custody::{Custody, CustodyEvent};
use crate::error::AppError;
use crate::ledger::Ledger;
use crate::model::{
    AppAllocation, AppSessionView, Asset, AssetView, BalanceEntry, ChannelRecord, ChannelStatus,
    ChannelView, State, TransactionView,
};
use crate::rpc::{
    self, AppAllocationWire, AssetsNotice, BalanceUpdateNotice, ChannelOpResult,
    CloseAppSessionParams, CloseChannelParams, CreateAppSessionParams, CreateChannelParams,
    CreateChannelResult, GetConfigResult, GetLedgerBalancesParams, GetLedgerTransactionsParams,
    Method, ResizeChannelParams, RpcMessage, RpcPayload, SubmitAppStateParams, TransferNotice,
    TransferParams,
};

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Shared state passed to all handlers. The ledger is the single
/// authoritative mutable resource; its write lock is the single-writer
/// discipline that serializes balance mutations.
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub ledger: Arc<RwLock<Ledger>>,
    pub channels: Arc<RwLock<HashMap<B256, ChannelRecord>>>,
    pub session_keys: Arc<RwLock<HashMap<Address, SessionAuth>>>,
    /// address -> outbound frame senders of its live connections
    pub subscriptions: Arc<RwLock<HashMap<Address, Vec<mpsc::Sender<String>>>>>,
    pub config: Arc<Config>,
    pub broker_signer: PrivateKeySigner,
    pub assets: Arc<Vec<Asset>>,
    /// Absent in tests; channel operations then stay mirror-only.
    pub custody: Option<Arc<Custody>>,
}

impl AppState {
    pub fn broker_address(&self) -> Address {
        self.broker_signer.address()
    }

    pub fn asset_by_symbol(&self, symbol: &str) -> Result<&Asset, AppError> {
        self.assets
            .iter()
            .find(|a| a.symbol == symbol)
            .ok_or_else(|| AppError::InvalidParams(format!("unsupported asset: {}", symbol)))
    }

    pub fn asset_by_token(&self, token: Address) -> Result<&Asset, AppError> {
        self.assets
            .iter()
            .find(|a| a.token == token)
            .ok_or_else(|| AppError::InvalidParams(format!("unsupported token: 0x{:x}", token)))
    }
}

/// Sign a response payload and wrap it into a frame.
pub async fn signed_response(
    state: &AppState,
    payload: RpcPayload,
    sid: Option<String>,
) -> RpcMessage {
    let sig = match crate::crypto::sign_eip191(&state.broker_signer, payload.digest()).await {
        Ok(sig) => vec![sig],
        Err(e) => {
            warn!(error = %e, "response signing failed");
            vec![]
        }
    };
    let mut message = RpcMessage::response(payload, sig);
    if let Some(sid) = sid {
        message = message.with_sid(sid);
    }
    message
}

// =============================================================================
// DISPATCH
// =============================================================================

/// Route an authenticated request to its handler. Returns the response
/// payload and an optional app-session id for the frame.
pub async fn dispatch(
    state: &AppState,
    auth: &SessionAuth,
    message: &RpcMessage,
) -> Result<(RpcPayload, Option<String>), AppError> {
    let payload = message.payload();
    let method = payload.method()?;
    let now = rpc::now_ms();

    let (result, sid) = match method {
        Method::Ping => (serde_json::json!({}), None),
        Method::GetConfig => (serde_json::to_value(get_config(state)).unwrap(), None),
        Method::GetAssets => (
            serde_json::to_value(AssetsNotice {
                assets: state.assets.iter().map(AssetView::from_asset).collect(),
            })
            .unwrap(),
            None,
        ),
        Method::GetLedgerBalances => {
            (serde_json::to_value(get_ledger_balances(state, auth, payload).await?).unwrap(), None)
        }
        Method::GetLedgerTransactions => (
            serde_json::to_value(get_ledger_transactions(state, auth, payload).await?).unwrap(),
            None,
        ),
        Method::Transfer => {
            (serde_json::to_value(transfer(state, auth, payload).await?).unwrap(), None)
        }
        Method::CreateChannel => {
            (serde_json::to_value(create_channel(state, auth, payload).await?).unwrap(), None)
        }
        Method::ResizeChannel => {
            (serde_json::to_value(resize_channel(state, auth, payload).await?).unwrap(), None)
        }
        Method::CloseChannel => {
            (serde_json::to_value(close_channel(state, auth, payload).await?).unwrap(), None)
        }
        Method::CreateAppSession => {
            let view = create_app_session(state, message).await?;
            let sid = view.app_session_id.clone();
            (serde_json::to_value(view).unwrap(), Some(sid))
        }
        Method::SubmitAppState => {
            let view = submit_app_state(state, message).await?;
            let sid = view.app_session_id.clone();
            (serde_json::to_value(view).unwrap(), Some(sid))
        }
        Method::CloseAppSession => {
            let view = close_app_session(state, message).await?;
            let sid = view.app_session_id.clone();
            (serde_json::to_value(view).unwrap(), Some(sid))
        }
        other => {
            return Err(AppError::MethodNotFound(other.as_str().to_string()));
        }
    };

    let response_method = if method == Method::Ping { Method::Pong } else { method };
    Ok((
        RpcPayload::new(payload.request_id, response_method, result, now),
        sid,
    ))
}

fn get_config(state: &AppState) -> GetConfigResult {
    GetConfigResult {
        broker_address: format!("0x{:x}", state.broker_address()),
        chain_id: state.config.chain_id,
        custody_address: format!("0x{:x}", state.config.custody),
        adjudicator_address: format!("0x{:x}", state.config.adjudicator),
        protocol: crate::model::AppProtocol::V02,
    }
}

// =============================================================================
// LEDGER QUERIES
// =============================================================================

fn to_balance_entries(state: &AppState, rows: Vec<(String, U256)>) -> Vec<BalanceEntry> {
    rows.into_iter()
        .map(|(asset, amount)| {
            let amount = match state.asset_by_symbol(&asset) {
                Ok(meta) => meta.from_units(amount),
                Err(_) => amount.to_string(),
            };
            BalanceEntry { asset, amount }
        })
        .collect()
}

async fn get_ledger_balances(
    state: &AppState,
    auth: &SessionAuth,
    payload: &RpcPayload,
) -> Result<Vec<BalanceEntry>, AppError> {
    let params: GetLedgerBalancesParams = payload.parse_params()?;
    let account = match params.account {
        Some(text) => crate::crypto::parse_address(&text)?,
        None => auth.wallet,
    };
    let ledger = state.ledger.read().await;
    Ok(to_balance_entries(state, ledger.balances(account)))
}

async fn get_ledger_transactions(
    state: &AppState,
    auth: &SessionAuth,
    payload: &RpcPayload,
) -> Result<Vec<TransactionView>, AppError> {
    let params: GetLedgerTransactionsParams = payload.parse_params()?;
    let account = match params.account {
        Some(text) => Some(crate::crypto::parse_address(&text)?),
        None => Some(auth.wallet),
    };
    let ascending = match params.sort.as_deref() {
        None | Some("asc") => true,
        Some("desc") => false,
        Some(other) => {
            return Err(AppError::InvalidParams(format!("unknown sort order: {}", other)))
        }
    };
    let ledger = state.ledger.read().await;
    let rows = ledger.transactions(
        account,
        params.asset.as_deref(),
        ascending,
        params.offset.unwrap_or(0) as usize,
        params.limit.unwrap_or(100).min(1000) as usize,
    );
    Ok(rows.iter().map(TransactionView::from_tx).collect())
}

// =============================================================================
// TRANSFER
// =============================================================================

async fn transfer(
    state: &AppState,
    auth: &SessionAuth,
    payload: &RpcPayload,
) -> Result<Vec<TransactionView>, AppError> {
    let params: TransferParams = payload.parse_params()?;
    let destination = crate::crypto::parse_address(&params.destination)?;
    if params.allocations.is_empty() {
        return Err(AppError::InvalidParams("transfer with no allocations".into()));
    }
    let mut moves = Vec::with_capacity(params.allocations.len());
    for entry in &params.allocations {
        let asset = state.asset_by_symbol(&entry.asset)?;
        moves.push((asset.symbol.clone(), asset.to_units(&entry.amount)?));
    }

    let now = rpc::now_ms() / 1000;
    let mut views = Vec::with_capacity(moves.len());
    {
        let mut ledger = state.ledger.write().await;
        // Validate the whole batch before the first debit.
        for (asset, amount) in &moves {
            let available = ledger.balance(auth.wallet, asset);
            if available < *amount {
                return Err(AppError::InsufficientFunds {
                    account: format!("0x{:x}", auth.wallet),
                    asset: asset.clone(),
                    available: available.to_string(),
                    needed: amount.to_string(),
                });
            }
        }
        let mark = ledger.journal_len();
        for (asset, amount) in &moves {
            let tx = ledger.transfer(auth.wallet, destination, asset, *amount, now)?;
            views.push(TransactionView::from_tx(&tx));
        }
        persist_commit(state, &ledger, mark).await?;
    }

    info!(from = %format!("0x{:x}", auth.wallet), to = %format!("0x{:x}", destination), "transfer");
    notify_transfer(state, &[auth.wallet, destination], &views).await;
    notify_balances(state, auth.wallet).await;
    notify_balances(state, destination).await;
    Ok(views)
}

// =============================================================================
// CHANNEL LIFECYCLE
// =============================================================================

/// Admit a client-proposed channel, escrow the client's funds, countersign
/// as participant 1, and mirror the ACTIVE record.
async fn create_channel(
    state: &AppState,
    auth: &SessionAuth,
    payload: &RpcPayload,
) -> Result<CreateChannelResult, AppError> {
    let params: CreateChannelParams = payload.parse_params()?;
    let channel = params.channel.to_model()?;
    let initial = params.state.to_model()?;

    if channel.participants[0] != auth.wallet {
        return Err(AppError::InvalidParams(
            "channel participant 0 must be the authenticated wallet".into(),
        ));
    }
    if channel.participants[1] != state.broker_address() {
        return Err(AppError::InvalidParams(
            "channel participant 1 must be the broker".into(),
        ));
    }
    // Acceptance policy: the broker funds nothing at creation.
    if !initial.allocations[1].amount.is_zero() {
        return Err(AppError::InvalidParams(
            "initial broker allocation must be zero".into(),
        ));
    }
    let asset = state.asset_by_token(initial.allocations[0].token)?.clone();

    let record = channel::validate_create(&channel, &initial, auth.wallet)?;
    let channel_id = record.channel_id();

    // Broker joins: countersign the initial state.
    let join_sig = crate::crypto::sign_digest(
        &state.broker_signer,
        initial.state_hash(channel_id),
    )
    .await?;
    let record = channel::validate_join(&record, 1, &join_sig, state.broker_address())?;

    let now = rpc::now_ms() / 1000;
    {
        let mut ledger = state.ledger.write().await;
        let mut channels = state.channels.write().await;
        if channels.contains_key(&channel_id) {
            return Err(AppError::InvalidParams(format!(
                "channel 0x{:x} already exists",
                channel_id
            )));
        }
        let mark = ledger.journal_len();
        ledger.lock_to_channel(
            auth.wallet,
            channel_id,
            &asset.symbol,
            initial.allocations[0].amount,
            now,
        )?;
        ledger.register_channel(channel.participants[0], channel_id);
        ledger.register_channel(channel.participants[1], channel_id);
        channels.insert(channel_id, record.clone());
        persist_commit(state, &ledger, mark).await?;
        db_save_escrow(state, &ledger, channel_id, &asset.symbol).await?;
        crate::db::save_channel(&state.db, &record).await?;
    }

    info!(channel_id = %format!("0x{:x}", channel_id), "channel created and joined");
    submit_onchain_create(state, &record);
    notify_channel(state, &record).await;
    notify_balances(state, auth.wallet).await;

    Ok(CreateChannelResult {
        channel_id: format!("0x{:x}", channel_id),
        channel: params.channel,
        state: rpc::StateWire::from_model(&record.last_state),
    })
}

/// Admit a RESIZE: countersign, move ledger funds by the signed deltas
/// (locks first, then unlocks), and advance the mirror.
async fn resize_channel(
    state: &AppState,
    auth: &SessionAuth,
    payload: &RpcPayload,
) -> Result<ChannelOpResult, AppError> {
    let params: ResizeChannelParams = payload.parse_params()?;
    let channel_id = crate::crypto::parse_b256(&params.channel_id)?;
    let mut candidate = params.state.to_model()?;
    if params.resize_deltas.len() != 2 {
        return Err(AppError::InvalidParams("resize needs exactly two deltas".into()));
    }
    let deltas = [
        crate::crypto::parse_i256(&params.resize_deltas[0])?,
        crate::crypto::parse_i256(&params.resize_deltas[1])?,
    ];

    let now = rpc::now_ms() / 1000;
    let (record, asset) = {
        let channels = state.channels.read().await;
        let record = channels
            .get(&channel_id)
            .ok_or_else(|| AppError::ChannelNotFound(format!("0x{:x}", channel_id)))?;
        if record.participant_index(auth.wallet) != Some(0) {
            return Err(AppError::InvalidParams(
                "only channel participant 0 may request a resize".into(),
            ));
        }
        (record.clone(), state.asset_by_token(record.token())?.clone())
    };

    // The broker's countersignature attests its ledger matches the proposal.
    let broker_sig =
        crate::crypto::sign_digest(&state.broker_signer, candidate.state_hash(channel_id)).await?;
    while candidate.sigs.len() < 2 {
        candidate.sigs.push(String::new());
    }
    candidate.sigs[1] = broker_sig;

    let admitted = channel::validate_resize(&record, &candidate, &deltas)?;

    {
        let mut ledger = state.ledger.write().await;
        let mut channels = state.channels.write().await;
        let mark = ledger.journal_len();

        // Validate every move before the first mutation: the whole resize
        // commits or none of it does.
        for (i, delta) in deltas.iter().enumerate() {
            if delta.is_positive() {
                let amount = delta.unsigned_abs();
                let available = ledger.balance(record.wallets[i], &asset.symbol);
                if available < amount {
                    return Err(AppError::InsufficientFunds {
                        account: format!("0x{:x}", record.wallets[i]),
                        asset: asset.symbol.clone(),
                        available: available.to_string(),
                        needed: amount.to_string(),
                    });
                }
            }
        }

        // Positive deltas lock account funds first; negative deltas unlock.
        for (i, delta) in deltas.iter().enumerate() {
            if delta.is_positive() {
                let amount = delta.unsigned_abs();
                ledger.lock_to_channel(record.wallets[i], channel_id, &asset.symbol, amount, now)?;
            }
        }
        for (i, delta) in deltas.iter().enumerate() {
            if delta.is_negative() {
                ledger.unlock_from_channel(
                    channel_id,
                    &[(record.wallets[i], asset.symbol.clone(), delta.unsigned_abs())],
                    now,
                )?;
            }
        }

        let updated = channel::apply_resize(&record, admitted.clone());
        channels.insert(channel_id, updated.clone());
        persist_commit(state, &ledger, mark).await?;
        db_save_escrow(state, &ledger, channel_id, &asset.symbol).await?;
        crate::db::save_channel(&state.db, &updated).await?;
    }

    info!(channel_id = %format!("0x{:x}", channel_id), version = admitted.version, "channel resized");
    submit_onchain_resize(state, channel_id, &admitted, &record.last_state);
    notify_balances(state, record.wallets[0]).await;
    notify_balances(state, record.wallets[1]).await;
    let updated = state.channels.read().await.get(&channel_id).cloned();
    if let Some(updated) = updated {
        notify_channel(state, &updated).await;
    }

    Ok(ChannelOpResult {
        channel_id: format!("0x{:x}", channel_id),
        state: rpc::StateWire::from_model(&admitted),
    })
}

/// Cooperative close: countersign the FINALIZE state, unlock the escrow to
/// the allocated destinations, delete the record.
async fn close_channel(
    state: &AppState,
    auth: &SessionAuth,
    payload: &RpcPayload,
) -> Result<ChannelOpResult, AppError> {
    let params: CloseChannelParams = payload.parse_params()?;
    let channel_id = crate::crypto::parse_b256(&params.channel_id)?;
    let mut candidate = params.state.to_model()?;

    let (record, asset) = {
        let channels = state.channels.read().await;
        let record = channels
            .get(&channel_id)
            .ok_or_else(|| AppError::ChannelNotFound(format!("0x{:x}", channel_id)))?;
        if record.participant_index(auth.wallet).is_none() {
            return Err(AppError::InvalidParams(
                "only a channel participant may close it".into(),
            ));
        }
        (record.clone(), state.asset_by_token(record.token())?.clone())
    };

    let broker_sig =
        crate::crypto::sign_digest(&state.broker_signer, candidate.state_hash(channel_id)).await?;
    while candidate.sigs.len() < 2 {
        candidate.sigs.push(String::new());
    }
    candidate.sigs[1] = broker_sig;

    let now = rpc::now_ms() / 1000;
    let (settled, outcome) = channel::validate_close(&record, Some(&candidate), now)?;

    {
        let mut ledger = state.ledger.write().await;
        let mut channels = state.channels.write().await;
        let mark = ledger.journal_len();

        let payouts: Vec<(Address, String, U256)> = settled
            .allocations
            .iter()
            .filter(|a| !a.amount.is_zero())
            .map(|a| (a.destination, asset.symbol.clone(), a.amount))
            .collect();
        ledger.unlock_from_channel(channel_id, &payouts, now)?;
        ledger.deregister_channel(record.channel.participants[0], channel_id);
        ledger.deregister_channel(record.channel.participants[1], channel_id);
        // FINAL is ephemeral: the record is deleted in the same step.
        channels.remove(&channel_id);
        persist_commit(state, &ledger, mark).await?;
        db_save_escrow(state, &ledger, channel_id, &asset.symbol).await?;
        crate::db::delete_channel(&state.db, channel_id).await?;
    }

    info!(
        channel_id = %format!("0x{:x}", channel_id),
        cooperative = matches!(outcome, CloseOutcome::Cooperative),
        "channel closed"
    );
    submit_onchain_close(state, channel_id, &settled);
    let closed_view = ChannelView::from_record(&channel::apply_close(&record, settled.clone()));
    push_channel_view(state, &record, closed_view).await;
    notify_balances(state, record.wallets[0]).await;
    notify_balances(state, record.wallets[1]).await;

    Ok(ChannelOpResult {
        channel_id: format!("0x{:x}", channel_id),
        state: rpc::StateWire::from_model(&settled),
    })
}

// =============================================================================
// APP SESSIONS
// =============================================================================

fn parse_app_allocations(
    state: &AppState,
    wires: &[AppAllocationWire],
) -> Result<Vec<AppAllocation>, AppError> {
    let mut allocations = Vec::with_capacity(wires.len());
    for wire in wires {
        let asset = state.asset_by_symbol(&wire.asset)?;
        allocations.push(AppAllocation {
            participant: crate::crypto::parse_address(&wire.participant)?,
            asset: asset.symbol.clone(),
            amount: asset.to_units(&wire.amount)?,
        });
    }
    Ok(allocations)
}

/// Recover the signer set from the message's parallel `sig` array. Quorum
/// weighs exactly the signatures present; the broker carries weight only
/// when it signed the payload itself.
fn app_signers(message: &RpcMessage) -> Result<Vec<Address>, AppError> {
    auth::recover_request_signers(message.payload(), &message.sig)
}

async fn create_app_session(
    state: &AppState,
    message: &RpcMessage,
) -> Result<AppSessionView, AppError> {
    let params: CreateAppSessionParams = message.payload().parse_params()?;
    let definition = params.definition.to_model()?;
    let allocations = parse_app_allocations(state, &params.allocations)?;
    let signers = app_signers(message)?;
    let now = rpc::now_ms() / 1000;

    let (view, participants, funders) = {
        let mut ledger = state.ledger.write().await;
        let mark = ledger.journal_len();
        let session = ledger.create_app_session(definition, allocations, &signers, now)?;
        let view = AppSessionView::from_session(session);
        let participants = session.definition.participants.clone();
        let funders: Vec<Address> = session.allocations.iter().map(|a| a.participant).collect();
        let session = session.clone();
        persist_commit(state, &ledger, mark).await?;
        crate::db::save_app_session(&state.db, &session).await?;
        (view, participants, funders)
    };

    info!(app_session_id = %view.app_session_id, "app session created");
    notify_app_session(state, &view, &participants).await;
    for funder in funders {
        notify_balances(state, funder).await;
    }
    Ok(view)
}

async fn submit_app_state(
    state: &AppState,
    message: &RpcMessage,
) -> Result<AppSessionView, AppError> {
    let params: SubmitAppStateParams = message.payload().parse_params()?;
    let id = crate::crypto::parse_b256(&params.app_session_id)?;
    let allocations = parse_app_allocations(state, &params.allocations)?;
    let signers = app_signers(message)?;
    let now = rpc::now_ms() / 1000;

    let (view, participants) = {
        let mut ledger = state.ledger.write().await;
        let mark = ledger.journal_len();
        let session =
            ledger.submit_app_state(id, params.intent, params.version, allocations, &signers, now)?;
        let view = AppSessionView::from_session(session);
        let participants = session.definition.participants.clone();
        let session = session.clone();
        persist_commit(state, &ledger, mark).await?;
        crate::db::save_app_session(&state.db, &session).await?;
        (view, participants)
    };

    info!(app_session_id = %view.app_session_id, version = view.version, "app state applied");
    notify_app_session(state, &view, &participants).await;
    for participant in &participants {
        notify_balances(state, *participant).await;
    }
    Ok(view)
}

async fn close_app_session(
    state: &AppState,
    message: &RpcMessage,
) -> Result<AppSessionView, AppError> {
    let params: CloseAppSessionParams = message.payload().parse_params()?;
    let id = crate::crypto::parse_b256(&params.app_session_id)?;
    let allocations = parse_app_allocations(state, &params.allocations)?;
    let signers = app_signers(message)?;
    let now = rpc::now_ms() / 1000;

    let (view, participants) = {
        let mut ledger = state.ledger.write().await;
        let mark = ledger.journal_len();
        let session = ledger.close_app_session(id, allocations, &signers, now)?;
        let view = AppSessionView::from_session(session);
        let participants = session.definition.participants.clone();
        let session = session.clone();
        persist_commit(state, &ledger, mark).await?;
        crate::db::save_app_session(&state.db, &session).await?;
        (view, participants)
    };

    info!(app_session_id = %view.app_session_id, "app session closed");
    notify_app_session(state, &view, &participants).await;
    for participant in &participants {
        notify_balances(state, *participant).await;
    }
    Ok(view)
}

// =============================================================================
// CUSTODY MIRROR
// =============================================================================

/// Apply an observed on-chain event to the mirror. Called by the event
/// observer task; commits only after the event is in a block.
pub async fn apply_custody_event(state: &AppState, event: CustodyEvent) -> Result<(), AppError> {
    let now = rpc::now_ms() / 1000;
    match event {
        CustodyEvent::Deposited { account, token, amount } => {
            let asset = state.asset_by_token(token)?.clone();
            {
                let mut ledger = state.ledger.write().await;
                let mark = ledger.journal_len();
                ledger.deposit(account, &asset.symbol, amount, now);
                persist_commit(state, &ledger, mark).await?;
            }
            notify_balances(state, account).await;
        }
        CustodyEvent::Withdrawn { account, token, amount } => {
            let asset = state.asset_by_token(token)?.clone();
            {
                let mut ledger = state.ledger.write().await;
                let mark = ledger.journal_len();
                ledger.withdraw(account, &asset.symbol, amount, now)?;
                persist_commit(state, &ledger, mark).await?;
            }
            notify_balances(state, account).await;
        }
        CustodyEvent::Challenged { channel_id, candidate, expiry } => {
            let record = state.channels.read().await.get(&channel_id).cloned();
            if let Some(record) = record {
                let expiry = expiry.try_into().unwrap_or(u64::MAX);
                // The contract verified the challenger's attestation; the
                // mirror re-runs the admission rules for the candidate.
                let updated = match channel::validate_challenge(
                    &record,
                    &candidate,
                    &ChallengerSig::OnChain,
                    &UnanimousAdjudicator,
                    now,
                ) {
                    Ok(outcome) => {
                        let mut updated = channel::apply_challenge(&record, &outcome);
                        if updated.status == ChannelStatus::Dispute {
                            // The chain's expiry timestamp is authoritative.
                            updated.challenge_expiry = expiry;
                        }
                        updated
                    }
                    Err(error) => {
                        // On disagreement the on-chain state wins.
                        warn!(
                            channel_id = %format!("0x{:x}", channel_id),
                            error = %error,
                            "mirror disagreed with on-chain challenge, following the chain"
                        );
                        let mut updated = record.clone();
                        updated.status = ChannelStatus::Dispute;
                        updated.last_state = candidate.clone();
                        updated.challenge_expiry = expiry;
                        updated
                    }
                };
                if updated.status == ChannelStatus::Final {
                    // Challenge at INITIAL: the channel closed immediately.
                    state.channels.write().await.remove(&channel_id);
                    settle_mirror_close(state, channel_id, &updated, now).await?;
                } else {
                    state.channels.write().await.insert(channel_id, updated.clone());
                    crate::db::save_channel(&state.db, &updated).await?;
                    notify_channel(state, &updated).await;
                }
            }
        }
        CustodyEvent::Checkpointed { channel_id, candidate } => {
            let record = state.channels.read().await.get(&channel_id).cloned();
            if let Some(record) = record {
                let updated = match channel::validate_checkpoint(
                    &record,
                    &candidate,
                    &UnanimousAdjudicator,
                ) {
                    Ok(pinned) => channel::apply_checkpoint(&record, pinned),
                    Err(error) => {
                        warn!(
                            channel_id = %format!("0x{:x}", channel_id),
                            error = %error,
                            "mirror disagreed with on-chain checkpoint, following the chain"
                        );
                        let mut updated = record.clone();
                        updated.status = ChannelStatus::Active;
                        updated.last_state = candidate.clone();
                        updated.challenge_expiry = 0;
                        updated
                    }
                };
                state.channels.write().await.insert(channel_id, updated.clone());
                crate::db::save_channel(&state.db, &updated).await?;
                notify_channel(state, &updated).await;
            }
        }
        CustodyEvent::Opened { channel_id } => {
            let mut channels = state.channels.write().await;
            if let Some(record) = channels.get_mut(&channel_id) {
                record.status = ChannelStatus::Active;
                record.challenge_expiry = 0;
                let record = record.clone();
                crate::db::save_channel(&state.db, &record).await?;
                drop(channels);
                notify_channel(state, &record).await;
            }
        }
        CustodyEvent::Closed { channel_id } => {
            // Settle the mirror if an off-chain close hasn't already.
            let record = state.channels.write().await.remove(&channel_id);
            if let Some(record) = record {
                settle_mirror_close(state, channel_id, &record, now).await?;
            }
        }
    }
    Ok(())
}

/// Distribute a removed channel's escrow per its settled state and drop the
/// persisted record.
async fn settle_mirror_close(
    state: &AppState,
    channel_id: B256,
    record: &ChannelRecord,
    now: u64,
) -> Result<(), AppError> {
    let asset = state.asset_by_token(record.token())?.clone();
    {
        let mut ledger = state.ledger.write().await;
        let mark = ledger.journal_len();
        let payouts: Vec<(Address, String, U256)> = record
            .last_state
            .allocations
            .iter()
            .filter(|a| !a.amount.is_zero())
            .map(|a| (a.destination, asset.symbol.clone(), a.amount))
            .collect();
        ledger.unlock_from_channel(channel_id, &payouts, now)?;
        ledger.deregister_channel(record.channel.participants[0], channel_id);
        ledger.deregister_channel(record.channel.participants[1], channel_id);
        persist_commit(state, &ledger, mark).await?;
        db_save_escrow(state, &ledger, channel_id, &asset.symbol).await?;
    }
    crate::db::delete_channel(&state.db, channel_id).await?;
    notify_balances(state, record.wallets[0]).await;
    notify_balances(state, record.wallets[1]).await;
    Ok(())
}

fn submit_onchain_create(state: &AppState, record: &ChannelRecord) {
    if let Some(custody) = state.custody.clone() {
        let channel = record.channel.clone();
        let initial = record.last_state.clone();
        let join_sig = initial.sig(1).map(|s| s.to_string());
        tokio::spawn(async move {
            let channel_id = channel.id();
            match custody.submit_create(&channel, &initial).await {
                Ok(tx) => info!(tx = %format!("0x{:x}", tx), "custody create submitted"),
                Err(e) => {
                    warn!(error = %e, "custody create failed");
                    return;
                }
            }
            if let Some(sig) = join_sig {
                match custody.submit_join(channel_id, 1, &sig).await {
                    Ok(tx) => info!(tx = %format!("0x{:x}", tx), "custody join submitted"),
                    Err(e) => warn!(error = %e, "custody join failed"),
                }
            }
        });
    }
}

fn submit_onchain_resize(state: &AppState, channel_id: B256, candidate: &State, proof: &State) {
    if let Some(custody) = state.custody.clone() {
        let candidate = candidate.clone();
        let proof = proof.clone();
        tokio::spawn(async move {
            match custody.submit_resize(channel_id, &candidate, &[proof]).await {
                Ok(tx) => info!(tx = %format!("0x{:x}", tx), "custody resize submitted"),
                Err(e) => warn!(error = %e, "custody resize failed"),
            }
        });
    }
}

fn submit_onchain_close(state: &AppState, channel_id: B256, settled: &State) {
    if let Some(custody) = state.custody.clone() {
        let settled = settled.clone();
        tokio::spawn(async move {
            match custody.submit_close(channel_id, &settled, &[]).await {
                Ok(tx) => info!(tx = %format!("0x{:x}", tx), "custody close submitted"),
                Err(e) => warn!(error = %e, "custody close failed"),
            }
        });
    }
}

// =============================================================================
// PERSISTENCE AFTER COMMIT
// =============================================================================

/// Persist the balances touched by journal rows appended since `mark`,
/// plus the rows themselves.
async fn persist_commit(
    state: &AppState,
    ledger: &Ledger,
    mark: usize,
) -> Result<(), AppError> {
    for tx in ledger.journal_since(mark) {
        crate::db::append_transaction(&state.db, tx).await?;
        for account in [tx.from_account, tx.to_account] {
            if account != Address::ZERO {
                crate::db::save_balance(&state.db, account, &tx.asset, ledger.balance(account, &tx.asset))
                    .await?;
            }
        }
    }
    Ok(())
}

async fn db_save_escrow(
    state: &AppState,
    ledger: &Ledger,
    channel_id: B256,
    asset: &str,
) -> Result<(), AppError> {
    crate::db::save_escrow(&state.db, channel_id, asset, ledger.escrow_balance(channel_id, asset))
        .await?;
    Ok(())
}

// =============================================================================
// NOTIFICATIONS
// =============================================================================

pub async fn subscribe(state: &AppState, address: Address, sender: mpsc::Sender<String>) {
    state.subscriptions.write().await.entry(address).or_default().push(sender);
}

pub async fn unsubscribe(state: &AppState, address: Address) {
    let mut subs = state.subscriptions.write().await;
    if let Some(senders) = subs.get_mut(&address) {
        senders.retain(|s| !s.is_closed());
        if senders.is_empty() {
            subs.remove(&address);
        }
    }
}

async fn notification(state: &AppState, method: Method, params: serde_json::Value) -> String {
    let payload = RpcPayload::new(0, method, params, rpc::now_ms());
    signed_response(state, payload, None).await.encode()
}

async fn push(state: &AppState, address: Address, frame: String) {
    let subs = state.subscriptions.read().await;
    if let Some(senders) = subs.get(&address) {
        for sender in senders {
            let _ = sender.try_send(frame.clone());
        }
    }
}

pub async fn notify_balances(state: &AppState, address: Address) {
    let entries = {
        let ledger = state.ledger.read().await;
        to_balance_entries(state, ledger.balances(address))
    };
    let frame = notification(
        state,
        Method::BalanceUpdate,
        serde_json::to_value(BalanceUpdateNotice { balance_updates: entries }).unwrap(),
    )
    .await;
    push(state, address, frame).await;
}

pub async fn notify_channel(state: &AppState, record: &ChannelRecord) {
    let view = ChannelView::from_record(record);
    push_channel_view(state, record, view).await;
}

async fn push_channel_view(state: &AppState, record: &ChannelRecord, view: ChannelView) {
    let frame = notification(state, Method::ChannelUpdate, serde_json::to_value(view).unwrap()).await;
    for participant in record.channel.participants {
        push(state, participant, frame.clone()).await;
    }
}

async fn notify_transfer(state: &AppState, addresses: &[Address], views: &[TransactionView]) {
    let frame = notification(
        state,
        Method::TransferNotice,
        serde_json::to_value(TransferNotice { transactions: views.to_vec() }).unwrap(),
    )
    .await;
    for address in addresses {
        push(state, *address, frame.clone()).await;
    }
}

async fn notify_app_session(state: &AppState, view: &AppSessionView, participants: &[Address]) {
    let frame = notification(
        state,
        Method::AppSessionUpdate,
        serde_json::to_value(view).unwrap(),
    )
    .await;
    for participant in participants {
        push(state, *participant, frame.clone()).await;
    }
}

/// Snapshot of supported assets, pushed once per connection.
pub async fn assets_frame(state: &AppState) -> String {
    notification(
        state,
        Method::Assets,
        serde_json::to_value(AssetsNotice {
            assets: state.assets.iter().map(AssetView::from_asset).collect(),
        })
        .unwrap(),
    )
    .await
}

/// Channel list snapshot for an address, pushed after authentication.
pub async fn channels_frame(state: &AppState, address: Address) -> String {
    let ids = state.ledger.read().await.channels_of(address);
    let views: Vec<ChannelView> = {
        let channels = state.channels.read().await;
        ids.iter()
            .filter_map(|id| channels.get(id))
            .map(ChannelView::from_record)
            .collect()
    };
    notification(
        state,
        Method::Channels,
        serde_json::to_value(rpc::ChannelsNotice { channels: views }).unwrap(),
    )
    .await
}
