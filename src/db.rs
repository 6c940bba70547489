// db.rs - Database operations
//
// SQLite via sqlx: tables created idempotently at startup, full state
// loaded into memory at boot, upserts after every committed operation.
// Addresses and hashes are stored as 0x-hex text, amounts as decimal text.

use sqlx::{Row, SqlitePool};
use std::collections::HashMap;

use alloy::primitives::{Address, B256};

use crate::auth::SessionAuth;
use crate::crypto::{parse_address, parse_b256, parse_u256};
use crate::ledger::Ledger;
use crate::model::{AppSession, ChannelRecord, ChannelStatus, LedgerTransaction, State, TxType};

// =============================================================================
// DATABASE INITIALIZATION
// =============================================================================

/// Create tables if they don't exist. Safe to run repeatedly.
pub async fn init_db(db: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS accounts (\
            account TEXT NOT NULL,\
            asset TEXT NOT NULL,\
            balance TEXT NOT NULL,\
            PRIMARY KEY (account, asset)\
        )",
    )
    .execute(db)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS channel_escrow (\
            channel_id TEXT NOT NULL,\
            asset TEXT NOT NULL,\
            balance TEXT NOT NULL,\
            PRIMARY KEY (channel_id, asset)\
        )",
    )
    .execute(db)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS channels (\
            channel_id TEXT PRIMARY KEY,\
            status TEXT NOT NULL,\
            participant0 TEXT NOT NULL,\
            participant1 TEXT NOT NULL,\
            adjudicator TEXT NOT NULL,\
            challenge_duration BIGINT NOT NULL,\
            nonce BIGINT NOT NULL,\
            wallet0 TEXT NOT NULL,\
            wallet1 TEXT NOT NULL,\
            expected0 TEXT NOT NULL,\
            expected1 TEXT NOT NULL,\
            actual0 TEXT NOT NULL,\
            actual1 TEXT NOT NULL,\
            challenge_expiry BIGINT NOT NULL,\
            last_state TEXT NOT NULL\
        )",
    )
    .execute(db)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS app_sessions (\
            session_id TEXT PRIMARY KEY,\
            definition TEXT NOT NULL,\
            version BIGINT NOT NULL,\
            status TEXT NOT NULL,\
            allocations TEXT NOT NULL\
        )",
    )
    .execute(db)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS session_keys (\
            session_key TEXT PRIMARY KEY,\
            wallet TEXT NOT NULL,\
            application TEXT NOT NULL,\
            scope TEXT NOT NULL,\
            expires_at BIGINT NOT NULL\
        )",
    )
    .execute(db)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS ledger_transactions (\
            id BIGINT PRIMARY KEY,\
            tx_type TEXT NOT NULL,\
            from_account TEXT NOT NULL,\
            to_account TEXT NOT NULL,\
            asset TEXT NOT NULL,\
            amount TEXT NOT NULL,\
            created_at BIGINT NOT NULL\
        )",
    )
    .execute(db)
    .await?;

    Ok(())
}

fn status_str(status: ChannelStatus) -> &'static str {
    match status {
        ChannelStatus::Void => "void",
        ChannelStatus::Initial => "initial",
        ChannelStatus::Active => "active",
        ChannelStatus::Dispute => "dispute",
        ChannelStatus::Final => "final",
    }
}

fn parse_status(text: &str) -> ChannelStatus {
    match text {
        "initial" => ChannelStatus::Initial,
        "active" => ChannelStatus::Active,
        "dispute" => ChannelStatus::Dispute,
        "final" => ChannelStatus::Final,
        _ => ChannelStatus::Void,
    }
}

fn parse_tx_type(text: &str) -> TxType {
    match text {
        "withdrawal" => TxType::Withdrawal,
        "transfer" => TxType::Transfer,
        "app_deposit" => TxType::AppDeposit,
        "app_withdrawal" => TxType::AppWithdrawal,
        "channel_lock" => TxType::ChannelLock,
        "channel_unlock" => TxType::ChannelUnlock,
        _ => TxType::Deposit,
    }
}

// =============================================================================
// LOADING STATE
// =============================================================================

/// Everything the broker restores at boot.
pub struct PersistedState {
    pub ledger: Ledger,
    pub channels: HashMap<B256, ChannelRecord>,
    pub session_keys: HashMap<Address, SessionAuth>,
}

pub async fn load_state(db: &SqlitePool) -> Result<PersistedState, sqlx::Error> {
    let mut ledger = Ledger::new();

    let rows = sqlx::query("SELECT account, asset, balance FROM accounts")
        .fetch_all(db)
        .await?;
    for row in rows {
        let account: String = row.try_get("account")?;
        let asset: String = row.try_get("asset")?;
        let balance: String = row.try_get("balance")?;
        ledger.restore_balance(
            parse_address(&account).unwrap_or_default(),
            &asset,
            parse_u256(&balance).unwrap_or_default(),
        );
    }

    let rows = sqlx::query("SELECT channel_id, asset, balance FROM channel_escrow")
        .fetch_all(db)
        .await?;
    for row in rows {
        let channel_id: String = row.try_get("channel_id")?;
        let asset: String = row.try_get("asset")?;
        let balance: String = row.try_get("balance")?;
        ledger.restore_escrow(
            parse_b256(&channel_id).unwrap_or_default(),
            &asset,
            parse_u256(&balance).unwrap_or_default(),
        );
    }

    let rows = sqlx::query(
        "SELECT channel_id, status, participant0, participant1, adjudicator, \
         challenge_duration, nonce, wallet0, wallet1, expected0, expected1, \
         actual0, actual1, challenge_expiry, last_state FROM channels",
    )
    .fetch_all(db)
    .await?;
    let mut channels = HashMap::new();
    for row in rows {
        let channel_id: String = row.try_get("channel_id")?;
        let status: String = row.try_get("status")?;
        let participant0: String = row.try_get("participant0")?;
        let participant1: String = row.try_get("participant1")?;
        let adjudicator: String = row.try_get("adjudicator")?;
        let challenge_duration: i64 = row.try_get("challenge_duration")?;
        let nonce: i64 = row.try_get("nonce")?;
        let wallet0: String = row.try_get("wallet0")?;
        let wallet1: String = row.try_get("wallet1")?;
        let expected0: String = row.try_get("expected0")?;
        let expected1: String = row.try_get("expected1")?;
        let actual0: String = row.try_get("actual0")?;
        let actual1: String = row.try_get("actual1")?;
        let challenge_expiry: i64 = row.try_get("challenge_expiry")?;
        let last_state: String = row.try_get("last_state")?;

        let last_state: State = match serde_json::from_str(&last_state) {
            Ok(state) => state,
            Err(_) => continue,
        };
        let record = ChannelRecord {
            channel: crate::model::Channel {
                participants: [
                    parse_address(&participant0).unwrap_or_default(),
                    parse_address(&participant1).unwrap_or_default(),
                ],
                adjudicator: parse_address(&adjudicator).unwrap_or_default(),
                challenge_duration: challenge_duration as u64,
                nonce: nonce as u64,
            },
            status: parse_status(&status),
            wallets: [
                parse_address(&wallet0).unwrap_or_default(),
                parse_address(&wallet1).unwrap_or_default(),
            ],
            expected_deposits: [
                parse_u256(&expected0).unwrap_or_default(),
                parse_u256(&expected1).unwrap_or_default(),
            ],
            actual_deposits: [
                parse_u256(&actual0).unwrap_or_default(),
                parse_u256(&actual1).unwrap_or_default(),
            ],
            challenge_expiry: challenge_expiry as u64,
            last_state,
        };
        let id = parse_b256(&channel_id).unwrap_or_default();
        for participant in record.channel.participants {
            ledger.register_channel(participant, id);
        }
        channels.insert(id, record);
    }

    let rows = sqlx::query("SELECT session_id, definition, version, status, allocations FROM app_sessions")
        .fetch_all(db)
        .await?;
    for row in rows {
        let session_id: String = row.try_get("session_id")?;
        let definition: String = row.try_get("definition")?;
        let version: i64 = row.try_get("version")?;
        let status: String = row.try_get("status")?;
        let allocations: String = row.try_get("allocations")?;

        let definition = match serde_json::from_str(&definition) {
            Ok(definition) => definition,
            Err(_) => continue,
        };
        let allocations = serde_json::from_str(&allocations).unwrap_or_default();
        ledger.restore_session(AppSession {
            id: parse_b256(&session_id).unwrap_or_default(),
            definition,
            version: version as u64,
            status: if status == "closed" {
                crate::model::AppStatus::Closed
            } else {
                crate::model::AppStatus::Open
            },
            allocations,
        });
    }

    let rows = sqlx::query("SELECT session_key, wallet, application, scope, expires_at FROM session_keys")
        .fetch_all(db)
        .await?;
    let mut session_keys = HashMap::new();
    for row in rows {
        let session_key: String = row.try_get("session_key")?;
        let wallet: String = row.try_get("wallet")?;
        let application: String = row.try_get("application")?;
        let scope: String = row.try_get("scope")?;
        let expires_at: i64 = row.try_get("expires_at")?;
        let key = parse_address(&session_key).unwrap_or_default();
        session_keys.insert(
            key,
            SessionAuth {
                wallet: parse_address(&wallet).unwrap_or_default(),
                session_key: key,
                application,
                scope,
                expires_at: expires_at as u64,
            },
        );
    }

    let rows = sqlx::query(
        "SELECT id, tx_type, from_account, to_account, asset, amount, created_at \
         FROM ledger_transactions ORDER BY id",
    )
    .fetch_all(db)
    .await?;
    let mut journal = Vec::with_capacity(rows.len());
    for row in rows {
        let id: i64 = row.try_get("id")?;
        let tx_type: String = row.try_get("tx_type")?;
        let from_account: String = row.try_get("from_account")?;
        let to_account: String = row.try_get("to_account")?;
        let asset: String = row.try_get("asset")?;
        let amount: String = row.try_get("amount")?;
        let created_at: i64 = row.try_get("created_at")?;
        journal.push(LedgerTransaction {
            id: id as u64,
            tx_type: parse_tx_type(&tx_type),
            from_account: parse_address(&from_account).unwrap_or_default(),
            to_account: parse_address(&to_account).unwrap_or_default(),
            asset,
            amount: parse_u256(&amount).unwrap_or_default(),
            created_at: created_at as u64,
        });
    }
    ledger.restore_journal(journal);

    Ok(PersistedState { ledger, channels, session_keys })
}

// =============================================================================
// SAVING STATE
// =============================================================================

pub async fn save_balance(
    db: &SqlitePool,
    account: Address,
    asset: &str,
    balance: alloy::primitives::U256,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO accounts (account, asset, balance) VALUES ($1, $2, $3) \
         ON CONFLICT (account, asset) DO UPDATE SET balance = EXCLUDED.balance",
    )
    .bind(format!("0x{:x}", account))
    .bind(asset)
    .bind(balance.to_string())
    .execute(db)
    .await?;
    Ok(())
}

pub async fn save_escrow(
    db: &SqlitePool,
    channel_id: B256,
    asset: &str,
    balance: alloy::primitives::U256,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO channel_escrow (channel_id, asset, balance) VALUES ($1, $2, $3) \
         ON CONFLICT (channel_id, asset) DO UPDATE SET balance = EXCLUDED.balance",
    )
    .bind(format!("0x{:x}", channel_id))
    .bind(asset)
    .bind(balance.to_string())
    .execute(db)
    .await?;
    Ok(())
}

pub async fn save_channel(db: &SqlitePool, record: &ChannelRecord) -> Result<(), sqlx::Error> {
    let last_state =
        serde_json::to_string(&record.last_state).expect("state always serializes");
    sqlx::query(
        "INSERT INTO channels \
            (channel_id, status, participant0, participant1, adjudicator, \
             challenge_duration, nonce, wallet0, wallet1, expected0, expected1, \
             actual0, actual1, challenge_expiry, last_state) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15) \
         ON CONFLICT (channel_id) DO UPDATE SET \
            status = EXCLUDED.status, \
            wallet0 = EXCLUDED.wallet0, \
            wallet1 = EXCLUDED.wallet1, \
            expected0 = EXCLUDED.expected0, \
            expected1 = EXCLUDED.expected1, \
            actual0 = EXCLUDED.actual0, \
            actual1 = EXCLUDED.actual1, \
            challenge_expiry = EXCLUDED.challenge_expiry, \
            last_state = EXCLUDED.last_state",
    )
    .bind(format!("0x{:x}", record.channel_id()))
    .bind(status_str(record.status))
    .bind(format!("0x{:x}", record.channel.participants[0]))
    .bind(format!("0x{:x}", record.channel.participants[1]))
    .bind(format!("0x{:x}", record.channel.adjudicator))
    .bind(record.channel.challenge_duration as i64)
    .bind(record.channel.nonce as i64)
    .bind(format!("0x{:x}", record.wallets[0]))
    .bind(format!("0x{:x}", record.wallets[1]))
    .bind(record.expected_deposits[0].to_string())
    .bind(record.expected_deposits[1].to_string())
    .bind(record.actual_deposits[0].to_string())
    .bind(record.actual_deposits[1].to_string())
    .bind(record.challenge_expiry as i64)
    .bind(last_state)
    .execute(db)
    .await?;
    Ok(())
}

/// FINAL channels are deleted, not updated.
pub async fn delete_channel(db: &SqlitePool, channel_id: B256) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM channels WHERE channel_id = $1")
        .bind(format!("0x{:x}", channel_id))
        .execute(db)
        .await?;
    Ok(())
}

pub async fn save_app_session(db: &SqlitePool, session: &AppSession) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO app_sessions (session_id, definition, version, status, allocations) \
         VALUES ($1, $2, $3, $4, $5) \
         ON CONFLICT (session_id) DO UPDATE SET \
            version = EXCLUDED.version, \
            status = EXCLUDED.status, \
            allocations = EXCLUDED.allocations",
    )
    .bind(format!("0x{:x}", session.id))
    .bind(serde_json::to_string(&session.definition).expect("definition serializes"))
    .bind(session.version as i64)
    .bind(match session.status {
        crate::model::AppStatus::Open => "open",
        crate::model::AppStatus::Closed => "closed",
    })
    .bind(serde_json::to_string(&session.allocations).expect("allocations serialize"))
    .execute(db)
    .await?;
    Ok(())
}

pub async fn save_session_key(db: &SqlitePool, auth: &SessionAuth) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO session_keys (session_key, wallet, application, scope, expires_at) \
         VALUES ($1, $2, $3, $4, $5) \
         ON CONFLICT (session_key) DO UPDATE SET \
            wallet = EXCLUDED.wallet, \
            application = EXCLUDED.application, \
            scope = EXCLUDED.scope, \
            expires_at = EXCLUDED.expires_at",
    )
    .bind(format!("0x{:x}", auth.session_key))
    .bind(format!("0x{:x}", auth.wallet))
    .bind(&auth.application)
    .bind(&auth.scope)
    .bind(auth.expires_at as i64)
    .execute(db)
    .await?;
    Ok(())
}

pub async fn append_transaction(
    db: &SqlitePool,
    tx: &LedgerTransaction,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO ledger_transactions \
            (id, tx_type, from_account, to_account, asset, amount, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         ON CONFLICT (id) DO NOTHING",
    )
    .bind(tx.id as i64)
    .bind(tx.tx_type.as_str())
    .bind(format!("0x{:x}", tx.from_account))
    .bind(format!("0x{:x}", tx.to_account))
    .bind(&tx.asset)
    .bind(tx.amount.to_string())
    .bind(tx.created_at as i64)
    .execute(db)
    .await?;
    Ok(())
}
