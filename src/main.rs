// main.rs - Entry point for the broker service

mod auth; // Session-key authentication
mod channel; // Channel engine
mod client; // Client-side connection actor
mod config; // Configuration from environment
mod crypto; // Digests and signatures
mod custody; // On-chain custody interface
mod db; // Database operations
mod error; // Custom error types
mod handlers; // WebSocket surface
mod ledger; // Session ledger
mod model; // Data structures
mod rpc; // Wire protocol
mod service; // Broker orchestrator

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use alloy::primitives::Address;
use alloy::providers::{Provider, ProviderBuilder};
use alloy::signers::local::PrivateKeySigner;
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};

use crate::config::Config;
use crate::db::{init_db, load_state};
use crate::handlers::create_router;
use crate::model::Asset;
use crate::service::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Arc::new(Config::from_env()?);
    let port = config.port;

    let db = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await?;
    init_db(&db).await?;

    let persisted = load_state(&db).await?;
    info!(
        "Loaded {} channels and {} session keys from database",
        persisted.channels.len(),
        persisted.session_keys.len()
    );

    let provider = ProviderBuilder::new()
        .disable_recommended_fillers()
        .connect_http(config.rpc_url.parse()?);
    let provider = Arc::new(provider);

    let broker_signer: PrivateKeySigner = config.broker_private_key.parse()?;
    info!("Broker address: {}", broker_signer.address());

    // A chain-id mismatch would make every signature useless on-chain.
    custody::verify_chain(provider.clone(), config.chain_id).await?;
    info!("Chain id verified against the RPC endpoint");

    // Supported assets: ASSETS env var as a JSON array, or native only.
    let assets: Vec<Asset> = match std::env::var("ASSETS") {
        Ok(text) => serde_json::from_str(&text)?,
        Err(_) => vec![Asset {
            token: Address::ZERO,
            symbol: "eth".into(),
            decimals: 18,
        }],
    };

    let custody = Arc::new(custody::Custody::new(
        config.custody,
        config.rpc_url.clone(),
        broker_signer.clone(),
    ));

    let state = AppState {
        db,
        ledger: Arc::new(RwLock::new(persisted.ledger)),
        channels: Arc::new(RwLock::new(persisted.channels)),
        session_keys: Arc::new(RwLock::new(persisted.session_keys)),
        subscriptions: Arc::new(RwLock::new(HashMap::new())),
        config: config.clone(),
        broker_signer,
        assets: Arc::new(assets),
        custody: Some(custody),
    };

    // Observe custody events and mirror them into the ledger.
    let (event_tx, mut event_rx) = mpsc::channel(256);
    let from_block = provider.get_block_number().await.unwrap_or(0);
    tokio::spawn(custody::run_event_observer(
        provider.clone(),
        config.custody,
        from_block,
        event_tx,
    ));
    let observer_state = state.clone();
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            if let Err(error) = service::apply_custody_event(&observer_state, event).await {
                warn!(error = %error, "failed to apply custody event");
            }
        }
    });

    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Broker listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
