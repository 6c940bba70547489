// handlers.rs - HTTP/WebSocket surface
//
// The router carries a health probe and the WebSocket upgrade. Each
// connection runs one loop: frames are parsed, gated through the auth state
// machine, dispatched, and answered with broker-signed responses.
// Notifications arrive through a per-connection mpsc and interleave freely
// with responses.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::info;

use crate::auth::{self, PendingChallenge, SessionAuth};
use crate::error::AppError;
use crate::rpc::{self, AuthChallengeParams, AuthRequestParams, AuthVerifyParams, AuthVerifyResult, Method, RpcMessage, RpcPayload};
use crate::service::{self, AppState};

// =============================================================================
// ROUTER SETUP
// =============================================================================

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

// =============================================================================
// CONNECTION LOOP
// =============================================================================

/// Per-connection auth and correlation state.
#[derive(Default)]
pub(crate) struct ConnState {
    pub auth: Option<SessionAuth>,
    pub pending: Option<PendingChallenge>,
    pub last_request_id: u64,
}

async fn handle_socket(state: AppState, socket: WebSocket) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(64);
    let mut conn = ConnState::default();

    // Asset snapshot greets every connection.
    let _ = out_tx.send(service::assets_frame(&state).await).await;

    loop {
        tokio::select! {
            frame = out_rx.recv() => {
                match frame {
                    Some(text) => {
                        if ws_tx.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let (reply, close) =
                            process_frame(&state, &mut conn, &out_tx, &text).await;
                        if let Some(frame) = reply {
                            if ws_tx.send(Message::Text(frame)).await.is_err() {
                                break;
                            }
                        }
                        if close {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws_tx.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    // Disconnect releases subscriptions and any reserved auth state.
    if let Some(auth) = conn.auth.take() {
        service::unsubscribe(&state, auth.wallet).await;
        info!(wallet = %format!("0x{:x}", auth.wallet), "session disconnected");
    }
}

/// Handle one inbound frame. Returns the reply (if any) and whether the
/// connection must close (failed authentication).
pub(crate) async fn process_frame(
    state: &AppState,
    conn: &mut ConnState,
    out_tx: &mpsc::Sender<String>,
    text: &str,
) -> (Option<String>, bool) {
    let now = rpc::now_ms();
    let message = match RpcMessage::parse(text) {
        Ok(message) => message,
        Err(error) => {
            let payload = rpc::error_response(0, &error, now);
            return (Some(service::signed_response(state, payload, None).await.encode()), false);
        }
    };
    // Client-sent responses have no pending entry on the broker side.
    if message.req.is_none() {
        return (None, false);
    }
    let request_id = message.payload().request_id;

    match process_request(state, conn, out_tx, &message, now).await {
        Ok((payload, sid)) => {
            (Some(service::signed_response(state, payload, sid).await.encode()), false)
        }
        Err(error) => {
            let close = matches!(error, AppError::AuthFailed(_));
            let payload = rpc::error_response(request_id, &error, now);
            (Some(service::signed_response(state, payload, None).await.encode()), close)
        }
    }
}

async fn process_request(
    state: &AppState,
    conn: &mut ConnState,
    out_tx: &mpsc::Sender<String>,
    message: &RpcMessage,
    now: u64,
) -> Result<(RpcPayload, Option<String>), AppError> {
    let payload = message.payload();
    rpc::validate_timestamp(payload.timestamp, now)?;
    if payload.request_id <= conn.last_request_id {
        return Err(AppError::InvalidRequestId {
            expected: conn.last_request_id,
            actual: payload.request_id,
        });
    }
    conn.last_request_id = payload.request_id;

    let method = payload.method()?;
    match method {
        Method::AuthRequest => {
            let params: AuthRequestParams = payload.parse_params()?;
            info!(address = %params.address, "auth request");
            let pending = auth::issue_challenge(&params, now / 1000)?;
            let challenge = AuthChallengeParams {
                challenge_message: pending.challenge.clone(),
            };
            conn.pending = Some(pending);
            Ok((
                RpcPayload::new(
                    payload.request_id,
                    Method::AuthChallenge,
                    serde_json::to_value(challenge).unwrap(),
                    now,
                ),
                None,
            ))
        }
        Method::AuthVerify => {
            let params: AuthVerifyParams = payload.parse_params()?;
            let (session, jwt_token) = if let Some(token) = params.jwt.as_deref() {
                let session = auth::verify_jwt(&state.config.jwt_secret, token)?;
                (session, None)
            } else {
                let pending = conn
                    .pending
                    .take()
                    .ok_or_else(|| AppError::AuthFailed("no challenge outstanding".into()))?;
                if params.challenge.as_deref() != Some(pending.challenge.as_str()) {
                    return Err(AppError::AuthFailed("challenge mismatch".into()));
                }
                let signature = message
                    .sig
                    .first()
                    .ok_or_else(|| AppError::AuthFailed("missing policy signature".into()))?;
                let domain = crate::crypto::SigDomain {
                    chain_id: state.config.chain_id,
                    verifying_contract: state.config.custody,
                };
                let session = auth::verify_challenge(
                    &pending,
                    signature,
                    &domain,
                    now / 1000,
                    state.config.auth_timeout,
                )?;
                let token = auth::issue_jwt(&state.config.jwt_secret, &session)?;
                (session, Some(token))
            };

            crate::db::save_session_key(&state.db, &session).await?;
            state
                .session_keys
                .write()
                .await
                .insert(session.session_key, session.clone());
            service::subscribe(state, session.wallet, out_tx.clone()).await;
            // Channel snapshot follows the successful handshake.
            let _ = out_tx.send(service::channels_frame(state, session.wallet).await).await;
            info!(wallet = %format!("0x{:x}", session.wallet), "session authenticated");

            let result = AuthVerifyResult {
                success: true,
                address: format!("0x{:x}", session.wallet),
                session_key: format!("0x{:x}", session.session_key),
                jwt_token,
            };
            conn.auth = Some(session);
            Ok((
                RpcPayload::new(
                    payload.request_id,
                    Method::AuthVerify,
                    serde_json::to_value(result).unwrap(),
                    now,
                ),
                None,
            ))
        }
        _ => {
            let session = conn
                .auth
                .as_ref()
                .ok_or_else(|| AppError::AuthFailed("not authenticated".into()))?;
            if session.expired(now / 1000) {
                return Err(AppError::AuthFailed("session key expired".into()));
            }
            auth::authorize_request(payload, &message.sig, session)?;
            service::dispatch(state, session, message).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto;
    use alloy::signers::local::PrivateKeySigner;
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::sync::RwLock;

    async fn test_state() -> AppState {
        let db = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::db::init_db(&db).await.unwrap();
        let config = crate::config::Config {
            port: 0,
            database_url: "sqlite::memory:".into(),
            rpc_url: "http://localhost:8545".into(),
            chain_id: 31337,
            broker_private_key: String::new(),
            custody: "0x5FbDB2315678afecb367f032d93F642f64180aa3".parse().unwrap(),
            adjudicator: "0xe7f1725E7734CE288F8367e1Bb143E90bb3F0512".parse().unwrap(),
            jwt_secret: "secret".into(),
            challenge_duration: 86400,
            request_timeout: 10,
            auth_timeout: 60,
        };
        AppState {
            db,
            ledger: Arc::new(RwLock::new(crate::ledger::Ledger::new())),
            channels: Arc::new(RwLock::new(HashMap::new())),
            session_keys: Arc::new(RwLock::new(HashMap::new())),
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
            config: Arc::new(config),
            broker_signer: PrivateKeySigner::random(),
            assets: Arc::new(vec![]),
            custody: None,
        }
    }

    async fn auth_handshake(
        state: &AppState,
        conn: &mut ConnState,
        out_tx: &mpsc::Sender<String>,
        wallet: &PrivateKeySigner,
    ) -> RpcMessage {
        let session_key = PrivateKeySigner::random().address();
        let request = RpcMessage::request(
            RpcPayload::new(
                1,
                Method::AuthRequest,
                json!({
                    "address": format!("0x{:x}", wallet.address()),
                    "sessionKey": format!("0x{:x}", session_key),
                    "application": "test",
                    "allowances": [],
                    "expiresAt": u32::MAX,
                    "scope": "app.create",
                }),
                rpc::now_ms(),
            ),
            vec![],
        );
        let (reply, close) = process_frame(state, conn, out_tx, &request.encode()).await;
        assert!(!close);
        let challenge_frame = RpcMessage::parse(&reply.unwrap()).unwrap();
        let challenge: AuthChallengeParams =
            challenge_frame.payload().parse_params().unwrap();

        let pending = conn.pending.as_ref().expect("challenge outstanding");
        let struct_hash = crypto::policy_struct_hash(
            &pending.challenge,
            &pending.scope,
            pending.wallet,
            pending.session_key,
            pending.expires_at,
            &pending.allowances,
        );
        let domain = crypto::SigDomain {
            chain_id: state.config.chain_id,
            verifying_contract: state.config.custody,
        };
        let sig = crypto::sign_digest(wallet, crypto::eip712_digest(&domain, struct_hash))
            .await
            .unwrap();

        let verify = RpcMessage::request(
            RpcPayload::new(
                2,
                Method::AuthVerify,
                json!({"challenge": challenge.challenge_message}),
                rpc::now_ms(),
            ),
            vec![sig],
        );
        let (reply, close) = process_frame(state, conn, out_tx, &verify.encode()).await;
        assert!(!close);
        RpcMessage::parse(&reply.unwrap()).unwrap()
    }

    #[tokio::test]
    async fn full_auth_handshake_issues_jwt() {
        let state = test_state().await;
        let wallet = PrivateKeySigner::random();
        let mut conn = ConnState::default();
        let (out_tx, mut out_rx) = mpsc::channel(16);

        let response = auth_handshake(&state, &mut conn, &out_tx, &wallet).await;
        let result: AuthVerifyResult = response.payload().parse_params().unwrap();
        assert!(result.success);
        assert_eq!(result.address, format!("0x{:x}", wallet.address()));
        let token = result.jwt_token.expect("challenge path issues a token");
        assert!(conn.auth.is_some());

        // The channels snapshot was pushed after authentication.
        let pushed = out_rx.recv().await.expect("channels frame");
        let frame = RpcMessage::parse(&pushed).unwrap();
        assert_eq!(frame.payload().method().unwrap(), Method::Channels);

        // A fresh connection can resume with the JWT alone.
        let mut conn2 = ConnState::default();
        let (out_tx2, _out_rx2) = mpsc::channel(16);
        let verify = RpcMessage::request(
            RpcPayload::new(1, Method::AuthVerify, json!({"jwt": token}), rpc::now_ms()),
            vec![],
        );
        let (reply, close) = process_frame(&state, &mut conn2, &out_tx2, &verify.encode()).await;
        assert!(!close);
        let response = RpcMessage::parse(&reply.unwrap()).unwrap();
        let result: AuthVerifyResult = response.payload().parse_params().unwrap();
        assert!(result.success);
        assert!(result.jwt_token.is_none());
    }

    #[tokio::test]
    async fn unauthenticated_requests_close_the_session() {
        let state = test_state().await;
        let mut conn = ConnState::default();
        let (out_tx, _out_rx) = mpsc::channel(16);

        let request = RpcMessage::request(
            RpcPayload::new(1, Method::Ping, json!({}), rpc::now_ms()),
            vec![],
        );
        let (reply, close) = process_frame(&state, &mut conn, &out_tx, &request.encode()).await;
        assert!(close);
        let frame = RpcMessage::parse(&reply.unwrap()).unwrap();
        assert_eq!(frame.payload().method().unwrap(), Method::Error);
        assert_eq!(frame.payload().params["code"], -32000);
    }

    #[tokio::test]
    async fn stale_request_ids_are_rejected() {
        let state = test_state().await;
        let wallet = PrivateKeySigner::random();
        let mut conn = ConnState::default();
        let (out_tx, _out_rx) = mpsc::channel(16);
        auth_handshake(&state, &mut conn, &out_tx, &wallet).await;

        // Ids 1 and 2 were consumed by the handshake; replaying 2 fails.
        let payload = RpcPayload::new(2, Method::Ping, json!({}), rpc::now_ms());
        let sig = crypto::sign_eip191(&wallet, payload.digest()).await.unwrap();
        let request = RpcMessage::request(payload, vec![sig]);
        let (reply, _) = process_frame(&state, &mut conn, &out_tx, &request.encode()).await;
        let frame = RpcMessage::parse(&reply.unwrap()).unwrap();
        assert_eq!(frame.payload().params["code"], -32005);
    }

    #[tokio::test]
    async fn malformed_frames_answer_with_parse_error() {
        let state = test_state().await;
        let mut conn = ConnState::default();
        let (out_tx, _out_rx) = mpsc::channel(16);

        let (reply, close) = process_frame(&state, &mut conn, &out_tx, "{{nonsense").await;
        assert!(!close);
        let frame = RpcMessage::parse(&reply.unwrap()).unwrap();
        assert_eq!(frame.payload().params["code"], -32700);
    }

    #[tokio::test]
    async fn signed_request_dispatches_after_auth() {
        let state = test_state().await;
        let wallet = PrivateKeySigner::random();
        let mut conn = ConnState::default();
        let (out_tx, _out_rx) = mpsc::channel(16);
        auth_handshake(&state, &mut conn, &out_tx, &wallet).await;

        let payload = RpcPayload::new(3, Method::Ping, json!({}), rpc::now_ms());
        let sig = crypto::sign_eip191(&wallet, payload.digest()).await.unwrap();
        let request = RpcMessage::request(payload, vec![sig]);
        let (reply, close) = process_frame(&state, &mut conn, &out_tx, &request.encode()).await;
        assert!(!close);
        let frame = RpcMessage::parse(&reply.unwrap()).unwrap();
        assert_eq!(frame.payload().method().unwrap(), Method::Pong);

        // Unsigned requests are refused even when authenticated.
        let request = RpcMessage::request(
            RpcPayload::new(4, Method::Ping, json!({}), rpc::now_ms()),
            vec![],
        );
        let (reply, _) = process_frame(&state, &mut conn, &out_tx, &request.encode()).await;
        let frame = RpcMessage::parse(&reply.unwrap()).unwrap();
        assert_eq!(frame.payload().params["code"], -32003);
    }
}
