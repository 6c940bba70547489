// client.rs - Client-side connection actor
//
// One actor per connection: a sender handle, a reader task, and a
// request_id -> waiter map behind a lock. Requests return a future resolved
// by the paired response; frames with no pending entry are surfaced on the
// notification stream. The transport is a pair of framed string channels,
// so any byte stream can back it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alloy::signers::local::PrivateKeySigner;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::warn;

use crate::crypto;
use crate::error::AppError;
use crate::rpc::{self, Method, RpcMessage, RpcPayload};

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<RpcMessage>>>>;

pub struct Client {
    next_id: AtomicU64,
    pending: PendingMap,
    outbound: mpsc::Sender<String>,
    timeout: Duration,
}

impl Client {
    /// Wire the actor to a transport. Returns the client handle and the
    /// stream of broker-initiated notifications.
    pub fn new(
        outbound: mpsc::Sender<String>,
        mut inbound: mpsc::Receiver<String>,
        timeout: Duration,
    ) -> (Arc<Self>, mpsc::Receiver<RpcMessage>) {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (notify_tx, notify_rx) = mpsc::channel(64);

        let reader_pending = pending.clone();
        tokio::spawn(async move {
            while let Some(text) = inbound.recv().await {
                let message = match RpcMessage::parse(&text) {
                    Ok(message) => message,
                    Err(error) => {
                        warn!(error = %error, "dropping unparseable frame");
                        continue;
                    }
                };
                let payload = message.payload();
                let waiter = {
                    let mut pending = reader_pending.lock().await;
                    pending.remove(&payload.request_id)
                };
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(message);
                    }
                    // No pending entry: an asynchronous notification.
                    None => {
                        if notify_tx.send(message).await.is_err() {
                            break;
                        }
                    }
                }
            }
            // Transport gone: wake every waiter with a closed channel.
            reader_pending.lock().await.clear();
        });

        (
            Arc::new(Self {
                next_id: AtomicU64::new(1),
                pending,
                outbound,
                timeout,
            }),
            notify_rx,
        )
    }

    /// Monotonically increasing per-connection request id.
    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Send an unsigned request and await its paired response.
    pub async fn request(&self, method: Method, params: Value) -> Result<RpcPayload, AppError> {
        self.send(method, params, Vec::new()).await
    }

    /// Send a request signed EIP-191 with the given key.
    pub async fn request_signed(
        &self,
        signer: &PrivateKeySigner,
        method: Method,
        params: Value,
    ) -> Result<RpcPayload, AppError> {
        let payload = RpcPayload::new(self.allocate_id(), method, params, rpc::now_ms());
        let sig = crypto::sign_eip191(signer, payload.digest()).await?;
        self.dispatch(payload, vec![sig]).await
    }

    async fn send(
        &self,
        method: Method,
        params: Value,
        sigs: Vec<String>,
    ) -> Result<RpcPayload, AppError> {
        let payload = RpcPayload::new(self.allocate_id(), method, params, rpc::now_ms());
        self.dispatch(payload, sigs).await
    }

    async fn dispatch(&self, payload: RpcPayload, sigs: Vec<String>) -> Result<RpcPayload, AppError> {
        let request_id = payload.request_id;
        let (waiter_tx, waiter_rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id, waiter_tx);

        let frame = RpcMessage::request(payload, sigs).encode();
        if self.outbound.send(frame).await.is_err() {
            self.pending.lock().await.remove(&request_id);
            return Err(AppError::Internal("connection closed".into()));
        }

        let response = match tokio::time::timeout(self.timeout, waiter_rx).await {
            Ok(Ok(message)) => message,
            Ok(Err(_)) => {
                // Reader task dropped the waiter: transport went away.
                return Err(AppError::Internal("connection closed".into()));
            }
            Err(_) => {
                // Timed out: drop the waiter so a late response becomes a
                // notification instead of leaking the map entry.
                self.pending.lock().await.remove(&request_id);
                return Err(AppError::Internal(format!(
                    "request {} timed out",
                    request_id
                )));
            }
        };

        let payload = response.payload().clone();
        if payload.method == Method::Error.as_str() {
            let code = payload.params["code"].as_i64().unwrap_or(-32603);
            let message = payload.params["error"].as_str().unwrap_or("unknown").to_string();
            return Err(AppError::InvalidRequest(format!("{} (code {})", message, code)));
        }
        Ok(payload)
    }
}
