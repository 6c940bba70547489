// rpc.rs - Wire protocol
//
// Every message is a JSON document with exactly one of `req` or `res`, each
// a `[request_id, method, params, timestamp]` array, plus a parallel `sig`
// array and an optional `sid` for application-scoped messages. Field-level
// validation happens in the typed params structs; handlers never touch raw
// JSON shapes beyond this module.

use serde::de::{self, SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use alloy::primitives::Bytes;

use crate::crypto::Allowance;
use crate::error::AppError;
use crate::model::{
    Allocation, AppIntent, AppProtocol, AssetView, BalanceEntry, Channel, ChannelView, Intent,
    State, TransactionView,
};

/// Requests with a timestamp farther in the future are rejected (clock drift
/// allowance), in milliseconds.
const MAX_FUTURE_MS: u64 = 15 * 60 * 1000;

/// Requests older than this are rejected, in milliseconds.
const MAX_AGE_MS: u64 = 5 * 60 * 1000;

/// Milliseconds since epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Reject timestamps outside the freshness window.
pub fn validate_timestamp(timestamp: u64, now: u64) -> Result<(), AppError> {
    if timestamp > now + MAX_FUTURE_MS {
        return Err(AppError::InvalidTimestamp(format!(
            "timestamp {} is too far in the future",
            timestamp
        )));
    }
    if timestamp + MAX_AGE_MS < now {
        return Err(AppError::InvalidTimestamp(format!(
            "timestamp {} is stale",
            timestamp
        )));
    }
    Ok(())
}

// =============================================================================
// METHODS
// =============================================================================

/// Closed set of RPC methods. Unknown names fail with METHOD_NOT_FOUND at
/// dispatch, not at parse, so the request id survives for the error frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    AuthRequest,
    AuthChallenge,
    AuthVerify,
    Ping,
    Pong,
    GetConfig,
    GetAssets,
    GetLedgerBalances,
    GetLedgerTransactions,
    CreateChannel,
    ResizeChannel,
    CloseChannel,
    CreateAppSession,
    SubmitAppState,
    CloseAppSession,
    Transfer,
    Error,
    // Broker-initiated notifications
    BalanceUpdate,
    ChannelUpdate,
    Channels,
    TransferNotice,
    AppSessionUpdate,
    Assets,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::AuthRequest => "auth_request",
            Method::AuthChallenge => "auth_challenge",
            Method::AuthVerify => "auth_verify",
            Method::Ping => "ping",
            Method::Pong => "pong",
            Method::GetConfig => "get_config",
            Method::GetAssets => "get_assets",
            Method::GetLedgerBalances => "get_ledger_balances",
            Method::GetLedgerTransactions => "get_ledger_transactions",
            Method::CreateChannel => "create_channel",
            Method::ResizeChannel => "resize_channel",
            Method::CloseChannel => "close_channel",
            Method::CreateAppSession => "create_app_session",
            Method::SubmitAppState => "submit_app_state",
            Method::CloseAppSession => "close_app_session",
            Method::Transfer => "transfer",
            Method::Error => "error",
            Method::BalanceUpdate => "bu",
            Method::ChannelUpdate => "cu",
            Method::Channels => "channels",
            Method::TransferNotice => "tr",
            Method::AppSessionUpdate => "asu",
            Method::Assets => "assets",
        }
    }

    /// Whether the broker pushes this method unsolicited.
    pub fn is_notification(self) -> bool {
        matches!(
            self,
            Method::BalanceUpdate
                | Method::ChannelUpdate
                | Method::Channels
                | Method::TransferNotice
                | Method::AppSessionUpdate
                | Method::Assets
        )
    }
}

impl FromStr for Method {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let method = match s {
            "auth_request" => Method::AuthRequest,
            "auth_challenge" => Method::AuthChallenge,
            "auth_verify" => Method::AuthVerify,
            "ping" => Method::Ping,
            "pong" => Method::Pong,
            "get_config" => Method::GetConfig,
            "get_assets" => Method::GetAssets,
            "get_ledger_balances" => Method::GetLedgerBalances,
            "get_ledger_transactions" => Method::GetLedgerTransactions,
            "create_channel" => Method::CreateChannel,
            "resize_channel" => Method::ResizeChannel,
            "close_channel" => Method::CloseChannel,
            "create_app_session" => Method::CreateAppSession,
            "submit_app_state" => Method::SubmitAppState,
            "close_app_session" => Method::CloseAppSession,
            "transfer" => Method::Transfer,
            "error" => Method::Error,
            "bu" => Method::BalanceUpdate,
            "cu" => Method::ChannelUpdate,
            "channels" => Method::Channels,
            "tr" => Method::TransferNotice,
            "asu" => Method::AppSessionUpdate,
            "assets" => Method::Assets,
            other => return Err(AppError::MethodNotFound(other.to_string())),
        };
        Ok(method)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// PAYLOAD AND MESSAGE FRAMING
// =============================================================================

/// One `[request_id, method, params, timestamp]` array. The method is kept
/// as a raw string so unknown methods still parse and can be answered.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcPayload {
    pub request_id: u64,
    pub method: String,
    pub params: Value,
    pub timestamp: u64,
}

impl RpcPayload {
    pub fn new(request_id: u64, method: Method, params: Value, timestamp: u64) -> Self {
        Self {
            request_id,
            method: method.as_str().to_string(),
            params,
            timestamp,
        }
    }

    pub fn method(&self) -> Result<Method, AppError> {
        Method::from_str(&self.method)
    }

    /// Digest over the canonical array form, what request signers sign.
    pub fn digest(&self) -> alloy::primitives::B256 {
        crate::crypto::rpc_payload_digest(self.request_id, &self.method, &self.params, self.timestamp)
    }

    /// Deserialize the params into a typed struct.
    pub fn parse_params<T: serde::de::DeserializeOwned>(&self) -> Result<T, AppError> {
        serde_json::from_value(self.params.clone())
            .map_err(|e| AppError::InvalidParams(e.to_string()))
    }
}

impl Serialize for RpcPayload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(4))?;
        seq.serialize_element(&self.request_id)?;
        seq.serialize_element(&self.method)?;
        seq.serialize_element(&self.params)?;
        seq.serialize_element(&self.timestamp)?;
        seq.end()
    }
}

impl<'de> Deserialize<'de> for RpcPayload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct PayloadVisitor;

        impl<'de> Visitor<'de> for PayloadVisitor {
            type Value = RpcPayload;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a [request_id, method, params, timestamp] array")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let request_id = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                let method = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                let params = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(2, &self))?;
                let timestamp = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(3, &self))?;
                if seq.next_element::<Value>()?.is_some() {
                    return Err(de::Error::invalid_length(5, &self));
                }
                Ok(RpcPayload {
                    request_id,
                    method,
                    params,
                    timestamp,
                })
            }
        }

        deserializer.deserialize_seq(PayloadVisitor)
    }
}

/// A framed message: exactly one of `req` or `res`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcMessage {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub req: Option<RpcPayload>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub res: Option<RpcPayload>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub sig: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sid: Option<String>,
}

impl RpcMessage {
    pub fn request(payload: RpcPayload, sig: Vec<String>) -> Self {
        Self { req: Some(payload), res: None, sig, sid: None }
    }

    pub fn response(payload: RpcPayload, sig: Vec<String>) -> Self {
        Self { req: None, res: Some(payload), sig, sid: None }
    }

    pub fn with_sid(mut self, sid: String) -> Self {
        self.sid = Some(sid);
        self
    }

    /// Parse a frame off the wire, enforcing the exactly-one rule.
    pub fn parse(text: &str) -> Result<Self, AppError> {
        let message: RpcMessage =
            serde_json::from_str(text).map_err(|e| AppError::Parse(e.to_string()))?;
        match (&message.req, &message.res) {
            (Some(_), None) | (None, Some(_)) => Ok(message),
            (Some(_), Some(_)) => Err(AppError::InvalidRequest(
                "message carries both req and res".into(),
            )),
            (None, None) => Err(AppError::InvalidRequest(
                "message carries neither req nor res".into(),
            )),
        }
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("rpc message always serializes")
    }

    pub fn payload(&self) -> &RpcPayload {
        self.req.as_ref().or(self.res.as_ref()).expect("validated at parse")
    }
}

/// Build an error response frame for a failed request.
pub fn error_response(request_id: u64, error: &AppError, timestamp: u64) -> RpcPayload {
    RpcPayload::new(
        request_id,
        Method::Error,
        serde_json::json!({
            "error": error.to_string(),
            "code": error.rpc_code(),
        }),
        timestamp,
    )
}

// =============================================================================
// WIRE STRUCTS: CHANNEL TYPES
// =============================================================================
// On-chain quantities (state allocations) travel as raw integer strings;
// ledger quantities travel as asset-decimal strings.

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelWire {
    pub participants: Vec<String>,
    pub adjudicator: String,
    pub challenge_duration: u64,
    pub nonce: u64,
}

impl ChannelWire {
    pub fn to_model(&self) -> Result<Channel, AppError> {
        if self.participants.len() != 2 {
            return Err(AppError::InvalidParams(
                "channel must have exactly two participants".into(),
            ));
        }
        Ok(Channel {
            participants: [
                crate::crypto::parse_address(&self.participants[0])?,
                crate::crypto::parse_address(&self.participants[1])?,
            ],
            adjudicator: crate::crypto::parse_address(&self.adjudicator)?,
            challenge_duration: self.challenge_duration,
            nonce: self.nonce,
        })
    }

    pub fn from_model(channel: &Channel) -> Self {
        Self {
            participants: channel
                .participants
                .iter()
                .map(|p| format!("0x{:x}", p))
                .collect(),
            adjudicator: format!("0x{:x}", channel.adjudicator),
            challenge_duration: channel.challenge_duration,
            nonce: channel.nonce,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationWire {
    pub destination: String,
    pub token: String,
    pub amount: String,
}

impl AllocationWire {
    pub fn to_model(&self) -> Result<Allocation, AppError> {
        Ok(Allocation {
            destination: crate::crypto::parse_address(&self.destination)?,
            token: crate::crypto::parse_address(&self.token)?,
            amount: crate::crypto::parse_u256(&self.amount)?,
        })
    }

    pub fn from_model(allocation: &Allocation) -> Self {
        Self {
            destination: format!("0x{:x}", allocation.destination),
            token: format!("0x{:x}", allocation.token),
            amount: allocation.amount.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateWire {
    pub intent: Intent,
    pub version: u64,
    #[serde(default)]
    pub data: Bytes,
    pub allocations: Vec<AllocationWire>,
    #[serde(default)]
    pub sigs: Vec<String>,
}

impl StateWire {
    pub fn to_model(&self) -> Result<State, AppError> {
        if self.allocations.len() != 2 {
            return Err(AppError::InvalidParams(
                "channel state must carry exactly two allocations".into(),
            ));
        }
        Ok(State {
            intent: self.intent,
            version: self.version,
            data: self.data.clone(),
            allocations: [self.allocations[0].to_model()?, self.allocations[1].to_model()?],
            sigs: self.sigs.clone(),
        })
    }

    pub fn from_model(state: &State) -> Self {
        Self {
            intent: state.intent,
            version: state.version,
            data: state.data.clone(),
            allocations: state.allocations.iter().map(AllocationWire::from_model).collect(),
            sigs: state.sigs.clone(),
        }
    }
}

// =============================================================================
// WIRE STRUCTS: REQUEST PARAMS
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequestParams {
    pub address: String,
    pub session_key: String,
    pub application: String,
    #[serde(default)]
    pub allowances: Vec<Allowance>,
    pub expires_at: u64,
    pub scope: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthChallengeParams {
    pub challenge_message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthVerifyParams {
    /// Challenge path: echo of the challenge message; the EIP-712 signature
    /// over the Policy struct rides in the message's `sig` array.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub challenge: Option<String>,
    /// JWT path: a previously-issued token.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub jwt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthVerifyResult {
    pub success: bool,
    pub address: String,
    pub session_key: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub jwt_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetConfigResult {
    pub broker_address: String,
    pub chain_id: u64,
    pub custody_address: String,
    pub adjudicator_address: String,
    pub protocol: AppProtocol,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetLedgerBalancesParams {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub account: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetLedgerTransactionsParams {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub account: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub asset: Option<String>,
    /// "asc" (default) or "desc"; ordering is (created_at, id).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sort: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub offset: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateChannelParams {
    pub channel: ChannelWire,
    /// INITIALIZE state at version 0, signed by participant 0.
    pub state: StateWire,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateChannelResult {
    pub channel_id: String,
    pub channel: ChannelWire,
    /// The initial state with the broker's join signature attached.
    pub state: StateWire,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResizeChannelParams {
    pub channel_id: String,
    /// RESIZE candidate signed by the client; the broker countersigns.
    pub state: StateWire,
    /// Signed per-participant deltas, raw integer strings.
    pub resize_deltas: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseChannelParams {
    pub channel_id: String,
    /// FINALIZE candidate signed by the client; the broker countersigns.
    pub state: StateWire,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelOpResult {
    pub channel_id: String,
    pub state: StateWire,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppDefinitionWire {
    pub application: String,
    pub protocol: AppProtocol,
    pub participants: Vec<String>,
    pub weights: Vec<u64>,
    pub quorum: u64,
    pub challenge: u64,
    pub nonce: u64,
}

impl AppDefinitionWire {
    pub fn to_model(&self) -> Result<crate::model::AppDefinition, AppError> {
        Ok(crate::model::AppDefinition {
            application: self.application.clone(),
            protocol: self.protocol,
            participants: self
                .participants
                .iter()
                .map(|p| crate::crypto::parse_address(p))
                .collect::<Result<_, _>>()?,
            weights: self.weights.clone(),
            quorum: self.quorum,
            challenge: self.challenge,
            nonce: self.nonce,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppAllocationWire {
    pub participant: String,
    pub asset: String,
    pub amount: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAppSessionParams {
    pub definition: AppDefinitionWire,
    pub allocations: Vec<AppAllocationWire>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitAppStateParams {
    pub app_session_id: String,
    pub intent: AppIntent,
    pub version: u64,
    pub allocations: Vec<AppAllocationWire>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseAppSessionParams {
    pub app_session_id: String,
    pub allocations: Vec<AppAllocationWire>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferParams {
    pub destination: String,
    pub allocations: Vec<BalanceEntry>,
}

// =============================================================================
// WIRE STRUCTS: NOTIFICATIONS
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceUpdateNotice {
    pub balance_updates: Vec<BalanceEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelsNotice {
    pub channels: Vec<ChannelView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferNotice {
    pub transactions: Vec<TransactionView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetsNotice {
    pub assets: Vec<AssetView>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_round_trips() {
        let payload = RpcPayload::new(
            7,
            Method::Transfer,
            json!({"destination": "0x0000000000000000000000000000000000000001",
                   "allocations": [{"asset": "usdc", "amount": "1.5"}]}),
            1_700_000_000_000,
        );
        let message = RpcMessage::request(payload, vec!["0xabcd".into()]);
        let encoded = message.encode();
        let decoded = RpcMessage::parse(&encoded).unwrap();
        assert_eq!(message, decoded);
        assert_eq!(decoded.payload().method().unwrap(), Method::Transfer);
    }

    #[test]
    fn response_with_sid_round_trips() {
        let payload = RpcPayload::new(3, Method::SubmitAppState, json!({}), 1);
        let message =
            RpcMessage::response(payload, vec![]).with_sid("0x1234".into());
        let decoded = RpcMessage::parse(&message.encode()).unwrap();
        assert_eq!(decoded.sid.as_deref(), Some("0x1234"));
        assert!(decoded.res.is_some());
    }

    #[test]
    fn both_or_neither_rejected() {
        let payload = json!([1, "ping", {}, 2]);
        let both = json!({"req": payload, "res": payload}).to_string();
        assert!(matches!(
            RpcMessage::parse(&both),
            Err(AppError::InvalidRequest(_))
        ));
        assert!(matches!(
            RpcMessage::parse("{}"),
            Err(AppError::InvalidRequest(_))
        ));
        assert!(matches!(
            RpcMessage::parse("not json"),
            Err(AppError::Parse(_))
        ));
    }

    #[test]
    fn unknown_method_is_deferred_to_dispatch() {
        let text = json!({"req": [1, "no_such_method", {}, 2]}).to_string();
        let message = RpcMessage::parse(&text).unwrap();
        assert!(matches!(
            message.payload().method(),
            Err(AppError::MethodNotFound(_))
        ));
    }

    #[test]
    fn payload_wire_form_is_an_array() {
        let payload = RpcPayload::new(1, Method::Ping, json!({}), 2);
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value, json!([1, "ping", {}, 2]));
    }

    #[test]
    fn timestamp_window() {
        let now = 1_700_000_000_000u64;
        assert!(validate_timestamp(now, now).is_ok());
        assert!(validate_timestamp(now + MAX_FUTURE_MS + 1, now).is_err());
        assert!(validate_timestamp(now - MAX_AGE_MS - 1, now).is_err());
    }

    #[test]
    fn notification_methods_are_flagged() {
        for method in ["bu", "cu", "channels", "tr", "asu", "assets"] {
            assert!(Method::from_str(method).unwrap().is_notification());
        }
        assert!(!Method::Ping.is_notification());
    }

    #[test]
    fn state_wire_round_trips() {
        let text = json!({
            "intent": "operate",
            "version": 4,
            "data": "0x",
            "allocations": [
                {"destination": "0x1111111111111111111111111111111111111111",
                 "token": "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48",
                 "amount": "40"},
                {"destination": "0x2222222222222222222222222222222222222222",
                 "token": "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48",
                 "amount": "60"},
            ],
            "sigs": [],
        });
        let wire: StateWire = serde_json::from_value(text).unwrap();
        let state = wire.to_model().unwrap();
        assert_eq!(state.version, 4);
        assert_eq!(state.total().to_string(), "100");
        let back = StateWire::from_model(&state);
        assert_eq!(back.allocations[1].amount, "60");
    }
}
