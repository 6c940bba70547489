// error.rs - Custom error types for the broker

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    // =========================================================================
    // Protocol Errors - client fault, connection stays open
    // =========================================================================
    /// Message body was not valid JSON
    #[error("Parse error: {0}")]
    Parse(String),

    /// Message was structurally invalid (missing req/res, bad framing)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Unknown RPC method
    #[error("Method not found: {0}")]
    MethodNotFound(String),

    /// Params did not match the method's expected shape
    #[error("Invalid params: {0}")]
    InvalidParams(String),

    /// Authentication handshake failed
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// The signature doesn't match the expected signer
    #[error("Invalid signature: expected {expected}, got {actual}")]
    InvalidSignature { expected: String, actual: String },

    /// The signature bytes couldn't be parsed
    #[error("Malformed signature: {0}")]
    MalformedSignature(String),

    /// Request timestamp outside the accepted window
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    /// Request id did not advance the per-connection counter
    #[error("Invalid request id: expected > {expected}, got {actual}")]
    InvalidRequestId { expected: u64, actual: u64 },

    // =========================================================================
    // Semantic Errors - operation rejected, no side effect
    // =========================================================================
    /// Signed weight below the session quorum
    #[error("Insufficient signatures: weight {weight} below quorum {quorum}")]
    InsufficientSignatures { weight: u64, quorum: u64 },

    /// Account balance too low for the requested debit
    #[error("Insufficient funds: {account} has {available} {asset}, needs {needed}")]
    InsufficientFunds {
        account: String,
        asset: String,
        available: String,
        needed: String,
    },

    /// No ledger entry for the account
    #[error("Account not found: {0}")]
    AccountNotFound(String),

    /// App session doesn't exist
    #[error("Application session not found: {0}")]
    ApplicationNotFound(String),

    /// Channel doesn't exist in our records
    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    /// Candidate state intent is not admissible for the operation
    #[error("Invalid intent: {0}")]
    InvalidIntent(String),

    /// Candidate version does not follow the previous state
    #[error("Invalid version: expected {expected}, got {actual}")]
    InvalidVersion { expected: u64, actual: u64 },

    /// The two channel allocations carry different tokens
    #[error("Token mismatch in allocations")]
    TokenMismatch,

    /// Allocation sums violate conservation
    #[error("Allocation mismatch: {0}")]
    AllocationMismatch(String),

    /// Challenge duration below the protocol minimum
    #[error("Challenge period too short: {actual}s < {min}s")]
    ChallengePeriodTooShort { actual: u64, min: u64 },

    /// Operation attempted after the challenge window elapsed
    #[error("Challenge expired")]
    ChallengeExpired,

    /// Challenge rejected (wrong state, wrong signer, window still open)
    #[error("Invalid challenge: {0}")]
    InvalidChallenge(String),

    /// App session already closed
    #[error("Application session is closed: {0}")]
    SessionClosed(String),

    // =========================================================================
    // Transient / Fatal Errors
    // =========================================================================
    /// Database operation failed
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// On-chain call failed; carries tx context when available
    #[error("Contract call failed: {0}")]
    ContractCall(String),

    /// Catch-all for unexpected errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// JSON-RPC error code for the wire (reserved set).
    pub fn rpc_code(&self) -> i32 {
        match self {
            AppError::Parse(_) => -32700,
            AppError::InvalidRequest(_) => -32600,
            AppError::MethodNotFound(_) => -32601,
            AppError::InvalidParams(_)
            | AppError::InvalidVersion { .. }
            | AppError::TokenMismatch
            | AppError::AllocationMismatch(_)
            | AppError::ChallengePeriodTooShort { .. } => -32602,
            AppError::AuthFailed(_) => -32000,
            AppError::InvalidSignature { .. } | AppError::MalformedSignature(_) => -32003,
            AppError::InvalidTimestamp(_) => -32004,
            AppError::InvalidRequestId { .. } => -32005,
            AppError::InsufficientSignatures { .. } => -32006,
            AppError::InsufficientFunds { .. } => -32007,
            AppError::AccountNotFound(_) => -32008,
            AppError::ApplicationNotFound(_)
            | AppError::ChannelNotFound(_)
            | AppError::SessionClosed(_) => -32009,
            AppError::InvalidIntent(_) => -32010,
            AppError::ChallengeExpired => -32011,
            AppError::InvalidChallenge(_) => -32012,
            AppError::Database(_) | AppError::ContractCall(_) | AppError::Internal(_) => -32603,
        }
    }
}

// HTTP mapping for the non-WebSocket surface (health, upgrade rejections).

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::ChannelNotFound(_)
            | AppError::AccountNotFound(_)
            | AppError::ApplicationNotFound(_) => StatusCode::NOT_FOUND,

            AppError::AuthFailed(_) => StatusCode::UNAUTHORIZED,

            AppError::Database(_) | AppError::ContractCall(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }

            _ => StatusCode::BAD_REQUEST,
        };

        let body = Json(json!({
            "error": self.to_string(),
            "code": self.rpc_code(),
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_codes_match_the_table() {
        assert_eq!(AppError::Parse("x".into()).rpc_code(), -32700);
        assert_eq!(AppError::MethodNotFound("x".into()).rpc_code(), -32601);
        assert_eq!(AppError::AuthFailed("x".into()).rpc_code(), -32000);
        assert_eq!(
            AppError::InsufficientSignatures { weight: 1, quorum: 2 }.rpc_code(),
            -32006
        );
        assert_eq!(
            AppError::InsufficientFunds {
                account: "a".into(),
                asset: "usdc".into(),
                available: "0".into(),
                needed: "1".into(),
            }
            .rpc_code(),
            -32007
        );
        assert_eq!(AppError::ChallengeExpired.rpc_code(), -32011);
        assert_eq!(AppError::InvalidChallenge("x".into()).rpc_code(), -32012);
    }
}
