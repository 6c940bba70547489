// auth.rs - Authentication handshake and session keys
//
// Flow: auth_request -> auth_challenge (uuid nonce) -> auth_verify, either
// with an EIP-712 signature over the Policy struct or with a previously
// issued JWT. Success registers the session key, which may then sign
// requests on behalf of the wallet until expiry.

use alloy::primitives::Address;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::{self, Allowance, SigDomain, SigMode};
use crate::error::AppError;
use crate::rpc::{AuthRequestParams, RpcPayload};

// =============================================================================
// HANDSHAKE STATE
// =============================================================================

/// A challenge issued to a connection, awaiting auth_verify.
#[derive(Debug, Clone)]
pub struct PendingChallenge {
    pub challenge: String,
    pub wallet: Address,
    pub session_key: Address,
    pub application: String,
    pub allowances: Vec<Allowance>,
    pub expires_at: u64,
    pub scope: String,
    /// Unix seconds when the challenge was issued.
    pub issued_at: u64,
}

/// An authenticated session: the wallet and the key allowed to act for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionAuth {
    pub wallet: Address,
    pub session_key: Address,
    pub application: String,
    pub scope: String,
    pub expires_at: u64,
}

impl SessionAuth {
    pub fn expired(&self, now: u64) -> bool {
        self.expires_at <= now
    }
}

/// Validate an auth_request and mint the challenge nonce.
pub fn issue_challenge(params: &AuthRequestParams, now: u64) -> Result<PendingChallenge, AppError> {
    let wallet = crypto::parse_address(&params.address)?;
    let session_key = crypto::parse_address(&params.session_key)?;
    if params.expires_at <= now {
        return Err(AppError::AuthFailed("session expiry is in the past".into()));
    }
    Ok(PendingChallenge {
        challenge: Uuid::new_v4().to_string(),
        wallet,
        session_key,
        application: params.application.clone(),
        allowances: params.allowances.clone(),
        expires_at: params.expires_at,
        scope: params.scope.clone(),
        issued_at: now,
    })
}

/// Verify the EIP-712 Policy signature for a pending challenge. The payload
/// is the typed struct Policy(challenge, scope, wallet, session_key,
/// expires_at, allowances[]), signed by the wallet itself.
pub fn verify_challenge(
    pending: &PendingChallenge,
    signature: &str,
    domain: &SigDomain,
    now: u64,
    auth_timeout: u64,
) -> Result<SessionAuth, AppError> {
    if now > pending.issued_at + auth_timeout {
        return Err(AppError::AuthFailed("authentication handshake timed out".into()));
    }
    let struct_hash = crypto::policy_struct_hash(
        &pending.challenge,
        &pending.scope,
        pending.wallet,
        pending.session_key,
        pending.expires_at,
        &pending.allowances,
    );
    let valid = crypto::verify_ecdsa(
        SigMode::Eip712,
        struct_hash,
        signature,
        pending.wallet,
        Some(domain),
    )?;
    if !valid {
        return Err(AppError::AuthFailed("policy signature does not match wallet".into()));
    }
    Ok(SessionAuth {
        wallet: pending.wallet,
        session_key: pending.session_key,
        application: pending.application.clone(),
        scope: pending.scope.clone(),
        expires_at: pending.expires_at,
    })
}

// =============================================================================
// JWT PATH
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct JwtClaims {
    /// Wallet address
    sub: String,
    /// Session key address
    key: String,
    scope: String,
    app: String,
    /// Unix seconds
    exp: u64,
}

/// Mint a JWT for an authenticated session.
pub fn issue_jwt(secret: &str, auth: &SessionAuth) -> Result<String, AppError> {
    let claims = JwtClaims {
        sub: format!("0x{:x}", auth.wallet),
        key: format!("0x{:x}", auth.session_key),
        scope: auth.scope.clone(),
        app: auth.application.clone(),
        exp: auth.expires_at,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AppError::Internal(format!("jwt encoding failed: {}", e)))
}

/// Verify a JWT and reconstruct the session it grants.
pub fn verify_jwt(secret: &str, token: &str) -> Result<SessionAuth, AppError> {
    let data = decode::<JwtClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| AppError::AuthFailed(format!("jwt rejected: {}", e)))?;
    Ok(SessionAuth {
        wallet: crypto::parse_address(&data.claims.sub)?,
        session_key: crypto::parse_address(&data.claims.key)?,
        application: data.claims.app,
        scope: data.claims.scope,
        expires_at: data.claims.exp,
    })
}

// =============================================================================
// REQUEST SIGNATURES
// =============================================================================

/// Recover the addresses behind a request's `sig` array. Entries are
/// EIP-191 signatures over the payload digest; empty entries are skipped.
pub fn recover_request_signers(
    payload: &RpcPayload,
    sigs: &[String],
) -> Result<Vec<Address>, AppError> {
    let digest = crypto::eip191_digest(payload.digest());
    let mut signers = Vec::with_capacity(sigs.len());
    for sig in sigs {
        if sig.is_empty() {
            continue;
        }
        signers.push(crypto::recover(digest, sig)?);
    }
    Ok(signers)
}

/// Check that the request is signed by the session key or the wallet.
pub fn authorize_request(
    payload: &RpcPayload,
    sigs: &[String],
    auth: &SessionAuth,
) -> Result<(), AppError> {
    let signers = recover_request_signers(payload, sigs)?;
    if signers
        .iter()
        .any(|s| *s == auth.session_key || *s == auth.wallet)
    {
        Ok(())
    } else {
        Err(AppError::InvalidSignature {
            expected: format!("0x{:x}", auth.session_key),
            actual: signers
                .first()
                .map(|s| format!("0x{:x}", s))
                .unwrap_or_else(|| "none".into()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::Method;
    use alloy::primitives::address;
    use alloy::signers::local::PrivateKeySigner;
    use serde_json::json;

    fn domain() -> SigDomain {
        SigDomain {
            chain_id: 31337,
            verifying_contract: address!("5FbDB2315678afecb367f032d93F642f64180aa3"),
        }
    }

    fn request_params(wallet: &PrivateKeySigner, session_key: Address) -> AuthRequestParams {
        AuthRequestParams {
            address: format!("0x{:x}", wallet.address()),
            session_key: format!("0x{:x}", session_key),
            application: "swap-desk".into(),
            allowances: vec![Allowance { asset: "usdc".into(), amount: "100".into() }],
            expires_at: 4_000_000_000,
            scope: "app.create".into(),
        }
    }

    #[tokio::test]
    async fn challenge_path_round_trip() {
        let wallet = PrivateKeySigner::random();
        let session_key = PrivateKeySigner::random().address();
        let pending = issue_challenge(&request_params(&wallet, session_key), 1_000).unwrap();

        let struct_hash = crypto::policy_struct_hash(
            &pending.challenge,
            &pending.scope,
            pending.wallet,
            pending.session_key,
            pending.expires_at,
            &pending.allowances,
        );
        let sig = crypto::sign_digest(&wallet, crypto::eip712_digest(&domain(), struct_hash))
            .await
            .unwrap();

        let auth = verify_challenge(&pending, &sig, &domain(), 1_010, 60).unwrap();
        assert_eq!(auth.wallet, wallet.address());
        assert_eq!(auth.session_key, session_key);
    }

    #[tokio::test]
    async fn challenge_rejects_wrong_wallet_and_timeout() {
        let wallet = PrivateKeySigner::random();
        let imposter = PrivateKeySigner::random();
        let session_key = PrivateKeySigner::random().address();
        let pending = issue_challenge(&request_params(&wallet, session_key), 1_000).unwrap();

        let struct_hash = crypto::policy_struct_hash(
            &pending.challenge,
            &pending.scope,
            pending.wallet,
            pending.session_key,
            pending.expires_at,
            &pending.allowances,
        );
        let forged = crypto::sign_digest(&imposter, crypto::eip712_digest(&domain(), struct_hash))
            .await
            .unwrap();
        assert!(matches!(
            verify_challenge(&pending, &forged, &domain(), 1_010, 60),
            Err(AppError::AuthFailed(_))
        ));

        let honest = crypto::sign_digest(&wallet, crypto::eip712_digest(&domain(), struct_hash))
            .await
            .unwrap();
        // 61 seconds after issuance: past the 60s ceiling.
        assert!(matches!(
            verify_challenge(&pending, &honest, &domain(), 1_061, 60),
            Err(AppError::AuthFailed(_))
        ));
    }

    #[test]
    fn expired_request_rejected_up_front() {
        let wallet = PrivateKeySigner::random();
        let mut params = request_params(&wallet, PrivateKeySigner::random().address());
        params.expires_at = 500;
        assert!(matches!(
            issue_challenge(&params, 1_000),
            Err(AppError::AuthFailed(_))
        ));
    }

    #[test]
    fn jwt_round_trip_and_tamper() {
        let auth = SessionAuth {
            wallet: address!("1111111111111111111111111111111111111111"),
            session_key: address!("2222222222222222222222222222222222222222"),
            application: "swap-desk".into(),
            scope: "app.create".into(),
            expires_at: 4_000_000_000,
        };
        let token = issue_jwt("secret", &auth).unwrap();
        let restored = verify_jwt("secret", &token).unwrap();
        assert_eq!(restored, auth);

        assert!(matches!(
            verify_jwt("other-secret", &token),
            Err(AppError::AuthFailed(_))
        ));
    }

    #[tokio::test]
    async fn request_signature_authorizes_session_key() {
        let wallet = PrivateKeySigner::random();
        let session = PrivateKeySigner::random();
        let auth = SessionAuth {
            wallet: wallet.address(),
            session_key: session.address(),
            application: "swap-desk".into(),
            scope: "app.create".into(),
            expires_at: 4_000_000_000,
        };

        let payload = RpcPayload::new(9, Method::Transfer, json!({"x": 1}), 5_000);
        let sig = crypto::sign_eip191(&session, payload.digest()).await.unwrap();
        assert!(authorize_request(&payload, &[sig], &auth).is_ok());

        let outsider = PrivateKeySigner::random();
        let bad = crypto::sign_eip191(&outsider, payload.digest()).await.unwrap();
        assert!(authorize_request(&payload, &[bad], &auth).is_err());
    }
}
