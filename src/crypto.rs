// crypto.rs - Digests and signature handling
//
// - Parsing addresses, hashes, uints and signatures from wire strings
// - Channel ids, state hashes, challenge hashes, app-session ids
// - EIP-191 / EIP-712 digest construction
// - Recovering signer addresses and signing with the broker's wallet
//
// Verification dispatches on an explicit mode tag. A signature valid under
// one mode must never verify under another for a different message, so no
// try-each-in-order fallback exists anywhere in this module.

use alloy::primitives::{keccak256, Address, B256, I256, U256};
use alloy::signers::{local::PrivateKeySigner, Signature, Signer};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::AppError;
use crate::model::{AppDefinition, Channel, State};

// =============================================================================
// CONSTANTS
// =============================================================================

/// EIP-712 domain name for broker-issued typed data.
const DOMAIN_NAME: &str = "NitroliteBroker";

/// EIP-712 domain version.
const DOMAIN_VERSION: &str = "1";

/// Tag appended to a state hash when a challenger attests to posting it.
const CHALLENGE_TAG: &[u8] = b"challenge";

// =============================================================================
// PARSING FUNCTIONS
// =============================================================================

/// Parse an Ethereum address from a hex string (with or without 0x prefix)
pub fn parse_address(input: &str) -> Result<Address, AppError> {
    Address::from_str(input)
        .map_err(|_| AppError::InvalidParams(format!("invalid address: {}", input)))
}

/// Parse a 32-byte hash from a hex string
pub fn parse_b256(input: &str) -> Result<B256, AppError> {
    B256::from_str(input)
        .map_err(|_| AppError::InvalidParams(format!("invalid hash: {}", input)))
}

/// Parse a U256 from a decimal string
pub fn parse_u256(input: &str) -> Result<U256, AppError> {
    U256::from_str(input)
        .map_err(|_| AppError::InvalidParams(format!("invalid uint256: {}", input)))
}

/// Parse a signed 256-bit integer from a decimal string (resize deltas)
pub fn parse_i256(input: &str) -> Result<I256, AppError> {
    I256::from_str(input)
        .map_err(|_| AppError::InvalidParams(format!("invalid int256: {}", input)))
}

/// Parse a 65-byte r||s||v hex signature
pub fn parse_signature(input: &str) -> Result<Signature, AppError> {
    let bytes = parse_signature_bytes(input)?;
    Signature::try_from(bytes.as_slice())
        .map_err(|e| AppError::MalformedSignature(format!("invalid signature format: {}", e)))
}

/// Parse a hex signature string into bytes
pub fn parse_signature_bytes(signature: &str) -> Result<Vec<u8>, AppError> {
    let trimmed = signature.strip_prefix("0x").unwrap_or(signature);
    hex::decode(trimmed)
        .map_err(|e| AppError::MalformedSignature(format!("invalid signature hex: {}", e)))
}

// =============================================================================
// IDENTIFIERS AND STATE HASHES
// =============================================================================

/// channelId = keccak256(participants || nonce || adjudicator || duration).
/// Every field is padded to a 32-byte word; participant order matters.
pub fn channel_id(channel: &Channel) -> B256 {
    let mut encoded = Vec::with_capacity(5 * 32);
    for participant in &channel.participants {
        encoded.extend_from_slice(&[0u8; 12]);
        encoded.extend_from_slice(participant.as_slice());
    }
    encoded.extend_from_slice(&pad_u256(U256::from(channel.nonce)));
    encoded.extend_from_slice(&[0u8; 12]);
    encoded.extend_from_slice(channel.adjudicator.as_slice());
    encoded.extend_from_slice(&pad_u256(U256::from(channel.challenge_duration)));
    keccak256(&encoded)
}

/// stateHash = keccak256(channelId || intent || version || keccak(data) ||
/// allocations). This is the payload participants sign.
pub fn state_hash(channel_id: B256, state: &State) -> B256 {
    let mut encoded = Vec::with_capacity(10 * 32);
    encoded.extend_from_slice(channel_id.as_slice());
    encoded.extend_from_slice(&pad_u256(U256::from(state.intent.as_u8())));
    encoded.extend_from_slice(&pad_u256(U256::from(state.version)));
    encoded.extend_from_slice(keccak256(&state.data).as_slice());
    for allocation in &state.allocations {
        encoded.extend_from_slice(&[0u8; 12]);
        encoded.extend_from_slice(allocation.destination.as_slice());
        encoded.extend_from_slice(&[0u8; 12]);
        encoded.extend_from_slice(allocation.token.as_slice());
        encoded.extend_from_slice(&pad_u256(allocation.amount));
    }
    keccak256(&encoded)
}

/// Payload a challenger signs to attest "I am posting this state".
pub fn challenge_hash(channel_id: B256, state: &State) -> B256 {
    let hash = state_hash(channel_id, state);
    let mut encoded = Vec::with_capacity(32 + CHALLENGE_TAG.len());
    encoded.extend_from_slice(hash.as_slice());
    encoded.extend_from_slice(CHALLENGE_TAG);
    keccak256(&encoded)
}

/// appSessionId = keccak256(encode(definition)).
pub fn app_session_id(definition: &AppDefinition) -> B256 {
    let mut encoded = Vec::new();
    encoded.extend_from_slice(keccak256(definition.application.as_bytes()).as_slice());
    let protocol = match definition.protocol {
        crate::model::AppProtocol::V02 => 2u64,
        crate::model::AppProtocol::V04 => 4u64,
    };
    encoded.extend_from_slice(&pad_u256(U256::from(protocol)));
    for participant in &definition.participants {
        encoded.extend_from_slice(&[0u8; 12]);
        encoded.extend_from_slice(participant.as_slice());
    }
    for weight in &definition.weights {
        encoded.extend_from_slice(&pad_u256(U256::from(*weight)));
    }
    encoded.extend_from_slice(&pad_u256(U256::from(definition.quorum)));
    encoded.extend_from_slice(&pad_u256(U256::from(definition.challenge)));
    encoded.extend_from_slice(&pad_u256(U256::from(definition.nonce)));
    keccak256(&encoded)
}

/// Digest of an RPC payload `[request_id, method, params, timestamp]`.
/// Signed EIP-191 by default for externally-owned accounts.
pub fn rpc_payload_digest(
    request_id: u64,
    method: &str,
    params: &serde_json::Value,
    timestamp: u64,
) -> B256 {
    let payload = serde_json::json!([request_id, method, params, timestamp]);
    let bytes = serde_json::to_vec(&payload).expect("json array always serializes");
    keccak256(&bytes)
}

// =============================================================================
// SIGNATURE MODES
// =============================================================================

/// How a signature payload was framed before signing. Dispatch is by this
/// tag only; ERC-1271 lives in the custody module since it needs a
/// staticcall against the signer contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SigMode {
    Raw,
    Eip191,
    Eip712,
    Erc1271,
}

/// EIP-712 domain parameters for broker typed data.
#[derive(Debug, Clone)]
pub struct SigDomain {
    pub chain_id: u64,
    pub verifying_contract: Address,
}

/// keccak256("\x19Ethereum Signed Message:\n32" || digest)
pub fn eip191_digest(digest: B256) -> B256 {
    let mut encoded = Vec::with_capacity(28 + 32);
    encoded.extend_from_slice(b"\x19Ethereum Signed Message:\n32");
    encoded.extend_from_slice(digest.as_slice());
    keccak256(&encoded)
}

/// Final digest: 0x19 0x01 || domainSeparator || structHash
pub fn eip712_digest(domain: &SigDomain, struct_hash: B256) -> B256 {
    let separator = domain_separator(domain.chain_id, domain.verifying_contract);
    let mut encoded = Vec::with_capacity(2 + 32 + 32);
    encoded.extend_from_slice(&[0x19, 0x01]);
    encoded.extend_from_slice(separator.as_slice());
    encoded.extend_from_slice(struct_hash.as_slice());
    keccak256(&encoded)
}

/// EIP-712 domain separator, binding signatures to this broker deployment.
fn domain_separator(chain_id: u64, verifying_contract: Address) -> B256 {
    let domain_type_hash = keccak256(
        b"EIP712Domain(string name,string version,uint256 chainId,address verifyingContract)",
    );
    let name_hash = keccak256(DOMAIN_NAME.as_bytes());
    let version_hash = keccak256(DOMAIN_VERSION.as_bytes());

    let mut encoded = Vec::with_capacity(5 * 32);
    encoded.extend_from_slice(domain_type_hash.as_slice());
    encoded.extend_from_slice(name_hash.as_slice());
    encoded.extend_from_slice(version_hash.as_slice());
    encoded.extend_from_slice(&pad_u256(U256::from(chain_id)));
    encoded.extend_from_slice(&[0u8; 12]);
    encoded.extend_from_slice(verifying_contract.as_slice());
    keccak256(&encoded)
}

// =============================================================================
// RECOVERY AND VERIFICATION
// =============================================================================

/// Recover the signer address from a signature over a prehashed digest.
pub fn recover(digest: B256, signature: &str) -> Result<Address, AppError> {
    let sig = parse_signature(signature)?;
    sig.recover_address_from_prehash(&digest)
        .map_err(|e| AppError::MalformedSignature(format!("signature recovery failed: {}", e)))
}

/// Verify an ECDSA-family signature for the given mode.
///
/// `payload` is the raw digest for Raw and Eip191 modes, and the struct
/// hash for Eip712 (wrapped with the broker domain here). Contract
/// signatures (Erc1271) cannot be verified off-chain and are rejected.
pub fn verify_ecdsa(
    mode: SigMode,
    payload: B256,
    signature: &str,
    expected: Address,
    domain: Option<&SigDomain>,
) -> Result<bool, AppError> {
    let digest = match mode {
        SigMode::Raw => payload,
        SigMode::Eip191 => eip191_digest(payload),
        SigMode::Eip712 => {
            let domain = domain.ok_or_else(|| {
                AppError::InvalidParams("eip712 signature without a domain".into())
            })?;
            eip712_digest(domain, payload)
        }
        SigMode::Erc1271 => {
            return Err(AppError::InvalidParams(
                "erc1271 signatures are verified against the signer contract".into(),
            ))
        }
    };
    Ok(recover(digest, signature)? == expected)
}

// =============================================================================
// AUTH POLICY DIGEST
// =============================================================================

/// An allowance granted to a session key: (asset symbol, amount string).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allowance {
    pub asset: String,
    pub amount: String,
}

/// Struct hash for the auth-verify typed data:
/// Policy(challenge, scope, wallet, session_key, expires_at, allowances[]).
pub fn policy_struct_hash(
    challenge: &str,
    scope: &str,
    wallet: Address,
    session_key: Address,
    expires_at: u64,
    allowances: &[Allowance],
) -> B256 {
    let type_hash = keccak256(
        b"Policy(string challenge,string scope,address wallet,address sessionKey,uint256 expiresAt,Allowance[] allowances)Allowance(string asset,string amount)",
    );
    let allowance_type_hash = keccak256(b"Allowance(string asset,string amount)");

    let mut allowance_hashes = Vec::with_capacity(allowances.len() * 32);
    for allowance in allowances {
        let mut encoded = Vec::with_capacity(3 * 32);
        encoded.extend_from_slice(allowance_type_hash.as_slice());
        encoded.extend_from_slice(keccak256(allowance.asset.as_bytes()).as_slice());
        encoded.extend_from_slice(keccak256(allowance.amount.as_bytes()).as_slice());
        allowance_hashes.extend_from_slice(keccak256(&encoded).as_slice());
    }

    let mut encoded = Vec::with_capacity(7 * 32);
    encoded.extend_from_slice(type_hash.as_slice());
    encoded.extend_from_slice(keccak256(challenge.as_bytes()).as_slice());
    encoded.extend_from_slice(keccak256(scope.as_bytes()).as_slice());
    encoded.extend_from_slice(&[0u8; 12]);
    encoded.extend_from_slice(wallet.as_slice());
    encoded.extend_from_slice(&[0u8; 12]);
    encoded.extend_from_slice(session_key.as_slice());
    encoded.extend_from_slice(&pad_u256(U256::from(expires_at)));
    encoded.extend_from_slice(keccak256(&allowance_hashes).as_slice());
    keccak256(&encoded)
}

// =============================================================================
// SIGNING
// =============================================================================

/// Sign a prehashed digest with the broker's wallet, hex-encoded output.
pub async fn sign_digest(wallet: &PrivateKeySigner, digest: B256) -> Result<String, AppError> {
    let signature = wallet
        .sign_hash(&digest)
        .await
        .map_err(|e| AppError::Internal(format!("broker signing failed: {}", e)))?;
    Ok(format!("0x{}", hex::encode(signature.as_bytes())))
}

/// Sign with EIP-191 framing (the default for request payloads).
pub async fn sign_eip191(wallet: &PrivateKeySigner, digest: B256) -> Result<String, AppError> {
    sign_digest(wallet, eip191_digest(digest)).await
}

/// Pad a U256 to 32 bytes (big-endian)
pub fn pad_u256(value: U256) -> [u8; 32] {
    value.to_be_bytes::<32>()
}
