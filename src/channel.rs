// channel.rs - Channel engine
//
// The admission rules for create/join/close/challenge/checkpoint/resize as
// pure functions over (record, candidate). Nothing here touches the ledger,
// the database, or the chain; callers apply the returned record.

use std::cmp::Ordering;

use alloy::primitives::{Address, B256, I256, U256};

use crate::config::MIN_CHALLENGE_PERIOD;
use crate::crypto::{self, SigDomain};
use crate::error::AppError;
use crate::model::{Channel, ChannelRecord, ChannelStatus, Intent, State};

// =============================================================================
// ADJUDICATOR
// =============================================================================

/// Decides whether a candidate state is a valid successor. The engine never
/// inspects adjudicator-specific `data`; it delegates.
pub trait Adjudicator {
    fn adjudicate(&self, channel: &Channel, candidate: &State, proofs: &[State]) -> bool;

    /// Optional comparison of two states. `None` means not implemented; the
    /// engine falls back to strict version comparison.
    fn compare(&self, _candidate: &State, _previous: &State) -> Option<Ordering> {
        None
    }
}

/// Default adjudicator: a state is valid when every participant signed it.
/// No `compare`, so recency falls back to versions.
pub struct UnanimousAdjudicator;

impl Adjudicator for UnanimousAdjudicator {
    fn adjudicate(&self, channel: &Channel, candidate: &State, _proofs: &[State]) -> bool {
        require_unanimous(channel, candidate).is_ok()
    }
}

/// Candidate is "more recent" iff the adjudicator's compare is strictly
/// positive; fallback is strictly greater version.
fn is_newer(adj: &dyn Adjudicator, candidate: &State, previous: &State) -> bool {
    match adj.compare(candidate, previous) {
        Some(ordering) => ordering == Ordering::Greater,
        None => candidate.version > previous.version,
    }
}

fn same_state(channel_id: B256, a: &State, b: &State) -> bool {
    crypto::state_hash(channel_id, a) == crypto::state_hash(channel_id, b)
}

// =============================================================================
// SIGNATURE POLICY
// =============================================================================

/// A challenger's attestation over the challenge hash, tagged by signature
/// mode. Contract accounts arrive pre-verified by the custody layer
/// (ERC-1271 needs a staticcall); `OnChain` marks an attestation the
/// custody contract itself already enforced, as seen in a Challenged event.
pub enum ChallengerSig<'a> {
    Raw { sig: &'a str },
    Eip191 { sig: &'a str },
    Eip712 { sig: &'a str, domain: SigDomain },
    Contract { signer: Address },
    OnChain,
}

/// Every participant index `i` must have a valid signature at position `i`.
pub fn require_unanimous(channel: &Channel, state: &State) -> Result<(), AppError> {
    let channel_id = channel.id();
    for (i, participant) in channel.participants.iter().enumerate() {
        let sig = state.sig(i).ok_or(AppError::InsufficientSignatures {
            weight: i as u64,
            quorum: channel.participants.len() as u64,
        })?;
        let recovered = crypto::recover(crypto::state_hash(channel_id, state), sig)?;
        if recovered != *participant {
            return Err(AppError::InvalidSignature {
                expected: format!("0x{:x}", participant),
                actual: format!("0x{:x}", recovered),
            });
        }
    }
    Ok(())
}

fn require_participant_sig(
    channel: &Channel,
    state: &State,
    index: usize,
) -> Result<(), AppError> {
    let expected = channel.participants[index];
    let sig = state.sig(index).ok_or(AppError::InsufficientSignatures {
        weight: 0,
        quorum: 1,
    })?;
    let recovered = crypto::recover(crypto::state_hash(channel.id(), state), sig)?;
    if recovered != expected {
        return Err(AppError::InvalidSignature {
            expected: format!("0x{:x}", expected),
            actual: format!("0x{:x}", recovered),
        });
    }
    Ok(())
}

fn verify_challenger(
    record: &ChannelRecord,
    candidate: &State,
    sig: &ChallengerSig,
) -> Result<(), AppError> {
    let payload = crypto::challenge_hash(record.channel_id(), candidate);
    let challenger = match sig {
        // The custody contract verified the attestation before emitting
        // the event; nothing left to check here.
        ChallengerSig::OnChain => return Ok(()),
        ChallengerSig::Contract { signer } => *signer,
        ChallengerSig::Raw { sig } => crypto::recover(payload, sig)?,
        ChallengerSig::Eip191 { sig } => crypto::recover(crypto::eip191_digest(payload), sig)?,
        ChallengerSig::Eip712 { sig, domain } => {
            crypto::recover(crypto::eip712_digest(domain, payload), sig)?
        }
    };
    if record.participant_index(challenger).is_none() {
        return Err(AppError::InvalidChallenge(format!(
            "challenger 0x{:x} is not a participant",
            challenger
        )));
    }
    Ok(())
}

// =============================================================================
// STATE CHECKS
// =============================================================================

/// allocations[0].token == allocations[1].token, in every state.
fn require_token_uniformity(state: &State) -> Result<(), AppError> {
    if state.allocations[0].token != state.allocations[1].token {
        return Err(AppError::TokenMismatch);
    }
    Ok(())
}

fn require_next_version(previous: &State, candidate: &State) -> Result<(), AppError> {
    if candidate.version != previous.version + 1 {
        return Err(AppError::InvalidVersion {
            expected: previous.version + 1,
            actual: candidate.version,
        });
    }
    Ok(())
}

/// OPERATE/FINALIZE successors conserve the allocation sum.
fn require_conserved(previous: &State, candidate: &State) -> Result<(), AppError> {
    if previous.total() != candidate.total() {
        return Err(AppError::AllocationMismatch(format!(
            "sum changed {} -> {} without a resize",
            previous.total(),
            candidate.total()
        )));
    }
    Ok(())
}

// =============================================================================
// ADMISSION: CREATE / JOIN
// =============================================================================

/// Admit a channel creation: the client proposes an initial state signed by
/// participant 0. Funds for participant 0 are escrowed by the caller.
pub fn validate_create(
    channel: &Channel,
    initial: &State,
    wallet: Address,
) -> Result<ChannelRecord, AppError> {
    if channel.challenge_duration < MIN_CHALLENGE_PERIOD {
        return Err(AppError::ChallengePeriodTooShort {
            actual: channel.challenge_duration,
            min: MIN_CHALLENGE_PERIOD,
        });
    }
    if channel.participants[0] == channel.participants[1] {
        return Err(AppError::InvalidParams("participants must be distinct".into()));
    }
    if initial.intent != Intent::Initialize {
        return Err(AppError::InvalidIntent(
            "channel creation requires an INITIALIZE state".into(),
        ));
    }
    if initial.version != 0 {
        return Err(AppError::InvalidVersion {
            expected: 0,
            actual: initial.version,
        });
    }
    require_token_uniformity(initial)?;
    require_participant_sig(channel, initial, 0)?;

    let expected = [initial.allocations[0].amount, initial.allocations[1].amount];
    Ok(ChannelRecord {
        channel: channel.clone(),
        status: ChannelStatus::Initial,
        wallets: [wallet, Address::ZERO],
        expected_deposits: expected,
        actual_deposits: [expected[0], U256::ZERO],
        challenge_expiry: 0,
        last_state: initial.clone(),
    })
}

/// Admit a join: participant `index` countersigns the initial state, the
/// channel becomes ACTIVE.
pub fn validate_join(
    record: &ChannelRecord,
    index: usize,
    sig: &str,
    wallet: Address,
) -> Result<ChannelRecord, AppError> {
    if record.status != ChannelStatus::Initial {
        return Err(AppError::InvalidIntent(format!(
            "join requires INITIAL status, channel is {:?}",
            record.status
        )));
    }
    if index != 1 {
        return Err(AppError::InvalidParams(format!(
            "only participant 1 may join, got index {}",
            index
        )));
    }
    let expected = record.channel.participants[index];
    let recovered = crypto::recover(
        crypto::state_hash(record.channel_id(), &record.last_state),
        sig,
    )?;
    if recovered != expected {
        return Err(AppError::InvalidSignature {
            expected: format!("0x{:x}", expected),
            actual: format!("0x{:x}", recovered),
        });
    }

    let mut next = record.clone();
    next.status = ChannelStatus::Active;
    next.wallets[index] = wallet;
    next.actual_deposits[index] = next.expected_deposits[index];
    while next.last_state.sigs.len() <= index {
        next.last_state.sigs.push(String::new());
    }
    next.last_state.sigs[index] = sig.to_string();
    Ok(next)
}

// =============================================================================
// ADMISSION: CLOSE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// All participants signed a FINALIZE state.
    Cooperative,
    /// The challenge window elapsed; funds follow the last posted state.
    Forced,
}

/// Admit a close. Returns the state whose allocations settle the channel.
pub fn validate_close(
    record: &ChannelRecord,
    candidate: Option<&State>,
    now: u64,
) -> Result<(State, CloseOutcome), AppError> {
    match record.status {
        ChannelStatus::Active => {
            let candidate = candidate.ok_or_else(|| {
                AppError::InvalidIntent("cooperative close requires a FINALIZE state".into())
            })?;
            if candidate.intent != Intent::Finalize {
                return Err(AppError::InvalidIntent(format!(
                    "close candidate must be FINALIZE, got {:?}",
                    candidate.intent
                )));
            }
            require_next_version(&record.last_state, candidate)?;
            require_token_uniformity(candidate)?;
            require_conserved(&record.last_state, candidate)?;
            require_unanimous(&record.channel, candidate)?;
            Ok((candidate.clone(), CloseOutcome::Cooperative))
        }
        ChannelStatus::Dispute => {
            if now >= record.challenge_expiry {
                // Post-expiry: distribute per the last posted state.
                return Ok((record.last_state.clone(), CloseOutcome::Forced));
            }
            // Pre-expiry close is still possible cooperatively.
            let candidate = candidate.ok_or_else(|| {
                AppError::InvalidIntent(
                    "close during an open challenge window requires a FINALIZE state".into(),
                )
            })?;
            if candidate.intent != Intent::Finalize {
                return Err(AppError::InvalidIntent(
                    "pre-expiry close requires a FINALIZE state".into(),
                ));
            }
            require_token_uniformity(candidate)?;
            require_conserved(&record.last_state, candidate)?;
            require_unanimous(&record.channel, candidate)?;
            Ok((candidate.clone(), CloseOutcome::Cooperative))
        }
        status => Err(AppError::InvalidIntent(format!(
            "close is not admissible from {:?}",
            status
        ))),
    }
}

// =============================================================================
// ADMISSION: CHALLENGE
// =============================================================================

#[derive(Debug, Clone)]
pub enum ChallengeOutcome {
    /// Challenge at INITIAL with the initial state: no counterparty exists,
    /// the channel closes immediately.
    ImmediateClose(State),
    /// A dispute window opens until `expiry`.
    Dispute { state: State, expiry: u64 },
}

pub fn validate_challenge(
    record: &ChannelRecord,
    candidate: &State,
    challenger: &ChallengerSig,
    adj: &dyn Adjudicator,
    now: u64,
) -> Result<ChallengeOutcome, AppError> {
    verify_challenger(record, candidate, challenger)?;
    require_token_uniformity(candidate)?;

    let channel_id = record.channel_id();
    let last = &record.last_state;
    let equal = same_state(channel_id, candidate, last);
    let newer_ok =
        |intent: Intent| -> bool {
            candidate.intent == intent
                && is_newer(adj, candidate, last)
                && adj.adjudicate(&record.channel, candidate, std::slice::from_ref(last))
        };

    match (record.status, last.intent) {
        (ChannelStatus::Initial, Intent::Initialize) => {
            if !equal {
                return Err(AppError::InvalidChallenge(
                    "challenge at INITIAL must post the initial state".into(),
                ));
            }
            Ok(ChallengeOutcome::ImmediateClose(last.clone()))
        }
        (ChannelStatus::Active, Intent::Initialize) => {
            if equal || newer_ok(Intent::Operate) {
                Ok(ChallengeOutcome::Dispute {
                    state: candidate.clone(),
                    expiry: now + record.channel.challenge_duration,
                })
            } else {
                Err(AppError::InvalidChallenge(
                    "candidate must equal the joined state or be a newer OPERATE".into(),
                ))
            }
        }
        (ChannelStatus::Active, Intent::Operate) => {
            if candidate.intent != Intent::Operate {
                return Err(AppError::InvalidIntent(format!(
                    "challenge over OPERATE requires an OPERATE candidate, got {:?}",
                    candidate.intent
                )));
            }
            if equal || newer_ok(Intent::Operate) {
                Ok(ChallengeOutcome::Dispute {
                    state: candidate.clone(),
                    expiry: now + record.channel.challenge_duration,
                })
            } else {
                Err(AppError::InvalidChallenge(
                    "candidate is neither the last state nor an adjudicated successor".into(),
                ))
            }
        }
        (ChannelStatus::Active, Intent::Resize) => {
            if newer_ok(Intent::Operate) {
                return Ok(ChallengeOutcome::Dispute {
                    state: candidate.clone(),
                    expiry: now + record.channel.challenge_duration,
                });
            }
            if candidate.intent == Intent::Resize && equal {
                return Ok(ChallengeOutcome::Dispute {
                    state: candidate.clone(),
                    expiry: now + record.channel.challenge_duration,
                });
            }
            Err(AppError::InvalidChallenge(
                "after RESIZE only a newer OPERATE or the identical RESIZE may be posted".into(),
            ))
        }
        (ChannelStatus::Dispute, _) => Err(AppError::InvalidChallenge(
            "a challenge window is already open".into(),
        )),
        (status, intent) => Err(AppError::InvalidChallenge(format!(
            "challenge not admissible from ({:?}, {:?})",
            status, intent
        ))),
    }
}

// =============================================================================
// ADMISSION: CHECKPOINT
// =============================================================================

/// Pin a newer state on-chain without finalizing. From DISPUTE this clears
/// the challenge window.
pub fn validate_checkpoint(
    record: &ChannelRecord,
    candidate: &State,
    adj: &dyn Adjudicator,
) -> Result<State, AppError> {
    if candidate.intent != Intent::Operate {
        return Err(AppError::InvalidIntent(format!(
            "checkpoint candidate must be OPERATE, got {:?}",
            candidate.intent
        )));
    }
    require_token_uniformity(candidate)?;
    require_conserved(&record.last_state, candidate)?;

    let last = &record.last_state;
    let admissible = match (record.status, last.intent) {
        (ChannelStatus::Active, Intent::Operate) => true,
        (ChannelStatus::Dispute, Intent::Initialize | Intent::Operate) => true,
        _ => false,
    };
    if !admissible {
        return Err(AppError::InvalidIntent(format!(
            "checkpoint not admissible from ({:?}, {:?})",
            record.status, last.intent
        )));
    }
    if !is_newer(adj, candidate, last) {
        return Err(AppError::InvalidVersion {
            expected: last.version + 1,
            actual: candidate.version,
        });
    }
    if !adj.adjudicate(&record.channel, candidate, std::slice::from_ref(last)) {
        return Err(AppError::InvalidChallenge(
            "adjudicator rejected the checkpoint candidate".into(),
        ));
    }
    Ok(candidate.clone())
}

// =============================================================================
// ADMISSION: RESIZE
// =============================================================================

/// Admit a resize: unanimous signatures, version = prev + 1, and the sum
/// must move by exactly the signed delta. Positive deltas lock ledger funds
/// into the escrow; negative deltas unlock.
pub fn validate_resize(
    record: &ChannelRecord,
    candidate: &State,
    deltas: &[I256; 2],
) -> Result<State, AppError> {
    if record.status != ChannelStatus::Active {
        return Err(AppError::InvalidIntent(format!(
            "resize requires ACTIVE status, channel is {:?}",
            record.status
        )));
    }
    if candidate.intent != Intent::Resize {
        return Err(AppError::InvalidIntent(format!(
            "resize candidate must be RESIZE, got {:?}",
            candidate.intent
        )));
    }
    require_next_version(&record.last_state, candidate)?;
    require_token_uniformity(candidate)?;
    if candidate.allocations[0].token != record.token() {
        return Err(AppError::TokenMismatch);
    }
    require_unanimous(&record.channel, candidate)?;

    let before = I256::try_from(record.last_state.total())
        .map_err(|_| AppError::AllocationMismatch("allocation sum overflows int256".into()))?;
    let after = I256::try_from(candidate.total())
        .map_err(|_| AppError::AllocationMismatch("allocation sum overflows int256".into()))?;
    let delta_total = deltas[0]
        .checked_add(deltas[1])
        .ok_or_else(|| AppError::AllocationMismatch("delta sum overflows int256".into()))?;
    let expected_after = before
        .checked_add(delta_total)
        .ok_or_else(|| AppError::AllocationMismatch("resized sum overflows int256".into()))?;
    if expected_after != after {
        return Err(AppError::AllocationMismatch(format!(
            "before {} + delta {} != after {}",
            before, delta_total, after
        )));
    }
    if expected_after.is_negative() {
        return Err(AppError::AllocationMismatch(
            "resize would drive the escrow negative".into(),
        ));
    }
    Ok(candidate.clone())
}

// =============================================================================
// TRANSITION APPLICATION
// =============================================================================

pub fn apply_challenge(record: &ChannelRecord, outcome: &ChallengeOutcome) -> ChannelRecord {
    let mut next = record.clone();
    match outcome {
        ChallengeOutcome::ImmediateClose(state) => {
            next.status = ChannelStatus::Final;
            next.last_state = state.clone();
            next.challenge_expiry = 0;
        }
        ChallengeOutcome::Dispute { state, expiry } => {
            next.status = ChannelStatus::Dispute;
            next.last_state = state.clone();
            next.challenge_expiry = *expiry;
        }
    }
    next
}

pub fn apply_checkpoint(record: &ChannelRecord, state: State) -> ChannelRecord {
    let mut next = record.clone();
    next.status = ChannelStatus::Active;
    next.last_state = state;
    next.challenge_expiry = 0;
    next
}

pub fn apply_resize(record: &ChannelRecord, state: State) -> ChannelRecord {
    let mut next = record.clone();
    next.last_state = state;
    next
}

pub fn apply_close(record: &ChannelRecord, settled: State) -> ChannelRecord {
    let mut next = record.clone();
    next.status = ChannelStatus::Final;
    next.last_state = settled;
    next.challenge_expiry = 0;
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Allocation;
    use alloy::primitives::{address, Bytes};
    use alloy::signers::local::PrivateKeySigner;

    const TOKEN: Address = address!("A0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48");

    struct Fixture {
        alice: PrivateKeySigner,
        broker: PrivateKeySigner,
        channel: Channel,
    }

    fn fixture() -> Fixture {
        let alice = PrivateKeySigner::random();
        let broker = PrivateKeySigner::random();
        let channel = Channel {
            participants: [alice.address(), broker.address()],
            adjudicator: address!("3333333333333333333333333333333333333333"),
            challenge_duration: 3600,
            nonce: 1,
        };
        Fixture { alice, broker, channel }
    }

    fn state(fx: &Fixture, intent: Intent, version: u64, amounts: [u64; 2]) -> State {
        State {
            intent,
            version,
            data: Bytes::new(),
            allocations: [
                Allocation {
                    destination: fx.channel.participants[0],
                    token: TOKEN,
                    amount: U256::from(amounts[0]),
                },
                Allocation {
                    destination: fx.channel.participants[1],
                    token: TOKEN,
                    amount: U256::from(amounts[1]),
                },
            ],
            sigs: vec![],
        }
    }

    async fn sign(fx: &Fixture, state: &mut State, signers: &[&PrivateKeySigner]) {
        let digest = crypto::state_hash(fx.channel.id(), state);
        state.sigs = Vec::new();
        for signer in signers {
            let sig = crypto::sign_digest(signer, digest).await.unwrap();
            state.sigs.push(sig);
        }
    }

    async fn active_record(fx: &Fixture, amounts: [u64; 2]) -> ChannelRecord {
        let mut initial = state(fx, Intent::Initialize, 0, amounts);
        sign(fx, &mut initial, &[&fx.alice]).await;
        let record = validate_create(&fx.channel, &initial, fx.alice.address()).unwrap();
        let digest = crypto::state_hash(fx.channel.id(), &initial);
        let join_sig = crypto::sign_digest(&fx.broker, digest).await.unwrap();
        validate_join(&record, 1, &join_sig, fx.broker.address()).unwrap()
    }

    async fn challenger_sig(fx: &Fixture, signer: &PrivateKeySigner, candidate: &State) -> String {
        let payload = crypto::challenge_hash(fx.channel.id(), candidate);
        crypto::sign_digest(signer, payload).await.unwrap()
    }

    // -------------------------------------------------------------------------
    // create / join
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn create_then_join_reaches_active() {
        let fx = fixture();
        let record = active_record(&fx, [100, 0]).await;
        assert_eq!(record.status, ChannelStatus::Active);
        assert_eq!(record.actual_deposits, record.expected_deposits);
        assert_eq!(record.wallets, [fx.alice.address(), fx.broker.address()]);
    }

    #[tokio::test]
    async fn create_rejects_short_challenge_period() {
        let fx = fixture();
        let mut channel = fx.channel.clone();
        channel.challenge_duration = MIN_CHALLENGE_PERIOD - 1;
        let mut initial = state(&fx, Intent::Initialize, 0, [100, 0]);
        // Signature over the short-duration channel id.
        let digest = crypto::state_hash(channel.id(), &initial);
        initial.sigs = vec![crypto::sign_digest(&fx.alice, digest).await.unwrap()];
        let err = validate_create(&channel, &initial, fx.alice.address()).unwrap_err();
        assert!(matches!(err, AppError::ChallengePeriodTooShort { .. }));
    }

    #[tokio::test]
    async fn create_rejects_token_mismatch() {
        let fx = fixture();
        let mut initial = state(&fx, Intent::Initialize, 0, [100, 0]);
        initial.allocations[1].token = address!("4444444444444444444444444444444444444444");
        sign(&fx, &mut initial, &[&fx.alice]).await;
        let err = validate_create(&fx.channel, &initial, fx.alice.address()).unwrap_err();
        assert!(matches!(err, AppError::TokenMismatch));
    }

    #[tokio::test]
    async fn create_rejects_wrong_intent_and_version() {
        let fx = fixture();
        let mut operate = state(&fx, Intent::Operate, 0, [100, 0]);
        sign(&fx, &mut operate, &[&fx.alice]).await;
        assert!(matches!(
            validate_create(&fx.channel, &operate, fx.alice.address()),
            Err(AppError::InvalidIntent(_))
        ));

        let mut v1 = state(&fx, Intent::Initialize, 1, [100, 0]);
        sign(&fx, &mut v1, &[&fx.alice]).await;
        assert!(matches!(
            validate_create(&fx.channel, &v1, fx.alice.address()),
            Err(AppError::InvalidVersion { .. })
        ));
    }

    #[tokio::test]
    async fn create_rejects_signature_over_wrong_channel() {
        let fx = fixture();
        let mut initial = state(&fx, Intent::Initialize, 0, [100, 0]);
        // Signed against a channel with a different nonce: different id.
        let mut other = fx.channel.clone();
        other.nonce = 99;
        let digest = crypto::state_hash(other.id(), &initial);
        initial.sigs = vec![crypto::sign_digest(&fx.alice, digest).await.unwrap()];
        let err = validate_create(&fx.channel, &initial, fx.alice.address()).unwrap_err();
        assert!(matches!(err, AppError::InvalidSignature { .. }));
    }

    // -------------------------------------------------------------------------
    // close
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn cooperative_close_requires_unanimous_finalize() {
        let fx = fixture();
        let record = active_record(&fx, [60, 40]).await;

        let mut fin = state(&fx, Intent::Finalize, 1, [60, 40]);
        sign(&fx, &mut fin, &[&fx.alice, &fx.broker]).await;
        let (settled, outcome) = validate_close(&record, Some(&fin), 0).unwrap();
        assert_eq!(outcome, CloseOutcome::Cooperative);
        assert_eq!(settled.total(), U256::from(100u64));

        // Missing broker signature: rejected.
        let mut partial = state(&fx, Intent::Finalize, 1, [60, 40]);
        sign(&fx, &mut partial, &[&fx.alice]).await;
        assert!(validate_close(&record, Some(&partial), 0).is_err());
    }

    #[tokio::test]
    async fn close_rejects_version_gap() {
        let fx = fixture();
        let record = active_record(&fx, [60, 40]).await;
        let mut fin = state(&fx, Intent::Finalize, 2, [60, 40]);
        sign(&fx, &mut fin, &[&fx.alice, &fx.broker]).await;
        assert!(matches!(
            validate_close(&record, Some(&fin), 0),
            Err(AppError::InvalidVersion { expected: 1, actual: 2 })
        ));
    }

    #[tokio::test]
    async fn close_rejects_sum_change() {
        let fx = fixture();
        let record = active_record(&fx, [60, 40]).await;
        let mut fin = state(&fx, Intent::Finalize, 1, [60, 50]);
        sign(&fx, &mut fin, &[&fx.alice, &fx.broker]).await;
        assert!(matches!(
            validate_close(&record, Some(&fin), 0),
            Err(AppError::AllocationMismatch(_))
        ));
    }

    #[tokio::test]
    async fn forced_close_after_expiry_follows_posted_state() {
        let fx = fixture();
        let mut record = active_record(&fx, [60, 40]).await;

        let mut v5 = state(&fx, Intent::Operate, 5, [10, 90]);
        sign(&fx, &mut v5, &[&fx.alice, &fx.broker]).await;
        let chal = challenger_sig(&fx, &fx.alice, &v5).await;
        let outcome = validate_challenge(
            &record,
            &v5,
            &ChallengerSig::Raw { sig: &chal },
            &UnanimousAdjudicator,
            1_000,
        )
        .unwrap();
        record = apply_challenge(&record, &outcome);
        assert_eq!(record.status, ChannelStatus::Dispute);

        // Pre-expiry without a finalize candidate: rejected.
        assert!(validate_close(&record, None, 2_000).is_err());

        // Post-expiry: settles per the posted v5.
        let (settled, outcome) = validate_close(&record, None, 1_000 + 3600).unwrap();
        assert_eq!(outcome, CloseOutcome::Forced);
        assert_eq!(settled.version, 5);
        assert_eq!(settled.allocations[1].amount, U256::from(90u64));
    }

    // -------------------------------------------------------------------------
    // challenge
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn challenge_at_initial_closes_immediately() {
        let fx = fixture();
        let mut initial = state(&fx, Intent::Initialize, 0, [100, 0]);
        sign(&fx, &mut initial, &[&fx.alice]).await;
        let record = validate_create(&fx.channel, &initial, fx.alice.address()).unwrap();

        let chal = challenger_sig(&fx, &fx.alice, &record.last_state).await;
        let outcome = validate_challenge(
            &record,
            &record.last_state.clone(),
            &ChallengerSig::Raw { sig: &chal },
            &UnanimousAdjudicator,
            500,
        )
        .unwrap();
        assert!(matches!(outcome, ChallengeOutcome::ImmediateClose(_)));
        let closed = apply_challenge(&record, &outcome);
        assert_eq!(closed.status, ChannelStatus::Final);
        assert_eq!(closed.challenge_expiry, 0);
    }

    #[tokio::test]
    async fn challenge_at_initial_rejects_other_states() {
        let fx = fixture();
        let mut initial = state(&fx, Intent::Initialize, 0, [100, 0]);
        sign(&fx, &mut initial, &[&fx.alice]).await;
        let record = validate_create(&fx.channel, &initial, fx.alice.address()).unwrap();

        let mut other = state(&fx, Intent::Initialize, 0, [90, 10]);
        sign(&fx, &mut other, &[&fx.alice]).await;
        let chal = challenger_sig(&fx, &fx.alice, &other).await;
        assert!(validate_challenge(
            &record,
            &other,
            &ChallengerSig::Raw { sig: &chal },
            &UnanimousAdjudicator,
            500,
        )
        .is_err());
    }

    #[tokio::test]
    async fn challenge_with_newer_operate_opens_dispute() {
        let fx = fixture();
        let record = active_record(&fx, [60, 40]).await;

        let mut v5 = state(&fx, Intent::Operate, 5, [10, 90]);
        sign(&fx, &mut v5, &[&fx.alice, &fx.broker]).await;
        let chal = challenger_sig(&fx, &fx.alice, &v5).await;
        let outcome = validate_challenge(
            &record,
            &v5,
            &ChallengerSig::Raw { sig: &chal },
            &UnanimousAdjudicator,
            1_000,
        )
        .unwrap();
        match outcome {
            ChallengeOutcome::Dispute { state, expiry } => {
                assert_eq!(state.version, 5);
                assert_eq!(expiry, 1_000 + 3600);
            }
            other => panic!("expected dispute, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn challenger_attestation_verifies_in_every_mode() {
        let fx = fixture();
        let record = active_record(&fx, [60, 40]).await;
        let mut v5 = state(&fx, Intent::Operate, 5, [10, 90]);
        sign(&fx, &mut v5, &[&fx.alice, &fx.broker]).await;
        let payload = crypto::challenge_hash(fx.channel.id(), &v5);

        let prefixed = crypto::sign_eip191(&fx.alice, payload).await.unwrap();
        assert!(validate_challenge(
            &record,
            &v5,
            &ChallengerSig::Eip191 { sig: &prefixed },
            &UnanimousAdjudicator,
            1_000,
        )
        .is_ok());

        let domain = SigDomain {
            chain_id: 31337,
            verifying_contract: fx.channel.adjudicator,
        };
        let typed = crypto::sign_digest(&fx.broker, crypto::eip712_digest(&domain, payload))
            .await
            .unwrap();
        assert!(validate_challenge(
            &record,
            &v5,
            &ChallengerSig::Eip712 { sig: &typed, domain: domain.clone() },
            &UnanimousAdjudicator,
            1_000,
        )
        .is_ok());

        // A signature framed for one mode does not verify under another.
        assert!(validate_challenge(
            &record,
            &v5,
            &ChallengerSig::Raw { sig: &prefixed },
            &UnanimousAdjudicator,
            1_000,
        )
        .is_err());
    }

    #[tokio::test]
    async fn contract_challenger_is_matched_against_participants() {
        // ERC-1271 attestations arrive pre-verified by the custody layer;
        // the engine still requires the signer to be a participant.
        let fx = fixture();
        let record = active_record(&fx, [60, 40]).await;
        let mut v5 = state(&fx, Intent::Operate, 5, [10, 90]);
        sign(&fx, &mut v5, &[&fx.alice, &fx.broker]).await;

        assert!(validate_challenge(
            &record,
            &v5,
            &ChallengerSig::Contract { signer: fx.alice.address() },
            &UnanimousAdjudicator,
            1_000,
        )
        .is_ok());

        let outsider = PrivateKeySigner::random().address();
        assert!(matches!(
            validate_challenge(
                &record,
                &v5,
                &ChallengerSig::Contract { signer: outsider },
                &UnanimousAdjudicator,
                1_000,
            ),
            Err(AppError::InvalidChallenge(_))
        ));
    }

    #[tokio::test]
    async fn challenge_rejects_non_participant_attestation() {
        let fx = fixture();
        let record = active_record(&fx, [60, 40]).await;
        let outsider = PrivateKeySigner::random();

        let mut v5 = state(&fx, Intent::Operate, 5, [10, 90]);
        sign(&fx, &mut v5, &[&fx.alice, &fx.broker]).await;
        let chal = challenger_sig(&fx, &outsider, &v5).await;
        assert!(matches!(
            validate_challenge(
                &record,
                &v5,
                &ChallengerSig::Raw { sig: &chal },
                &UnanimousAdjudicator,
                1_000,
            ),
            Err(AppError::InvalidChallenge(_))
        ));
    }

    #[tokio::test]
    async fn challenge_after_resize_admits_equal_resize_only() {
        let fx = fixture();
        let mut record = active_record(&fx, [60, 40]).await;

        let mut resize = state(&fx, Intent::Resize, 1, [160, 40]);
        sign(&fx, &mut resize, &[&fx.alice, &fx.broker]).await;
        let deltas = [I256::try_from(100).unwrap(), I256::ZERO];
        let admitted = validate_resize(&record, &resize, &deltas).unwrap();
        record = apply_resize(&record, admitted);

        // The identical RESIZE may be posted.
        let chal = challenger_sig(&fx, &fx.broker, &resize).await;
        assert!(validate_challenge(
            &record,
            &resize,
            &ChallengerSig::Raw { sig: &chal },
            &UnanimousAdjudicator,
            1_000,
        )
        .is_ok());

        // A different RESIZE may not.
        let mut forged = state(&fx, Intent::Resize, 2, [200, 40]);
        sign(&fx, &mut forged, &[&fx.alice, &fx.broker]).await;
        let chal = challenger_sig(&fx, &fx.broker, &forged).await;
        assert!(validate_challenge(
            &record,
            &forged,
            &ChallengerSig::Raw { sig: &chal },
            &UnanimousAdjudicator,
            1_000,
        )
        .is_err());

        // A newer OPERATE supersedes the resize.
        let mut v2 = state(&fx, Intent::Operate, 2, [150, 50]);
        sign(&fx, &mut v2, &[&fx.alice, &fx.broker]).await;
        let chal = challenger_sig(&fx, &fx.alice, &v2).await;
        assert!(validate_challenge(
            &record,
            &v2,
            &ChallengerSig::Raw { sig: &chal },
            &UnanimousAdjudicator,
            1_000,
        )
        .is_ok());
    }

    // -------------------------------------------------------------------------
    // checkpoint
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn checkpoint_requires_strictly_newer() {
        let fx = fixture();
        let mut record = active_record(&fx, [60, 40]).await;
        let mut v3 = state(&fx, Intent::Operate, 3, [30, 70]);
        sign(&fx, &mut v3, &[&fx.alice, &fx.broker]).await;
        record = apply_checkpoint(&record, validate_checkpoint(&record, &v3, &UnanimousAdjudicator).unwrap());
        assert_eq!(record.last_state.version, 3);

        // Same version again: rejected.
        assert!(matches!(
            validate_checkpoint(&record, &v3, &UnanimousAdjudicator),
            Err(AppError::InvalidVersion { .. })
        ));
    }

    #[tokio::test]
    async fn checkpoint_from_dispute_clears_expiry() {
        let fx = fixture();
        let mut record = active_record(&fx, [60, 40]).await;

        let mut v5 = state(&fx, Intent::Operate, 5, [10, 90]);
        sign(&fx, &mut v5, &[&fx.alice, &fx.broker]).await;
        let chal = challenger_sig(&fx, &fx.alice, &v5).await;
        let outcome = validate_challenge(
            &record,
            &v5,
            &ChallengerSig::Raw { sig: &chal },
            &UnanimousAdjudicator,
            1_000,
        )
        .unwrap();
        record = apply_challenge(&record, &outcome);
        assert!(record.challenge_expiry > 0);

        let mut v6 = state(&fx, Intent::Operate, 6, [20, 80]);
        sign(&fx, &mut v6, &[&fx.alice, &fx.broker]).await;
        let pinned = validate_checkpoint(&record, &v6, &UnanimousAdjudicator).unwrap();
        record = apply_checkpoint(&record, pinned);
        assert_eq!(record.status, ChannelStatus::Active);
        assert_eq!(record.challenge_expiry, 0);
        assert_eq!(record.last_state.version, 6);
    }

    // -------------------------------------------------------------------------
    // resize
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn resize_conserves_by_exact_delta() {
        let fx = fixture();
        let record = active_record(&fx, [60, 40]).await;

        let mut grow = state(&fx, Intent::Resize, 1, [160, 40]);
        sign(&fx, &mut grow, &[&fx.alice, &fx.broker]).await;
        let deltas = [I256::try_from(100).unwrap(), I256::ZERO];
        assert!(validate_resize(&record, &grow, &deltas).is_ok());

        // Declared delta doesn't match the allocation movement.
        let wrong = [I256::try_from(50).unwrap(), I256::ZERO];
        assert!(matches!(
            validate_resize(&record, &grow, &wrong),
            Err(AppError::AllocationMismatch(_))
        ));
    }

    #[tokio::test]
    async fn resize_with_negative_delta_unlocks() {
        let fx = fixture();
        let mut record = active_record(&fx, [100, 0]).await;
        let mut shrink = state(&fx, Intent::Resize, 1, [0, 0]);
        sign(&fx, &mut shrink, &[&fx.alice, &fx.broker]).await;
        let deltas = [I256::try_from(-100).unwrap(), I256::ZERO];
        let admitted = validate_resize(&record, &shrink, &deltas).unwrap();
        record = apply_resize(&record, admitted);
        assert_eq!(record.last_state.total(), U256::ZERO);
    }

    #[tokio::test]
    async fn resize_requires_unanimity_and_next_version() {
        let fx = fixture();
        let record = active_record(&fx, [60, 40]).await;

        let mut partial = state(&fx, Intent::Resize, 1, [160, 40]);
        sign(&fx, &mut partial, &[&fx.alice]).await;
        let deltas = [I256::try_from(100).unwrap(), I256::ZERO];
        assert!(validate_resize(&record, &partial, &deltas).is_err());

        let mut gap = state(&fx, Intent::Resize, 3, [160, 40]);
        sign(&fx, &mut gap, &[&fx.alice, &fx.broker]).await;
        assert!(matches!(
            validate_resize(&record, &gap, &deltas),
            Err(AppError::InvalidVersion { expected: 1, actual: 3 })
        ));
    }
}
