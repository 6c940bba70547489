// custody.rs - Custody contract and adjudicator interfaces
//
// The engine consumes these interfaces; it never interprets adjudicator
// data. Transactions are sent with the broker's wallet attached and
// surfaced with their hash preserved in errors.

use std::sync::Arc;

use alloy::network::{Ethereum, EthereumWallet};
use alloy::primitives::{Address, Bytes, FixedBytes, B256, U256};
use alloy::providers::{Provider, ProviderBuilder, RootProvider};
use alloy::rpc::types::Filter;
use alloy::signers::local::PrivateKeySigner;
use alloy::sol;
use alloy::sol_types::SolEvent;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::AppError;
use crate::model::{Allocation, Channel, Intent, State};

sol! {
    struct SolAllocation {
        address destination;
        address token;
        uint256 amount;
    }

    struct SolChannel {
        address[2] participants;
        address adjudicator;
        uint64 challengeDuration;
        uint64 nonce;
    }

    struct SolState {
        uint8 intent;
        uint64 version;
        bytes data;
        SolAllocation[2] allocations;
        bytes[] sigs;
    }

    #[sol(rpc)]
    contract ICustody {
        function deposit(address account, address token, uint256 amount) external payable;
        function withdraw(address token, uint256 amount) external;
        function create(SolChannel calldata channel, SolState calldata initial) external returns (bytes32);
        function join(bytes32 channelId, uint256 index, bytes calldata sig) external returns (bytes32);
        function depositAndCreate(address token, uint256 amount, SolChannel calldata channel, SolState calldata initial) external payable returns (bytes32);
        function close(bytes32 channelId, SolState calldata candidate, SolState[] calldata proofs) external;
        function challenge(bytes32 channelId, SolState calldata candidate, SolState[] calldata proofs, bytes calldata challengerSig) external;
        function checkpoint(bytes32 channelId, SolState calldata candidate, SolState[] calldata proofs) external;
        function resize(bytes32 channelId, SolState calldata candidate, SolState[] calldata proofs) external;

        function getChannelData(bytes32 channelId) external view returns (SolChannel memory channel, uint8 status, address[2] memory wallets, uint256 challengeExpiry, SolState memory lastValidState);
        function getAccountsBalances(address[] calldata accounts, address[] calldata tokens) external view returns (uint256[][] memory);
        function getChannelBalances(bytes32 channelId, address[] calldata tokens) external view returns (uint256[] memory);
        function getOpenChannels(address[] calldata accounts) external view returns (bytes32[][] memory);

        event Deposited(address indexed account, address indexed token, uint256 amount);
        event Withdrawn(address indexed account, address indexed token, uint256 amount);
        event Created(bytes32 indexed channelId, address indexed wallet, SolChannel channel, SolState initial);
        event Joined(bytes32 indexed channelId, uint256 index);
        event Opened(bytes32 indexed channelId);
        event Closed(bytes32 indexed channelId, SolState finalState);
        event Challenged(bytes32 indexed channelId, SolState candidate, uint256 expiration);
        event Checkpointed(bytes32 indexed channelId, SolState candidate);
        event Resized(bytes32 indexed channelId, int256[] deltaAllocations);
    }

    #[sol(rpc)]
    contract IAdjudicator {
        function adjudicate(SolChannel calldata channel, SolState calldata candidate, SolState[] calldata proofs) external view returns (bool);
        function compare(SolState calldata candidate, SolState calldata previous) external view returns (int8);
    }

    #[sol(rpc)]
    contract IErc1271 {
        function isValidSignature(bytes32 hash, bytes calldata signature) external view returns (bytes4);
    }
}

/// ERC-1271 magic value returned for a valid contract signature.
const ERC1271_MAGIC: FixedBytes<4> = FixedBytes([0x16, 0x26, 0xba, 0x7e]);

// =============================================================================
// MODEL <-> SOL CONVERSIONS
// =============================================================================

fn sol_channel(channel: &Channel) -> SolChannel {
    SolChannel {
        participants: channel.participants,
        adjudicator: channel.adjudicator,
        challengeDuration: channel.challenge_duration,
        nonce: channel.nonce,
    }
}

fn sol_state(state: &State) -> Result<SolState, AppError> {
    let mut sigs = Vec::with_capacity(state.sigs.len());
    for sig in &state.sigs {
        if sig.is_empty() {
            sigs.push(Bytes::new());
        } else {
            sigs.push(Bytes::from(crate::crypto::parse_signature_bytes(sig)?));
        }
    }
    Ok(SolState {
        intent: state.intent.as_u8(),
        version: state.version,
        data: state.data.clone(),
        allocations: [
            SolAllocation {
                destination: state.allocations[0].destination,
                token: state.allocations[0].token,
                amount: state.allocations[0].amount,
            },
            SolAllocation {
                destination: state.allocations[1].destination,
                token: state.allocations[1].token,
                amount: state.allocations[1].amount,
            },
        ],
        sigs,
    })
}

/// Inverse of `sol_state`, for states arriving in custody events.
fn model_state(state: &SolState) -> Result<State, AppError> {
    let intent = Intent::from_u8(state.intent).ok_or_else(|| {
        AppError::InvalidIntent(format!("unknown intent {} in custody event", state.intent))
    })?;
    let allocation = |a: &SolAllocation| Allocation {
        destination: a.destination,
        token: a.token,
        amount: a.amount,
    };
    Ok(State {
        intent,
        version: state.version,
        data: state.data.clone(),
        allocations: [allocation(&state.allocations[0]), allocation(&state.allocations[1])],
        sigs: state
            .sigs
            .iter()
            .map(|sig| {
                if sig.is_empty() {
                    String::new()
                } else {
                    format!("0x{}", hex::encode(sig))
                }
            })
            .collect(),
    })
}

// =============================================================================
// CUSTODY CLIENT
// =============================================================================

/// Submits channel operations with the broker's wallet attached and reads
/// custody state. One instance is shared by the orchestrator's workers.
pub struct Custody {
    pub address: Address,
    rpc_url: String,
    signer: PrivateKeySigner,
}

impl Custody {
    pub fn new(address: Address, rpc_url: String, signer: PrivateKeySigner) -> Self {
        Self { address, rpc_url, signer }
    }

    fn tx_provider(&self) -> Result<impl Provider<Ethereum> + Clone, AppError> {
        let wallet = EthereumWallet::from(self.signer.clone());
        let url = self
            .rpc_url
            .parse()
            .map_err(|e| AppError::Internal(format!("invalid rpc url: {}", e)))?;
        Ok(ProviderBuilder::<_, _, Ethereum>::new().wallet(wallet).connect_http(url))
    }

    pub async fn submit_create(&self, channel: &Channel, initial: &State) -> Result<B256, AppError> {
        let contract = ICustody::new(self.address, self.tx_provider()?);
        let call = contract.create(sol_channel(channel), sol_state(initial)?);
        send_and_watch(call.send().await, "create").await
    }

    pub async fn submit_join(&self, channel_id: B256, index: u64, sig: &str) -> Result<B256, AppError> {
        let contract = ICustody::new(self.address, self.tx_provider()?);
        let sig_bytes = Bytes::from(crate::crypto::parse_signature_bytes(sig)?);
        let call = contract.join(channel_id, U256::from(index), sig_bytes);
        send_and_watch(call.send().await, "join").await
    }

    pub async fn submit_close(
        &self,
        channel_id: B256,
        candidate: &State,
        proofs: &[State],
    ) -> Result<B256, AppError> {
        let contract = ICustody::new(self.address, self.tx_provider()?);
        let proofs = proofs.iter().map(sol_state).collect::<Result<Vec<_>, _>>()?;
        let call = contract.close(channel_id, sol_state(candidate)?, proofs);
        send_and_watch(call.send().await, "close").await
    }

    pub async fn submit_challenge(
        &self,
        channel_id: B256,
        candidate: &State,
        proofs: &[State],
        challenger_sig: &str,
    ) -> Result<B256, AppError> {
        let contract = ICustody::new(self.address, self.tx_provider()?);
        let proofs = proofs.iter().map(sol_state).collect::<Result<Vec<_>, _>>()?;
        let sig = Bytes::from(crate::crypto::parse_signature_bytes(challenger_sig)?);
        let call = contract.challenge(channel_id, sol_state(candidate)?, proofs, sig);
        send_and_watch(call.send().await, "challenge").await
    }

    pub async fn submit_checkpoint(
        &self,
        channel_id: B256,
        candidate: &State,
        proofs: &[State],
    ) -> Result<B256, AppError> {
        let contract = ICustody::new(self.address, self.tx_provider()?);
        let proofs = proofs.iter().map(sol_state).collect::<Result<Vec<_>, _>>()?;
        let call = contract.checkpoint(channel_id, sol_state(candidate)?, proofs);
        send_and_watch(call.send().await, "checkpoint").await
    }

    pub async fn submit_resize(
        &self,
        channel_id: B256,
        candidate: &State,
        proofs: &[State],
    ) -> Result<B256, AppError> {
        let contract = ICustody::new(self.address, self.tx_provider()?);
        let proofs = proofs.iter().map(sol_state).collect::<Result<Vec<_>, _>>()?;
        let call = contract.resize(channel_id, sol_state(candidate)?, proofs);
        send_and_watch(call.send().await, "resize").await
    }
}

async fn send_and_watch(
    sent: Result<alloy::providers::PendingTransactionBuilder<Ethereum>, alloy::contract::Error>,
    op: &str,
) -> Result<B256, AppError> {
    let pending = sent.map_err(|e| AppError::ContractCall(format!("{} failed: {}", op, e)))?;
    pending
        .watch()
        .await
        .map_err(|e| AppError::ContractCall(format!("{} confirmation failed: {}", op, e)))
}

// =============================================================================
// READS AND HELPERS
// =============================================================================

/// Verify the RPC endpoint serves the configured chain. Called at startup;
/// a mismatch means signatures would never verify on-chain.
pub async fn verify_chain(provider: Arc<RootProvider>, expected: u64) -> Result<(), AppError> {
    let chain_id = provider
        .get_chain_id()
        .await
        .map_err(|e| AppError::ContractCall(format!("failed to fetch chain id: {}", e)))?;
    if chain_id != expected {
        return Err(AppError::Internal(format!(
            "chain id mismatch: config {}, rpc {}",
            expected, chain_id
        )));
    }
    Ok(())
}

/// ERC-1271 check: staticcall isValidSignature on the signer contract and
/// compare the magic value. Only meaningful for addresses with code.
pub async fn is_valid_contract_signature(
    provider: Arc<RootProvider>,
    signer: Address,
    hash: B256,
    signature: &str,
) -> Result<bool, AppError> {
    let code = provider
        .get_code_at(signer)
        .await
        .map_err(|e| AppError::ContractCall(format!("failed to fetch code: {}", e)))?;
    if code.is_empty() {
        return Ok(false);
    }
    let contract = IErc1271::new(signer, provider);
    let sig_bytes = Bytes::from(crate::crypto::parse_signature_bytes(signature)?);
    let magic = contract
        .isValidSignature(hash, sig_bytes)
        .call()
        .await
        .map_err(|e| AppError::ContractCall(format!("isValidSignature failed: {}", e)))?;
    Ok(magic == ERC1271_MAGIC)
}

// =============================================================================
// EVENT OBSERVER
// =============================================================================

/// Decoded custody events the orchestrator mirrors into the ledger.
#[derive(Debug, Clone)]
pub enum CustodyEvent {
    Deposited { account: Address, token: Address, amount: U256 },
    Withdrawn { account: Address, token: Address, amount: U256 },
    Opened { channel_id: B256 },
    Challenged { channel_id: B256, candidate: State, expiry: U256 },
    Checkpointed { channel_id: B256, candidate: State },
    Closed { channel_id: B256 },
}

/// Poll custody logs and forward decoded events. The mirror update commits
/// only after the receipt is in a block, so the observer is the single
/// source of on-chain truth for the ledger.
pub async fn run_event_observer(
    provider: Arc<RootProvider>,
    custody: Address,
    mut from_block: u64,
    events: mpsc::Sender<CustodyEvent>,
) {
    loop {
        tokio::time::sleep(std::time::Duration::from_secs(3)).await;
        let head = match provider.get_block_number().await {
            Ok(head) => head,
            Err(e) => {
                warn!(error = %e, "block number fetch failed, retrying");
                continue;
            }
        };
        if head < from_block {
            continue;
        }
        let filter = Filter::new().address(custody).from_block(from_block).to_block(head);
        let logs = match provider.get_logs(&filter).await {
            Ok(logs) => logs,
            Err(e) => {
                warn!(error = %e, "log fetch failed, retrying");
                continue;
            }
        };
        for log in logs {
            let topic = match log.topic0() {
                Some(topic) => *topic,
                None => continue,
            };
            let event = if topic == ICustody::Deposited::SIGNATURE_HASH {
                ICustody::Deposited::decode_log(&log.inner).ok().map(|ev| {
                    CustodyEvent::Deposited {
                        account: ev.data.account,
                        token: ev.data.token,
                        amount: ev.data.amount,
                    }
                })
            } else if topic == ICustody::Withdrawn::SIGNATURE_HASH {
                ICustody::Withdrawn::decode_log(&log.inner).ok().map(|ev| {
                    CustodyEvent::Withdrawn {
                        account: ev.data.account,
                        token: ev.data.token,
                        amount: ev.data.amount,
                    }
                })
            } else if topic == ICustody::Opened::SIGNATURE_HASH {
                ICustody::Opened::decode_log(&log.inner)
                    .ok()
                    .map(|ev| CustodyEvent::Opened { channel_id: ev.data.channelId })
            } else if topic == ICustody::Challenged::SIGNATURE_HASH {
                ICustody::Challenged::decode_log(&log.inner).ok().and_then(|ev| {
                    model_state(&ev.data.candidate).ok().map(|candidate| {
                        CustodyEvent::Challenged {
                            channel_id: ev.data.channelId,
                            candidate,
                            expiry: ev.data.expiration,
                        }
                    })
                })
            } else if topic == ICustody::Checkpointed::SIGNATURE_HASH {
                ICustody::Checkpointed::decode_log(&log.inner).ok().and_then(|ev| {
                    model_state(&ev.data.candidate).ok().map(|candidate| {
                        CustodyEvent::Checkpointed {
                            channel_id: ev.data.channelId,
                            candidate,
                        }
                    })
                })
            } else if topic == ICustody::Closed::SIGNATURE_HASH {
                ICustody::Closed::decode_log(&log.inner)
                    .ok()
                    .map(|ev| CustodyEvent::Closed { channel_id: ev.data.channelId })
            } else {
                None
            };
            if let Some(event) = event {
                info!(?event, "custody event observed");
                if events.send(event).await.is_err() {
                    return;
                }
            }
        }
        from_block = head + 1;
    }
}
