//! The node orchestrator.
//!
//! Owns the wiring between the three core components: transport events
//! flow into the consensus engine and the mempool, engine events flow back
//! out to the transport and down into the ledger store. The orchestrator
//! itself holds no consensus logic; it routes, persists, and applies.
//!
//! Finalize ordering: the engine does not advance past a height until
//! [`Node`] has durably stored the block and acknowledged it, so a crash
//! at any point resumes from the last stored height.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use valcore_config::Config;
use valcore_consensus::{
    BlockCandidate, ConsensusEngine, ConsensusEvent, EngineConfig, FinalizedBlock, PhaseTimeouts,
    Proposal, TimeoutInfo, Validator, ValidatorSet, Vote, VoteType,
};
use valcore_mempool::{Mempool, MempoolConfig};
use valcore_p2p::{Envelope, MessageType, NetworkEvent, NetworkHandle, NetworkService, P2pConfig};
use valcore_storage::{BlockStore, BlockStoreConfig, StateStore};
use valcore_types::{
    transactions_root, Address, Block, BlockHeader, CommitVote, Signature, Signer, Transaction,
    H256,
};

/// Blocks returned per SYNC_RESPONSE.
const SYNC_BATCH: u64 = 128;

/// Initial chain state, applied once when the store is empty.
#[derive(Debug, Clone, Default)]
pub struct Genesis {
    /// Pre-funded account balances
    pub balances: Vec<(Address, u128)>,
}

/// Outcome of applying one transaction during finalize.
#[derive(Debug, Clone, Serialize)]
pub struct TxOutcome {
    /// Transaction hash
    pub hash: H256,
    /// What happened to it
    pub status: TxStatus,
}

/// Per-transaction application status. Skips are recorded explicitly so
/// "applied" and "skipped" are distinguishable by observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    /// Debit, credit and nonce update performed
    Applied,
    /// Sender balance did not cover value plus max fee
    SkippedInsufficientBalance,
    /// Arithmetic overflow in cost or recipient balance
    SkippedInvalid,
}

/// Externally visible node status.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    /// Whether the node is catching up from peers
    pub is_syncing: bool,
    /// Latest durably stored height
    pub current_height: u64,
    /// Current consensus phase
    pub consensus_phase: String,
    /// Connected peer count
    pub peers_count: usize,
}

/// Cloneable handle onto a running [`Node`].
#[derive(Clone)]
pub struct NodeHandle {
    engine: Arc<ConsensusEngine>,
    store: Arc<BlockStore>,
    state: Arc<StateStore>,
    mempool: Arc<Mempool>,
    network: NetworkHandle,
    is_syncing: Arc<AtomicBool>,
    peer_count: Arc<AtomicUsize>,
    shutdown_tx: broadcast::Sender<()>,
}

impl NodeHandle {
    /// Admits a transaction to the mempool and gossips it.
    pub async fn submit_transaction(&self, tx: Transaction) -> Result<H256> {
        let hash = self.mempool.insert(tx.clone())?;
        let payload = serde_json::to_value(&tx)?;
        if let Err(e) = self.network.broadcast(MessageType::NewTransaction, payload).await {
            debug!(error = %e, "transaction gossip failed");
        }
        Ok(hash)
    }

    /// Current node status.
    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            is_syncing: self.is_syncing.load(Ordering::SeqCst),
            current_height: self.store.latest_height().unwrap_or(0),
            consensus_phase: self.engine.state().phase.to_string(),
            peers_count: self.peer_count.load(Ordering::SeqCst),
        }
    }

    /// Snapshot of consensus health counters.
    pub fn consensus_metrics(&self) -> valcore_consensus::MetricsSnapshot {
        self.engine.metrics()
    }

    /// Current balance of an account.
    pub fn balance(&self, address: &Address) -> u128 {
        self.state.get_balance(address)
    }

    /// Pending mempool size.
    pub fn mempool_size(&self) -> usize {
        self.mempool.len()
    }

    /// Fetches a stored block by height.
    pub fn block_by_height(&self, height: u64) -> Result<Option<Block>> {
        Ok(self.store.get_block_by_height(height)?)
    }

    /// Requests a graceful shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Directed BLOCK_REQUEST payload.
#[derive(Debug, Serialize, Deserialize)]
struct BlockRequestPayload {
    height: u64,
}

/// Directed BLOCK_RESPONSE payload.
#[derive(Debug, Serialize, Deserialize)]
struct BlockResponsePayload {
    height: u64,
    block: Option<Block>,
}

/// SYNC_REQUEST payload.
#[derive(Debug, Serialize, Deserialize)]
struct SyncRequestPayload {
    from_height: u64,
}

/// SYNC_RESPONSE payload.
#[derive(Debug, Serialize, Deserialize)]
struct SyncResponsePayload {
    blocks: Vec<Block>,
}

/// The validator node: storage, transport, mempool and consensus engine
/// wired together.
pub struct Node {
    config: Config,
    signer: Arc<dyn Signer>,
    validators: Arc<ValidatorSet>,
    engine: Arc<ConsensusEngine>,
    store: Arc<BlockStore>,
    state: Arc<StateStore>,
    mempool: Arc<Mempool>,
    network: NetworkHandle,
    network_events: mpsc::Receiver<NetworkEvent>,
    engine_events: mpsc::Receiver<ConsensusEvent>,
    timeout_rx: mpsc::Receiver<TimeoutInfo>,
    is_syncing: Arc<AtomicBool>,
    peer_count: Arc<AtomicUsize>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Node {
    /// Builds a node from configuration. Opens (or initializes) storage,
    /// spawns the network service, and constructs the consensus engine;
    /// nothing progresses until [`Node::run`].
    pub fn new(
        config: Config,
        signer: Arc<dyn Signer>,
        validators: Vec<Validator>,
        genesis: Genesis,
    ) -> Result<Self> {
        config.validate().context("invalid configuration")?;

        let data_dir = std::path::Path::new(&config.storage.data_dir);
        let store = Arc::new(
            BlockStore::open(
                &data_dir.join("blocks"),
                BlockStoreConfig {
                    index_snapshot_interval: config.storage.index_snapshot_interval,
                    retention_window: config.storage.retention_window,
                    min_sync_retention: config.storage.min_sync_retention,
                },
            )
            .context("failed to open block store")?,
        );
        let state = Arc::new(
            StateStore::open(&data_dir.join("state.json")).context("failed to open state store")?,
        );

        if store.latest_height().is_none() {
            Self::init_genesis(&store, &state, &genesis)?;
        }

        let mempool = Arc::new(Mempool::new(MempoolConfig {
            max_size: config.mempool.max_size,
            max_pending_per_account: config.mempool.max_pending_per_account,
        }));

        let p2p_config = P2pConfig {
            listen_addr: config.network.listen_addr.clone(),
            chain_id: config.chain.chain_id,
            network_id: config.chain.network_id.clone(),
            boot_nodes: config.network.boot_nodes.clone(),
            min_peers: config.network.min_peers,
            max_peers: config.network.max_peers,
            heartbeat_interval: Duration::from_millis(config.network.heartbeat_interval_ms),
            cleanup_interval: Duration::from_millis(config.network.cleanup_interval_ms),
            connection_timeout: Duration::from_millis(config.network.connection_timeout_ms),
            max_frame_bytes: config.network.max_frame_bytes,
            seen_nonce_capacity: config.network.seen_nonce_capacity,
            default_ban: Duration::from_millis(config.network.default_ban_ms),
            ..P2pConfig::default()
        };
        let (net_event_tx, network_events) = mpsc::channel(1024);
        let (service, network) = NetworkService::new(p2p_config, signer.clone(), net_event_tx);
        tokio::spawn(async move {
            if let Err(e) = service.run().await {
                error!(error = %e, "network service exited");
            }
        });

        let engine_config = EngineConfig {
            quorum_numerator: config.consensus.quorum_numerator,
            quorum_denominator: config.consensus.quorum_denominator,
            max_rounds_per_height: config.consensus.max_rounds_per_height,
            timeouts: PhaseTimeouts {
                propose: Duration::from_millis(config.consensus.propose_timeout_ms),
                prevote: Duration::from_millis(config.consensus.prevote_timeout_ms),
                precommit: Duration::from_millis(config.consensus.precommit_timeout_ms),
                commit: Duration::from_millis(config.consensus.commit_timeout_ms),
                delta: Duration::from_millis(config.consensus.timeout_delta_ms),
            },
        };
        let (engine_tx, engine_events) = mpsc::channel(256);
        let (timeout_tx, timeout_rx) = mpsc::channel(256);
        let validator_set = Arc::new(ValidatorSet::new(validators.clone()));
        let engine = Arc::new(ConsensusEngine::new(
            engine_config,
            signer.clone(),
            validators,
            engine_tx,
            timeout_tx,
        ));

        let (shutdown_tx, _) = broadcast::channel(4);

        Ok(Self {
            config,
            signer,
            validators: validator_set,
            engine,
            store,
            state,
            mempool,
            network,
            network_events,
            engine_events,
            timeout_rx,
            is_syncing: Arc::new(AtomicBool::new(false)),
            peer_count: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
        })
    }

    /// Writes a genesis block and the initial balances into empty storage.
    fn init_genesis(store: &BlockStore, state: &StateStore, genesis: &Genesis) -> Result<()> {
        for (address, balance) in &genesis.balances {
            state.set_balance(address, *balance);
        }
        state.save()?;

        let header = BlockHeader {
            height: 0,
            parent_hash: H256::NIL,
            state_root: state.compute_state_root(),
            transactions_root: H256::NIL,
            timestamp: valcore_types::unix_millis(),
            proposer: Address::ZERO,
            signature: valcore_types::Signature::empty(),
        };
        let block = Block::new(header, Vec::new(), Vec::new());
        let hash = block.hash();
        store.put_block(&block)?;
        store.persist_index()?;
        info!(hash = %hash, accounts = genesis.balances.len(), "genesis block written");
        Ok(())
    }

    /// A handle usable while the node runs.
    pub fn handle(&self) -> NodeHandle {
        NodeHandle {
            engine: self.engine.clone(),
            store: self.store.clone(),
            state: self.state.clone(),
            mempool: self.mempool.clone(),
            network: self.network.clone(),
            is_syncing: self.is_syncing.clone(),
            peer_count: self.peer_count.clone(),
            shutdown_tx: self.shutdown_tx.clone(),
        }
    }

    /// Starts consensus from the height after the last stored block and
    /// runs the routing loop until shutdown.
    pub async fn run(mut self) -> Result<()> {
        let start_height = self.store.latest_height().map_or(0, |h| h + 1);
        info!(height = start_height, "node starting");

        let engine = self.engine.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.start(start_height).await {
                error!(error = %e, "consensus engine stopped with error");
            }
        });

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                Some(event) = self.network_events.recv() => {
                    self.handle_network_event(event).await;
                }
                Some(event) = self.engine_events.recv() => {
                    self.handle_engine_event(event).await;
                }
                Some(timeout) = self.timeout_rx.recv() => {
                    // Timeout handling can re-enter the proposer path and
                    // wait for a block candidate from this loop, so it
                    // must not run inline.
                    let engine = self.engine.clone();
                    tokio::spawn(async move {
                        if let Err(e) = engine.on_timeout(timeout).await {
                            debug!(error = %e, "timeout handling failed");
                        }
                    });
                }
                _ = shutdown_rx.recv() => {
                    break;
                }
            }
        }

        info!("node shutting down");
        self.engine.stop();
        if let Err(e) = self.network.shutdown().await {
            debug!(error = %e, "network already stopped");
        }
        self.store.persist_index()?;
        self.state.save()?;
        Ok(())
    }

    async fn handle_network_event(&mut self, event: NetworkEvent) {
        match event {
            NetworkEvent::Listening(addr) => {
                info!(%addr, "transport listening");
            }
            NetworkEvent::PeerConnected(info) => {
                self.peer_count.fetch_add(1, Ordering::SeqCst);
                info!(peer = %info.node_id, "peer connected");
                // Opportunistic catch-up from every fresh peer.
                let from_height = self.store.latest_height().map_or(0, |h| h + 1);
                let payload = serde_json::json!(SyncRequestPayload { from_height });
                if let Err(e) = self
                    .network
                    .send_to(info.node_id, MessageType::SyncRequest, payload)
                    .await
                {
                    debug!(error = %e, "sync request failed");
                }
            }
            NetworkEvent::PeerDisconnected { node_id } => {
                self.peer_count.fetch_sub(1, Ordering::SeqCst);
                info!(peer = %node_id, "peer disconnected");
            }
            NetworkEvent::Transaction { from, payload } => {
                match serde_json::from_value::<Transaction>(payload) {
                    Ok(tx) => match self.mempool.insert(tx) {
                        Ok(hash) => debug!(%hash, %from, "transaction pooled from gossip"),
                        Err(e) => debug!(error = %e, %from, "transaction rejected"),
                    },
                    Err(e) => debug!(error = %e, %from, "malformed transaction payload"),
                }
            }
            NetworkEvent::Vote { from, payload } => {
                match serde_json::from_value::<Vote>(payload) {
                    Ok(vote) => {
                        // Quorum actions inside the engine can block on
                        // this loop (finalize ack), so votes are handled
                        // on their own task.
                        let engine = self.engine.clone();
                        tokio::spawn(async move {
                            if let Err(e) = engine.handle_vote(vote).await {
                                debug!(error = %e, "vote handling failed");
                            }
                        });
                    }
                    Err(e) => debug!(error = %e, %from, "malformed vote payload"),
                }
            }
            NetworkEvent::Consensus { from, payload } => {
                match serde_json::from_value::<Proposal>(payload) {
                    Ok(proposal) => {
                        let engine = self.engine.clone();
                        tokio::spawn(async move {
                            if let Err(e) = engine.handle_proposal(proposal).await {
                                debug!(error = %e, "proposal handling failed");
                            }
                        });
                    }
                    Err(e) => debug!(error = %e, %from, "malformed proposal payload"),
                }
            }
            NetworkEvent::Block { from, payload } => {
                match serde_json::from_value::<Block>(payload) {
                    Ok(block) => self.accept_gossiped_block(block).await,
                    Err(e) => debug!(error = %e, %from, "malformed block payload"),
                }
            }
            NetworkEvent::Request { from, envelope } => {
                self.handle_request(from, envelope).await;
            }
            NetworkEvent::Response { from, envelope } => {
                self.handle_response(from, envelope).await;
            }
        }
    }

    /// Serves BLOCK_REQUEST and SYNC_REQUEST from local storage.
    async fn handle_request(&mut self, from: String, envelope: Envelope) {
        match envelope.message_type {
            MessageType::BlockRequest => {
                let Ok(req) = envelope.payload_as::<BlockRequestPayload>() else {
                    debug!(%from, "malformed block request");
                    return;
                };
                let block = match self.store.get_block_by_height(req.height) {
                    Ok(b) => b,
                    Err(e) => {
                        warn!(error = %e, height = req.height, "block lookup failed");
                        None
                    }
                };
                let payload = serde_json::json!(BlockResponsePayload {
                    height: req.height,
                    block,
                });
                if let Err(e) = self.network.send_to(from, MessageType::BlockResponse, payload).await {
                    debug!(error = %e, "block response failed");
                }
            }
            MessageType::SyncRequest => {
                let Ok(req) = envelope.payload_as::<SyncRequestPayload>() else {
                    debug!(%from, "malformed sync request");
                    return;
                };
                let to = req.from_height.saturating_add(SYNC_BATCH - 1);
                let blocks = match self.store.get_blocks_in_range(req.from_height, to) {
                    Ok(blocks) => blocks,
                    Err(e) => {
                        warn!(error = %e, from_height = req.from_height, "sync lookup failed");
                        Vec::new()
                    }
                };
                if blocks.is_empty() {
                    return;
                }
                debug!(%from, count = blocks.len(), "serving sync request");
                let payload = serde_json::json!(SyncResponsePayload { blocks });
                if let Err(e) = self.network.send_to(from, MessageType::SyncResponse, payload).await {
                    debug!(error = %e, "sync response failed");
                }
            }
            other => {
                debug!(%from, message_type = ?other, "unsupported request");
            }
        }
    }

    async fn handle_response(&mut self, from: String, envelope: Envelope) {
        match envelope.message_type {
            MessageType::BlockResponse => {
                let Ok(resp) = envelope.payload_as::<BlockResponsePayload>() else {
                    debug!(%from, "malformed block response");
                    return;
                };
                if let Some(block) = resp.block {
                    self.accept_gossiped_block(block).await;
                }
            }
            MessageType::SyncResponse => {
                let Ok(resp) = envelope.payload_as::<SyncResponsePayload>() else {
                    debug!(%from, "malformed sync response");
                    return;
                };
                let mut blocks = resp.blocks;
                blocks.sort_by_key(Block::height);
                let mut applied = 0usize;
                for block in blocks {
                    let next = self.store.latest_height().map_or(0, |h| h + 1);
                    if block.height() != next {
                        continue;
                    }
                    match self.verify_block(&block).and_then(|_| self.apply_block(&block)) {
                        Ok(_) => applied += 1,
                        Err(e) => {
                            warn!(error = %e, height = block.height(), "sync block rejected");
                            break;
                        }
                    }
                }
                if applied > 0 {
                    info!(applied, height = ?self.store.latest_height(), "synced blocks from peer");
                    // There may be more; keep pulling until a response
                    // comes back empty.
                    let from_height = self.store.latest_height().map_or(0, |h| h + 1);
                    let payload = serde_json::json!(SyncRequestPayload { from_height });
                    if let Err(e) = self
                        .network
                        .send_to(from, MessageType::SyncRequest, payload)
                        .await
                    {
                        debug!(error = %e, "follow-up sync request failed");
                    }
                } else {
                    self.finish_sync().await;
                }
            }
            other => {
                debug!(%from, message_type = ?other, "unsupported response");
            }
        }
    }

    /// Caught up: clear the syncing flag and restart consensus if a
    /// failed height stopped it.
    async fn finish_sync(&mut self) {
        self.is_syncing.store(false, Ordering::SeqCst);
        if !self.engine.is_running() {
            let height = self.store.latest_height().map_or(0, |h| h + 1);
            info!(height, "restarting consensus after sync");
            let engine = self.engine.clone();
            tokio::spawn(async move {
                if let Err(e) = engine.start(height).await {
                    error!(error = %e, "consensus restart failed");
                }
            });
        }
    }

    /// Handles a NEW_BLOCK from gossip: apply if it extends the chain,
    /// trigger sync if we are behind.
    async fn accept_gossiped_block(&mut self, block: Block) {
        let next = self.store.latest_height().map_or(0, |h| h + 1);
        let height = block.height();
        if height < next {
            debug!(height, next, "stale gossiped block, ignoring");
            return;
        }
        if height > next {
            debug!(height, next, "gossiped block ahead of us, requesting sync");
            self.is_syncing.store(true, Ordering::SeqCst);
            let payload = serde_json::json!(SyncRequestPayload { from_height: next });
            if let Err(e) = self.network.broadcast(MessageType::SyncRequest, payload).await {
                debug!(error = %e, "sync request failed");
            }
            return;
        }
        if let Err(e) = self.verify_block(&block).and_then(|_| self.apply_block(&block)) {
            warn!(error = %e, height, "gossiped block rejected");
        }
    }

    /// Authenticates a block received from the network before it touches
    /// storage or state: the proposer's signature must verify against the
    /// round leader's key, and the embedded commit votes must carry at
    /// least a quorum of active voting power for this block's hash.
    fn verify_block(&self, block: &Block) -> Result<()> {
        let header = &block.header;
        let hash = header.hash();

        if transactions_root(&block.transactions) != header.transactions_root {
            bail!("transactions root mismatch at height {}", header.height);
        }
        let Some(first_vote) = block.commit_votes.first() else {
            bail!("block {} carries no commit certificate", header.height);
        };
        // All certificate votes land in the decision round; the block's
        // signer is that round's leader (re-proposals keep the original
        // author in `proposer` but are signed by the leader).
        let round = first_vote.round;
        let Some(leader) = self.validators.proposer_at(header.height, round) else {
            bail!("no proposer for height {} round {round}", header.height);
        };
        let proposal = Proposal {
            height: header.height,
            round,
            proposer: header.proposer,
            parent_hash: header.parent_hash,
            block_hash: hash,
            state_root: header.state_root,
            transactions_root: header.transactions_root,
            timestamp: header.timestamp,
            transactions: Vec::new(),
            signature: Signature::empty(),
        };
        if !self
            .signer
            .verify(&leader.public_key, &proposal.signing_bytes(), &header.signature)
        {
            bail!("proposer signature invalid at height {}", header.height);
        }

        let mut voted: HashSet<Address> = HashSet::new();
        let mut power: u128 = 0;
        for cv in &block.commit_votes {
            if cv.block_hash != hash || !voted.insert(cv.validator) {
                continue;
            }
            let Some(validator) = self.validators.get_active(&cv.validator) else {
                continue;
            };
            let vote = Vote {
                vote_type: VoteType::Commit,
                height: header.height,
                round: cv.round,
                block_hash: cv.block_hash,
                validator: cv.validator,
                signature: cv.signature.clone(),
                timestamp: cv.timestamp,
            };
            if !self
                .signer
                .verify(&validator.public_key, &vote.signing_bytes(), &vote.signature)
            {
                continue;
            }
            power += validator.voting_power;
        }
        if !self.validators.quorum_reached(
            power,
            self.config.consensus.quorum_numerator,
            self.config.consensus.quorum_denominator,
        ) {
            bail!(
                "commit certificate below quorum at height {}: {} of {}",
                header.height,
                power,
                self.validators.total_active_power()
            );
        }
        Ok(())
    }

    async fn handle_engine_event(&mut self, event: ConsensusEvent) {
        match event {
            ConsensusEvent::RequestBlock { height, round, reply } => {
                let candidate = self.build_candidate(height);
                if candidate.is_none() {
                    warn!(height, round, "no block candidate available");
                }
                let _ = reply.send(candidate);
            }
            ConsensusEvent::BroadcastProposal(proposal) => {
                match serde_json::to_value(&proposal) {
                    Ok(payload) => {
                        if let Err(e) = self
                            .network
                            .broadcast(MessageType::ConsensusMessage, payload)
                            .await
                        {
                            debug!(error = %e, "proposal broadcast failed");
                        }
                    }
                    Err(e) => warn!(error = %e, "proposal encoding failed"),
                }
            }
            ConsensusEvent::BroadcastVote(vote) => {
                match serde_json::to_value(&vote) {
                    Ok(payload) => {
                        if let Err(e) = self.network.broadcast(MessageType::Vote, payload).await {
                            debug!(error = %e, "vote broadcast failed");
                        }
                    }
                    Err(e) => warn!(error = %e, "vote encoding failed"),
                }
            }
            ConsensusEvent::BlockFinalized { block, ack } => {
                match self.commit_finalized(block).await {
                    Ok(()) => {
                        let _ = ack.send(true);
                    }
                    Err(e) => {
                        // A storage failure during finalize means the
                        // ledger can no longer be trusted to match what
                        // was agreed. Stop rather than diverge.
                        error!(error = %e, "failed to persist finalized block, stopping node");
                        let _ = ack.send(false);
                        let _ = self.shutdown_tx.send(());
                    }
                }
            }
            ConsensusEvent::ConsensusFailed { height, rounds } => {
                error!(height, rounds, "consensus failed, resync required");
                self.is_syncing.store(true, Ordering::SeqCst);
                let payload = serde_json::json!(SyncRequestPayload { from_height: height });
                if let Err(e) = self.network.broadcast(MessageType::SyncRequest, payload).await {
                    debug!(error = %e, "sync request failed");
                }
            }
        }
    }

    /// Assembles block content for the proposer path.
    fn build_candidate(&self, height: u64) -> Option<BlockCandidate> {
        if height == 0 {
            return None;
        }
        let parent_hash = self.store.index_entry(height - 1).map(|e| e.hash)?;
        let transactions = self
            .mempool
            .select(self.config.consensus.max_block_transactions);
        Some(BlockCandidate {
            parent_hash,
            state_root: self.state.compute_state_root(),
            transactions,
        })
    }

    /// Persists a finalized block, applies it, and gossips it onward.
    async fn commit_finalized(&mut self, finalized: FinalizedBlock) -> Result<()> {
        let proposal = finalized.proposal;
        let header = BlockHeader {
            height: proposal.height,
            parent_hash: proposal.parent_hash,
            state_root: proposal.state_root,
            transactions_root: proposal.transactions_root,
            timestamp: proposal.timestamp,
            proposer: proposal.proposer,
            signature: proposal.signature.clone(),
        };
        let commit_votes = finalized
            .commit_votes
            .into_iter()
            .map(|v| CommitVote {
                validator: v.validator,
                round: v.round,
                block_hash: v.block_hash,
                signature: v.signature,
                timestamp: v.timestamp,
            })
            .collect();
        let block = Block::new(header, proposal.transactions, commit_votes);

        self.apply_block(&block)?;

        match serde_json::to_value(&block) {
            Ok(payload) => {
                if let Err(e) = self.network.broadcast(MessageType::NewBlock, payload).await {
                    debug!(error = %e, "block gossip failed");
                }
            }
            Err(e) => warn!(error = %e, "block encoding failed"),
        }
        Ok(())
    }

    /// Persists a block, drops its transactions from the mempool, applies
    /// them to state, and saves the state snapshot. Shared by the finalize
    /// and sync paths.
    fn apply_block(&self, block: &Block) -> Result<()> {
        self.store.put_block(block)?;

        let hashes: Vec<H256> = block.transactions.iter().map(Transaction::hash).collect();
        self.mempool.remove(&hashes);

        let outcomes = self.apply_transactions(block);
        let applied = outcomes
            .iter()
            .filter(|o| o.status == TxStatus::Applied)
            .count();
        self.state.save()?;

        info!(
            height = block.height(),
            hash = %block.hash(),
            txs = block.transactions.len(),
            applied,
            skipped = outcomes.len() - applied,
            "block applied"
        );
        Ok(())
    }

    /// Applies each transaction sequentially: debit sender (value plus max
    /// fee), credit recipient, bump the sender nonce. Every skip gets an
    /// explicit outcome record.
    fn apply_transactions(&self, block: &Block) -> Vec<TxOutcome> {
        let mut outcomes = Vec::with_capacity(block.transactions.len());
        for tx in &block.transactions {
            let hash = tx.hash();
            let status = self.apply_transaction(tx, &hash);
            outcomes.push(TxOutcome { hash, status });
        }
        outcomes
    }

    fn apply_transaction(&self, tx: &Transaction, hash: &H256) -> TxStatus {
        let Some(cost) = tx.total_cost() else {
            warn!(%hash, "transaction cost overflows, skipping");
            return TxStatus::SkippedInvalid;
        };
        let balance = self.state.get_balance(&tx.from);
        if balance < cost {
            warn!(
                %hash,
                from = %tx.from,
                balance = %balance,
                required = %cost,
                "insufficient balance, skipping"
            );
            return TxStatus::SkippedInsufficientBalance;
        }
        if self.state.get_balance(&tx.to).checked_add(tx.value).is_none() {
            warn!(%hash, to = %tx.to, "recipient balance would overflow, skipping");
            return TxStatus::SkippedInvalid;
        }
        if let Err(e) = self.state.debit(&tx.from, cost) {
            warn!(%hash, error = %e, "debit failed, skipping");
            return TxStatus::SkippedInvalid;
        }
        if let Err(e) = self.state.credit(&tx.to, tx.value) {
            // Debit succeeded; restore it so state stays consistent.
            warn!(%hash, error = %e, "credit failed, reverting debit");
            let _ = self.state.credit(&tx.from, cost);
            return TxStatus::SkippedInvalid;
        }
        self.state.set_nonce(&tx.from, tx.nonce + 1);
        TxStatus::Applied
    }
}
