//! The BFT consensus engine.
//!
//! Phase walk per height: PROPOSE → PREVOTE → PRECOMMIT → COMMIT →
//! FINALIZE, looping back to PROPOSE of height+1 at round 0, or to PROPOSE
//! of the same height at round+1 when a phase times out or a nil quorum
//! forms (view change).
//!
//! ## Locking rule
//!
//! On a prevote quorum for block B the engine locks on B (`locked_round`,
//! `locked_hash`) and precommits B. While locked it prevotes nil against
//! any conflicting proposal. The lock clears only on finalize. This is the
//! safety core: two conflicting blocks can never both gather commit quorums
//! at one height, regardless of partitions or delay.
//!
//! ## I/O discipline
//!
//! The engine owns no sockets and no files. Proposals and votes are handed
//! in by the caller; outbound intent leaves through [`ConsensusEvent`]s.
//! The finalize event carries an ack channel, and the engine does not
//! advance to the next height until the caller confirms the block is
//! durable, preserving crash-recoverability.

use crate::metrics::{ConsensusMetrics, MetricsSnapshot};
use crate::timeout::{PhaseTimeouts, TimeoutInfo, TimeoutScheduler};
use crate::types::{ConsensusState, Phase, Proposal, Validator, ValidatorSet, Vote, VoteType};
use crate::vote_set::{HeightVotes, VoteOutcome};
use crate::{ConsensusError, Result};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};
use valcore_types::{transaction::transactions_root, Address, BlockHeader, Signer, Transaction, H256};

/// Block content supplied by the caller when this node is the proposer.
#[derive(Debug)]
pub struct BlockCandidate {
    /// Hash of the block at height-1
    pub parent_hash: H256,
    /// State root the proposal will commit to
    pub state_root: H256,
    /// Transactions selected from the mempool
    pub transactions: Vec<Transaction>,
}

/// A decided block, emitted on finalize.
#[derive(Debug, Clone)]
pub struct FinalizedBlock {
    /// Decided height
    pub height: u64,
    /// Round the decision landed in
    pub round: u64,
    /// Decided block hash
    pub block_hash: H256,
    /// The winning proposal
    pub proposal: Proposal,
    /// Commit votes certifying the decision
    pub commit_votes: Vec<Vote>,
}

/// Outbound engine events, consumed by the node orchestrator.
#[derive(Debug)]
pub enum ConsensusEvent {
    /// The engine is the proposer and needs block content
    RequestBlock {
        /// Height being proposed
        height: u64,
        /// Round being proposed
        round: u64,
        /// Reply channel; `None` aborts the proposal (the round will
        /// time out into a nil prevote)
        reply: oneshot::Sender<Option<BlockCandidate>>,
    },
    /// Gossip this proposal to the network
    BroadcastProposal(Proposal),
    /// Gossip this vote to the network
    BroadcastVote(Vote),
    /// A block was decided. The engine waits on `ack` and only advances
    /// once the caller reports the block durably stored; `false` (or a
    /// dropped channel) stops the engine.
    BlockFinalized {
        /// The decided block
        block: FinalizedBlock,
        /// Durability acknowledgement
        ack: oneshot::Sender<bool>,
    },
    /// The round cap was exceeded; this height needs external recovery
    ConsensusFailed {
        /// Failed height
        height: u64,
        /// Rounds attempted
        rounds: u64,
    },
}

/// Engine tuning parameters.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Quorum threshold numerator
    pub quorum_numerator: u64,
    /// Quorum threshold denominator
    pub quorum_denominator: u64,
    /// Rounds allowed per height before consensus fails
    pub max_rounds_per_height: u64,
    /// Phase timeout configuration
    pub timeouts: PhaseTimeouts,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            quorum_numerator: 67,
            quorum_denominator: 100,
            max_rounds_per_height: 10,
            timeouts: PhaseTimeouts::default(),
        }
    }
}

/// A pending round transition, produced deep in the vote-handling chain
/// and executed by the engine's drive loop. Bubbling the transition out
/// instead of re-entering the round keeps stack depth constant no matter
/// how many heights finalize back to back.
#[derive(Debug, Clone, Copy)]
enum Step {
    EnterRound { height: u64, round: u64 },
}

/// Round-based BFT consensus engine.
pub struct ConsensusEngine {
    config: EngineConfig,
    signer: Arc<dyn Signer>,
    address: Address,
    state: RwLock<ConsensusState>,
    validators: RwLock<Arc<ValidatorSet>>,
    votes: Mutex<HeightVotes>,
    /// Proposal received for the current round
    proposal: RwLock<Option<Proposal>>,
    /// Proposal we locked on; re-proposed if we lead a later round
    locked_proposal: RwLock<Option<Proposal>>,
    event_tx: mpsc::Sender<ConsensusEvent>,
    scheduler: TimeoutScheduler,
    metrics: Mutex<ConsensusMetrics>,
    running: AtomicBool,
    height_started: Mutex<Instant>,
}

impl ConsensusEngine {
    /// Creates an engine. Timeout fires land on `timeout_tx`; the caller
    /// routes them back via [`ConsensusEngine::on_timeout`].
    pub fn new(
        config: EngineConfig,
        signer: Arc<dyn Signer>,
        validators: Vec<Validator>,
        event_tx: mpsc::Sender<ConsensusEvent>,
        timeout_tx: mpsc::Sender<TimeoutInfo>,
    ) -> Self {
        let address = signer.address();
        let scheduler = TimeoutScheduler::new(config.timeouts.clone(), timeout_tx);
        Self {
            config,
            signer,
            address,
            state: RwLock::new(ConsensusState::at_height(0)),
            validators: RwLock::new(Arc::new(ValidatorSet::new(validators))),
            votes: Mutex::new(HeightVotes::new(0)),
            proposal: RwLock::new(None),
            locked_proposal: RwLock::new(None),
            event_tx,
            scheduler,
            metrics: Mutex::new(ConsensusMetrics::default()),
            running: AtomicBool::new(false),
            height_started: Mutex::new(Instant::now()),
        }
    }

    /// This node's validator address.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Snapshot of the current consensus state.
    pub fn state(&self) -> ConsensusState {
        self.state.read().clone()
    }

    /// Snapshot of the progress metrics.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.lock().snapshot()
    }

    /// Whether the engine is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Replaces the validator set wholesale. In-flight quorum checks keep
    /// the snapshot they started with.
    pub fn set_validators(&self, validators: Vec<Validator>) {
        let set = Arc::new(ValidatorSet::new(validators));
        info!(
            active = set.active_count(),
            total_power = %set.total_active_power(),
            "validator set replaced"
        );
        *self.validators.write() = set;
    }

    /// Starts consensus at the given height, round 0.
    pub async fn start(&self, from_height: u64) -> Result<()> {
        if self.validators.read().active_count() == 0 {
            return Err(ConsensusError::EmptyValidatorSet);
        }
        self.running.store(true, Ordering::SeqCst);
        {
            *self.state.write() = ConsensusState::at_height(from_height);
            *self.votes.lock() = HeightVotes::new(from_height);
            *self.proposal.write() = None;
            *self.locked_proposal.write() = None;
        }
        info!(height = from_height, "consensus engine starting");
        self.drive(Some(Step::EnterRound {
            height: from_height,
            round: 0,
        }))
        .await
    }

    /// Executes round transitions until the engine settles. Entering a
    /// round can decide immediately (a solo validator reaches every quorum
    /// on its own votes), which yields the next transition; looping here
    /// keeps the stack flat across arbitrarily many finalized heights.
    async fn drive(&self, mut step: Option<Step>) -> Result<()> {
        while let Some(Step::EnterRound { height, round }) = step {
            step = self.enter_round(height, round).await?;
        }
        Ok(())
    }

    /// Stops the engine and tears down all phase timers. Round state is
    /// discarded; a restart resumes from the last durable height.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.scheduler.cancel_all();
        self.state.write().phase = Phase::Idle;
        info!("consensus engine stopped");
    }

    async fn enter_round(&self, height: u64, round: u64) -> Result<Option<Step>> {
        if !self.running.load(Ordering::SeqCst) {
            return Ok(None);
        }

        self.metrics.lock().record_round_start();
        if round == 0 {
            *self.height_started.lock() = Instant::now();
        }

        {
            let mut state = self.state.write();
            state.height = height;
            state.round = round;
            state.phase = Phase::Propose;
        }
        *self.proposal.write() = None;

        self.scheduler.advance_to(height, round);
        self.scheduler.schedule(Phase::Propose, height, round);

        let vset = self.validators.read().clone();
        let proposer = vset
            .proposer_at(height, round)
            .ok_or(ConsensusError::EmptyValidatorSet)?
            .address;

        info!(
            height = height,
            round = round,
            proposer = %proposer,
            "entering round"
        );

        if proposer == self.address {
            return self.do_propose(height, round).await;
        }
        Ok(None)
    }

    /// Builds, signs and broadcasts our proposal for (height, round).
    async fn do_propose(&self, height: u64, round: u64) -> Result<Option<Step>> {
        // While locked, re-propose the locked block instead of building a
        // fresh one, so the network can converge on it. The `proposer`
        // field stays the original block author (the block hash commits to
        // it); our signature is what marks the re-proposal as ours.
        let locked = self.locked_proposal.read().clone();
        let mut proposal = if let Some(mut p) = locked {
            debug!(height = height, round = round, hash = %p.block_hash, "re-proposing locked block");
            p.round = round;
            p
        } else {
            let (reply_tx, reply_rx) = oneshot::channel();
            self.event_tx
                .send(ConsensusEvent::RequestBlock {
                    height,
                    round,
                    reply: reply_tx,
                })
                .await
                .map_err(|_| ConsensusError::ChannelClosed)?;

            let candidate = match reply_rx.await {
                Ok(Some(c)) => c,
                Ok(None) | Err(_) => {
                    warn!(height = height, round = round, "no block candidate, skipping proposal");
                    return Ok(None);
                }
            };

            let timestamp = valcore_types::unix_millis();
            let txs_root = transactions_root(&candidate.transactions);
            let header = BlockHeader {
                height,
                parent_hash: candidate.parent_hash,
                state_root: candidate.state_root,
                transactions_root: txs_root,
                timestamp,
                proposer: self.address,
                signature: valcore_types::Signature::empty(),
            };
            Proposal {
                height,
                round,
                proposer: self.address,
                parent_hash: candidate.parent_hash,
                block_hash: header.hash(),
                state_root: candidate.state_root,
                transactions_root: txs_root,
                timestamp,
                transactions: candidate.transactions,
                signature: valcore_types::Signature::empty(),
            }
        };

        proposal.signature = self.signer.sign(&proposal.signing_bytes());

        debug!(
            height = height,
            round = round,
            hash = %proposal.block_hash,
            txs = proposal.transactions.len(),
            "broadcasting proposal"
        );
        self.event_tx
            .send(ConsensusEvent::BroadcastProposal(proposal.clone()))
            .await
            .map_err(|_| ConsensusError::ChannelClosed)?;

        // Process our own proposal the same way a received one is.
        self.accept_proposal(proposal).await
    }

    /// Handles a proposal received from the network.
    ///
    /// Messages for other heights/rounds, from the wrong proposer, or with
    /// a bad signature are dropped; a bad signature is dropped silently
    /// (Byzantine tolerance, never an engine failure).
    pub async fn handle_proposal(&self, proposal: Proposal) -> Result<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Ok(());
        }
        let step = self.check_proposal(proposal).await?;
        self.drive(step).await
    }

    async fn check_proposal(&self, proposal: Proposal) -> Result<Option<Step>> {
        let (height, round, phase) = {
            let state = self.state.read();
            (state.height, state.round, state.phase)
        };

        if proposal.height != height || proposal.round != round {
            trace!(
                got_height = proposal.height,
                got_round = proposal.round,
                height = height,
                round = round,
                "proposal for another round, dropping"
            );
            return Ok(None);
        }
        if phase != Phase::Propose {
            trace!(phase = %phase, "proposal arrived after propose phase, dropping");
            return Ok(None);
        }

        // The proposal must be signed by this round's proposer. The
        // `proposer` field may name an earlier round's author when a
        // locked block is re-proposed, so legitimacy is checked against
        // the signing key, not the field.
        let vset = self.validators.read().clone();
        let expected = vset
            .proposer_at(height, round)
            .ok_or(ConsensusError::EmptyValidatorSet)?;
        if !self
            .signer
            .verify(&expected.public_key, &proposal.signing_bytes(), &proposal.signature)
        {
            warn!(
                author = %proposal.proposer,
                expected = %expected.address,
                height = height,
                round = round,
                "proposal not signed by round proposer, dropping"
            );
            return Ok(None);
        }

        self.accept_proposal(proposal).await
    }

    /// Proposal passed all checks: store it, enter prevote, and vote per
    /// the locking rule.
    async fn accept_proposal(&self, proposal: Proposal) -> Result<Option<Step>> {
        let (height, round) = (proposal.height, proposal.round);
        let block_hash = proposal.block_hash;

        let prevote_hash = {
            let mut state = self.state.write();
            if state.phase != Phase::Propose {
                return Ok(None);
            }
            state.phase = Phase::Prevote;
            if state.is_locked() && state.locked_hash != block_hash {
                // Locked on a different block from an earlier round:
                // prevote nil against this proposal.
                H256::NIL
            } else {
                block_hash
            }
        };
        *self.proposal.write() = Some(proposal);

        self.scheduler.cancel(Phase::Propose, height, round);
        self.scheduler.schedule(Phase::Prevote, height, round);

        debug!(
            height = height,
            round = round,
            hash = %block_hash,
            vote = %prevote_hash,
            "proposal accepted, prevoting"
        );
        self.cast_vote(VoteType::Prevote, prevote_hash).await
    }

    /// Handles a vote received from the network.
    ///
    /// Unknown validators and bad signatures are dropped (the latter
    /// silently); an equivocating vote surfaces as
    /// [`ConsensusError::Equivocation`].
    pub async fn handle_vote(&self, vote: Vote) -> Result<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let height = self.state.read().height;
        if vote.height != height {
            trace!(got = vote.height, current = height, "vote for another height, dropping");
            return Ok(());
        }

        let step = self.check_vote(vote).await?;
        self.drive(step).await
    }

    async fn check_vote(&self, vote: Vote) -> Result<Option<Step>> {
        let vset = self.validators.read().clone();
        let Some(validator) = vset.get_active(&vote.validator) else {
            warn!(validator = %vote.validator, "vote from unknown validator, dropping");
            return Ok(None);
        };

        if !self
            .signer
            .verify(&validator.public_key, &vote.signing_bytes(), &vote.signature)
        {
            trace!(validator = %vote.validator, "bad vote signature, dropping");
            return Ok(None);
        }

        self.process_vote(vote).await
    }

    /// Signs and broadcasts our own vote, then counts it.
    async fn cast_vote(&self, vote_type: VoteType, block_hash: H256) -> Result<Option<Step>> {
        // Observer nodes (not in the active set) never vote.
        if self.validators.read().get_active(&self.address).is_none() {
            return Ok(None);
        }

        let (height, round) = {
            let state = self.state.read();
            (state.height, state.round)
        };
        let mut vote = Vote {
            vote_type,
            height,
            round,
            block_hash,
            validator: self.address,
            signature: valcore_types::Signature::empty(),
            timestamp: valcore_types::unix_millis(),
        };
        vote.signature = self.signer.sign(&vote.signing_bytes());

        self.event_tx
            .send(ConsensusEvent::BroadcastVote(vote.clone()))
            .await
            .map_err(|_| ConsensusError::ChannelClosed)?;

        self.process_vote(vote).await
    }

    /// Counts a validated vote and runs quorum detection for the current
    /// round. Boxed because quorum actions cast further votes (prevote
    /// quorum begets our precommit, precommit quorum our commit); that
    /// chain is at most three deep within a height. Cross-height and
    /// cross-round transitions leave as a [`Step`] instead.
    fn process_vote<'a>(
        &'a self,
        vote: Vote,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Option<Step>>> + Send + 'a>>
    {
        Box::pin(async move {
            let vset = self.validators.read().clone();
            let power = vset
                .get_active(&vote.validator)
                .map(|v| v.voting_power)
                .ok_or(ConsensusError::UnknownValidator(vote.validator))?;

            let vote_type = vote.vote_type;
            let vote_round = vote.round;
            {
                let mut votes = self.votes.lock();
                if votes.height() != vote.height {
                    return Ok(None);
                }
                match votes.round_mut(vote_round).add_vote(vote, power) {
                    Ok(VoteOutcome::Added) => {}
                    Ok(VoteOutcome::Duplicate) => return Ok(None),
                    Err(e) => {
                        // Safety anomaly: surfaced at error severity, never
                        // silently arbitrated. First-seen vote is retained.
                        error!(error = %e, "equivocation detected");
                        return Err(e);
                    }
                }
            }

            let (height, round, phase) = {
                let state = self.state.read();
                (state.height, state.round, state.phase)
            };
            if vote_round != round {
                return Ok(None);
            }

            let threshold = vset.quorum_threshold(
                self.config.quorum_numerator,
                self.config.quorum_denominator,
            );
            let quorum = {
                let mut votes = self.votes.lock();
                votes.round_mut(round).quorum_hash(vote_type, threshold)
            };
            let Some(quorum_hash) = quorum else {
                return Ok(None);
            };

            match vote_type {
                VoteType::Prevote if phase == Phase::Prevote => {
                    self.on_prevote_quorum(height, round, quorum_hash).await
                }
                VoteType::Precommit if phase == Phase::Precommit => {
                    self.on_precommit_quorum(height, round, quorum_hash).await
                }
                VoteType::Commit if phase == Phase::Commit => {
                    self.on_commit_quorum(height, round, quorum_hash).await
                }
                _ => Ok(None),
            }
        })
    }

    async fn on_prevote_quorum(&self, height: u64, round: u64, hash: H256) -> Result<Option<Step>> {
        self.scheduler.cancel(Phase::Prevote, height, round);

        if hash.is_nil() {
            debug!(height = height, round = round, "nil prevote quorum, view change");
            return self.advance_round(height, round).await;
        }

        {
            let mut state = self.state.write();
            state.valid_round = round as i64;
            state.valid_hash = hash;
            state.locked_round = round as i64;
            state.locked_hash = hash;
            state.phase = Phase::Precommit;
        }
        // Remember the proposal content behind the lock for re-proposal.
        {
            let current = self.proposal.read().clone();
            if let Some(p) = current {
                if p.block_hash == hash {
                    *self.locked_proposal.write() = Some(p);
                }
            }
        }

        info!(height = height, round = round, hash = %hash, "locked on prevote quorum");
        self.scheduler.schedule(Phase::Precommit, height, round);
        self.cast_vote(VoteType::Precommit, hash).await
    }

    async fn on_precommit_quorum(&self, height: u64, round: u64, hash: H256) -> Result<Option<Step>> {
        self.scheduler.cancel(Phase::Precommit, height, round);

        if hash.is_nil() {
            debug!(height = height, round = round, "nil precommit quorum, view change");
            return self.advance_round(height, round).await;
        }

        self.state.write().phase = Phase::Commit;
        debug!(height = height, round = round, hash = %hash, "precommit quorum, committing");
        self.scheduler.schedule(Phase::Commit, height, round);
        self.cast_vote(VoteType::Commit, hash).await
    }

    async fn on_commit_quorum(&self, height: u64, round: u64, hash: H256) -> Result<Option<Step>> {
        self.scheduler.cancel(Phase::Commit, height, round);

        if hash.is_nil() {
            debug!(height = height, round = round, "nil commit quorum, view change");
            return self.advance_round(height, round).await;
        }

        let proposal = {
            let stored = self.proposal.read().clone();
            let locked = self.locked_proposal.read().clone();
            stored
                .filter(|p| p.block_hash == hash)
                .or_else(|| locked.filter(|p| p.block_hash == hash))
        };
        let Some(proposal) = proposal else {
            // Commit quorum for a block we never saw the proposal of; the
            // orchestrator's sync path has to fetch it.
            warn!(height = height, hash = %hash, "commit quorum without local proposal, awaiting sync");
            return Ok(None);
        };

        self.state.write().phase = Phase::Finalize;

        let (commit_votes, voters) = {
            let mut votes = self.votes.lock();
            let round_votes = votes.round_mut(round);
            let cv = round_votes.votes_for(VoteType::Commit, &hash);
            let count = cv.len();
            (cv, count)
        };

        let latency = self.height_started.lock().elapsed();
        let vset = self.validators.read().clone();
        self.metrics
            .lock()
            .record_finalize(latency, voters, vset.active_count());

        info!(
            height = height,
            round = round,
            hash = %hash,
            commit_votes = commit_votes.len(),
            latency_ms = latency.as_millis(),
            "block finalized"
        );

        let (ack_tx, ack_rx) = oneshot::channel();
        self.event_tx
            .send(ConsensusEvent::BlockFinalized {
                block: FinalizedBlock {
                    height,
                    round,
                    block_hash: hash,
                    proposal,
                    commit_votes,
                },
                ack: ack_tx,
            })
            .await
            .map_err(|_| ConsensusError::ChannelClosed)?;

        // Hold here until the block is durable; advancing before the
        // storage write completes would break crash recovery.
        match ack_rx.await {
            Ok(true) => {}
            Ok(false) | Err(_) => {
                error!(height = height, "finalized block not persisted, stopping engine");
                self.stop();
                return Ok(None);
            }
        }

        {
            let mut state = self.state.write();
            state.clear_lock();
        }
        *self.locked_proposal.write() = None;
        *self.proposal.write() = None;
        *self.votes.lock() = HeightVotes::new(height + 1);

        Ok(Some(Step::EnterRound {
            height: height + 1,
            round: 0,
        }))
    }

    async fn advance_round(&self, height: u64, round: u64) -> Result<Option<Step>> {
        self.metrics.lock().record_view_change();
        let next = round + 1;

        if next >= self.config.max_rounds_per_height {
            self.metrics.lock().record_height_failed();
            error!(
                height = height,
                rounds = next,
                "round cap exceeded, consensus failed for height"
            );
            self.running.store(false, Ordering::SeqCst);
            self.scheduler.cancel_all();
            self.state.write().phase = Phase::Idle;
            self.event_tx
                .send(ConsensusEvent::ConsensusFailed {
                    height,
                    rounds: next,
                })
                .await
                .map_err(|_| ConsensusError::ChannelClosed)?;
            return Ok(None);
        }

        debug!(height = height, round = next, "advancing round");
        Ok(Some(Step::EnterRound {
            height,
            round: next,
        }))
    }

    /// Routes a fired phase timer. Stale fires (the engine already moved
    /// on) are ignored.
    pub async fn on_timeout(&self, info: TimeoutInfo) -> Result<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let (height, round, phase) = {
            let state = self.state.read();
            (state.height, state.round, state.phase)
        };
        if info.height != height || info.round != round || info.phase != phase {
            trace!(
                fired = %info.phase,
                current = %phase,
                "stale timeout, ignoring"
            );
            return Ok(());
        }

        warn!(phase = %phase, height = height, round = round, "phase timeout");

        let step = match phase {
            Phase::Propose => {
                // No valid proposal in time: prevote nil.
                self.state.write().phase = Phase::Prevote;
                self.scheduler.schedule(Phase::Prevote, height, round);
                self.cast_vote(VoteType::Prevote, H256::NIL).await?
            }
            Phase::Prevote => {
                // No prevote quorum in time: precommit nil.
                self.state.write().phase = Phase::Precommit;
                self.scheduler.schedule(Phase::Precommit, height, round);
                self.cast_vote(VoteType::Precommit, H256::NIL).await?
            }
            Phase::Precommit | Phase::Commit => self.advance_round(height, round).await?,
            Phase::Idle | Phase::Finalize => None,
        };
        self.drive(step).await
    }
}
