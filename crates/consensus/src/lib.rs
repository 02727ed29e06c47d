//! # Valcore Consensus
//!
//! Round-based BFT consensus: a proposer selected deterministically from
//! (height, round) broadcasts a block proposal, and validators walk it
//! through prevote, precommit and commit phases, each gated by a
//! stake-weighted quorum. The precommit locking rule is what keeps two
//! conflicting blocks from ever finalizing at the same height; timeouts at
//! any phase trigger a view change to the next round.
//!
//! The engine never touches storage or sockets. It consumes proposals and
//! votes handed to it by the caller and emits [`ConsensusEvent`]s on an
//! mpsc channel; the node orchestrator wires those to the gossip transport
//! and the ledger store.

#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod engine;
pub mod metrics;
pub mod timeout;
pub mod types;
pub mod vote_set;

pub use engine::{BlockCandidate, ConsensusEngine, ConsensusEvent, EngineConfig, FinalizedBlock};
pub use metrics::{ConsensusMetrics, MetricsSnapshot};
pub use timeout::{PhaseTimeouts, TimeoutInfo, TimeoutScheduler};
pub use types::{
    ConsensusState, Phase, Proposal, Validator, ValidatorSet, Vote, VoteType,
};
pub use vote_set::{HeightVotes, RoundVotes, VoteOutcome};

use valcore_types::{Address, H256};

/// Result alias for consensus operations.
pub type Result<T> = std::result::Result<T, ConsensusError>;

/// Errors raised by the consensus engine.
#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    /// Vote from an address not in the active validator set
    #[error("unknown validator {0}")]
    UnknownValidator(Address),

    /// A validator sent two conflicting votes of the same type in one
    /// round. First-seen wins; the conflict is surfaced, never silently
    /// arbitrated.
    #[error("equivocation by {validator} at height {height} round {round}: {first} vs {second}")]
    Equivocation {
        /// Offending validator
        validator: Address,
        /// Height
        height: u64,
        /// Round
        round: u64,
        /// Hash in the retained vote
        first: H256,
        /// Hash in the conflicting vote
        second: H256,
    },

    /// The validator set is empty or has no active members
    #[error("no active validators")]
    EmptyValidatorSet,

    /// The outbound event channel is closed
    #[error("event channel closed")]
    ChannelClosed,
}
