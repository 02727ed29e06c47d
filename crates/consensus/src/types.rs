//! Consensus wire and state types.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use valcore_types::{Address, Signature, Transaction, H256};

/// Domain separator for prevote signing bytes.
pub const PREVOTE_DOMAIN: &[u8] = b"VALCORE_PREVOTE_V1";
/// Domain separator for precommit signing bytes.
pub const PRECOMMIT_DOMAIN: &[u8] = b"VALCORE_PRECOMMIT_V1";
/// Domain separator for commit signing bytes.
pub const COMMIT_DOMAIN: &[u8] = b"VALCORE_COMMIT_V1";
/// Domain separator for proposal signing bytes.
pub const PROPOSAL_DOMAIN: &[u8] = b"VALCORE_PROPOSAL_V1";

/// Consensus phase at the current (height, round).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Engine stopped or between heights
    Idle,
    /// Waiting for (or producing) the round's proposal
    Propose,
    /// Collecting prevotes
    Prevote,
    /// Collecting precommits
    Precommit,
    /// Collecting commit votes
    Commit,
    /// Finalizing the decided block
    Finalize,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Idle => "idle",
            Phase::Propose => "propose",
            Phase::Prevote => "prevote",
            Phase::Precommit => "precommit",
            Phase::Commit => "commit",
            Phase::Finalize => "finalize",
        };
        write!(f, "{s}")
    }
}

/// Vote kind. Each kind signs under its own domain separator so a vote can
/// never be replayed as a different kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteType {
    /// First voting phase; nil prevotes drive view changes
    Prevote,
    /// Locking phase
    Precommit,
    /// Final certification phase
    Commit,
}

impl VoteType {
    /// Domain separator for this vote kind.
    pub fn domain(&self) -> &'static [u8] {
        match self {
            VoteType::Prevote => PREVOTE_DOMAIN,
            VoteType::Precommit => PRECOMMIT_DOMAIN,
            VoteType::Commit => COMMIT_DOMAIN,
        }
    }
}

impl fmt::Display for VoteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VoteType::Prevote => "prevote",
            VoteType::Precommit => "precommit",
            VoteType::Commit => "commit",
        };
        write!(f, "{s}")
    }
}

/// A validator set member.
///
/// Voting power is an exact integer; quorum arithmetic never goes through
/// floating point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    /// Validator address
    pub address: Address,
    /// Stake-weighted voting power
    pub voting_power: u128,
    /// Public key used to verify this validator's signatures
    pub public_key: Vec<u8>,
    /// Inactive validators are excluded from quorum and proposer selection
    pub active: bool,
}

/// An immutable validator set snapshot.
///
/// Sets are replaced wholesale (copy-on-write), never mutated in place, so
/// any in-flight quorum computation sees a consistent snapshot. Active
/// validators are kept sorted by address; proposer selection indexes into
/// that order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorSet {
    validators: Vec<Validator>,
    total_active_power: u128,
}

impl ValidatorSet {
    /// Builds a set from the given members. Active members are sorted by
    /// address for deterministic proposer rotation.
    pub fn new(mut validators: Vec<Validator>) -> Self {
        validators.sort_by_key(|v| v.address);
        let total_active_power = validators
            .iter()
            .filter(|v| v.active)
            .map(|v| v.voting_power)
            .sum();
        Self {
            validators,
            total_active_power,
        }
    }

    /// All members, active or not.
    pub fn validators(&self) -> &[Validator] {
        &self.validators
    }

    /// Active members in address order.
    pub fn active(&self) -> impl Iterator<Item = &Validator> {
        self.validators.iter().filter(|v| v.active)
    }

    /// Number of active members.
    pub fn active_count(&self) -> usize {
        self.active().count()
    }

    /// Total voting power of active members.
    pub fn total_active_power(&self) -> u128 {
        self.total_active_power
    }

    /// Looks up an active member by address.
    pub fn get_active(&self, address: &Address) -> Option<&Validator> {
        self.validators
            .iter()
            .find(|v| v.active && v.address == *address)
    }

    /// Deterministic proposer for (height, round):
    /// `SHA-256("{height}-{round}")`, first four bytes big-endian, modulo
    /// the active count, indexing the address-ordered active set.
    pub fn proposer_at(&self, height: u64, round: u64) -> Option<&Validator> {
        let count = self.active_count();
        if count == 0 {
            return None;
        }
        let digest = Sha256::digest(format!("{height}-{round}").as_bytes());
        let seed = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
        self.active().nth(seed as usize % count)
    }

    /// Minimum voting power that constitutes a quorum:
    /// `ceil(total_active_power * numerator / denominator)`.
    ///
    /// Computed with split integer arithmetic so the multiplication cannot
    /// overflow u128.
    pub fn quorum_threshold(&self, numerator: u64, denominator: u64) -> u128 {
        let total = self.total_active_power;
        let num = numerator as u128;
        let den = denominator as u128;
        let q = total / den;
        let r = total % den;
        q * num + (r * num + den - 1) / den
    }

    /// Whether the given voted power reaches quorum.
    pub fn quorum_reached(&self, voted_power: u128, numerator: u64, denominator: u64) -> bool {
        voted_power >= self.quorum_threshold(numerator, denominator) && self.total_active_power > 0
    }
}

/// A block proposal as broadcast by the round's proposer. Immutable once
/// broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    /// Proposed height
    pub height: u64,
    /// Round the proposal was made in
    pub round: u64,
    /// Proposer address
    pub proposer: Address,
    /// Hash of the block at height-1
    pub parent_hash: H256,
    /// Hash of the proposed block
    pub block_hash: H256,
    /// State root the proposal commits to
    pub state_root: H256,
    /// Commitment to the transaction list
    pub transactions_root: H256,
    /// Proposal timestamp in Unix milliseconds
    pub timestamp: u64,
    /// Proposed transactions
    pub transactions: Vec<Transaction>,
    /// Proposer signature over [`Proposal::signing_bytes`]
    pub signature: Signature,
}

impl Proposal {
    /// The bytes covered by the proposer's signature.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(PROPOSAL_DOMAIN.len() + 164);
        data.extend_from_slice(PROPOSAL_DOMAIN);
        data.extend_from_slice(&self.height.to_le_bytes());
        data.extend_from_slice(&self.round.to_le_bytes());
        data.extend_from_slice(self.proposer.as_bytes());
        data.extend_from_slice(self.parent_hash.as_bytes());
        data.extend_from_slice(self.block_hash.as_bytes());
        data.extend_from_slice(self.state_root.as_bytes());
        data.extend_from_slice(self.transactions_root.as_bytes());
        data.extend_from_slice(&self.timestamp.to_le_bytes());
        data
    }
}

/// A consensus vote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    /// Vote kind
    pub vote_type: VoteType,
    /// Voted height
    pub height: u64,
    /// Voted round
    pub round: u64,
    /// Voted block hash; [`H256::NIL`] is a nil vote
    pub block_hash: H256,
    /// Voting validator
    pub validator: Address,
    /// Validator signature over [`Vote::signing_bytes`]
    pub signature: Signature,
    /// Vote timestamp in Unix milliseconds
    pub timestamp: u64,
}

impl Vote {
    /// Whether this is a nil vote.
    pub fn is_nil(&self) -> bool {
        self.block_hash.is_nil()
    }

    /// The bytes covered by the validator's signature. The domain
    /// separator binds the vote kind.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let domain = self.vote_type.domain();
        let mut data = Vec::with_capacity(domain.len() + 68);
        data.extend_from_slice(domain);
        data.extend_from_slice(&self.height.to_le_bytes());
        data.extend_from_slice(&self.round.to_le_bytes());
        data.extend_from_slice(self.block_hash.as_bytes());
        data.extend_from_slice(self.validator.as_bytes());
        data
    }
}

/// Mutable engine state for the current height.
///
/// Locked/valid rounds use -1 as the "unset" sentinel. The whole struct is
/// reset to unlocked immediately after a finalize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusState {
    /// Current height being decided
    pub height: u64,
    /// Current round within the height
    pub round: u64,
    /// Current phase
    pub phase: Phase,
    /// Round we locked in, -1 if unlocked
    pub locked_round: i64,
    /// Hash we locked on
    pub locked_hash: H256,
    /// Latest round that saw a prevote quorum, -1 if none
    pub valid_round: i64,
    /// Hash that saw that prevote quorum
    pub valid_hash: H256,
}

impl ConsensusState {
    /// Fresh state at the given height, round 0, unlocked.
    pub fn at_height(height: u64) -> Self {
        Self {
            height,
            round: 0,
            phase: Phase::Idle,
            locked_round: -1,
            locked_hash: H256::NIL,
            valid_round: -1,
            valid_hash: H256::NIL,
        }
    }

    /// Clears lock and valid tracking (after finalize).
    pub fn clear_lock(&mut self) {
        self.locked_round = -1;
        self.locked_hash = H256::NIL;
        self.valid_round = -1;
        self.valid_hash = H256::NIL;
    }

    /// Whether we are locked on a block this height.
    pub fn is_locked(&self) -> bool {
        self.locked_round >= 0 && !self.locked_hash.is_nil()
    }
}
