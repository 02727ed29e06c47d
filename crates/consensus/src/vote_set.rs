//! Vote accounting with stake-weighted power sums.
//!
//! One [`RoundVotes`] exists per (height, round). Each of the three vote
//! kinds keeps at most one vote per validator: the first validly-signed
//! vote wins, and a conflicting later vote is reported as equivocation
//! rather than silently replacing or being replaced. Quorum detection is a
//! power-sum comparison and therefore independent of arrival order.

use crate::types::{Vote, VoteType};
use crate::{ConsensusError, Result};
use std::collections::HashMap;
use valcore_types::{Address, H256};

/// Outcome of adding a vote to a round set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteOutcome {
    /// First vote from this validator for this kind
    Added,
    /// Byte-identical vote already present
    Duplicate,
}

/// Per-kind vote table for one round.
#[derive(Debug, Default)]
struct KindVotes {
    by_validator: HashMap<Address, Vote>,
    power_by_hash: HashMap<H256, u128>,
    total_power: u128,
}

/// Votes for a single (height, round).
#[derive(Debug, Default)]
pub struct RoundVotes {
    prevotes: KindVotes,
    precommits: KindVotes,
    commits: KindVotes,
}

impl RoundVotes {
    fn kind(&self, vote_type: VoteType) -> &KindVotes {
        match vote_type {
            VoteType::Prevote => &self.prevotes,
            VoteType::Precommit => &self.precommits,
            VoteType::Commit => &self.commits,
        }
    }

    fn kind_mut(&mut self, vote_type: VoteType) -> &mut KindVotes {
        match vote_type {
            VoteType::Prevote => &mut self.prevotes,
            VoteType::Precommit => &mut self.precommits,
            VoteType::Commit => &mut self.commits,
        }
    }

    /// Records a vote carrying the given voting power.
    ///
    /// The caller has already checked validator membership and the
    /// signature. Returns [`ConsensusError::Equivocation`] when the same
    /// validator already voted this kind for a different hash; the
    /// first-seen vote is retained.
    pub fn add_vote(&mut self, vote: Vote, power: u128) -> Result<VoteOutcome> {
        let kind = self.kind_mut(vote.vote_type);
        if let Some(existing) = kind.by_validator.get(&vote.validator) {
            if existing.block_hash == vote.block_hash {
                return Ok(VoteOutcome::Duplicate);
            }
            return Err(ConsensusError::Equivocation {
                validator: vote.validator,
                height: vote.height,
                round: vote.round,
                first: existing.block_hash,
                second: vote.block_hash,
            });
        }

        *kind.power_by_hash.entry(vote.block_hash).or_insert(0) += power;
        kind.total_power += power;
        kind.by_validator.insert(vote.validator, vote);
        Ok(VoteOutcome::Added)
    }

    /// Voting power behind a specific hash for a vote kind.
    pub fn power_for(&self, vote_type: VoteType, hash: &H256) -> u128 {
        self.kind(vote_type)
            .power_by_hash
            .get(hash)
            .copied()
            .unwrap_or(0)
    }

    /// Total voting power that has voted this kind, any hash.
    pub fn total_power(&self, vote_type: VoteType) -> u128 {
        self.kind(vote_type).total_power
    }

    /// The hash (if any) whose power meets the given threshold.
    ///
    /// Includes the nil hash; a nil quorum drives view changes.
    pub fn quorum_hash(&self, vote_type: VoteType, threshold: u128) -> Option<H256> {
        self.kind(vote_type)
            .power_by_hash
            .iter()
            .find(|(_, power)| **power >= threshold)
            .map(|(hash, _)| *hash)
    }

    /// All votes of a kind for a specific hash.
    pub fn votes_for(&self, vote_type: VoteType, hash: &H256) -> Vec<Vote> {
        self.kind(vote_type)
            .by_validator
            .values()
            .filter(|v| v.block_hash == *hash)
            .cloned()
            .collect()
    }

    /// Number of validators that voted this kind.
    pub fn voter_count(&self, vote_type: VoteType) -> usize {
        self.kind(vote_type).by_validator.len()
    }
}

/// All vote sets for the height currently being decided, keyed by round.
#[derive(Debug, Default)]
pub struct HeightVotes {
    height: u64,
    rounds: HashMap<u64, RoundVotes>,
}

impl HeightVotes {
    /// Empty vote tracking for a height.
    pub fn new(height: u64) -> Self {
        Self {
            height,
            rounds: HashMap::new(),
        }
    }

    /// The height this tracker covers.
    pub fn height(&self) -> u64 {
        self.height
    }

    /// Vote set for a round, created on first use.
    pub fn round_mut(&mut self, round: u64) -> &mut RoundVotes {
        self.rounds.entry(round).or_default()
    }

    /// Vote set for a round, if any vote arrived for it.
    pub fn round(&self, round: u64) -> Option<&RoundVotes> {
        self.rounds.get(&round)
    }
}
