/*
    Copyright © 2024, TenderBFT Contributors
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types that collect votes and detect when they form supermajorities.
//!
//! [VoteSet] tallies one (round, vote type) slot. [HeightVoteSet] owns the vote sets of every
//! round of the current height and is the engine's single entry point for incoming votes: it
//! checks chain, height, membership and signature before any vote reaches a tally.

use std::collections::{BTreeMap, HashMap};

use crate::crypto::SignatureScheme;
use crate::error::ProtocolError;
use crate::evidence::Equivocation;
use crate::messages::{SignedMessage, Vote, VoteType};
use crate::types::{Address, BlockHeight, BlockId, ChainID, Round, TotalPower};
use crate::validator_set::ValidatorSet;

/// The result of adding a vote to a [VoteSet].
#[derive(Debug)]
pub enum AddVoteOutcome {
    /// The vote is new and was tallied.
    Added,
    /// An identical vote from this validator was already tallied.
    Duplicate,
    /// The validator already voted differently in this slot. The original vote stands; the pair
    /// is returned as evidence.
    Conflict(Box<Equivocation>),
}

/// Tallies the votes of a single (round, vote type) slot, keyed by validator address.
///
/// Powers are summed per distinct `Option<BlockId>` target; once any target's tally crosses the
/// 2/3 quorum threshold it is cached as the slot's majority. At most one target can ever cross
/// the threshold, since each validator's power counts once.
pub struct VoteSet {
    votes: HashMap<Address, Vote>,
    tallies: HashMap<Option<BlockId>, TotalPower>,
    total_tally: TotalPower,
    majority: Option<Option<BlockId>>,
}

impl VoteSet {
    pub fn new() -> VoteSet {
        VoteSet {
            votes: HashMap::new(),
            tallies: HashMap::new(),
            total_tally: 0,
            majority: None,
        }
    }

    /// Tally `vote` from a validator with the given `power`. The caller is responsible for having
    /// validated the vote's signature and membership.
    pub fn add_vote(&mut self, vote: Vote, power: u64, validator_set: &ValidatorSet) -> AddVoteOutcome {
        match self.votes.get(&vote.validator) {
            Some(existing) if existing.block_id == vote.block_id => AddVoteOutcome::Duplicate,
            Some(existing) => AddVoteOutcome::Conflict(Box::new(Equivocation {
                validator: vote.validator,
                vote_a: existing.clone(),
                vote_b: vote,
            })),
            None => {
                let tally = self.tallies.entry(vote.block_id).or_insert(0);
                *tally += power as TotalPower;
                if self.majority.is_none() && validator_set.has_quorum(*tally) {
                    self.majority = Some(vote.block_id);
                }
                self.total_tally += power as TotalPower;
                self.votes.insert(vote.validator, vote);
                AddVoteOutcome::Added
            }
        }
    }

    /// The target that gathered a 2/3 supermajority in this slot, if any. `Some(None)` is a
    /// majority for nil.
    pub fn two_thirds_majority(&self) -> Option<Option<BlockId>> {
        self.majority
    }

    /// The sum of the powers of all validators that voted in this slot, across all targets.
    pub fn total_tally(&self) -> TotalPower {
        self.total_tally
    }

    pub fn vote_of(&self, validator: &Address) -> Option<&Vote> {
        self.votes.get(validator)
    }

    pub fn len(&self) -> usize {
        self.votes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.votes.is_empty()
    }
}

impl Default for VoteSet {
    fn default() -> VoteSet {
        VoteSet::new()
    }
}

#[derive(Default)]
struct RoundVotes {
    prevotes: VoteSet,
    precommits: VoteSet,
}

/// Collects every vote of the current height, over all rounds seen so far.
///
/// Votes for rounds ahead of the engine's current round are kept: they are what lets the engine
/// detect that 2/3 of validators have moved on and skip forward.
pub struct HeightVoteSet {
    chain_id: ChainID,
    height: BlockHeight,
    rounds: BTreeMap<Round, RoundVotes>,
}

impl HeightVoteSet {
    pub fn new(chain_id: ChainID, height: BlockHeight) -> HeightVoteSet {
        HeightVoteSet {
            chain_id,
            height,
            rounds: BTreeMap::new(),
        }
    }

    pub fn height(&self) -> BlockHeight {
        self.height
    }

    /// Validate `vote` and route it to its (round, vote type) slot.
    ///
    /// Rejects votes for the wrong chain or height, votes from addresses outside `validator_set`,
    /// and votes whose signature does not verify against the signer's registered public key.
    pub fn add_vote<S: SignatureScheme>(
        &mut self,
        vote: Vote,
        validator_set: &ValidatorSet,
    ) -> Result<AddVoteOutcome, ProtocolError> {
        if vote.chain_id != self.chain_id {
            return Err(ProtocolError::WrongChain {
                expected: self.chain_id,
                got: vote.chain_id,
            });
        }
        if vote.height != self.height {
            return Err(ProtocolError::WrongHeight {
                expected: self.height,
                got: vote.height,
            });
        }

        let validator = validator_set
            .validator(&vote.validator)
            .ok_or(ProtocolError::UnknownValidator)?;
        if !vote.is_correct::<S>(&validator.public_key) {
            return Err(ProtocolError::InvalidSignature);
        }
        let power = validator.power;

        let round_votes = self.rounds.entry(vote.round).or_default();
        let vote_set = match vote.vote_type {
            VoteType::Prevote => &mut round_votes.prevotes,
            VoteType::Precommit => &mut round_votes.precommits,
        };
        Ok(vote_set.add_vote(vote, power, validator_set))
    }

    /// The target that gathered a 2/3 majority of `vote_type` votes at `round`, if any.
    pub fn two_thirds_majority(&self, round: Round, vote_type: VoteType) -> Option<Option<BlockId>> {
        self.vote_set(round, vote_type)?.two_thirds_majority()
    }

    /// Whether 2/3 of the total power has voted `vote_type` at `round`, counting votes for any
    /// target together. A quorum of conflicting votes still proves that 2/3 of validators are
    /// participating in `round`.
    pub fn has_two_thirds_any(
        &self,
        round: Round,
        vote_type: VoteType,
        validator_set: &ValidatorSet,
    ) -> bool {
        match self.vote_set(round, vote_type) {
            Some(vote_set) => validator_set.has_quorum(vote_set.total_tally()),
            None => false,
        }
    }

    /// Whether 2/3 of the total power has voted at `round` in either phase.
    pub fn round_has_two_thirds_any(&self, round: Round, validator_set: &ValidatorSet) -> bool {
        self.has_two_thirds_any(round, VoteType::Prevote, validator_set)
            || self.has_two_thirds_any(round, VoteType::Precommit, validator_set)
    }

    pub fn vote_set(&self, round: Round, vote_type: VoteType) -> Option<&VoteSet> {
        self.rounds.get(&round).map(|votes| match vote_type {
            VoteType::Prevote => &votes.prevotes,
            VoteType::Precommit => &votes.precommits,
        })
    }
}
