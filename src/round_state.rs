/*
    Copyright © 2024, TenderBFT Contributors
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The state a replica keeps about its position in the consensus protocol, and a thread-safe
//! camera for observing it from outside the consensus thread.

use std::sync::{Arc, Mutex};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::messages::Proposal;
use crate::types::{Address, Block, BlockHeight, PartSet, Round};

/// The steps a round passes through. Ordered: a replica's step only moves forward within a round,
/// and comparisons like `step <= Step::Propose` decide whether a timeout is still relevant.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, BorshSerialize, BorshDeserialize)]
pub enum Step {
    /// Waiting out the commit timeout before starting the next height.
    NewHeight,
    /// A new round has been entered but not yet acted on.
    NewRound,
    /// Waiting for the round's proposal (and its block parts).
    Propose,
    /// Prevote cast; gathering prevotes.
    Prevote,
    /// Saw 2/3-any prevotes without a majority; waiting briefly for a polka.
    PrevoteWait,
    /// Precommit cast; gathering precommits.
    Precommit,
    /// Saw 2/3-any precommits without a majority; waiting briefly before the next round.
    PrecommitWait,
    /// A block gathered 2/3 precommits and is being finalized.
    Commit,
}

/// Everything the replica knows about the consensus instance it is currently participating in.
///
/// `locked_*` and `valid_*` persist across rounds of a height and reset at height boundaries.
/// The lock is the safety-critical half: once a replica precommits a block it refuses to prevote
/// anything else until it observes a newer polka. The valid value is the liveness half: the most
/// recent block known to have gathered a polka, re-proposed when this replica becomes proposer.
pub struct RoundState {
    pub height: BlockHeight,
    pub round: Round,
    pub step: Step,
    /// The address of the proposer of the current (height, round).
    pub proposer: Address,

    /// The proposal accepted for the current round, if one has arrived.
    pub proposal: Option<Proposal>,
    /// The proposed block, once all its parts have arrived and reassembly succeeded.
    pub proposal_block: Option<Block>,
    /// Accumulates gossipped parts of the proposed block.
    pub proposal_parts: Option<PartSet>,

    pub locked_round: Option<Round>,
    pub locked_block: Option<Block>,
    pub valid_round: Option<Round>,
    pub valid_block: Option<Block>,
}

impl RoundState {
    pub fn new(height: BlockHeight, proposer: Address) -> RoundState {
        RoundState {
            height,
            round: 0,
            step: Step::NewHeight,
            proposer,
            proposal: None,
            proposal_block: None,
            proposal_parts: None,
            locked_round: None,
            locked_block: None,
            valid_round: None,
            valid_block: None,
        }
    }

    /// Clear the per-round fields on entering `round`. Locks and valid values survive.
    pub fn reset_for_round(&mut self, round: Round, proposer: Address) {
        self.round = round;
        self.step = Step::NewRound;
        self.proposer = proposer;
        self.proposal = None;
        self.proposal_block = None;
        self.proposal_parts = None;
    }
}

/// A summary of a [RoundState], cheap to copy out to observers.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct RoundStateSnapshot {
    pub height: BlockHeight,
    pub round: Round,
    pub step: Step,
    pub locked_round: Option<Round>,
    pub valid_round: Option<Round>,
}

/// Takes snapshots of the consensus thread's [RoundState] so that other threads can observe the
/// replica's progress without participating in consensus.
#[derive(Clone)]
pub struct RoundStateCamera {
    snapshot: Arc<Mutex<RoundStateSnapshot>>,
}

impl RoundStateCamera {
    pub fn new(height: BlockHeight) -> RoundStateCamera {
        RoundStateCamera {
            snapshot: Arc::new(Mutex::new(RoundStateSnapshot {
                height,
                round: 0,
                step: Step::NewHeight,
                locked_round: None,
                valid_round: None,
            })),
        }
    }

    pub(crate) fn update(&self, round_state: &RoundState) {
        let mut snapshot = self.snapshot.lock().unwrap();
        *snapshot = RoundStateSnapshot {
            height: round_state.height,
            round: round_state.round,
            step: round_state.step,
            locked_round: round_state.locked_round,
            valid_round: round_state.valid_round,
        };
    }

    pub fn snapshot(&self) -> RoundStateSnapshot {
        *self.snapshot.lock().unwrap()
    }
}
