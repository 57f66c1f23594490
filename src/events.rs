/*
    Copyright © 2024, TenderBFT Contributors
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions of the engine's events for event handling and logging.
//! Note: an event for a given action indicates that the action has been completed.

use std::sync::mpsc::Sender;
use std::time::SystemTime;

use crate::evidence::Equivocation;
use crate::messages::{Proposal, Vote};
use crate::round_state::Step;
use crate::types::{Address, BlockHeight, CryptoHash, Round};
use crate::validator_set::ValidatorSetUpdates;

pub enum Event {
    // Progress events.
    StartRound(StartRoundEvent),
    TimeoutExpired(TimeoutExpiredEvent),
    // Events that involve broadcasting a consensus message.
    Propose(ProposeEvent),
    Vote(VoteEvent),
    // Events that involve receiving a consensus message.
    ReceiveProposal(ReceiveProposalEvent),
    ReceiveVote(ReceiveVoteEvent),
    // Events that change persistent state.
    FinalizeBlock(FinalizeBlockEvent),
    UpdateValidatorSet(UpdateValidatorSetEvent),
    // Misbehavior.
    Equivocation(EquivocationEvent),
}

impl Event {
    pub(crate) fn publish(event_publisher: &Option<Sender<Event>>, event: Event) {
        if let Some(event_publisher) = event_publisher {
            event_publisher.send(event).unwrap()
        }
    }
}

pub struct StartRoundEvent {
    pub timestamp: SystemTime,
    pub height: BlockHeight,
    pub round: Round,
    pub proposer: Address,
}

pub struct TimeoutExpiredEvent {
    pub timestamp: SystemTime,
    pub height: BlockHeight,
    pub round: Round,
    pub step: Step,
}

pub struct ProposeEvent {
    pub timestamp: SystemTime,
    pub proposal: Proposal,
}

pub struct VoteEvent {
    pub timestamp: SystemTime,
    pub vote: Vote,
}

pub struct ReceiveProposalEvent {
    pub timestamp: SystemTime,
    pub proposal: Proposal,
}

pub struct ReceiveVoteEvent {
    pub timestamp: SystemTime,
    pub vote: Vote,
}

pub struct FinalizeBlockEvent {
    pub timestamp: SystemTime,
    pub height: BlockHeight,
    pub round: Round,
    pub block_hash: CryptoHash,
}

pub struct UpdateValidatorSetEvent {
    pub timestamp: SystemTime,
    pub cause_height: BlockHeight,
    pub validator_set_updates: ValidatorSetUpdates,
}

pub struct EquivocationEvent {
    pub timestamp: SystemTime,
    pub evidence: Equivocation,
}
