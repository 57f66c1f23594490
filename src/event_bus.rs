/*
    Copyright © 2024, TenderBFT Contributors
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The thread that receives [events](crate::events) published by the consensus thread and fires
//! the registered handlers for each.

use std::sync::mpsc::Receiver;
use std::sync::mpsc::TryRecvError;
use std::thread;
use std::thread::JoinHandle;

use crate::events::*;

pub(crate) type HandlerPtr<T> = Box<dyn Fn(&T) + Send>;

pub(crate) struct EventHandlers {
    pub(crate) start_round_handlers: Vec<HandlerPtr<StartRoundEvent>>,
    pub(crate) timeout_expired_handlers: Vec<HandlerPtr<TimeoutExpiredEvent>>,
    pub(crate) propose_handlers: Vec<HandlerPtr<ProposeEvent>>,
    pub(crate) vote_handlers: Vec<HandlerPtr<VoteEvent>>,
    pub(crate) receive_proposal_handlers: Vec<HandlerPtr<ReceiveProposalEvent>>,
    pub(crate) receive_vote_handlers: Vec<HandlerPtr<ReceiveVoteEvent>>,
    pub(crate) finalize_block_handlers: Vec<HandlerPtr<FinalizeBlockEvent>>,
    pub(crate) update_validator_set_handlers: Vec<HandlerPtr<UpdateValidatorSetEvent>>,
    pub(crate) equivocation_handlers: Vec<HandlerPtr<EquivocationEvent>>,
}

impl EventHandlers {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        log_events: bool,
        on_start_round: Option<HandlerPtr<StartRoundEvent>>,
        on_timeout_expired: Option<HandlerPtr<TimeoutExpiredEvent>>,
        on_propose: Option<HandlerPtr<ProposeEvent>>,
        on_vote: Option<HandlerPtr<VoteEvent>>,
        on_receive_proposal: Option<HandlerPtr<ReceiveProposalEvent>>,
        on_receive_vote: Option<HandlerPtr<ReceiveVoteEvent>>,
        on_finalize_block: Option<HandlerPtr<FinalizeBlockEvent>>,
        on_update_validator_set: Option<HandlerPtr<UpdateValidatorSetEvent>>,
        on_equivocation: Option<HandlerPtr<EquivocationEvent>>,
    ) -> EventHandlers {
        use crate::logging::Logger;

        fn handlers_of<T: Logger>(
            log_events: bool,
            user_handler: Option<HandlerPtr<T>>,
        ) -> Vec<HandlerPtr<T>> {
            let mut handlers = Vec::new();
            if log_events {
                handlers.push(T::get_logger());
            }
            if let Some(handler) = user_handler {
                handlers.push(handler);
            }
            handlers
        }

        EventHandlers {
            start_round_handlers: handlers_of(log_events, on_start_round),
            timeout_expired_handlers: handlers_of(log_events, on_timeout_expired),
            propose_handlers: handlers_of(log_events, on_propose),
            vote_handlers: handlers_of(log_events, on_vote),
            receive_proposal_handlers: handlers_of(log_events, on_receive_proposal),
            receive_vote_handlers: handlers_of(log_events, on_receive_vote),
            finalize_block_handlers: handlers_of(log_events, on_finalize_block),
            update_validator_set_handlers: handlers_of(log_events, on_update_validator_set),
            equivocation_handlers: handlers_of(log_events, on_equivocation),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.start_round_handlers.is_empty()
            && self.timeout_expired_handlers.is_empty()
            && self.propose_handlers.is_empty()
            && self.vote_handlers.is_empty()
            && self.receive_proposal_handlers.is_empty()
            && self.receive_vote_handlers.is_empty()
            && self.finalize_block_handlers.is_empty()
            && self.update_validator_set_handlers.is_empty()
            && self.equivocation_handlers.is_empty()
    }

    pub fn fire_handlers(&self, event: Event) {
        match event {
            Event::StartRound(start_round_event) => self
                .start_round_handlers
                .iter()
                .for_each(|handler| handler(&start_round_event)),

            Event::TimeoutExpired(timeout_expired_event) => self
                .timeout_expired_handlers
                .iter()
                .for_each(|handler| handler(&timeout_expired_event)),

            Event::Propose(propose_event) => self
                .propose_handlers
                .iter()
                .for_each(|handler| handler(&propose_event)),

            Event::Vote(vote_event) => self
                .vote_handlers
                .iter()
                .for_each(|handler| handler(&vote_event)),

            Event::ReceiveProposal(receive_proposal_event) => self
                .receive_proposal_handlers
                .iter()
                .for_each(|handler| handler(&receive_proposal_event)),

            Event::ReceiveVote(receive_vote_event) => self
                .receive_vote_handlers
                .iter()
                .for_each(|handler| handler(&receive_vote_event)),

            Event::FinalizeBlock(finalize_block_event) => self
                .finalize_block_handlers
                .iter()
                .for_each(|handler| handler(&finalize_block_event)),

            Event::UpdateValidatorSet(update_validator_set_event) => self
                .update_validator_set_handlers
                .iter()
                .for_each(|handler| handler(&update_validator_set_event)),

            Event::Equivocation(equivocation_event) => self
                .equivocation_handlers
                .iter()
                .for_each(|handler| handler(&equivocation_event)),
        }
    }
}

pub(crate) fn start_event_bus(
    event_handlers: EventHandlers,
    event_subscriber: Receiver<Event>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => {
                panic!("event_bus thread disconnected from main thread")
            }
        }

        match event_subscriber.try_recv() {
            Ok(event) => event_handlers.fire_handlers(event),
            Err(TryRecvError::Empty) => thread::yield_now(),
            // The consensus thread dropping its publisher precedes the shutdown signal.
            Err(TryRecvError::Disconnected) => (),
        }
    })
}
