/*
    Copyright © 2024, TenderBFT Contributors
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The consensus state machine: the thread that drives a replica through heights, rounds and
//! steps, processing messages and timeout expiries one at a time.
//!
//! ## Single-threaded core
//!
//! All consensus state lives on this thread. The poller thread and the timeout scheduler thread
//! only enqueue inputs; every state transition happens here, sequentially, which is what makes
//! the write-ahead-log discipline sound: an input is appended to the WAL and flushed *before*
//! the state machine acts on it, so replaying the log after a crash deterministically rebuilds
//! the state the replica held when it went down.
//!
//! ## Own messages
//!
//! The replica's own proposals and votes go through the same pipeline as everyone else's: they
//! are pushed onto an internal queue, logged, and only then broadcast and processed. A vote that
//! was never logged is never sent, so a restarting replica cannot forget a vote it cast and sign
//! a conflicting one.

use std::collections::{BTreeMap, VecDeque};
use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::app::{App, Mempool};
use crate::crypto::{address_of, SignatureScheme};
use crate::error::{FatalError, ProtocolError, WalError};
use crate::events::*;
use crate::evidence::EvidenceReporter;
use crate::messages::{
    BlockPartMessage, ConsensusMessage, Proposal, SignedMessage, Vote, VoteType,
};
use crate::networking::Network;
use crate::round_state::{RoundState, RoundStateCamera, Step};
use crate::timeout::{TimeoutInfo, TimeoutScheduler};
use crate::types::{Address, BlockHeight, BlockId, ChainID, PartSet, Round};
use crate::validator_set::ValidatorSet;
use crate::vote_set::{AddVoteOutcome, HeightVoteSet};
use crate::wal::{WalEntry, WalRecord, WalStore};

// Messages for future rounds of the current height are buffered until the replica enters their
// round, up to this many.
const ROUND_MSG_BUFFER_CAPACITY: usize = 1024;

pub(crate) struct ConsensusStateMachine<S, A, M, E, N, W>
where
    S: SignatureScheme,
    A: App,
    M: Mempool,
    E: EvidenceReporter,
    N: Network,
    W: WalStore,
{
    chain_id: ChainID,
    max_block_bytes: usize,

    scheme: S,
    own_address: Address,

    app: A,
    mempool: M,
    evidence_reporter: E,
    network: N,
    wal: W,

    validator_set: ValidatorSet,
    rs: RoundState,
    hvs: HeightVoteSet,
    camera: RoundStateCamera,

    scheduler: TimeoutScheduler,
    // Own messages awaiting the log-then-broadcast-then-process pipeline.
    own_queue: VecDeque<ConsensusMessage>,
    // Proposals and block parts for future rounds of the current height.
    round_buffer: BTreeMap<Round, Vec<ConsensusMessage>>,
    round_buffer_len: usize,

    event_publisher: Option<Sender<Event>>,

    // While replaying the WAL, all effects (network sends, WAL appends, timers, events, evidence
    // reports) are suppressed. Block application is not: replay re-invokes the idempotent
    // `App::apply_block` so that the validator set changes applied blocks carried are
    // reconstructed too.
    replaying: bool,
}

impl<S, A, M, E, N, W> ConsensusStateMachine<S, A, M, E, N, W>
where
    S: SignatureScheme,
    A: App,
    M: Mempool,
    E: EvidenceReporter,
    N: Network,
    W: WalStore,
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        chain_id: ChainID,
        initial_height: BlockHeight,
        max_block_bytes: usize,
        scheme: S,
        app: A,
        mempool: M,
        evidence_reporter: E,
        network: N,
        wal: W,
        validator_set: ValidatorSet,
        camera: RoundStateCamera,
        scheduler: TimeoutScheduler,
        event_publisher: Option<Sender<Event>>,
    ) -> ConsensusStateMachine<S, A, M, E, N, W> {
        let own_address = address_of(&scheme.public());
        let proposer = validator_set.proposer_at(initial_height, 0).address;
        ConsensusStateMachine {
            chain_id,
            max_block_bytes,
            scheme,
            own_address,
            app,
            mempool,
            evidence_reporter,
            network,
            wal,
            validator_set,
            rs: RoundState::new(initial_height, proposer),
            hvs: HeightVoteSet::new(chain_id, initial_height),
            camera,
            scheduler,
            own_queue: VecDeque::new(),
            round_buffer: BTreeMap::new(),
            round_buffer_len: 0,
            event_publisher,
            replaying: false,
        }
    }

    /// Replay the WAL, then process inputs until `shutdown_signal` fires or a fatal error occurs.
    pub(crate) fn execute(
        mut self,
        messages: Receiver<ConsensusMessage>,
        timeouts: Receiver<TimeoutInfo>,
        shutdown_signal: Receiver<()>,
    ) {
        if let Err(fatal) = self.start() {
            log::error!("consensus halted: {}", fatal);
            return;
        }

        loop {
            match shutdown_signal.try_recv() {
                Ok(()) => return,
                Err(TryRecvError::Empty) => (),
                Err(TryRecvError::Disconnected) => {
                    panic!("Consensus thread disconnected from main thread")
                }
            }

            let result = if let Some(own) = self.pop_own() {
                self.process_own_message(own)
            } else {
                match messages.try_recv() {
                    Ok(message) => self.process_message(message),
                    Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {
                        match timeouts.try_recv() {
                            Ok(info) => self.process_timeout(info),
                            Err(_) => {
                                thread::yield_now();
                                Ok(())
                            }
                        }
                    }
                }
            };

            if let Err(fatal) = result {
                log::error!("consensus halted: {}", fatal);
                return;
            }
        }
    }

    fn start(&mut self) -> Result<(), FatalError> {
        let records = self.wal.records().map_err(FatalError::Wal)?;
        if records.is_empty() {
            self.enter_round(0)?;
            return Ok(());
        }

        self.replaying = true;
        self.enter_round(0)?;
        for record in records {
            match record.entry {
                WalEntry::Message(message) => self.dispatch_message(message)?,
                WalEntry::Timeout(info) => self.dispatch_timeout(info)?,
                // Position markers are informational; replay reconstructs the position from the
                // inputs themselves.
                WalEntry::NewStep { .. } | WalEntry::EndHeight(_) => (),
            }
            // Own messages enqueued during replay were already logged before the crash, so they
            // re-enter the pipeline directly.
            while let Some(own) = self.pop_own() {
                self.dispatch_message(own)?;
            }
        }
        self.replaying = false;

        self.rearm_after_replay();
        Ok(())
    }

    // After replay, the timer guarding the current step must be armed afresh. The Prevote and
    // Precommit steps normally rely on incoming votes for progress, but votes this replica
    // received before the crash will not be retransmitted, so they get the corresponding wait
    // timer as a liveness backstop: worst case, the round dies to nil and the next round's fresh
    // messages restore progress.
    fn rearm_after_replay(&mut self) {
        let step_timer = match self.rs.step {
            Step::NewHeight => Some(Step::NewHeight),
            Step::NewRound | Step::Propose => Some(Step::Propose),
            Step::Prevote | Step::PrevoteWait => Some(Step::PrevoteWait),
            Step::Precommit | Step::PrecommitWait => Some(Step::PrecommitWait),
            Step::Commit => None,
        };
        if let Some(step) = step_timer {
            self.scheduler.arm(self.rs.height, self.rs.round, step);
        }
    }

    fn pop_own(&mut self) -> Option<ConsensusMessage> {
        self.own_queue.pop_front()
    }

    // An own message: log it, make it durable, broadcast it, then process it like any other.
    fn process_own_message(&mut self, message: ConsensusMessage) -> Result<(), FatalError> {
        self.log_input(WalEntry::Message(message.clone()))?;
        self.network.broadcast(message.clone());
        self.dispatch_message(message)
    }

    fn process_message(&mut self, message: ConsensusMessage) -> Result<(), FatalError> {
        // Cheap pre-filters, applied before the message is logged.
        if message.chain_id() != self.chain_id || message.height() != self.rs.height {
            return Ok(());
        }

        self.log_input(WalEntry::Message(message.clone()))?;
        self.dispatch_message(message)
    }

    fn process_timeout(&mut self, info: TimeoutInfo) -> Result<(), FatalError> {
        if !info.is_relevant(self.rs.height, self.rs.round, self.rs.step) {
            return Ok(());
        }

        self.log_input(WalEntry::Timeout(info))?;
        self.dispatch_timeout(info)
    }

    fn log_input(&mut self, entry: WalEntry) -> Result<(), WalError> {
        if self.replaying {
            return Ok(());
        }
        self.wal.append(&WalRecord {
            time_millis: now_millis(),
            entry,
        })?;
        self.wal.flush()
    }

    fn dispatch_message(&mut self, message: ConsensusMessage) -> Result<(), FatalError> {
        // Height may have advanced since the message was queued or logged.
        if message.height() != self.rs.height {
            return Ok(());
        }

        // Buffer proposals and parts for rounds this replica has not entered yet, or that arrive
        // during the rest period before the height's first round.
        if message.round() > self.rs.round || self.rs.step == Step::NewHeight {
            match &message {
                ConsensusMessage::Vote(_) => (),
                ConsensusMessage::Proposal(_) | ConsensusMessage::BlockPart(_) => {
                    self.buffer_for_round(message);
                    return Ok(());
                }
            }
        }

        let outcome = match message {
            ConsensusMessage::Proposal(proposal) => self.on_proposal(proposal),
            ConsensusMessage::BlockPart(block_part) => self.on_block_part(block_part),
            ConsensusMessage::Vote(vote) => return self.on_vote(vote),
        };
        match outcome {
            // The proposed block just became complete: act on it.
            Ok(true) => self.on_complete_proposal()?,
            Ok(false) => (),
            Err(protocol_error) => log::debug!("dropped message: {}", protocol_error),
        }
        Ok(())
    }

    fn buffer_for_round(&mut self, message: ConsensusMessage) {
        if self.round_buffer_len >= ROUND_MSG_BUFFER_CAPACITY {
            return;
        }
        self.round_buffer
            .entry(message.round())
            .or_default()
            .push(message);
        self.round_buffer_len += 1;
    }

    fn on_proposal(&mut self, proposal: Proposal) -> Result<bool, ProtocolError> {
        if proposal.round < self.rs.round {
            return Err(ProtocolError::StaleRound {
                current: self.rs.round,
                got: proposal.round,
            });
        }
        if self.rs.proposal.is_some() {
            return Err(ProtocolError::DuplicateProposal);
        }

        let proposer = self
            .validator_set
            .validator(&self.rs.proposer)
            .ok_or(ProtocolError::UnknownValidator)?;
        if !proposal.is_correct::<S>(&proposer.public_key) {
            return Err(ProtocolError::NotProposer);
        }

        self.publish(Event::ReceiveProposal(ReceiveProposalEvent {
            timestamp: SystemTime::now(),
            proposal: proposal.clone(),
        }));

        self.rs.proposal_parts = Some(PartSet::empty(proposal.block_id.parts));
        self.rs.proposal = Some(proposal);
        self.try_complete_proposal()
    }

    fn on_block_part(&mut self, block_part: BlockPartMessage) -> Result<bool, ProtocolError> {
        if block_part.round != self.rs.round {
            return Err(ProtocolError::StaleRound {
                current: self.rs.round,
                got: block_part.round,
            });
        }
        let parts = self
            .rs
            .proposal_parts
            .as_mut()
            .ok_or(ProtocolError::UnexpectedBlockPart)?;
        if !parts.add_part(block_part.part) {
            return Ok(false);
        }
        self.try_complete_proposal()
    }

    // If all parts of the accepted proposal have arrived, reassemble and check the block. Returns
    // whether the proposed block just became available.
    fn try_complete_proposal(&mut self) -> Result<bool, ProtocolError> {
        if self.rs.proposal_block.is_some() {
            return Ok(false);
        }
        let (proposal, parts) = match (&self.rs.proposal, &self.rs.proposal_parts) {
            (Some(proposal), Some(parts)) if parts.is_complete() => (proposal, parts),
            _ => return Ok(false),
        };

        let block = parts.assemble().ok_or(ProtocolError::BlockMismatch)?;
        if block.hash != proposal.block_id.hash || block.height != self.rs.height {
            return Err(ProtocolError::BlockMismatch);
        }
        self.rs.proposal_block = Some(block);
        Ok(true)
    }

    // The proposed block became available: prevote on it if the replica was waiting to, or
    // finalize it if it already committed.
    fn on_complete_proposal(&mut self) -> Result<(), FatalError> {
        match self.rs.step {
            Step::Propose => self.prevote_decision(),
            Step::Commit => self.try_finalize(),
            _ => Ok(()),
        }
    }

    fn on_vote(&mut self, vote: Vote) -> Result<(), FatalError> {
        let vote_round = vote.round;
        let vote_type = vote.vote_type;

        let outcome = match self.hvs.add_vote::<S>(vote.clone(), &self.validator_set) {
            Ok(outcome) => outcome,
            Err(protocol_error) => {
                log::debug!("dropped vote: {}", protocol_error);
                return Ok(());
            }
        };

        self.publish(Event::ReceiveVote(ReceiveVoteEvent {
            timestamp: SystemTime::now(),
            vote,
        }));

        match outcome {
            AddVoteOutcome::Duplicate => return Ok(()),
            AddVoteOutcome::Conflict(equivocation) => {
                self.publish(Event::Equivocation(EquivocationEvent {
                    timestamp: SystemTime::now(),
                    evidence: (*equivocation).clone(),
                }));
                if !self.replaying {
                    self.evidence_reporter.report(*equivocation);
                }
                return Ok(());
            }
            AddVoteOutcome::Added => (),
        }

        // A 2/3-any quorum voting at a future round proves this replica's round is behind.
        if vote_round > self.rs.round
            && self
                .hvs
                .round_has_two_thirds_any(vote_round, &self.validator_set)
        {
            self.enter_round(vote_round)?;
        }

        match vote_type {
            VoteType::Prevote => self.check_prevotes(vote_round)?,
            VoteType::Precommit => self.check_precommits(vote_round)?,
        }
        Ok(())
    }

    fn check_prevotes(&mut self, round: Round) -> Result<(), FatalError> {
        let majority = self.hvs.two_thirds_majority(round, VoteType::Prevote);

        // A polka at any round can release a stale lock: 2/3 of validators prevoting something
        // else at a later round proves the locked block cannot have committed at the locked
        // round.
        if let Some(target) = majority {
            if let (Some(locked_round), Some(locked_block)) =
                (self.rs.locked_round, &self.rs.locked_block)
            {
                if round > locked_round && target != Some(locked_block.block_id()) {
                    self.rs.locked_round = None;
                    self.rs.locked_block = None;
                }
            }

            // Track the most recent block known to have gathered a polka, for re-proposal.
            if let Some(block_id) = target {
                if round == self.rs.round {
                    if let Some(block) = &self.rs.proposal_block {
                        if block.block_id() == block_id
                            && self.rs.valid_round.map_or(true, |vr| round > vr)
                        {
                            self.rs.valid_round = Some(round);
                            self.rs.valid_block = Some(block.clone());
                        }
                    }
                }
            }
        }

        if round != self.rs.round {
            return Ok(());
        }

        match self.rs.step {
            Step::Prevote => {
                if majority.is_some() {
                    self.enter_precommit()?;
                } else if self
                    .hvs
                    .has_two_thirds_any(round, VoteType::Prevote, &self.validator_set)
                {
                    self.set_step(Step::PrevoteWait)?;
                    self.arm(Step::PrevoteWait);
                }
            }
            Step::PrevoteWait => {
                if majority.is_some() {
                    self.enter_precommit()?;
                }
            }
            _ => (),
        }
        Ok(())
    }

    fn check_precommits(&mut self, round: Round) -> Result<(), FatalError> {
        if let Some(Some(block_id)) = self.hvs.two_thirds_majority(round, VoteType::Precommit) {
            // 2/3 precommits for a block commit it, whatever the replica's own step is.
            return self.enter_commit(round, block_id);
        }

        if round != self.rs.round {
            return Ok(());
        }

        match self.rs.step {
            Step::Precommit => {
                match self.hvs.two_thirds_majority(round, VoteType::Precommit) {
                    // A nil precommit majority buries the round.
                    Some(None) => self.enter_round(round + 1)?,
                    _ => {
                        if self.hvs.has_two_thirds_any(
                            round,
                            VoteType::Precommit,
                            &self.validator_set,
                        ) {
                            self.set_step(Step::PrecommitWait)?;
                            self.arm(Step::PrecommitWait);
                        }
                    }
                }
            }
            Step::PrecommitWait => {
                if let Some(None) = self.hvs.two_thirds_majority(round, VoteType::Precommit) {
                    self.enter_round(round + 1)?;
                }
            }
            _ => (),
        }
        Ok(())
    }

    fn dispatch_timeout(&mut self, info: TimeoutInfo) -> Result<(), FatalError> {
        if !info.is_relevant(self.rs.height, self.rs.round, self.rs.step) {
            return Ok(());
        }

        self.publish(Event::TimeoutExpired(TimeoutExpiredEvent {
            timestamp: SystemTime::now(),
            height: info.height,
            round: info.round,
            step: info.step,
        }));

        match info.step {
            // No (complete) proposal arrived in time: prevote nil.
            Step::Propose => self.enter_prevote(None)?,
            // 2/3 prevoted but no polka formed in time: precommit nil without touching the lock.
            Step::PrevoteWait => self.enter_precommit()?,
            // 2/3 precommitted but nothing committed: the round is dead, move on.
            Step::PrecommitWait => self.enter_round(self.rs.round + 1)?,
            // The post-commit rest period ended: start the new height.
            Step::NewHeight => self.enter_round(0)?,
            _ => (),
        }
        Ok(())
    }

    fn enter_round(&mut self, round: Round) -> Result<(), FatalError> {
        let proposer = self.validator_set.proposer_at(self.rs.height, round).address;
        self.rs.reset_for_round(round, proposer);
        self.set_step(Step::NewRound)?;

        self.publish(Event::StartRound(StartRoundEvent {
            timestamp: SystemTime::now(),
            height: self.rs.height,
            round,
            proposer,
        }));

        // Replay messages that were waiting for this round. Messages for rounds now in the past
        // are dropped with them.
        let buffered = std::mem::take(&mut self.round_buffer);
        self.round_buffer_len = 0;
        for (buffered_round, messages) in buffered {
            if buffered_round == round {
                for message in messages {
                    self.dispatch_message(message)?;
                }
            } else if buffered_round > round {
                for message in messages {
                    self.buffer_for_round(message);
                }
            }
        }

        if self.rs.step != Step::NewRound {
            // A buffered message already advanced the round's step.
            return Ok(());
        }

        self.set_step(Step::Propose)?;
        if proposer == self.own_address && self.validator_set.contains(&self.own_address) {
            self.propose();
        } else if self.rs.proposal_block.is_some() {
            // A buffered proposal arrived complete during the drain above.
            self.prevote_decision()?;
        } else {
            self.arm(Step::Propose);
        }
        Ok(())
    }

    // This replica is the round's proposer. Re-propose the valid block if one is known, else let
    // the application cut a fresh block from the mempool.
    fn propose(&mut self) {
        if self.replaying {
            // Replay reprocesses the logged copy of the original proposal instead.
            return;
        }

        let (block, pol_round) = match (&self.rs.valid_block, self.rs.valid_round) {
            (Some(block), Some(valid_round)) => (block.clone(), Some(valid_round)),
            _ => {
                let txs = self.mempool.reap_txs(self.rs.height, self.max_block_bytes);
                (self.app.propose_block(self.rs.height, txs), None)
            }
        };

        let parts = PartSet::from_block(&block);
        let proposal = Proposal::new(
            &self.scheme,
            self.chain_id,
            self.rs.height,
            self.rs.round,
            BlockId {
                hash: block.hash,
                parts: parts.header(),
            },
            pol_round,
        );

        self.publish(Event::Propose(ProposeEvent {
            timestamp: SystemTime::now(),
            proposal: proposal.clone(),
        }));

        self.own_queue
            .push_back(ConsensusMessage::Proposal(proposal));
        for part in parts.parts() {
            self.own_queue
                .push_back(ConsensusMessage::BlockPart(BlockPartMessage {
                    chain_id: self.chain_id,
                    height: self.rs.height,
                    round: self.rs.round,
                    part: part.clone(),
                }));
        }
    }

    // The complete proposed block is in hand and no prevote has been cast yet: decide what to
    // prevote.
    fn prevote_decision(&mut self) -> Result<(), FatalError> {
        let (proposal, block) = match (&self.rs.proposal, &self.rs.proposal_block) {
            (Some(proposal), Some(block)) => (proposal.clone(), block.clone()),
            _ => return Ok(()),
        };
        let block_id = block.block_id();

        let target = match (&self.rs.locked_block, self.rs.locked_round) {
            (Some(locked_block), Some(locked_round)) => {
                if locked_block.block_id() == block_id {
                    Some(block_id)
                } else if let Some(pol_round) = proposal.pol_round {
                    // A proof-of-lock round newer than our lock releases us to prevote the
                    // proposal, if the claimed polka is actually in our vote sets.
                    let polka_observed = self.hvs.two_thirds_majority(pol_round, VoteType::Prevote)
                        == Some(Some(block_id));
                    if pol_round > locked_round && polka_observed {
                        Some(block_id)
                    } else {
                        None
                    }
                } else {
                    None
                }
            }
            _ => {
                if self.app.validate_block(&block) {
                    Some(block_id)
                } else {
                    None
                }
            }
        };

        self.enter_prevote(target)
    }

    fn enter_prevote(&mut self, target: Option<BlockId>) -> Result<(), FatalError> {
        self.set_step(Step::Prevote)?;
        self.cast_vote(VoteType::Prevote, target);
        // Prevotes for this round may already have formed a majority.
        self.check_prevotes(self.rs.round)
    }

    // Move to the precommit step, precommitting the polka target if there is one.
    fn enter_precommit(&mut self) -> Result<(), FatalError> {
        let round = self.rs.round;
        let target = match self.hvs.two_thirds_majority(round, VoteType::Prevote) {
            // Polka for a block this replica holds in full: lock on it and precommit it.
            Some(Some(block_id)) => {
                let full_block = self
                    .rs
                    .proposal_block
                    .as_ref()
                    .filter(|block| block.block_id() == block_id)
                    .cloned();
                match full_block {
                    Some(block) => {
                        self.rs.locked_round = Some(round);
                        self.rs.locked_block = Some(block);
                        Some(block_id)
                    }
                    // The polka's block never fully arrived here; precommit nil.
                    None => None,
                }
            }
            // Polka for nil: drop any lock and precommit nil.
            Some(None) => {
                self.rs.locked_round = None;
                self.rs.locked_block = None;
                None
            }
            // No polka (prevote-wait expired): precommit nil, keep the lock.
            None => None,
        };

        self.set_step(Step::Precommit)?;
        self.cast_vote(VoteType::Precommit, target);
        self.check_precommits(round)
    }

    fn cast_vote(&mut self, vote_type: VoteType, block_id: Option<BlockId>) {
        if !self.validator_set.contains(&self.own_address) || self.replaying {
            return;
        }

        let vote = Vote::new(
            &self.scheme,
            self.chain_id,
            self.rs.height,
            self.rs.round,
            vote_type,
            block_id,
            self.own_address,
            now_millis(),
        );

        self.publish(Event::Vote(VoteEvent {
            timestamp: SystemTime::now(),
            vote: vote.clone(),
        }));

        self.own_queue.push_back(ConsensusMessage::Vote(vote));
    }

    // A block gathered 2/3 precommits at `round`. Finalize it if its bytes are in hand, else wait
    // in the Commit step for the remaining parts.
    fn enter_commit(&mut self, round: Round, block_id: BlockId) -> Result<(), FatalError> {
        if self.rs.step == Step::Commit {
            return Ok(());
        }

        // Make sure the commit round's proposal state is the one in hand.
        if round != self.rs.round {
            let proposer = self.validator_set.proposer_at(self.rs.height, round).address;
            self.rs.reset_for_round(round, proposer);
        }
        self.set_step(Step::Commit)?;

        // The locked block is the committed block whenever this replica took part in the commit.
        if self.rs.proposal_block.is_none() {
            if let Some(locked_block) = &self.rs.locked_block {
                if locked_block.block_id() == block_id {
                    self.rs.proposal_block = Some(locked_block.clone());
                }
            }
        }
        if self.rs.proposal_parts.is_none() {
            self.rs.proposal_parts = Some(PartSet::empty(block_id.parts));
        }

        self.try_finalize()
    }

    fn try_finalize(&mut self) -> Result<(), FatalError> {
        let block = match &self.rs.proposal_block {
            Some(block) => block.clone(),
            None => return Ok(()),
        };
        let height = self.rs.height;
        let round = self.rs.round;

        // Replay re-applies blocks the first life already applied; the App contract makes
        // application idempotent per height, returning the recorded response, so the validator
        // set updates the block produced come back too.
        let response = self.app.apply_block(&block).map_err(FatalError::Application)?;

        if !self.replaying {
            self.wal
                .append(&WalRecord {
                    time_millis: now_millis(),
                    entry: WalEntry::EndHeight(height),
                })
                .map_err(FatalError::Wal)?;
            self.wal.flush().map_err(FatalError::Wal)?;
        }

        self.publish(Event::FinalizeBlock(FinalizeBlockEvent {
            timestamp: SystemTime::now(),
            height,
            round,
            block_hash: block.hash,
        }));

        self.advance_height(response.validator_set_updates)
    }

    fn advance_height(
        &mut self,
        updates: Option<crate::validator_set::ValidatorSetUpdates>,
    ) -> Result<(), FatalError> {
        let finalized_height = self.rs.height;
        let next_height = finalized_height + 1;

        self.validator_set = match &updates {
            Some(updates) if !updates.is_empty() => {
                let next = self
                    .validator_set
                    .apply_updates(updates, next_height)
                    .map_err(|e| FatalError::InvalidValidatorSet {
                        height: finalized_height,
                        reason: e.to_string(),
                    })?;
                self.publish(Event::UpdateValidatorSet(UpdateValidatorSetEvent {
                    timestamp: SystemTime::now(),
                    cause_height: finalized_height,
                    validator_set_updates: updates.clone(),
                }));
                if !self.replaying {
                    self.network.update_validator_set(updates.clone());
                }
                next
            }
            _ => self.validator_set.advanced(next_height),
        };

        let proposer = self.validator_set.proposer_at(next_height, 0).address;
        self.rs = RoundState::new(next_height, proposer);
        self.hvs = HeightVoteSet::new(self.chain_id, next_height);
        self.round_buffer.clear();
        self.round_buffer_len = 0;
        self.set_step(Step::NewHeight)?;

        // Rest between heights so that slower replicas' precommits are collected, then start.
        self.arm(Step::NewHeight);
        Ok(())
    }

    fn set_step(&mut self, step: Step) -> Result<(), FatalError> {
        self.rs.step = step;
        if !self.replaying {
            self.wal
                .append(&WalRecord {
                    time_millis: now_millis(),
                    entry: WalEntry::NewStep {
                        height: self.rs.height,
                        round: self.rs.round,
                        step,
                    },
                })
                .map_err(FatalError::Wal)?;
            self.wal.flush().map_err(FatalError::Wal)?;
        }
        self.camera.update(&self.rs);
        Ok(())
    }

    fn arm(&self, step: Step) {
        if !self.replaying {
            self.scheduler.arm(self.rs.height, self.rs.round, step);
        }
    }

    fn publish(&self, event: Event) {
        if !self.replaying {
            Event::publish(&self.event_publisher, event);
        }
    }
}

pub(crate) fn start_consensus<S, A, M, E, N, W>(
    state_machine: ConsensusStateMachine<S, A, M, E, N, W>,
    messages: Receiver<ConsensusMessage>,
    timeouts: Receiver<TimeoutInfo>,
    shutdown_signal: Receiver<()>,
) -> thread::JoinHandle<()>
where
    S: SignatureScheme,
    A: App,
    M: Mempool,
    E: EvidenceReporter,
    N: Network,
    W: WalStore,
{
    thread::spawn(move || state_machine.execute(messages, timeouts, shutdown_signal))
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
