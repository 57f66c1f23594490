/*
    Copyright © 2024, TenderBFT Contributors
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Methods to build and run a replica.
//!
//! The engine works to safely replicate a sequence of blocks across multiple processes. In our
//! terminology, these processes are called 'replicas'; the replicas whose keys appear in the
//! validator set with positive power are 'validators', and any others are listeners that follow
//! consensus without weight in it.
//!
//! The key components of this module are:
//! - The builder-pattern interface to construct a [specification of the replica](ReplicaSpec)
//!   with:
//!   1. `ReplicaSpec::builder` to construct a `ReplicaSpecBuilder`,
//!   2. The setters of the `ReplicaSpecBuilder`, and
//!   3. The `ReplicaSpecBuilder::build` method to construct a [ReplicaSpec],
//! - The function to [start](ReplicaSpec::start) a [Replica] given its specification,
//! - [The type](Replica) which keeps the replica alive.
//!
//! ## Starting a replica
//!
//! ```ignore
//! let replica = ReplicaSpec::builder()
//!     .scheme(Ed25519Scheme::new(signing_key))
//!     .app(app)
//!     .mempool(mempool)
//!     .evidence_reporter(evidence_reporter)
//!     .network(network)
//!     .wal(FileWal::open(&wal_path)?)
//!     .initial_validator_set(validator_set)
//!     .configuration(configuration)
//!     .on_finalize_block(|event| println!("finalized height {}", event.height))
//!     .build()
//!     .start();
//! ```

use std::sync::mpsc::{self, Sender};
use std::thread::JoinHandle;

use typed_builder::TypedBuilder;

use crate::app::{App, Mempool};
use crate::crypto::SignatureScheme;
use crate::event_bus::{start_event_bus, EventHandlers, HandlerPtr};
use crate::events::*;
use crate::evidence::EvidenceReporter;
use crate::networking::{start_polling, Network};
use crate::round_state::{RoundStateCamera, RoundStateSnapshot};
use crate::state_machine::{start_consensus, ConsensusStateMachine};
use crate::timeout::{start_scheduler, TimeoutConfig, TimeoutScheduler};
use crate::types::{BlockHeight, ChainID};
use crate::validator_set::ValidatorSet;
use crate::wal::WalStore;

/// Stores the user-defined parameters required to start the replica.
///
/// ## Chain ID
///
/// Each deployment should pick a distinct [ChainID]. It is included in every vote and proposal so
/// that messages for one chain cannot be mistaken for those of another. If the same keypair
/// validates on two chains with the same chain ID, its votes on one chain can be presented as
/// equivocation evidence on the other.
///
/// ## Log Events
///
/// The engine logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages
/// printed onto a terminal or to a file, set up a
/// [logging implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
#[derive(Clone, TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [Configuration].

    Required:
    - `.chain_id(...)`

    Optional (defaulted):
    - `.initial_height(...)` (default: 1)
    - `.timeouts(...)` (default: [TimeoutConfig::default])
    - `.max_block_bytes(...)` (default: 1048576)
    - `.log_events(...)` (default: true)
"))]
pub struct Configuration {
    #[builder(setter(doc = "Set the chain ID of the blockchain. Required."))]
    pub chain_id: ChainID,
    #[builder(default = 1, setter(doc = "Set the height consensus starts at. Optional."))]
    pub initial_height: BlockHeight,
    #[builder(default, setter(doc = "Set the per-step timeout durations. Optional."))]
    pub timeouts: TimeoutConfig,
    #[builder(
        default = 1_048_576,
        setter(doc = "Set the maximum number of transaction bytes per proposed block. Optional.")
    )]
    pub max_block_bytes: usize,
    #[builder(default = true, setter(doc = "Enable logging? Optional."))]
    pub log_events: bool,
}

/// Stores all necessary parameters and trait implementations required to run the [Replica].
#[derive(TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [ReplicaSpec].

    Required:
    - `.scheme(...)`
    - `.app(...)`
    - `.mempool(...)`
    - `.evidence_reporter(...)`
    - `.network(...)`
    - `.wal(...)`
    - `.initial_validator_set(...)`
    - `.configuration(...)`

    Optional:
    - `.on_start_round(...)`
    - `.on_timeout_expired(...)`
    - `.on_propose(...)`
    - `.on_vote(...)`
    - `.on_receive_proposal(...)`
    - `.on_receive_vote(...)`
    - `.on_finalize_block(...)`
    - `.on_update_validator_set(...)`
    - `.on_equivocation(...)`
"))]
pub struct ReplicaSpec<S, A, M, E, N, W>
where
    S: SignatureScheme,
    A: App,
    M: Mempool,
    E: EvidenceReporter,
    N: Network,
    W: WalStore,
{
    // Required parameters
    #[builder(setter(doc = "Set the replica's signing capability, used to sign votes and proposals. Required."))]
    scheme: S,
    #[builder(setter(doc = "Set the replicated application. The argument must implement the [App](crate::app::App) trait. Required."))]
    app: A,
    #[builder(setter(doc = "Set the store of pending transactions. The argument must implement the [Mempool](crate::app::Mempool) trait. Required."))]
    mempool: M,
    #[builder(setter(doc = "Set the sink for equivocation evidence. The argument must implement the [EvidenceReporter](crate::evidence::EvidenceReporter) trait. Required."))]
    evidence_reporter: E,
    #[builder(setter(doc = "Set the implementation of peer-to-peer networking. The argument must implement the [Network](crate::networking::Network) trait. Required."))]
    network: N,
    #[builder(setter(doc = "Set the write-ahead log storage. The argument must implement the [WalStore](crate::wal::WalStore) trait. Required."))]
    wal: W,
    #[builder(setter(doc = "Set the validator set at the initial height. Required."))]
    initial_validator_set: ValidatorSet,
    #[builder(setter(doc = "Set the [configuration](Configuration), which contains the necessary parameters to run a replica. Required."))]
    configuration: Configuration,
    // Optional parameters
    #[builder(default, setter(transform = |handler: impl Fn(&StartRoundEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<StartRoundEvent>),
    doc = "Register a handler closure to be invoked after the replica enters a new round. Optional."))]
    on_start_round: Option<HandlerPtr<StartRoundEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&TimeoutExpiredEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<TimeoutExpiredEvent>),
    doc = "Register a handler closure to be invoked after one of the replica's timeouts expires. Optional."))]
    on_timeout_expired: Option<HandlerPtr<TimeoutExpiredEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ProposeEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ProposeEvent>),
    doc = "Register a handler closure to be invoked after the replica broadcasts a proposal. Optional."))]
    on_propose: Option<HandlerPtr<ProposeEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&VoteEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<VoteEvent>),
    doc = "Register a handler closure to be invoked after the replica casts a vote. Optional."))]
    on_vote: Option<HandlerPtr<VoteEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ReceiveProposalEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ReceiveProposalEvent>),
    doc = "Register a handler closure to be invoked after the replica accepts a proposal. Optional."))]
    on_receive_proposal: Option<HandlerPtr<ReceiveProposalEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ReceiveVoteEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ReceiveVoteEvent>),
    doc = "Register a handler closure to be invoked after the replica tallies a vote. Optional."))]
    on_receive_vote: Option<HandlerPtr<ReceiveVoteEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&FinalizeBlockEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<FinalizeBlockEvent>),
    doc = "Register a handler closure to be invoked after a block is finalized and applied. Optional."))]
    on_finalize_block: Option<HandlerPtr<FinalizeBlockEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&UpdateValidatorSetEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<UpdateValidatorSetEvent>),
    doc = "Register a handler closure to be invoked after the replica updates its validator set. Optional."))]
    on_update_validator_set: Option<HandlerPtr<UpdateValidatorSetEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&EquivocationEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<EquivocationEvent>),
    doc = "Register a handler closure to be invoked after the replica detects equivocation. Optional."))]
    on_equivocation: Option<HandlerPtr<EquivocationEvent>>,
}

impl<S, A, M, E, N, W> ReplicaSpec<S, A, M, E, N, W>
where
    S: SignatureScheme,
    A: App,
    M: Mempool,
    E: EvidenceReporter,
    N: Network,
    W: WalStore,
{
    /// Starts all threads and channels associated with running a replica, and returns the handles
    /// to them in a [Replica] struct.
    pub fn start(mut self) -> Replica {
        self.network
            .init_validator_set(self.initial_validator_set.clone());

        let configuration = self.configuration;
        let camera = RoundStateCamera::new(configuration.initial_height);

        let (poller_shutdown, poller_shutdown_receiver) = mpsc::channel();
        let (to_consensus, messages) = mpsc::channel();
        let poller = start_polling(self.network.clone(), to_consensus, poller_shutdown_receiver);

        let (schedule, schedule_receiver) = mpsc::channel();
        let (expired, timeouts) = mpsc::channel();
        let scheduler_thread = start_scheduler(schedule_receiver, expired);
        let scheduler = TimeoutScheduler::new(configuration.timeouts.clone(), schedule);

        let event_handlers = EventHandlers::new(
            configuration.log_events,
            self.on_start_round,
            self.on_timeout_expired,
            self.on_propose,
            self.on_vote,
            self.on_receive_proposal,
            self.on_receive_vote,
            self.on_finalize_block,
            self.on_update_validator_set,
            self.on_equivocation,
        );

        let (event_publisher, event_subscriber) = if !event_handlers.is_empty() {
            Some(mpsc::channel()).unzip()
        } else {
            (None, None)
        };

        let (consensus_shutdown, consensus_shutdown_receiver) = mpsc::channel();
        let state_machine = ConsensusStateMachine::new(
            configuration.chain_id,
            configuration.initial_height,
            configuration.max_block_bytes,
            self.scheme,
            self.app,
            self.mempool,
            self.evidence_reporter,
            self.network,
            self.wal,
            self.initial_validator_set,
            camera.clone(),
            scheduler,
            event_publisher,
        );
        let consensus = start_consensus(
            state_machine,
            messages,
            timeouts,
            consensus_shutdown_receiver,
        );

        let (event_bus_shutdown, event_bus_shutdown_receiver) = if !event_handlers.is_empty() {
            Some(mpsc::channel()).unzip()
        } else {
            (None, None)
        };

        let event_bus = if !event_handlers.is_empty() {
            Some(start_event_bus(
                event_handlers,
                event_subscriber.unwrap(),          // Safety: should be Some(...).
                event_bus_shutdown_receiver.unwrap(), // Safety: should be Some(...).
            ))
        } else {
            None
        };

        Replica {
            camera,
            consensus: Some(consensus),
            consensus_shutdown,
            scheduler_thread: Some(scheduler_thread),
            event_bus,
            event_bus_shutdown,
            poller: Some(poller),
            poller_shutdown,
        }
    }
}

/// A handle to the background threads of a replica. When this value is dropped, all background
/// threads are gracefully shut down.
pub struct Replica {
    camera: RoundStateCamera,
    consensus: Option<JoinHandle<()>>,
    consensus_shutdown: Sender<()>,
    scheduler_thread: Option<JoinHandle<()>>,
    event_bus: Option<JoinHandle<()>>,
    event_bus_shutdown: Option<Sender<()>>,
    poller: Option<JoinHandle<()>>,
    poller_shutdown: Sender<()>,
}

impl Replica {
    /// A snapshot of the replica's current consensus position: height, round, step, and lock.
    pub fn round_state(&self) -> RoundStateSnapshot {
        self.camera.snapshot()
    }
}

impl Drop for Replica {
    fn drop(&mut self) {
        // Safety: the order of thread shutdown in this function is important. The consensus
        // thread goes first: it holds the senders for the scheduler's and event bus's channels,
        // and both of those threads key their own exit on those channels disconnecting or on
        // their shutdown signals. The poller goes last, since the consensus thread assumes the
        // receiving end of the poller's channel can be drained at any time.

        // The consensus thread may already be gone: it exits on its own on a fatal error.
        let _ = self.consensus_shutdown.send(());
        self.consensus.take().unwrap().join().unwrap();

        // The state machine was dropped with its thread, disconnecting the schedule channel.
        self.scheduler_thread.take().unwrap().join().unwrap();

        self.event_bus_shutdown
            .iter()
            .for_each(|shutdown| shutdown.send(()).unwrap());
        if self.event_bus.is_some() {
            self.event_bus.take().unwrap().join().unwrap();
        }

        // The poller exits on its own once the consensus inbox is gone.
        let _ = self.poller_shutdown.send(());
        self.poller.take().unwrap().join().unwrap();
    }
}
