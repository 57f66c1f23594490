/*
    Copyright © 2024, TenderBFT Contributors
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! [Trait definition](Network) for pluggable peer-to-peer networking, as well as the poller
//! thread that moves messages from the network into the consensus thread's event queue.
//!
//! Networking providers interact with the engine's threads through implementations of the
//! [Network] trait. Peers are addressed by their public keys; how the provider maps keys to
//! transport addresses is its own concern.

use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::thread::{self, JoinHandle};

use crate::messages::ConsensusMessage;
use crate::types::PublicKeyBytes;
use crate::validator_set::{ValidatorSet, ValidatorSetUpdates};

pub trait Network: Clone + Send + 'static {
    /// Informs the network provider of the validator set on wake-up.
    fn init_validator_set(&mut self, validator_set: ValidatorSet);

    /// Informs the networking provider of updates to the validator set.
    fn update_validator_set(&mut self, updates: ValidatorSetUpdates);

    /// Send a message to all peers without blocking.
    ///
    /// Implementations must not deliver broadcast messages back to the broadcasting replica: the
    /// engine routes its own messages through its internal queue so that they are logged before
    /// they are acted on, and a network echo would process them twice.
    fn broadcast(&mut self, message: ConsensusMessage);

    /// Send a message to the specified peer without blocking.
    fn send(&mut self, peer: PublicKeyBytes, message: ConsensusMessage);

    /// Receive a message from any peer. Returns immediately with a None if no message is
    /// available now.
    fn recv(&mut self) -> Option<ConsensusMessage>;
}

/// Spawn the poller thread, which polls the Network for messages and forwards them into the
/// consensus thread's event queue via `to_consensus`.
pub(crate) fn start_polling<N: Network>(
    mut network: N,
    to_consensus: Sender<ConsensusMessage>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => {
                panic!("Poller thread disconnected from main thread")
            }
        }

        if let Some(message) = network.recv() {
            // The consensus thread hanging up means shutdown is in progress.
            if to_consensus.send(message).is_err() {
                return;
            }
        } else {
            thread::yield_now()
        }
    })
}
