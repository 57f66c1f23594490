/*
    Copyright © 2024, TenderBFT Contributors
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A Byzantine fault tolerant replication engine: it drives a set of validators to agree, height
//! by height, on a single sequence of blocks, and it keeps that agreement safe as long as fewer
//! than one third of the total voting power is faulty.
//!
//! Consensus proceeds in heights; each height runs one or more rounds; each round walks through
//! the propose, prevote and precommit steps. A block that gathers precommits from more than two
//! thirds of the voting power at some round is finalized at its height, handed to the
//! [application](crate::app::App), and never revisited.
//!
//! The engine is a library, not a node: the application, the mempool, peer-to-peer networking,
//! the write-ahead log storage and the evidence sink are all
//! [collaborators](crate::replica::ReplicaSpec) the user plugs in through traits. To run a
//! replica, implement those traits and hand them to [`ReplicaSpec::builder`](crate::replica::ReplicaSpec::builder).

pub mod app;

pub mod crypto;

pub mod error;

pub mod events;

pub mod evidence;

pub mod logging;

pub mod messages;

pub mod networking;

pub mod replica;

pub mod round_state;

pub mod timeout;

pub mod types;

pub mod validator_set;

pub mod vote_set;

pub mod wal;

pub(crate) mod event_bus;

pub(crate) mod state_machine;
