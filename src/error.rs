/*
    Copyright © 2024, TenderBFT Contributors
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Error taxonomy for the replication engine.
//!
//! - [ProtocolError]: a malformed, mis-signed or mis-addressed message. Dropped and logged,
//!   never fatal.
//! - Equivocation is not an error: conflicting votes are recorded as
//!   [evidence](crate::evidence::Equivocation) and reported, and consensus continues.
//! - Timeout expiry is an expected control event, not an error.
//! - [WalError]: failure to read or durably append the write-ahead log. Fatal: the engine refuses
//!   to make progress it cannot log.
//! - [FatalError]: conditions on which the replica halts rather than risk divergent state.

use thiserror::Error;

use crate::types::{BlockHeight, ChainID, Round};

/// A message that cannot be accepted. Non-fatal: the message is dropped and the error logged.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("message for chain {got} received on chain {expected}")]
    WrongChain { expected: ChainID, got: ChainID },

    #[error("message for height {got} received at height {expected}")]
    WrongHeight {
        expected: BlockHeight,
        got: BlockHeight,
    },

    #[error("message for past round {got} received at round {current}")]
    StaleRound { current: Round, got: Round },

    #[error("signature verification failed")]
    InvalidSignature,

    #[error("signer is not in the validator set for this height")]
    UnknownValidator,

    #[error("proposal was not signed by the round's proposer")]
    NotProposer,

    #[error("a proposal for this height and round was already accepted")]
    DuplicateProposal,

    #[error("block part does not belong to any accepted proposal")]
    UnexpectedBlockPart,

    #[error("reassembled block does not match the proposal's block id")]
    BlockMismatch,
}

/// Failure to read or durably append the write-ahead log.
#[derive(Debug, Error)]
pub enum WalError {
    #[error("WAL I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt WAL record at offset {offset}")]
    Corrupt { offset: u64 },
}

/// The application collaborator failed to apply a finalized block.
#[derive(Debug, Error)]
#[error("application failed to apply block: {0}")]
pub struct ApplicationError(pub String);

/// A condition on which the replica halts. Proceeding past any of these could violate safety.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error(transparent)]
    Application(#[from] ApplicationError),

    #[error(transparent)]
    Wal(#[from] WalError),

    #[error("invalid validator set produced at height {height}: {reason}")]
    InvalidValidatorSet { height: BlockHeight, reason: String },
}
