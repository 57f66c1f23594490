/*
    Copyright © 2024, TenderBFT Contributors
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The interface between the replication engine and the replicated state machine it drives, i.e.,
//! the [App] and [Mempool] collaborators.

use crate::error::ApplicationError;
use crate::types::{BlockHeight, Block, CryptoHash, Transaction};
use crate::validator_set::ValidatorSetUpdates;

/// The response an [App] returns after successfully applying a finalized block.
pub struct BlockExecutionResponse {
    /// A commitment to the application state after applying the block, e.g. a state root.
    pub result_hash: CryptoHash,
    /// Changes to the validator set that take effect from the next height.
    pub validator_set_updates: Option<ValidatorSetUpdates>,
}

/// The replicated application. The engine decides *which* blocks enter the sequence; the `App`
/// decides what blocks mean.
///
/// All three methods are called from the consensus thread, so implementations should return
/// quickly. Consensus makes no progress while an `App` call is in flight.
pub trait App: Send + 'static {
    /// Build the block this replica proposes at `height`, from transactions reaped out of the
    /// [Mempool]. The returned block's `height` must equal `height` and its hash fields must be
    /// consistent ([`Block::new`](crate::types::Block::new) guarantees both).
    fn propose_block(&mut self, height: BlockHeight, txs: Vec<Transaction>) -> Block;

    /// Decide whether `block` is acceptable as the block at `height`. Validators refuse to
    /// prevote blocks the application rejects.
    ///
    /// Must be deterministic: correct replicas disagreeing on validity can deadlock a height.
    fn validate_block(&mut self, block: &Block) -> bool;

    /// Apply a finalized block to the application state.
    ///
    /// After a crash, the engine may call this again for a height it already applied, if the
    /// crash hit the window between application and the corresponding log marker becoming
    /// durable. Implementations must therefore make application idempotent per height, e.g. by
    /// recording the last applied height alongside their state.
    fn apply_block(&mut self, block: &Block) -> Result<BlockExecutionResponse, ApplicationError>;
}

/// The store of pending transactions that proposed blocks draw from.
pub trait Mempool: Send + 'static {
    /// Take up to `max_bytes` worth of transactions for inclusion in a block at `height`. An
    /// empty vec proposes an empty block.
    fn reap_txs(&mut self, height: BlockHeight, max_bytes: usize) -> Vec<Transaction>;
}
