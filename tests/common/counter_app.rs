//! [`CounterApp`], a simple implementation of [`App`] used in the integration tests, together
//! with the shared state that lets tests inspect what each replica has committed.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
};

use sha2::Digest;
use tenderbft::{
    app::{App, BlockExecutionResponse, Mempool},
    error::ApplicationError,
    types::{Block, BlockHeight, CryptoHash, CryptoHasher, Transaction},
    validator_set::ValidatorSetUpdates,
};

/// The durable state of a [CounterApp], shared between the app (running on the consensus thread)
/// and the test (inspecting it). Surviving outside the replica also lets a test restart a replica
/// against the same application state, the way a real node's application database would survive a
/// crash.
#[derive(Clone, Default)]
pub(crate) struct SharedAppState {
    inner: Arc<Mutex<AppStateInner>>,
}

#[derive(Default)]
struct AppStateInner {
    counter: u64,
    last_applied: BlockHeight,
    // Block hash and result hash per applied height.
    committed: BTreeMap<BlockHeight, (CryptoHash, CryptoHash)>,
    // How many times apply was invoked per height, idempotent hits included.
    apply_calls: BTreeMap<BlockHeight, u32>,
}

impl SharedAppState {
    pub(crate) fn new() -> SharedAppState {
        SharedAppState::default()
    }

    pub(crate) fn counter(&self) -> u64 {
        self.inner.lock().unwrap().counter
    }

    pub(crate) fn last_applied(&self) -> BlockHeight {
        self.inner.lock().unwrap().last_applied
    }

    pub(crate) fn block_hash_at(&self, height: BlockHeight) -> Option<CryptoHash> {
        self.inner
            .lock()
            .unwrap()
            .committed
            .get(&height)
            .map(|(block_hash, _)| *block_hash)
    }

    pub(crate) fn apply_calls_at(&self, height: BlockHeight) -> u32 {
        *self
            .inner
            .lock()
            .unwrap()
            .apply_calls
            .get(&height)
            .unwrap_or(&0)
    }
}

/// A simple [App] whose state is a single counter, increased by one for every transaction in
/// every applied block. Every block is considered valid.
///
/// Application is idempotent per height, as the [App] contract requires: re-applying an already
/// applied height returns the recorded result without touching the counter.
pub(crate) struct CounterApp {
    state: SharedAppState,
    // Validator set updates to attach to the block applied at each height. Must be identical
    // across all replicas of a test.
    scheduled_updates: HashMap<BlockHeight, ValidatorSetUpdates>,
}

impl CounterApp {
    pub(crate) fn with_scheduled_updates(
        state: SharedAppState,
        scheduled_updates: HashMap<BlockHeight, ValidatorSetUpdates>,
    ) -> CounterApp {
        CounterApp {
            state,
            scheduled_updates,
        }
    }
}

impl App for CounterApp {
    fn propose_block(&mut self, height: BlockHeight, txs: Vec<Transaction>) -> Block {
        Block::new(height, txs)
    }

    fn validate_block(&mut self, _: &Block) -> bool {
        true
    }

    fn apply_block(&mut self, block: &Block) -> Result<BlockExecutionResponse, ApplicationError> {
        let mut state = self.state.inner.lock().unwrap();
        *state.apply_calls.entry(block.height).or_insert(0) += 1;

        if block.height <= state.last_applied {
            let (_, result_hash) = *state
                .committed
                .get(&block.height)
                .ok_or_else(|| ApplicationError(String::from("re-applied height is unknown")))?;
            return Ok(BlockExecutionResponse {
                result_hash,
                validator_set_updates: self.scheduled_updates.get(&block.height).cloned(),
            });
        }

        state.counter += block.data.len() as u64;
        let result_hash = {
            let mut hasher = CryptoHasher::new();
            hasher.update(state.counter.to_le_bytes());
            hasher.finalize().into()
        };
        state.last_applied = block.height;
        state
            .committed
            .insert(block.height, (block.hash, result_hash));

        Ok(BlockExecutionResponse {
            result_hash,
            validator_set_updates: self.scheduled_updates.get(&block.height).cloned(),
        })
    }
}

/// A [Mempool] over a shared vec of transactions.
#[derive(Clone, Default)]
pub(crate) struct QueueMempool {
    queue: Arc<Mutex<Vec<Transaction>>>,
}

impl QueueMempool {
    pub(crate) fn new() -> QueueMempool {
        QueueMempool::default()
    }

    pub(crate) fn submit(&self, tx: Transaction) {
        self.queue.lock().unwrap().push(tx);
    }
}

impl Mempool for QueueMempool {
    fn reap_txs(&mut self, _: BlockHeight, max_bytes: usize) -> Vec<Transaction> {
        let mut queue = self.queue.lock().unwrap();
        let mut reaped = Vec::new();
        let mut bytes = 0;
        while let Some(tx) = queue.first() {
            bytes += tx.len();
            if !reaped.is_empty() && bytes > max_bytes {
                break;
            }
            reaped.push(queue.remove(0));
        }
        reaped
    }
}
