use std::{collections::HashMap, time::Duration};

use tenderbft::{
    crypto::Ed25519Scheme,
    replica::{Configuration, Replica, ReplicaSpec},
    round_state::RoundStateSnapshot,
    timeout::TimeoutConfig,
    types::{BlockHeight, CryptoHash, Transaction},
    validator_set::{ValidatorSet, ValidatorSetUpdates},
    wal::WalStore,
};

use crate::common::{
    counter_app::{CounterApp, QueueMempool, SharedAppState},
    evidence::EvidenceRecorder,
    network::NetworkStub,
};

/// Things the Nodes have in common:
/// - Initial validator set.
/// - Configuration (apart from the keypair).
///
/// Things that they differ in:
/// - Signing key.
/// - Network instance.
/// - WAL storage.
/// - Application state.
pub(crate) struct Node {
    mempool: QueueMempool,
    state: SharedAppState,
    evidence: EvidenceRecorder,
    replica: Replica,
}

impl Node {
    pub(crate) fn start<W: WalStore>(
        scheme: Ed25519Scheme,
        network: NetworkStub,
        wal: W,
        initial_validator_set: ValidatorSet,
        state: SharedAppState,
        scheduled_updates: HashMap<BlockHeight, ValidatorSetUpdates>,
    ) -> Node {
        let mempool = QueueMempool::new();
        let evidence = EvidenceRecorder::new();

        // Short timeouts so that tests make progress quickly.
        let timeouts = TimeoutConfig {
            propose_base: Duration::from_millis(1000),
            propose_delta: Duration::from_millis(500),
            prevote_base: Duration::from_millis(500),
            prevote_delta: Duration::from_millis(500),
            precommit_base: Duration::from_millis(500),
            precommit_delta: Duration::from_millis(500),
            commit: Duration::from_millis(200),
        };

        let configuration = Configuration::builder()
            .chain_id(0)
            .timeouts(timeouts)
            .log_events(false)
            .build();

        let replica = ReplicaSpec::builder()
            .scheme(scheme)
            .app(CounterApp::with_scheduled_updates(
                state.clone(),
                scheduled_updates,
            ))
            .mempool(mempool.clone())
            .evidence_reporter(evidence.clone())
            .network(network)
            .wal(wal)
            .initial_validator_set(initial_validator_set)
            .configuration(configuration)
            .build()
            .start();

        Node {
            mempool,
            state,
            evidence,
            replica,
        }
    }

    pub(crate) fn submit_transaction(&self, tx: Transaction) {
        self.mempool.submit(tx);
    }

    pub(crate) fn committed_height(&self) -> BlockHeight {
        self.state.last_applied()
    }

    pub(crate) fn block_hash_at(&self, height: BlockHeight) -> Option<CryptoHash> {
        self.state.block_hash_at(height)
    }

    pub(crate) fn counter(&self) -> u64 {
        self.state.counter()
    }

    pub(crate) fn apply_calls_at(&self, height: BlockHeight) -> u32 {
        self.state.apply_calls_at(height)
    }

    pub(crate) fn round_state(&self) -> RoundStateSnapshot {
        self.replica.round_state()
    }

    pub(crate) fn evidence(&self) -> EvidenceRecorder {
        self.evidence.clone()
    }
}
