//! Integration test for crash recovery: replicas shut down mid-consensus and restarted from
//! their write-ahead logs rejoin, do not equivocate, and do not re-execute applied blocks.

use std::{
    collections::HashMap,
    fs, thread,
    time::{Duration, Instant},
};

use log::LevelFilter;
use tenderbft::{
    crypto::{Ed25519Scheme, SignatureScheme},
    validator_set::{Validator, ValidatorSet},
    wal::FileWal,
};

mod common;

use crate::common::{
    counter_app::SharedAppState, logging::setup_logger, network::mock_network, node::Node,
};

fn wait_until(what: &str, deadline: Duration, mut condition: impl FnMut() -> bool) {
    let started = Instant::now();
    while !condition() {
        if started.elapsed() > deadline {
            panic!("timed out waiting for: {}", what);
        }
        thread::sleep(Duration::from_millis(200));
    }
}

#[test]
fn replicas_recover_from_their_wals_and_continue() {
    setup_logger(LevelFilter::Info);

    let wal_dir = std::env::temp_dir().join(format!("tenderbft_wal_it_{}", std::process::id()));
    fs::create_dir_all(&wal_dir).unwrap();

    let schemes: Vec<Ed25519Scheme> = (0..4).map(|_| Ed25519Scheme::generate()).collect();
    let validator_set = {
        let validators = schemes
            .iter()
            .map(|scheme| Validator::new(scheme.public(), 1))
            .collect();
        ValidatorSet::new(validators, 1).unwrap()
    };
    let wal_paths: Vec<std::path::PathBuf> = (0..4)
        .map(|i| wal_dir.join(format!("replica_{}.wal", i)))
        .collect();
    let app_states: Vec<SharedAppState> = (0..4).map(|_| SharedAppState::new()).collect();

    // 1. First life: run the cluster until a few heights are finalized everywhere.
    let committed_before: Vec<(u64, Vec<[u8; 32]>)> = {
        let network_stubs = mock_network(schemes.iter().map(|s| s.public()));
        let nodes: Vec<Node> = schemes
            .iter()
            .zip(network_stubs)
            .zip(&wal_paths)
            .zip(&app_states)
            .map(|(((scheme, network), wal_path), app_state)| {
                Node::start(
                    scheme.clone(),
                    network,
                    FileWal::open(wal_path).unwrap(),
                    validator_set.clone(),
                    app_state.clone(),
                    HashMap::new(),
                )
            })
            .collect();

        for node in &nodes {
            node.submit_transaction(vec![7u8; 16]);
        }

        // Shut down only once every replica sits at the same committed height. The engine has no
        // block sync, so a replica left behind at shutdown could not catch up after the restart.
        wait_until(
            "all replicas to commit the same height, at least 3",
            Duration::from_secs(120),
            || {
                let heights: Vec<u64> =
                    nodes.iter().map(|node| node.committed_height()).collect();
                heights.iter().all(|h| *h >= 3) && heights.iter().all(|h| *h == heights[0])
            },
        );

        // Record what each replica had committed, then shut all of them down by dropping them.
        nodes
            .iter()
            .map(|node| {
                let height = node.committed_height();
                let hashes = (1..=height)
                    .map(|h| node.block_hash_at(h).unwrap())
                    .collect();
                (height, hashes)
            })
            .collect()
    };

    // 2. Second life: restart every replica from its WAL and its surviving application state.
    let network_stubs = mock_network(schemes.iter().map(|s| s.public()));
    let nodes: Vec<Node> = schemes
        .iter()
        .zip(network_stubs)
        .zip(&wal_paths)
        .zip(&app_states)
        .map(|(((scheme, network), wal_path), app_state)| {
            Node::start(
                scheme.clone(),
                network,
                FileWal::open(wal_path).unwrap(),
                validator_set.clone(),
                app_state.clone(),
                HashMap::new(),
            )
        })
        .collect();

    // 3. The cluster keeps finalizing new heights after the restart.
    let resume_target = committed_before
        .iter()
        .map(|(height, _)| *height)
        .max()
        .unwrap()
        + 2;
    wait_until(
        "all replicas to commit two more heights after restart",
        Duration::from_secs(120),
        || nodes.iter().all(|node| node.committed_height() >= resume_target),
    );

    for (node, (height_before, hashes_before)) in nodes.iter().zip(&committed_before) {
        // 4. Replay did not rewrite history: everything committed before the restart is still
        //    committed, with the same block hashes.
        for (h, hash_before) in (1..=*height_before).zip(hashes_before) {
            assert_eq!(node.block_hash_at(h), Some(*hash_before));
        }

        // 5. Replay re-invokes application once per replayed height and the app answers
        //    idempotently, so no height is ever executed more than once per process life.
        for h in 1..=*height_before {
            assert!(node.apply_calls_at(h) <= 2);
        }

        // 6. No replica equivocated across the restart.
        assert!(node.evidence().recorded().is_empty());
    }

    // All replicas hold the same counter at the same height.
    let reference = nodes
        .iter()
        .map(|node| (node.committed_height(), node.counter()))
        .collect::<Vec<_>>();
    for window in reference.windows(2) {
        if window[0].0 == window[1].0 {
            assert_eq!(window[0].1, window[1].1);
        }
    }

    let _ = fs::remove_dir_all(&wal_dir);
}
