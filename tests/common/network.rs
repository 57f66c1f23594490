use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, Sender, TryRecvError},
        Arc, Mutex,
    },
};

use tenderbft::{
    messages::ConsensusMessage,
    networking::Network,
    types::PublicKeyBytes,
    validator_set::{ValidatorSet, ValidatorSetUpdates},
};

/// A mock network stub which passes messages from and to threads using channels.
///
/// Broadcasts are delivered to every peer except the broadcaster itself, per the [Network]
/// contract.
#[derive(Clone)]
pub(crate) struct NetworkStub {
    my_public_key: PublicKeyBytes,
    all_peers: HashMap<PublicKeyBytes, Sender<ConsensusMessage>>,
    inbox: Arc<Mutex<Receiver<ConsensusMessage>>>,
    drop_block_traffic: Arc<AtomicBool>,
}

impl NetworkStub {
    /// While set, outgoing proposals and block parts are silently lost; votes still go through.
    /// Lets tests keep a cluster from finalizing without cutting it off entirely.
    pub(crate) fn set_drop_block_traffic(&self, drop: bool) {
        self.drop_block_traffic.store(drop, Ordering::Relaxed);
    }

    fn drops(&self, message: &ConsensusMessage) -> bool {
        self.drop_block_traffic.load(Ordering::Relaxed)
            && matches!(
                message,
                ConsensusMessage::Proposal(_) | ConsensusMessage::BlockPart(_)
            )
    }
}

impl Network for NetworkStub {
    fn init_validator_set(&mut self, _: ValidatorSet) {}

    fn update_validator_set(&mut self, _: ValidatorSetUpdates) {}

    fn send(&mut self, peer: PublicKeyBytes, message: ConsensusMessage) {
        if self.drops(&message) {
            return;
        }
        if let Some(peer) = self.all_peers.get(&peer) {
            let _ = peer.send(message);
        }
    }

    fn broadcast(&mut self, message: ConsensusMessage) {
        if self.drops(&message) {
            return;
        }
        for (peer, sender) in &self.all_peers {
            if *peer != self.my_public_key {
                let _ = sender.send(message.clone());
            }
        }
    }

    fn recv(&mut self) -> Option<ConsensusMessage> {
        match self.inbox.lock().unwrap().try_recv() {
            Ok(message) => Some(message),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => panic!(),
        }
    }
}

pub(crate) fn mock_network(peers: impl Iterator<Item = PublicKeyBytes>) -> Vec<NetworkStub> {
    let mut all_peers = HashMap::new();
    let peer_and_inboxes: Vec<(PublicKeyBytes, Receiver<ConsensusMessage>)> = peers
        .map(|peer| {
            let (sender, receiver) = mpsc::channel();
            all_peers.insert(peer, sender);

            (peer, receiver)
        })
        .collect();

    peer_and_inboxes
        .into_iter()
        .map(|(my_public_key, inbox)| NetworkStub {
            my_public_key,
            all_peers: all_peers.clone(),
            inbox: Arc::new(Mutex::new(inbox)),
            drop_block_traffic: Arc::new(AtomicBool::new(false)),
        })
        .collect()
}
