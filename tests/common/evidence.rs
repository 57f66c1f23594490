use std::sync::{Arc, Mutex};

use tenderbft::evidence::{Equivocation, EvidenceReporter};

/// An [EvidenceReporter] that records everything it receives, for inspection by tests.
#[derive(Clone, Default)]
pub(crate) struct EvidenceRecorder {
    recorded: Arc<Mutex<Vec<Equivocation>>>,
}

impl EvidenceRecorder {
    pub(crate) fn new() -> EvidenceRecorder {
        EvidenceRecorder::default()
    }

    pub(crate) fn recorded(&self) -> Vec<Equivocation> {
        self.recorded.lock().unwrap().clone()
    }
}

impl EvidenceReporter for EvidenceRecorder {
    fn report(&mut self, evidence: Equivocation) {
        self.recorded.lock().unwrap().push(evidence);
    }
}
