/*
    Copyright © 2024, TenderBFT Contributors
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Equivocation evidence and the [EvidenceReporter] collaborator through which it leaves the
//! engine.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::messages::Vote;
use crate::types::Address;

/// Proof that a validator signed two different votes for the same (height, round, vote type).
///
/// Both votes carry valid signatures from `validator`, so the pair is independently verifiable
/// by anyone holding the validator set. Equivocation is not treated as an error by the engine:
/// the first vote stands, the evidence is reported, and consensus continues.
#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub struct Equivocation {
    pub validator: Address,
    pub vote_a: Vote,
    pub vote_b: Vote,
}

/// The collaborator that receives [Equivocation] evidence, e.g. to gossip it or to feed it into
/// an application-level slashing mechanism.
pub trait EvidenceReporter: Send + 'static {
    fn report(&mut self, evidence: Equivocation);
}

/// An [EvidenceReporter] that drops all evidence.
pub struct NullEvidenceReporter;

impl EvidenceReporter for NullEvidenceReporter {
    fn report(&mut self, _: Equivocation) {}
}
