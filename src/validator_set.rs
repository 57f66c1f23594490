/*
    Copyright © 2024, TenderBFT Contributors
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types that store information about validator sets, proposer selection, and updates to validator
//! sets.

use std::collections::{HashMap, HashSet};

use borsh::{BorshDeserialize, BorshSerialize};
use thiserror::Error;

use crate::crypto::address_of;
use crate::types::{Address, BlockHeight, Power, PublicKeyBytes, Round, TotalPower};

/// A member of a [ValidatorSet]: an identity (public key handle), a positive voting power, and an
/// address derived from the identity. Immutable once in a set.
#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub struct Validator {
    pub public_key: PublicKeyBytes,
    pub power: Power,
    pub address: Address,
}

impl Validator {
    pub fn new(public_key: PublicKeyBytes, power: Power) -> Validator {
        Validator {
            public_key,
            power,
            address: address_of(&public_key),
        }
    }
}

/// Stores the identities of validators and their voting powers, and computes proposer selection
/// and quorum thresholds.
///
/// ## Ordering of validators
///
/// `ValidatorSet` internally maintains the list of validators in ascending order of their
/// addresses, which makes proposer tie-breaking deterministic across replicas.
///
/// ## Proposer selection
///
/// [`proposer_at`](Self::proposer_at) implements a weighted round-robin: every selection step adds
/// each validator's power to its running priority, picks the highest-priority validator (ties
/// broken by lowest address), and subtracts the total power from the winner. Over many rounds each
/// validator proposes in proportion to its power, and the sequence is identical on all correct
/// replicas given the same set.
///
/// The priorities are anchored at the set's `base_height`. A set for the next height is obtained
/// with [`advanced`](Self::advanced) (same membership, rotated priorities) or
/// [`apply_updates`](Self::apply_updates) (wholesale membership replacement, priorities reset).
/// Sets are never mutated in place between heights.
#[derive(Clone, PartialEq, Debug)]
pub struct ValidatorSet {
    // Validators in ascending order of address.
    validators: Vec<Validator>,
    by_address: HashMap<Address, usize>,
    // Proposer priorities, parallel to `validators`; the state at the start of `base_height`.
    priorities: Vec<i128>,
    base_height: BlockHeight,
}

/// The membership handed to [`ValidatorSet::new`] violated a set invariant.
#[derive(Debug, Error)]
pub enum InvalidValidatorSetError {
    #[error("validator set must have total power > 0")]
    NoPower,

    #[error("validator set contains a duplicate identity")]
    DuplicateValidator,

    #[error("validator has zero power")]
    ZeroPowerValidator,
}

impl ValidatorSet {
    /// Create a validator set whose proposer priorities are anchored at `base_height`.
    pub fn new(
        mut validators: Vec<Validator>,
        base_height: BlockHeight,
    ) -> Result<ValidatorSet, InvalidValidatorSetError> {
        if validators.iter().any(|v| v.power == 0) {
            return Err(InvalidValidatorSetError::ZeroPowerValidator);
        }

        validators.sort_by(|a, b| a.address.cmp(&b.address));

        let mut by_address = HashMap::new();
        for (pos, validator) in validators.iter().enumerate() {
            if by_address.insert(validator.address, pos).is_some() {
                return Err(InvalidValidatorSetError::DuplicateValidator);
            }
        }

        if validators.is_empty() {
            return Err(InvalidValidatorSetError::NoPower);
        }

        let priorities = vec![0; validators.len()];
        Ok(ValidatorSet {
            validators,
            by_address,
            priorities,
            base_height,
        })
    }

    /// Get the sum of the powers of all of the validators inside the validator set.
    pub fn total_power(&self) -> TotalPower {
        self.validators.iter().map(|v| v.power as TotalPower).sum()
    }

    /// Check whether `power` constitutes a 2/3 supermajority of the set's total power
    /// (strictly greater than two-thirds).
    pub fn has_quorum(&self, power: TotalPower) -> bool {
        power * 3 > self.total_power() * 2
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.by_address.contains_key(address)
    }

    pub fn validator(&self, address: &Address) -> Option<&Validator> {
        self.by_address.get(address).map(|pos| &self.validators[*pos])
    }

    pub fn power_of(&self, address: &Address) -> Option<Power> {
        self.validator(address).map(|v| v.power)
    }

    /// Get an iterator through the validators, which walks through them in ascending order of
    /// address.
    pub fn validators(&self) -> std::slice::Iter<Validator> {
        self.validators.iter()
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// The height the set's proposer priorities are anchored at.
    pub fn base_height(&self) -> BlockHeight {
        self.base_height
    }

    /// Compute the proposer for `(height, round)`. Deterministic: all correct replicas holding the
    /// same set compute the same proposer, which is required for liveness.
    ///
    /// # Panics
    /// `height` must not be lower than the set's `base_height`.
    pub fn proposer_at(&self, height: BlockHeight, round: Round) -> &Validator {
        assert!(
            height >= self.base_height,
            "proposer requested for a height below the set's base height"
        );

        let selections = (height - self.base_height) + round as u64 + 1;
        let mut priorities = self.priorities.clone();
        let mut winner = 0;
        for _ in 0..selections {
            winner = self.select_once(&mut priorities);
        }
        &self.validators[winner]
    }

    // One selection step of the weighted round-robin. Mutates `priorities` and returns the winning
    // index. Ties go to the lowest index, i.e. the lowest address.
    fn select_once(&self, priorities: &mut [i128]) -> usize {
        let total = self.total_power() as i128;
        for (priority, validator) in priorities.iter_mut().zip(self.validators.iter()) {
            *priority += validator.power as i128;
        }

        let mut winner = 0;
        for (pos, priority) in priorities.iter().enumerate() {
            if *priority > priorities[winner] {
                winner = pos;
            }
        }

        priorities[winner] -= total;
        winner
    }

    /// Produce the set for `height` with the same membership and the priorities rotated forward.
    /// The rotation advances one selection step per height, independently of how many rounds any
    /// height took, so replicas that finalized a height at different rounds still agree.
    pub fn advanced(&self, height: BlockHeight) -> ValidatorSet {
        assert!(height >= self.base_height);

        let mut next = self.clone();
        for _ in 0..(height - self.base_height) {
            self.select_once(&mut next.priorities);
        }
        next.base_height = height;
        next
    }

    /// Produce a new set for `base_height` by applying membership `updates` wholesale. Proposer
    /// priorities reset, since the membership the old priorities were computed over no longer
    /// exists.
    pub fn apply_updates(
        &self,
        updates: &ValidatorSetUpdates,
        base_height: BlockHeight,
    ) -> Result<ValidatorSet, InvalidValidatorSetError> {
        let mut members: HashMap<PublicKeyBytes, Power> = self
            .validators
            .iter()
            .map(|v| (v.public_key, v.power))
            .collect();

        for (public_key, power) in updates.inserts() {
            members.insert(*public_key, *power);
        }
        for public_key in updates.deletes() {
            members.remove(public_key);
        }

        let validators = members
            .into_iter()
            .map(|(public_key, power)| Validator::new(public_key, power))
            .collect();
        ValidatorSet::new(validators, base_height)
    }
}

/// Changes to be applied to a validator set's membership, produced by the application collaborator
/// when a finalized block changes the membership.
#[derive(Clone, Default, Debug, BorshSerialize, BorshDeserialize)]
pub struct ValidatorSetUpdates {
    inserts: HashMap<PublicKeyBytes, Power>,
    deletes: HashSet<PublicKeyBytes>,
}

impl ValidatorSetUpdates {
    pub fn new() -> ValidatorSetUpdates {
        Self::default()
    }

    pub fn insert(&mut self, public_key: PublicKeyBytes, power: Power) {
        self.deletes.remove(&public_key);
        self.inserts.insert(public_key, power);
    }

    pub fn delete(&mut self, public_key: PublicKeyBytes) {
        self.inserts.remove(&public_key);
        self.deletes.insert(public_key);
    }

    /// Get an iterator over all of the key-power pairs inserted by this update.
    pub fn inserts(&self) -> std::collections::hash_map::Iter<PublicKeyBytes, Power> {
        self.inserts.iter()
    }

    /// Get an iterator over all of the keys deleted by this update.
    pub fn deletes(&self) -> std::collections::hash_set::Iter<PublicKeyBytes> {
        self.deletes.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.deletes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_of(powers: &[Power]) -> ValidatorSet {
        let validators = powers
            .iter()
            .enumerate()
            .map(|(i, power)| {
                let mut public_key = [0u8; 32];
                public_key[0] = i as u8 + 1;
                Validator::new(public_key, *power)
            })
            .collect();
        ValidatorSet::new(validators, 1).unwrap()
    }

    #[test]
    fn rejects_empty_and_duplicate_sets() {
        assert!(matches!(
            ValidatorSet::new(vec![], 1),
            Err(InvalidValidatorSetError::NoPower)
        ));

        let validator = Validator::new([7u8; 32], 1);
        assert!(matches!(
            ValidatorSet::new(vec![validator.clone(), validator], 1),
            Err(InvalidValidatorSetError::DuplicateValidator)
        ));
    }

    #[test]
    fn quorum_is_strictly_greater_than_two_thirds() {
        let set = set_of(&[1, 1, 1]);
        assert!(!set.has_quorum(2));
        assert!(set.has_quorum(3));

        let set = set_of(&[1, 1, 1, 1]);
        assert!(!set.has_quorum(2));
        assert!(set.has_quorum(3));
    }

    #[test]
    fn proposer_sequence_is_deterministic() {
        let set_a = set_of(&[1, 2, 3]);
        let set_b = set_of(&[1, 2, 3]);
        for round in 0..10 {
            assert_eq!(
                set_a.proposer_at(1, round).address,
                set_b.proposer_at(1, round).address
            );
        }
    }

    #[test]
    fn proposer_frequency_is_proportional_to_power() {
        let set = set_of(&[1, 2, 3]);
        let mut selections: HashMap<Address, u32> = HashMap::new();
        for round in 0..60 {
            let proposer = set.proposer_at(1, round);
            *selections.entry(proposer.address).or_default() += 1;
        }

        // Powers 1:2:3 over 60 rounds select each validator 10, 20, and 30 times.
        for validator in set.validators() {
            assert_eq!(
                *selections.get(&validator.address).unwrap(),
                validator.power as u32 * 10
            );
        }
    }

    #[test]
    fn advanced_set_agrees_with_direct_selection() {
        let set = set_of(&[3, 1, 1]);
        let next = set.advanced(2);
        assert_eq!(
            set.proposer_at(2, 0).address,
            next.proposer_at(2, 0).address
        );
        assert_eq!(
            set.proposer_at(2, 4).address,
            next.proposer_at(2, 4).address
        );
    }

    #[test]
    fn apply_updates_replaces_membership_wholesale() {
        let set = set_of(&[1, 1, 1]);
        let removed = set.validators().next().unwrap().public_key;

        let mut updates = ValidatorSetUpdates::new();
        updates.insert([9u8; 32], 5);
        updates.delete(removed);

        let next = set.apply_updates(&updates, 2).unwrap();
        assert_eq!(next.len(), 3);
        assert_eq!(next.total_power(), 7);
        assert!(!next.contains(&address_of(&removed)));
        assert_eq!(next.power_of(&address_of(&[9u8; 32])), Some(5));
    }
}
