/*
    Copyright © 2024, TenderBFT Contributors
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for 'inert' types, i.e., those that are sent around and inspected, but have no active behavior.

use borsh::{BorshDeserialize, BorshSerialize};
use sha2::Digest;

pub use sha2::Sha256 as CryptoHasher;

pub type ChainID = u64;
pub type BlockHeight = u64;
pub type Round = u32;
pub type Power = u64;
pub type TotalPower = u128;
pub type CryptoHash = [u8; 32];
pub type Address = [u8; 20];
pub type PublicKeyBytes = [u8; 32];
pub type SignatureBytes = Vec<u8>;
pub type Transaction = Vec<u8>;

/// The number of bytes in a single block part. Blocks are gossipped in parts so that a large block
/// does not have to fit in one network message.
pub const BLOCK_PART_SIZE: usize = 65536;

/// Reference to a block: the hash of its header fields, plus a commitment to the part set its bytes
/// were split into for gossipping.
///
/// Two `BlockId`s are equal iff both the hash and the part set header match. A vote that carries no
/// `BlockId` (`Option<BlockId>::None`) is a vote for nil.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, BorshSerialize, BorshDeserialize)]
pub struct BlockId {
    pub hash: CryptoHash,
    pub parts: PartSetHeader,
}

/// Commitment to a [`PartSet`]: the number of parts and the hash over the parts' hashes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, BorshSerialize, BorshDeserialize)]
pub struct PartSetHeader {
    pub count: u32,
    pub hash: CryptoHash,
}

#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub struct Block {
    pub height: BlockHeight,
    pub hash: CryptoHash,
    pub data_hash: CryptoHash,
    pub data: Vec<Transaction>,
}

impl Block {
    pub fn new(height: BlockHeight, data: Vec<Transaction>) -> Block {
        let data_hash = Block::data_hash(&data);
        Block {
            height,
            hash: Block::hash(height, &data_hash),
            data_hash,
            data,
        }
    }

    pub fn hash(height: BlockHeight, data_hash: &CryptoHash) -> CryptoHash {
        let mut hasher = CryptoHasher::new();
        hasher.update(height.try_to_vec().unwrap());
        hasher.update(data_hash.try_to_vec().unwrap());
        hasher.finalize().into()
    }

    pub fn data_hash(data: &Vec<Transaction>) -> CryptoHash {
        let mut hasher = CryptoHasher::new();
        hasher.update(data.try_to_vec().unwrap());
        hasher.finalize().into()
    }

    /// Checks whether the hash fields are consistent with the block's contents.
    pub fn is_correct(&self) -> bool {
        self.data_hash == Block::data_hash(&self.data)
            && self.hash == Block::hash(self.height, &self.data_hash)
    }

    /// Compute the [`BlockId`] that votes for this block carry. Deterministic: the part set header
    /// is recomputed from the block's canonical encoding.
    pub fn block_id(&self) -> BlockId {
        BlockId {
            hash: self.hash,
            parts: PartSet::from_block(self).header(),
        }
    }
}

/// A single chunk of a block's canonical encoding, gossipped in a
/// [`BlockPartMessage`](crate::messages::BlockPartMessage).
#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub struct Part {
    pub index: u32,
    pub bytes: Vec<u8>,
}

/// A block's canonical (borsh) encoding split into [`BLOCK_PART_SIZE`]-sized chunks, supporting
/// incremental reassembly of a proposed block from gossip.
#[derive(Clone)]
pub struct PartSet {
    header: PartSetHeader,
    parts: Vec<Option<Part>>,
    received: u32,
}

impl PartSet {
    /// Split a block into parts. Every block splits into at least one part.
    pub fn from_block(block: &Block) -> PartSet {
        let bytes = block.try_to_vec().unwrap();
        let chunks: Vec<Part> = bytes
            .chunks(BLOCK_PART_SIZE)
            .enumerate()
            .map(|(index, chunk)| Part {
                index: index as u32,
                bytes: chunk.to_vec(),
            })
            .collect();

        let header = PartSetHeader {
            count: chunks.len() as u32,
            hash: Self::hash_of_parts(&chunks),
        };
        let received = chunks.len() as u32;
        PartSet {
            header,
            parts: chunks.into_iter().map(Some).collect(),
            received,
        }
    }

    /// Create an empty part set matching `header`, ready to accumulate gossipped parts.
    pub fn empty(header: PartSetHeader) -> PartSet {
        PartSet {
            header,
            parts: vec![None; header.count as usize],
            received: 0,
        }
    }

    fn hash_of_parts(parts: &[Part]) -> CryptoHash {
        let mut hasher = CryptoHasher::new();
        for part in parts {
            let mut part_hasher = CryptoHasher::new();
            part_hasher.update(&part.bytes);
            let part_hash: CryptoHash = part_hasher.finalize().into();
            hasher.update(part_hash);
        }
        hasher.finalize().into()
    }

    pub fn header(&self) -> PartSetHeader {
        self.header
    }

    pub fn is_complete(&self) -> bool {
        self.received == self.header.count
    }

    /// Add a part to the set. Returns whether the set is complete after the addition. Out-of-range
    /// indices and duplicates are ignored.
    pub fn add_part(&mut self, part: Part) -> bool {
        let index = part.index as usize;
        if index < self.parts.len() && self.parts[index].is_none() {
            self.parts[index] = Some(part);
            self.received += 1;
        }
        self.is_complete()
    }

    /// Reassemble the block from a complete part set, checking the parts against the header's
    /// commitment. Returns `None` if the set is incomplete, the commitment does not match, or the
    /// bytes do not decode to a well-formed block.
    pub fn assemble(&self) -> Option<Block> {
        if !self.is_complete() {
            return None;
        }

        let parts: Vec<Part> = self.parts.iter().map(|p| p.clone().unwrap()).collect();
        if Self::hash_of_parts(&parts) != self.header.hash {
            return None;
        }

        let bytes: Vec<u8> = parts.into_iter().flat_map(|p| p.bytes).collect();
        let block = Block::try_from_slice(&bytes).ok()?;
        if block.is_correct() {
            Some(block)
        } else {
            None
        }
    }

    /// Iterate over the parts collected so far.
    pub fn parts(&self) -> impl Iterator<Item = &Part> {
        self.parts.iter().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_set_round_trips_a_block() {
        let block = Block::new(1, vec![vec![1, 2, 3], vec![4, 5]]);
        let parts = PartSet::from_block(&block);
        assert!(parts.is_complete());

        let mut empty = PartSet::empty(parts.header());
        assert!(!empty.is_complete());
        for part in parts.parts() {
            empty.add_part(part.clone());
        }
        assert_eq!(empty.assemble(), Some(block));
    }

    #[test]
    fn part_set_rejects_tampered_parts() {
        let block = Block::new(1, vec![vec![0u8; 100]]);
        let parts = PartSet::from_block(&block);

        let mut empty = PartSet::empty(parts.header());
        for part in parts.parts() {
            let mut part = part.clone();
            part.bytes[0] ^= 0xff;
            empty.add_part(part);
        }
        assert!(empty.is_complete());
        assert_eq!(empty.assemble(), None);
    }

    #[test]
    fn block_ids_differ_when_parts_commitment_differs() {
        let block = Block::new(1, vec![vec![7]]);
        let id_a = block.block_id();
        let mut id_b = id_a;
        id_b.parts.hash[0] ^= 0xff;
        assert_ne!(id_a, id_b);
    }
}
