/*
    Copyright © 2024, TenderBFT Contributors
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for the messages that validators exchange to drive consensus, and traits for
//! checking their signatures.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::crypto::SignatureScheme;
use crate::types::{
    Address, BlockHeight, BlockId, ChainID, Part, PublicKeyBytes, Round, SignatureBytes,
};

/// The two voting phases of a round. A round gathers prevotes first, then precommits.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, BorshSerialize, BorshDeserialize)]
pub enum VoteType {
    Prevote,
    Precommit,
}

/// A signed vote for a block, or for nil (`block_id == None`).
///
/// A validator may cast at most one vote per (height, round, type). Two different votes from the
/// same validator for the same (height, round, type) are
/// [equivocation](crate::evidence::Equivocation).
#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub struct Vote {
    pub chain_id: ChainID,
    pub height: BlockHeight,
    pub round: Round,
    pub vote_type: VoteType,
    pub block_id: Option<BlockId>,
    pub validator: Address,
    /// Milliseconds since the unix epoch at signing time. Informational only: excluded from
    /// equality of intent, but included in the signed bytes.
    pub timestamp: u64,
    pub signature: SignatureBytes,
}

impl Vote {
    /// Create and sign a vote.
    pub fn new<S: SignatureScheme>(
        scheme: &S,
        chain_id: ChainID,
        height: BlockHeight,
        round: Round,
        vote_type: VoteType,
        block_id: Option<BlockId>,
        validator: Address,
        timestamp: u64,
    ) -> Vote {
        let mut vote = Vote {
            chain_id,
            height,
            round,
            vote_type,
            block_id,
            validator,
            timestamp,
            signature: Vec::new(),
        };
        vote.signature = scheme.sign(&vote.signed_bytes());
        vote
    }

    pub fn is_nil(&self) -> bool {
        self.block_id.is_none()
    }

    fn signed_bytes(&self) -> Vec<u8> {
        (
            self.chain_id,
            self.height,
            self.round,
            self.vote_type,
            self.block_id,
            self.validator,
            self.timestamp,
        )
            .try_to_vec()
            .unwrap()
    }
}

/// A signed proposal for a (height, round): the proposer's commitment to a block id, with the
/// block's bytes following separately as [BlockPartMessage]s.
///
/// `pol_round` is the proof-of-lock round: `Some(r)` asserts that the proposed block gathered a
/// 2/3 prevote majority at round `r` of the same height, which lets validators locked on an older
/// round prevote for it.
#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub struct Proposal {
    pub chain_id: ChainID,
    pub height: BlockHeight,
    pub round: Round,
    pub block_id: BlockId,
    pub pol_round: Option<Round>,
    pub signature: SignatureBytes,
}

impl Proposal {
    /// Create and sign a proposal.
    pub fn new<S: SignatureScheme>(
        scheme: &S,
        chain_id: ChainID,
        height: BlockHeight,
        round: Round,
        block_id: BlockId,
        pol_round: Option<Round>,
    ) -> Proposal {
        let mut proposal = Proposal {
            chain_id,
            height,
            round,
            block_id,
            pol_round,
            signature: Vec::new(),
        };
        proposal.signature = scheme.sign(&proposal.signed_bytes());
        proposal
    }

    fn signed_bytes(&self) -> Vec<u8> {
        (
            self.chain_id,
            self.height,
            self.round,
            self.block_id,
            self.pol_round,
        )
            .try_to_vec()
            .unwrap()
    }
}

/// One chunk of a proposed block's encoding. Unsigned: each part is checked against the part set
/// commitment in the proposal's block id instead.
#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub struct BlockPartMessage {
    pub chain_id: ChainID,
    pub height: BlockHeight,
    pub round: Round,
    pub part: Part,
}

/// A message exchanged between validators as part of the consensus protocol.
#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub enum ConsensusMessage {
    Proposal(Proposal),
    BlockPart(BlockPartMessage),
    Vote(Vote),
}

impl ConsensusMessage {
    pub fn chain_id(&self) -> ChainID {
        match self {
            ConsensusMessage::Proposal(proposal) => proposal.chain_id,
            ConsensusMessage::BlockPart(block_part) => block_part.chain_id,
            ConsensusMessage::Vote(vote) => vote.chain_id,
        }
    }

    pub fn height(&self) -> BlockHeight {
        match self {
            ConsensusMessage::Proposal(proposal) => proposal.height,
            ConsensusMessage::BlockPart(block_part) => block_part.height,
            ConsensusMessage::Vote(vote) => vote.height,
        }
    }

    pub fn round(&self) -> Round {
        match self {
            ConsensusMessage::Proposal(proposal) => proposal.round,
            ConsensusMessage::BlockPart(block_part) => block_part.round,
            ConsensusMessage::Vote(vote) => vote.round,
        }
    }
}

/// A message with a signature that can be checked against a public key.
pub trait SignedMessage {
    /// The bytes the signature was computed over.
    fn message_bytes(&self) -> Vec<u8>;

    fn signature_bytes(&self) -> &SignatureBytes;

    /// Verify the signature against `public_key`.
    fn is_correct<S: SignatureScheme>(&self, public_key: &PublicKeyBytes) -> bool {
        S::verify(public_key, &self.message_bytes(), self.signature_bytes())
    }
}

impl SignedMessage for Vote {
    fn message_bytes(&self) -> Vec<u8> {
        self.signed_bytes()
    }

    fn signature_bytes(&self) -> &SignatureBytes {
        &self.signature
    }
}

impl SignedMessage for Proposal {
    fn message_bytes(&self) -> Vec<u8> {
        self.signed_bytes()
    }

    fn signature_bytes(&self) -> &SignatureBytes {
        &self.signature
    }
}
