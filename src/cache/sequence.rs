//! The scheduler-facing view of a sequence.
//!
//! The block manager does not own sequences. It reads a sequence's token ids
//! and running status and mutates only its block table, through
//! [`BlockSequence`]. [`Sequence`] is a plain implementation for callers that
//! have no sequence type of their own.

use crate::cache::block::{BlockTable, TokenId};

/// What the block manager needs from a scheduler's sequence.
pub trait BlockSequence {
    /// All tokens of the sequence: prompt followed by generated tokens.
    fn token_ids(&self) -> &[TokenId];

    fn block_table(&self) -> &BlockTable;

    fn block_table_mut(&mut self) -> &mut BlockTable;

    /// Whether the scheduler is currently running this sequence.
    fn is_running(&self) -> bool;
}

/// Scheduling status of a [`Sequence`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceStatus {
    Waiting,
    Running,
    Finished,
}

#[derive(Debug, Clone)]
pub struct Sequence {
    pub id: u64,
    pub token_ids: Vec<TokenId>,
    pub block_table: BlockTable,
    pub status: SequenceStatus,
}

impl Sequence {
    /// A running sequence with an empty block table.
    pub fn new(id: u64, token_ids: Vec<TokenId>) -> Self {
        Self {
            id,
            token_ids,
            block_table: BlockTable::new(),
            status: SequenceStatus::Running,
        }
    }

    /// Record a generated token.
    pub fn push_token(&mut self, token: TokenId) {
        self.token_ids.push(token);
    }

    pub fn len(&self) -> usize {
        self.token_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.token_ids.is_empty()
    }
}

impl BlockSequence for Sequence {
    fn token_ids(&self) -> &[TokenId] {
        &self.token_ids
    }

    fn block_table(&self) -> &BlockTable {
        &self.block_table
    }

    fn block_table_mut(&mut self) -> &mut BlockTable {
        &mut self.block_table
    }

    fn is_running(&self) -> bool {
        self.status == SequenceStatus::Running
    }
}
