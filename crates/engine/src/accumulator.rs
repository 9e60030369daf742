use chatflow_llm::{Block, BlockId, Message, MessageId, Role};

/// Folds a block sequence into the blocks of one message.
///
/// An incoming block replaces the last block when that one is pending and is
/// appended otherwise. Ids are rewritten to the slot index so replaying the same
/// sequence always yields the same blocks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlockAccumulator {
    blocks: Vec<Block>,
}

impl BlockAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one block and returns it as stored.
    pub fn push(&mut self, block: Block) -> &Block {
        let replaces_last = self.blocks.last().is_some_and(|last| last.pending);
        let slot = if replaces_last {
            self.blocks.len() - 1
        } else {
            self.blocks.len()
        };
        let block = block.with_id(BlockId::new(u32::try_from(slot).unwrap_or(u32::MAX)));

        if replaces_last {
            self.blocks[slot] = block;
        } else {
            self.blocks.push(block);
        }
        &self.blocks[slot]
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn last(&self) -> Option<&Block> {
        self.blocks.last()
    }

    /// Blocks without a trailing pending fragment.
    pub fn finalized(&self) -> Vec<Block> {
        let keep = match self.blocks.last() {
            Some(last) if last.pending => self.blocks.len() - 1,
            _ => self.blocks.len(),
        };
        self.blocks[..keep].to_vec()
    }

    /// Builds the message view of the blocks folded so far.
    pub fn to_message(&self, id: MessageId, role: Role) -> Message {
        let mut message = Message::new(role, self.blocks.clone());
        message.id = id;
        message
    }
}
