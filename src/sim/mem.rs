//! Main memory for the simulator.
//!
//! The backing store is a flat array of 2048 [`Word`]s. It is shared
//! between the execution thread (which only reads, during cache-miss block
//! fetches) and the memory controller (the only writer), so the canonical
//! handle is [`MemBank`], an `Arc<RwLock<MainMemory>>`.

use std::sync::{Arc, RwLock};

use super::word::Word;

/// The number of words in main memory.
pub const MEM_SIZE: usize = 2048;
/// The highest valid memory address.
pub const MAX_ADDR: u32 = MEM_SIZE as u32 - 1;
/// The number of words in one cache block.
pub const BLOCK_WORDS: usize = 8;

/// Shared handle to main memory.
pub type MemBank = Arc<RwLock<MainMemory>>;

/// The flat, word-addressable backing store.
///
/// Addresses must already be validated against [`MAX_ADDR`]; the execution
/// engine routes out-of-range requests through the machine-fault handler
/// before they ever reach this struct.
#[derive(Debug)]
pub struct MainMemory {
    data: Box<[Word; MEM_SIZE]>,
}

impl MainMemory {
    /// Creates a zeroed memory.
    pub fn new() -> Self {
        MainMemory { data: Box::new([Word::new(); MEM_SIZE]) }
    }

    /// Creates a zeroed memory behind the shared [`MemBank`] handle.
    pub fn bank() -> MemBank {
        Arc::new(RwLock::new(MainMemory::new()))
    }

    /// Reads the word at `addr`.
    pub fn read(&self, addr: u32) -> Word {
        self.data[addr as usize]
    }

    /// Writes `word` to `addr`.
    pub fn write(&mut self, word: Word, addr: u32) {
        self.data[addr as usize] = word;
    }

    /// Fetches the aligned 8-word block containing `addr`.
    ///
    /// The block base is `addr & !7`; the same base is used as the cache
    /// line tag.
    pub fn block(&self, addr: u32) -> [Word; BLOCK_WORDS] {
        let base = (addr & !(BLOCK_WORDS as u32 - 1)) as usize;
        let mut block = [Word::new(); BLOCK_WORDS];
        block.copy_from_slice(&self.data[base..base + BLOCK_WORDS]);
        block
    }
}

impl Default for MainMemory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write_round_trip() {
        let mut mem = MainMemory::new();
        mem.write(Word::from_unsigned(42), 200);
        assert_eq!(mem.read(200).as_unsigned(), 42);
        assert_eq!(mem.read(201).as_unsigned(), 0);
    }

    #[test]
    fn block_is_aligned() {
        let mut mem = MainMemory::new();
        for i in 0..8 {
            mem.write(Word::from_unsigned(100 + i), 96 + i);
        }
        // Any address within the block fetches the same aligned block.
        for addr in 96..104 {
            let block = mem.block(addr);
            for (i, w) in block.iter().enumerate() {
                assert_eq!(w.as_unsigned(), 100 + i as u32);
            }
        }
    }
}
