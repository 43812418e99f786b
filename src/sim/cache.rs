//! The unified, buffered write-through L1 cache and its memory controller.
//!
//! All traffic between the execution engine and main memory goes through
//! the [`L1Cache`]. Reads that miss fetch an aligned 8-word block from main
//! memory and insert it as a fresh line. Writes that hit update the line in
//! place and hand a [`PendingWrite`] to the [`MemoryController`], a worker
//! thread that owns the only write path into main memory. The channel
//! between them is the bounded write buffer: the execution thread blocks
//! when it is full, the controller blocks when it is empty.
//!
//! Dirtiness is tracked per line as a count of in-flight writes. The
//! counter is shared (atomically) with every pending element for that
//! line, so the controller can mark writes durable without touching the
//! cache structure itself. A line with in-flight writes is never evicted.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel as cbc;
use log::{debug, error};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::mem::{MemBank, BLOCK_WORDS};
use super::word::Word;

/// The number of lines in the cache.
pub const CACHE_LINES: usize = 16;
/// The capacity of the write buffer between cache and memory controller.
pub const WRITE_BUFFER_CAP: usize = 4;

/// One line of the L1 cache: an aligned 8-word block, its tag (the block's
/// base address in main memory), and the count of writes to the line that
/// the memory controller has not yet made durable.
#[derive(Debug)]
pub struct L1CacheLine {
    tag: u32,
    words: [Word; BLOCK_WORDS],
    writes: Arc<AtomicU32>,
}

impl L1CacheLine {
    /// Creates a clean line from a block fetched out of main memory.
    pub fn new(tag: u32, words: [Word; BLOCK_WORDS]) -> Self {
        L1CacheLine { tag, words, writes: Arc::new(AtomicU32::new(0)) }
    }

    /// The base address of the cached block.
    pub fn tag(&self) -> u32 {
        self.tag
    }

    /// The number of writes to this line still sitting in the write buffer.
    pub fn writes(&self) -> u32 {
        self.writes.load(Ordering::Acquire)
    }

    /// A line is dirty while any of its writes are still in flight.
    pub fn is_dirty(&self) -> bool {
        self.writes() > 0
    }

    fn contains(&self, addr: u32) -> bool {
        self.tag <= addr && addr < self.tag + BLOCK_WORDS as u32
    }

    fn word(&self, addr: u32) -> Word {
        self.words[(addr - self.tag) as usize]
    }

    fn set_word(&mut self, word: Word, addr: u32) {
        self.words[(addr - self.tag) as usize] = word;
    }
}

/// A write accepted by the cache but not yet durable in main memory.
///
/// Carries everything the memory controller needs: the target address, the
/// word, the owning line's tag, and a handle on that line's in-flight
/// counter so completion can be recorded from the controller thread.
#[derive(Debug)]
pub struct PendingWrite {
    address: u32,
    word: Word,
    line_tag: u32,
    writes: Arc<AtomicU32>,
}

impl PendingWrite {
    /// The main-memory address this write targets.
    pub fn address(&self) -> u32 {
        self.address
    }

    /// The tag of the cache line this write dirtied.
    pub fn line_tag(&self) -> u32 {
        self.line_tag
    }

    /// Marks the write durable, releasing the line's dirty count.
    fn complete(self) {
        self.writes.fetch_sub(1, Ordering::Release);
    }
}

/// The 16-line, fully associative L1 cache.
///
/// Only the execution thread touches this struct. Lines fill empty slots
/// until the cache is full; after that, replacement picks uniformly at
/// random among clean lines.
#[derive(Debug)]
pub struct L1Cache {
    lines: [Option<L1CacheLine>; CACHE_LINES],
    filled: usize,
    rng: StdRng,
}

impl L1Cache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        L1Cache {
            lines: std::array::from_fn(|_| None),
            filled: 0,
            rng: StdRng::from_entropy(),
        }
    }

    /// Looks up `addr`, returning the cached word on a hit.
    pub fn read(&self, addr: u32) -> Option<Word> {
        for line in self.lines.iter().flatten() {
            if line.contains(addr) {
                debug!("cache read hit: address {addr} in line with tag {}", line.tag);
                return Some(line.word(addr));
            }
        }
        debug!("cache read miss: address {addr}");
        None
    }

    /// Writes `word` at `addr` if the containing block is cached.
    ///
    /// On a hit the line is updated in place, its in-flight count is
    /// raised, and the returned [`PendingWrite`] must be submitted to the
    /// memory controller. On a miss this returns `None` and the caller
    /// fills the line and retries.
    pub fn write(&mut self, word: Word, addr: u32) -> Option<PendingWrite> {
        for line in self.lines.iter_mut().flatten() {
            if line.contains(addr) {
                debug!("cache write hit: address {addr} in line with tag {}", line.tag);
                line.set_word(word, addr);
                line.writes.fetch_add(1, Ordering::AcqRel);
                return Some(PendingWrite {
                    address: addr,
                    word,
                    line_tag: line.tag,
                    writes: Arc::clone(&line.writes),
                });
            }
        }
        debug!("cache write miss: address {addr}");
        None
    }

    /// Inserts a line, evicting a clean line at random if the cache is
    /// full.
    ///
    /// A dirty line is never the victim. If every line is dirty the
    /// execution thread stalls here until the memory controller drains at
    /// least one write; the buffer's capacity keeps this from happening
    /// outside of degenerate schedules.
    pub fn add(&mut self, line: L1CacheLine) {
        if self.filled < CACHE_LINES {
            debug!("caching tag {} in empty slot {}", line.tag, self.filled);
            self.lines[self.filled] = Some(line);
            self.filled += 1;
            return;
        }
        loop {
            let slot = self.rng.gen_range(0..CACHE_LINES);
            let victim_dirty = self.lines[slot].as_ref().is_some_and(L1CacheLine::is_dirty);
            if !victim_dirty {
                debug!("caching tag {} in occupied slot {slot}", line.tag);
                self.lines[slot] = Some(line);
                return;
            }
            if self.lines.iter().flatten().all(L1CacheLine::is_dirty) {
                std::thread::yield_now();
            }
        }
    }

    /// The in-flight write count for the line containing `addr`, if cached.
    pub fn line_writes(&self, addr: u32) -> Option<u32> {
        self.lines
            .iter()
            .flatten()
            .find(|line| line.contains(addr))
            .map(L1CacheLine::writes)
    }

    /// Iterates over the occupied lines.
    pub fn lines(&self) -> impl Iterator<Item = &L1CacheLine> {
        self.lines.iter().flatten()
    }
}

impl Default for L1Cache {
    fn default() -> Self {
        Self::new()
    }
}

enum ControllerMsg {
    Write(PendingWrite),
    /// Drain barrier: reply once every earlier write is durable.
    Sync(cbc::Sender<()>),
    Stop,
}

/// The memory controller: a dedicated worker that drains the write buffer
/// into main memory.
///
/// FIFO order through the buffer guarantees that the last word a program
/// writes to an address is the last word persisted there. Termination is a
/// sentinel message; because the channel is ordered, every write submitted
/// before [`MemoryController::stop`] drains before the worker exits.
#[derive(Debug)]
pub struct MemoryController {
    tx: cbc::Sender<ControllerMsg>,
    worker: Option<JoinHandle<()>>,
}

impl MemoryController {
    /// Spawns the controller worker against the given memory bank.
    pub fn spawn(mem: MemBank) -> Self {
        let (tx, rx) = cbc::bounded::<ControllerMsg>(WRITE_BUFFER_CAP);

        let worker = std::thread::Builder::new()
            .name("memory-controller".into())
            .spawn(move || {
                while let Ok(msg) = rx.recv() {
                    match msg {
                        ControllerMsg::Write(pending) => {
                            debug!(
                                "flushing write buffer element: address {}, line tag {}",
                                pending.address, pending.line_tag
                            );
                            let mut guard = mem
                                .write()
                                .unwrap_or_else(std::sync::PoisonError::into_inner);
                            guard.write(pending.word, pending.address);
                            drop(guard);
                            pending.complete();
                        }
                        ControllerMsg::Sync(reply) => {
                            let _ = reply.send(());
                        }
                        ControllerMsg::Stop => break,
                    }
                }
                debug!("memory controller shutting down");
            })
            .expect("failed to spawn memory controller thread");

        MemoryController { tx, worker: Some(worker) }
    }

    /// Hands a write to the controller.
    ///
    /// Blocks while the write buffer is full; this is the cache-write
    /// back-pressure the execution thread is supposed to feel.
    pub fn submit(&self, pending: PendingWrite) {
        if let Err(cbc::SendError(ControllerMsg::Write(pending))) =
            self.tx.send(ControllerMsg::Write(pending))
        {
            // Controller already gone; the write cannot become durable.
            // Release the dirty count so the cache is not wedged.
            error!("memory controller is not running; dropping write to {}", pending.address);
            pending.complete();
        }
    }

    /// Blocks until every previously submitted write is durable.
    pub fn drain(&self) {
        let (reply_tx, reply_rx) = cbc::bounded(1);
        if self.tx.send(ControllerMsg::Sync(reply_tx)).is_ok() {
            let _ = reply_rx.recv();
        }
    }

    /// Asks the worker to finish draining and exit, then joins it.
    pub fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = self.tx.send(ControllerMsg::Stop);
            let _ = worker.join();
        }
    }
}

impl Drop for MemoryController {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::mem::MainMemory;

    fn line_at(tag: u32, fill: u32) -> L1CacheLine {
        L1CacheLine::new(tag, [Word::from_unsigned(fill); BLOCK_WORDS])
    }

    #[test]
    fn read_misses_then_hits() {
        let mut cache = L1Cache::new();
        assert_eq!(cache.read(100), None);

        cache.add(line_at(96, 7));
        for addr in 96..104 {
            assert_eq!(cache.read(addr).map(Word::as_unsigned), Some(7));
        }
        assert_eq!(cache.read(104), None);
        assert_eq!(cache.read(95), None);
    }

    #[test]
    fn write_hit_updates_line_and_counts() {
        let mut cache = L1Cache::new();
        cache.add(line_at(200, 0));

        let pending = cache.write(Word::from_unsigned(42), 203).expect("hit");
        assert_eq!(pending.address(), 203);
        assert_eq!(pending.line_tag(), 200);
        assert_eq!(cache.read(203).map(Word::as_unsigned), Some(42));
        assert_eq!(cache.line_writes(203), Some(1));

        pending.complete();
        assert_eq!(cache.line_writes(203), Some(0));
    }

    #[test]
    fn write_miss_returns_none() {
        let mut cache = L1Cache::new();
        assert!(cache.write(Word::from_unsigned(1), 50).is_none());
    }

    #[test]
    fn dirty_lines_are_never_evicted() {
        let mut cache = L1Cache::new();
        for i in 0..CACHE_LINES as u32 {
            cache.add(line_at(i * 8, 0));
        }

        // Dirty four lines and hold their pending writes in flight.
        let dirty_tags = [0u32, 16, 32, 48];
        let pendings: Vec<_> = dirty_tags
            .iter()
            .map(|&tag| cache.write(Word::from_unsigned(9), tag).expect("hit"))
            .collect();

        // Churn plenty of new lines through the full cache.
        for i in 0..50u32 {
            cache.add(line_at(1000 + i * 8, 1));
        }

        for &tag in &dirty_tags {
            assert_eq!(
                cache.read(tag).map(Word::as_unsigned),
                Some(9),
                "dirty line with tag {tag} was evicted"
            );
        }
        pendings.into_iter().for_each(PendingWrite::complete);
    }

    #[test]
    fn controller_round_trip_and_drain() {
        let bank = MainMemory::bank();
        let mut cache = L1Cache::new();
        let mut controller = MemoryController::spawn(Arc::clone(&bank));

        cache.add(line_at(200, 0));
        for (i, addr) in (200..208).enumerate() {
            let pending = cache.write(Word::from_unsigned(i as u32 + 1), addr).expect("hit");
            controller.submit(pending);
        }
        controller.drain();

        // After a full drain the cache agrees with main memory everywhere
        // and no writes remain in flight.
        let mem = bank.read().unwrap();
        for addr in 200..208 {
            assert_eq!(mem.read(addr).as_unsigned(), addr - 199);
            assert_eq!(cache.read(addr).map(Word::as_unsigned), Some(addr - 199));
        }
        drop(mem);
        assert!(cache.lines().all(|line| line.writes() == 0));

        controller.stop();
    }

    #[test]
    fn fifo_keeps_last_write_per_address() {
        let bank = MainMemory::bank();
        let mut cache = L1Cache::new();
        let controller = MemoryController::spawn(Arc::clone(&bank));

        cache.add(line_at(64, 0));
        for value in 1..=20u32 {
            let pending = cache.write(Word::from_unsigned(value), 65).expect("hit");
            controller.submit(pending);
        }
        controller.drain();

        assert_eq!(bank.read().unwrap().read(65).as_unsigned(), 20);
        assert_eq!(cache.line_writes(65), Some(0));
    }

    #[test]
    fn stop_drains_remaining_writes() {
        let bank = MainMemory::bank();
        let mut cache = L1Cache::new();
        let mut controller = MemoryController::spawn(Arc::clone(&bank));

        cache.add(line_at(8, 0));
        let pending = cache.write(Word::from_unsigned(123), 8).expect("hit");
        controller.submit(pending);
        controller.stop();

        assert_eq!(bank.read().unwrap().read(8).as_unsigned(), 123);
    }
}
