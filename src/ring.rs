//! Bounded ring buffer connecting pipeline threads.
//!
//! One ring backs each cache-to-exporter path. The producer and consumer
//! keep private head/tail bookkeeping and only meet on a shared sync
//! structure after advancing by a block of `capacity / 8` operations,
//! which amortises cross-thread synchronisation over many pushes and
//! pops. Indices are monotonically increasing `u32` counters; distances
//! are taken with wrapping subtraction and stay well defined across the
//! 2^32 wrap.
//!
//! `push` blocks until a slot is free. `pop` blocks for a short wake
//! interval at most, so a consumer can poll its shutdown flag between
//! calls. With `mw_mode`, multiple producers are serialised by a writer
//! lock; there is always exactly one consumer.

use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// How long a blocked side waits before re-checking the shared state.
const WAKE_INTERVAL: Duration = Duration::from_millis(10);

struct ReaderHalf {
    /// Slot of the next pop, in `[0, size)`.
    data_idx: u32,
    /// Monotonic read head.
    read_idx: u32,
    /// Reader may consume up to here (exclusive), learned at last sync.
    exchange_idx: u32,
    /// Read head at the last sync.
    commit_idx: u32,
}

struct WriterHalf {
    /// Slot of the next push, in `[0, size)`.
    data_idx: u32,
    /// Monotonic write head.
    write_idx: u32,
    /// Writer may produce up to here (exclusive), learned at last sync.
    exchange_idx: u32,
    /// Write head at the last sync.
    commit_idx: u32,
}

struct SyncState {
    /// Consumer limit: the reader may read up to here.
    read_limit: u32,
    /// Producer limit: the writer may write up to here.
    write_limit: u32,
}

/// Fixed-capacity ring of records moved between two threads.
pub struct Ring<T> {
    size: u32,
    div_block: u32,
    mw_mode: bool,

    reader: CachePadded<Mutex<ReaderHalf>>,
    writer: CachePadded<Mutex<WriterHalf>>,
    /// Serialises producers in multi-writer mode.
    writer_lock: Mutex<()>,

    sync: Mutex<SyncState>,
    cond_reader: Condvar,
    cond_writer: Condvar,

    /// Published monotonic heads; `cnt` and the consumer's steal path
    /// read these from the other side.
    write_head: CachePadded<AtomicU32>,
    read_head: CachePadded<AtomicU32>,

    // Slot mutexes are never contended: the index protocol hands each
    // slot to exactly one side at a time.
    data: Box<[Mutex<Option<T>>]>,
}

impl<T> Ring<T> {
    /// Create a ring holding up to `size` records.
    pub fn with_capacity(size: u32, mw_mode: bool) -> Self {
        assert!(size >= 2, "ring capacity must be at least 2");
        let mut data = Vec::with_capacity(size as usize);
        data.resize_with(size as usize, || Mutex::new(None));
        let data = data.into_boxed_slice();
        Self {
            size,
            div_block: (size / 8).max(1),
            mw_mode,
            reader: CachePadded::new(Mutex::new(ReaderHalf {
                data_idx: 0,
                read_idx: 0,
                exchange_idx: 0,
                commit_idx: 0,
            })),
            writer: CachePadded::new(Mutex::new(WriterHalf {
                data_idx: 0,
                write_idx: 0,
                exchange_idx: size,
                commit_idx: 0,
            })),
            writer_lock: Mutex::new(()),
            sync: Mutex::new(SyncState {
                read_limit: 0,
                write_limit: size,
            }),
            cond_reader: Condvar::new(),
            cond_writer: Condvar::new(),
            write_head: CachePadded::new(AtomicU32::new(0)),
            read_head: CachePadded::new(AtomicU32::new(0)),
            data,
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Records currently in flight: total pushes minus total pops.
    pub fn cnt(&self) -> u32 {
        self.write_head
            .load(Ordering::Acquire)
            .wrapping_sub(self.read_head.load(Ordering::Acquire))
    }

    /// Append a record, blocking while the ring is full.
    pub fn push(&self, item: T) {
        let _mw_guard = self
            .mw_mode
            .then(|| self.writer_lock.lock().unwrap_or_else(|e| e.into_inner()));
        let mut w = self.writer.lock().unwrap_or_else(|e| e.into_inner());

        if w.exchange_idx.wrapping_sub(w.write_idx) == 0 {
            let mut sync = self.sync.lock().unwrap_or_else(|e| e.into_inner());
            w.exchange_idx = sync.write_limit;
            while w.exchange_idx.wrapping_sub(w.write_idx) == 0 {
                // Buffer still full after sync; nudge the consumer and wait.
                self.cond_reader.notify_one();
                let (guard, _) = self
                    .cond_writer
                    .wait_timeout(sync, WAKE_INTERVAL)
                    .unwrap_or_else(|e| e.into_inner());
                sync = guard;
                w.exchange_idx = sync.write_limit;
            }
            self.cond_reader.notify_one();
        }

        *self.data[w.data_idx as usize]
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(item);

        w.data_idx += 1;
        if w.data_idx == self.size {
            w.data_idx = 0;
        }
        w.write_idx = w.write_idx.wrapping_add(1);
        self.write_head.store(w.write_idx, Ordering::Release);

        if w.write_idx.wrapping_sub(w.commit_idx) >= self.div_block {
            let mut sync = self.sync.lock().unwrap_or_else(|e| e.into_inner());
            sync.read_limit = w.write_idx;
            w.exchange_idx = sync.write_limit;
            w.commit_idx = w.write_idx;
            self.cond_reader.notify_one();
        }
    }

    /// Take the oldest record. Returns `None` when nothing arrived within
    /// the wake interval, so the caller can check its shutdown flag.
    pub fn pop(&self) -> Option<T> {
        let mut r = self.reader.lock().unwrap_or_else(|e| e.into_inner());

        // Publish consumed slots once a block of them has accumulated.
        if r.read_idx.wrapping_sub(r.commit_idx) >= self.div_block {
            let mut sync = self.sync.lock().unwrap_or_else(|e| e.into_inner());
            sync.write_limit = sync
                .write_limit
                .wrapping_add(r.read_idx.wrapping_sub(r.commit_idx));
            r.exchange_idx = sync.read_limit;
            r.commit_idx = r.read_idx;
            self.cond_writer.notify_one();
        }

        if r.exchange_idx.wrapping_sub(r.read_idx) == 0 {
            let mut sync = self.sync.lock().unwrap_or_else(|e| e.into_inner());
            r.exchange_idx = sync.read_limit;
            if r.exchange_idx.wrapping_sub(r.read_idx) == 0 {
                self.cond_writer.notify_one();
                let (guard, _) = self
                    .cond_reader
                    .wait_timeout(sync, WAKE_INTERVAL)
                    .unwrap_or_else(|e| e.into_inner());
                sync = guard;
                r.exchange_idx = sync.read_limit;
            }
            if r.exchange_idx.wrapping_sub(r.read_idx) == 0 {
                // The producer has not synced yet; steal whatever it has
                // already committed to the slots.
                sync.read_limit = self.write_head.load(Ordering::Acquire);
                r.exchange_idx = sync.read_limit;
            }
            drop(sync);
            if r.exchange_idx.wrapping_sub(r.read_idx) == 0 {
                return None;
            }
        }

        let item = self.data[r.data_idx as usize]
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        debug_assert!(item.is_some(), "slot owned by reader must be filled");

        r.data_idx += 1;
        if r.data_idx == self.size {
            r.data_idx = 0;
        }
        r.read_idx = r.read_idx.wrapping_add(1);
        self.read_head.store(r.read_idx, Ordering::Release);
        item
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        let cnt = self.cnt();
        if cnt != 0 {
            log::warn!("dropping ring buffer with {cnt} unprocessed record(s)");
        }
    }
}
