//! The double-buffered staging region.
//!
//! Encoded record frames are staged here before the drain worker streams
//! them into a segment file. The region is one contiguous allocation — a
//! memory-mapped file or a heap vector — laid out as:
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │ Header (18 bytes)                                          │
//! │ - Magic bytes: "PNBF" (4)                                  │
//! │ - Version (u16 LE)                                         │
//! │ - Active half: 0 = A, 1 = B (u8)                           │
//! │ - Dirty flag for half A (u8)                               │
//! │ - Dirty flag for half B (u8)                               │
//! │ - Padding (1)                                              │
//! │ - Write offset within the active half (u64 LE)             │
//! ├────────────────────────────────────────────────────────────┤
//! │ Half A ((len - 18) / 2 bytes)                              │
//! ├────────────────────────────────────────────────────────────┤
//! │ Half B ((len - 18) / 2 bytes)                              │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! Ownership follows the arena model: the two halves are slabs addressed by
//! index, and a mutex-guarded cursor names the active one. Writers copy
//! frames into the active half under the mutex; the drain worker reads a
//! vacated half without taking it, because a half handed over via
//! [`PendingBlock`] cannot be reused until [`DoubleBuffer::complete`] runs.
//!
//! Crash recovery: every header mutation is written through to the backing
//! memory, so after a crash the dirty flags say which halves still hold
//! unpersisted frames. The active half's extent is the stored write offset;
//! a vacated half is measured by walking its self-delimiting frames up to
//! the terminator byte written at swap time.

use std::{slice, sync::Arc};

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex, MutexGuard};

use pinenut_core::frame;

use crate::{clock, mmap::MappedFile, Error, Result, FORMAT_VERSION};

pub(crate) const MAGIC: [u8; 4] = *b"PNBF";
pub(crate) const HEADER_LEN: usize = 18;

/// Smallest usable backing region: the header plus two halves with room for
/// at least a handful of frames each.
pub(crate) const MIN_BUFFER_LEN: usize = 1024;

/// Backing storage for the staging region.
pub(crate) enum Memory {
    Mapped(MappedFile),
    Heap(Vec<u8>),
}

impl Memory {
    fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            Self::Mapped(map) => map.as_mut_slice(),
            Self::Heap(vec) => vec.as_mut_slice(),
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::Mapped(map) => map.len(),
            Self::Heap(vec) => vec.len(),
        }
    }
}

/// Outcome of a non-blocking swap attempt.
pub(crate) enum TrySwap {
    /// The active half was vacated into a pending block.
    Vacated(PendingBlock),
    /// Nothing is staged.
    Empty,
    /// A previously vacated half has not been drained yet.
    Busy,
}

/// A vacated half travelling from the writer to the drain worker.
#[derive(Clone, Copy, Debug)]
pub(crate) struct PendingBlock {
    pub(crate) half: u8,
    pub(crate) len: usize,
    /// Datetime of the first frame staged in the half; the drain worker
    /// buckets the whole block by it.
    pub(crate) started: DateTime<Utc>,
}

struct State {
    active: u8,
    write_offset: usize,
    dirty: [bool; 2],
    /// Datetime of the first frame in the active half.
    started: Option<DateTime<Utc>>,
    /// A vacated half the drain worker has not persisted yet.
    pending: Option<PendingBlock>,
}

struct Inner {
    state: Mutex<State>,
    drained: Condvar,
    /// Raw view of the backing region. The allocation is pinned for the
    /// lifetime of `_memory` below; `base` never dangles.
    base: *mut u8,
    half_capacity: usize,
    _memory: Memory,
}

// SAFETY: all access to the region behind `base` is disciplined by `state`:
// the header and the active half are touched only under the mutex, a vacated
// half only by the single drain worker holding its `PendingBlock`.
unsafe impl Send for Inner {}
unsafe impl Sync for Inner {}

/// Handle to the staging region; clones share the same buffer.
#[derive(Clone)]
pub(crate) struct DoubleBuffer {
    inner: Arc<Inner>,
}

impl DoubleBuffer {
    /// Wraps backing memory, re-initializing the header whenever it does not
    /// validate (fresh file, corrupted header, or a buffer length change
    /// since the previous run — in which case previous content is
    /// discarded).
    pub(crate) fn new(mut memory: Memory) -> Result<Self> {
        let discard = match &memory {
            Memory::Mapped(mapped) => mapped.was_resized(),
            Memory::Heap(_) => false,
        };
        let len = memory.len();
        if len < MIN_BUFFER_LEN {
            return Err(Error::Config(format!(
                "buffer of {len} bytes cannot hold two usable halves"
            )));
        }
        let half_capacity = (len - HEADER_LEN) / 2;
        let base = memory.as_mut_slice().as_mut_ptr();

        let inner = Inner {
            state: Mutex::new(State {
                active: 0,
                write_offset: 0,
                dirty: [false, false],
                started: None,
                pending: None,
            }),
            drained: Condvar::new(),
            base,
            half_capacity,
            _memory: memory,
        };
        let buffer = Self { inner: Arc::new(inner) };

        let mut state = buffer.inner.state.lock();
        if discard || !buffer.load_header(&mut state) {
            buffer.store_header(&state);
        }
        drop(state);

        Ok(buffer)
    }

    #[inline]
    pub(crate) fn half_capacity(&self) -> usize {
        self.inner.half_capacity
    }

    /// Appends one encoded frame to the active half, swapping first when the
    /// frame would overflow it or `datetime` falls outside the bucket of the
    /// frames already staged. Returns `true` if a swap occurred (a block is
    /// now pending and the drain worker should run).
    pub(crate) fn append(
        &self,
        frame: &[u8],
        datetime: DateTime<Utc>,
        same_bucket: impl Fn(DateTime<Utc>, DateTime<Utc>) -> bool,
    ) -> Result<bool> {
        if frame.len() > self.inner.half_capacity {
            return Err(Error::Config(format!(
                "record frame of {} bytes exceeds the half capacity of {}",
                frame.len(),
                self.inner.half_capacity
            )));
        }

        let mut state = self.inner.state.lock();
        let crosses_bucket = state
            .started
            .is_some_and(|started| !same_bucket(started, datetime));
        let overflows = state.write_offset + frame.len() > self.inner.half_capacity;

        let swapped = if crosses_bucket || overflows {
            self.swap_locked(&mut state).is_some()
        } else {
            false
        };

        let half = state.active;
        let offset = state.write_offset;
        // SAFETY: the active half is only written under the state lock.
        unsafe {
            self.half_slice(half, offset, frame.len()).copy_from_slice(frame);
        }
        if state.started.is_none() {
            state.started = Some(datetime);
        }
        state.write_offset = offset + frame.len();
        state.dirty[half as usize] = true;
        self.store_header(&state);

        Ok(swapped)
    }

    /// Non-blocking swap for the drain worker (flush / shutdown path): the
    /// worker must never wait for a pending drain, because it is the one who
    /// completes them.
    pub(crate) fn try_swap(&self) -> TrySwap {
        let mut state = self.inner.state.lock();
        if state.pending.is_some() {
            return TrySwap::Busy;
        }
        // With no pending block, `swap_locked` cannot wait.
        match self.swap_locked(&mut state) {
            Some(block) => TrySwap::Vacated(block),
            None => TrySwap::Empty,
        }
    }

    /// The block currently awaiting a drain, if any.
    pub(crate) fn pending(&self) -> Option<PendingBlock> {
        self.inner.state.lock().pending
    }

    /// Bytes of a pending block.
    ///
    /// Safe without the lock: the half named by `block` cannot become active
    /// again until [`DoubleBuffer::complete`] clears the pending state.
    pub(crate) fn block_bytes(&self, block: &PendingBlock) -> &[u8] {
        // SAFETY: see above; `block.len` never exceeds the half capacity.
        unsafe { self.half_slice(block.half, 0, block.len) }
    }

    /// Marks the pending block drained. `persisted` clears the half's dirty
    /// flag; on a failed drain the flag stays set so a later restart can
    /// still replay the half, but the half is released for reuse either way
    /// (staging is best-effort once the disk misbehaves).
    pub(crate) fn complete(&self, block: &PendingBlock, persisted: bool) {
        let mut state = self.inner.state.lock();
        if persisted {
            state.dirty[block.half as usize] = false;
        }
        state.pending = None;
        self.store_header(&state);
        self.inner.drained.notify_all();
    }

    /// Halves left dirty by a previous process run, oldest first. Meant to
    /// run before the drain worker exists; each returned block should be
    /// replayed through the segment engine and acknowledged with
    /// [`DoubleBuffer::recovered`].
    pub(crate) fn recover(&self) -> Vec<PendingBlock> {
        let mut state = self.inner.state.lock();
        let mut blocks = Vec::new();

        let inactive = state.active ^ 1;
        for half in [inactive, state.active] {
            if !state.dirty[half as usize] {
                continue;
            }
            let len = if half == state.active {
                state.write_offset
            } else {
                self.scan_frames(half)
            };
            if len == 0 {
                state.dirty[half as usize] = false;
                continue;
            }
            // SAFETY: single-threaded here; no worker exists yet.
            let bytes = unsafe { self.half_slice(half, 0, len) };
            let started = frame::peek_secs(bytes)
                .and_then(|secs| DateTime::from_timestamp(secs, 0))
                .unwrap_or_else(clock::now);
            blocks.push(PendingBlock { half, len, started });
        }
        self.store_header(&state);
        blocks
    }

    /// Acknowledges that a recovered block reached its segment file.
    pub(crate) fn recovered(&self, block: &PendingBlock) {
        let mut state = self.inner.state.lock();
        state.dirty[block.half as usize] = false;
        if block.half == state.active {
            state.write_offset = 0;
            state.started = None;
        }
        self.store_header(&state);
    }

    // ---------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------

    fn swap_locked(&self, state: &mut MutexGuard<'_, State>) -> Option<PendingBlock> {
        // The previous drain must release the other half before it can be
        // written again; with a stalled disk this is where callers block.
        while state.pending.is_some() {
            self.inner.drained.wait(state);
        }

        if state.write_offset == 0 {
            state.started = None;
            return None;
        }

        let block = PendingBlock {
            half: state.active,
            len: state.write_offset,
            started: state.started.take().unwrap_or_else(clock::now),
        };

        // Terminator: a crash-time recovery scan of this half must stop at
        // the true end rather than run into stale bytes of an earlier fill.
        if block.len < self.inner.half_capacity {
            // SAFETY: offset checked against the half capacity above.
            unsafe {
                self.half_slice(block.half, block.len, 1)[0] = 0;
            }
        }

        state.active ^= 1;
        state.write_offset = 0;
        state.pending = Some(block);
        self.store_header(state);

        Some(block)
    }

    /// Measures a vacated half by walking its frames.
    fn scan_frames(&self, half: u8) -> usize {
        // SAFETY: called either before the worker exists (recovery) or for a
        // half the caller owns.
        let bytes = unsafe { self.half_slice(half, 0, self.inner.half_capacity) };
        let mut pos = 0;
        while let Some(len) = frame::frame_len(&bytes[pos..]) {
            pos += len;
        }
        pos
    }

    /// Raw view of `len` bytes of `half` starting at `offset`.
    ///
    /// # Safety
    ///
    /// The caller must own the half under the arena discipline described in
    /// the module docs, and `offset + len` must not exceed the half
    /// capacity.
    #[allow(clippy::mut_from_ref)]
    unsafe fn half_slice(&self, half: u8, offset: usize, len: usize) -> &mut [u8] {
        debug_assert!(half <= 1);
        debug_assert!(offset + len <= self.inner.half_capacity);
        let start = HEADER_LEN + half as usize * self.inner.half_capacity + offset;
        slice::from_raw_parts_mut(self.inner.base.add(start), len)
    }

    /// Writes the header fields through to the backing memory.
    fn store_header(&self, state: &State) {
        // SAFETY: header writes happen only under the state lock; the header
        // region is disjoint from both halves.
        let header = unsafe { slice::from_raw_parts_mut(self.inner.base, HEADER_LEN) };
        header[0..4].copy_from_slice(&MAGIC);
        header[4..6].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        header[6] = state.active;
        header[7] = state.dirty[0] as u8;
        header[8] = state.dirty[1] as u8;
        header[9] = 0;
        header[10..18].copy_from_slice(&(state.write_offset as u64).to_le_bytes());
    }

    /// Loads the persisted header into `state`; `false` when it does not
    /// validate.
    fn load_header(&self, state: &mut MutexGuard<'_, State>) -> bool {
        // SAFETY: construction-time, single-threaded.
        let header = unsafe { slice::from_raw_parts(self.inner.base as *const u8, HEADER_LEN) };
        if header[0..4] != MAGIC {
            return false;
        }
        let version = u16::from_le_bytes([header[4], header[5]]);
        let active = header[6];
        let write_offset = u64::from_le_bytes(header[10..18].try_into().unwrap_or_default());
        if version != FORMAT_VERSION || active > 1 || write_offset > self.inner.half_capacity as u64
        {
            return false;
        }

        state.active = active;
        state.write_offset = write_offset as usize;
        state.dirty = [header[7] != 0, header[8] != 0];
        true
    }
}
