//! The public logger and its drain worker.
//!
//! `log()` does three things on the caller's thread: encode the record into
//! a frame, take the buffer mutex long enough to copy the frame into the
//! active half (swapping halves first when the half is full or the record
//! crossed a bucket boundary), and — when a swap happened — poke the drain
//! worker. All file IO, compression and encryption run on the worker
//! thread, which exclusively owns the open segment.
//!
//! Errors on the write path are logged and dropped: the record is already
//! staged, and surfacing a disk error from `log()` would help nobody. The
//! read path (`extract` / `parse`) returns its errors instead.

use std::thread::{self, JoinHandle};

use bytes::BytesMut;
use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, error, warn};

use pinenut_core::frame;

use crate::{
    buffer::{DoubleBuffer, Memory, PendingBlock, TrySwap},
    crypt,
    mmap::MappedFile,
    segment::SegmentEngine,
    Config, Domain, Record, Result, Rotation,
};

enum Command {
    /// A swap happened; drain the pending half.
    Drain,
    /// Vacate the active half even if it is not full, then drain.
    Flush,
    /// Delete segments older than `lifetime` seconds.
    Trim { lifetime: u64 },
    /// Drain everything, finalize the open segment, stop.
    Shutdown,
}

/// A handle to one log stream. Cheap to share by reference across threads;
/// one instance per [`Domain`].
pub struct Logger {
    buffer: DoubleBuffer,
    rotation: Rotation,
    sender: Sender<Command>,
    worker: Option<JoinHandle<()>>,
}

impl Logger {
    /// Opens the domain directory, sets up the staging buffer (recovering
    /// any halves a previous run left behind), and spawns the drain worker.
    pub fn new(domain: Domain, config: Config) -> Result<Self> {
        let user_key = match config.key_str.as_deref() {
            Some(encoded) => Some(crypt::decode_public_key(encoded)?),
            None => None,
        };

        let buffer = DoubleBuffer::new(Self::build_memory(&domain, &config))?;
        let mut engine = SegmentEngine::new(
            domain.clone(),
            config.rotation,
            config.compression_level,
            user_key,
        );

        // Replay halves left dirty by a previous run through the regular
        // write path, before any new record is accepted.
        for block in buffer.recover() {
            debug!(len = block.len, "replaying recovered buffer half");
            match engine.write_block(block.started, buffer.block_bytes(&block)) {
                Ok(()) => buffer.recovered(&block),
                Err(err) => error!(%err, "failed to replay recovered buffer half"),
            }
        }

        let (sender, receiver) = crossbeam_channel::unbounded();
        let worker = Worker {
            buffer: buffer.clone(),
            engine,
            receiver,
        };
        let worker = thread::Builder::new()
            .name(format!("pinenut-drain-{}", domain.identifier))
            .spawn(move || worker.run())?;

        Ok(Self {
            buffer,
            rotation: config.rotation,
            sender,
            worker: Some(worker),
        })
    }

    /// Stages one record. The only caller-side suspension point is the
    /// buffer mutex (plus the wait for a stalled drain when both halves are
    /// in flight); never file IO.
    pub fn log(&self, record: &Record) {
        let mut frame = BytesMut::with_capacity(record.estimated_size() + 16);
        frame::encode(record, &mut frame);

        let rotation = self.rotation;
        match self
            .buffer
            .append(&frame, record.datetime, |a, b| rotation.same_bucket(a, b))
        {
            Ok(true) => self.send(Command::Drain),
            Ok(false) => {}
            Err(err) => error!(%err, "failed to stage record"),
        }
    }

    /// Requests an asynchronous drain of whatever is buffered; returns
    /// immediately.
    pub fn flush(&self) {
        self.send(Command::Flush);
    }

    /// Asynchronously deletes segment files whose bucket ended more than
    /// `lifetime` seconds ago. The open segment is never deleted.
    pub fn trim(&self, lifetime: u64) {
        self.send(Command::Trim { lifetime });
    }

    /// Synchronously drains both halves, finalizes the open segment and
    /// stops the worker.
    pub fn shutdown(mut self) {
        self.send(Command::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("drain worker panicked during shutdown");
            }
        }
    }

    fn send(&self, command: Command) {
        if self.sender.send(command).is_err() {
            // Only possible if the worker died; recovery on the next start
            // still has the staged bytes.
            warn!("drain worker is gone; request dropped");
        }
    }

    fn build_memory(domain: &Domain, config: &Config) -> Memory {
        let len = config.buffer_len as usize;
        if config.use_mmap {
            match MappedFile::create(&domain.buffer_path(), len) {
                Ok(mapped) => return Memory::Mapped(mapped),
                Err(err) => {
                    warn!(%err, "mmap buffer unavailable; falling back to heap memory");
                }
            }
        }
        Memory::Heap(vec![0u8; len])
    }
}

// Dropping a `Logger` without `shutdown()` closes the channel; the worker
// exits without draining, which is exactly what crash recovery is for.

struct Worker {
    buffer: DoubleBuffer,
    engine: SegmentEngine,
    receiver: Receiver<Command>,
}

impl Worker {
    fn run(mut self) {
        while let Ok(command) = self.receiver.recv() {
            match command {
                Command::Drain => self.drain_pending(),
                Command::Flush => self.drain_all(),
                Command::Trim { lifetime } => {
                    if let Err(err) = self.engine.trim(lifetime) {
                        error!(%err, "trim failed");
                    }
                }
                Command::Shutdown => {
                    self.drain_all();
                    if let Err(err) = self.engine.finalize() {
                        error!(%err, "failed to finalize segment on shutdown");
                    }
                    return;
                }
            }
        }
        // Channel closed without a shutdown: leave everything staged for the
        // next run's recovery.
    }

    fn drain_pending(&mut self) {
        if let Some(block) = self.buffer.pending() {
            self.persist(block);
        }
    }

    /// Drains the pending half and then the active one, even if partial.
    /// Loops because a caller can vacate a fresh half in between; the worker
    /// must never block on a pending drain it alone can complete.
    fn drain_all(&mut self) {
        loop {
            match self.buffer.try_swap() {
                TrySwap::Vacated(block) => {
                    self.persist(block);
                    break;
                }
                TrySwap::Busy => self.drain_pending(),
                TrySwap::Empty => break,
            }
        }
    }

    fn persist(&mut self, block: PendingBlock) {
        let bytes = self.buffer.block_bytes(&block);
        match self.engine.write_block(block.started, bytes) {
            Ok(()) => self.buffer.complete(&block, true),
            Err(err) => {
                error!(%err, "failed to persist block; half stays dirty for recovery");
                self.buffer.complete(&block, false);
            }
        }
    }
}
