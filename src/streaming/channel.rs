//! Channel types for the transfer pipeline.
//!
//! Generator -> WorkQueue -> send workers -> network -> receive workers -> merge
//! The work queue is bounded for backpressure.

use crate::error::{Error, Result};
use crate::streaming::codec::base64_len;
use crate::streaming::protocol::{Message, MAX_FRAME_SIZE};
use crate::util::to_wire_path;
use crossbeam_channel::{bounded, Receiver, Sender};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

/// Capacity of the Generator -> send worker queue
pub const WORK_QUEUE_SIZE: usize = 512;

/// Largest single read from a source file (one raw frame per read)
pub const READ_CHUNK_SIZE: usize = 4096;

// a full read chunk must fit in one frame after encoding
const _: () = assert!(base64_len(READ_CHUNK_SIZE) <= MAX_FRAME_SIZE);

// =============================================================================
// SourceHandle
// =============================================================================

/// An open, positioned read handle over one byte range of a file.
///
/// Created by the Generator and moved through the queue to exactly one send
/// worker. Not `Clone`: whoever holds it is the only reader, and dropping it
/// closes the file.
#[derive(Debug)]
pub struct SourceHandle {
    path: PathBuf,
    reader: io::Take<File>,
}

impl SourceHandle {
    /// Open `path` and position it at `offset`, limited to `len` bytes.
    pub fn open(path: &Path, offset: u64, len: u64) -> io::Result<Self> {
        let mut file = File::open(path)?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset))?;
        }
        Ok(Self {
            path: path.to_path_buf(),
            reader: file.take(len),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes still to be read from this range.
    pub fn remaining(&self) -> u64 {
        self.reader.limit()
    }

    /// Fill `buf` as far as the range and the file allow.
    /// Returns 0 once the range is exhausted or the file ended early.
    pub fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }
}

// =============================================================================
// TransferUnit
// =============================================================================

/// One unit of work on either side of the transfer.
///
/// Sender side: `Single`, `Split`, `Block` and `End` flow from the Generator
/// to the send workers. Receiver side: `Split`, `BlockEnd` and `Stop` flow
/// into the merge engine's inbox.
#[derive(Debug)]
pub enum TransferUnit {
    /// Whole file sent in one unit
    Single {
        path: PathBuf,
        size: u64,
        source: SourceHandle,
    },

    /// Header of a file sent as `cnt` blocks
    Split {
        sid: u64,
        path: PathBuf,
        cnt: u64,
        size: u64,
    },

    /// One block of a split file
    Block {
        sid: u64,
        index: u64,
        size: u64,
        source: SourceHandle,
    },

    /// A block has fully landed in the cache
    BlockEnd {
        sid: u64,
        index: u64,
        cache_path: PathBuf,
    },

    /// No more units for this worker
    End { reason: String },

    /// Session-level stop for the merge engine
    Stop { reason: String },

    /// Undecodable message
    BadPacket,
}

impl TransferUnit {
    /// Wire header for this unit (payload bytes are not included).
    pub fn header(&self) -> Message {
        match self {
            TransferUnit::Single { path, size, .. } => Message::Single {
                path: to_wire_path(path),
                size: *size,
            },
            TransferUnit::Split {
                sid,
                path,
                cnt,
                size,
            } => Message::Split {
                sid: *sid,
                path: to_wire_path(path),
                cnt: *cnt,
                size: *size,
            },
            TransferUnit::Block {
                sid, index, size, ..
            } => Message::Block {
                sid: *sid,
                index: *index,
                size: *size,
            },
            TransferUnit::BlockEnd {
                sid,
                index,
                cache_path,
            } => Message::BlockEnd {
                sid: *sid,
                index: *index,
                path: cache_path.to_string_lossy().into_owned(),
            },
            TransferUnit::End { reason } => Message::End {
                reason: reason.clone(),
            },
            TransferUnit::Stop { reason } => Message::StopFm {
                reason: reason.clone(),
            },
            TransferUnit::BadPacket => Message::BadPackage {},
        }
    }
}

// =============================================================================
// WorkQueue
// =============================================================================

/// Bounded multi-producer/multi-consumer queue with drain tracking.
///
/// `push` blocks while the queue is full. Every unit popped counts as done,
/// and `join` blocks until every pushed unit has been popped.
#[derive(Clone)]
pub struct WorkQueue {
    tx: Sender<TransferUnit>,
    rx: Receiver<TransferUnit>,
    pending: Arc<(Mutex<usize>, Condvar)>,
}

impl WorkQueue {
    pub fn bounded(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self {
            tx,
            rx,
            pending: Arc::new((Mutex::new(0), Condvar::new())),
        }
    }

    pub fn push(&self, unit: TransferUnit) -> Result<()> {
        {
            let (lock, _) = &*self.pending;
            *lock.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        }
        self.tx
            .send(unit)
            .map_err(|_| Error::Protocol("work queue disconnected".to_string()))
    }

    /// Block until a unit is available and acknowledge it.
    pub fn pop(&self) -> Result<TransferUnit> {
        let unit = self
            .rx
            .recv()
            .map_err(|_| Error::Protocol("work queue disconnected".to_string()))?;

        let (lock, cvar) = &*self.pending;
        let mut pending = lock.lock().unwrap_or_else(PoisonError::into_inner);
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            cvar.notify_all();
        }
        Ok(unit)
    }

    /// Block until every pushed unit has been popped.
    pub fn join(&self) {
        let (lock, cvar) = &*self.pending;
        let mut pending = lock.lock().unwrap_or_else(PoisonError::into_inner);
        while *pending > 0 {
            pending = cvar.wait(pending).unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::bounded(WORK_QUEUE_SIZE)
    }
}

// =============================================================================
// Tests
// =============================================================================
