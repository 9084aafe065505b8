//! Send worker: one thread per data connection.
//!
//! Pops TransferUnits from the WorkQueue, sends a JSON header for each and
//! streams file bytes as raw frames, then waits for the peer's heartbeat
//! before taking the next unit.

use crate::error::{Error, Result};
use crate::locale::Locale;
use crate::streaming::channel::{SourceHandle, TransferUnit, WorkQueue, READ_CHUNK_SIZE};
use crate::streaming::protocol::{Format, Packer};
use crate::util::short_path;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::Span;

/// What one worker pushed over its connection
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SendStats {
    /// Single and block units carrying payload
    pub units: u64,
    pub bytes: u64,
}

pub struct SendWorker {
    uid: usize,
    queue: WorkQueue,
    packer: Packer,
    locale: Arc<Locale>,
    span: Span,
}

impl SendWorker {
    pub fn new(uid: usize, queue: WorkQueue, locale: Arc<Locale>, span: Span) -> Self {
        Self {
            uid,
            queue,
            packer: Packer::loose().with_span(span.clone()),
            locale,
            span,
        }
    }

    /// Run on its own named thread, owning `conn`.
    pub fn spawn(self, conn: TcpStream) -> Result<JoinHandle<Result<SendStats>>> {
        let handle = thread::Builder::new()
            .name(format!("send-{}", self.uid))
            .spawn(move || {
                let mut conn = conn;
                self.run(&mut conn)
            })?;
        Ok(handle)
    }

    /// Work until an `End` unit arrives.
    ///
    /// If the connection fails before the worker has taken its `End`, it
    /// keeps popping (and dropping) units up to that `End` so the Generator
    /// can still drain the queue. A failure during the `End` exchange itself
    /// leaves the queue alone.
    pub fn run<S: Read + Write>(self, conn: &mut S) -> Result<SendStats> {
        tracing::info!(
            parent: &self.span,
            "{}",
            self.locale.format("send.thread.start", &[&self.uid])
        );

        let mut stats = SendStats::default();
        let mut ended = false;
        match self.work(conn, &mut stats, &mut ended) {
            Ok(reason) => {
                tracing::info!(
                    parent: &self.span,
                    units = stats.units,
                    bytes = stats.bytes,
                    "{}",
                    self.locale.format("send.thread.exit", &[&self.uid, &reason])
                );
                Ok(stats)
            }
            Err(e) => {
                tracing::error!(
                    parent: &self.span,
                    error = %e,
                    "{}",
                    self.locale.format("send.thread.exit", &[&self.uid, &e])
                );
                if !ended {
                    self.drain();
                }
                Err(e)
            }
        }
    }

    fn work<S: Read + Write>(
        &self,
        conn: &mut S,
        stats: &mut SendStats,
        ended: &mut bool,
    ) -> Result<String> {
        loop {
            let unit = self.queue.pop()?;
            let header = unit.header();

            match unit {
                TransferUnit::End { reason } => {
                    *ended = true;
                    self.packer.send(conn, &header, Format::Json)?;
                    self.packer.recv_raw(conn)?;
                    return Ok(reason);
                }
                TransferUnit::Split { .. } => {
                    self.packer.send(conn, &header, Format::Json)?;
                }
                TransferUnit::Single { size, source, .. }
                | TransferUnit::Block { size, source, .. } => {
                    self.packer.send(conn, &header, Format::Json)?;
                    self.stream(conn, source, size)?;
                    stats.units += 1;
                    stats.bytes += size;
                }
                other => {
                    tracing::warn!(parent: &self.span, unit = ?other.header(), "unexpected unit");
                    continue;
                }
            }

            // heartbeat: one unit in flight per connection
            self.packer.recv_raw(conn)?;
        }
    }

    /// Send exactly `size` bytes from `source` as raw frames.
    ///
    /// A source that ends early is padded with zeros so the peer's byte
    /// count still matches the header.
    fn stream<W: Write>(&self, conn: &mut W, mut source: SourceHandle, size: u64) -> Result<()> {
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        let mut left = size;
        let mut padding = false;

        while left > 0 {
            let want = left.min(READ_CHUNK_SIZE as u64) as usize;
            let n = source.read_chunk(&mut buf[..want])?;
            if n < want {
                if !padding {
                    tracing::warn!(
                        parent: &self.span,
                        path = %short_path(&source.path().to_string_lossy(), 50),
                        "{}",
                        self.locale.format("send.thread.short_read", &[&(left - n as u64)])
                    );
                    padding = true;
                }
                buf[n..want].fill(0);
            }
            self.packer.send_raw(conn, &buf[..want])?;
            left -= want as u64;
        }
        Ok(())
    }

    fn drain(&self) {
        loop {
            match self.queue.pop() {
                Ok(TransferUnit::End { .. }) | Err(_) => return,
                Ok(_) => {}
            }
        }
    }
}

/// Join send workers, keeping the first failure.
pub fn join_all(handles: Vec<JoinHandle<Result<SendStats>>>) -> Result<SendStats> {
    let mut total = SendStats::default();
    let mut first_err = None;
    for handle in handles {
        match handle.join() {
            Ok(Ok(stats)) => {
                total.units += stats.units;
                total.bytes += stats.bytes;
            }
            Ok(Err(e)) => {
                first_err.get_or_insert(e);
            }
            Err(_) => {
                first_err.get_or_insert(Error::Protocol("send worker panicked".to_string()));
            }
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(total),
    }
}
