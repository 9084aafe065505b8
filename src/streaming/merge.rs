//! Merge engine: reassembles split files from cached blocks.
//!
//! Receive workers post `Split` and `BlockEnd` notifications into one inbox.
//! A dispatcher routes them to one merge thread per split id, each with its
//! own lane. Blocks may arrive in any order; a merge thread only ever
//! appends block `next_index` and buffers the rest until they become
//! contiguous. The session ends when the control connection delivers
//! `stop_fm` (or closes).

use crate::error::{Error, Result};
use crate::locale::Locale;
use crate::streaming::channel::TransferUnit;
use crate::streaming::protocol::{Message, Packer, PacketError};
use crate::util::short_path;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::Span;

/// Idle wait of a merge thread between inbox polls.
pub const MERGE_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MergeStats {
    pub merged_files: u64,
    pub blocks: u64,
}

/// Per-split inbox. The receiving end is taken when the merge thread starts.
struct Lane {
    tx: Sender<TransferUnit>,
    rx: Option<Receiver<TransferUnit>>,
}

impl Lane {
    fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx: Some(rx) }
    }
}

pub struct MergeEngine {
    inbox_tx: Sender<TransferUnit>,
    inbox_rx: Receiver<TransferUnit>,
    locale: Arc<Locale>,
    span: Span,
    poll: Duration,
}

impl MergeEngine {
    pub fn new(locale: Arc<Locale>, span: Span) -> Self {
        let (inbox_tx, inbox_rx) = unbounded();
        Self {
            inbox_tx,
            inbox_rx,
            locale,
            span,
            poll: MERGE_POLL,
        }
    }

    /// Handle for receive workers to post notifications.
    pub fn inbox(&self) -> Sender<TransferUnit> {
        self.inbox_tx.clone()
    }

    /// Dispatch until stopped, then wait for every merge thread.
    ///
    /// `control` is read on a background thread for `stop_fm`.
    pub fn run<C>(self, control: C) -> Result<MergeStats>
    where
        C: Read + Send + 'static,
    {
        let MergeEngine {
            inbox_tx,
            inbox_rx,
            locale,
            span,
            poll,
        } = self;
        let reader = spawn_control_reader(control, inbox_tx.clone(), span.clone())?;
        // only workers and the control reader may keep the inbox open
        drop(inbox_tx);

        let mut lanes: HashMap<u64, Lane> = HashMap::new();
        let mut merges: Vec<(u64, JoinHandle<Result<u64>>)> = Vec::new();

        let stop_reason = loop {
            let unit = match inbox_rx.recv() {
                Ok(unit) => unit,
                Err(_) => break "inbox closed".to_string(),
            };
            match unit {
                TransferUnit::Stop { reason } => break reason,
                TransferUnit::Split { sid, path, cnt, .. } => {
                    let lane = lanes.entry(sid).or_insert_with(Lane::new);
                    let Some(rx) = lane.rx.take() else {
                        tracing::warn!(parent: &span, sid, "duplicate split header");
                        continue;
                    };
                    tracing::info!(
                        parent: &span,
                        cnt,
                        "{}",
                        locale.format(
                            "recv.file_merge.start",
                            &[&sid, &short_path(&path.to_string_lossy(), 50)]
                        )
                    );
                    let merge_span = span.clone();
                    let handle = thread::Builder::new()
                        .name(format!("merge-{}", sid))
                        .spawn(move || merge_split(rx, &path, cnt, poll, &merge_span))?;
                    merges.push((sid, handle));
                }
                TransferUnit::BlockEnd {
                    sid,
                    index,
                    cache_path,
                } => {
                    let lane = lanes.entry(sid).or_insert_with(Lane::new);
                    let block = TransferUnit::BlockEnd {
                        sid,
                        index,
                        cache_path,
                    };
                    if lane.tx.send(block).is_err() {
                        tracing::warn!(parent: &span, sid, index, "merge already finished");
                    }
                }
                other => {
                    tracing::warn!(parent: &span, unit = ?other.header(), "unexpected unit in merge inbox");
                }
            }
        };

        tracing::info!(
            parent: &span,
            "{}",
            locale.format("recv.file_merge.stop", &[&stop_reason])
        );

        // blocks whose split header never started a merge
        for (sid, lane) in &lanes {
            if let Some(rx) = &lane.rx {
                let orphans = discard_blocks(rx);
                if orphans > 0 {
                    tracing::warn!(parent: &span, sid, blocks = orphans, "discarded blocks without a split");
                }
            }
        }

        // merge threads drain what is queued, then see their lane close
        drop(lanes);

        let mut stats = MergeStats::default();
        let mut first_err = None;
        for (sid, handle) in merges {
            match handle.join() {
                Ok(Ok(blocks)) => {
                    stats.merged_files += 1;
                    stats.blocks += blocks;
                    tracing::info!(
                        parent: &span,
                        "{}",
                        locale.format("recv.file_merge.done", &[&sid, &blocks])
                    );
                }
                Ok(Err(e)) => {
                    tracing::error!(parent: &span, sid, error = %e, "merge failed");
                    first_err.get_or_insert(e);
                }
                Err(_) => {
                    first_err.get_or_insert(Error::Protocol(format!("merge {} panicked", sid)));
                }
            }
        }

        if reader.join().is_err() {
            first_err.get_or_insert(Error::Protocol("control reader panicked".to_string()));
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(stats),
        }
    }
}

/// Delete the cache files queued on a lane that has no merge thread.
fn discard_blocks(rx: &Receiver<TransferUnit>) -> usize {
    let mut count = 0;
    for unit in rx.try_iter() {
        if let TransferUnit::BlockEnd { cache_path, .. } = unit {
            let _ = fs::remove_file(&cache_path);
            count += 1;
        }
    }
    count
}

/// Wait for `stop_fm` on the control connection and post it as `Stop`.
fn spawn_control_reader<C>(
    mut control: C,
    inbox: Sender<TransferUnit>,
    span: Span,
) -> Result<JoinHandle<()>>
where
    C: Read + Send + 'static,
{
    let handle = thread::Builder::new()
        .name("merge-control".to_string())
        .spawn(move || {
            let packer = Packer::loose().with_span(span.clone());
            let reason = loop {
                match packer.recv_message(&mut control) {
                    Ok(Message::StopFm { reason }) => break reason,
                    Ok(other) => {
                        tracing::debug!(parent: &span, message = ?other, "ignored control message");
                    }
                    Err(PacketError::ConnectionClosed) => {
                        break "control connection closed".to_string();
                    }
                    Err(e) => break e.to_string(),
                }
            };
            let _ = inbox.send(TransferUnit::Stop { reason });
        })?;
    Ok(handle)
}

/// Append blocks `0..cnt` of one split to `dest` in index order.
///
/// Returns the number of blocks merged. Each cache file is deleted once
/// appended. Fails if the lane closes with blocks still missing.
pub fn merge_split(
    lane: Receiver<TransferUnit>,
    dest: &Path,
    cnt: u64,
    poll: Duration,
    span: &Span,
) -> Result<u64> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut writer = BufWriter::new(File::create(dest)?);
    let mut buffered: HashMap<u64, (File, PathBuf)> = HashMap::new();
    let mut next_index = 0u64;

    while next_index < cnt {
        if let Some((mut block, cache_path)) = buffered.remove(&next_index) {
            io::copy(&mut block, &mut writer)?;
            drop(block);
            fs::remove_file(&cache_path)?;
            tracing::debug!(parent: span, index = next_index, "block merged");
            next_index += 1;
            continue;
        }

        match lane.recv_timeout(poll) {
            Ok(TransferUnit::BlockEnd {
                index, cache_path, ..
            }) => {
                if index < next_index || index >= cnt {
                    tracing::warn!(parent: span, index, cnt, "block out of range");
                    continue;
                }
                let block = File::open(&cache_path)?;
                buffered.insert(index, (block, cache_path));
            }
            Ok(_) => {}
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                return Err(Error::Protocol(format!(
                    "{}: session ended after {} of {} blocks",
                    dest.display(),
                    next_index,
                    cnt
                )));
            }
        }
    }

    writer.flush()?;
    Ok(next_index)
}
