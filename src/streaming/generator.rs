//! Generator: turns a file or directory into a stream of transfer units.
//!
//! Small files become one `Single` unit. Files larger than 1.5x the split
//! limit become a `Split` header followed by `cnt` ordered `Block` units,
//! each carrying its own positioned read handle.

use crate::error::{Error, Result};
use crate::locale::Locale;
use crate::streaming::channel::{SourceHandle, TransferUnit, WorkQueue};
use crate::streaming::protocol::TaskAnnounce;
use crate::util::short_path;
use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::Span;

// =============================================================================
// TaskConfig
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    File,
    Dir,
}

/// What the sender was asked to transfer. Built once, read-only afterwards.
#[derive(Debug, Clone)]
pub struct TaskConfig {
    pub kind: TaskKind,
    /// The path the operator chose
    pub apex_path: PathBuf,
    pub file_count: u64,
    pub total_size: u64,
    /// Every file to send, in transfer order
    pub file_paths: Vec<PathBuf>,
    /// Every directory to recreate, parents first (includes the apex for `Dir`)
    pub dir_paths: Vec<PathBuf>,
}

impl TaskConfig {
    /// Enumerate `path` recursively.
    pub fn scan(path: &Path) -> Result<Self> {
        let meta = fs::metadata(path)?;
        if meta.is_file() {
            return Ok(Self {
                kind: TaskKind::File,
                apex_path: path.to_path_buf(),
                file_count: 1,
                total_size: meta.len(),
                file_paths: vec![path.to_path_buf()],
                dir_paths: Vec::new(),
            });
        }

        let mut file_paths = Vec::new();
        let mut dir_paths = Vec::new();
        let mut total_size = 0u64;

        let walker = WalkBuilder::new(path)
            .standard_filters(false)
            .follow_links(false)
            .sort_by_file_name(|a, b| a.cmp(b))
            .build();

        for entry in walker {
            let entry = entry.map_err(|e| Error::Io(io::Error::other(e.to_string())))?;
            let Some(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_dir() {
                dir_paths.push(entry.into_path());
            } else if file_type.is_file() {
                total_size += entry.metadata().map(|m| m.len()).unwrap_or(0);
                file_paths.push(entry.into_path());
            }
        }

        Ok(Self {
            kind: TaskKind::Dir,
            apex_path: path.to_path_buf(),
            file_count: file_paths.len() as u64,
            total_size,
            file_paths,
            dir_paths,
        })
    }

    /// Last component of the apex path.
    pub fn name(&self) -> String {
        self.apex_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Directory that relative paths are computed against.
    pub fn base(&self) -> &Path {
        match self.kind {
            TaskKind::File => self.apex_path.parent().unwrap_or_else(|| Path::new("")),
            TaskKind::Dir => &self.apex_path,
        }
    }

    pub fn relative(&self, path: &Path) -> PathBuf {
        path.strip_prefix(self.base())
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| path.to_path_buf())
    }

    pub fn announce(&self, thread_cnt: usize) -> TaskAnnounce {
        TaskAnnounce {
            kind: self.kind,
            file_name: self.name(),
            file_count: self.file_count,
            total_size: self.total_size,
            thread_cnt,
        }
    }
}

// =============================================================================
// Block planning
// =============================================================================

/// A file is split when it is larger than 1.5x the split limit.
pub fn should_split(size: u64, split_limit: u64) -> bool {
    (size as u128) * 2 > (split_limit as u128) * 3
}

/// `(offset, len)` of every block; all full-size except possibly the last.
pub fn plan_blocks(size: u64, split_limit: u64) -> Vec<(u64, u64)> {
    let full = size / split_limit;
    let remainder = size % split_limit;
    let mut blocks: Vec<(u64, u64)> = (0..full).map(|i| (i * split_limit, split_limit)).collect();
    if remainder > 0 {
        blocks.push((full * split_limit, remainder));
    }
    blocks
}

// =============================================================================
// Generator
// =============================================================================

pub struct GeneratorConfig {
    /// Block size for split files
    pub split_limit: u64,
    /// Number of send workers; each gets exactly one `End`
    pub workers: usize,
}

/// Counts of what was released into the queue
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GeneratorStats {
    pub files: u64,
    pub bytes: u64,
    pub split_files: u64,
    pub blocks: u64,
}

pub struct Generator {
    config: GeneratorConfig,
    task: Arc<TaskConfig>,
    queue: WorkQueue,
    locale: Arc<Locale>,
    span: Span,
    next_sid: u64,
    stats: GeneratorStats,
}

impl Generator {
    pub fn new(
        task: Arc<TaskConfig>,
        config: GeneratorConfig,
        queue: WorkQueue,
        locale: Arc<Locale>,
        span: Span,
    ) -> Self {
        Self {
            config,
            task,
            queue,
            locale,
            span,
            next_sid: 0,
            stats: GeneratorStats::default(),
        }
    }

    /// Release every file, then one `End` per worker, then wait for the
    /// workers to drain the queue.
    pub fn run(mut self) -> Result<GeneratorStats> {
        tracing::info!(parent: &self.span, "{}", self.locale.text("send.work.loop"));

        let task = self.task.clone();
        for path in &task.file_paths {
            self.generate(path)?;
        }

        let reason = self.locale.text("msg.task_end").to_string();
        for _ in 0..self.config.workers {
            self.queue.push(TransferUnit::End {
                reason: reason.clone(),
            })?;
        }
        self.queue.join();

        tracing::info!(
            parent: &self.span,
            files = self.stats.files,
            bytes = self.stats.bytes,
            "{}",
            self.locale.text("send.work.end")
        );
        Ok(self.stats)
    }

    fn generate(&mut self, path: &Path) -> Result<()> {
        let size = fs::metadata(path)?.len();
        let rel = self.task.relative(path);
        let shown = path.to_string_lossy();

        if should_split(size, self.config.split_limit) {
            tracing::info!(
                parent: &self.span,
                path = %short_path(&shown, 50),
                "{}",
                self.locale.format("send.work.make_task", &[&"split"])
            );

            let sid = self.next_sid;
            self.next_sid += 1;
            let blocks = plan_blocks(size, self.config.split_limit);

            self.queue.push(TransferUnit::Split {
                sid,
                path: rel,
                cnt: blocks.len() as u64,
                size,
            })?;
            for (index, (offset, len)) in blocks.into_iter().enumerate() {
                self.queue.push(TransferUnit::Block {
                    sid,
                    index: index as u64,
                    size: len,
                    source: SourceHandle::open(path, offset, len)?,
                })?;
                self.stats.blocks += 1;
            }
            self.stats.split_files += 1;
        } else {
            tracing::info!(
                parent: &self.span,
                path = %short_path(&shown, 50),
                "{}",
                self.locale.format("send.work.make_task", &[&"single"])
            );
            self.queue.push(TransferUnit::Single {
                path: rel,
                size,
                source: SourceHandle::open(path, 0, size)?,
            })?;
        }

        self.stats.files += 1;
        self.stats.bytes += size;
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
