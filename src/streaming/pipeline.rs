//! Transfer sessions.
//!
//! Orchestrates Generator, send workers, receive workers and the merge engine
//! around one control connection and N data connections.
//!
//! ```text
//! sender                               receiver
//! ------                               --------
//! connect control  ------------------> accept control (from discovered peer)
//! TaskAnnounce     ------------------> pick apex
//! dir count, dirs  ------------------> create dirs, cache
//! connect N data   ------------------> accept N data, spawn RecvWorkers
//! Generator + SendWorkers  ==========> RecvWorkers -> MergeEngine
//! join workers
//! stop_fm          ------------------> MergeEngine stops, join everything
//! ```

use crate::error::{Error, Result};
use crate::locale::Locale;
use crate::streaming::channel::{TransferUnit, WorkQueue};
use crate::streaming::generator::{Generator, GeneratorConfig, TaskConfig, TaskKind};
use crate::streaming::merge::MergeEngine;
use crate::streaming::protocol::{Format, Message, Packer, TaskAnnounce};
use crate::streaming::receiver::{self, validate_path, RecvWorker};
use crate::streaming::sender::{self, SendStats, SendWorker};
use crate::transport::{accept_control, accept_timeout, ACCEPT_TIMEOUT};
use crate::util::{format_size, to_wire_path};
use std::fs;
use std::io;
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::Span;

/// Upper bound on data connections a receiver will accept for one task.
pub const MAX_THREADS: usize = 256;

/// Summary of a finished send
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SendReport {
    pub files: u64,
    pub bytes: u64,
    pub split_files: u64,
    pub blocks: u64,
}

/// Summary of a finished receive
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecvReport {
    /// Where the task landed
    pub apex: PathBuf,
    pub dirs_created: u64,
    /// Directories that already existed
    pub dirs_skipped: u64,
    pub files: u64,
    pub bytes: u64,
    pub merged_files: u64,
}

fn sent(ok: bool, what: &str) -> Result<()> {
    if ok {
        Ok(())
    } else {
        Err(Error::Protocol(format!("failed to send {}", what)))
    }
}

fn received<T>(value: Option<T>, what: &str) -> Result<T> {
    value.ok_or_else(|| Error::Protocol(format!("failed to receive {}", what)))
}

// =============================================================================
// Send side
// =============================================================================

pub struct SendSession {
    task: Arc<TaskConfig>,
    threads: usize,
    split_limit: u64,
    locale: Arc<Locale>,
    span: Span,
}

impl SendSession {
    pub fn new(task: TaskConfig, threads: usize, split_limit: u64, locale: Arc<Locale>) -> Self {
        Self {
            task: Arc::new(task),
            threads,
            split_limit,
            locale,
            span: tracing::info_span!("send_session"),
        }
    }

    pub fn task(&self) -> &TaskConfig {
        &self.task
    }

    /// Push the whole task to the receiver listening at `peer`.
    pub fn run(&self, peer: SocketAddr) -> Result<SendReport> {
        tracing::info!(
            parent: &self.span,
            "{}",
            self.locale.format("send.connect", &[&peer.ip(), &peer.port()])
        );
        let mut control = TcpStream::connect(peer)?;
        let packer = Packer::loose().with_span(self.span.clone());

        self.bootstrap(&packer, &mut control)?;

        let queue = WorkQueue::default();
        let handles = match self.start_workers(&queue, || TcpStream::connect(peer)) {
            Ok(handles) => handles,
            Err(e) => {
                let _ = packer.send(&mut control, &self.stop_message(), Format::Json);
                return Err(e);
            }
        };

        let generated = Generator::new(
            self.task.clone(),
            GeneratorConfig {
                split_limit: self.split_limit,
                workers: self.threads,
            },
            queue.clone(),
            self.locale.clone(),
            tracing::info_span!(parent: &self.span, "generator"),
        )
        .run();

        if generated.is_err() {
            // release the workers so they can be joined
            self.release(&queue, self.threads)?;
        }
        let workers = sender::join_all(handles);

        sent(
            packer.send(&mut control, &self.stop_message(), Format::Json)?,
            "stop_fm",
        )?;

        let stats = generated?;
        workers?;

        let report = SendReport {
            files: stats.files,
            bytes: stats.bytes,
            split_files: stats.split_files,
            blocks: stats.blocks,
        };
        tracing::info!(
            parent: &self.span,
            "{}",
            self.locale.format(
                "send.done",
                &[
                    &report.files,
                    &format_size(report.bytes),
                    &report.split_files,
                    &report.blocks
                ]
            )
        );
        Ok(report)
    }

    /// Open one data connection per thread and start its worker.
    ///
    /// If any connection fails, the workers already running get an `End`
    /// each and are joined before the error is returned.
    fn start_workers<F>(
        &self,
        queue: &WorkQueue,
        mut connect: F,
    ) -> Result<Vec<JoinHandle<Result<SendStats>>>>
    where
        F: FnMut() -> io::Result<TcpStream>,
    {
        let mut handles = Vec::with_capacity(self.threads);
        for uid in 0..self.threads {
            let started = connect().map_err(Error::from).and_then(|conn| {
                let span = tracing::info_span!(parent: &self.span, "send_worker", uid);
                SendWorker::new(uid, queue.clone(), self.locale.clone(), span).spawn(conn)
            });
            match started {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    self.release(queue, handles.len())?;
                    let _ = sender::join_all(handles);
                    return Err(e);
                }
            }
        }
        Ok(handles)
    }

    fn release(&self, queue: &WorkQueue, workers: usize) -> Result<()> {
        for _ in 0..workers {
            queue.push(TransferUnit::End {
                reason: self.locale.text("msg.task_end").to_string(),
            })?;
        }
        Ok(())
    }

    fn stop_message(&self) -> Message {
        Message::StopFm {
            reason: self.locale.text("msg.session_end").to_string(),
        }
    }

    /// Task metadata, then the directory list.
    fn bootstrap(&self, packer: &Packer, control: &mut TcpStream) -> Result<()> {
        let announce = self.task.announce(self.threads);
        tracing::info!(
            parent: &self.span,
            "{}",
            self.locale.format(
                "send.task",
                &[
                    &announce.file_name,
                    &announce.file_count,
                    &format_size(announce.total_size)
                ]
            )
        );
        sent(packer.send(control, &announce, Format::Json)?, "task info")?;

        let dirs: Vec<String> = self
            .task
            .dir_paths
            .iter()
            .map(|d| to_wire_path(&self.task.relative(d)))
            .collect();
        sent(
            packer.send(control, &(dirs.len() as u64), Format::Json)?,
            "directory count",
        )?;
        for dir in &dirs {
            sent(packer.send(control, dir, Format::Json)?, "directory")?;
        }
        tracing::info!(
            parent: &self.span,
            "{}",
            self.locale.format("send.dirs", &[&dirs.len()])
        );
        Ok(())
    }
}

// =============================================================================
// Receive side
// =============================================================================

pub struct RecvSession {
    save_folder: PathBuf,
    cache: PathBuf,
    accept_timeout: Duration,
    locale: Arc<Locale>,
    span: Span,
}

impl RecvSession {
    pub fn new(save_folder: PathBuf, cache: PathBuf, locale: Arc<Locale>) -> Self {
        Self {
            save_folder,
            cache,
            accept_timeout: ACCEPT_TIMEOUT,
            locale,
            span: tracing::info_span!("recv_session"),
        }
    }

    pub fn with_accept_timeout(mut self, timeout: Duration) -> Self {
        self.accept_timeout = timeout;
        self
    }

    /// Receive one task from `peer` through `listener`.
    ///
    /// `keep_waiting(attempt)` is asked each time the control accept times out.
    pub fn run<F>(&self, listener: &TcpListener, peer: IpAddr, keep_waiting: F) -> Result<RecvReport>
    where
        F: FnMut(u32) -> bool,
    {
        let mut control = accept_control(listener, peer, self.accept_timeout, keep_waiting)?;
        let packer = Packer::loose().with_span(self.span.clone());

        let announce: TaskAnnounce =
            received(packer.recv(&mut control, Format::Json)?, "task info")?;
        if announce.thread_cnt > MAX_THREADS {
            return Err(Error::Protocol(format!(
                "peer asked for {} connections",
                announce.thread_cnt
            )));
        }
        tracing::info!(
            parent: &self.span,
            "{}",
            self.locale.format(
                "recv.task",
                &[
                    &kind_name(announce.kind),
                    &announce.file_name,
                    &announce.file_count,
                    &format_size(announce.total_size)
                ]
            )
        );

        fs::create_dir_all(&self.save_folder)?;
        let apex = match announce.kind {
            TaskKind::File => self.save_folder.clone(),
            TaskKind::Dir => validate_path(&self.save_folder, &announce.file_name)?,
        };

        let mut report = RecvReport {
            apex: apex.clone(),
            ..Default::default()
        };
        self.create_dirs(&packer, &mut control, &apex, &mut report)?;
        fs::create_dir_all(&self.cache)?;

        let engine = MergeEngine::new(
            self.locale.clone(),
            tracing::info_span!(parent: &self.span, "merge_engine"),
        );
        let mut handles = Vec::with_capacity(announce.thread_cnt);
        for uid in 0..announce.thread_cnt {
            let (conn, addr) = accept_timeout(listener, self.accept_timeout)?;
            let span = tracing::info_span!(parent: &self.span, "recv_worker", uid, %addr);
            let worker = RecvWorker::new(
                uid,
                apex.clone(),
                self.cache.clone(),
                engine.inbox(),
                self.locale.clone(),
                span,
            );
            handles.push(worker.spawn(conn)?);
        }

        let merged = engine.run(control);
        let workers = receiver::join_all(handles)?;
        let merged = merged?;

        report.files = workers.singles + merged.merged_files;
        report.bytes = workers.bytes;
        report.merged_files = merged.merged_files;
        tracing::info!(
            parent: &self.span,
            "{}",
            self.locale.format(
                "recv.done",
                &[&apex.display(), &report.merged_files]
            )
        );
        Ok(report)
    }

    fn create_dirs(
        &self,
        packer: &Packer,
        control: &mut TcpStream,
        apex: &Path,
        report: &mut RecvReport,
    ) -> Result<()> {
        let count: u64 = received(packer.recv(control, Format::Json)?, "directory count")?;
        for _ in 0..count {
            let wire: String = received(packer.recv(control, Format::Json)?, "directory")?;
            let dir = validate_path(apex, &wire)?;
            match fs::create_dir(&dir) {
                Ok(()) => report.dirs_created += 1,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => report.dirs_skipped += 1,
                Err(e) => return Err(e.into()),
            }
        }
        tracing::info!(
            parent: &self.span,
            "{}",
            self.locale.format(
                "recv.dirs",
                &[&report.dirs_created, &report.dirs_skipped]
            )
        );
        Ok(())
    }
}

fn kind_name(kind: TaskKind) -> &'static str {
    match kind {
        TaskKind::File => "file",
        TaskKind::Dir => "dir",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::thread;
    use tempfile::TempDir;

    #[test]
    fn test_bootstrap_then_stop_with_no_files() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("empty_dir");
        fs::create_dir_all(src.join("inner")).unwrap();
        let save = tmp.path().join("save");

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let addr = listener.local_addr().unwrap();
        let locale = Arc::new(Locale::default());

        let recv_locale = locale.clone();
        let recv_save = save.clone();
        let cache = tmp.path().join("cache");
        let receiver = thread::spawn(move || {
            RecvSession::new(recv_save, cache, recv_locale).run(&listener, addr.ip(), |_| false)
        });

        let task = TaskConfig::scan(&src).unwrap();
        let report = SendSession::new(task, 2, 1024, locale).run(addr).unwrap();
        assert_eq!(report, SendReport::default());

        let recv_report = receiver.join().unwrap().unwrap();
        assert_eq!(recv_report.apex, save.join("empty_dir"));
        assert_eq!(recv_report.dirs_created, 2);
        assert_eq!(recv_report.dirs_skipped, 0);
        assert!(save.join("empty_dir").join("inner").is_dir());
    }

    #[test]
    fn test_control_timeout_without_sender() {
        let tmp = TempDir::new().unwrap();
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let err = RecvSession::new(
            tmp.path().join("save"),
            tmp.path().join("cache"),
            Arc::new(Locale::default()),
        )
        .with_accept_timeout(Duration::from_millis(50))
        .run(&listener, IpAddr::V4(Ipv4Addr::LOCALHOST), |attempt| attempt < 2)
        .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[test]
    fn test_failed_data_connection_releases_started_workers() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.txt"), b"a").unwrap();
        let task = TaskConfig::scan(&tmp.path().join("a.txt")).unwrap();
        let session = SendSession::new(task, 3, 1024, Arc::new(Locale::default()));

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let addr = listener.local_addr().unwrap();
        // the peer accepts one data connection and then goes away
        let peer = thread::spawn(move || {
            let (conn, _) = listener.accept().unwrap();
            drop(conn);
        });

        let queue = WorkQueue::default();
        let mut attempts = 0;
        let err = session
            .start_workers(&queue, || {
                attempts += 1;
                if attempts == 1 {
                    TcpStream::connect(addr)
                } else {
                    Err(io::Error::from(io::ErrorKind::ConnectionRefused))
                }
            })
            .unwrap_err();
        peer.join().unwrap();

        assert!(matches!(err, Error::Io(_)));
        assert_eq!(attempts, 2);
        assert!(queue.is_empty());
        queue.join();
    }
}
