//! Receive worker: one thread per data connection.
//!
//! Reads a header per unit, writes the payload either straight into the
//! destination file (`single`) or into a cache block (`block`), posts split
//! and block notifications to the merge engine, and answers every unit with
//! a heartbeat.

use crate::error::{Error, Result};
use crate::locale::Locale;
use crate::streaming::channel::TransferUnit;
use crate::streaming::protocol::{Message, Packer, HEARTBEAT};
use crate::util::short_path;
use crossbeam_channel::Sender;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::net::TcpStream;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::Span;

/// Resolve a `/`-separated wire path under `root`.
///
/// `""` (or `"/"`) is `root` itself. Rejects `..`, drive prefixes and
/// anything else that could leave `root`.
pub fn validate_path(root: &Path, wire: &str) -> Result<PathBuf> {
    let reject = |reason: &str| Error::Path {
        path: PathBuf::from(wire),
        reason: reason.to_string(),
    };

    let mut rel = PathBuf::new();
    for segment in wire.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return Err(reject("path traversal not allowed")),
            _ => {}
        }
        let mut components = Path::new(segment).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(part)), None) => rel.push(part),
            _ => return Err(reject("invalid path segment")),
        }
    }

    let full = root.join(&rel);
    if !normalize_path(&full).starts_with(normalize_path(root)) {
        return Err(reject("path escapes root directory"));
    }
    Ok(full)
}

/// Normalize a path without requiring it to exist (unlike canonicalize)
fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                normalized.pop();
            }
            Component::CurDir => {}
            c => normalized.push(c),
        }
    }
    normalized
}

/// `{cache}/{sid}_{index}.block`
pub fn cache_block_path(cache: &Path, sid: u64, index: u64) -> PathBuf {
    cache.join(format!("{}_{}.block", sid, index))
}

/// What one worker wrote to disk
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecvStats {
    pub singles: u64,
    pub blocks: u64,
    pub bytes: u64,
}

pub struct RecvWorker {
    uid: usize,
    apex: PathBuf,
    cache: PathBuf,
    merge_inbox: Sender<TransferUnit>,
    packer: Packer,
    locale: Arc<Locale>,
    span: Span,
}

impl RecvWorker {
    pub fn new(
        uid: usize,
        apex: PathBuf,
        cache: PathBuf,
        merge_inbox: Sender<TransferUnit>,
        locale: Arc<Locale>,
        span: Span,
    ) -> Self {
        Self {
            uid,
            apex,
            cache,
            merge_inbox,
            packer: Packer::loose().with_span(span.clone()),
            locale,
            span,
        }
    }

    pub fn spawn(self, conn: TcpStream) -> Result<JoinHandle<Result<RecvStats>>> {
        let handle = thread::Builder::new()
            .name(format!("recv-{}", self.uid))
            .spawn(move || {
                let mut conn = conn;
                self.run(&mut conn)
            })?;
        Ok(handle)
    }

    /// Work until the peer sends `end` (or goes away).
    pub fn run<S: Read + Write>(self, conn: &mut S) -> Result<RecvStats> {
        tracing::info!(
            parent: &self.span,
            "{}",
            self.locale.format("recv.thread.start", &[&self.uid])
        );

        let mut stats = RecvStats::default();
        let result = self.work(conn, &mut stats);
        match &result {
            Ok(reason) => tracing::info!(
                parent: &self.span,
                singles = stats.singles,
                blocks = stats.blocks,
                bytes = stats.bytes,
                "{}",
                self.locale.format("recv.thread.exit", &[&self.uid, reason])
            ),
            Err(e) => tracing::error!(
                parent: &self.span,
                "{}",
                self.locale.format("recv.thread.exit", &[&self.uid, e])
            ),
        }
        result.map(|_| stats)
    }

    fn work<S: Read + Write>(&self, conn: &mut S, stats: &mut RecvStats) -> Result<String> {
        loop {
            match self.packer.recv_message(conn)? {
                Message::End { reason } => {
                    self.packer.send_raw(conn, HEARTBEAT)?;
                    return Ok(reason);
                }
                Message::Split {
                    sid,
                    path,
                    cnt,
                    size,
                } => match validate_path(&self.apex, &path) {
                    Ok(dest) => {
                        tracing::info!(parent: &self.span, sid, cnt, path = %short_path(&path, 50), "split header");
                        self.notify(TransferUnit::Split {
                            sid,
                            path: dest,
                            cnt,
                            size,
                        })?;
                    }
                    Err(e) => tracing::error!(parent: &self.span, error = %e, "split rejected"),
                },
                Message::Block { sid, index, size } => {
                    let cache_path = cache_block_path(&self.cache, sid, index);
                    let mut file = File::create(&cache_path)?;
                    self.receive_into(conn, &mut file, size)?;
                    drop(file);
                    stats.blocks += 1;
                    stats.bytes += size;
                    tracing::debug!(parent: &self.span, sid, index, size, "block cached");
                    self.notify(TransferUnit::BlockEnd {
                        sid,
                        index,
                        cache_path,
                    })?;
                }
                Message::Single { path, size } => match validate_path(&self.apex, &path) {
                    Ok(dest) => {
                        if let Some(parent) = dest.parent() {
                            fs::create_dir_all(parent)?;
                        }
                        let mut file = BufWriter::new(File::create(&dest)?);
                        self.receive_into(conn, &mut file, size)?;
                        file.flush()?;
                        stats.singles += 1;
                        stats.bytes += size;
                        tracing::debug!(parent: &self.span, path = %short_path(&path, 50), size, "file received");
                    }
                    Err(e) => {
                        tracing::error!(parent: &self.span, error = %e, "file rejected");
                        self.receive_into(conn, &mut io::sink(), size)?;
                    }
                },
                Message::BadPackage {} => {
                    tracing::warn!(
                        parent: &self.span,
                        "{}",
                        self.locale.format("recv.thread.bad_package", &[&self.uid])
                    );
                }
                other => {
                    tracing::warn!(parent: &self.span, message = ?other, "unexpected message on data connection");
                }
            }

            self.packer.send_raw(conn, HEARTBEAT)?;
        }
    }

    /// Copy `size` payload bytes from raw frames into `out`.
    ///
    /// A frame the packer could not decode is skipped; the stream may be out
    /// of step afterwards.
    fn receive_into<S: Read, W: Write>(&self, conn: &mut S, out: &mut W, size: u64) -> Result<()> {
        let mut received = 0u64;
        while received < size {
            match self.packer.recv_raw(conn)? {
                Some(data) => {
                    let take = data.len().min((size - received) as usize);
                    out.write_all(&data[..take])?;
                    received += data.len() as u64;
                }
                None => continue,
            }
        }
        Ok(())
    }

    fn notify(&self, unit: TransferUnit) -> Result<()> {
        self.merge_inbox
            .send(unit)
            .map_err(|_| Error::Protocol("merge engine is gone".to_string()))
    }
}

/// Join receive workers, keeping the first failure.
pub fn join_all(handles: Vec<JoinHandle<Result<RecvStats>>>) -> Result<RecvStats> {
    let mut total = RecvStats::default();
    let mut first_err = None;
    for handle in handles {
        match handle.join() {
            Ok(Ok(stats)) => {
                total.singles += stats.singles;
                total.blocks += stats.blocks;
                total.bytes += stats.bytes;
            }
            Ok(Err(e)) => {
                first_err.get_or_insert(e);
            }
            Err(_) => {
                first_err.get_or_insert(Error::Protocol("receive worker panicked".to_string()));
            }
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(total),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::protocol::Format;
    use crossbeam_channel::unbounded;
    use std::io::Cursor;
    use tempfile::TempDir;

    struct Duplex {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Read for Duplex {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Duplex {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Builds the byte stream a send worker would produce.
    struct Script {
        packer: Packer,
        wire: Vec<u8>,
    }

    impl Script {
        fn new() -> Self {
            Self {
                packer: Packer::loose(),
                wire: Vec::new(),
            }
        }

        fn msg(mut self, msg: Message) -> Self {
            self.packer.send(&mut self.wire, &msg, Format::Json).unwrap();
            self
        }

        fn payload(mut self, data: &[u8]) -> Self {
            for chunk in data.chunks(4096) {
                self.packer.send_raw(&mut self.wire, chunk).unwrap();
            }
            self
        }

        fn into_conn(self) -> Duplex {
            Duplex {
                input: Cursor::new(self.wire),
                output: Vec::new(),
            }
        }
    }

    fn heartbeats(output: &[u8]) -> usize {
        let packer = Packer::loose();
        let mut wire = output;
        let mut n = 0;
        while !wire.is_empty() {
            assert_eq!(packer.recv_raw(&mut wire).unwrap().unwrap(), HEARTBEAT);
            n += 1;
        }
        n
    }

    fn worker(tmp: &TempDir, inbox: Sender<TransferUnit>) -> RecvWorker {
        let apex = tmp.path().join("out");
        let cache = tmp.path().join("cache");
        fs::create_dir_all(&apex).unwrap();
        fs::create_dir_all(&cache).unwrap();
        RecvWorker::new(1, apex, cache, inbox, Arc::new(Locale::default()), Span::none())
    }

    #[test]
    fn test_validate_path() {
        let root = Path::new("/save/album");
        assert_eq!(validate_path(root, "").unwrap(), PathBuf::from("/save/album"));
        assert_eq!(
            validate_path(root, "/sub/a.txt").unwrap(),
            PathBuf::from("/save/album/sub/a.txt")
        );
        assert_eq!(
            validate_path(root, "/./sub//b.txt").unwrap(),
            PathBuf::from("/save/album/sub/b.txt")
        );
        assert!(validate_path(root, "/../etc/passwd").is_err());
        assert!(validate_path(root, "/sub/../../x").is_err());
    }

    #[test]
    fn test_single_written_directly() {
        let tmp = TempDir::new().unwrap();
        let (tx, rx) = unbounded();
        let content: Vec<u8> = (0..9000u32).map(|i| (i * 7 % 256) as u8).collect();

        let mut conn = Script::new()
            .msg(Message::Single {
                path: "/nested/f.bin".into(),
                size: content.len() as u64,
            })
            .payload(&content)
            .msg(Message::End {
                reason: "task end".into(),
            })
            .into_conn();

        let stats = worker(&tmp, tx).run(&mut conn).unwrap();
        assert_eq!(stats.singles, 1);
        assert_eq!(stats.bytes, 9000);
        assert_eq!(
            fs::read(tmp.path().join("out").join("nested").join("f.bin")).unwrap(),
            content
        );
        assert!(rx.try_recv().is_err());
        assert_eq!(heartbeats(&conn.output), 2);
    }

    #[test]
    fn test_split_and_block_notify_merge() {
        let tmp = TempDir::new().unwrap();
        let (tx, rx) = unbounded();

        let mut conn = Script::new()
            .msg(Message::Split {
                sid: 7,
                path: "/big.iso".into(),
                cnt: 2,
                size: 6,
            })
            .msg(Message::Block {
                sid: 7,
                index: 1,
                size: 3,
            })
            .payload(b"def")
            .msg(Message::End { reason: "x".into() })
            .into_conn();

        worker(&tmp, tx).run(&mut conn).unwrap();

        match rx.try_recv().unwrap() {
            TransferUnit::Split { sid, path, cnt, .. } => {
                assert_eq!(sid, 7);
                assert_eq!(cnt, 2);
                assert_eq!(path, tmp.path().join("out").join("big.iso"));
            }
            other => panic!("Expected Split, got {:?}", other),
        }
        match rx.try_recv().unwrap() {
            TransferUnit::BlockEnd {
                sid,
                index,
                cache_path,
            } => {
                assert_eq!((sid, index), (7, 1));
                assert_eq!(cache_path, tmp.path().join("cache").join("7_1.block"));
                assert_eq!(fs::read(&cache_path).unwrap(), b"def");
            }
            other => panic!("Expected BlockEnd, got {:?}", other),
        }
        assert_eq!(heartbeats(&conn.output), 3);
    }

    #[test]
    fn test_bad_package_still_answered() {
        let tmp = TempDir::new().unwrap();
        let (tx, _rx) = unbounded();

        let mut script = Script::new();
        script
            .packer
            .send(&mut script.wire, &serde_json::json!({"msg": "dance"}), Format::Json)
            .unwrap();
        let mut conn = script.msg(Message::End { reason: "x".into() }).into_conn();

        worker(&tmp, tx).run(&mut conn).unwrap();
        assert_eq!(heartbeats(&conn.output), 2);
    }

    #[test]
    fn test_traversal_payload_is_discarded() {
        let tmp = TempDir::new().unwrap();
        let (tx, _rx) = unbounded();

        let mut conn = Script::new()
            .msg(Message::Single {
                path: "/../escape.txt".into(),
                size: 4,
            })
            .payload(b"evil")
            .msg(Message::End { reason: "x".into() })
            .into_conn();

        let stats = worker(&tmp, tx).run(&mut conn).unwrap();
        assert_eq!(stats.singles, 0);
        assert!(!tmp.path().join("escape.txt").exists());
        assert_eq!(heartbeats(&conn.output), 2);
    }

    #[test]
    fn test_peer_gone_is_error() {
        let tmp = TempDir::new().unwrap();
        let (tx, _rx) = unbounded();
        let mut conn = Script::new()
            .msg(Message::Single {
                path: "/a".into(),
                size: 100,
            })
            .payload(b"only part")
            .into_conn();

        assert!(matches!(
            worker(&tmp, tx).run(&mut conn),
            Err(Error::Packet(_))
        ));
    }
}
