//! Length-prefixed packet framing and control messages.
//!
//! Wire format: all multi-byte integers are big-endian.
//! Frame format: len:u16 | payload, where payload is the codec-transformed
//! serialized object and `len` is its length after encoding.
//!
//! Control messages are JSON objects `{"msg": <tag>, "args": {...}}`.
//! File bytes travel as raw frames; every unit on a data connection is
//! answered by a one-byte [`HEARTBEAT`] frame.

use crate::streaming::codec::{Base64Codec, Codec};
use crate::streaming::generator::TaskKind;
use bytes::{BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use std::sync::Arc;
use thiserror::Error;
use tracing::Span;

/// Largest encoded payload a frame can carry (u16 length header).
pub const MAX_FRAME_SIZE: usize = u16::MAX as usize;

/// Size of each socket write while streaming a frame payload.
pub const SEND_CHUNK_SIZE: usize = 1024;

/// Flow-control token returned after every unit on a data connection.
/// Its content is never interpreted.
pub const HEARTBEAT: &[u8] = b"b";

// =============================================================================
// Errors
// =============================================================================

#[derive(Error, Debug)]
pub enum PacketError {
    #[error("Packet is too big: {0} bytes")]
    TooLarge(usize),

    #[error("Fail JSON/bincode serialization: {0}")]
    Serialize(String),

    #[error("Fail JSON/bincode deserialization: {0}")]
    Deserialize(String),

    #[error("Can not encode data with '{codec}' while sending packet: {reason}")]
    Encode { codec: String, reason: String },

    #[error("Can not decode packet with '{codec}' while receiving: {reason}")]
    Decode { codec: String, reason: String },

    #[error("Error occurred during transfer: {0}")]
    Io(#[from] io::Error),

    #[error("Peer closed the connection")]
    ConnectionClosed,
}

// =============================================================================
// Policies and formats
// =============================================================================

/// How the packer reacts to a failed send or receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Return the error to the caller.
    Strict,
    /// Log the error and return a sentinel (`false` / `None`).
    /// `ConnectionClosed` is still returned as an error.
    Loose,
}

/// Serialization used for structured payloads. Raw bytes bypass both and go
/// through [`Packer::send_raw`] / [`Packer::recv_raw`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// UTF-8 JSON text.
    Json,
    /// Native binary object encoding (bincode).
    Native,
}

impl Format {
    fn serialize<T: Serialize + ?Sized>(self, obj: &T) -> Result<Vec<u8>, PacketError> {
        match self {
            Format::Json => serde_json::to_vec(obj).map_err(|e| PacketError::Serialize(e.to_string())),
            Format::Native => bincode::serialize(obj).map_err(|e| PacketError::Serialize(e.to_string())),
        }
    }

    fn deserialize<T: DeserializeOwned>(self, data: &[u8]) -> Result<T, PacketError> {
        match self {
            Format::Json => {
                serde_json::from_slice(data).map_err(|e| PacketError::Deserialize(e.to_string()))
            }
            Format::Native => {
                bincode::deserialize(data).map_err(|e| PacketError::Deserialize(e.to_string()))
            }
        }
    }
}

// =============================================================================
// Control messages
// =============================================================================

/// Message exchanged on data and control connections.
///
/// Paths are `/`-separated and relative to the apex path of the side that
/// reads them, except `BlockEnd::path`, which names a local cache file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "msg", content = "args", rename_all = "snake_case")]
pub enum Message {
    End {
        reason: String,
    },
    Single {
        path: String,
        size: u64,
    },
    Split {
        sid: u64,
        path: String,
        cnt: u64,
        #[serde(default)]
        size: u64,
    },
    Block {
        sid: u64,
        index: u64,
        size: u64,
    },
    BlockEnd {
        sid: u64,
        index: u64,
        path: String,
    },
    StopFm {
        reason: String,
    },
    BadPackage {},
}

/// Task metadata sent first on the control connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskAnnounce {
    #[serde(rename = "type")]
    pub kind: TaskKind,
    pub file_name: String,
    pub file_count: u64,
    pub total_size: u64,
    pub thread_cnt: usize,
}

// =============================================================================
// Packer
// =============================================================================

/// Frames objects onto a byte stream and back.
///
/// One packer per thread; the codec is shared.
#[derive(Clone)]
pub struct Packer {
    codec: Arc<dyn Codec>,
    policy: ErrorPolicy,
    key: Option<Vec<u8>>,
    span: Option<Span>,
}

impl Packer {
    pub fn new(codec: Arc<dyn Codec>, policy: ErrorPolicy) -> Self {
        Self {
            codec,
            policy,
            key: None,
            span: None,
        }
    }

    /// Default codec in loose mode, the way every worker runs.
    pub fn loose() -> Self {
        Self::new(Arc::new(Base64Codec), ErrorPolicy::Loose)
    }

    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Attach a span; loose-mode failures are logged inside it.
    /// Without one they are printed to stderr.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    pub fn policy(&self) -> ErrorPolicy {
        self.policy
    }

    /// Serialize `obj` and send it as one frame.
    pub fn send<W, T>(&self, conn: &mut W, obj: &T, format: Format) -> Result<bool, PacketError>
    where
        W: Write + ?Sized,
        T: Serialize + ?Sized,
    {
        let result = format
            .serialize(obj)
            .and_then(|data| self.write_frame(conn, &data));
        self.settle(result.map(|()| true), false)
    }

    /// Send `data` as one frame without serialization.
    pub fn send_raw<W: Write + ?Sized>(&self, conn: &mut W, data: &[u8]) -> Result<bool, PacketError> {
        let result = self.write_frame(conn, data);
        self.settle(result.map(|()| true), false)
    }

    /// Receive one frame and deserialize it.
    pub fn recv<R, T>(&self, conn: &mut R, format: Format) -> Result<Option<T>, PacketError>
    where
        R: Read + ?Sized,
        T: DeserializeOwned,
    {
        let result = self
            .read_frame(conn)
            .and_then(|data| format.deserialize(&data));
        self.settle(result.map(Some), None)
    }

    /// Receive one frame as raw bytes.
    pub fn recv_raw<R: Read + ?Sized>(&self, conn: &mut R) -> Result<Option<Vec<u8>>, PacketError> {
        let result = self.read_frame(conn);
        self.settle(result.map(Some), None)
    }

    /// Receive a control message; anything undecodable becomes `BadPackage`.
    pub fn recv_message<R: Read + ?Sized>(&self, conn: &mut R) -> Result<Message, PacketError> {
        Ok(self
            .recv(conn, Format::Json)?
            .unwrap_or(Message::BadPackage {}))
    }

    fn write_frame<W: Write + ?Sized>(&self, conn: &mut W, data: &[u8]) -> Result<(), PacketError> {
        let coded = self
            .codec
            .encrypt(data, self.key.as_deref())
            .map_err(|reason| PacketError::Encode {
                codec: self.codec.name().to_string(),
                reason,
            })?;

        if coded.len() > MAX_FRAME_SIZE {
            return Err(PacketError::TooLarge(coded.len()));
        }

        let mut header = BytesMut::with_capacity(2);
        header.put_u16(coded.len() as u16);
        conn.write_all(&header).map_err(io_failure)?;
        for chunk in coded.chunks(SEND_CHUNK_SIZE) {
            conn.write_all(chunk).map_err(io_failure)?;
        }
        conn.flush().map_err(io_failure)?;
        Ok(())
    }

    fn read_frame<R: Read + ?Sized>(&self, conn: &mut R) -> Result<Vec<u8>, PacketError> {
        let mut header = [0u8; 2];
        read_full(conn, &mut header)?;
        let len = u16::from_be_bytes(header) as usize;

        let mut payload = vec![0u8; len];
        read_full(conn, &mut payload)?;

        self.codec
            .decrypt(&payload, self.key.as_deref())
            .map_err(|reason| PacketError::Decode {
                codec: self.codec.name().to_string(),
                reason,
            })
    }

    fn settle<T>(&self, result: Result<T, PacketError>, fallback: T) -> Result<T, PacketError> {
        match result {
            Ok(value) => Ok(value),
            Err(PacketError::ConnectionClosed) => Err(PacketError::ConnectionClosed),
            Err(e) if self.policy == ErrorPolicy::Strict => Err(e),
            Err(e) => {
                self.report(&e);
                Ok(fallback)
            }
        }
    }

    fn report(&self, err: &PacketError) {
        match &self.span {
            Some(span) => span.in_scope(|| {
                tracing::error!(codec = self.codec.name(), "[TCPPacketErr] {}", err);
            }),
            None => eprintln!("[TCPPacketErr] {}", err),
        }
    }
}

/// Fill `buf` completely; a zero-length read means the peer closed.
fn read_full<R: Read + ?Sized>(conn: &mut R, buf: &mut [u8]) -> Result<(), PacketError> {
    let mut filled = 0;
    while filled < buf.len() {
        match conn.read(&mut buf[filled..]) {
            Ok(0) => return Err(PacketError::ConnectionClosed),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(io_failure(e)),
        }
    }
    Ok(())
}

/// A dead peer is `ConnectionClosed`; anything else stays an I/O error.
fn io_failure(e: io::Error) -> PacketError {
    match e.kind() {
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof
        | io::ErrorKind::NotConnected => PacketError::ConnectionClosed,
        _ => PacketError::Io(e),
    }
}

// =============================================================================
// Tests
// =============================================================================
