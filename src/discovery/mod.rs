//! LAN peer discovery over UDP broadcast.
//!
//! The beacon side repeatedly broadcasts `{"msg": SIGNATURE, "port": reply_port}`
//! to the port encoded in the connect key and listens on `reply_port`. The
//! responder side listens on the key's port, and on a well-formed broadcast
//! answers `{"key": <connect key>, "port": <tcp port>}` to the broadcaster.
//! The beacon accepts only replies carrying its own key.
//!
//! Datagrams are base64 of JSON, at most [`MAX_DATAGRAM`] bytes. Anything
//! that does not decode is dropped.

use crate::error::{Error, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use crossbeam_channel::{bounded, RecvTimeoutError};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::Span;

/// Marker carried by every broadcast.
pub const SIGNATURE: &str = "fileThrower bRoadcast.";

pub const MAX_DATAGRAM: usize = 1024;

/// Pause between two broadcasts.
pub const BROADCAST_INTERVAL: Duration = Duration::from_millis(1500);

const KEY_WORD_LEN: usize = 5;
const KEY_PORT_MIN: u16 = 30000;
const KEY_PORT_MAX: u16 = 60000;

/// How often the beacon's listener re-checks its stop flag.
const LISTEN_POLL: Duration = Duration::from_millis(200);

// =============================================================================
// Connect key
// =============================================================================

/// Five lowercase letters followed by the five-digit UDP port the responder
/// listens on, e.g. `qwert41234`. The whole string is the match key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectKey {
    word: String,
    port: u16,
}

impl ConnectKey {
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let word = (0..KEY_WORD_LEN)
            .map(|_| rng.gen_range(b'a'..=b'z') as char)
            .collect();
        Self {
            word,
            port: rng.gen_range(KEY_PORT_MIN..=KEY_PORT_MAX),
        }
    }

    /// UDP port the responder binds.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for ConnectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:05}", self.word, self.port)
    }
}

impl FromStr for ConnectKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let invalid = || Error::Discovery(format!("invalid connect key: {:?}", s));
        if s.len() != KEY_WORD_LEN * 2 || !s.is_ascii() {
            return Err(invalid());
        }
        let (word, port) = s.split_at(KEY_WORD_LEN);
        if !port.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let port: u16 = port.parse().map_err(|_| invalid())?;
        if port == 0 {
            return Err(invalid());
        }
        Ok(Self {
            word: word.to_string(),
            port,
        })
    }
}

// =============================================================================
// Datagrams
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announce {
    pub msg: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub key: String,
    pub port: u16,
}

pub fn encode_datagram<T: Serialize>(value: &T) -> Vec<u8> {
    serde_json::to_vec(value)
        .map(|json| STANDARD.encode(json).into_bytes())
        .unwrap_or_default()
}

pub fn decode_datagram<T: DeserializeOwned>(data: &[u8]) -> Option<T> {
    let json = STANDARD.decode(data).ok()?;
    serde_json::from_slice(&json).ok()
}

/// Where the beacon found its peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Found {
    pub ip: IpAddr,
    /// TCP port the peer listens on
    pub port: u16,
}

impl Found {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

// =============================================================================
// Beacon
// =============================================================================

pub struct Beacon {
    key: ConnectKey,
    target_ip: Ipv4Addr,
    interval: Duration,
    max_rounds: Option<u32>,
    span: Span,
}

impl Beacon {
    /// Broadcast to `255.255.255.255` on the key's port.
    pub fn new(key: ConnectKey, span: Span) -> Self {
        Self {
            key,
            target_ip: Ipv4Addr::BROADCAST,
            interval: BROADCAST_INTERVAL,
            max_rounds: None,
            span,
        }
    }

    pub fn with_target_ip(mut self, ip: Ipv4Addr) -> Self {
        self.target_ip = ip;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Give up with `Error::Discovery` after this many broadcasts.
    pub fn with_max_rounds(mut self, rounds: u32) -> Self {
        self.max_rounds = Some(rounds);
        self
    }

    /// Broadcast until a reply with the matching key arrives.
    pub fn run(self) -> Result<Found> {
        let listen = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        listen.set_read_timeout(Some(LISTEN_POLL))?;
        let reply_port = listen.local_addr()?.port();

        let sender = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        sender.set_broadcast(true)?;
        let target = SocketAddr::new(IpAddr::V4(self.target_ip), self.key.port());
        let announce = encode_datagram(&Announce {
            msg: SIGNATURE.to_string(),
            port: reply_port,
        });

        let stop = Arc::new(AtomicBool::new(false));
        let (found_tx, found_rx) = bounded(1);
        let listener = {
            let stop = stop.clone();
            let key = self.key.to_string();
            let span = self.span.clone();
            thread::spawn(move || -> io::Result<()> {
                let mut buf = [0u8; MAX_DATAGRAM];
                while !stop.load(Ordering::Relaxed) {
                    let (n, from) = match listen.recv_from(&mut buf) {
                        Ok(r) => r,
                        Err(e) if is_timeout(&e) => continue,
                        Err(e) => return Err(e),
                    };
                    match decode_datagram::<Reply>(&buf[..n]) {
                        Some(reply) if reply.key == key && reply.port != 0 => {
                            let _ = found_tx.send(Found {
                                ip: from.ip(),
                                port: reply.port,
                            });
                            return Ok(());
                        }
                        _ => tracing::debug!(parent: &span, %from, "ignored datagram"),
                    }
                }
                Ok(())
            })
        };

        tracing::info!(parent: &self.span, %target, reply_port, "broadcasting");

        let mut rounds = 0u32;
        let outcome = loop {
            if let Err(e) = sender.send_to(&announce, target) {
                tracing::warn!(parent: &self.span, error = %e, "broadcast send failed");
            }
            rounds += 1;

            match found_rx.recv_timeout(self.interval) {
                Ok(found) => break Ok(found),
                Err(RecvTimeoutError::Timeout) => {
                    if self.max_rounds.is_some_and(|max| rounds >= max) {
                        break Err(Error::Discovery(format!(
                            "no reply after {} broadcasts",
                            rounds
                        )));
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    break Err(Error::Discovery("reply listener stopped".to_string()))
                }
            }
        };

        stop.store(true, Ordering::Relaxed);
        let listened = listener
            .join()
            .map_err(|_| Error::Discovery("reply listener panicked".to_string()))?;

        match (outcome, listened) {
            (Ok(found), _) => {
                tracing::info!(parent: &self.span, ip = %found.ip, port = found.port, "peer found");
                Ok(found)
            }
            (Err(_), Err(e)) => Err(e.into()),
            (Err(e), Ok(())) => Err(e),
        }
    }
}

// =============================================================================
// Responder
// =============================================================================

pub struct Responder {
    key: ConnectKey,
    bind_ip: Ipv4Addr,
    timeout: Option<Duration>,
    span: Span,
}

impl Responder {
    /// Listen on all interfaces, on the key's port.
    pub fn new(key: ConnectKey, span: Span) -> Self {
        Self {
            key,
            bind_ip: Ipv4Addr::UNSPECIFIED,
            timeout: None,
            span,
        }
    }

    pub fn with_bind_ip(mut self, ip: Ipv4Addr) -> Self {
        self.bind_ip = ip;
        self
    }

    /// Fail with `Error::Timeout` if no broadcast arrives in time.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Wait for a broadcast, answer it with `tcp_port`, and return the
    /// broadcaster's address.
    pub fn run(self, tcp_port: u16) -> Result<IpAddr> {
        let socket = UdpSocket::bind((self.bind_ip, self.key.port()))?;
        let deadline = self.timeout.map(|t| Instant::now() + t);
        tracing::info!(parent: &self.span, port = self.key.port(), "listening for broadcast");

        let mut buf = [0u8; MAX_DATAGRAM];
        let (announce, from) = loop {
            if let Some(deadline) = deadline {
                let left = deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    return Err(Error::Timeout("discovery broadcast".to_string()));
                }
                socket.set_read_timeout(Some(left))?;
            }

            let (n, from) = match socket.recv_from(&mut buf) {
                Ok(r) => r,
                Err(e) if is_timeout(&e) => continue,
                Err(e) => return Err(e.into()),
            };
            match decode_datagram::<Announce>(&buf[..n]) {
                Some(a) if a.msg == SIGNATURE && a.port != 0 => break (a, from),
                _ => tracing::debug!(parent: &self.span, %from, "ignored datagram"),
            }
        };
        drop(socket);

        let reply = encode_datagram(&Reply {
            key: self.key.to_string(),
            port: tcp_port,
        });
        let sender = UdpSocket::bind((self.bind_ip, 0))?;
        sender.set_broadcast(true)?;
        sender.send_to(&reply, SocketAddr::new(from.ip(), announce.port))?;

        tracing::info!(parent: &self.span, peer = %from.ip(), tcp_port, "replied to broadcaster");
        Ok(from.ip())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn loopback_beacon(key: ConnectKey) -> Beacon {
        Beacon::new(key, Span::none())
            .with_target_ip(Ipv4Addr::LOCALHOST)
            .with_interval(Duration::from_millis(100))
    }

    fn loopback_responder(key: ConnectKey) -> Responder {
        Responder::new(key, Span::none())
            .with_bind_ip(Ipv4Addr::LOCALHOST)
            .with_timeout(Duration::from_secs(10))
    }

    #[test]
    fn test_key_generate_and_parse() {
        for _ in 0..50 {
            let key = ConnectKey::generate();
            let text = key.to_string();
            assert_eq!(text.len(), 10);
            assert!(text[..5].bytes().all(|b| b.is_ascii_lowercase()));
            assert!((KEY_PORT_MIN..=KEY_PORT_MAX).contains(&key.port()));
            assert_eq!(text.parse::<ConnectKey>().unwrap(), key);
        }
    }

    #[test]
    fn test_key_parse_rejects() {
        assert!("qwert4123".parse::<ConnectKey>().is_err());
        assert!("qwert412345".parse::<ConnectKey>().is_err());
        assert!("qwertabcde".parse::<ConnectKey>().is_err());
        assert!("qwert+4123".parse::<ConnectKey>().is_err());
        assert!("qwert99999".parse::<ConnectKey>().is_err());
        assert_eq!("qwert41234".parse::<ConnectKey>().unwrap().port(), 41234);
        assert_eq!(" abcde30000\n".parse::<ConnectKey>().unwrap().port(), 30000);
    }

    #[test]
    fn test_datagram_shape() {
        let data = encode_datagram(&Announce {
            msg: SIGNATURE.to_string(),
            port: 40000,
        });
        let json = STANDARD.decode(&data).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&json).unwrap();
        assert_eq!(value["msg"], SIGNATURE);
        assert_eq!(value["port"], 40000);
    }

    #[test]
    fn test_malformed_datagrams_decode_to_none() {
        assert!(decode_datagram::<Reply>(b"not base64 !!").is_none());
        let not_json = STANDARD.encode("{nope").into_bytes();
        assert!(decode_datagram::<Reply>(&not_json).is_none());
        let wrong_shape = encode_datagram(&Announce {
            msg: "x".into(),
            port: 1,
        });
        assert!(decode_datagram::<Reply>(&wrong_shape).is_none());
    }

    #[test]
    #[serial]
    fn test_loopback_discovery() {
        let key = ConnectKey::generate();
        let responder = loopback_responder(key.clone());
        let handle = thread::spawn(move || responder.run(45678));

        let found = loopback_beacon(key).with_max_rounds(50).run().unwrap();
        assert_eq!(found.port, 45678);
        assert!(found.ip.is_loopback());
        assert!(handle.join().unwrap().unwrap().is_loopback());
    }

    #[test]
    #[serial]
    fn test_responder_skips_garbage() {
        let key = ConnectKey::generate();
        let port = key.port();
        let responder = loopback_responder(key.clone());
        let handle = thread::spawn(move || responder.run(50001));

        // junk and a foreign signature first; neither is answered
        let junk = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let foreign = encode_datagram(&Announce {
            msg: "someone else".into(),
            port: 1234,
        });
        for _ in 0..3 {
            junk.send_to(b"\x00\x01garbage", (Ipv4Addr::LOCALHOST, port)).unwrap();
            junk.send_to(&foreign, (Ipv4Addr::LOCALHOST, port)).unwrap();
            thread::sleep(Duration::from_millis(20));
        }

        let found = loopback_beacon(key).with_max_rounds(50).run().unwrap();
        assert_eq!(found.port, 50001);
        handle.join().unwrap().unwrap();
    }

    #[test]
    #[serial]
    fn test_beacon_ignores_wrong_key() {
        let key = ConnectKey::generate();
        let mut other: ConnectKey = key.clone();
        other.word = if key.word == "zzzzz" { "aaaaa" } else { "zzzzz" }.to_string();

        // answers with the wrong key, so the beacon keeps going until it gives up
        let responder = loopback_responder(other);
        let handle = thread::spawn(move || responder.run(40404));

        let err = loopback_beacon(key).with_max_rounds(5).run().unwrap_err();
        assert!(matches!(err, Error::Discovery(_)));
        handle.join().unwrap().unwrap();
    }

    #[test]
    #[serial]
    fn test_responder_timeout() {
        let key = ConnectKey::generate();
        let err = Responder::new(key, Span::none())
            .with_bind_ip(Ipv4Addr::LOCALHOST)
            .with_timeout(Duration::from_millis(200))
            .run(1)
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }
}
