//! TCP helpers shared by both sides of a session.

use crate::error::{Error, Result};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::thread;
use std::time::{Duration, Instant};

/// How long the receiver waits for each incoming connection.
pub const ACCEPT_TIMEOUT: Duration = Duration::from_secs(10);

const ACCEPT_POLL: Duration = Duration::from_millis(20);

/// Accept one connection, or `Error::Timeout` once `timeout` has passed.
///
/// The returned stream is in blocking mode.
pub fn accept_timeout(listener: &TcpListener, timeout: Duration) -> Result<(TcpStream, SocketAddr)> {
    listener.set_nonblocking(true)?;
    let deadline = Instant::now() + timeout;

    let accepted = loop {
        match listener.accept() {
            Ok(pair) => break Ok(pair),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    break Err(Error::Timeout("incoming connection".to_string()));
                }
                thread::sleep(ACCEPT_POLL);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => break Err(e.into()),
        }
    };

    listener.set_nonblocking(false)?;
    let (stream, addr) = accepted?;
    stream.set_nonblocking(false)?;
    Ok((stream, addr))
}

/// Accept the control connection from `peer`, asking `keep_waiting` after
/// every timeout. Connections from other hosts are dropped.
pub fn accept_control<F>(
    listener: &TcpListener,
    peer: IpAddr,
    timeout: Duration,
    mut keep_waiting: F,
) -> Result<TcpStream>
where
    F: FnMut(u32) -> bool,
{
    let mut attempt = 0u32;
    loop {
        match accept_timeout(listener, timeout) {
            Ok((stream, addr)) if addr.ip() == peer => return Ok(stream),
            Ok((_, addr)) => {
                tracing::warn!(%addr, expected = %peer, "ignored connection from unexpected peer");
            }
            Err(Error::Timeout(what)) => {
                attempt += 1;
                if !keep_waiting(attempt) {
                    return Err(Error::Timeout(what));
                }
            }
            Err(e) => return Err(e),
        }
    }
}

/// Address of the interface that routes to the LAN, or loopback.
pub fn local_ip() -> IpAddr {
    let probe = || -> io::Result<IpAddr> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect((Ipv4Addr::new(10, 255, 255, 255), 1))?;
        Ok(socket.local_addr()?.ip())
    };
    match probe() {
        Ok(ip) if !ip.is_unspecified() => ip,
        _ => IpAddr::V4(Ipv4Addr::LOCALHOST),
    }
}
