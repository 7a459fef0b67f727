//! Forwarding workers: local TCP forwards, the SOCKS5 listener, and X11.
//!
//! All three share the same shape: a non-blocking accept loop on a
//! dedicated thread, one worker per accepted connection, and a
//! bidirectional splice between a local socket and an SSH `direct-tcpip`
//! channel. Every blocking point observes its stop flag within a bounded
//! interval so shutdown is prompt.

pub mod local;
pub mod socks;
pub mod x11;

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use socket2::{Domain, Protocol, Socket, Type};

pub use local::PortForwarder;
pub use socks::SocksProxy;
pub use x11::X11Forwarder;

/// How long an idle splice iteration sleeps.
const SPLICE_IDLE_SLEEP: Duration = Duration::from_millis(10);
/// How long the accept loop sleeps when nothing is pending.
const ACCEPT_IDLE_SLEEP: Duration = Duration::from_millis(50);
/// Splice buffer size.
const SPLICE_BUF: usize = 8192;

/// Snapshot of a forwarder's transfer counters.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TunnelStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub active_connections: u32,
    pub total_connections: u64,
}

/// Shared atomic counters updated by tunnel workers.
#[derive(Debug)]
pub(crate) struct ForwarderStats {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    active_connections: AtomicU32,
    total_connections: AtomicU64,
}

impl ForwarderStats {
    pub(crate) fn new() -> Self {
        Self {
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            active_connections: AtomicU32::new(0),
            total_connections: AtomicU64::new(0),
        }
    }

    pub(crate) fn snapshot(&self) -> TunnelStats {
        TunnelStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            total_connections: self.total_connections.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

/// One-shot event with a bounded wait, set by accept loops on their first
/// service tick.
#[derive(Debug)]
pub(crate) struct ReadyFlag {
    state: Mutex<bool>,
    cond: Condvar,
}

impl ReadyFlag {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn set(&self) {
        let mut ready = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *ready = true;
        self.cond.notify_all();
    }

    /// Wait until set; false on timeout.
    pub(crate) fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut ready = self.state.lock().unwrap_or_else(|e| e.into_inner());
        while !*ready {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(ready, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            ready = guard;
        }
        true
    }
}

/// Bind a listener with SO_REUSEADDR, which std's `TcpListener::bind` does
/// not set.
pub(crate) fn bind_listener(bind: &str, port: u16) -> std::io::Result<TcpListener> {
    let bind = if bind.is_empty() { "0.0.0.0" } else { bind };
    let addr = (bind, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::AddrNotAvailable, bind))?;
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;
    Ok(socket.into())
}

/// Write the whole buffer, sleeping briefly on WouldBlock, bailing out when
/// the stop flag flips.
pub(crate) fn write_all_retry(
    writer: &mut impl Write,
    mut buf: &[u8],
    shutdown: &AtomicBool,
) -> std::io::Result<()> {
    while !buf.is_empty() {
        if shutdown.load(Ordering::Relaxed) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Interrupted,
                "shutting down",
            ));
        }
        match writer.write(buf) {
            Ok(0) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "write returned 0",
                ))
            }
            Ok(n) => buf = &buf[n..],
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_micros(200));
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Bidirectional relay between an accepted TCP stream and a `direct-tcpip`
/// channel. Runs until either side reads EOF, an error occurs, or the stop
/// flag flips; both sides are closed on the way out.
pub(crate) fn splice(
    mut stream: TcpStream,
    mut channel: ssh2::Channel,
    shutdown: &AtomicBool,
    stats: &ForwarderStats,
) {
    if stream.set_nonblocking(true).is_err() {
        let _ = channel.close();
        return;
    }

    let mut buf = [0u8; SPLICE_BUF];
    while !shutdown.load(Ordering::Relaxed) {
        let mut did_work = false;

        // local -> remote
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if write_all_retry(&mut channel, &buf[..n], shutdown).is_err() {
                    break;
                }
                stats.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
                did_work = true;
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(_) => break,
        }

        // remote -> local
        match channel.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if write_all_retry(&mut stream, &buf[..n], shutdown).is_err() {
                    break;
                }
                stats.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                did_work = true;
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(_) => break,
        }

        if !did_work {
            std::thread::sleep(SPLICE_IDLE_SLEEP);
        }
    }

    let _ = channel.send_eof();
    let _ = channel.close();
    let _ = stream.shutdown(std::net::Shutdown::Both);
}

/// Open a `direct-tcpip` channel on a non-blocking session, retrying on
/// EAGAIN until the deadline.
pub(crate) fn open_direct_tcpip(
    session: &ssh2::Session,
    host: &str,
    port: u16,
    src: Option<(&str, u16)>,
    deadline: Instant,
) -> Result<ssh2::Channel, ssh2::Error> {
    loop {
        match session.channel_direct_tcpip(host, port, src) {
            Ok(channel) => return Ok(channel),
            Err(e) if crate::errors::ssh_would_block(&e) => {
                if Instant::now() >= deadline {
                    return Err(e);
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            Err(e) => return Err(e),
        }
    }
}
