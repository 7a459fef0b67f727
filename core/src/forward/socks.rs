//! Local SOCKS5 listener tunneling CONNECT requests through the session.
//!
//! Standard SOCKS5 with the no-auth method and the CONNECT command only;
//! IPv4, IPv6, and domain address types are accepted. BIND and UDP
//! ASSOCIATE get `command not supported`; an unknown address type gets
//! `address type not supported`; a failed channel open gets
//! `host unreachable`. After a successful reply the connection is spliced
//! onto a `direct-tcpip` channel exactly like a configured local forward.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error};

use super::{ForwarderStats, ReadyFlag, TunnelStats, ACCEPT_IDLE_SLEEP};
use crate::config::SocksListener;
use crate::errors::{ClientError, Result};

const SOCKS5_VERSION: u8 = 0x05;
const SOCKS5_NO_AUTH: u8 = 0x00;
const SOCKS5_NO_ACCEPTABLE: u8 = 0xFF;
const SOCKS5_CMD_CONNECT: u8 = 0x01;
const SOCKS5_ATYP_IPV4: u8 = 0x01;
const SOCKS5_ATYP_DOMAIN: u8 = 0x03;
const SOCKS5_ATYP_IPV6: u8 = 0x04;
const SOCKS5_REP_SUCCESS: u8 = 0x00;
const SOCKS5_REP_HOST_UNREACHABLE: u8 = 0x04;
const SOCKS5_REP_CMD_NOT_SUPPORTED: u8 = 0x07;
const SOCKS5_REP_ATYP_NOT_SUPPORTED: u8 = 0x08;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const CHANNEL_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

/// A running SOCKS5 listener and its worker threads.
#[derive(Debug)]
pub struct SocksProxy {
    shutdown: Arc<AtomicBool>,
    ready: Arc<ReadyFlag>,
    listener_thread: Option<thread::JoinHandle<()>>,
    workers: Arc<Mutex<Vec<thread::JoinHandle<()>>>>,
    stats: Arc<ForwarderStats>,
    local_addr: SocketAddr,
}

impl SocksProxy {
    pub(crate) fn start(session: Arc<ssh2::Session>, listener_cfg: &SocksListener) -> Result<Self> {
        let listener = super::bind_listener(&listener_cfg.bind, listener_cfg.port)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let ready = Arc::new(ReadyFlag::new());
        let workers = Arc::new(Mutex::new(Vec::new()));
        let stats = Arc::new(ForwarderStats::new());

        debug!(local = %local_addr, "Starting SOCKS5 listener");

        let listener_thread = {
            let shutdown = shutdown.clone();
            let ready = ready.clone();
            let workers = workers.clone();
            let stats = stats.clone();
            thread::Builder::new()
                .name(format!("socks-{}", local_addr.port()))
                .spawn(move || {
                    accept_loop(listener, session, shutdown, ready, workers, stats);
                })
                .map_err(|e| ClientError::Channel(format!("failed to spawn accept loop: {e}")))?
        };

        Ok(Self {
            shutdown,
            ready,
            listener_thread: Some(listener_thread),
            workers,
            stats,
            local_addr,
        })
    }

    /// Block until the accept loop is serving; `TunnelNotStarted` otherwise.
    pub fn wait_started(&self, timeout: Duration) -> Result<()> {
        if self.ready.wait(timeout) {
            Ok(())
        } else {
            Err(ClientError::TunnelNotStarted {
                addr: self.local_addr.to_string(),
                timeout,
            })
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> TunnelStats {
        self.stats.snapshot()
    }

    /// Stop accepting and close every in-flight connection.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.listener_thread.take() {
            let _ = handle.join();
        }
        let drained: Vec<_> = {
            let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            workers.drain(..).collect()
        };
        for handle in drained {
            let _ = handle.join();
        }
        debug!(local = %self.local_addr, "SOCKS5 listener stopped");
    }
}

impl Drop for SocksProxy {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(
    listener: std::net::TcpListener,
    session: Arc<ssh2::Session>,
    shutdown: Arc<AtomicBool>,
    ready: Arc<ReadyFlag>,
    workers: Arc<Mutex<Vec<thread::JoinHandle<()>>>>,
    stats: Arc<ForwarderStats>,
) {
    ready.set();
    while !shutdown.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, _peer)) => {
                stats.connection_opened();
                let session = session.clone();
                let shutdown = shutdown.clone();
                let stats_for_worker = stats.clone();
                let worker = thread::spawn(move || {
                    handle_client(stream, session, &shutdown, &stats_for_worker);
                    stats_for_worker.connection_closed();
                });
                workers
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(worker);
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_IDLE_SLEEP);
            }
            Err(e) => {
                if !shutdown.load(Ordering::Relaxed) {
                    error!("SOCKS5 accept error: {e}");
                }
                break;
            }
        }
    }
}

fn handle_client(
    mut stream: TcpStream,
    session: Arc<ssh2::Session>,
    shutdown: &AtomicBool,
    stats: &ForwarderStats,
) {
    if stream.set_nonblocking(false).is_err()
        || stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT)).is_err()
    {
        return;
    }

    // Greeting.
    let mut header = [0u8; 2];
    if stream.read_exact(&mut header).is_err() || header[0] != SOCKS5_VERSION {
        return;
    }
    let mut methods = vec![0u8; header[1] as usize];
    if stream.read_exact(&mut methods).is_err() {
        return;
    }
    if !methods.contains(&SOCKS5_NO_AUTH) {
        let _ = stream.write_all(&[SOCKS5_VERSION, SOCKS5_NO_ACCEPTABLE]);
        return;
    }
    if stream.write_all(&[SOCKS5_VERSION, SOCKS5_NO_AUTH]).is_err() {
        return;
    }

    // Request.
    let (host, port) = match parse_connect_request(&mut stream) {
        Ok(Ok(dest)) => dest,
        Ok(Err(reply_code)) => {
            let _ = send_reply(&mut stream, reply_code);
            return;
        }
        Err(_) => return,
    };

    // Channel to the requested destination.
    let deadline = Instant::now() + CHANNEL_OPEN_TIMEOUT;
    let mut channel = match super::open_direct_tcpip(&session, &host, port, None, deadline) {
        Ok(channel) => channel,
        Err(e) => {
            debug!("SOCKS5 CONNECT to {host}:{port} failed: {e}");
            let _ = send_reply(&mut stream, SOCKS5_REP_HOST_UNREACHABLE);
            return;
        }
    };

    if send_reply(&mut stream, SOCKS5_REP_SUCCESS).is_err() {
        let _ = channel.close();
        return;
    }

    debug!("SOCKS5 tunnel open to {host}:{port}");
    super::splice(stream, channel, shutdown, stats);
}

/// Parse the CONNECT request. The outer error is a socket failure; the
/// inner `Err(code)` is a protocol refusal to send back to the client.
pub(crate) fn parse_connect_request(
    stream: &mut impl Read,
) -> std::io::Result<std::result::Result<(String, u16), u8>> {
    let mut head = [0u8; 4];
    stream.read_exact(&mut head)?;
    if head[0] != SOCKS5_VERSION {
        return Ok(Err(SOCKS5_REP_CMD_NOT_SUPPORTED));
    }
    if head[1] != SOCKS5_CMD_CONNECT {
        return Ok(Err(SOCKS5_REP_CMD_NOT_SUPPORTED));
    }
    let host = match head[3] {
        SOCKS5_ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets)?;
            Ipv4Addr::from(octets).to_string()
        }
        SOCKS5_ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets)?;
            Ipv6Addr::from(octets).to_string()
        }
        SOCKS5_ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len)?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name)?;
            match String::from_utf8(name) {
                Ok(name) => name,
                Err(_) => return Ok(Err(SOCKS5_REP_ATYP_NOT_SUPPORTED)),
            }
        }
        _ => return Ok(Err(SOCKS5_REP_ATYP_NOT_SUPPORTED)),
    };
    let mut port = [0u8; 2];
    stream.read_exact(&mut port)?;
    Ok(Ok((host, u16::from_be_bytes(port))))
}

/// Reply with the given status and a zeroed bound address.
pub(crate) fn send_reply(stream: &mut impl Write, reply: u8) -> std::io::Result<()> {
    let message = [
        SOCKS5_VERSION,
        reply,
        0x00,
        SOCKS5_ATYP_IPV4,
        0,
        0,
        0,
        0,
        0,
        0,
    ];
    stream.write_all(&message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn request(bytes: &[u8]) -> std::result::Result<(String, u16), u8> {
        parse_connect_request(&mut Cursor::new(bytes.to_vec())).unwrap()
    }

    #[test]
    fn parses_ipv4_connect() {
        let (host, port) = request(&[0x05, 0x01, 0x00, 0x01, 10, 0, 0, 9, 0x00, 0x16]).unwrap();
        assert_eq!(host, "10.0.0.9");
        assert_eq!(port, 22);
    }

    #[test]
    fn parses_domain_connect() {
        let mut bytes = vec![0x05, 0x01, 0x00, 0x03, 11];
        bytes.extend_from_slice(b"db.internal");
        bytes.extend_from_slice(&[0x1f, 0x90]);
        let (host, port) = request(&bytes).unwrap();
        assert_eq!(host, "db.internal");
        assert_eq!(port, 8080);
    }

    #[test]
    fn parses_ipv6_connect() {
        let mut bytes = vec![0x05, 0x01, 0x00, 0x04];
        bytes.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);
        bytes.extend_from_slice(&[0x00, 0x16]);
        let (host, port) = request(&bytes).unwrap();
        assert_eq!(host, "::1");
        assert_eq!(port, 22);
    }

    #[test]
    fn bind_command_is_not_supported() {
        let code = request(&[0x05, 0x02, 0x00, 0x01, 0, 0, 0, 0, 0, 0]).unwrap_err();
        assert_eq!(code, SOCKS5_REP_CMD_NOT_SUPPORTED);
    }

    #[test]
    fn udp_associate_is_not_supported() {
        let code = request(&[0x05, 0x03, 0x00, 0x01, 0, 0, 0, 0, 0, 0]).unwrap_err();
        assert_eq!(code, SOCKS5_REP_CMD_NOT_SUPPORTED);
    }

    #[test]
    fn unknown_atyp_is_not_supported() {
        let code = request(&[0x05, 0x01, 0x00, 0x02, 0, 0, 0, 0, 0, 0]).unwrap_err();
        assert_eq!(code, SOCKS5_REP_ATYP_NOT_SUPPORTED);
    }

    #[test]
    fn truncated_request_is_a_socket_error() {
        let result = parse_connect_request(&mut Cursor::new(vec![0x05, 0x01]));
        assert!(result.is_err());
    }

    #[test]
    fn reply_encodes_zeroed_bound_address() {
        let mut out = Vec::new();
        send_reply(&mut out, SOCKS5_REP_SUCCESS).unwrap();
        assert_eq!(out, [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
    }
}
