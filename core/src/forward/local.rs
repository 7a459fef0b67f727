//! Local-to-remote port forwarding.
//!
//! A listener on the configured bind address accepts local TCP connections
//! and splices each onto an SSH `direct-tcpip` channel toward the remote
//! endpoint, with the peer address reported as the originator. A failed
//! channel open closes only that connection; the listener keeps serving.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info};

use super::{ForwarderStats, ReadyFlag, TunnelStats, ACCEPT_IDLE_SLEEP};
use crate::config::TunnelConfig;
use crate::errors::{ClientError, Result};

/// How long a tunnel worker keeps retrying the channel open.
const CHANNEL_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

/// An active local forward and its worker threads.
#[derive(Debug)]
pub struct PortForwarder {
    shutdown: Arc<AtomicBool>,
    ready: Arc<ReadyFlag>,
    listener_thread: Option<thread::JoinHandle<()>>,
    tunnels: Arc<Mutex<Vec<thread::JoinHandle<()>>>>,
    stats: Arc<ForwarderStats>,
    local_addr: SocketAddr,
    remote: (String, u16),
}

impl PortForwarder {
    /// Bind the local listener and start the accept loop.
    pub(crate) fn start(session: Arc<ssh2::Session>, tunnel: &TunnelConfig) -> Result<Self> {
        let listener = super::bind_listener(&tunnel.src.0, tunnel.src.1)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let ready = Arc::new(ReadyFlag::new());
        let tunnels = Arc::new(Mutex::new(Vec::new()));
        let stats = Arc::new(ForwarderStats::new());
        let remote = tunnel.dst.clone();

        info!(local = %local_addr, remote_host = %remote.0, remote_port = remote.1, "Starting local forward");

        let listener_thread = {
            let shutdown = shutdown.clone();
            let ready = ready.clone();
            let tunnels = tunnels.clone();
            let stats = stats.clone();
            let remote = remote.clone();
            thread::Builder::new()
                .name(format!("forward-{}", local_addr.port()))
                .spawn(move || {
                    accept_loop(listener, session, remote, shutdown, ready, tunnels, stats);
                })
                .map_err(|e| ClientError::Channel(format!("failed to spawn accept loop: {e}")))?
        };

        Ok(Self {
            shutdown,
            ready,
            listener_thread: Some(listener_thread),
            tunnels,
            stats,
            local_addr,
            remote,
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

    /// The bound local address (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The remote endpoint connections are tunneled to.
    pub fn remote_endpoint(&self) -> (&str, u16) {
        (&self.remote.0, self.remote.1)
    }

    pub fn stats(&self) -> TunnelStats {
        self.stats.snapshot()
    }

    /// Stop accepting and close every in-flight tunnel.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.listener_thread.take() {
            let _ = handle.join();
        }
        let drained: Vec<_> = {
            let mut tunnels = self.tunnels.lock().unwrap_or_else(|e| e.into_inner());
            tunnels.drain(..).collect()
        };
        for handle in drained {
            let _ = handle.join();
        }
        debug!(local = %self.local_addr, "Local forward stopped");
    }
}

impl Drop for PortForwarder {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[allow(clippy::too_many_arguments)]
fn accept_loop(
    listener: std::net::TcpListener,
    session: Arc<ssh2::Session>,
    remote: (String, u16),
    shutdown: Arc<AtomicBool>,
    ready: Arc<ReadyFlag>,
    tunnels: Arc<Mutex<Vec<thread::JoinHandle<()>>>>,
    stats: Arc<ForwarderStats>,
) {
    ready.set();
    while !shutdown.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, peer)) => {
                stats.connection_opened();
                let session = session.clone();
                let remote = remote.clone();
                let shutdown = shutdown.clone();
                let stats_for_worker = stats.clone();
                let worker = thread::spawn(move || {
                    run_tunnel(stream, peer, session, remote, &shutdown, &stats_for_worker);
                    stats_for_worker.connection_closed();
                });
                tunnels
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(worker);
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_IDLE_SLEEP);
            }
            Err(e) => {
                if !shutdown.load(Ordering::Relaxed) {
                    error!("Local forward accept error: {e}");
                }
                break;
            }
        }
    }
}

fn run_tunnel(
    stream: std::net::TcpStream,
    peer: SocketAddr,
    session: Arc<ssh2::Session>,
    remote: (String, u16),
    shutdown: &AtomicBool,
    stats: &ForwarderStats,
) {
    let src_ip = peer.ip().to_string();
    let deadline = Instant::now() + CHANNEL_OPEN_TIMEOUT;
    let channel = match super::open_direct_tcpip(
        &session,
        &remote.0,
        remote.1,
        Some((&src_ip, peer.port())),
        deadline,
    ) {
        Ok(channel) => channel,
        Err(e) => {
            error!(
                "Forward request from {peer} to {}:{} failed: {e}",
                remote.0, remote.1
            );
            let _ = stream.shutdown(std::net::Shutdown::Both);
            return;
        }
    };
    debug!(
        "Tunnel open {peer} -> {}:{}",
        remote.0, remote.1
    );
    super::splice(stream, channel, shutdown, stats);
    debug!("Tunnel closed from {peer}");
}
