//! X11 forwarding.
//!
//! The session requests a remote listener before the pty is allocated; the
//! remote `DISPLAY` is derived from the bound port. Each connection the
//! server opens is paired with a socket to the local display — the UNIX
//! socket `/tmp/.X11-unix/X<n>` when present, TCP `127.0.0.1:6000+n`
//! otherwise — and the pairs are pumped by a single event loop. Connecting
//! to the display can take seconds (especially when a server has to be
//! started first), so it runs on a short-lived worker, never on the accept
//! path. A failure closes only the affected pair.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::Duration;

use rand::RngCore;
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::errors::{ssh_would_block, ClientError, Result};

/// Pump buffer, matching the largest common X11 request batches.
const PUMP_BUF: usize = 16384;

/// How to reach the local display.
#[derive(Debug, Clone)]
pub(crate) struct LocalDisplay {
    pub display_number: u32,
    pub try_start_server: bool,
}

/// Forwards remote X11 connections to the local display server.
pub struct X11Forwarder {
    alive: Arc<AtomicBool>,
    listener: Option<ssh2::Listener>,
    thread: Option<thread::JoinHandle<()>>,
    local: LocalDisplay,
    remote_display: u32,
    cookie: Option<String>,
}

impl X11Forwarder {
    /// Request the remote listener. Must run before the pty is allocated on
    /// the shell channel; the event loop is spawned separately once the
    /// session switches to non-blocking mode.
    pub(crate) fn listen(session: &ssh2::Session, config: &ClientConfig) -> Result<Self> {
        let display_number = local_display_number();
        let cookie = match read_local_xauth_cookie(display_number) {
            Some(cookie) => Some(cookie),
            None => {
                warn!("No xauth cookie for local display :{display_number}, generating one");
                Some(generate_cookie())
            }
        };

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        let (listener, bound_port) =
            crate::session::retry_ssh(deadline, || {
                session.channel_forward_listen(0, Some("localhost"), None)
            })
            .map_err(|e| ClientError::X11Connection(format!("remote listen failed: {e}")))?;
        let remote_display = (bound_port as u32).saturating_sub(6000);
        info!(
            "X11 forwarding: remote listening on port {bound_port} (display :{remote_display})"
        );

        Ok(Self {
            alive: Arc::new(AtomicBool::new(true)),
            listener: Some(listener),
            thread: None,
            local: LocalDisplay {
                display_number,
                try_start_server: config.x11_try_start_server,
            },
            remote_display,
            cookie,
        })
    }

    /// Remote display number, for the exported `DISPLAY`.
    pub fn remote_display(&self) -> u32 {
        self.remote_display
    }

    /// Cookie for the remote `xauth add` line.
    pub fn cookie(&self) -> Option<&str> {
        self.cookie.as_deref()
    }

    /// Start the event loop. The loop also ends when the shell goes away.
    pub(crate) fn spawn_loop(&mut self, shell_active: Arc<AtomicBool>) -> Result<()> {
        let listener = self
            .listener
            .take()
            .ok_or_else(|| ClientError::X11Connection("event loop already running".into()))?;
        let alive = self.alive.clone();
        let local = self.local.clone();
        let thread = thread::Builder::new()
            .name("x11-forward".to_string())
            .spawn(move || event_loop(listener, alive, shell_active, local))
            .map_err(|e| ClientError::X11Connection(format!("failed to spawn event loop: {e}")))?;
        self.thread = Some(thread);
        Ok(())
    }

    pub(crate) fn shutdown(&mut self) {
        self.alive.store(false, Ordering::SeqCst);
        self.listener = None;
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for X11Forwarder {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for X11Forwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("X11Forwarder")
            .field("remote_display", &self.remote_display)
            .finish()
    }
}

/// Accept remote channels, pair each with a local display socket, and pump
/// every pair. One loop per session.
fn event_loop(
    mut listener: ssh2::Listener,
    alive: Arc<AtomicBool>,
    shell_active: Arc<AtomicBool>,
    local: LocalDisplay,
) {
    let (pair_tx, pair_rx) = mpsc::channel::<ChannelPair>();
    let mut pairs: Vec<ChannelPair> = Vec::new();
    let mut connectors: Vec<thread::JoinHandle<()>> = Vec::new();

    while alive.load(Ordering::SeqCst) && shell_active.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok(channel) => {
                debug!("X11 forwarding: accepted remote channel");
                let tx = pair_tx.clone();
                let local = local.clone();
                // The display connect may block for seconds; keep it off
                // the accept path.
                connectors.push(thread::spawn(move || {
                    match connect_local_display(&local) {
                        Ok(stream) => {
                            let _ = tx.send(ChannelPair { channel, stream });
                        }
                        Err(e) => {
                            error!("X11 channel dropped: {e}");
                            let mut channel = channel;
                            let _ = channel.close();
                        }
                    }
                }));
            }
            Err(ref e) if ssh_would_block(e) => {}
            Err(e) => {
                if alive.load(Ordering::SeqCst) {
                    warn!("X11 listener error: {e}");
                }
                break;
            }
        }

        while let Ok(pair) = pair_rx.try_recv() {
            pairs.push(pair);
        }

        pairs.retain_mut(|pair| pair.pump(&alive));

        thread::sleep(if pairs.is_empty() {
            Duration::from_millis(50)
        } else {
            Duration::from_millis(1)
        });
    }

    for pair in &mut pairs {
        pair.close();
    }
    for connector in connectors {
        let _ = connector.join();
    }
    debug!("X11 event loop finished ({} pairs cleaned up)", pairs.len());
}

/// A remote X11 channel and its local display socket.
struct ChannelPair {
    channel: ssh2::Channel,
    stream: LocalStream,
}

impl ChannelPair {
    /// Relay both directions once. False when the pair is dead; the caller
    /// drops it, closing both sides.
    fn pump(&mut self, alive: &AtomicBool) -> bool {
        let mut buf = [0u8; PUMP_BUF];

        // remote -> local display
        match self.channel.read(&mut buf) {
            Ok(0) => return self.close(),
            Ok(n) => {
                if write_bounded(&mut self.stream, &buf[..n], alive).is_err() {
                    return self.close();
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(_) => return self.close(),
        }

        // local display -> remote
        match self.stream.read(&mut buf) {
            Ok(0) => return self.close(),
            Ok(n) => {
                if write_bounded(&mut self.channel, &buf[..n], alive).is_err() {
                    return self.close();
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(_) => return self.close(),
        }

        true
    }

    /// Close both sides; always returns false so `retain_mut` drops the
    /// pair.
    fn close(&mut self) -> bool {
        let _ = self.channel.send_eof();
        let _ = self.channel.close();
        self.stream.shutdown();
        false
    }
}

/// Write the whole buffer, retrying on WouldBlock while the loop is alive.
fn write_bounded(
    writer: &mut impl Write,
    mut buf: &[u8],
    alive: &AtomicBool,
) -> std::io::Result<()> {
    while !buf.is_empty() {
        if !alive.load(Ordering::SeqCst) {
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
                thread::sleep(Duration::from_micros(200));
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Socket to the local display, UNIX or TCP.
enum LocalStream {
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixStream),
    Tcp(TcpStream),
}

impl LocalStream {
    fn shutdown(&self) {
        match self {
            #[cfg(unix)]
            Self::Unix(s) => {
                let _ = s.shutdown(std::net::Shutdown::Both);
            }
            Self::Tcp(s) => {
                let _ = s.shutdown(std::net::Shutdown::Both);
            }
        }
    }
}

impl Read for LocalStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            #[cfg(unix)]
            Self::Unix(s) => s.read(buf),
            Self::Tcp(s) => s.read(buf),
        }
    }
}

impl Write for LocalStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            #[cfg(unix)]
            Self::Unix(s) => s.write(buf),
            Self::Tcp(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            #[cfg(unix)]
            Self::Unix(s) => s.flush(),
            Self::Tcp(s) => s.flush(),
        }
    }
}

/// Connect to the local display, optionally starting a server on the first
/// failure, then retrying once.
fn connect_local_display(local: &LocalDisplay) -> Result<LocalStream> {
    let first_failure = match try_connect(local.display_number) {
        Ok(stream) => return Ok(stream),
        Err(e) => e,
    };
    if !local.try_start_server {
        return Err(ClientError::X11Connection(format!(
            "display :{} unreachable: {first_failure}",
            local.display_number
        )));
    }
    if !start_x11_server() {
        return Err(ClientError::X11Connection(format!(
            "display :{} unreachable and no X server could be started: {first_failure}",
            local.display_number
        )));
    }
    // Give the freshly spawned server a moment to listen.
    thread::sleep(Duration::from_millis(1500));
    try_connect(local.display_number).map_err(|e| {
        ClientError::X11Connection(format!(
            "display :{} unreachable: {e}",
            local.display_number
        ))
    })
}

fn try_connect(display_number: u32) -> std::io::Result<LocalStream> {
    #[cfg(unix)]
    {
        let socket_path = format!("/tmp/.X11-unix/X{display_number}");
        if std::path::Path::new(&socket_path).exists() {
            let stream = std::os::unix::net::UnixStream::connect(&socket_path)?;
            stream.set_nonblocking(true)?;
            return Ok(LocalStream::Unix(stream));
        }
    }
    let port = 6000 + display_number as u16;
    let stream = TcpStream::connect(("127.0.0.1", port))?;
    stream.set_nonblocking(true)?;
    Ok(LocalStream::Tcp(stream))
}

// --- X server autostart ---

/// Known X servers to probe when the display is unreachable: binary name
/// (looked up on PATH via where/which) and install-path fallbacks.
#[cfg(windows)]
const X_SERVER_CANDIDATES: &[(&str, &[&str])] = &[
    ("vcxsrv", &["C:\\Program Files\\VcXsrv\\vcxsrv.exe"]),
    ("xming", &["C:\\Program Files (x86)\\Xming\\Xming.exe"]),
];

#[cfg(not(windows))]
const X_SERVER_CANDIDATES: &[(&str, &[&str])] = &[];

fn spawned_servers() -> &'static Mutex<Vec<std::process::Child>> {
    static SERVERS: OnceLock<Mutex<Vec<std::process::Child>>> = OnceLock::new();
    SERVERS.get_or_init(|| Mutex::new(Vec::new()))
}

/// Kill every X server this process started. Exposed for embedders and
/// tests.
pub fn terminate_started_servers() {
    let mut servers = spawned_servers().lock().unwrap_or_else(|e| e.into_inner());
    for child in servers.iter_mut() {
        let _ = child.kill();
        let _ = child.wait();
    }
    servers.clear();
}

/// Probe the candidate list and spawn the first server found. The child is
/// tracked in a process-wide registry.
fn start_x11_server() -> bool {
    let lookup = if cfg!(windows) { "where" } else { "which" };
    for (name, fallback_paths) in X_SERVER_CANDIDATES {
        let on_path = std::process::Command::new(lookup)
            .arg(name)
            .output()
            .map(|out| out.status.success())
            .unwrap_or(false);
        let program = if on_path {
            Some(name.to_string())
        } else {
            fallback_paths
                .iter()
                .find(|path| std::path::Path::new(path).exists())
                .map(|path| path.to_string())
        };
        if let Some(program) = program {
            match std::process::Command::new(&program).spawn() {
                Ok(child) => {
                    info!("Started X server: {program}");
                    spawned_servers()
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .push(child);
                    return true;
                }
                Err(e) => warn!("Failed to start {program}: {e}"),
            }
        }
    }
    false
}

// --- Local display discovery ---

/// Parse a DISPLAY value into (host, display, screen).
pub(crate) fn parse_display(display: &str) -> Option<(Option<String>, u32, u32)> {
    let colon = display.rfind(':')?;
    let host_part = &display[..colon];
    let display_screen = &display[colon + 1..];

    let (display_num, screen_num) = match display_screen.find('.') {
        Some(dot) => (
            display_screen[..dot].parse().ok()?,
            display_screen[dot + 1..].parse().ok()?,
        ),
        None => (display_screen.parse().ok()?, 0),
    };

    let host = if host_part.is_empty() {
        None
    } else {
        Some(host_part.to_string())
    };
    Some((host, display_num, screen_num))
}

/// Local display number: `$DISPLAY` when parseable, else the first socket
/// under `/tmp/.X11-unix`, else 0.
pub(crate) fn local_display_number() -> u32 {
    if let Ok(display) = std::env::var("DISPLAY") {
        if let Some((_, number, _)) = parse_display(&display) {
            return number;
        }
    }
    scan_x11_sockets().unwrap_or(0)
}

fn scan_x11_sockets() -> Option<u32> {
    let entries = std::fs::read_dir("/tmp/.X11-unix").ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        if let Some(number) = name.to_string_lossy().strip_prefix('X') {
            if let Ok(number) = number.parse() {
                return Some(number);
            }
        }
    }
    None
}

/// MIT-MAGIC-COOKIE-1 for the given local display, via `xauth list`.
pub(crate) fn read_local_xauth_cookie(display_number: u32) -> Option<String> {
    let output = std::process::Command::new("xauth")
        .args(["list", &format!(":{display_number}")])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    parse_xauth_list(&String::from_utf8_lossy(&output.stdout))
}

/// Extract the first MIT-MAGIC-COOKIE-1 value from `xauth list` output.
pub(crate) fn parse_xauth_list(output: &str) -> Option<String> {
    for line in output.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() >= 3 && parts[1] == "MIT-MAGIC-COOKIE-1" {
            return Some(parts[2].to_string());
        }
    }
    None
}

/// Random 128-bit cookie in hex, used when no local cookie can be read.
pub(crate) fn generate_cookie() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
