//! The authenticated session: shell channel, receive worker, one-shot
//! command execution, SFTP, and the worker registry `wait_closed` joins.
//!
//! Two transports exist. The SSH transport owns an authenticated
//! `ssh2::Session` in non-blocking mode; every operation retries on EAGAIN
//! so each loop observes its stop flag within a bounded interval. The pipe
//! transport wraps an external proxy-command process whose stdio is the
//! byte stream; channel-dependent operations are not available there.
//!
//! The receive worker is the only writer to the terminal screen, and the
//! embedder's `on_recv` callback is serialized — at most one invocation is
//! live per session.

use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::process::{ChildStdin, ChildStdout};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::errors::{classify_ssh_error, ssh_would_block, ClientError, Result};
use crate::forward::X11Forwarder;
use crate::screen::{Cell, TerminalScreen};
use crate::transport::proxy_command::CommandPipe;

/// Embedder callback: raw bytes just received, or `None` to request a full
/// repaint (scroll, resize, shell end).
pub type OnRecv = dyn Fn(Option<&[u8]>) + Send + Sync;

/// Receive buffer size for the shell channel.
const RECV_BUF: usize = 8192;
/// Idle sleep of the non-blocking shell reader.
const RECV_IDLE_SLEEP: Duration = Duration::from_millis(20);
/// Default bound for one-shot command execution.
const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(30);

/// Session lifecycle. `shell_active` is true exactly in `Shelled` and the
/// draining part of `Closing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Authenticated,
    Shelled,
    Closing,
    Closed,
}

/// Options for `invoke_shell`.
pub struct ShellOptions {
    pub cols: u16,
    pub rows: u16,
    pub width_px: u32,
    pub height_px: u32,
    pub history: usize,
    pub on_recv: Option<Box<OnRecv>>,
}

impl Default for ShellOptions {
    fn default() -> Self {
        Self {
            cols: 80,
            rows: 24,
            width_px: 0,
            height_px: 0,
            history: 100,
            on_recv: None,
        }
    }
}

impl std::fmt::Debug for ShellOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellOptions")
            .field("cols", &self.cols)
            .field("rows", &self.rows)
            .field("history", &self.history)
            .finish()
    }
}

enum SessionTransport {
    Ssh { session: Arc<ssh2::Session> },
    Pipe { pipe: Mutex<CommandPipe> },
}

/// One authenticated session and everything hanging off it.
pub struct Session {
    transport: SessionTransport,
    config: ClientConfig,
    state: SessionState,
    shell: Option<Arc<Mutex<ssh2::Channel>>>,
    pipe_writer: Option<Arc<Mutex<ChildStdin>>>,
    screen: Arc<Mutex<Option<TerminalScreen>>>,
    shell_active: Arc<AtomicBool>,
    stopping: Arc<AtomicBool>,
    on_recv: Option<Arc<OnRecv>>,
    notify_lock: Arc<Mutex<()>>,
    workers: Arc<Mutex<Vec<thread::JoinHandle<()>>>>,
    x11: Option<X11Forwarder>,
}

impl Session {
    pub(crate) fn new_ssh(session: Arc<ssh2::Session>, config: ClientConfig) -> Self {
        Self {
            transport: SessionTransport::Ssh { session },
            config,
            state: SessionState::Authenticated,
            shell: None,
            pipe_writer: None,
            screen: Arc::new(Mutex::new(None)),
            shell_active: Arc::new(AtomicBool::new(false)),
            stopping: Arc::new(AtomicBool::new(false)),
            on_recv: None,
            notify_lock: Arc::new(Mutex::new(())),
            workers: Arc::new(Mutex::new(Vec::new())),
            x11: None,
        }
    }

    pub(crate) fn new_pipe(pipe: CommandPipe, config: ClientConfig) -> Self {
        Self {
            transport: SessionTransport::Pipe {
                pipe: Mutex::new(pipe),
            },
            config,
            state: SessionState::Authenticated,
            shell: None,
            pipe_writer: None,
            screen: Arc::new(Mutex::new(None)),
            shell_active: Arc::new(AtomicBool::new(false)),
            stopping: Arc::new(AtomicBool::new(false)),
            on_recv: None,
            notify_lock: Arc::new(Mutex::new(())),
            workers: Arc::new(Mutex::new(Vec::new())),
            x11: None,
        }
    }

    /// Whether this session runs over an external proxy-command pipe.
    pub fn is_proxy_command(&self) -> bool {
        matches!(self.transport, SessionTransport::Pipe { .. })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn shell_active(&self) -> bool {
        self.shell_active.load(Ordering::SeqCst)
    }

    /// The underlying ssh2 session, or `UnsupportedInMode` for pipes.
    pub(crate) fn ssh_for(&self, operation: &'static str) -> Result<&Arc<ssh2::Session>> {
        match &self.transport {
            SessionTransport::Ssh { session } => Ok(session),
            SessionTransport::Pipe { .. } => Err(ClientError::UnsupportedInMode(operation)),
        }
    }

    pub(crate) fn register_worker(&self, handle: thread::JoinHandle<()>) {
        self.workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }

    pub(crate) fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stopping.clone()
    }

    // --- Shell ---

    /// Open the interactive shell: environment, X11 registration before the
    /// pty, pty, shell request; then the terminal screen and the receive
    /// worker. In proxy-command mode the channel setup is skipped and the
    /// helper's stdio becomes the shell stream.
    pub fn invoke_shell(&mut self, options: ShellOptions) -> Result<()> {
        if self.shell.is_some() || self.pipe_writer.is_some() {
            return Err(ClientError::Channel("shell already active".into()));
        }

        let ShellOptions {
            cols,
            rows,
            width_px,
            height_px,
            history,
            on_recv,
        } = options;
        self.on_recv = on_recv.map(Arc::from);

        // Pull what the setup needs out of the transport so lifecycle state
        // can be mutated below without holding a borrow on it.
        let ssh = match &self.transport {
            SessionTransport::Ssh { session } => Some(session.clone()),
            SessionTransport::Pipe { .. } => None,
        };

        match ssh {
            None => {
                let (stdin, stdout) = match &self.transport {
                    SessionTransport::Pipe { pipe } => {
                        let mut pipe = pipe.lock().unwrap_or_else(|e| e.into_inner());
                        (pipe.take_stdin(), pipe.take_stdout())
                    }
                    SessionTransport::Ssh { .. } => (None, None),
                };
                let stdout = stdout.ok_or_else(|| {
                    ClientError::Channel("proxy command stdout unavailable".into())
                })?;
                self.pipe_writer = stdin.map(|s| Arc::new(Mutex::new(s)));

                self.install_screen(cols, rows, history);
                self.shell_active.store(true, Ordering::SeqCst);
                self.spawn_pipe_reader(stdout)?;
            }
            Some(session) => {
                // The session must be non-blocking from here on: forwarders
                // configured at connect time may already be splicing on it,
                // and an earlier SFTP open may have left it blocking.
                session.set_blocking(false);
                let deadline = Instant::now() + Duration::from_secs(15);
                let mut channel = retry_ssh(deadline, || session.channel_session())
                    .map_err(|e| ClientError::Channel(format!("channel open failed: {e}")))?;

                // Most servers reject setenv; that is fine.
                for (key, value) in &self.config.environment {
                    if let Err(e) = retry_ssh(deadline, || channel.setenv(key, value)) {
                        debug!(key = %key, "setenv rejected: {e}");
                    }
                }

                // X11 registration happens before the pty is allocated.
                let mut x11 = None;
                if self.config.x11 {
                    match X11Forwarder::listen(&session, &self.config) {
                        Ok(forwarder) => {
                            let display = format!(
                                "localhost:{}.{}",
                                forwarder.remote_display(),
                                self.config.x11_screen_number
                            );
                            let via_env =
                                retry_ssh(deadline, || channel.setenv("DISPLAY", &display))
                                    .is_ok();
                            x11 = Some((forwarder, display, via_env));
                        }
                        Err(e) => {
                            warn!("X11 forwarding setup failed, continuing without it: {e}")
                        }
                    }
                }

                retry_ssh(deadline, || {
                    channel.request_pty(
                        &self.config.term,
                        None,
                        Some((cols as u32, rows as u32, width_px, height_px)),
                    )
                })
                .map_err(|e| ClientError::Channel(format!("pty request failed: {e}")))?;
                retry_ssh(deadline, || channel.shell())
                    .map_err(|e| ClientError::Channel(format!("shell request failed: {e}")))?;

                // setenv usually fails; fall back to injecting the export
                // into the shell, plus the xauth cookie line.
                if let Some((forwarder, display, via_env)) = &x11 {
                    if !via_env {
                        let line = format!("export DISPLAY={display}\n");
                        let _ = crate::forward::write_all_retry(
                            &mut channel,
                            line.as_bytes(),
                            &self.stopping,
                        );
                    }
                    if let Some(cookie) = forwarder.cookie() {
                        let line = format!(
                            "xauth add localhost:{} {} {} 2>/dev/null\n",
                            forwarder.remote_display(),
                            self.config.x11_auth_protocol,
                            cookie
                        );
                        let _ = crate::forward::write_all_retry(
                            &mut channel,
                            line.as_bytes(),
                            &self.stopping,
                        );
                    }
                }

                self.install_screen(cols, rows, history);
                self.shell_active.store(true, Ordering::SeqCst);

                if let Some((mut forwarder, _, _)) = x11 {
                    forwarder.spawn_loop(self.shell_active.clone())?;
                    self.x11 = Some(forwarder);
                }

                let channel = Arc::new(Mutex::new(channel));
                self.spawn_ssh_reader(channel.clone())?;
                self.shell = Some(channel);
            }
        }

        self.state = SessionState::Shelled;
        Ok(())
    }

    fn install_screen(&mut self, cols: u16, rows: u16, history: usize) {
        let screen = TerminalScreen::new(cols, rows, history);
        *self.screen.lock().unwrap_or_else(|e| e.into_inner()) = Some(screen);
    }

    fn spawn_ssh_reader(&self, channel: Arc<Mutex<ssh2::Channel>>) -> Result<()> {
        let screen = self.screen.clone();
        let shell_active = self.shell_active.clone();
        let stopping = self.stopping.clone();
        let on_recv = self.on_recv.clone();
        let notify_lock = self.notify_lock.clone();

        let handle = thread::Builder::new()
            .name("shell-recv".to_string())
            .spawn(move || {
                let mut buf = [0u8; RECV_BUF];
                while shell_active.load(Ordering::SeqCst) && !stopping.load(Ordering::SeqCst) {
                    let outcome = {
                        let mut channel = match channel.lock() {
                            Ok(channel) => channel,
                            Err(_) => break,
                        };
                        channel.read(&mut buf)
                    };
                    match outcome {
                        Ok(0) => {
                            shell_active.store(false, Ordering::SeqCst);
                            notify(&on_recv, &notify_lock, None);
                            break;
                        }
                        Ok(n) => {
                            feed_screen(&screen, &buf[..n]);
                            notify(&on_recv, &notify_lock, Some(&buf[..n]));
                        }
                        Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            thread::sleep(RECV_IDLE_SLEEP);
                        }
                        Err(e) => {
                            warn!("Shell read error: {e}");
                            shell_active.store(false, Ordering::SeqCst);
                            notify(&on_recv, &notify_lock, None);
                            break;
                        }
                    }
                }
                shell_active.store(false, Ordering::SeqCst);
            })
            .map_err(|e| ClientError::Channel(format!("failed to spawn receive worker: {e}")))?;
        self.register_worker(handle);
        Ok(())
    }

    fn spawn_pipe_reader(&self, mut stdout: ChildStdout) -> Result<()> {
        let screen = self.screen.clone();
        let shell_active = self.shell_active.clone();
        let stopping = self.stopping.clone();
        let on_recv = self.on_recv.clone();
        let notify_lock = self.notify_lock.clone();

        let handle = thread::Builder::new()
            .name("shell-recv".to_string())
            .spawn(move || {
                let mut buf = [0u8; RECV_BUF];
                // Blocking reads; terminating the helper unblocks them.
                while shell_active.load(Ordering::SeqCst) && !stopping.load(Ordering::SeqCst) {
                    match stdout.read(&mut buf) {
                        Ok(0) => {
                            shell_active.store(false, Ordering::SeqCst);
                            notify(&on_recv, &notify_lock, None);
                            break;
                        }
                        Ok(n) => {
                            feed_screen(&screen, &buf[..n]);
                            notify(&on_recv, &notify_lock, Some(&buf[..n]));
                        }
                        Err(e) => {
                            if shell_active.load(Ordering::SeqCst) {
                                warn!("Proxy command read error: {e}");
                            }
                            shell_active.store(false, Ordering::SeqCst);
                            notify(&on_recv, &notify_lock, None);
                            break;
                        }
                    }
                }
                shell_active.store(false, Ordering::SeqCst);
            })
            .map_err(|e| ClientError::Channel(format!("failed to spawn receive worker: {e}")))?;
        self.register_worker(handle);
        Ok(())
    }

    /// Send keystrokes to the shell. An OS-level write failure means the
    /// remote is gone: `shell_active` is cleared and the error returned.
    pub fn send(&self, text: &str) -> Result<()> {
        if let Some(writer) = &self.pipe_writer {
            let mut writer = writer.lock().unwrap_or_else(|e| e.into_inner());
            return writer
                .write_all(text.as_bytes())
                .and_then(|()| writer.flush())
                .map_err(|e| {
                    self.shell_active.store(false, Ordering::SeqCst);
                    ClientError::Network(e)
                });
        }

        let shell = self.shell.as_ref().ok_or(ClientError::NoShell)?;
        self.ssh_for("send")?;
        // The session stays non-blocking: a blocking-mode flip here would
        // stall every other channel sharing it. Write with retries instead.
        let mut channel = shell
            .lock()
            .map_err(|_| ClientError::Channel("shell channel poisoned".into()))?;
        let outcome = crate::forward::write_all_retry(&mut *channel, text.as_bytes(), &self.stopping);
        drop(channel);
        outcome.map_err(|e| {
            self.shell_active.store(false, Ordering::SeqCst);
            ClientError::Network(e)
        })
    }

    /// One manual receive tick: read up to the buffer size, feed the
    /// screen, fire `on_recv`. The receive worker does this continuously;
    /// this entry point exists for embedders driving the pump themselves.
    pub fn receive(&self) -> Result<()> {
        let shell = self.shell.as_ref().ok_or(ClientError::NoShell)?;
        self.ssh_for("manual receive")?;
        let mut buf = [0u8; RECV_BUF];
        let outcome = {
            let mut channel = shell
                .lock()
                .map_err(|_| ClientError::Channel("shell channel poisoned".into()))?;
            channel.read(&mut buf)
        };
        match outcome {
            Ok(0) => {
                self.shell_active.store(false, Ordering::SeqCst);
                notify(&self.on_recv, &self.notify_lock, None);
                Ok(())
            }
            Ok(n) => {
                feed_screen(&self.screen, &buf[..n]);
                notify(&self.on_recv, &self.notify_lock, Some(&buf[..n]));
                Ok(())
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => {
                self.shell_active.store(false, Ordering::SeqCst);
                Err(ClientError::Network(e))
            }
        }
    }

    /// Resize the screen, then the remote pty, then request a repaint.
    pub fn resize_terminal(&self, cols: u16, rows: u16) -> Result<()> {
        {
            let mut screen = self.screen.lock().unwrap_or_else(|e| e.into_inner());
            screen.as_mut().ok_or(ClientError::NoShell)?.resize(rows, cols);
        }
        if let Some(shell) = &self.shell {
            self.ssh_for("resize")?;
            let mut channel = shell
                .lock()
                .map_err(|_| ClientError::Channel("shell channel poisoned".into()))?;
            retry_ssh(Instant::now() + Duration::from_secs(5), || {
                channel.request_pty_size(cols as u32, rows as u32, None, None)
            })
            .map_err(|e| ClientError::Channel(format!("pty resize failed: {e}")))?;
        }
        notify(&self.on_recv, &self.notify_lock, None);
        Ok(())
    }

    /// Page the visible window back into history and request a repaint.
    pub fn scroll_up(&self) -> Result<()> {
        {
            let mut screen = self.screen.lock().unwrap_or_else(|e| e.into_inner());
            screen.as_mut().ok_or(ClientError::NoShell)?.prev_page();
        }
        notify(&self.on_recv, &self.notify_lock, None);
        Ok(())
    }

    /// Page the visible window toward the present and request a repaint.
    pub fn scroll_down(&self) -> Result<()> {
        {
            let mut screen = self.screen.lock().unwrap_or_else(|e| e.into_inner());
            screen.as_mut().ok_or(ClientError::NoShell)?.next_page();
        }
        notify(&self.on_recv, &self.notify_lock, None);
        Ok(())
    }

    // --- Screen snapshots ---

    pub fn display_screen(&self) -> Result<Vec<String>> {
        let screen = self.screen.lock().unwrap_or_else(|e| e.into_inner());
        Ok(screen.as_ref().ok_or(ClientError::NoShell)?.display())
    }

    pub fn display_screen_as_text(&self) -> Result<String> {
        Ok(self.display_screen()?.join("\n"))
    }

    /// Dirty rows since the last call; fetching clears the dirty set.
    pub fn changes(&self) -> Result<BTreeMap<u16, BTreeMap<u16, Cell>>> {
        let mut screen = self.screen.lock().unwrap_or_else(|e| e.into_inner());
        Ok(screen.as_mut().ok_or(ClientError::NoShell)?.changes())
    }

    /// Cursor as `(row, col)`.
    pub fn cursor(&self) -> Result<(u16, u16)> {
        let screen = self.screen.lock().unwrap_or_else(|e| e.into_inner());
        Ok(screen.as_ref().ok_or(ClientError::NoShell)?.cursor())
    }

    // --- One-shot execution ---

    /// Run a command on a fresh channel and return combined stdout+stderr.
    pub fn exec_command(&self, command: &str) -> Result<String> {
        let session = self.ssh_for("exec")?;
        run_command(session, &self.config.environment, command, DEFAULT_EXEC_TIMEOUT)
    }

    /// Lazy sequence of command results, one per repetition, sleeping
    /// `delay` between repetitions.
    pub fn command_result(
        &self,
        command: &str,
        repeat: u32,
        delay: Duration,
        timeout: Duration,
    ) -> Result<CommandResults> {
        let session = self.ssh_for("exec")?.clone();
        Ok(CommandResults {
            session,
            environment: self.config.environment.clone(),
            command: command.to_string(),
            remaining: repeat,
            delay,
            timeout,
            started: false,
        })
    }

    /// Open SFTP on this session's transport.
    ///
    /// With an active shell the session is non-blocking and SFTP calls
    /// contend with shell traffic; prefer `Client::parallel_sftp` there.
    pub fn open_sftp(&self) -> Result<ssh2::Sftp> {
        self.open_sftp_with_mode(!self.shell_active())
    }

    /// `allow_blocking` may only be true when no worker shares the session:
    /// blocking mode is session-wide and would stall their reads.
    pub(crate) fn open_sftp_with_mode(&self, allow_blocking: bool) -> Result<ssh2::Sftp> {
        let session = self.ssh_for("sftp")?;
        if allow_blocking {
            session.set_blocking(true);
            session.sftp().map_err(classify_ssh_error)
        } else {
            retry_ssh(Instant::now() + Duration::from_secs(10), || session.sftp())
        }
    }

    // --- Keepalive ---

    /// Drive libssh2's keepalive from a registered worker; the library
    /// rate-limits to the configured interval.
    pub(crate) fn spawn_keepalive(&self) -> Result<()> {
        let session = self.ssh_for("keepalive")?.clone();
        let stopping = self.stopping.clone();
        let handle = thread::Builder::new()
            .name("keepalive".to_string())
            .spawn(move || {
                while !stopping.load(Ordering::Relaxed) {
                    let _ = session.keepalive_send();
                    for _ in 0..4 {
                        if stopping.load(Ordering::Relaxed) {
                            return;
                        }
                        thread::sleep(Duration::from_millis(250));
                    }
                }
            })
            .map_err(|e| ClientError::Channel(format!("failed to spawn keepalive: {e}")))?;
        self.register_worker(handle);
        Ok(())
    }

    // --- Lifecycle ---

    /// Flip the stop flags without touching channels yet; forwarders are
    /// shut down between this and `close`.
    pub(crate) fn signal_close(&mut self) {
        if self.state != SessionState::Closed {
            self.state = SessionState::Closing;
        }
        self.stopping.store(true, Ordering::SeqCst);
        self.shell_active.store(false, Ordering::SeqCst);
    }

    /// Close the shell channel and the transport. Idempotent.
    pub(crate) fn close(&mut self) {
        self.signal_close();
        if let Some(mut x11) = self.x11.take() {
            x11.shutdown();
        }
        if let Some(shell) = self.shell.take() {
            if let Ok(mut channel) = shell.lock() {
                let _ = channel.send_eof();
                let _ = channel.close();
            }
        }
        self.pipe_writer = None;
        match &self.transport {
            SessionTransport::Ssh { session } => {
                let _ = session.disconnect(
                    Some(ssh2::DisconnectCode::ByApplication),
                    "session closed",
                    None,
                );
            }
            SessionTransport::Pipe { pipe } => {
                pipe.lock().unwrap_or_else(|e| e.into_inner()).terminate();
            }
        }
        debug!("Session closed");
    }

    /// Join every registered worker. Safe to call after `close`, and more
    /// than once.
    pub(crate) fn wait_closed(&mut self) {
        let drained: Vec<_> = {
            let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            workers.drain(..).collect()
        };
        for handle in drained {
            let _ = handle.join();
        }
        self.state = SessionState::Closed;
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .field("proxy_command", &self.is_proxy_command())
            .finish()
    }
}

fn feed_screen(screen: &Mutex<Option<TerminalScreen>>, bytes: &[u8]) {
    let mut screen = screen.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(screen) = screen.as_mut() {
        screen.feed(bytes);
    }
}

/// Invoke the embedder callback under the serialization lock.
fn notify(on_recv: &Option<Arc<OnRecv>>, lock: &Mutex<()>, data: Option<&[u8]>) {
    if let Some(callback) = on_recv {
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        callback(data);
    }
}

/// Retry an ssh2 operation on EAGAIN until the deadline.
pub(crate) fn retry_ssh<T>(
    deadline: Instant,
    mut op: impl FnMut() -> std::result::Result<T, ssh2::Error>,
) -> Result<T> {
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if ssh_would_block(&e) => {
                if Instant::now() >= deadline {
                    return Err(ClientError::Channel(format!("operation timed out: {e}")));
                }
                thread::sleep(Duration::from_millis(5));
            }
            Err(e) => return Err(classify_ssh_error(e)),
        }
    }
}

/// Exec on a fresh channel, draining stdout and stderr in arrival order
/// until both report EOF or the deadline passes.
fn run_command(
    session: &ssh2::Session,
    environment: &HashMap<String, String>,
    command: &str,
    timeout: Duration,
) -> Result<String> {
    let deadline = Instant::now() + timeout;
    let mut channel = retry_ssh(deadline, || session.channel_session())?;
    for (key, value) in environment {
        let _ = retry_ssh(deadline, || channel.setenv(key, value));
    }
    retry_ssh(deadline, || channel.exec(command))?;

    let mut merged = Vec::new();
    let mut buf = [0u8; RECV_BUF];
    let mut stdout_done = false;
    let mut stderr_done = false;
    while !(stdout_done && stderr_done) {
        if Instant::now() >= deadline {
            let _ = channel.close();
            return Err(ClientError::Channel(format!(
                "command timed out after {timeout:?}: {command}"
            )));
        }
        let mut progressed = false;
        if !stdout_done {
            match channel.read(&mut buf) {
                Ok(0) => stdout_done = true,
                Ok(n) => {
                    merged.extend_from_slice(&buf[..n]);
                    progressed = true;
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(ClientError::Network(e)),
            }
        }
        if !stderr_done {
            match channel.stderr().read(&mut buf) {
                Ok(0) => stderr_done = true,
                Ok(n) => {
                    merged.extend_from_slice(&buf[..n]);
                    progressed = true;
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(ClientError::Network(e)),
            }
        }
        if !progressed {
            thread::sleep(Duration::from_millis(10));
        }
    }
    let _ = channel.close();
    Ok(String::from_utf8_lossy(&merged).into_owned())
}

/// Lazy, finite sequence of repeated command executions.
pub struct CommandResults {
    session: Arc<ssh2::Session>,
    environment: HashMap<String, String>,
    command: String,
    remaining: u32,
    delay: Duration,
    timeout: Duration,
    started: bool,
}

impl Iterator for CommandResults {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        if self.started {
            thread::sleep(self.delay);
        }
        self.started = true;
        self.remaining -= 1;
        Some(run_command(
            &self.session,
            &self.environment,
            &self.command,
            self.timeout,
        ))
    }
}

impl std::fmt::Debug for CommandResults {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandResults")
            .field("command", &self.command)
            .field("remaining", &self.remaining)
            .finish()
    }
}
