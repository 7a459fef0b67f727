//! The client entry point.
//!
//! `Client` builds the transport (direct, proxied, jump-chained, or an
//! external proxy command), authenticates, and owns the resulting
//! `Session`, the configured forwarders and SOCKS listeners, and the
//! sub-clients of a jump chain. `close()` is the universal cancellation
//! and is idempotent; `wait_closed()` joins every worker.

use std::collections::HashMap;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{error, info};

use crate::auth::{self, AskPassword, ConnectAuth, InteractiveHandler};
use crate::config::{ClientConfig, JumpAuth, SocksListener, TunnelConfig};
use crate::errors::{classify_ssh_error, ClientError, Result};
use crate::forward::{self, PortForwarder, SocksProxy};
use crate::session::{CommandResults, Session, SessionState, ShellOptions};
use crate::transport::{self, proxy_command::CommandPipe};

/// How long a jump bridge waits for its loopback peer and channel.
const BRIDGE_TIMEOUT: Duration = Duration::from_secs(10);

/// Connect-time arguments: secrets, callbacks, and an optional
/// pre-established socket.
#[derive(Default)]
pub struct ConnectOptions {
    pub password: Option<String>,
    pub passphrase: Option<String>,
    /// Use this socket instead of dialing one.
    pub sock: Option<TcpStream>,
    /// Per-hop secrets for the jump chain, keyed by hop host name.
    pub jump_passwords: HashMap<String, JumpAuth>,
    /// Keyboard-interactive handler.
    pub interactive_handler: Option<Arc<InteractiveHandler>>,
    /// Called when the server wants a password that was not supplied.
    pub ask_password: Option<Arc<AskPassword>>,
}

impl std::fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("password", &self.password.as_ref().map(|_| "<set>"))
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<set>"))
            .field("sock", &self.sock.is_some())
            .field("jump_passwords", &self.jump_passwords.keys())
            .finish()
    }
}

#[derive(Default)]
struct StoredSecrets {
    password: Option<String>,
    passphrase: Option<String>,
    jump_passwords: HashMap<String, JumpAuth>,
}

/// An SSH client with terminal emulation, forwarding, and jump support.
pub struct Client {
    config: ClientConfig,
    session: Option<Session>,
    jump_clients: Vec<Client>,
    forwarders: Vec<PortForwarder>,
    socks_proxies: Vec<SocksProxy>,
    secrets: StoredSecrets,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            session: None,
            jump_clients: Vec::new(),
            forwarders: Vec::new(),
            socks_proxies: Vec::new(),
            secrets: StoredSecrets::default(),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// `"<host> (<user>)"`, or the display name when one is set.
    pub fn full_name(&self) -> String {
        let name = self
            .config
            .display_name
            .as_deref()
            .unwrap_or(&self.config.host);
        format!("{} ({})", name, self.config.username)
    }

    pub fn state(&self) -> SessionState {
        self.session
            .as_ref()
            .map(Session::state)
            .unwrap_or(SessionState::Idle)
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    pub fn session(&self) -> Result<&Session> {
        self.session.as_ref().ok_or(ClientError::NotConnected)
    }

    pub fn session_mut(&mut self) -> Result<&mut Session> {
        self.session.as_mut().ok_or(ClientError::NotConnected)
    }

    pub fn forwarders(&self) -> &[PortForwarder] {
        &self.forwarders
    }

    pub fn socks_proxies(&self) -> &[SocksProxy] {
        &self.socks_proxies
    }

    pub fn jump_clients(&self) -> &[Client] {
        &self.jump_clients
    }

    // --- Connect ---

    /// Build the transport, verify the host key, authenticate, install the
    /// keepalive, and bring up the configured forwards and SOCKS listeners.
    pub fn connect(&mut self, options: ConnectOptions) -> Result<()> {
        if self.session.is_some() {
            return Err(ClientError::Config("already connected".into()));
        }
        let config = self.config.clone().expand();
        config.validate()?;

        let ConnectOptions {
            password,
            passphrase,
            sock,
            jump_passwords,
            interactive_handler,
            ask_password,
        } = options;

        // Policy 1: an external helper owns the transport; no handshake,
        // no auth, no channels.
        if let Some(command) = &config.proxy_command {
            if !config.forwards.is_empty() || !config.socks_listeners.is_empty() {
                return Err(ClientError::UnsupportedInMode("port forwarding"));
            }
            let command = crate::config::expand::substitute_command_placeholders(
                command,
                &config.host,
                config.port,
                &config.username,
                "",
            );
            let pipe = CommandPipe::spawn(&command)?;
            self.session = Some(Session::new_pipe(pipe, config.clone()));
            self.config = config;
            return Ok(());
        }

        info!(host = %config.host, port = config.port, user = %config.username, "Connecting");

        // Policies 2-4: a TCP byte pipe, however it is obtained.
        let stream = if let Some(sock) = sock {
            sock
        } else if let Some(proxy) = &config.proxy {
            transport::proxy::connect_via_proxy(
                proxy,
                &config.host,
                config.port,
                config.connect_timeout,
            )?
        } else if !config.jump_hosts.is_empty() {
            self.connect_jump_chain(
                &config,
                &jump_passwords,
                interactive_handler.clone(),
                ask_password.clone(),
            )?
        } else {
            transport::direct_connect(&config.host, config.port, config.connect_timeout)?
        };

        let mut ssh = ssh2::Session::new()
            .map_err(|e| ClientError::Channel(format!("session init failed: {e}")))?;
        auth::apply_disabled_algorithms(&ssh, &config.disabled_algorithms)?;
        if let Some(timeout) = config.banner_timeout.or(config.connect_timeout) {
            ssh.set_timeout(timeout.as_millis() as u32);
        }
        ssh.set_tcp_stream(stream);
        ssh.handshake().map_err(classify_ssh_error)?;

        auth::verify_host_key(&ssh, &config)?;

        if let Some(timeout) = config.auth_timeout {
            ssh.set_timeout(timeout.as_millis() as u32);
        }
        let connect_auth = ConnectAuth {
            password: password.as_deref(),
            passphrase: passphrase.as_deref(),
            interactive: interactive_handler.as_deref(),
            ask_password: ask_password.as_deref(),
        };
        auth::authenticate(&ssh, &config, &connect_auth)?;
        ssh.set_timeout(0);

        if let Some(interval) = config.keepalive_interval {
            ssh.set_keepalive(true, interval);
        }
        ssh.set_blocking(false);
        let ssh = Arc::new(ssh);

        let session = Session::new_ssh(ssh.clone(), config.clone());
        if config.keepalive_interval.is_some() {
            session.spawn_keepalive()?;
        }
        self.secrets = StoredSecrets {
            password,
            passphrase,
            jump_passwords,
        };
        self.session = Some(session);

        for tunnel in &config.forwards {
            self.forwarders
                .push(PortForwarder::start(ssh.clone(), tunnel)?);
        }
        for listener in &config.socks_listeners {
            self.socks_proxies
                .push(SocksProxy::start(ssh.clone(), listener)?);
        }
        self.config = config;
        Ok(())
    }

    /// Connect the jump chain recursively and return a stream to the final
    /// target tunneled through the last hop.
    fn connect_jump_chain(
        &mut self,
        config: &ClientConfig,
        jump_passwords: &HashMap<String, JumpAuth>,
        interactive_handler: Option<Arc<InteractiveHandler>>,
        ask_password: Option<Arc<AskPassword>>,
    ) -> Result<TcpStream> {
        let mut chain = config.jump_hosts.clone();
        let last = chain
            .pop()
            .ok_or_else(|| ClientError::Config("empty jump chain".into()))?;

        let hop_config = ClientConfig {
            host: last.host.clone(),
            port: last.port,
            username: last
                .username
                .clone()
                .unwrap_or_else(|| config.username.clone()),
            key_file: last.key_file.clone(),
            jump_hosts: chain,
            allow_agent: config.allow_agent,
            look_for_keys: config.look_for_keys,
            connect_timeout: config.connect_timeout,
            banner_timeout: config.banner_timeout,
            auth_timeout: config.auth_timeout,
            known_hosts_policy: config.known_hosts_policy,
            host_keys_file: config.host_keys_file.clone(),
            x11: false,
            ..ClientConfig::default()
        };

        info!(hop = %last.host, "Connecting via jump host");
        let mut hop = Client::new(hop_config);
        let hop_auth = jump_passwords.get(&last.host).cloned().unwrap_or_default();
        // A hop's auth failure surfaces unmodified.
        hop.connect(ConnectOptions {
            password: hop_auth.password,
            passphrase: hop_auth.passphrase,
            sock: None,
            jump_passwords: jump_passwords.clone(),
            interactive_handler,
            ask_password,
        })?;

        let stream = hop.open_tunnel_stream(&config.host, config.port)?;
        self.jump_clients.push(hop);
        Ok(stream)
    }

    /// Open a `direct-tcpip` channel to `(host, port)` and expose it as a
    /// local TCP stream via a loopback splice worker.
    pub(crate) fn open_tunnel_stream(&self, host: &str, port: u16) -> Result<TcpStream> {
        let session = self.session()?;
        let ssh = session.ssh_for("jump tunnel")?.clone();
        let stop = session.stop_flag();

        let listener = TcpListener::bind(("127.0.0.1", 0))?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        let host = host.to_string();

        let bridge = thread::Builder::new()
            .name("jump-bridge".to_string())
            .spawn(move || {
                let deadline = Instant::now() + BRIDGE_TIMEOUT;
                let stream = loop {
                    if stop.load(Ordering::Relaxed) || Instant::now() >= deadline {
                        return;
                    }
                    match listener.accept() {
                        Ok((stream, _)) => break stream,
                        Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            thread::sleep(Duration::from_millis(10));
                        }
                        Err(_) => return,
                    }
                };
                let channel = match forward::open_direct_tcpip(
                    &ssh,
                    &host,
                    port,
                    None,
                    Instant::now() + BRIDGE_TIMEOUT,
                ) {
                    Ok(channel) => channel,
                    Err(e) => {
                        error!("Jump tunnel to {host}:{port} failed: {e}");
                        return;
                    }
                };
                let stats = forward::ForwarderStats::new();
                forward::splice(stream, channel, &stop, &stats);
            })
            .map_err(|e| ClientError::Channel(format!("failed to spawn jump bridge: {e}")))?;
        session.register_worker(bridge);

        Ok(TcpStream::connect(addr)?)
    }

    // --- Shell & screen delegation ---

    pub fn invoke_shell(&mut self, options: ShellOptions) -> Result<()> {
        self.session_mut()?.invoke_shell(options)
    }

    pub fn send(&self, text: &str) -> Result<()> {
        self.session()?.send(text)
    }

    pub fn shell_active(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| session.shell_active())
    }

    pub fn display_screen(&self) -> Result<Vec<String>> {
        self.session()?.display_screen()
    }

    pub fn display_screen_as_text(&self) -> Result<String> {
        self.session()?.display_screen_as_text()
    }

    pub fn changes(
        &self,
    ) -> Result<std::collections::BTreeMap<u16, std::collections::BTreeMap<u16, crate::screen::Cell>>>
    {
        self.session()?.changes()
    }

    pub fn cursor(&self) -> Result<(u16, u16)> {
        self.session()?.cursor()
    }

    pub fn resize_terminal(&self, cols: u16, rows: u16) -> Result<()> {
        self.session()?.resize_terminal(cols, rows)
    }

    pub fn scroll_up(&self) -> Result<()> {
        self.session()?.scroll_up()
    }

    pub fn scroll_down(&self) -> Result<()> {
        self.session()?.scroll_down()
    }

    pub fn exec_command(&self, command: &str) -> Result<String> {
        self.session()?.exec_command(command)
    }

    pub fn command_result(
        &self,
        command: &str,
        repeat: u32,
        delay: Duration,
        timeout: Duration,
    ) -> Result<CommandResults> {
        self.session()?.command_result(command, repeat, delay, timeout)
    }

    pub fn open_sftp(&self) -> Result<ssh2::Sftp> {
        let session = self.session()?;
        let idle = !session.shell_active()
            && self.forwarders.is_empty()
            && self.socks_proxies.is_empty();
        session.open_sftp_with_mode(idle)
    }

    // --- Forwarding ---

    /// Start a local forward on a connected session.
    pub fn add_forward(&mut self, tunnel: TunnelConfig) -> Result<&PortForwarder> {
        let session = self.session()?;
        let ssh = session.ssh_for("port forwarding")?.clone();
        let forwarder = PortForwarder::start(ssh, &tunnel)?;
        self.forwarders.push(forwarder);
        let index = self.forwarders.len() - 1;
        Ok(&self.forwarders[index])
    }

    /// Start a local SOCKS5 listener tunneling through this session.
    pub fn open_socks_listener(&mut self, bind: &str, port: u16) -> Result<&SocksProxy> {
        let session = self.session()?;
        let ssh = session.ssh_for("SOCKS listener")?.clone();
        let proxy = SocksProxy::start(
            ssh,
            &SocksListener {
                bind: bind.to_string(),
                port,
            },
        )?;
        self.socks_proxies.push(proxy);
        let index = self.socks_proxies.len() - 1;
        Ok(&self.socks_proxies[index])
    }

    /// Wait until every forwarder and SOCKS listener is serving.
    pub fn wait_started(&self, timeout: Duration) -> Result<()> {
        for forwarder in &self.forwarders {
            forwarder.wait_started(timeout)?;
        }
        for proxy in &self.socks_proxies {
            proxy.wait_started(timeout)?;
        }
        Ok(())
    }

    // --- Siblings ---

    /// A sibling client with the same target and credentials, connected
    /// fresh. Requires connected state.
    pub fn duplicate(&self) -> Result<Client> {
        if self.session()?.is_proxy_command() {
            return Err(ClientError::UnsupportedInMode("duplicate"));
        }
        let mut config = self.config.clone();
        config.forwards.clear();
        config.socks_listeners.clear();
        config.x11 = false;
        let mut sibling = Client::new(config);
        sibling.connect(ConnectOptions {
            password: self.secrets.password.clone(),
            passphrase: self.secrets.passphrase.clone(),
            jump_passwords: self.secrets.jump_passwords.clone(),
            ..ConnectOptions::default()
        })?;
        Ok(sibling)
    }

    /// A sibling connection with SFTP opened on it, so transfers never
    /// contend with this session's shell.
    pub fn parallel_sftp(&self) -> Result<(Client, ssh2::Sftp)> {
        let sibling = self.duplicate()?;
        let sftp = sibling.session()?.open_sftp()?;
        Ok((sibling, sftp))
    }

    // --- Shutdown ---

    /// Ordered shutdown: stop the shell, the forwarders, the session, then
    /// the jump chain in reverse. Idempotent.
    pub fn close(&mut self) {
        if let Some(session) = &mut self.session {
            session.signal_close();
        }
        for forwarder in &mut self.forwarders {
            forwarder.shutdown();
        }
        for proxy in &mut self.socks_proxies {
            proxy.shutdown();
        }
        if let Some(session) = &mut self.session {
            session.close();
        }
        for hop in self.jump_clients.iter_mut().rev() {
            hop.close();
        }
    }

    /// Join every worker this client and its jump chain spawned. Safe to
    /// call after `close()`, and repeatedly.
    pub fn wait_closed(&mut self) {
        self.close();
        if let Some(session) = &mut self.session {
            session.wait_closed();
        }
        for hop in self.jump_clients.iter_mut().rev() {
            hop.wait_closed();
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("host", &self.config.host)
            .field("state", &self.state())
            .field("jump_clients", &self.jump_clients.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_is_idle_before_connect() {
        let client = Client::new(ClientConfig::new("example.com", "admin"));
        assert_eq!(client.state(), SessionState::Idle);
        assert!(!client.is_connected());
        assert!(!client.shell_active());
    }

    #[test]
    fn invoke_shell_before_connect_is_not_connected() {
        let mut client = Client::new(ClientConfig::new("example.com", "admin"));
        let err = client.invoke_shell(ShellOptions::default()).unwrap_err();
        assert!(matches!(err, ClientError::NotConnected));
    }

    #[test]
    fn send_before_connect_is_not_connected() {
        let client = Client::new(ClientConfig::new("example.com", "admin"));
        assert!(matches!(
            client.send("ls\n").unwrap_err(),
            ClientError::NotConnected
        ));
    }

    #[test]
    fn forwarding_before_connect_is_not_connected() {
        let mut client = Client::new(ClientConfig::new("example.com", "admin"));
        let err = client
            .add_forward(TunnelConfig {
                src: ("127.0.0.1".into(), 8888),
                dst: ("next-hop".into(), 22),
            })
            .unwrap_err();
        assert!(matches!(err, ClientError::NotConnected));
        let err = client.open_socks_listener("127.0.0.1", 8889).unwrap_err();
        assert!(matches!(err, ClientError::NotConnected));
    }

    #[test]
    fn duplicate_before_connect_is_not_connected() {
        let client = Client::new(ClientConfig::new("example.com", "admin"));
        assert!(matches!(
            client.duplicate().unwrap_err(),
            ClientError::NotConnected
        ));
    }

    #[test]
    fn full_name_prefers_display_name() {
        let client = Client::new(ClientConfig::new("example.com", "admin"));
        assert_eq!(client.full_name(), "example.com (admin)");

        let client = Client::new(ClientConfig {
            display_name: Some("build box".into()),
            ..ClientConfig::new("example.com", "admin")
        });
        assert_eq!(client.full_name(), "build box (admin)");
    }

    #[test]
    fn close_and_wait_closed_are_safe_when_never_connected() {
        let mut client = Client::new(ClientConfig::new("example.com", "admin"));
        client.close();
        client.wait_closed();
        client.close();
    }

    #[test]
    fn empty_host_fails_validation_at_connect() {
        let mut client = Client::new(ClientConfig::new("", "admin"));
        assert!(matches!(
            client.connect(ConnectOptions::default()).unwrap_err(),
            ClientError::Config(_)
        ));
    }

    #[cfg(unix)]
    mod proxy_command_mode {
        use super::*;

        fn pipe_client() -> Client {
            let mut client = Client::new(ClientConfig {
                proxy_command: Some("cat".into()),
                ..ClientConfig::default()
            });
            client.connect(ConnectOptions::default()).unwrap();
            client
        }

        #[test]
        fn connect_spawns_the_helper_without_auth() {
            let client = pipe_client();
            assert_eq!(client.state(), SessionState::Authenticated);
            assert!(client.session().unwrap().is_proxy_command());
        }

        #[test]
        fn channel_operations_fail_with_unsupported_in_mode() {
            let client = pipe_client();
            assert!(matches!(
                client.exec_command("ls").unwrap_err(),
                ClientError::UnsupportedInMode("exec")
            ));
            assert!(matches!(
                client.open_sftp().err().unwrap(),
                ClientError::UnsupportedInMode("sftp")
            ));
            assert!(matches!(
                client
                    .command_result("ls", 2, Duration::from_secs(1), Duration::from_secs(1))
                    .unwrap_err(),
                ClientError::UnsupportedInMode("exec")
            ));
        }

        #[test]
        fn forwarding_fails_with_unsupported_in_mode() {
            let mut client = pipe_client();
            assert!(matches!(
                client
                    .add_forward(TunnelConfig {
                        src: ("127.0.0.1".into(), 0),
                        dst: ("next-hop".into(), 22),
                    })
                    .unwrap_err(),
                ClientError::UnsupportedInMode(_)
            ));
            assert!(matches!(
                client.open_socks_listener("127.0.0.1", 0).unwrap_err(),
                ClientError::UnsupportedInMode(_)
            ));
        }

        #[test]
        fn configured_forwards_are_rejected_at_connect() {
            let mut client = Client::new(ClientConfig {
                proxy_command: Some("cat".into()),
                forwards: vec![TunnelConfig {
                    src: ("127.0.0.1".into(), 0),
                    dst: ("next-hop".into(), 22),
                }],
                ..ClientConfig::default()
            });
            assert!(matches!(
                client.connect(ConnectOptions::default()).unwrap_err(),
                ClientError::UnsupportedInMode(_)
            ));
        }

        #[test]
        fn second_connect_is_rejected() {
            let mut client = pipe_client();
            assert!(matches!(
                client.connect(ConnectOptions::default()).unwrap_err(),
                ClientError::Config(_)
            ));
        }

        #[test]
        fn shell_round_trip_and_clean_shutdown() {
            let mut client = pipe_client();
            client.invoke_shell(ShellOptions::default()).unwrap();
            assert!(client.shell_active());

            client.send("hello over the pipe").unwrap();
            std::thread::sleep(Duration::from_millis(200));
            let rows = client.display_screen().unwrap();
            assert!(rows[0].contains("hello over the pipe"), "got {rows:?}");

            client.close();
            client.wait_closed();
            assert_eq!(client.state(), SessionState::Closed);
            assert!(!client.shell_active());
        }
    }
}
