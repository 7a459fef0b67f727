pub mod expand;

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ClientError;

/// Terminal dimensions (columns x rows).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PtySize {
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
}

impl Default for PtySize {
    fn default() -> Self {
        Self {
            cols: default_cols(),
            rows: default_rows(),
        }
    }
}

/// What to do with a host key that is not in the known-hosts store.
///
/// A key that *mismatches* a stored fingerprint is always fatal, under every
/// policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KnownHostsPolicy {
    /// Abort the connection on any unknown key.
    Reject,
    /// Persist unknown keys to the host-keys store and continue.
    AutoAdd,
    /// Log unknown keys and continue without persisting.
    Warn,
}

impl Default for KnownHostsPolicy {
    fn default() -> Self {
        Self::AutoAdd
    }
}

impl FromStr for KnownHostsPolicy {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reject" => Ok(Self::Reject),
            "auto-add" | "auto" => Ok(Self::AutoAdd),
            "warn" => Ok(Self::Warn),
            other => Err(ClientError::Config(format!(
                "unknown known-hosts policy: {other}"
            ))),
        }
    }
}

/// Transport used to reach the SSH server through an intermediary proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyType {
    Socks4,
    Socks5,
    Http,
}

impl Default for ProxyType {
    fn default() -> Self {
        Self::Socks5
    }
}

impl FromStr for ProxyType {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "socks4" => Ok(Self::Socks4),
            "socks5" => Ok(Self::Socks5),
            "http" => Ok(Self::Http),
            other => Err(ClientError::Config(format!("unknown proxy type: {other}"))),
        }
    }
}

/// An intermediary proxy the TCP connection is dialed through.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    #[serde(default)]
    pub proxy_type: ProxyType,
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Let the proxy resolve the destination host name instead of resolving
    /// locally. SOCKS5 sends a domain address, SOCKS4 switches to 4a.
    #[serde(default = "default_true")]
    pub remote_dns: bool,
}

/// One hop of a jump-host chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JumpHost {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// Falls back to the target's username when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file: Option<PathBuf>,
}

/// Connect-time secrets for one jump hop, keyed by hop host name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JumpAuth {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
}

/// A local-to-remote port forward: listen on `src`, tunnel to `dst`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub src: (String, u16),
    pub dst: (String, u16),
}

/// A requested local SOCKS5 listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocksListener {
    #[serde(default = "default_localhost")]
    pub bind: String,
    pub port: u16,
}

/// Complete client configuration. Immutable once `connect()` starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    /// Shown by `full_name()` in place of the host when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file: Option<PathBuf>,
    #[serde(default)]
    pub allow_agent: bool,
    #[serde(default = "default_true")]
    pub look_for_keys: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub banner_timeout: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_timeout: Option<Duration>,
    /// Keepalive interval in seconds; no keepalives when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keepalive_interval: Option<u32>,

    /// Algorithms removed from negotiation, keyed by class: `kex`,
    /// `host-key`, `cipher`, `mac`, `compression`.
    #[serde(default)]
    pub disabled_algorithms: HashMap<String, Vec<String>>,

    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default = "default_term")]
    pub term: String,
    #[serde(default)]
    pub pty_size: PtySize,
    /// Scrollback depth of the terminal screen, in rows.
    #[serde(default = "default_history")]
    pub history: usize,

    #[serde(default)]
    pub known_hosts_policy: KnownHostsPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_keys_file: Option<PathBuf>,

    #[serde(default = "default_true")]
    pub x11: bool,
    #[serde(default)]
    pub x11_screen_number: u32,
    #[serde(default = "default_x11_auth_protocol")]
    pub x11_auth_protocol: String,
    #[serde(default)]
    pub x11_try_start_server: bool,

    #[serde(default)]
    pub jump_hosts: Vec<JumpHost>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyConfig>,

    #[serde(default)]
    pub socks_listeners: Vec<SocksListener>,
    #[serde(default)]
    pub forwards: Vec<TunnelConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_ssh_port(),
            username: String::new(),
            display_name: None,
            key_file: None,
            allow_agent: false,
            look_for_keys: true,
            connect_timeout: None,
            banner_timeout: None,
            auth_timeout: None,
            keepalive_interval: None,
            disabled_algorithms: HashMap::new(),
            environment: HashMap::new(),
            term: default_term(),
            pty_size: PtySize::default(),
            history: default_history(),
            known_hosts_policy: KnownHostsPolicy::default(),
            host_keys_file: None,
            x11: true,
            x11_screen_number: 0,
            x11_auth_protocol: default_x11_auth_protocol(),
            x11_try_start_server: false,
            jump_hosts: Vec::new(),
            proxy_command: None,
            proxy: None,
            socks_listeners: Vec::new(),
            forwards: Vec::new(),
        }
    }
}

impl ClientConfig {
    /// A config for `host` with every other option at its default.
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            username: username.into(),
            ..Self::default()
        }
    }

    /// Return a copy with all `${env:...}` placeholders and `~` expanded.
    pub fn expand(mut self) -> Self {
        self.host = expand::expand_env_placeholders(&self.host);
        self.username = expand::expand_env_placeholders(&self.username);
        self.key_file = self.key_file.map(|p| {
            let s = p.to_string_lossy();
            let stripped = s.trim().trim_matches('"').trim_matches('\'');
            PathBuf::from(expand::expand_tilde(&expand::expand_env_placeholders(
                stripped,
            )))
        });
        self.host_keys_file = self.host_keys_file.map(|p| {
            PathBuf::from(expand::expand_tilde(&expand::expand_env_placeholders(
                &p.to_string_lossy(),
            )))
        });
        self
    }

    /// Basic sanity checks before a connection attempt.
    pub fn validate(&self) -> crate::errors::Result<()> {
        if self.proxy_command.is_none() {
            if self.host.trim().is_empty() {
                return Err(ClientError::Config("host must not be empty".into()));
            }
            if self.username.trim().is_empty() {
                return Err(ClientError::Config("username must not be empty".into()));
            }
        }
        if self.proxy.is_some() && !self.jump_hosts.is_empty() {
            return Err(ClientError::Config(
                "proxy and jump hosts are mutually exclusive".into(),
            ));
        }
        Ok(())
    }
}

// --- Default value functions ---

fn default_cols() -> u16 {
    80
}

fn default_rows() -> u16 {
    24
}

fn default_ssh_port() -> u16 {
    22
}

fn default_term() -> String {
    "linux".to_string()
}

fn default_history() -> usize {
    100
}

fn default_x11_auth_protocol() -> String {
    "MIT-MAGIC-COOKIE-1".to_string()
}

fn default_localhost() -> String {
    "localhost".to_string()
}

fn default_true() -> bool {
    true
}
