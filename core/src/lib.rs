//! Interactive SSH client library.
//!
//! A [`Client`] connects to a remote host — directly, through a SOCKS/HTTP
//! proxy, over a chain of jump hosts, or via an external proxy command —
//! authenticates, and drives an interactive shell whose output is rendered
//! into an in-memory [`TerminalScreen`]. Side streams multiplex over the
//! same transport: local TCP forwards, local SOCKS5 listeners, and X11
//! forwarding back to the local display.

pub mod auth;
pub mod client;
pub mod config;
pub mod errors;
pub mod forward;
pub mod screen;
pub mod session;
pub mod transport;

pub use auth::{AskPassword, InteractiveHandler, Prompt};
pub use client::{Client, ConnectOptions};
pub use config::{
    ClientConfig, JumpAuth, JumpHost, KnownHostsPolicy, ProxyConfig, ProxyType, PtySize,
    SocksListener, TunnelConfig,
};
pub use errors::{ClientError, Result};
pub use forward::{PortForwarder, SocksProxy, TunnelStats, X11Forwarder};
pub use screen::{Cell, Color, TerminalScreen};
pub use session::{CommandResults, OnRecv, Session, SessionState, ShellOptions};
