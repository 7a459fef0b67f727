//! Unified error types for the termBridge core crate.
//!
//! One enum covers every failure a `Client` or its workers can surface.
//! Per-tunnel and per-x11-channel failures are logged and contained by the
//! workers themselves; only session-fatal conditions travel through these
//! variants to the caller.

use std::time::Duration;

use thiserror::Error;

/// Top-level error type for client, session, and forwarding operations.
#[derive(Error, Debug)]
pub enum ClientError {
    /// The client configuration is invalid (bad policy name, unknown proxy
    /// type, malformed option values).
    #[error("Configuration error: {0}")]
    Config(String),

    /// The client is not connected. Call `connect()` first.
    #[error("Not connected. Call connect() first")]
    NotConnected,

    /// No shell has been opened. Call `invoke_shell()` first.
    #[error("No shell. Call invoke_shell() first")]
    NoShell,

    /// Every applicable authentication method was tried and failed.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// The server's host key was rejected by the known-hosts policy.
    #[error("Host key verification failed for {host}: {reason}")]
    BadHostKey { host: String, reason: String },

    /// A socket-level failure (connect, read, write, proxy handshake).
    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),

    /// The server rejected a channel request or the channel died.
    #[error("Channel error: {0}")]
    Channel(String),

    /// A forwarder's accept loop did not come up within the given bound.
    #[error("Could not start tunnel on {addr} within {timeout:?}")]
    TunnelNotStarted { addr: String, timeout: Duration },

    /// No local X server could be reached (or started).
    #[error("Unable to connect to local X11 server: {0}")]
    X11Connection(String),

    /// A configuration-class error: the operation has no meaning when the
    /// transport is an external proxy-command pipe.
    #[error("Operation not available in proxy-command mode: {0}")]
    UnsupportedInMode(&'static str),
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// libssh2 returns EAGAIN as a session error when in non-blocking mode.
pub(crate) fn ssh_would_block(err: &ssh2::Error) -> bool {
    err.code() == ssh2::ErrorCode::Session(-37)
}

/// Whether an ssh2 error means the underlying transport is gone, as opposed
/// to the server declining a request on a still-healthy transport.
pub(crate) fn ssh_transport_died(err: &ssh2::Error) -> bool {
    // LIBSSH2_ERROR_SOCKET_SEND, _SOCKET_DISCONNECT, _SOCKET_TIMEOUT,
    // _SOCKET_RECV
    matches!(
        err.code(),
        ssh2::ErrorCode::Session(-7)
            | ssh2::ErrorCode::Session(-13)
            | ssh2::ErrorCode::Session(-30)
            | ssh2::ErrorCode::Session(-43)
    )
}

/// Map an ssh2 error to the taxonomy: transport death becomes `Network`,
/// everything else a `Channel` error carrying the library message.
pub(crate) fn classify_ssh_error(err: ssh2::Error) -> ClientError {
    if ssh_transport_died(&err) {
        ClientError::Network(std::io::Error::new(
            std::io::ErrorKind::ConnectionAborted,
            err.to_string(),
        ))
    } else {
        ClientError::Channel(err.to_string())
    }
}
