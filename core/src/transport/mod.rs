//! Byte-pipe construction toward the target host, run before any SSH
//! handshake: direct TCP, through a SOCKS/HTTP proxy, or an external
//! proxy-command process. Jump-host chains are assembled by the client,
//! which owns the intermediate hops.

pub mod proxy;
pub mod proxy_command;

use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::errors::Result;

/// Plain TCP connect with an optional per-address timeout. Every resolved
/// address is tried; the last failure is returned when all fail.
pub(crate) fn direct_connect(
    host: &str,
    port: u16,
    timeout: Option<Duration>,
) -> Result<TcpStream> {
    let addrs: Vec<_> = (host, port).to_socket_addrs()?.collect();
    let mut last_err = std::io::Error::new(
        std::io::ErrorKind::AddrNotAvailable,
        format!("no addresses resolved for {host}:{port}"),
    );
    for addr in addrs {
        let attempt = match timeout {
            Some(t) => TcpStream::connect_timeout(&addr, t),
            None => TcpStream::connect(addr),
        };
        match attempt {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = e,
        }
    }
    Err(last_err.into())
}
