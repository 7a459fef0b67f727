//! Client-side proxy handshakes: SOCKS4/4a, SOCKS5, and HTTP CONNECT.
//!
//! The handshakes run over any `Read + Write` stream so they can be tested
//! against scripted buffers; `connect_via_proxy` glues them to a real TCP
//! connection.

use std::io::{Read, Write};
use std::net::{IpAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tracing::debug;

use crate::config::{ProxyConfig, ProxyType};
use crate::errors::{ClientError, Result};

const SOCKS5_VERSION: u8 = 0x05;
const SOCKS5_NO_AUTH: u8 = 0x00;
const SOCKS5_USER_PASS: u8 = 0x02;
const SOCKS5_NO_ACCEPTABLE: u8 = 0xFF;
const SOCKS5_CMD_CONNECT: u8 = 0x01;
const SOCKS5_ATYP_IPV4: u8 = 0x01;
const SOCKS5_ATYP_DOMAIN: u8 = 0x03;
const SOCKS5_ATYP_IPV6: u8 = 0x04;
const SOCKS5_REP_SUCCESS: u8 = 0x00;

const SOCKS4_VERSION: u8 = 0x04;
const SOCKS4_CMD_CONNECT: u8 = 0x01;
const SOCKS4_REP_GRANTED: u8 = 0x5A;

/// Open a TCP connection to `dest_host:dest_port` through the configured
/// proxy and complete the proxy handshake on it.
pub(crate) fn connect_via_proxy(
    proxy: &ProxyConfig,
    dest_host: &str,
    dest_port: u16,
    timeout: Option<Duration>,
) -> Result<TcpStream> {
    let mut stream = super::direct_connect(&proxy.host, proxy.port, timeout)?;
    debug!(
        proxy = %proxy.host,
        port = proxy.port,
        kind = ?proxy.proxy_type,
        dest = %dest_host,
        "Negotiating proxy connection"
    );
    match proxy.proxy_type {
        ProxyType::Socks5 => socks5_connect(
            &mut stream,
            dest_host,
            dest_port,
            proxy.username.as_deref(),
            proxy.password.as_deref(),
            proxy.remote_dns,
        )?,
        ProxyType::Socks4 => socks4_connect(
            &mut stream,
            dest_host,
            dest_port,
            proxy.username.as_deref().unwrap_or(""),
            proxy.remote_dns,
        )?,
        ProxyType::Http => http_connect(
            &mut stream,
            dest_host,
            dest_port,
            proxy.username.as_deref(),
            proxy.password.as_deref(),
        )?,
    }
    Ok(stream)
}

fn proto_err(message: impl Into<String>) -> ClientError {
    ClientError::Network(std::io::Error::new(
        std::io::ErrorKind::ConnectionRefused,
        message.into(),
    ))
}

/// SOCKS5 method selection, optional username/password subnegotiation, and
/// CONNECT request.
pub(crate) fn socks5_connect(
    stream: &mut (impl Read + Write),
    dest_host: &str,
    dest_port: u16,
    username: Option<&str>,
    password: Option<&str>,
    remote_dns: bool,
) -> Result<()> {
    let have_creds = username.is_some() && password.is_some();
    let methods: &[u8] = if have_creds {
        &[SOCKS5_NO_AUTH, SOCKS5_USER_PASS]
    } else {
        &[SOCKS5_NO_AUTH]
    };
    let mut greeting = vec![SOCKS5_VERSION, methods.len() as u8];
    greeting.extend_from_slice(methods);
    stream.write_all(&greeting)?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice)?;
    if choice[0] != SOCKS5_VERSION {
        return Err(proto_err("proxy is not a SOCKS5 server"));
    }
    match choice[1] {
        SOCKS5_NO_AUTH => {}
        SOCKS5_USER_PASS if have_creds => {
            let user = username.unwrap_or("").as_bytes();
            let pass = password.unwrap_or("").as_bytes();
            let mut req = vec![0x01, user.len() as u8];
            req.extend_from_slice(user);
            req.push(pass.len() as u8);
            req.extend_from_slice(pass);
            stream.write_all(&req)?;
            let mut status = [0u8; 2];
            stream.read_exact(&mut status)?;
            if status[1] != 0x00 {
                return Err(proto_err("SOCKS5 proxy rejected the credentials"));
            }
        }
        SOCKS5_NO_ACCEPTABLE => {
            return Err(proto_err("SOCKS5 proxy accepted none of our auth methods"))
        }
        other => return Err(proto_err(format!("SOCKS5 proxy chose unknown method {other}"))),
    }

    let mut request = vec![SOCKS5_VERSION, SOCKS5_CMD_CONNECT, 0x00];
    request.extend_from_slice(&encode_socks5_addr(dest_host, dest_port, remote_dns)?);
    request.extend_from_slice(&dest_port.to_be_bytes());
    stream.write_all(&request)?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head)?;
    if head[1] != SOCKS5_REP_SUCCESS {
        return Err(proto_err(format!(
            "SOCKS5 CONNECT to {dest_host}:{dest_port} failed: {}",
            socks5_reply_message(head[1])
        )));
    }
    // Consume the bound address.
    let skip = match head[3] {
        SOCKS5_ATYP_IPV4 => 4,
        SOCKS5_ATYP_IPV6 => 16,
        SOCKS5_ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len)?;
            len[0] as usize
        }
        other => return Err(proto_err(format!("SOCKS5 reply with unknown atyp {other}"))),
    };
    let mut rest = vec![0u8; skip + 2];
    stream.read_exact(&mut rest)?;
    Ok(())
}

/// Encode the destination as a SOCKS5 address block (without the port).
pub(crate) fn encode_socks5_addr(host: &str, port: u16, remote_dns: bool) -> Result<Vec<u8>> {
    if let Ok(v4) = host.parse::<std::net::Ipv4Addr>() {
        let mut out = vec![SOCKS5_ATYP_IPV4];
        out.extend_from_slice(&v4.octets());
        return Ok(out);
    }
    if let Ok(v6) = host.parse::<std::net::Ipv6Addr>() {
        let mut out = vec![SOCKS5_ATYP_IPV6];
        out.extend_from_slice(&v6.octets());
        return Ok(out);
    }
    if remote_dns {
        let bytes = host.as_bytes();
        if bytes.len() > 255 {
            return Err(ClientError::Config(format!(
                "host name too long for SOCKS5 domain address: {host}"
            )));
        }
        let mut out = vec![SOCKS5_ATYP_DOMAIN, bytes.len() as u8];
        out.extend_from_slice(bytes);
        return Ok(out);
    }
    // Resolve locally and send the first address.
    let addr = (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| proto_err(format!("no addresses resolved for {host}")))?;
    match addr.ip() {
        IpAddr::V4(v4) => {
            let mut out = vec![SOCKS5_ATYP_IPV4];
            out.extend_from_slice(&v4.octets());
            Ok(out)
        }
        IpAddr::V6(v6) => {
            let mut out = vec![SOCKS5_ATYP_IPV6];
            out.extend_from_slice(&v6.octets());
            Ok(out)
        }
    }
}

pub(crate) fn socks5_reply_message(code: u8) -> &'static str {
    match code {
        0x01 => "general failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown failure",
    }
}

/// SOCKS4 CONNECT, switching to 4a (proxy-side resolution) when the
/// destination is a host name and remote DNS is requested.
pub(crate) fn socks4_connect(
    stream: &mut (impl Read + Write),
    dest_host: &str,
    dest_port: u16,
    userid: &str,
    remote_dns: bool,
) -> Result<()> {
    let mut request = vec![SOCKS4_VERSION, SOCKS4_CMD_CONNECT];
    request.extend_from_slice(&dest_port.to_be_bytes());

    let hostname_suffix = if let Ok(v4) = dest_host.parse::<std::net::Ipv4Addr>() {
        request.extend_from_slice(&v4.octets());
        None
    } else if remote_dns {
        // SOCKS4a: invalid destination 0.0.0.x plus the host name.
        request.extend_from_slice(&[0, 0, 0, 1]);
        Some(dest_host)
    } else {
        let v4 = (dest_host, dest_port)
            .to_socket_addrs()?
            .find_map(|addr| match addr.ip() {
                IpAddr::V4(v4) => Some(v4),
                IpAddr::V6(_) => None,
            })
            .ok_or_else(|| proto_err(format!("no IPv4 address resolved for {dest_host}")))?;
        request.extend_from_slice(&v4.octets());
        None
    };
    request.extend_from_slice(userid.as_bytes());
    request.push(0x00);
    if let Some(host) = hostname_suffix {
        request.extend_from_slice(host.as_bytes());
        request.push(0x00);
    }
    stream.write_all(&request)?;

    let mut reply = [0u8; 8];
    stream.read_exact(&mut reply)?;
    if reply[1] != SOCKS4_REP_GRANTED {
        return Err(proto_err(format!(
            "SOCKS4 CONNECT to {dest_host}:{dest_port} rejected (code {:#04x})",
            reply[1]
        )));
    }
    Ok(())
}

/// HTTP CONNECT with optional Basic proxy authorization.
pub(crate) fn http_connect(
    stream: &mut (impl Read + Write),
    dest_host: &str,
    dest_port: u16,
    username: Option<&str>,
    password: Option<&str>,
) -> Result<()> {
    let mut request = format!(
        "CONNECT {dest_host}:{dest_port} HTTP/1.1\r\nHost: {dest_host}:{dest_port}\r\n"
    );
    if let (Some(user), Some(pass)) = (username, password) {
        let token = STANDARD.encode(format!("{user}:{pass}"));
        request.push_str(&format!("Proxy-Authorization: Basic {token}\r\n"));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes())?;

    let header = read_http_response_head(stream)?;
    let status_line = header.lines().next().unwrap_or("");
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| proto_err(format!("malformed proxy response: {status_line}")))?;
    if status != 200 {
        return Err(proto_err(format!(
            "HTTP proxy refused CONNECT to {dest_host}:{dest_port}: {status_line}"
        )));
    }
    Ok(())
}

/// Read up to the blank line ending the response header.
fn read_http_response_head(stream: &mut impl Read) -> Result<String> {
    const MAX_HEADER: usize = 16 * 1024;
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_HEADER {
            return Err(proto_err("oversized proxy response header"));
        }
        stream.read_exact(&mut byte)?;
        head.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&head).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Read/Write double: reads come from the script, writes accumulate.
    struct ScriptedStream {
        input: Cursor<Vec<u8>>,
        written: Vec<u8>,
    }

    impl ScriptedStream {
        fn new(script: Vec<u8>) -> Self {
            Self {
                input: Cursor::new(script),
                written: Vec::new(),
            }
        }
    }

    impl Read for ScriptedStream {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for ScriptedStream {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn socks5_no_auth_connect_round_trip() {
        let mut script = vec![SOCKS5_VERSION, SOCKS5_NO_AUTH];
        // Reply: success, bound 0.0.0.0:0.
        script.extend_from_slice(&[SOCKS5_VERSION, 0x00, 0x00, SOCKS5_ATYP_IPV4, 0, 0, 0, 0, 0, 0]);
        let mut stream = ScriptedStream::new(script);

        socks5_connect(&mut stream, "10.0.0.9", 22, None, None, true).unwrap();

        // Greeting offered exactly no-auth.
        assert_eq!(&stream.written[..3], &[SOCKS5_VERSION, 1, SOCKS5_NO_AUTH]);
        // Request used the IPv4 atyp with the literal address.
        assert_eq!(
            &stream.written[3..],
            &[
                SOCKS5_VERSION,
                SOCKS5_CMD_CONNECT,
                0x00,
                SOCKS5_ATYP_IPV4,
                10,
                0,
                0,
                9,
                0,
                22
            ]
        );
    }

    #[test]
    fn socks5_domain_address_when_remote_dns() {
        let addr = encode_socks5_addr("db.internal", 5432, true).unwrap();
        assert_eq!(addr[0], SOCKS5_ATYP_DOMAIN);
        assert_eq!(addr[1] as usize, "db.internal".len());
        assert_eq!(&addr[2..], b"db.internal");
    }

    #[test]
    fn socks5_ipv6_literal_address() {
        let addr = encode_socks5_addr("::1", 22, false).unwrap();
        assert_eq!(addr[0], SOCKS5_ATYP_IPV6);
        assert_eq!(addr.len(), 17);
        assert_eq!(addr[16], 1);
    }

    #[test]
    fn socks5_failure_reply_carries_the_reason() {
        let mut script = vec![SOCKS5_VERSION, SOCKS5_NO_AUTH];
        script.extend_from_slice(&[SOCKS5_VERSION, 0x05, 0x00, SOCKS5_ATYP_IPV4, 0, 0, 0, 0, 0, 0]);
        let mut stream = ScriptedStream::new(script);

        let err = socks5_connect(&mut stream, "10.0.0.9", 22, None, None, true).unwrap_err();
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn socks5_username_password_subnegotiation() {
        let mut script = vec![SOCKS5_VERSION, SOCKS5_USER_PASS];
        script.extend_from_slice(&[0x01, 0x00]); // auth ok
        script.extend_from_slice(&[SOCKS5_VERSION, 0x00, 0x00, SOCKS5_ATYP_IPV4, 0, 0, 0, 0, 0, 0]);
        let mut stream = ScriptedStream::new(script);

        socks5_connect(&mut stream, "10.0.0.9", 22, Some("u"), Some("p"), true).unwrap();

        // Greeting offered both methods, then RFC 1929 subnegotiation.
        assert_eq!(
            &stream.written[..4],
            &[SOCKS5_VERSION, 2, SOCKS5_NO_AUTH, SOCKS5_USER_PASS]
        );
        assert_eq!(&stream.written[4..10], &[0x01, 1, b'u', 1, b'p', SOCKS5_VERSION]);
    }

    #[test]
    fn socks4a_appends_hostname() {
        let mut stream = ScriptedStream::new(vec![0x00, SOCKS4_REP_GRANTED, 0, 0, 0, 0, 0, 0]);
        socks4_connect(&mut stream, "db.internal", 22, "user", true).unwrap();
        let w = &stream.written;
        assert_eq!(w[0], SOCKS4_VERSION);
        assert_eq!(&w[4..8], &[0, 0, 0, 1]);
        assert!(w.ends_with(b"db.internal\0"));
    }

    #[test]
    fn socks4_rejection_is_an_error() {
        let mut stream = ScriptedStream::new(vec![0x00, 0x5B, 0, 0, 0, 0, 0, 0]);
        let err = socks4_connect(&mut stream, "10.0.0.9", 22, "", true).unwrap_err();
        assert!(matches!(err, ClientError::Network(_)));
    }

    #[test]
    fn http_connect_sends_request_and_accepts_200() {
        let mut stream =
            ScriptedStream::new(b"HTTP/1.1 200 Connection established\r\n\r\n".to_vec());
        http_connect(&mut stream, "db.internal", 22, None, None).unwrap();
        let sent = String::from_utf8(stream.written.clone()).unwrap();
        assert!(sent.starts_with("CONNECT db.internal:22 HTTP/1.1\r\n"));
        assert!(sent.contains("Host: db.internal:22\r\n"));
        assert!(!sent.contains("Proxy-Authorization"));
    }

    #[test]
    fn http_connect_includes_basic_auth() {
        let mut stream = ScriptedStream::new(b"HTTP/1.1 200 OK\r\n\r\n".to_vec());
        http_connect(&mut stream, "h", 22, Some("user"), Some("pass")).unwrap();
        let sent = String::from_utf8(stream.written.clone()).unwrap();
        assert!(sent.contains(&format!(
            "Proxy-Authorization: Basic {}\r\n",
            STANDARD.encode("user:pass")
        )));
    }

    #[test]
    fn http_407_is_an_error() {
        let mut stream = ScriptedStream::new(
            b"HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic\r\n\r\n"
                .to_vec(),
        );
        let err = http_connect(&mut stream, "h", 22, None, None).unwrap_err();
        assert!(err.to_string().contains("407"));
    }
}
