//! Shared helpers for termbridge-core integration tests.
//!
//! Network-dependent tests need a reachable SSH server on 127.0.0.1:22 and
//! credentials in `TERMBRIDGE_TEST_USER` / `TERMBRIDGE_TEST_PASSWORD`;
//! they skip at runtime otherwise, following the same convention as the
//! screen/lifecycle tests that run everywhere.

// Each integration test is compiled as its own crate, so not every test
// file uses every helper here.
#![allow(dead_code)]

use std::net::TcpStream;
use std::path::Path;
use std::time::Duration;

use termbridge_core::{Client, ClientConfig, ConnectOptions, KnownHostsPolicy, ShellOptions};

pub const SSH_HOST: &str = "127.0.0.1";
pub const SSH_PORT: u16 = 22;

/// Check if a TCP port accepts connections within 2 seconds.
pub fn is_port_reachable(host: &str, port: u16) -> bool {
    format!("{host}:{port}")
        .parse()
        .is_ok_and(|addr| TcpStream::connect_timeout(&addr, Duration::from_secs(2)).is_ok())
}

/// Credentials for the local test server, when provided.
pub fn ssh_credentials() -> Option<(String, String)> {
    let user = std::env::var("TERMBRIDGE_TEST_USER").ok()?;
    let password = std::env::var("TERMBRIDGE_TEST_PASSWORD").ok()?;
    Some((user, password))
}

/// Everything a network test needs, or `None` to skip.
pub fn ssh_test_setup() -> Option<(String, String)> {
    let credentials = ssh_credentials()?;
    is_port_reachable(SSH_HOST, SSH_PORT).then_some(credentials)
}

/// Skip the current test unless a local SSH server and credentials are
/// available. Runtime check instead of `#[ignore]` so `cargo test` output
/// names what was skipped.
macro_rules! require_ssh {
    () => {
        match common::ssh_test_setup() {
            Some(setup) => setup,
            None => {
                eprintln!(
                    "SKIPPED: needs sshd on 127.0.0.1:22 plus \
                     TERMBRIDGE_TEST_USER/TERMBRIDGE_TEST_PASSWORD"
                );
                return;
            }
        }
    };
}
pub(crate) use require_ssh;

/// Config against the local test server: auto-add host keys into a private
/// store, X11 off, short timeouts.
pub fn local_config(user: &str, host_keys_file: &Path) -> ClientConfig {
    ClientConfig {
        x11: false,
        known_hosts_policy: KnownHostsPolicy::AutoAdd,
        host_keys_file: Some(host_keys_file.to_path_buf()),
        connect_timeout: Some(Duration::from_secs(5)),
        ..ClientConfig::new(SSH_HOST, user)
    }
}

/// Connect with password auth and open a default shell.
pub fn connected_shell_client(
    user: &str,
    password: &str,
    host_keys_file: &Path,
) -> Client {
    let mut client = Client::new(local_config(user, host_keys_file));
    client
        .connect(ConnectOptions {
            password: Some(password.to_string()),
            ..ConnectOptions::default()
        })
        .expect("connect to local sshd");
    client
        .invoke_shell(ShellOptions::default())
        .expect("invoke shell");
    client
}

/// Rows that contain at least one ASCII letter.
pub fn lettered_rows(rows: &[String]) -> Vec<String> {
    rows.iter()
        .filter(|row| row.chars().any(|c| c.is_ascii_alphabetic()))
        .cloned()
        .collect()
}

/// Drive the echo round trip on an already-shelled client: the command's
/// output must land on the row before the fresh prompt.
pub fn assert_echo_round_trip(client: &Client) {
    std::thread::sleep(Duration::from_millis(500));
    client.send("echo Hello World\n").expect("send");
    std::thread::sleep(Duration::from_millis(500));

    let rows = lettered_rows(&client.display_screen().expect("display"));
    assert!(rows.len() >= 2, "screen too empty: {rows:?}");
    let penultimate = &rows[rows.len() - 2];
    assert!(
        penultimate.starts_with("Hello World"),
        "expected echo output before the prompt, got {rows:?}"
    );
}
