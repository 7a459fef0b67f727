//! End-to-end scenarios against a real SSH server on 127.0.0.1:22.
//!
//! All tests skip at runtime unless the server is reachable and
//! `TERMBRIDGE_TEST_USER` / `TERMBRIDGE_TEST_PASSWORD` are set.

mod common;

use std::time::Duration;

use common::require_ssh;
use termbridge_core::{
    Client, ConnectOptions, JumpAuth, JumpHost, ProxyConfig, ProxyType, SessionState,
    ShellOptions, SocksListener, TunnelConfig,
};

#[test]
fn echo_round_trip() {
    let (user, password) = require_ssh!();
    let store = tempfile::NamedTempFile::new().unwrap();
    let mut client = common::connected_shell_client(&user, &password, store.path());

    common::assert_echo_round_trip(&client);

    client.close();
    client.wait_closed();
    assert_eq!(client.state(), SessionState::Closed);
}

#[test]
fn screen_dirty_accounting() {
    let (user, password) = require_ssh!();
    let store = tempfile::NamedTempFile::new().unwrap();
    let client = common::connected_shell_client(&user, &password, store.path());

    // After the login banner settles, the initial screen is fully dirty.
    std::thread::sleep(Duration::from_secs(2));
    let initial = client.changes().unwrap();
    assert_eq!(initial.len(), 24);

    // Typing a command dirties the prompt row, which holds the cursor.
    client.send("echo Hello World").unwrap();
    std::thread::sleep(Duration::from_millis(300));
    let changes = client.changes().unwrap();
    let (cursor_row, _) = client.cursor().unwrap();
    let typed_row = changes
        .get(&cursor_row)
        .expect("cursor row should be dirty");
    let text: String = typed_row.values().map(|cell| cell.contents.as_str()).collect();
    assert!(
        text.contains("echo Hello World"),
        "prompt row missing the command: {text:?}"
    );

    // Executing it touches the output row and the new prompt row.
    client.send("\n").unwrap();
    std::thread::sleep(Duration::from_millis(400));
    let after_enter = client.changes().unwrap();
    assert!(
        after_enter.len() >= 2,
        "expected output and prompt rows dirty, got {:?}",
        after_enter.keys().collect::<Vec<_>>()
    );
}

#[test]
fn local_forward_carries_a_second_session() {
    let (user, password) = require_ssh!();
    let store = tempfile::NamedTempFile::new().unwrap();
    let mut first = Client::new(common::local_config(&user, store.path()));
    first
        .connect(ConnectOptions {
            password: Some(password.clone()),
            ..ConnectOptions::default()
        })
        .unwrap();

    let forwarder = first
        .add_forward(TunnelConfig {
            src: ("127.0.0.1".into(), 0),
            dst: (common::SSH_HOST.into(), common::SSH_PORT),
        })
        .unwrap();
    forwarder.wait_started(Duration::from_secs(5)).unwrap();
    let forwarded_port = forwarder.local_addr().port();

    // A second client connects through the tunnel and gets a real shell.
    let store2 = tempfile::NamedTempFile::new().unwrap();
    let mut second = Client::new(termbridge_core::ClientConfig {
        port: forwarded_port,
        ..common::local_config(&user, store2.path())
    });
    second
        .connect(ConnectOptions {
            password: Some(password),
            ..ConnectOptions::default()
        })
        .unwrap();
    second.invoke_shell(ShellOptions::default()).unwrap();
    common::assert_echo_round_trip(&second);

    let stats = first.forwarders()[0].stats();
    assert!(stats.total_connections >= 1);
    assert!(stats.bytes_sent > 0 && stats.bytes_received > 0);

    second.close();
    second.wait_closed();
    first.close();
    first.wait_closed();
}

#[test]
fn socks5_listener_tunnels_a_second_session() {
    let (user, password) = require_ssh!();
    let store = tempfile::NamedTempFile::new().unwrap();
    let mut first = Client::new(termbridge_core::ClientConfig {
        socks_listeners: vec![SocksListener {
            bind: "127.0.0.1".into(),
            port: 0,
        }],
        ..common::local_config(&user, store.path())
    });
    first
        .connect(ConnectOptions {
            password: Some(password.clone()),
            ..ConnectOptions::default()
        })
        .unwrap();
    first.wait_started(Duration::from_secs(5)).unwrap();
    let socks_port = first.socks_proxies()[0].local_addr().port();

    let store2 = tempfile::NamedTempFile::new().unwrap();
    let mut second = Client::new(termbridge_core::ClientConfig {
        proxy: Some(ProxyConfig {
            proxy_type: ProxyType::Socks5,
            host: "127.0.0.1".into(),
            port: socks_port,
            username: None,
            password: None,
            remote_dns: true,
        }),
        ..common::local_config(&user, store2.path())
    });
    second
        .connect(ConnectOptions {
            password: Some(password),
            ..ConnectOptions::default()
        })
        .unwrap();
    second.invoke_shell(ShellOptions::default()).unwrap();
    common::assert_echo_round_trip(&second);

    second.close();
    second.wait_closed();
    first.close();
    first.wait_closed();
}

#[test]
fn jump_host_chain_reaches_the_target() {
    let (user, password) = require_ssh!();
    let store = tempfile::NamedTempFile::new().unwrap();
    let mut client = Client::new(termbridge_core::ClientConfig {
        jump_hosts: vec![JumpHost {
            host: common::SSH_HOST.into(),
            port: common::SSH_PORT,
            username: Some(user.clone()),
            key_file: None,
        }],
        ..common::local_config(&user, store.path())
    });

    let mut jump_passwords = std::collections::HashMap::new();
    jump_passwords.insert(
        common::SSH_HOST.to_string(),
        JumpAuth {
            password: Some(password.clone()),
            passphrase: None,
        },
    );
    client
        .connect(ConnectOptions {
            password: Some(password),
            jump_passwords,
            ..ConnectOptions::default()
        })
        .unwrap();
    assert_eq!(client.jump_clients().len(), 1);

    client.invoke_shell(ShellOptions::default()).unwrap();
    common::assert_echo_round_trip(&client);

    client.close();
    client.wait_closed();
    // The jump sub-client is closed with the outer client.
    assert_eq!(client.jump_clients()[0].state(), SessionState::Closed);
}

#[test]
fn exec_command_returns_combined_output() {
    let (user, password) = require_ssh!();
    let store = tempfile::NamedTempFile::new().unwrap();
    let mut client = Client::new(common::local_config(&user, store.path()));
    client
        .connect(ConnectOptions {
            password: Some(password),
            ..ConnectOptions::default()
        })
        .unwrap();

    let output = client.exec_command("echo out; echo err 1>&2").unwrap();
    assert!(output.contains("out"));
    assert!(output.contains("err"));

    let results: Vec<_> = client
        .command_result(
            "echo tick",
            2,
            Duration::from_millis(100),
            Duration::from_secs(5),
        )
        .unwrap()
        .collect();
    assert_eq!(results.len(), 2);
    for result in results {
        assert!(result.unwrap().contains("tick"));
    }

    client.close();
    client.wait_closed();
}

#[test]
fn parallel_sftp_opens_a_sibling() {
    let (user, password) = require_ssh!();
    let store = tempfile::NamedTempFile::new().unwrap();
    let mut client = common::connected_shell_client(&user, &password, store.path());

    let (mut sibling, sftp) = client.parallel_sftp().unwrap();
    let entries = sftp.readdir(std::path::Path::new("/tmp")).unwrap();
    drop(entries);
    drop(sftp);

    // The shell on the original client still works.
    common::assert_echo_round_trip(&client);

    sibling.close();
    sibling.wait_closed();
    client.close();
    client.wait_closed();
}
