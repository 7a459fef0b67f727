//! External proxy-command transport.
//!
//! The helper process is spawned with piped stdio and its stdout/stdin pair
//! is used directly as the session byte stream. The command string has the
//! `%x` placeholders substituted before spawning. Selector-based
//! non-blocking I/O is not portable across pipe handles, so reads are plain
//! blocking reads; killing the process is what unblocks a pending read at
//! shutdown.

use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use tracing::{debug, info};

use crate::errors::{ClientError, Result};

/// A running proxy-command process exposing its stdio as the byte pipe.
pub struct CommandPipe {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    command_line: String,
}

impl CommandPipe {
    /// Spawn `command_line` (whitespace-split) with piped stdin/stdout.
    pub(crate) fn spawn(command_line: &str) -> Result<Self> {
        let argv: Vec<&str> = command_line.split_whitespace().collect();
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| ClientError::Config("proxy command is empty".into()))?;

        info!(command = %command_line, "Spawning proxy command");
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        Ok(Self {
            child,
            stdin,
            stdout,
            command_line: command_line.to_string(),
        })
    }

    /// The reader half, taken once by the receive worker.
    pub(crate) fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// The writer half, taken once by the session.
    pub(crate) fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    pub(crate) fn command_line(&self) -> &str {
        &self.command_line
    }

    /// Kill the helper. Closing its pipes unblocks any pending read.
    pub(crate) fn terminate(&mut self) {
        self.stdin = None;
        self.stdout = None;
        if let Ok(None) = self.child.try_wait() {
            debug!(command = %self.command_line, "Terminating proxy command");
            let _ = self.child.kill();
        }
        let _ = self.child.wait();
    }
}

impl Drop for CommandPipe {
    fn drop(&mut self) {
        self.terminate();
    }
}

impl std::fmt::Debug for CommandPipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandPipe")
            .field("command_line", &self.command_line)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn empty_command_is_a_config_error() {
        let err = CommandPipe::spawn("   ").unwrap_err();
        assert!(matches!(err, ClientError::Config(_)));
    }

    #[test]
    fn missing_program_is_a_network_error() {
        let err = CommandPipe::spawn("termbridge-no-such-binary --flag").unwrap_err();
        assert!(matches!(err, ClientError::Network(_)));
    }

    #[cfg(unix)]
    #[test]
    fn stdio_round_trip_through_cat() {
        let mut pipe = CommandPipe::spawn("cat").unwrap();
        let mut stdin = pipe.take_stdin().unwrap();
        let mut stdout = pipe.take_stdout().unwrap();

        stdin.write_all(b"ping\n").unwrap();
        stdin.flush().unwrap();
        let mut buf = [0u8; 5];
        stdout.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping\n");

        drop(stdin);
        pipe.terminate();
    }

    #[cfg(unix)]
    #[test]
    fn terminate_unblocks_a_pending_read() {
        let mut pipe = CommandPipe::spawn("cat").unwrap();
        let mut stdout = pipe.take_stdout().unwrap();
        let reader = std::thread::spawn(move || {
            let mut buf = [0u8; 16];
            // EOF once the child is gone.
            matches!(stdout.read(&mut buf), Ok(0) | Err(_))
        });
        std::thread::sleep(std::time::Duration::from_millis(50));
        pipe.terminate();
        assert!(reader.join().unwrap());
    }
}
