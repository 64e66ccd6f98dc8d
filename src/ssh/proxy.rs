//! ProxyCommand transport
//!
//! Runs the configured helper process (`ProxyCommand nc %h %p`,
//! `ssh -W %h:%p bastion`, ...) and uses its stdin/stdout as the byte stream
//! for the SSH handshake, the way `client::connect_stream()` consumes any
//! `AsyncRead + AsyncWrite` transport.
//!
//! # Teardown
//!
//! The helper only exits once it sees EOF on its stdin, so stdin is always
//! closed before stdout is released. The helper's stderr never reaches the
//! protocol stream; each line goes to the debug log.

use std::io;
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader, ReadBuf};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info};

use super::error::SshError;

/// Substitute `%h`, `%p`, `%r` and `%%` in a ProxyCommand template.
///
/// Unknown `%x` sequences are kept verbatim.
pub fn expand_proxy_command(template: &str, host: &str, port: &str, user: &str) -> String {
    let mut out = String::with_capacity(template.len() + host.len());
    let mut chars = template.chars();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('h') => out.push_str(host),
            Some('p') => out.push_str(port),
            Some('r') => out.push_str(user),
            Some('%') => out.push('%'),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }

    out
}

/// Helper process used as the SSH transport
pub struct ProxyCommandStream {
    stdin: Option<ChildStdin>,
    stdout: ChildStdout,
    child: Child,
}

impl ProxyCommandStream {
    /// Split `command` into words and spawn it with piped stdio.
    pub fn spawn(command: &str) -> Result<Self, SshError> {
        let args = shlex::split(command).ok_or_else(|| {
            SshError::ProxyCommand(format!("cannot split {:?} into words", command))
        })?;
        let (program, args) = args
            .split_first()
            .ok_or_else(|| SshError::ProxyCommand("empty ProxyCommand".to_string()))?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SshError::ProxyCommand(format!("failed to start {:?}: {}", program, e)))?;

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SshError::ProxyCommand("stdout not captured".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            let name = program.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("ProxyCommand {}: {}", name, line);
                }
            });
        }

        info!("ProxyCommand started: {}", command);
        Ok(Self {
            stdin,
            stdout,
            child,
        })
    }

    /// Close the helper's stdin; stdout stays readable.
    pub fn close_stdin(&mut self) {
        if self.stdin.take().is_some() {
            debug!("ProxyCommand stdin closed");
        }
    }
}

impl Drop for ProxyCommandStream {
    fn drop(&mut self) {
        // stdout is released after this body returns, then the child is killed
        self.close_stdin();
        if let Some(pid) = self.child.id() {
            debug!("Releasing ProxyCommand pid {}", pid);
        }
    }
}

impl AsyncRead for ProxyCommandStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdout).poll_read(cx, buf)
    }
}

impl AsyncWrite for ProxyCommandStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.stdin.as_mut() {
            Some(stdin) => Pin::new(stdin).poll_write(cx, buf),
            None => Poll::Ready(Err(closed_pipe())),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.stdin.as_mut() {
            Some(stdin) => Pin::new(stdin).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if let Some(stdin) = self.stdin.as_mut() {
            if let Err(e) = std::task::ready!(Pin::new(stdin).poll_flush(cx)) {
                debug!("ProxyCommand flush before close failed: {}", e);
            }
        }
        self.close_stdin();
        Poll::Ready(Ok(()))
    }
}

fn closed_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "ProxyCommand stdin is closed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_expand_placeholders() {
        assert_eq!(
            expand_proxy_command("nc %h %p", "10.0.0.5", "2222", "deploy"),
            "nc 10.0.0.5 2222"
        );
        assert_eq!(
            expand_proxy_command("ssh -l %r -W %h:%p bastion", "db", "22", "ops"),
            "ssh -l ops -W db:22 bastion"
        );
        assert_eq!(
            expand_proxy_command("echo 100%% %h%h", "a", "22", "u"),
            "echo 100% aa"
        );
    }

    #[test]
    fn test_expand_keeps_unknown_sequences() {
        assert_eq!(expand_proxy_command("x %d %", "h", "22", "u"), "x %d %");
    }

    #[test]
    fn test_spawn_rejects_bad_commands() {
        assert!(matches!(
            ProxyCommandStream::spawn(""),
            Err(SshError::ProxyCommand(_))
        ));
        assert!(matches!(
            ProxyCommandStream::spawn("nc 'unterminated"),
            Err(SshError::ProxyCommand(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_program_is_reported() {
        match ProxyCommandStream::spawn("/nonexistent/slex-proxy %h") {
            Err(SshError::ProxyCommand(msg)) => assert!(msg.contains("/nonexistent/slex-proxy")),
            Err(e) => panic!("Unexpected error type: {:?}", e),
            Ok(_) => panic!("spawned a program that does not exist"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_round_trip_through_helper() {
        let mut stream = ProxyCommandStream::spawn("cat").unwrap();
        stream.write_all(b"SSH-2.0-echo\r\n").await.unwrap();
        stream.flush().await.unwrap();

        let mut buf = [0u8; 14];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"SSH-2.0-echo\r\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdin_closes_before_stdout() {
        // The helper only writes after it sees EOF on stdin
        let mut stream = ProxyCommandStream::spawn("sh -c 'cat >/dev/null; echo done'").unwrap();
        stream.write_all(b"ignored\n").await.unwrap();
        stream.shutdown().await.unwrap();

        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "done\n");

        // Writing after close fails instead of reaching the helper
        assert_eq!(
            stream.write_all(b"late").await.unwrap_err().kind(),
            io::ErrorKind::BrokenPipe
        );
    }
}
