//! Manual trigger IPC socket
//!
//! Accepts point-to-point connections on a unix socket and fires one haptic
//! effect per message. The protocol is a single whitespace-terminated
//! decimal effect ID; anything else is silently ignored. The channel is
//! fire-and-forget - nothing is ever written back to the sender.
//!
//! ```text
//! echo 5 | socat - UNIX-CONNECT:$XDG_RUNTIME_DIR/mx4hapticd.sock
//! ```
//!
//! SPDX-License-Identifier: GPL-3.0

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::{UnixListener, UnixStream};

use crate::config::{runtime_dir, APP_NAME};
use crate::device::Device;
use crate::dispatch::{EffectSink, HapticDispatcher};

/// Maximum accepted message size in bytes
const MAX_MESSAGE_SIZE: usize = 128;

/// Default socket location: `$XDG_RUNTIME_DIR/mx4hapticd.sock`
pub fn default_socket_path() -> PathBuf {
    runtime_dir().join(format!("{}.sock", APP_NAME))
}

/// IPC server feeding manual triggers into the dispatcher
pub struct IpcServer<S: EffectSink = Device> {
    dispatcher: Arc<HapticDispatcher<S>>,
    socket_path: PathBuf,
}

impl<S: EffectSink> IpcServer<S> {
    /// Create a server bound later at `socket_path`
    pub fn new(dispatcher: Arc<HapticDispatcher<S>>, socket_path: PathBuf) -> Self {
        Self {
            dispatcher,
            socket_path,
        }
    }

    /// Bind the socket (replacing any stale one) and serve forever.
    pub async fn run(self) -> Result<(), IpcError> {
        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }

        let listener = UnixListener::bind(&self.socket_path).map_err(IpcError::BindError)?;

        // Triggers are per-user; keep other users off the socket
        let _ = std::fs::set_permissions(
            &self.socket_path,
            std::fs::Permissions::from_mode(0o600),
        );

        tracing::info!(path = %self.socket_path.display(), "IPC listening");

        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => self.handle_client(stream).await,
                Err(e) => {
                    tracing::error!(error = %e, "IPC accept failed");
                }
            }
        }
    }

    /// Read one message from a client and trigger the parsed effect.
    async fn handle_client(&self, mut stream: UnixStream) {
        let mut buffer = [0u8; MAX_MESSAGE_SIZE];
        let read = match stream.read(&mut buffer).await {
            Ok(0) => return,
            Ok(read) => read,
            Err(e) => {
                tracing::debug!(error = %e, "IPC client read failed");
                return;
            }
        };

        match parse_trigger_message(&buffer[..read]) {
            Some(effect_id) => {
                tracing::debug!(effect_id, "Manual trigger received");
                self.dispatcher.trigger(effect_id);
            }
            None => {
                tracing::debug!("Ignoring malformed IPC message");
            }
        }
    }
}

/// Parse a trigger message: the bytes up to the first whitespace must form
/// a decimal integer. Range checking is the dispatcher's job.
fn parse_trigger_message(raw: &[u8]) -> Option<u8> {
    let text = std::str::from_utf8(raw).ok()?;
    let end = text
        .find(|c: char| c.is_ascii_whitespace())
        .unwrap_or(text.len());
    let token = &text[..end];
    if token.is_empty() {
        return None;
    }
    token.parse::<u8>().ok()
}

// ============================================================================
// Error Types
// ============================================================================

/// IPC error type
#[derive(Debug)]
pub enum IpcError {
    /// Failed to bind the unix socket
    BindError(std::io::Error),
}

impl std::fmt::Display for IpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpcError::BindError(e) => write!(f, "failed to bind IPC socket: {}", e),
        }
    }
}

impl std::error::Error for IpcError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::tests_support::MockSink;
    use std::time::Duration;

    #[test]
    fn test_parse_plain_decimal() {
        assert_eq!(parse_trigger_message(b"5"), Some(5));
        assert_eq!(parse_trigger_message(b"0"), Some(0));
        assert_eq!(parse_trigger_message(b"15"), Some(15));
    }

    #[test]
    fn test_parse_terminated_decimal() {
        assert_eq!(parse_trigger_message(b"5\n"), Some(5));
        assert_eq!(parse_trigger_message(b"12\r\n"), Some(12));
        assert_eq!(parse_trigger_message(b"7 trailing junk"), Some(7));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert_eq!(parse_trigger_message(b""), None);
        assert_eq!(parse_trigger_message(b"\n"), None);
        assert_eq!(parse_trigger_message(b"abc"), None);
        assert_eq!(parse_trigger_message(b"5x"), None);
        assert_eq!(parse_trigger_message(b" 5"), None); // leading space
        assert_eq!(parse_trigger_message(b"999999"), None); // overflows u8
        assert_eq!(parse_trigger_message(&[0xFF, 0xFE]), None); // not UTF-8
    }

    #[test]
    fn test_parse_out_of_range_is_dispatchers_problem() {
        // Parses fine here; trigger() drops it later
        assert_eq!(parse_trigger_message(b"99\n"), Some(99));
    }

    #[tokio::test]
    async fn test_socket_round_trip() {
        let mock = MockSink::default();
        let dispatcher = Arc::new(HapticDispatcher::new(mock.clone()));

        let socket_path = std::env::temp_dir().join(format!(
            "mx4hapticd-ipc-test-{}.sock",
            std::process::id()
        ));

        let server = IpcServer::new(Arc::clone(&dispatcher), socket_path.clone());
        let server_task = tokio::spawn(server.run());

        // Wait for the socket to appear, then send a trigger
        for _ in 0..50 {
            if socket_path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        {
            use tokio::io::AsyncWriteExt;
            let mut client = UnixStream::connect(&socket_path).await.unwrap();
            client.write_all(b"5\n").await.unwrap();
        }

        // The effect lands in the queue once the server handled the client
        let mut queued = Vec::new();
        for _ in 0..100 {
            queued = dispatcher.pending_for_test();
            if !queued.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(queued, vec![5]);

        server_task.abort();
        std::fs::remove_file(&socket_path).ok();
    }
}
