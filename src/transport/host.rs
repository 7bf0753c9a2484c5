//! Native host process launcher.
//!
//! Spawns the native host binary and speaks native-messaging framing over
//! its stdin/stdout: each message is a 4-byte little-endian length prefix
//! followed by that many bytes of UTF-8 JSON.
//!
//! A writer task drains the outgoing channel into stdin; a reader task
//! decodes frames from stdout and feeds the event stream. EOF or a framing
//! error ends the reader with a single [`NativeEvent::Disconnected`].

// ============================================================================
// Imports
// ============================================================================

use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::protocol::{NativeEnvelope, NativeReply};

use super::native::{NativeChannel, NativeEvent, NativeLauncher};

// ============================================================================
// Constants
// ============================================================================

/// Upper bound on a single frame. Larger payloads go through the buffered
/// transfer protocol instead.
const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

// ============================================================================
// Framing
// ============================================================================

/// Writes one length-prefixed JSON frame.
///
/// # Errors
///
/// Returns [`Error::Json`] on serialization failure or [`Error::Io`] on a
/// write failure.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    envelope: &NativeEnvelope,
) -> Result<()> {
    let payload = serde_json::to_vec(envelope)?;
    let len = u32::try_from(payload.len())
        .map_err(|_| Error::protocol("Envelope exceeds frame size limit"))?;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one length-prefixed JSON frame.
///
/// Returns `Ok(None)` on a clean EOF at a frame boundary.
///
/// # Errors
///
/// Returns [`Error::Protocol`] for oversized or truncated frames and
/// [`Error::Json`] for undecodable payloads.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<NativeReply>> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_bytes);
    if len > MAX_FRAME_LEN {
        return Err(Error::protocol(format!("Frame too large: {len} bytes")));
    }

    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|_| Error::protocol("Truncated frame"))?;
    let reply = serde_json::from_slice(&payload)?;
    Ok(Some(reply))
}

// ============================================================================
// ProcessLauncher
// ============================================================================

/// Launcher spawning the native host binary.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessLauncher {
    /// Creates a launcher for the given host binary.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl NativeLauncher for ProcessLauncher {
    fn launch(&self) -> Result<NativeChannel> {
        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                Error::native_connect_failure(format!(
                    "Could not start native component {}: {e}",
                    self.program.display()
                ))
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::native_connect_failure("Native component has no stdin"))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::native_connect_failure("Native component has no stdout"))?;

        debug!(program = %self.program.display(), pid = child.id(), "native component started");

        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<NativeEnvelope>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        // Writer: drains the outgoing channel into stdin. Channel close
        // drops stdin, which is how the host learns the session is over.
        tokio::spawn(async move {
            while let Some(envelope) = outgoing_rx.recv().await {
                trace!(command = %envelope.command, "sending native envelope");
                if let Err(e) = write_frame(&mut stdin, &envelope).await {
                    warn!(error = %e, "native write failed");
                    break;
                }
            }
        });

        // Reader: feeds decoded frames to the pump until EOF or a framing
        // error, then reaps the child.
        tokio::spawn(async move {
            let error = loop {
                match read_frame(&mut stdout).await {
                    Ok(Some(reply)) => {
                        if event_tx.send(NativeEvent::Message(reply)).is_err() {
                            break None;
                        }
                    }
                    Ok(None) => break None,
                    Err(e) => break Some(e.to_string()),
                }
            };
            let _ = event_tx.send(NativeEvent::Disconnected { error });
            let _ = child.wait().await;
        });

        Ok(NativeChannel {
            outgoing: outgoing_tx,
            events: event_rx,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use crate::identifiers::RequestId;

    fn envelope(command: &str) -> NativeEnvelope {
        NativeEnvelope {
            request_id: RequestId::generate(),
            license: None,
            domain: "example.com".into(),
            command: command.into(),
            request: serde_json::json!({}),
            language: "en".into(),
            keep_alive: true,
            trace: false,
            pkcs11_modules: None,
            require_license: false,
        }
    }

    #[tokio::test]
    async fn test_frame_length_prefix_is_little_endian() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        write_frame(&mut client, &envelope("getInfo")).await.expect("write");

        let mut len_bytes = [0u8; 4];
        server.read_exact(&mut len_bytes).await.expect("len");
        let len = u32::from_le_bytes(len_bytes) as usize;
        let mut payload = vec![0u8; len];
        server.read_exact(&mut payload).await.expect("payload");
        let value: serde_json::Value = serde_json::from_slice(&payload).expect("json");
        assert_eq!(value["command"], "getInfo");
    }

    #[tokio::test]
    async fn test_read_frame_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let reply = NativeReply {
            request_id: Some(RequestId::generate()),
            success: true,
            response: Some(serde_json::json!({"version": "2.17.1"})),
            exception: None,
            stream_id: None,
            stream_length: None,
        };
        let payload = serde_json::to_vec(&reply).expect("serialize");
        client
            .write_all(&(payload.len() as u32).to_le_bytes())
            .await
            .expect("len");
        client.write_all(&payload).await.expect("payload");
        drop(client);

        let decoded = read_frame(&mut server).await.expect("read").expect("frame");
        assert_eq!(decoded.request_id, reply.request_id);
        assert!(decoded.success);

        // Clean EOF after the last frame.
        assert!(read_frame(&mut server).await.expect("eof").is_none());
    }

    #[tokio::test]
    async fn test_truncated_frame_is_an_error() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        client.write_all(&100u32.to_le_bytes()).await.expect("len");
        client.write_all(b"short").await.expect("partial");
        drop(client);

        assert!(read_frame(&mut server).await.is_err());
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(&(MAX_FRAME_LEN + 1).to_le_bytes())
            .await
            .expect("len");
        drop(client);

        assert!(read_frame(&mut server).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_binary_fails_synchronously() {
        let launcher = ProcessLauncher::new("/nonexistent/native-host", vec![]);
        let err = launcher.launch().expect_err("launch must fail");
        assert_eq!(err.code(), "native_connect_failure");
    }
}
