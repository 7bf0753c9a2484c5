//! Buffered transfer decoding.
//!
//! Native-messaging frames have a practical size ceiling, so the native
//! host returns large payloads as a stream: the original reply carries a
//! stream id and total length, and the relay pulls chunks until it has
//! everything.
//!
//! Two stream shapes exist. A buffered *response* carries JSON text in its
//! chunks and parses to the command's real result. Buffered *content*
//! carries base64 in its chunks, advances by the chunk's `written` count,
//! and reassembles to one base64 string (used for oversized document
//! payloads inside an otherwise ordinary result).
//!
//! The finish command releases the native-side stream; its outcome does
//! not change the already-assembled payload. A failed chunk read aborts
//! without cleanup, matching the native host's own timeout-based reaping.

// ============================================================================
// Imports
// ============================================================================

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::Value;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::identifiers::StreamId;
use crate::router::Page;

// ============================================================================
// NativeCaller
// ============================================================================

/// Issues native commands on behalf of a page.
///
/// The dispatcher implements this over the real connection; tests script
/// it directly.
#[async_trait]
pub trait NativeCaller: Send + Sync {
    /// Sends a command and awaits its unwrapped result.
    async fn call(&self, page: &Page, command: &str, request: Value) -> Result<Value>;
}

// ============================================================================
// BufferedTransferManager
// ============================================================================

/// Reassembles buffered streams.
#[derive(Debug, Default)]
pub struct BufferedTransferManager;

impl BufferedTransferManager {
    /// Creates a manager.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Reads a buffered response stream and parses it as the command's
    /// JSON result.
    ///
    /// Offsets count UTF-16 code units, which is how the native host
    /// measures its string stream.
    ///
    /// # Errors
    ///
    /// Propagates chunk-read failures verbatim; an assembled payload that
    /// is not valid JSON is [`Error::Json`].
    pub async fn read_response(
        &self,
        caller: &dyn NativeCaller,
        page: &Page,
        stream_id: StreamId,
        total: u64,
    ) -> Result<Value> {
        debug!(stream = %stream_id, total, "reading buffered response");
        let mut data = String::new();
        let mut offset = 0u64;

        while offset < total {
            let chunk = caller
                .call(
                    page,
                    "readBufferedResponse",
                    serde_json::json!({ "streamId": stream_id, "offset": offset }),
                )
                .await?;
            let buffer = chunk_str(&chunk, "buffer")?;
            if buffer.is_empty() {
                return Err(Error::protocol(format!(
                    "Empty chunk at offset {offset} of buffered response {stream_id}"
                )));
            }
            offset += buffer.encode_utf16().count() as u64;
            data.push_str(buffer);
            trace!(stream = %stream_id, offset, "buffered response chunk");
        }

        let parsed = serde_json::from_str(&data)?;
        let _ = caller
            .call(
                page,
                "finishBufferedResponse",
                serde_json::json!({ "streamId": stream_id }),
            )
            .await;
        Ok(parsed)
    }

    /// Reads a buffered content stream and returns the payload as one
    /// base64 string.
    ///
    /// Chunks carry base64 text but offsets advance by the decoded
    /// `written` count, so the two sides agree on raw byte positions.
    ///
    /// # Errors
    ///
    /// Propagates chunk-read failures verbatim; an undecodable chunk is
    /// [`Error::Protocol`].
    pub async fn read_content(
        &self,
        caller: &dyn NativeCaller,
        page: &Page,
        stream_id: StreamId,
        total: u64,
    ) -> Result<String> {
        debug!(stream = %stream_id, total, "reading buffered content");
        let mut bytes = Vec::new();
        let mut offset = 0u64;

        while offset < total {
            let chunk = caller
                .call(
                    page,
                    "readBufferedContent",
                    serde_json::json!({ "streamId": stream_id, "offset": offset }),
                )
                .await?;
            let buffer = chunk_str(&chunk, "buffer")?;
            let written = chunk
                .get("written")
                .and_then(Value::as_u64)
                .ok_or_else(|| Error::protocol("Content chunk without a written count"))?;
            if written == 0 {
                return Err(Error::protocol(format!(
                    "Empty chunk at offset {offset} of buffered content {stream_id}"
                )));
            }
            let decoded = BASE64
                .decode(buffer)
                .map_err(|e| Error::protocol(format!("Undecodable content chunk: {e}")))?;
            bytes.extend_from_slice(&decoded);
            offset += written;
            trace!(stream = %stream_id, offset, "buffered content chunk");
        }

        let _ = caller
            .call(
                page,
                "finishBufferedContent",
                serde_json::json!({ "streamId": stream_id }),
            )
            .await;
        Ok(BASE64.encode(bytes))
    }
}

fn chunk_str<'a>(chunk: &'a Value, field: &str) -> Result<&'a str> {
    chunk
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::protocol(format!("Chunk without a {field} field")))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use parking_lot::Mutex;

    use crate::identifiers::{Domain, PageId};
    use crate::protocol::PageReply;
    use crate::transport::{PageSender, PageTransport};

    struct NullTransport;

    impl PageTransport for NullTransport {
        fn sender(&self) -> PageSender {
            PageSender {
                url: "https://example.com/".into(),
                tab_url: None,
            }
        }

        fn post(&self, _reply: PageReply) {}
    }

    fn page() -> Arc<Page> {
        Page::new(
            PageId::next(),
            Domain::from_host("example.com"),
            Arc::new(NullTransport),
        )
    }

    /// Caller that slices a fixed payload and records every call.
    struct ScriptedCaller {
        /// Chunk sizes handed out in order.
        chunks: Vec<usize>,
        payload: Vec<u8>,
        base64_chunks: bool,
        fail_reads: bool,
        calls: Mutex<Vec<(String, Value)>>,
    }

    impl ScriptedCaller {
        fn calls(&self) -> Vec<(String, Value)> {
            self.calls.lock().clone()
        }

        fn finish_count(&self, command: &str) -> usize {
            self.calls
                .lock()
                .iter()
                .filter(|(c, _)| c == command)
                .count()
        }
    }

    #[async_trait]
    impl NativeCaller for ScriptedCaller {
        async fn call(&self, _page: &Page, command: &str, request: Value) -> Result<Value> {
            self.calls
                .lock()
                .push((command.to_string(), request.clone()));
            if command.starts_with("finish") {
                return Ok(Value::Null);
            }
            if self.fail_reads {
                return Err(Error::native_disconnected("gone mid-stream"));
            }

            let offset = request["offset"].as_u64().expect("offset") as usize;
            let read_index = self
                .calls
                .lock()
                .iter()
                .filter(|(c, _)| c.starts_with("read"))
                .count()
                - 1;
            let size = self.chunks[read_index.min(self.chunks.len() - 1)];
            let end = (offset + size).min(self.payload.len());
            let slice = &self.payload[offset..end];

            if self.base64_chunks {
                Ok(serde_json::json!({
                    "buffer": BASE64.encode(slice),
                    "written": slice.len(),
                }))
            } else {
                Ok(serde_json::json!({
                    "buffer": String::from_utf8(slice.to_vec()).expect("utf8"),
                }))
            }
        }
    }

    fn json_payload(len: usize) -> Vec<u8> {
        // A JSON string long enough to split: {"data":"aaaa...."}
        let filler = "a".repeat(len - 11);
        format!(r#"{{"data":"{filler}"}}"#).into_bytes()
    }

    #[tokio::test]
    async fn test_response_chunks_advance_by_length() {
        let payload = json_payload(387);
        let caller = ScriptedCaller {
            chunks: vec![100, 250, 37],
            payload: payload.clone(),
            base64_chunks: false,
            fail_reads: false,
            calls: Mutex::new(Vec::new()),
        };
        let manager = BufferedTransferManager::new();
        let page = page();

        let result = manager
            .read_response(&caller, &page, StreamId(5), 387)
            .await
            .expect("assembled");
        assert!(result["data"].as_str().is_some());

        let calls = caller.calls();
        let offsets: Vec<u64> = calls
            .iter()
            .filter(|(c, _)| c == "readBufferedResponse")
            .map(|(_, r)| r["offset"].as_u64().unwrap())
            .collect();
        assert_eq!(offsets, vec![0, 100, 350]);
        assert_eq!(caller.finish_count("finishBufferedResponse"), 1);
    }

    /// Caller serving fixed string chunks in order, regardless of the
    /// offset the manager reports back.
    struct SequencedCaller {
        chunks: Vec<&'static str>,
        calls: Mutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl NativeCaller for SequencedCaller {
        async fn call(&self, _page: &Page, command: &str, request: Value) -> Result<Value> {
            self.calls
                .lock()
                .push((command.to_string(), request.clone()));
            if command.starts_with("finish") {
                return Ok(Value::Null);
            }
            let read_index = self
                .calls
                .lock()
                .iter()
                .filter(|(c, _)| c.starts_with("read"))
                .count()
                - 1;
            Ok(serde_json::json!({ "buffer": self.chunks[read_index] }))
        }
    }

    #[tokio::test]
    async fn test_response_offsets_count_utf16_units() {
        // "café" is 5 bytes of UTF-8 but 4 UTF-16 units; "🙂" is 4 bytes
        // but 2 units. The stream length and running offsets use units.
        let chunks = vec![r#"{"name":"café","#, r#""face":"🙂"}"#];
        let total: u64 = chunks
            .iter()
            .map(|c| c.encode_utf16().count() as u64)
            .sum();
        let bytes: u64 = chunks.iter().map(|c| c.len() as u64).sum();
        assert_eq!(total, 27);
        assert_eq!(bytes, 30);
        let first = chunks[0].encode_utf16().count() as u64;
        let caller = SequencedCaller {
            chunks,
            calls: Mutex::new(Vec::new()),
        };
        let manager = BufferedTransferManager::new();
        let page = page();

        let result = manager
            .read_response(&caller, &page, StreamId(3), total)
            .await
            .expect("assembled");
        assert_eq!(result["name"], "café");

        let offsets: Vec<u64> = caller
            .calls
            .lock()
            .iter()
            .filter(|(c, _)| c == "readBufferedResponse")
            .map(|(_, r)| r["offset"].as_u64().unwrap())
            .collect();
        assert_eq!(offsets, vec![0, first]);
    }

    #[tokio::test]
    async fn test_failed_chunk_aborts_without_cleanup() {
        let caller = ScriptedCaller {
            chunks: vec![100],
            payload: json_payload(387),
            base64_chunks: false,
            fail_reads: true,
            calls: Mutex::new(Vec::new()),
        };
        let manager = BufferedTransferManager::new();
        let page = page();

        let err = manager
            .read_response(&caller, &page, StreamId(5), 387)
            .await
            .expect_err("aborted");
        assert_eq!(err.code(), "native_disconnected");
        assert_eq!(caller.finish_count("finishBufferedResponse"), 0);
    }

    #[tokio::test]
    async fn test_incomplete_payload_is_not_a_result() {
        // Total larger than the payload: the final parse sees truncated
        // JSON and must fail rather than fabricate a result.
        let mut payload = json_payload(300);
        payload.truncate(250);
        let caller = ScriptedCaller {
            chunks: vec![250, 50],
            payload,
            base64_chunks: false,
            fail_reads: false,
            calls: Mutex::new(Vec::new()),
        };
        let manager = BufferedTransferManager::new();
        let page = page();

        // The second read returns an empty slice, which is a protocol
        // error, never a silent short result.
        let result = manager.read_response(&caller, &page, StreamId(5), 300).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_content_offsets_advance_by_written() {
        let payload: Vec<u8> = (0u8..=255).cycle().take(300).collect();
        let caller = ScriptedCaller {
            chunks: vec![128, 128, 44],
            payload: payload.clone(),
            base64_chunks: true,
            fail_reads: false,
            calls: Mutex::new(Vec::new()),
        };
        let manager = BufferedTransferManager::new();
        let page = page();

        let encoded = manager
            .read_content(&caller, &page, StreamId(9), 300)
            .await
            .expect("assembled");
        assert_eq!(BASE64.decode(encoded).expect("decode"), payload);

        let offsets: Vec<u64> = caller
            .calls()
            .iter()
            .filter(|(c, _)| c == "readBufferedContent")
            .map(|(_, r)| r["offset"].as_u64().unwrap())
            .collect();
        assert_eq!(offsets, vec![0, 128, 256]);
        assert_eq!(caller.finish_count("finishBufferedContent"), 1);
    }
}
