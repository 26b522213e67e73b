//! LSP wire framing.
//!
//! A frame is an ASCII header block terminated by an empty line, then a
//! JSON body of exactly `Content-Length` bytes. [`WireReader`] and
//! [`WireWriter`] move whole `serde_json::Value` frames; envelope
//! interpretation lives in [`crate::protocol`].

use std::io::Write as _;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Upper bound on a frame body (8 MiB). A corrupt length header must not
/// turn into an arbitrarily large allocation.
const MAX_BODY_BYTES: usize = 8 << 20;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The stream ended between frames. This is the client going away
    /// cleanly; the message loop treats it as terminal.
    #[error("EOF")]
    Closed,
    /// Unusable framing: a truncated frame, a header block we cannot
    /// interpret, or a body that is not JSON.
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl WireError {
    fn malformed(what: impl Into<String>) -> Self {
        Self::Malformed(what.into())
    }
}

/// One parsed line of the header block.
enum HeaderLine {
    /// The empty separator line: the body starts next.
    End,
    ContentLength(usize),
    /// A well-formed header we have no use for (`Content-Type`, mostly).
    Ignored,
}

fn parse_header_line(raw: &str) -> Result<HeaderLine, WireError> {
    let line = raw.trim_end_matches(['\r', '\n']);
    if line.is_empty() {
        return Ok(HeaderLine::End);
    }
    let Some((name, value)) = line.split_once(':') else {
        return Err(WireError::malformed(format!("header line {line:?}")));
    };
    // Header names are case-insensitive on the wire.
    if !name.trim().eq_ignore_ascii_case("content-length") {
        return Ok(HeaderLine::Ignored);
    }
    let value = value.trim();
    match value.parse() {
        Ok(length) => Ok(HeaderLine::ContentLength(length)),
        Err(_) => Err(WireError::malformed(format!("Content-Length {value:?}"))),
    }
}

/// Decodes frames from a byte stream.
pub struct WireReader<R> {
    input: BufReader<R>,
    /// Scratch for header lines, reused across frames.
    line: String,
}

impl<R: AsyncRead + Unpin> WireReader<R> {
    pub fn new(input: R) -> Self {
        Self {
            input: BufReader::new(input),
            line: String::new(),
        }
    }

    /// Read one frame. EOF at a frame boundary is [`WireError::Closed`];
    /// EOF anywhere inside a frame is malformed.
    pub async fn read(&mut self) -> Result<Value, WireError> {
        let length = self.read_header_block().await?;
        let mut body = vec![0u8; length];
        self.input
            .read_exact(&mut body)
            .await
            .map_err(|e| WireError::malformed(format!("body ended early: {e}")))?;
        serde_json::from_slice(&body)
            .map_err(|e| WireError::malformed(format!("body is not JSON: {e}")))
    }

    /// Consume the header block and return the announced body length.
    async fn read_header_block(&mut self) -> Result<usize, WireError> {
        let mut announced = None;
        for lines_seen in 0.. {
            self.line.clear();
            if self.input.read_line(&mut self.line).await? == 0 {
                // A clean close may only happen before the first header.
                return Err(if lines_seen == 0 {
                    WireError::Closed
                } else {
                    WireError::malformed("stream ended inside a header block")
                });
            }
            match parse_header_line(&self.line)? {
                HeaderLine::End => break,
                HeaderLine::ContentLength(length) => announced = Some(length),
                HeaderLine::Ignored => {}
            }
        }
        match announced {
            None => Err(WireError::malformed("header block without Content-Length")),
            Some(length) if length > MAX_BODY_BYTES => Err(WireError::malformed(format!(
                "body of {length} bytes exceeds the {MAX_BODY_BYTES} byte limit"
            ))),
            Some(length) => Ok(length),
        }
    }
}

/// Encodes frames onto a byte stream, one buffered write per frame.
pub struct WireWriter<W> {
    output: W,
}

impl<W: AsyncWrite + Unpin> WireWriter<W> {
    pub fn new(output: W) -> Self {
        Self { output }
    }

    pub async fn write(&mut self, frame: &Value) -> Result<(), WireError> {
        let body = serde_json::to_vec(frame)
            .map_err(|e| WireError::malformed(format!("unencodable frame: {e}")))?;
        let mut buf = Vec::with_capacity(body.len() + 32);
        let _ = write!(buf, "Content-Length: {}\r\n\r\n", body.len());
        buf.extend_from_slice(&body);
        self.output.write_all(&buf).await?;
        self.output.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Build raw frame bytes with an arbitrary header block.
    fn raw_frame(headers: &str, body: &str) -> Vec<u8> {
        format!("{headers}\r\n{body}").into_bytes()
    }

    async fn decode(bytes: &[u8]) -> Result<Value, WireError> {
        WireReader::new(bytes).read().await
    }

    fn is_malformed(result: Result<Value, WireError>) -> bool {
        matches!(result, Err(WireError::Malformed(_)))
    }

    #[tokio::test]
    async fn test_round_trip_preserves_frames_and_counts_bytes() {
        // "ω" is two UTF-8 bytes, so the announced length must be the byte
        // count, not the character count.
        let first = json!({ "jsonrpc": "2.0", "method": "proof/goals", "params": { "k": "ω" } });
        let second = json!({ "jsonrpc": "2.0", "id": 2, "result": null });

        let mut encoded = Vec::new();
        let mut writer = WireWriter::new(&mut encoded);
        writer.write(&first).await.unwrap();
        writer.write(&second).await.unwrap();

        let body_len = serde_json::to_vec(&first).unwrap().len();
        let header = format!("Content-Length: {body_len}\r\n\r\n");
        assert_eq!(&encoded[..header.len()], header.as_bytes());

        let mut reader = WireReader::new(encoded.as_slice());
        assert_eq!(reader.read().await.unwrap(), first);
        assert_eq!(reader.read().await.unwrap(), second);
        assert!(matches!(reader.read().await, Err(WireError::Closed)));
    }

    #[tokio::test]
    async fn test_empty_input_is_a_clean_close() {
        assert!(matches!(decode(b"").await, Err(WireError::Closed)));
    }

    #[tokio::test]
    async fn test_truncated_frames_are_malformed_not_closed() {
        // Inside the header block.
        assert!(is_malformed(decode(b"Content-Length: 9\r\n").await));
        // Inside the body.
        assert!(is_malformed(decode(&raw_frame("Content-Length: 99\r\n", "{}")).await));
    }

    #[tokio::test]
    async fn test_header_casing_and_unknown_headers() {
        let body = r#"{"id":7}"#;
        let headers = format!(
            "content-length: {}\r\nContent-Type: application/vscode-jsonrpc\r\n",
            body.len()
        );
        let frame = raw_frame(&headers, body);
        assert_eq!(decode(&frame).await.unwrap()["id"], 7);
    }

    #[tokio::test]
    async fn test_header_block_without_length() {
        let frame = raw_frame("Content-Type: application/json\r\n", "{}");
        assert!(is_malformed(decode(&frame).await));
    }

    #[tokio::test]
    async fn test_unusable_length_values() {
        assert!(is_malformed(decode(&raw_frame("Content-Length: many\r\n", "{}")).await));
        let huge = format!("Content-Length: {}\r\n", MAX_BODY_BYTES + 1);
        assert!(is_malformed(decode(&raw_frame(&huge, "")).await));
    }

    #[tokio::test]
    async fn test_header_line_without_colon() {
        let frame = raw_frame("Content-Length 2\r\n", "{}");
        assert!(is_malformed(decode(&frame).await));
    }

    #[tokio::test]
    async fn test_body_must_be_json() {
        let frame = raw_frame("Content-Length: 9\r\n", "Qed. Qed.");
        assert!(is_malformed(decode(&frame).await));
    }
}
