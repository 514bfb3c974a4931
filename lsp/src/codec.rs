//! `Content-Length` framing for JSON-RPC over byte streams.
//!
//! LSP frames look like `Content-Length: N\r\n\r\n{json}`. [`MessageReader`]
//! yields raw JSON values so the session can log and skip frames that are
//! valid JSON but not valid JSON-RPC. A body that is not JSON at all is
//! logged and skipped here; only broken framing ends the stream.
//! [`MessageWriter`] encodes typed [`Message`]s.

use anyhow::{Context, Result, bail};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::protocol::Message;

/// Default cap on a single frame body (16 MiB). Full-text didOpen echoes and
/// workspace-wide responses can be large, but never unbounded.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

const CONTENT_LENGTH: &str = "Content-Length";

pub struct MessageReader<R> {
    reader: BufReader<R>,
    max_frame_bytes: usize,
    line: String,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            line: String::new(),
        }
    }

    #[must_use]
    pub fn with_max_frame_bytes(mut self, max: usize) -> Self {
        self.max_frame_bytes = max;
        self
    }

    /// Read the next frame body as JSON, skipping bodies that do not parse.
    ///
    /// `Ok(None)` means the peer closed the stream between frames. EOF in
    /// the middle of a frame is an error.
    pub async fn read_frame(&mut self) -> Result<Option<Value>> {
        loop {
            let Some(len) = self.read_content_length().await? else {
                return Ok(None);
            };
            if len > self.max_frame_bytes {
                bail!(
                    "{CONTENT_LENGTH} {len} exceeds maximum {}",
                    self.max_frame_bytes
                );
            }

            let mut body = vec![0u8; len];
            self.reader
                .read_exact(&mut body)
                .await
                .context("reading frame body")?;
            match serde_json::from_slice(&body) {
                Ok(value) => return Ok(Some(value)),
                Err(e) => {
                    let preview = String::from_utf8_lossy(&body[..body.len().min(200)]);
                    tracing::warn!(error = %e, body = %preview, "Skipping frame with invalid JSON");
                }
            }
        }
    }

    async fn read_content_length(&mut self) -> Result<Option<usize>> {
        let mut content_length = None;
        let mut started = false;

        loop {
            self.line.clear();
            let n = self
                .reader
                .read_line(&mut self.line)
                .await
                .context("reading header line")?;
            if n == 0 {
                if started {
                    bail!("unexpected EOF while reading headers");
                }
                return Ok(None);
            }
            started = true;

            let header = self.line.trim();
            if header.is_empty() {
                break;
            }
            if let Some(len) = parse_header(header)? {
                content_length = Some(len);
            }
        }

        match content_length {
            Some(len) => Ok(Some(len)),
            None => bail!("missing {CONTENT_LENGTH} header"),
        }
    }
}

/// Returns the length for a `Content-Length` header and `None` for any other
/// header (`Content-Type` is accepted and ignored).
fn parse_header(header: &str) -> Result<Option<usize>> {
    let Some((name, value)) = header.split_once(':') else {
        bail!("malformed header line: {header:?}");
    };
    if !name.trim().eq_ignore_ascii_case(CONTENT_LENGTH) {
        return Ok(None);
    }
    let len = value
        .trim()
        .parse()
        .with_context(|| format!("invalid {CONTENT_LENGTH} value {:?}", value.trim()))?;
    Ok(Some(len))
}

pub struct MessageWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn write_message(&mut self, message: &Message) -> Result<()> {
        self.write_value(&message.to_value()).await
    }

    /// Header and body go out in one buffer so a concurrent reader never
    /// sees a header without its body.
    pub async fn write_value(&mut self, value: &Value) -> Result<()> {
        let body = serde_json::to_vec(value).context("serializing JSON-RPC frame")?;
        let mut frame = format!("{CONTENT_LENGTH}: {}\r\n\r\n", body.len()).into_bytes();
        frame.extend_from_slice(&body);

        self.writer
            .write_all(&frame)
            .await
            .context("writing frame")?;
        self.writer.flush().await.context("flushing frame")?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.writer.shutdown().await.context("closing writer")
    }
}
