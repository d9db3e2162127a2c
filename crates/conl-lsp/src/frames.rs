//! The base-protocol frame codec.
//!
//! Messages are JSON-RPC 2.0 bodies framed by MIME-style headers:
//!
//! ```text
//! Content-Length: 52\r\n
//! \r\n
//! {"jsonrpc":"2.0","id":1,"method":"shutdown"}
//! ```
//!
//! Header keys are case-insensitive; only `Content-Length` matters and
//! it is required. Ids and payloads are kept as raw JSON so that a
//! response echoes the client's id byte-for-byte.

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tracing::{trace, warn};

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("missing Content-Length header")]
    MissingContentLength,
    #[error("invalid Content-Length `{0}`")]
    InvalidContentLength(String),
    #[error("unexpected end of stream")]
    UnexpectedEof,
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One JSON-RPC message. A request has `method` and `id`, a
/// notification just `method`, a response `id` and one of
/// `result`/`error`.
#[derive(Debug, Serialize, Deserialize)]
pub struct Frame {
    #[serde(default = "default_jsonrpc")]
    pub jsonrpc: String,
    /// `None` only when the field is absent; an explicit `"id": null`
    /// decodes to the raw text `null`, which JSON-RPC treats as a
    /// present id.
    #[serde(
        default,
        deserialize_with = "raw_if_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<Box<RawValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(
        default,
        deserialize_with = "raw_if_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub params: Option<Box<RawValue>>,
    #[serde(
        default,
        deserialize_with = "raw_if_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<Box<RawValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
    /// Set when the payload was a JSON array. Never serialized; the
    /// connection rejects batches outright.
    #[serde(skip)]
    pub batch: Option<Vec<Frame>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: i64,
    pub message: String,
}

fn default_jsonrpc() -> String {
    "2.0".to_string()
}

// Only invoked when the field is present, so a literal `null` survives
// as the raw text "null" instead of collapsing into `None`.
fn raw_if_present<'de, D>(deserializer: D) -> Result<Option<Box<RawValue>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Box::<RawValue>::deserialize(deserializer).map(Some)
}

impl Default for Frame {
    fn default() -> Frame {
        Frame {
            jsonrpc: default_jsonrpc(),
            id: None,
            method: None,
            params: None,
            result: None,
            error: None,
            batch: None,
        }
    }
}

impl Frame {
    pub fn notification(method: &str, params: &impl Serialize) -> serde_json::Result<Frame> {
        Ok(Frame {
            method: Some(method.to_string()),
            params: Some(serde_json::value::to_raw_value(params)?),
            ..Frame::default()
        })
    }

    pub fn response(id: Box<RawValue>, result: Box<RawValue>) -> Frame {
        Frame {
            id: Some(id),
            result: Some(result),
            ..Frame::default()
        }
    }

    /// An error response. `id` of `None` becomes JSON `null`, as the
    /// protocol requires when the request's id was unusable.
    pub fn error_response(id: Option<Box<RawValue>>, code: i64, message: impl Into<String>) -> Frame {
        Frame {
            id: Some(id.unwrap_or_else(null_id)),
            error: Some(ResponseError {
                code,
                message: message.into(),
            }),
            ..Frame::default()
        }
    }
}

fn null_id() -> Box<RawValue> {
    serde_json::value::to_raw_value(&serde_json::Value::Null).expect("null is valid JSON")
}

/// Serialize a frame with its `Content-Length` header.
pub fn encode(frame: &Frame) -> serde_json::Result<Vec<u8>> {
    let body = serde_json::to_vec(frame)?;
    let mut out = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
    out.extend_from_slice(&body);
    Ok(out)
}

/// Parse a frame body. A payload whose first byte is `[` is a batch;
/// it parses into an otherwise-empty frame carrying the member frames.
pub fn decode(payload: &[u8]) -> Result<Frame, FrameError> {
    let first = payload.iter().find(|b| !b.is_ascii_whitespace());
    if first == Some(&b'[') {
        let batch: Vec<Frame> = serde_json::from_slice(payload)?;
        return Ok(Frame {
            batch: Some(batch),
            ..Frame::default()
        });
    }
    Ok(serde_json::from_slice(payload)?)
}

/// Reads frames off a buffered stream.
pub struct FrameReader<R> {
    reader: R,
    done: bool,
}

impl<R: AsyncBufRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> FrameReader<R> {
        FrameReader {
            reader,
            done: false,
        }
    }

    /// The next frame, or `None` at a clean end of stream.
    ///
    /// A [`FrameError::Json`] leaves the stream aligned (the payload
    /// was fully consumed) and reading may continue; any other error
    /// ends the stream.
    pub async fn next(&mut self) -> Result<Option<Frame>, FrameError> {
        if self.done {
            return Ok(None);
        }
        match self.read_frame().await {
            Ok(frame) => Ok(frame),
            Err(err) => {
                if !matches!(err, FrameError::Json(_)) {
                    self.done = true;
                }
                Err(err)
            }
        }
    }

    async fn read_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        let mut content_length: Option<usize> = None;
        let mut line = Vec::new();
        let mut at_start = true;
        loop {
            line.clear();
            let n = self.reader.read_until(b'\n', &mut line).await?;
            if n == 0 {
                if at_start {
                    return Ok(None);
                }
                return Err(FrameError::UnexpectedEof);
            }
            at_start = false;
            let text = String::from_utf8_lossy(&line);
            let text = text.trim_end_matches(['\r', '\n']);
            if text.is_empty() {
                break;
            }
            if let Some((key, value)) = text.split_once(':') {
                if key.trim().eq_ignore_ascii_case("content-length") {
                    let value = value.trim();
                    content_length = Some(
                        value
                            .parse()
                            .map_err(|_| FrameError::InvalidContentLength(value.to_string()))?,
                    );
                }
            }
        }
        let len = content_length.ok_or(FrameError::MissingContentLength)?;
        let mut payload = vec![0u8; len];
        self.reader.read_exact(&mut payload).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::UnexpectedEof {
                FrameError::UnexpectedEof
            } else {
                FrameError::Io(err)
            }
        })?;
        trace!(direction = "recv", len, "frame");
        decode(&payload).map(Some)
    }
}

/// Drains the outbound channel onto the wire. Exactly one writer task
/// runs per connection, so frames are never interleaved.
pub struct FrameWriter<W> {
    writer: W,
    rx: mpsc::UnboundedReceiver<Frame>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W, rx: mpsc::UnboundedReceiver<Frame>) -> FrameWriter<W> {
        FrameWriter { writer, rx }
    }

    /// Runs until the channel closes or `cancel` fires, then drains
    /// whatever is already queued and shuts the stream down.
    pub async fn run(mut self, mut cancel: watch::Receiver<bool>) -> std::io::Result<()> {
        loop {
            tokio::select! {
                _ = cancel.changed() => break,
                frame = self.rx.recv() => match frame {
                    Some(frame) => self.write(frame).await?,
                    None => return self.writer.shutdown().await,
                },
            }
        }
        while let Ok(frame) = self.rx.try_recv() {
            self.write(frame).await?;
        }
        self.writer.shutdown().await
    }

    async fn write(&mut self, frame: Frame) -> std::io::Result<()> {
        let bytes = match encode(&frame) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!("dropping unserializable frame: {err}");
                return Ok(());
            }
        };
        trace!(direction = "send", len = bytes.len(), "frame");
        self.writer.write_all(&bytes).await?;
        self.writer.flush().await
    }
}
