//! Wire protocols: audio ingress and transcript egress.
//!
//! Both transports carry the same payloads. Ingress is raw little-endian
//! i16 PCM at 16 kHz mono in whatever chunk sizes the client likes; egress
//! is one record per committed word batch — a text line on raw TCP, a JSON
//! message on WebSocket.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;

use verbatim_core::TranscriptSegment;

use crate::SessionError;

pub type WsStream = WebSocketStream<TcpStream>;

/// Pulls raw audio bytes off the transport.
#[async_trait]
pub trait AudioReader: Send {
    /// The next chunk of PCM bytes, or `None` at end of stream.
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, SessionError>;
}

/// Pushes transcript records onto the transport.
#[async_trait]
pub trait RecordWriter: Send {
    async fn send_segment(&mut self, segment: &TranscriptSegment) -> Result<(), SessionError>;

    /// The end-of-stream record. Raw TCP omits it when the flush is empty;
    /// WebSocket always sends it, possibly with empty text.
    async fn send_final(&mut self, segment: &TranscriptSegment) -> Result<(), SessionError>;

    /// One terminal error record.
    async fn send_error(&mut self, kind: &str) -> Result<(), SessionError>;

    /// Transport-level keepalive; a no-op on raw TCP.
    async fn keepalive(&mut self) -> Result<(), SessionError>;

    /// Clean close: FIN on raw TCP, close frame 1000 on WebSocket.
    async fn close(&mut self) -> Result<(), SessionError>;
}

// ---------------------------------------------------------------- raw TCP

pub struct TcpAudioReader {
    half: OwnedReadHalf,
    buf: Vec<u8>,
}

impl TcpAudioReader {
    pub fn new(half: OwnedReadHalf) -> Self {
        Self {
            half,
            buf: vec![0u8; 8192],
        }
    }
}

#[async_trait]
impl AudioReader for TcpAudioReader {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, SessionError> {
        let n = self.half.read(&mut self.buf).await?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(self.buf[..n].to_vec()))
    }
}

pub struct TcpRecordWriter {
    half: OwnedWriteHalf,
}

impl TcpRecordWriter {
    pub fn new(half: OwnedWriteHalf) -> Self {
        Self { half }
    }

    async fn write_line(&mut self, line: &str) -> Result<(), SessionError> {
        self.half.write_all(line.as_bytes()).await?;
        self.half.write_all(b"\n").await?;
        Ok(())
    }
}

#[async_trait]
impl RecordWriter for TcpRecordWriter {
    async fn send_segment(&mut self, segment: &TranscriptSegment) -> Result<(), SessionError> {
        self.write_line(&segment.to_line()).await
    }

    async fn send_final(&mut self, segment: &TranscriptSegment) -> Result<(), SessionError> {
        if segment.text.is_empty() {
            return Ok(());
        }
        self.write_line(&segment.to_line()).await
    }

    async fn send_error(&mut self, kind: &str) -> Result<(), SessionError> {
        self.write_line(&format!("# error {kind}")).await
    }

    async fn keepalive(&mut self) -> Result<(), SessionError> {
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        self.half.shutdown().await?;
        Ok(())
    }
}

// --------------------------------------------------------------- WebSocket

pub struct WsAudioReader {
    stream: SplitStream<WsStream>,
}

impl WsAudioReader {
    pub fn new(stream: SplitStream<WsStream>) -> Self {
        Self { stream }
    }
}

#[async_trait]
impl AudioReader for WsAudioReader {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, SessionError> {
        loop {
            match self.stream.next().await {
                None => return Ok(None),
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => {
                    return Ok(None)
                }
                Some(Err(err)) => return Err(SessionError::WebSocket(err.to_string())),
                Some(Ok(Message::Binary(bytes))) => return Ok(Some(bytes)),
                Some(Ok(Message::Text(text))) => return decode_text_frame(&text).map(Some),
                Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Ok(_)) => continue,
            }
        }
    }
}

/// Browser clients of the original protocol wrap audio in a small JSON
/// envelope instead of a binary frame.
fn decode_text_frame(text: &str) -> Result<Vec<u8>, SessionError> {
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|_| SessionError::Decode("text frame is not JSON".to_string()))?;

    let encoded = value
        .get("audio")
        .and_then(|a| a.as_str())
        .ok_or_else(|| SessionError::Decode("text frame has no audio field".to_string()))?;

    BASE64
        .decode(encoded)
        .map_err(|_| SessionError::Decode("audio field is not base64".to_string()))
}

pub struct WsRecordWriter {
    sink: SplitSink<WsStream, Message>,
}

impl WsRecordWriter {
    pub fn new(sink: SplitSink<WsStream, Message>) -> Self {
        Self { sink }
    }

    async fn send_json(&mut self, value: serde_json::Value) -> Result<(), SessionError> {
        self.sink
            .send(Message::Text(value.to_string()))
            .await
            .map_err(|err| SessionError::WebSocket(err.to_string()))
    }
}

#[async_trait]
impl RecordWriter for WsRecordWriter {
    async fn send_segment(&mut self, segment: &TranscriptSegment) -> Result<(), SessionError> {
        let value = serde_json::to_value(segment)
            .map_err(|err| SessionError::WebSocket(err.to_string()))?;
        self.send_json(value).await
    }

    async fn send_final(&mut self, segment: &TranscriptSegment) -> Result<(), SessionError> {
        self.send_segment(segment).await
    }

    async fn send_error(&mut self, kind: &str) -> Result<(), SessionError> {
        self.send_json(serde_json::json!({ "error": kind })).await
    }

    async fn keepalive(&mut self) -> Result<(), SessionError> {
        self.sink
            .send(Message::Ping(Vec::new()))
            .await
            .map_err(|err| SessionError::WebSocket(err.to_string()))
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        };
        match self.sink.send(Message::Close(Some(frame))).await {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
            Err(err) => Err(SessionError::WebSocket(err.to_string())),
        }
    }
}
