//! Listener and per-connection protocol detection.
//!
//! One TCP listener serves both wire protocols. On accept, the first bytes
//! are peeked without being consumed: an HTTP upgrade preamble naming
//! `Upgrade: websocket` switches the connection to WebSocket, anything else
//! is the head of a raw PCM stream.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use uuid::Uuid;

use verbatim_config::Settings;
use verbatim_pipeline::{OnlineEngine, Transcriber};

use crate::protocol::{TcpAudioReader, TcpRecordWriter, WsAudioReader, WsRecordWriter};
use crate::session::{run_session, SessionParams};
use crate::SessionError;

/// How long a half-written HTTP preamble may dribble in before we give up
/// and treat the connection as PCM.
const DETECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Preamble inspection window.
const DETECT_LIMIT: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Detected {
    WebSocket,
    RawPcm,
}

/// The stream server: one listening socket, one session per connection.
pub struct StreamServer {
    listener: TcpListener,
    settings: Arc<Settings>,
    transcriber: Arc<dyn Transcriber>,
    active: Arc<AtomicUsize>,
}

impl StreamServer {
    /// Bind the listener. The recognizer is loaded by the caller and shared
    /// by every session.
    pub async fn bind(
        settings: Settings,
        transcriber: Arc<dyn Transcriber>,
    ) -> std::io::Result<Self> {
        let listener =
            TcpListener::bind((settings.server.host.as_str(), settings.server.port)).await?;
        Ok(Self {
            listener,
            settings: Arc::new(settings),
            transcriber,
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept loop; returns when `shutdown` resolves.
    pub async fn run(self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("shutdown requested; no longer accepting");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let active = self.active.load(Ordering::SeqCst);
                        if active >= self.settings.server.max_connections {
                            tracing::warn!(%peer, active, "connection limit reached; refusing");
                            continue;
                        }
                        tokio::spawn(handle_connection(
                            stream,
                            peer,
                            self.settings.clone(),
                            self.transcriber.clone(),
                            self.active.clone(),
                        ));
                    }
                    Err(err) => tracing::warn!(error = %err, "accept failed"),
                },
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    settings: Arc<Settings>,
    transcriber: Arc<dyn Transcriber>,
    active: Arc<AtomicUsize>,
) {
    active.fetch_add(1, Ordering::SeqCst);

    if let Err(err) = serve_connection(stream, peer, &settings, transcriber).await {
        tracing::debug!(%peer, error = %err, "connection ended abnormally");
    }

    active.fetch_sub(1, Ordering::SeqCst);
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    settings: &Settings,
    transcriber: Arc<dyn Transcriber>,
) -> Result<(), SessionError> {
    stream.set_nodelay(true).ok();

    let id = Uuid::new_v4();
    let engine = OnlineEngine::new(
        transcriber,
        settings.engine.clone(),
        settings.vad.clone(),
        settings.asr.language_option().map(str::to_string),
    );
    let params = SessionParams::from(&settings.engine);

    match detect_protocol(&stream).await? {
        Detected::WebSocket => {
            tracing::info!(session = %id, %peer, "websocket client connected");
            let ws = tokio_tungstenite::accept_async(stream)
                .await
                .map_err(|err| SessionError::WebSocket(err.to_string()))?;
            let (sink, source) = ws.split();
            run_session(
                id,
                engine,
                Box::new(WsAudioReader::new(source)),
                Box::new(WsRecordWriter::new(sink)),
                params,
            )
            .await;
        }
        Detected::RawPcm => {
            tracing::info!(session = %id, %peer, "tcp client connected");
            let (read, write) = stream.into_split();
            run_session(
                id,
                engine,
                Box::new(TcpAudioReader::new(read)),
                Box::new(TcpRecordWriter::new(write)),
                params,
            )
            .await;
        }
    }

    Ok(())
}

/// Peek the preamble without consuming it.
///
/// Bytes that do not look like an HTTP request line settle the question
/// immediately; otherwise we wait, bounded, for the header terminator.
async fn detect_protocol(stream: &TcpStream) -> Result<Detected, SessionError> {
    let mut buf = [0u8; DETECT_LIMIT];
    let deadline = Instant::now() + DETECT_TIMEOUT;

    loop {
        let n = stream.peek(&mut buf).await?;
        if n == 0 {
            // Peer closed before sending anything; the session will see EOF.
            return Ok(Detected::RawPcm);
        }

        let head = &buf[..n];
        if !is_http_prefix(head) {
            return Ok(Detected::RawPcm);
        }

        if contains_header_end(head) || n == DETECT_LIMIT {
            return Ok(if has_websocket_upgrade(head) {
                Detected::WebSocket
            } else {
                Detected::RawPcm
            });
        }

        if Instant::now() >= deadline {
            return Ok(Detected::RawPcm);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn is_http_prefix(head: &[u8]) -> bool {
    const VERB: &[u8] = b"GET ";
    let n = head.len().min(VERB.len());
    head[..n] == VERB[..n]
}

fn contains_header_end(head: &[u8]) -> bool {
    head.windows(4).any(|w| w == b"\r\n\r\n")
}

fn has_websocket_upgrade(head: &[u8]) -> bool {
    let text = String::from_utf8_lossy(head);
    text.lines().any(|line| {
        let lower = line.to_ascii_lowercase();
        lower.starts_with("upgrade:") && lower.contains("websocket")
    })
}
