//! End-to-end tests against a real listener with a scripted recognizer.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

use verbatim_config::Settings;
use verbatim_core::{Hypothesis, Word, SAMPLE_RATE};
use verbatim_pipeline::{AsrError, Capabilities, Transcriber};
use verbatim_server::StreamServer;

const WAIT: Duration = Duration::from_secs(10);

#[derive(Clone)]
enum Script {
    Words(Vec<Word>),
    Down,
}

/// Replays one scripted hypothesis per call; the last entry repeats.
struct ScriptedTranscriber {
    calls: AtomicUsize,
    scripts: Vec<Script>,
}

impl ScriptedTranscriber {
    fn new(scripts: Vec<Script>) -> Self {
        assert!(!scripts.is_empty());
        Self {
            calls: AtomicUsize::new(0),
            scripts,
        }
    }
}

#[async_trait]
impl Transcriber for ScriptedTranscriber {
    async fn transcribe(
        &self,
        _audio: &[f32],
        _prompt: &str,
        _language: Option<&str>,
    ) -> Result<Hypothesis, AsrError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let index = call.min(self.scripts.len() - 1);
        match &self.scripts[index] {
            Script::Words(words) => Ok(words.clone()),
            Script::Down => Err(AsrError::Unavailable("backend down".to_string())),
        }
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            concurrent_safe: true,
            ..Capabilities::default()
        }
    }
}

fn word(start: f64, end: f64, text: &str) -> Word {
    Word::new(start, end, text)
}

fn two_utterance_scripts() -> Vec<Script> {
    let hello = vec![word(0.2, 0.6, "Hello"), word(0.7, 1.2, "world")];
    let mut both = hello.clone();
    both.push(word(2.5, 3.0, "goodbye"));
    both.push(word(3.05, 3.6, "world"));

    vec![
        Script::Words(hello.clone()),
        Script::Words(hello),
        Script::Words(both.clone()),
        Script::Words(both),
    ]
}

async fn spawn_server(scripts: Vec<Script>) -> (SocketAddr, oneshot::Sender<()>) {
    let mut settings = Settings::default();
    settings.server.host = "127.0.0.1".to_string();
    settings.server.port = 0;
    settings.vad.enabled = false;
    settings.observability.metrics_enabled = false;

    let transcriber: Arc<dyn Transcriber> = Arc::new(ScriptedTranscriber::new(scripts));
    let server = StreamServer::bind(settings, transcriber).await.unwrap();
    let addr = server.local_addr().unwrap();

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    tokio::spawn(server.run(async move {
        let _ = shutdown_rx.await;
    }));

    (addr, shutdown_tx)
}

/// One second of constant-amplitude PCM.
fn pcm_second(amplitude: f32) -> Vec<u8> {
    let value = (amplitude * 32767.0) as i16;
    let mut bytes = Vec::with_capacity(SAMPLE_RATE as usize * 2);
    for _ in 0..SAMPLE_RATE {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn parse_line(line: &str) -> (u64, u64, String) {
    let mut parts = line.splitn(3, ' ');
    let start = parts.next().unwrap().parse().unwrap();
    let end = parts.next().unwrap().parse().unwrap();
    let text = parts.next().unwrap_or("").to_string();
    (start, end, text)
}

#[tokio::test]
async fn tcp_session_commits_two_utterances_in_order() {
    let (addr, _shutdown) = spawn_server(two_utterance_scripts()).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    for _ in 0..4 {
        stream.write_all(&pcm_second(0.3)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let line1 = timeout(WAIT, lines.next_line()).await.unwrap().unwrap().unwrap();
    let (start1, end1, text1) = parse_line(&line1);
    assert_eq!(text1, "Hello world");
    assert_eq!(start1, 200);
    assert_eq!(end1, 1200);

    let line2 = timeout(WAIT, lines.next_line()).await.unwrap().unwrap().unwrap();
    let (start2, end2, text2) = parse_line(&line2);
    assert_eq!(text2, "goodbye world");
    assert!(end1 <= start2);
    assert!(start2 <= end2);

    // Close the stream: nothing is pending, so a clean FIN follows with no
    // extra line.
    write_half.shutdown().await.unwrap();
    let eof = timeout(WAIT, lines.next_line()).await.unwrap().unwrap();
    assert!(eof.is_none());
}

#[tokio::test]
async fn websocket_upgrade_on_the_same_port_speaks_json() {
    let (addr, _shutdown) = spawn_server(two_utterance_scripts()).await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let (mut ws, _response) = tokio_tungstenite::client_async("ws://localhost/", stream)
        .await
        .unwrap();

    ws.send(Message::Binary(pcm_second(0.3))).await.unwrap();
    ws.send(Message::Binary(pcm_second(0.3))).await.unwrap();

    // First record arrives as a JSON text message.
    let record = timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => break text,
                Some(Ok(_)) => continue,
                other => panic!("websocket ended early: {other:?}"),
            }
        }
    })
    .await
    .unwrap();

    let value: serde_json::Value = serde_json::from_str(&record).unwrap();
    assert_eq!(value["text"], "Hello world");
    assert_eq!(value["start"], 200);
    assert_eq!(value["end"], 1200);

    // Client-side close: the server flushes a final (possibly empty) record
    // and answers the close handshake.
    ws.close(None).await.unwrap();
    let mut saw_final = false;
    while let Ok(Some(message)) = timeout(WAIT, ws.next()).await {
        match message {
            Ok(Message::Text(text)) => {
                let value: serde_json::Value = serde_json::from_str(&text).unwrap();
                assert!(value.get("text").is_some());
                saw_final = true;
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        }
    }
    assert!(saw_final);
}

#[tokio::test]
async fn zero_audio_then_close_is_clean() {
    let (addr, _shutdown) = spawn_server(vec![Script::Words(Vec::new())]).await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    write_half.shutdown().await.unwrap();

    let mut lines = BufReader::new(read_half).lines();
    let eof = timeout(WAIT, lines.next_line()).await.unwrap().unwrap();
    assert!(eof.is_none());
}

#[tokio::test]
async fn idle_session_emits_nothing_until_close() {
    let (addr, _shutdown) = spawn_server(vec![Script::Words(Vec::new())]).await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    // Connected but silent: no records, no errors.
    tokio::time::sleep(Duration::from_millis(800)).await;
    write_half.shutdown().await.unwrap();

    let eof = timeout(WAIT, lines.next_line()).await.unwrap().unwrap();
    assert!(eof.is_none());
}

#[tokio::test]
async fn backend_down_ends_sessions_but_not_the_server() {
    let (addr, _shutdown) = spawn_server(vec![Script::Down]).await;

    for _ in 0..2 {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        // The session may already be closing on the error while this write is
        // in flight; a failed write here is expected, not a test failure.
        let mut audio = pcm_second(0.3);
        audio.extend(pcm_second(0.3));
        let _ = stream.write_all(&audio).await;

        let (read_half, _write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        let line = timeout(WAIT, lines.next_line()).await.unwrap().unwrap().unwrap();
        assert_eq!(line, "# error recognizer_unavailable");

        let eof = timeout(WAIT, lines.next_line()).await.unwrap().unwrap();
        assert!(eof.is_none());
    }
}

#[tokio::test]
async fn identical_hypotheses_produce_no_duplicate_records() {
    let hello = vec![word(0.2, 0.6, "Hello"), word(0.7, 1.2, "world")];
    let (addr, _shutdown) = spawn_server(vec![Script::Words(hello)]).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    // Feed well past the utterance; the recognizer keeps answering with the
    // same hypothesis.
    for _ in 0..4 {
        stream.write_all(&pcm_second(0.3)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let line = timeout(WAIT, lines.next_line()).await.unwrap().unwrap().unwrap();
    let (_, _, text) = parse_line(&line);
    assert_eq!(text, "Hello world");

    write_half.shutdown().await.unwrap();
    let eof = timeout(WAIT, lines.next_line()).await.unwrap().unwrap();
    assert!(eof.is_none());
}
