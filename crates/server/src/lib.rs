//! Streaming speech-to-text server.
//!
//! Accepts raw-PCM TCP and WebSocket clients on one listening port, runs one
//! session per connection around the online engine, and serves observability
//! endpoints on a separate port.

pub mod cli;
pub mod observability;
pub mod protocol;
pub mod server;
pub mod session;

pub use server::StreamServer;

use thiserror::Error;

use verbatim_pipeline::AsrError;

/// Session-level errors.
///
/// Transient recognizer failures never appear here; they are absorbed inside
/// the engine. Everything below ends the session.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Peer or socket failure. The session ends without a terminal record;
    /// there is nobody left to read it.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The client sent something that is not the PCM stream we expect.
    #[error("malformed audio payload: {0}")]
    Decode(String),

    /// WebSocket protocol failure.
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// The recognizer cannot serve this session at all.
    #[error(transparent)]
    Recognizer(#[from] AsrError),
}

impl SessionError {
    /// The `<kind>` token used in terminal error records.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::Transport(_) => "transport",
            SessionError::Decode(_) => "decode",
            SessionError::WebSocket(_) => "transport",
            SessionError::Recognizer(_) => "recognizer_unavailable",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds_match_the_wire_tokens() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        assert_eq!(SessionError::Transport(io).kind(), "transport");
        assert_eq!(SessionError::Decode("bad".into()).kind(), "decode");
        assert_eq!(SessionError::WebSocket("bad".into()).kind(), "transport");
        assert_eq!(
            SessionError::Recognizer(AsrError::Unavailable("down".into())).kind(),
            "recognizer_unavailable"
        );
    }
}
