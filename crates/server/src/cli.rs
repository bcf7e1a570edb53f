//! Command-line flags.
//!
//! Flags are the highest-priority settings layer, applied over whatever the
//! config file and environment provided.

use clap::Parser;

use verbatim_config::{AsrBackend, Settings, TrimPolicy};

/// Streaming speech-to-text server
#[derive(Parser, Debug, Default)]
#[command(name = "verbatim-server", version, about = "Streaming speech-to-text server")]
pub struct Cli {
    /// Path to a configuration file
    #[arg(long, value_name = "PATH")]
    pub config: Option<String>,

    /// Listen host
    #[arg(long, value_name = "HOST")]
    pub host: Option<String>,

    /// Listen port for the audio stream protocol
    #[arg(long, value_name = "PORT")]
    pub port: Option<u16>,

    /// Recognizer backend: cpu, cuda, metal, api, or stub
    #[arg(long, value_name = "BACKEND")]
    pub backend: Option<String>,

    /// Model path (local backends) or model name (api backend)
    #[arg(long, value_name = "MODEL")]
    pub model: Option<String>,

    /// ISO language code, or "auto" to autodetect
    #[arg(long, value_name = "LANG")]
    pub language: Option<String>,

    /// Minimum new audio before a recognition pass, in seconds
    #[arg(long = "min-chunk-size", value_name = "SECONDS")]
    pub min_chunk_size: Option<f64>,

    /// Buffer trimming policy: segment or sentence
    #[arg(long = "buffer-trimming", value_name = "POLICY")]
    pub buffer_trimming: Option<String>,

    /// Voice activity detection: on or off
    #[arg(long, value_name = "ON|OFF")]
    pub vad: Option<String>,

    /// WAV file transcribed once at startup to warm the recognizer up
    #[arg(long = "warmup-file", value_name = "PATH")]
    pub warmup_file: Option<String>,

    /// Port for the /health and /metrics endpoints
    #[arg(long = "metrics-port", value_name = "PORT")]
    pub metrics_port: Option<u16>,
}

impl Cli {
    /// Fold the flags into the settings tree.
    pub fn apply(&self, settings: &mut Settings) -> Result<(), String> {
        if let Some(host) = &self.host {
            settings.server.host = host.clone();
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(backend) = &self.backend {
            settings.asr.backend = AsrBackend::parse(backend)
                .ok_or_else(|| format!("unknown backend '{backend}'"))?;
        }
        if let Some(model) = &self.model {
            settings.asr.model = model.clone();
        }
        if let Some(language) = &self.language {
            settings.asr.language = language.clone();
        }
        if let Some(min_chunk) = self.min_chunk_size {
            settings.engine.min_chunk_secs = min_chunk;
        }
        if let Some(policy) = &self.buffer_trimming {
            settings.engine.trimming = match policy.as_str() {
                "segment" => TrimPolicy::Segment,
                "sentence" => TrimPolicy::Sentence,
                other => return Err(format!("unknown trimming policy '{other}'")),
            };
        }
        if let Some(vad) = &self.vad {
            settings.vad.enabled = match vad.as_str() {
                "on" => true,
                "off" => false,
                other => return Err(format!("--vad takes 'on' or 'off', got '{other}'")),
            };
        }
        if let Some(warmup) = &self.warmup_file {
            settings.asr.warmup_file = Some(warmup.clone());
        }
        if let Some(port) = self.metrics_port {
            settings.observability.metrics_port = port;
        }
        Ok(())
    }
}
