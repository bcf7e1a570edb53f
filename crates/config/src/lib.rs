//! Configuration for the verbatim streaming transcription server.
//!
//! Settings are layered, lowest priority first: built-in defaults, an
//! optional config file, `VERBATIM_`-prefixed environment variables (with
//! `__` separating nested keys, e.g. `VERBATIM_SERVER__PORT`), and finally
//! command-line flags applied by the server binary.

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

/// Main application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Stream server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Online engine configuration
    #[serde(default)]
    pub engine: EngineConfig,

    /// Voice activity detection configuration
    #[serde(default)]
    pub vad: VadConfig,

    /// Recognizer configuration
    #[serde(default)]
    pub asr: AsrConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate settings after all layers are applied.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.min_chunk_secs <= 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "engine.min_chunk_secs".to_string(),
                message: "must be positive".to_string(),
            });
        }

        if self.engine.max_wait_secs < self.engine.min_chunk_secs {
            return Err(ConfigError::InvalidValue {
                field: "engine.max_wait_secs".to_string(),
                message: "must be at least min_chunk_secs".to_string(),
            });
        }

        if self.engine.buffer_cap_secs <= self.engine.trim_margin_secs {
            return Err(ConfigError::InvalidValue {
                field: "engine.buffer_cap_secs".to_string(),
                message: "must exceed trim_margin_secs".to_string(),
            });
        }

        if self.vad.min_silence_secs <= 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "vad.min_silence_secs".to_string(),
                message: "must be positive".to_string(),
            });
        }

        Ok(())
    }
}

/// Stream server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen host
    #[serde(default = "default_host")]
    pub host: String,

    /// Listen port for the audio stream protocol
    #[serde(default = "default_port")]
    pub port: u16,

    /// Maximum concurrent client sessions
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    43007
}
fn default_max_connections() -> usize {
    64
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_connections: default_max_connections(),
        }
    }
}

/// Buffer-trimming policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrimPolicy {
    /// Cut at VAD silence boundaries inside the committed region
    Segment,
    /// Cut only at completed-sentence boundaries of the committed text
    Sentence,
}

/// Online engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Minimum new audio before a recognition pass (seconds)
    #[serde(default = "default_min_chunk")]
    pub min_chunk_secs: f64,

    /// Maximum wall time between recognition passes while audio is buffered
    #[serde(default = "default_max_wait")]
    pub max_wait_secs: f64,

    /// Hard cap on the audio buffer (seconds)
    #[serde(default = "default_buffer_cap")]
    pub buffer_cap_secs: f64,

    /// Working tail kept when the cap forces a mid-utterance cut (seconds)
    #[serde(default = "default_trim_margin")]
    pub trim_margin_secs: f64,

    /// Where trim points come from
    #[serde(default = "default_trim_policy")]
    pub trimming: TrimPolicy,

    /// Committed-text suffix passed to the recognizer as context (characters)
    #[serde(default = "default_prompt_chars")]
    pub prompt_chars: usize,
}

fn default_min_chunk() -> f64 {
    1.0
}
fn default_max_wait() -> f64 {
    3.0
}
fn default_buffer_cap() -> f64 {
    30.0
}
fn default_trim_margin() -> f64 {
    5.0
}
fn default_trim_policy() -> TrimPolicy {
    TrimPolicy::Segment
}
fn default_prompt_chars() -> usize {
    200
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_chunk_secs: default_min_chunk(),
            max_wait_secs: default_max_wait(),
            buffer_cap_secs: default_buffer_cap(),
            trim_margin_secs: default_trim_margin(),
            trimming: default_trim_policy(),
            prompt_chars: default_prompt_chars(),
        }
    }
}

/// Voice activity detection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VadConfig {
    /// Enable the VAD gate
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Analysis frame length (milliseconds)
    #[serde(default = "default_frame_ms")]
    pub frame_ms: u32,

    /// Frames with RMS below this level are silence (dBFS)
    #[serde(default = "default_energy_floor")]
    pub energy_floor_db: f32,

    /// Silence runs shorter than this are merged into speech (seconds)
    #[serde(default = "default_min_silence")]
    pub min_silence_secs: f64,
}

fn default_true() -> bool {
    true
}
fn default_frame_ms() -> u32 {
    30
}
fn default_energy_floor() -> f32 {
    -45.0
}
fn default_min_silence() -> f64 {
    0.5
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            frame_ms: default_frame_ms(),
            energy_floor_db: default_energy_floor(),
            min_silence_secs: default_min_silence(),
        }
    }
}

/// Recognizer backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AsrBackend {
    /// whisper.cpp on CPU
    Cpu,
    /// whisper.cpp with CUDA offload
    Cuda,
    /// whisper.cpp with Metal offload (Apple Silicon)
    Metal,
    /// OpenAI-compatible transcription API
    Api,
    /// Deterministic stub for smoke runs and tests
    Stub,
}

impl AsrBackend {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "cpu" => Some(Self::Cpu),
            "cuda" => Some(Self::Cuda),
            "metal" => Some(Self::Metal),
            "api" => Some(Self::Api),
            "stub" => Some(Self::Stub),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Cuda => "cuda",
            Self::Metal => "metal",
            Self::Api => "api",
            Self::Stub => "stub",
        }
    }
}

/// Recognizer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsrConfig {
    /// Backend variant
    #[serde(default = "default_backend")]
    pub backend: AsrBackend,

    /// Model path (local backends) or model name (API backend)
    #[serde(default = "default_model")]
    pub model: String,

    /// ISO language code, or "auto" to let the recognizer detect
    #[serde(default = "default_language")]
    pub language: String,

    /// Optional WAV file transcribed once at startup so the first client
    /// chunk is not slowed down by model warm-up
    #[serde(default)]
    pub warmup_file: Option<String>,
}

fn default_backend() -> AsrBackend {
    AsrBackend::Cpu
}
fn default_model() -> String {
    "models/ggml-base.bin".to_string()
}
fn default_language() -> String {
    "auto".to_string()
}

impl AsrConfig {
    /// The language option as the recognizer adapter expects it.
    pub fn language_option(&self) -> Option<&str> {
        if self.language == "auto" {
            None
        } else {
            Some(&self.language)
        }
    }
}

impl Default for AsrConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            model: default_model(),
            language: default_language(),
            warmup_file: None,
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level used when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON log lines
    #[serde(default)]
    pub log_json: bool,

    /// Serve /health and /metrics
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,

    /// Port for the observability endpoints
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_metrics_port() -> u16 {
    9090
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_json: false,
            metrics_enabled: true,
            metrics_port: default_metrics_port(),
        }
    }
}

/// Load settings from an optional config file and the environment.
///
/// Priority (highest to lowest):
/// 1. Environment variables (`VERBATIM_` prefix, `__` key separator)
/// 2. The given config file, if any
pub fn load_settings(file: Option<&str>) -> Result<Settings, ConfigError> {
    let mut builder = Config::builder();

    if let Some(path) = file {
        builder = builder.add_source(File::with_name(path).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix("VERBATIM")
            .separator("__")
            .try_parsing(true),
    );

    let settings: Settings = builder.build()?.try_deserialize()?;
    settings.validate()?;

    Ok(settings)
}
