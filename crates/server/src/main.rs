//! verbatim server entry point.

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use verbatim_config::{load_settings, ObservabilityConfig};
use verbatim_core::SAMPLE_RATE;
use verbatim_pipeline::{create_transcriber, Transcriber};
use verbatim_server::cli::Cli;
use verbatim_server::{observability, StreamServer};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut settings = match load_settings(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return ExitCode::from(2);
        }
    };
    if let Err(err) = cli.apply(&mut settings) {
        eprintln!("invalid flag: {err}");
        return ExitCode::from(2);
    }
    if let Err(err) = settings.validate() {
        eprintln!("configuration error: {err}");
        return ExitCode::from(2);
    }

    init_tracing(&settings.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting verbatim");

    if settings.observability.metrics_enabled {
        let handle = observability::init_metrics();
        let host = settings.server.host.clone();
        let port = settings.observability.metrics_port;
        tokio::spawn(async move {
            if let Err(err) = observability::serve(&host, port, handle).await {
                tracing::warn!(error = %err, "observability endpoints failed");
            }
        });
    }

    let transcriber = match create_transcriber(&settings.asr) {
        Ok(transcriber) => transcriber,
        Err(err) => {
            tracing::error!(error = %err, "cannot initialize the recognizer");
            return ExitCode::from(2);
        }
    };

    if let Some(path) = settings.asr.warmup_file.clone() {
        if let Err(code) = warm_up(
            &path,
            transcriber.as_ref(),
            settings.asr.language_option(),
        )
        .await
        {
            return code;
        }
    } else {
        tracing::warn!("no warmup file; the first chunk of the first session may be slow");
    }

    let server = match StreamServer::bind(settings, transcriber).await {
        Ok(server) => server,
        Err(err) => {
            tracing::error!(error = %err, "cannot bind the stream listener");
            return ExitCode::from(1);
        }
    };
    if let Ok(addr) = server.local_addr() {
        tracing::info!(%addr, "listening");
    }

    server.run(shutdown_signal()).await;
    tracing::info!("server shutdown complete");
    ExitCode::SUCCESS
}

fn init_tracing(config: &ObservabilityConfig) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));

    let fmt_layer = if config.log_json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

/// The very first recognizer call pays model warm-up costs; run one over a
/// short clip at startup so no client does.
async fn warm_up(
    path: &str,
    transcriber: &dyn Transcriber,
    language: Option<&str>,
) -> Result<(), ExitCode> {
    let samples = match load_wav_chunk(path, 2.0) {
        Ok(samples) => samples,
        Err(err) => {
            tracing::error!(%path, error = %err, "cannot read warmup file");
            return Err(ExitCode::from(2));
        }
    };

    match transcriber.transcribe(&samples, "", language).await {
        Ok(_) => tracing::info!("recognizer warmed up"),
        Err(err) => tracing::warn!(error = %err, "warmup transcription failed"),
    }
    Ok(())
}

fn load_wav_chunk(path: &str, secs: f64) -> Result<Vec<f32>, String> {
    let mut reader = hound::WavReader::open(path).map_err(|e| e.to_string())?;
    let spec = reader.spec();
    if spec.channels != 1 || spec.sample_rate != SAMPLE_RATE {
        return Err(format!("warmup file must be {SAMPLE_RATE} Hz mono"));
    }

    let limit = (secs * spec.sample_rate as f64) as usize;
    match spec.sample_format {
        hound::SampleFormat::Int => reader
            .samples::<i16>()
            .take(limit)
            .map(|s| s.map(|v| v as f32 / 32768.0))
            .collect::<Result<_, _>>()
            .map_err(|e| e.to_string()),
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .take(limit)
            .collect::<Result<_, _>>()
            .map_err(|e| e.to_string()),
    }
}

/// Wait for ctrl-c or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received ctrl-c; shutting down"),
        _ = terminate => tracing::info!("received SIGTERM; shutting down"),
    }
}
