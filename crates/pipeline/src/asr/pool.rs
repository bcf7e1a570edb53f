//! Process-wide recognizer call discipline.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Semaphore};

use verbatim_core::Hypothesis;

use super::{AsrError, Capabilities, Transcriber};

/// Bounds in-flight recognizer calls across all sessions.
///
/// The recognizer call is the only CPU/GPU-heavy step in an engine tick, so
/// at most one call per CPU core runs at a time; excess sessions queue on the
/// semaphore. Backends that do not advertise concurrent safety are
/// additionally serialized on a single lock.
pub struct PooledTranscriber {
    inner: Arc<dyn Transcriber>,
    permits: Semaphore,
    serialize: Option<Mutex<()>>,
}

impl PooledTranscriber {
    pub fn new(inner: Arc<dyn Transcriber>) -> Self {
        Self::with_permits(inner, num_cpus::get().max(1))
    }

    pub fn with_permits(inner: Arc<dyn Transcriber>, permits: usize) -> Self {
        let serialize = if inner.capabilities().concurrent_safe {
            None
        } else {
            Some(Mutex::new(()))
        };
        Self {
            inner,
            permits: Semaphore::new(permits.max(1)),
            serialize,
        }
    }
}

#[async_trait]
impl Transcriber for PooledTranscriber {
    async fn transcribe(
        &self,
        audio: &[f32],
        prompt: &str,
        language: Option<&str>,
    ) -> Result<Hypothesis, AsrError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| AsrError::Unavailable("recognizer pool is closed".to_string()))?;

        let _guard = match &self.serialize {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };

        self.inner.transcribe(audio, prompt, language).await
    }

    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }
}
