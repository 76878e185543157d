use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use sitegen_core::FileBundle;

use crate::backend::GenerationBackend;
use crate::error::BackendError;

/// A recorded call made against a [`ScriptedBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptedCall {
    pub prompt: String,
    pub existing_files: Option<FileBundle>,
}

/// In-memory backend for tests/dev.
///
/// Replays scripted outcomes in order; once the script is exhausted every call
/// returns the fallback outcome. Every call is recorded.
#[derive(Debug)]
pub struct ScriptedBackend {
    script: Mutex<VecDeque<Result<FileBundle, BackendError>>>,
    fallback: Result<FileBundle, BackendError>,
    delay: Option<Duration>,
    calls: Mutex<Vec<ScriptedCall>>,
}

impl ScriptedBackend {
    /// Always answer with `files`.
    pub fn succeeding(files: FileBundle) -> Self {
        Self::with_fallback(Ok(files))
    }

    /// Always fail with `error`.
    pub fn failing(error: BackendError) -> Self {
        Self::with_fallback(Err(error))
    }

    fn with_fallback(fallback: Result<FileBundle, BackendError>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Queue an outcome ahead of the fallback.
    pub fn then(self, outcome: Result<FileBundle, BackendError>) -> Self {
        self.script.lock().unwrap_or_else(PoisonError::into_inner).push_back(outcome);
        self
    }

    /// Simulate backend latency (uses `tokio::time`, so paused clocks apply).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<ScriptedCall> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[async_trait]
impl GenerationBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(
        &self,
        prompt: &str,
        existing_files: Option<&FileBundle>,
    ) -> Result<FileBundle, BackendError> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).push(ScriptedCall {
            prompt: prompt.to_string(),
            existing_files: existing_files.cloned(),
        });

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let next = self.script.lock().unwrap_or_else(PoisonError::into_inner).pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replays_script_then_falls_back() {
        let files = FileBundle::new().with_file("index.html", "ok");
        let backend = ScriptedBackend::succeeding(files.clone())
            .then(Err(BackendError::Network("reset".into())));

        assert!(backend.generate("a", None).await.is_err());
        assert_eq!(backend.generate("b", Some(&files)).await.unwrap(), files);

        let calls = backend.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].prompt, "b");
        assert_eq!(calls[1].existing_files, Some(files));
    }
}
