//! Provider that replays recorded step payloads.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;

use super::{ModelProvider, ProviderRequest, ProviderStream};
use crate::error::OutflowError;
use crate::types::ChunkPayload;

/// Replays a fixed script: the n-th call to
/// [`stream_step`](ModelProvider::stream_step) yields the n-th recorded step.
#[derive(Debug, Default)]
pub struct ReplayProvider {
    steps: Vec<Vec<ChunkPayload>>,
    delay: Option<Duration>,
    next: AtomicUsize,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl ReplayProvider {
    pub fn new(steps: Vec<Vec<ChunkPayload>>) -> Self {
        Self {
            steps,
            ..Self::default()
        }
    }

    /// Parse JSON lines, one wire-shape payload (`{"type", "payload"}`) per
    /// line. A `step-finish` line closes the current step; blank lines and
    /// lines starting with `#` are skipped.
    pub fn from_jsonl(input: &str) -> Result<Self, OutflowError> {
        let mut steps = Vec::new();
        let mut current = Vec::new();
        for (index, line) in input.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let payload: ChunkPayload = serde_json::from_str(line).map_err(|e| {
                OutflowError::InvalidArgument(format!("line {}: {e}", index + 1))
            })?;
            let closes_step = matches!(payload, ChunkPayload::StepFinish { .. });
            current.push(payload);
            if closes_step {
                steps.push(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() {
            steps.push(current);
        }
        Ok(Self::new(steps))
    }

    /// Sleep between payloads.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Requests received so far, in call order.
    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ModelProvider for ReplayProvider {
    fn provider_name(&self) -> &str {
        "replay"
    }

    async fn stream_step(&self, request: &ProviderRequest) -> Result<ProviderStream, OutflowError> {
        self.requests
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(request.clone());
        let index = self.next.fetch_add(1, Ordering::SeqCst);
        let payloads = self.steps.get(index).cloned().ok_or_else(|| {
            OutflowError::provider(
                self.provider_name(),
                format!("no recorded step {index} ({} available)", self.steps.len()),
            )
        })?;
        let delay = self.delay;
        let stream = futures::stream::iter(payloads).then(move |payload| async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            Ok(payload)
        });
        Ok(stream.boxed())
    }
}
