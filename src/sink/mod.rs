//! Transcript persistence.
//!
//! When a run ends the engine hands the processed transcript (after result
//! processors) to a [`TranscriptSink`]. On the success path a sink failure
//! turns the run into an error; on the error and abort paths persistence is
//! best effort.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::OutflowError;
use crate::run::RunStatus;
use crate::types::{FinishReason, ModelMessage, RunId, Usage};

/// What gets persisted for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptRecord {
    pub run_id: RunId,
    pub status: RunStatus,
    pub finish_reason: FinishReason,
    pub usage: Usage,
    pub messages: Vec<ModelMessage>,
    pub created_at: DateTime<Utc>,
}

/// Storage for finished run transcripts.
#[async_trait]
pub trait TranscriptSink: Send + Sync {
    async fn persist(&self, record: &TranscriptRecord) -> Result<(), OutflowError>;
}

/// In-memory sink, keyed by run id. Later records for a run replace earlier ones.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<HashMap<RunId, TranscriptRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, run_id: &RunId) -> Option<TranscriptRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(run_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TranscriptSink for MemorySink {
    async fn persist(&self, record: &TranscriptRecord) -> Result<(), OutflowError> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.run_id, record.clone());
        Ok(())
    }
}

/// File-backed sink writing one `<run id>.json` per run.
///
/// # Example
/// ```no_run
/// use outflow::sink::FileSink;
///
/// let sink = FileSink::new("/tmp/outflow-transcripts");
/// assert!(sink.record_path(&uuid::Uuid::nil()).ends_with("00000000-0000-0000-0000-000000000000.json"));
/// ```
#[derive(Debug, Clone)]
pub struct FileSink {
    base_dir: PathBuf,
}

impl FileSink {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// `<data dir>/transcripts` for the current platform.
    pub fn new_default() -> Option<Self> {
        directories::ProjectDirs::from("dev", "outflow", "outflow")
            .map(|dirs| Self::new(dirs.data_dir().join("transcripts")))
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn record_path(&self, run_id: &RunId) -> PathBuf {
        self.base_dir.join(format!("{run_id}.json"))
    }

    /// Read back a persisted record, if present.
    pub async fn load(&self, run_id: &RunId) -> Result<Option<TranscriptRecord>, OutflowError> {
        let raw = match tokio::fs::read_to_string(self.record_path(run_id)).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(Some(serde_json::from_str(&raw)?))
    }
}

#[async_trait]
impl TranscriptSink for FileSink {
    async fn persist(&self, record: &TranscriptRecord) -> Result<(), OutflowError> {
        tokio::fs::create_dir_all(&self.base_dir).await?;
        let path = self.record_path(&record.run_id);
        let serialized = serde_json::to_string_pretty(record)?;
        // Write then rename so readers never see a partial record.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serialized).await?;
        tokio::fs::rename(&tmp, &path).await?;
        tracing::debug!(run_id = %record.run_id, path = %path.display(), "transcript persisted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn record() -> TranscriptRecord {
        TranscriptRecord {
            run_id: Uuid::new_v4(),
            status: RunStatus::Success,
            finish_reason: FinishReason::Stop,
            usage: Usage::new(3, 4),
            messages: vec![ModelMessage::user("hi"), ModelMessage::assistant("hello")],
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn memory_sink_keeps_latest_record() {
        let sink = MemorySink::new();
        let mut rec = record();
        sink.persist(&rec).await.unwrap();
        rec.status = RunStatus::Error;
        sink.persist(&rec).await.unwrap();
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.get(&rec.run_id).unwrap().status, RunStatus::Error);
    }

    #[tokio::test]
    async fn file_sink_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::new(dir.path().join("nested"));
        let rec = record();
        sink.persist(&rec).await.unwrap();
        assert!(sink.record_path(&rec.run_id).exists());
        assert_eq!(sink.load(&rec.run_id).await.unwrap(), Some(rec));
        assert_eq!(sink.load(&Uuid::new_v4()).await.unwrap(), None);
    }
}
