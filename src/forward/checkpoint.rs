use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Persistent position of a table scan: the highest `EventTickCount` that was forwarded
#[async_trait]
pub trait CheckpointStore: Send {
    async fn load(&mut self) -> anyhow::Result<Option<u64>>;

    async fn store(&mut self, tick_count: u64) -> anyhow::Result<()>;
}

#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    pub value: Option<u64>,
    /// every value that was stored, in order
    pub history: Vec<u64>,
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn load(&mut self) -> anyhow::Result<Option<u64>> {
        Ok(self.value)
    }

    async fn store(&mut self, tick_count: u64) -> anyhow::Result<()> {
        self.value = Some(tick_count);
        self.history.push(tick_count);
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CheckpointRecord {
    event_tick_count: u64,
}

/// Stores the checkpoint as a small JSON document in a file. A missing file means 'no checkpoint'.
#[derive(Debug)]
pub struct JsonFileCheckpointStore {
    path: PathBuf,
}

impl JsonFileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> JsonFileCheckpointStore {
        JsonFileCheckpointStore { path: path.into() }
    }
}

#[async_trait]
impl CheckpointStore for JsonFileCheckpointStore {
    async fn load(&mut self) -> anyhow::Result<Option<u64>> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no checkpoint file at {:?}", self.path);
                return Ok(None);
            }
            Err(e) => return Err(e).with_context(|| format!("cannot read checkpoint file {:?}", self.path)),
        };
        let record: CheckpointRecord = serde_json::from_slice(&raw)
            .with_context(|| format!("invalid checkpoint file {:?}", self.path))?;
        debug!("checkpoint read: {}", record.event_tick_count);
        Ok(Some(record.event_tick_count))
    }

    async fn store(&mut self, tick_count: u64) -> anyhow::Result<()> {
        let raw = serde_json::to_vec(&CheckpointRecord { event_tick_count: tick_count })?;
        tokio::fs::write(&self.path, raw).await
            .with_context(|| format!("cannot write checkpoint file {:?}", self.path))?;
        debug!("checkpoint written: {}", tick_count);
        Ok(())
    }
}
