use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::model::ExtractionResult;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Result {0} already recorded")]
    Duplicate(Uuid),

    #[error("Result store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub total: u64,
    pub succeeded: u64,
    pub with_videos: u64,
    pub success_ratio: f64,
}

/// Persistence for extraction results. One result per request, append-only.
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn insert(&self, result: ExtractionResult) -> Result<(), StoreError>;

    async fn get(&self, id: &Uuid) -> Result<Option<ExtractionResult>, StoreError>;

    async fn stats(&self) -> Result<StoreStats, StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryResultStore {
    results: DashMap<Uuid, ExtractionResult>,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn insert(&self, result: ExtractionResult) -> Result<(), StoreError> {
        match self.results.entry(result.id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(StoreError::Duplicate(result.id)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(result);
                Ok(())
            }
        }
    }

    async fn get(&self, id: &Uuid) -> Result<Option<ExtractionResult>, StoreError> {
        Ok(self.results.get(id).map(|r| r.clone()))
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let mut stats = StoreStats::default();
        for entry in self.results.iter() {
            stats.total += 1;
            if entry.success {
                stats.succeeded += 1;
            }
            if !entry.videos.is_empty() {
                stats.with_videos += 1;
            }
        }
        if stats.total > 0 {
            stats.success_ratio = stats.with_videos as f64 / stats.total as f64;
        }
        Ok(stats)
    }
}
