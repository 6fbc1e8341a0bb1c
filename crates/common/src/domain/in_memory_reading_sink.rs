use crate::domain::{DomainResult, ReadingSink, SensorReading, StoreReadingsInput};
use async_trait::async_trait;
use tokio::sync::RwLock;

/// In-memory implementation of `ReadingSink` backed by a `Vec`.
///
/// A batch is appended under a single write lock, so concurrent readers see
/// either all of it or none of it.
pub struct InMemoryReadingSink {
    readings: RwLock<Vec<SensorReading>>,
}

impl InMemoryReadingSink {
    pub fn new() -> Self {
        Self {
            readings: RwLock::new(Vec::new()),
        }
    }

    /// Snapshot of everything stored so far, in insertion order
    pub async fn readings(&self) -> Vec<SensorReading> {
        self.readings.read().await.clone()
    }

    pub async fn count(&self) -> usize {
        self.readings.read().await.len()
    }
}

impl Default for InMemoryReadingSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReadingSink for InMemoryReadingSink {
    async fn store_batch(&self, input: StoreReadingsInput) -> DomainResult<()> {
        let mut readings = self.readings.write().await;
        readings.extend(input.readings);
        Ok(())
    }
}
