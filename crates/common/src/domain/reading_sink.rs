use crate::domain::reading::SensorReading;
use crate::domain::result::DomainResult;
use async_trait::async_trait;

/// Input for storing the readings decoded from one inbound message
#[derive(Debug, Clone)]
pub struct StoreReadingsInput {
    pub readings: Vec<SensorReading>,
}

/// Durable storage boundary for normalized readings
///
/// Implementations must be safe to share between the ingestion task and any
/// query paths running concurrently.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait ReadingSink: Send + Sync {
    /// Store a batch of readings
    /// Failure handling: entire batch fails atomically (all-or-nothing)
    async fn store_batch(&self, input: StoreReadingsInput) -> DomainResult<()>;
}
