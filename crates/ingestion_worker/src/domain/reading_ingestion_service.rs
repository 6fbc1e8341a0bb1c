use crate::domain::{NormalizeError, PayloadNormalizer, RejectedObject};
use common::domain::{ReadingSink, StoreReadingsInput};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What happened to one inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// Empty payload (heartbeat); nothing to do
    Skipped,
    /// The whole message was rejected before reaching the sink
    Dropped(NormalizeError),
    /// Readings committed to the sink. `stored` is 0 when every object was
    /// rejected or the array was empty, in which case the sink is not called.
    Stored {
        stored: usize,
        rejected: Vec<RejectedObject>,
    },
    /// The sink refused the batch; none of its readings were recorded
    StoreFailed {
        readings: usize,
        rejected: Vec<RejectedObject>,
        error: String,
    },
}

impl IngestOutcome {
    pub fn stored_count(&self) -> usize {
        match self {
            IngestOutcome::Stored { stored, .. } => *stored,
            _ => 0,
        }
    }
}

/// Domain service that turns one inbound message into one sink batch
pub struct ReadingIngestionService {
    normalizer: PayloadNormalizer,
    sink: Arc<dyn ReadingSink>,
}

impl ReadingIngestionService {
    pub fn new(normalizer: PayloadNormalizer, sink: Arc<dyn ReadingSink>) -> Self {
        Self { normalizer, sink }
    }

    /// Normalize a message and store its readings as one atomic batch
    ///
    /// Never returns an error: every failure is logged and reported through
    /// the outcome so the caller can keep consuming messages.
    pub async fn ingest(&self, topic: &str, payload: &[u8]) -> IngestOutcome {
        let verbose = self.normalizer.config().verbose;

        let batch = match self.normalizer.normalize(topic, payload) {
            Ok(Some(batch)) => batch,
            Ok(None) => {
                if verbose {
                    info!(topic = %topic, "skipping empty payload");
                } else {
                    debug!(topic = %topic, "skipping empty payload");
                }
                return IngestOutcome::Skipped;
            }
            Err(e) => {
                if verbose {
                    warn!(
                        topic = %topic,
                        error = %e,
                        payload = %self.normalizer.preview(payload),
                        "dropping message"
                    );
                } else {
                    warn!(topic = %topic, error = %e, "dropping message");
                }
                return IngestOutcome::Dropped(e);
            }
        };

        let rejected = batch.rejected;
        let count = batch.readings.len();
        if count == 0 {
            debug!(
                topic = %topic,
                rejected = rejected.len(),
                "no readings to store"
            );
            return IngestOutcome::Stored {
                stored: 0,
                rejected,
            };
        }

        let measurements: usize = batch
            .readings
            .iter()
            .map(|reading| reading.measurements().reported_count())
            .sum();
        let input = StoreReadingsInput {
            readings: batch.readings,
        };

        match self.sink.store_batch(input).await {
            Ok(()) => {
                if verbose {
                    info!(
                        topic = %topic,
                        stored = count,
                        measurements,
                        rejected = rejected.len(),
                        "stored readings"
                    );
                } else {
                    debug!(
                        topic = %topic,
                        stored = count,
                        measurements,
                        rejected = rejected.len(),
                        "stored readings"
                    );
                }
                IngestOutcome::Stored {
                    stored: count,
                    rejected,
                }
            }
            Err(e) => {
                error!(
                    topic = %topic,
                    reading_count = count,
                    error = %e,
                    "failed to store readings, dropping batch"
                );
                IngestOutcome::StoreFailed {
                    readings: count,
                    rejected,
                    error: e.to_string(),
                }
            }
        }
    }
}
