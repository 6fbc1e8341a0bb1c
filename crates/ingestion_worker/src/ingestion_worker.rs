use crate::domain::{IngestionConfig, PayloadNormalizer, ReadingIngestionService};
use crate::mqtt::{BrokerConnector, ConnectionManager, ConnectionState, RumqttConnector};
use common::domain::ReadingSink;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// The running connection task and the token that stops it
struct WorkerProcess {
    cancellation_token: CancellationToken,
    join_handle: JoinHandle<()>,
}

/// Owns the ingestion task: one broker connection feeding one sink
///
/// The host must call `stop()` before releasing the sink's resources.
pub struct IngestionWorker {
    manager: Arc<ConnectionManager>,
    stop_timeout: Duration,
    process: Mutex<Option<WorkerProcess>>,
}

impl IngestionWorker {
    /// Build a worker that connects with the rumqttc client
    pub fn new(config: IngestionConfig, sink: Arc<dyn ReadingSink>) -> anyhow::Result<Self> {
        config.validate()?;
        let connector = Arc::new(RumqttConnector::new(config.mqtt.clone()));
        Ok(Self::with_connector(config, connector, sink))
    }

    /// Build a worker around any broker connector
    pub fn with_connector(
        config: IngestionConfig,
        connector: Arc<dyn BrokerConnector>,
        sink: Arc<dyn ReadingSink>,
    ) -> Self {
        let service = Arc::new(ReadingIngestionService::new(
            PayloadNormalizer::new(config.normalizer.clone()),
            sink,
        ));
        let manager = Arc::new(ConnectionManager::new(
            connector,
            service,
            config.backoff.clone(),
        ));

        Self {
            manager,
            stop_timeout: config.stop_timeout(),
            process: Mutex::new(None),
        }
    }

    /// Spawn the connection task; no-op while it is already running
    pub async fn start(&self) {
        let mut process = self.process.lock().await;

        if let Some(existing) = process.as_ref() {
            if !existing.join_handle.is_finished() {
                debug!("ingestion worker already running");
                return;
            }
        }

        let cancellation_token = CancellationToken::new();
        let manager = Arc::clone(&self.manager);
        let token = cancellation_token.clone();
        let join_handle = tokio::spawn(async move {
            manager.run(token).await;
        });

        *process = Some(WorkerProcess {
            cancellation_token,
            join_handle,
        });
        info!("ingestion worker started");
    }

    /// Signal the task to stop and wait up to the stop timeout for it to exit
    ///
    /// Never fails: a panicked or stuck task is logged and abandoned.
    pub async fn stop(&self) {
        let Some(process) = self.process.lock().await.take() else {
            debug!("ingestion worker not running");
            return;
        };

        process.cancellation_token.cancel();

        match tokio::time::timeout(self.stop_timeout, process.join_handle).await {
            Ok(Ok(())) => info!(
                state = %self.manager.current_state(),
                last_error = ?self.manager.last_error(),
                "ingestion worker stopped"
            ),
            Ok(Err(e)) => error!(error = %e, "ingestion worker task panicked"),
            Err(_) => warn!(
                timeout_ms = self.stop_timeout.as_millis() as u64,
                "ingestion worker did not stop within timeout"
            ),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.process
            .lock()
            .await
            .as_ref()
            .is_some_and(|p| !p.join_handle.is_finished())
    }

    /// Watch the broker connection state
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.manager.state()
    }

    pub fn current_state(&self) -> ConnectionState {
        self.manager.current_state()
    }

    /// Why the last connect attempt or session failed, if it has not reconnected since
    pub fn last_error(&self) -> Option<String> {
        self.manager.last_error()
    }
}
