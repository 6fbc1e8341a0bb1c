use crate::domain::{BackoffConfig, ReadingIngestionService};
use crate::mqtt::{Backoff, BrokerConnector, BrokerError, BrokerSession, InboundMessage};
use futures::FutureExt;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument, Span};

/// Lifecycle of the broker connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Subscribed,
    Stopping,
    Stopped,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Subscribed => "subscribed",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Keeps one subscription alive and feeds every message to the ingestion service
///
/// Loop:
/// 1. Connect and subscribe (cancellable)
/// 2. Dispatch messages until the connection drops or stop is raised
/// 3. Wait out the backoff delay (cancellable) and go back to 1
///
/// Only the stop token ends the loop.
pub struct ConnectionManager {
    connector: Arc<dyn BrokerConnector>,
    service: Arc<ReadingIngestionService>,
    backoff_config: BackoffConfig,
    state_tx: watch::Sender<ConnectionState>,
    last_error_tx: watch::Sender<Option<String>>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        service: Arc<ReadingIngestionService>,
        backoff_config: BackoffConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (last_error_tx, _) = watch::channel(None);
        Self {
            connector,
            service,
            backoff_config,
            state_tx,
            last_error_tx,
        }
    }

    /// Subscribe to state transitions
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn current_state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Error that ended the most recent connect attempt or session
    ///
    /// Cleared once a subscription is established.
    pub fn last_error(&self) -> Option<String> {
        self.last_error_tx.borrow().clone()
    }

    #[instrument(
        name = "connection_manager",
        skip_all,
        fields(transport = %self.connector.transport_mode())
    )]
    pub async fn run(&self, stop: CancellationToken) {
        let mut backoff = Backoff::new(
            self.backoff_config.min_delay(),
            self.backoff_config.max_delay(),
        );
        let mut attempt: u64 = 0;

        loop {
            if stop.is_cancelled() {
                break;
            }

            attempt += 1;
            self.set_state(ConnectionState::Connecting);

            let connected = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                result = AssertUnwindSafe(self.connector.connect()).catch_unwind() => result,
            };

            let failure = match connected {
                Ok(Ok(mut session)) => {
                    backoff.reset();
                    attempt = 0;
                    self.last_error_tx.send_replace(None);
                    self.set_state(ConnectionState::Subscribed);
                    info!("broker session established");

                    match self.dispatch(session.as_mut(), &stop).await {
                        Some(lost) => lost,
                        None => {
                            self.set_state(ConnectionState::Stopping);
                            session.disconnect().await;
                            break;
                        }
                    }
                }
                Ok(Err(e)) => e,
                Err(panic) => BrokerError::Unexpected(format!(
                    "connect panicked: {}",
                    panic_message(panic.as_ref())
                )),
            };

            self.last_error_tx.send_replace(Some(failure.to_string()));
            self.set_state(ConnectionState::Disconnected);

            let delay = if failure.is_transport() {
                let delay = backoff.next_delay();
                warn!(
                    error = %failure,
                    attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    "broker connection failed, retrying"
                );
                delay
            } else {
                let delay = self.backoff_config.unexpected_error_delay();
                error!(
                    error = %failure,
                    attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    "unexpected broker error, retrying"
                );
                delay
            };

            if !sleep_or_stop(delay, &stop).await {
                break;
            }
        }

        self.set_state(ConnectionState::Stopping);
        self.set_state(ConnectionState::Stopped);
        info!("connection manager stopped");
    }

    /// Hand messages to the ingestion service until the session ends
    ///
    /// Returns `None` when stop was raised, otherwise the error that ended the session.
    async fn dispatch(
        &self,
        session: &mut dyn BrokerSession,
        stop: &CancellationToken,
    ) -> Option<BrokerError> {
        loop {
            let next = tokio::select! {
                biased;
                _ = stop.cancelled() => return None,
                next = AssertUnwindSafe(session.next_message()).catch_unwind() => next,
            };

            match next {
                Ok(Ok(message)) => {
                    if stop.is_cancelled() {
                        return None;
                    }
                    self.handle_message(message).await;
                }
                Ok(Err(e)) => return Some(e),
                Err(panic) => {
                    return Some(BrokerError::Unexpected(format!(
                        "receive panicked: {}",
                        panic_message(panic.as_ref())
                    )))
                }
            }
        }
    }

    /// Handle one inbound message in its own trace
    async fn handle_message(&self, message: InboundMessage) {
        let span = info_span!(
            parent: Span::none(),
            "mqtt_message",
            topic = %message.topic,
            payload_size = message.payload.len(),
            stored = tracing::field::Empty,
        );

        async {
            let handled = AssertUnwindSafe(self.service.ingest(&message.topic, &message.payload))
                .catch_unwind()
                .await;

            match handled {
                Ok(outcome) => {
                    Span::current().record("stored", outcome.stored_count());
                }
                Err(panic) => {
                    error!(
                        panic = %panic_message(panic.as_ref()),
                        "message handling panicked, continuing"
                    );
                }
            }
        }
        .instrument(span)
        .await
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "connection state changed");
        }
    }
}

/// Sleep for `delay` unless stop is raised first; returns false on stop
async fn sleep_or_stop(delay: Duration, stop: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = stop.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
