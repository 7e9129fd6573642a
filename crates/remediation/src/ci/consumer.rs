//! Message intake for the orchestrator.
//!
//! `BuildFailed` and `TaskCompleted` messages arrive on a bounded queue and
//! are handled concurrently, up to a configured limit. A message whose
//! handling fails with a retryable error is put back on the queue after a
//! delay, a bounded number of times.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::error::PipelineError;
use super::orchestrator::FixOrchestrator;
use super::types::BuildFailure;
use crate::config::ConsumerConfig;

/// Messages the orchestrator consumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineMessage {
    BuildFailed(BuildFailure),
    TaskCompleted {
        #[serde(alias = "taskId")]
        task_id: String,
        success: bool,
    },
}

impl PipelineMessage {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::BuildFailed(_) => "build_failed",
            Self::TaskCompleted { .. } => "task_completed",
        }
    }
}

/// A message plus how many times it has been delivered.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: PipelineMessage,
    pub attempt: u32,
}

/// Producer handle for the consumer queue.
#[derive(Clone)]
pub struct MessageBus {
    sender: mpsc::Sender<Delivery>,
}

impl MessageBus {
    /// Bounded queue with its receiving end.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Delivery>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    /// Enqueue a first delivery.
    pub async fn publish(&self, message: PipelineMessage) -> Result<(), PipelineError> {
        self.send(Delivery {
            message,
            attempt: 1,
        })
        .await
    }

    async fn send(&self, delivery: Delivery) -> Result<(), PipelineError> {
        self.sender
            .send(delivery)
            .await
            .map_err(|_| PipelineError::QueueClosed)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Handled,
    /// Scheduled for another delivery
    Redelivered { attempt: u32 },
    /// Failed and will not be retried
    Dropped,
}

/// Pulls deliveries off the queue and dispatches them to the orchestrator.
pub struct MessageConsumer {
    orchestrator: Arc<FixOrchestrator>,
    bus: MessageBus,
    config: ConsumerConfig,
}

impl MessageConsumer {
    #[must_use]
    pub fn new(orchestrator: Arc<FixOrchestrator>, bus: MessageBus, config: ConsumerConfig) -> Self {
        Self {
            orchestrator,
            bus,
            config,
        }
    }

    /// Consume until `shutdown` fires or the queue closes, then wait for
    /// in-flight messages.
    pub async fn run(
        self: Arc<Self>,
        mut receiver: mpsc::Receiver<Delivery>,
        shutdown: CancellationToken,
    ) {
        let permits = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut in_flight = JoinSet::new();
        info!(concurrency = self.config.concurrency, "Message consumer started");

        loop {
            let delivery = tokio::select! {
                () = shutdown.cancelled() => break,
                next = receiver.recv() => match next {
                    Some(delivery) => delivery,
                    None => break,
                },
            };

            let Ok(permit) = permits.clone().acquire_owned().await else {
                break;
            };
            let consumer = Arc::clone(&self);
            in_flight.spawn(async move {
                let _permit = permit;
                consumer.handle(delivery).await
            });

            while let Some(done) = in_flight.try_join_next() {
                if let Err(e) = done {
                    error!(error = %e, "Message handler panicked");
                }
            }
        }

        let remaining = in_flight.len();
        if remaining > 0 {
            info!(remaining, "Waiting for in-flight messages");
        }
        while let Some(done) = in_flight.join_next().await {
            if let Err(e) = done {
                error!(error = %e, "Message handler panicked");
            }
        }
        info!("Message consumer stopped");
    }

    /// Handle one delivery, scheduling a redelivery when appropriate.
    pub async fn handle(&self, delivery: Delivery) -> Disposition {
        let kind = delivery.message.kind();
        debug!(kind, attempt = delivery.attempt, "Handling message");

        let result = match &delivery.message {
            PipelineMessage::BuildFailed(failure) => self
                .orchestrator
                .process_build_failure(failure.clone())
                .await
                .map(drop),
            PipelineMessage::TaskCompleted { task_id, success } => self
                .orchestrator
                .process_task_completion(task_id, *success)
                .await
                .map(drop),
        };

        let Err(e) = result else {
            return Disposition::Handled;
        };

        if !e.is_retryable() || delivery.attempt > self.config.max_redeliveries {
            error!(
                kind,
                attempt = delivery.attempt,
                error_kind = e.kind(),
                error = %e,
                "Message failed, not redelivering"
            );
            return Disposition::Dropped;
        }

        let next = Delivery {
            message: delivery.message,
            attempt: delivery.attempt + 1,
        };
        let delay = Duration::from_millis(
            self.config
                .redelivery_delay_ms
                .saturating_mul(u64::from(delivery.attempt)),
        );
        warn!(
            kind,
            attempt = delivery.attempt,
            delay_ms = delay.as_millis() as u64,
            error_kind = e.kind(),
            "Message failed, scheduling redelivery"
        );

        let attempt = next.attempt;
        let bus = self.bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if bus.send(next).await.is_err() {
                warn!(kind, "Queue closed before redelivery");
            }
        });

        Disposition::Redelivered { attempt }
    }
}
