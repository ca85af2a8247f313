//! Consumer loops.
//!
//! A [`WorkerPool`] runs `workers_per_topic` workers for one topic on behalf
//! of one consumer group. Partitions are shared out round-robin, so every
//! order key is always handled by the same worker and per-order ordering on
//! the topic is kept.

use std::sync::Arc;

use async_trait::async_trait;
use message_bus::{
    Assignment, Consumer, DEAD_LETTER_TOPIC, DeadLetter, Delivery, MessageBus, Publisher, encode,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{Disposition, Result, SagaError};
use crate::settings::SagaSettings;

/// Something that consumes deliveries.
///
/// `Ok` acks the delivery. On `Err` the worker consults
/// [`SagaError::disposition`] to either redeliver or dead-letter it.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, delivery: &Delivery, publisher: &dyn Publisher) -> Result<()>;
}

/// Workers for one (topic, group) pair.
pub struct WorkerPool {
    topic: String,
    group: String,
    handler: Arc<dyn MessageHandler>,
    settings: SagaSettings,
}

impl WorkerPool {
    pub fn new(
        topic: impl Into<String>,
        group: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
        settings: SagaSettings,
    ) -> Self {
        Self {
            topic: topic.into(),
            group: group.into(),
            handler,
            settings,
        }
    }

    /// Subscribes every worker, then spawns them. Each worker stops when
    /// `shutdown` turns `true` or the bus closes.
    pub async fn spawn(
        self,
        bus: &dyn MessageBus,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Vec<JoinHandle<()>>> {
        let workers = self.settings.workers_per_topic.max(1);
        let partitions = bus.partitions();

        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let consumer = bus
                .subscribe(
                    &self.topic,
                    &self.group,
                    Assignment::round_robin(index, workers, partitions),
                )
                .await?;
            let worker = Worker {
                index,
                topic: self.topic.clone(),
                group: self.group.clone(),
                consumer,
                publisher: bus.publisher(),
                handler: Arc::clone(&self.handler),
                settings: self.settings.clone(),
                shutdown: shutdown.clone(),
            };
            handles.push(tokio::spawn(worker.run()));
        }

        tracing::info!(topic = %self.topic, group = %self.group, workers, "worker pool started");
        Ok(handles)
    }
}

struct Worker {
    index: usize,
    topic: String,
    group: String,
    consumer: Box<dyn Consumer>,
    publisher: Box<dyn Publisher>,
    handler: Arc<dyn MessageHandler>,
    settings: SagaSettings,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    async fn run(mut self) {
        loop {
            let delivery = tokio::select! {
                _ = stopped(&mut self.shutdown) => break,
                next = self.consumer.next() => match next {
                    Ok(Some(delivery)) => delivery,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!(topic = %self.topic, worker = self.index, error = %e, "receive failed");
                        tokio::time::sleep(self.settings.retry_base).await;
                        continue;
                    }
                },
            };

            if !self.process(delivery).await {
                break;
            }
        }
        tracing::debug!(topic = %self.topic, group = %self.group, worker = self.index, "worker stopped");
    }

    /// Handles and settles one delivery. Returns `false` if shutdown was
    /// requested while backing off; the delivery is then left unsettled and
    /// comes back on the next start.
    #[tracing::instrument(
        skip(self, delivery),
        fields(topic = %delivery.topic, key = %delivery.key, attempt = delivery.attempt)
    )]
    async fn process(&mut self, delivery: Delivery) -> bool {
        let result = self
            .handler
            .handle(&delivery, self.publisher.as_ref())
            .await;

        let outcome = match result {
            Ok(()) => {
                self.settle(&delivery, true).await;
                "ok"
            }
            Err(e) => match e.disposition() {
                Disposition::Retry => {
                    tracing::error!(error = %e, "handler failed, will redeliver");
                    let backoff = self.settings.backoff(delivery.attempt);
                    tokio::select! {
                        _ = stopped(&mut self.shutdown) => return false,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    self.settle(&delivery, false).await;
                    "retry"
                }
                Disposition::DeadLetter => {
                    tracing::warn!(error = %e, "dead-lettering message");
                    match self.dead_letter(&delivery, &e).await {
                        Ok(()) => {
                            self.settle(&delivery, true).await;
                            "dead_letter"
                        }
                        Err(publish) => {
                            tracing::error!(error = %publish, "dead letter publish failed");
                            self.settle(&delivery, false).await;
                            "retry"
                        }
                    }
                }
            },
        };

        metrics::counter!(
            "worker_messages_total",
            "topic" => self.topic.clone(),
            "outcome" => outcome
        )
        .increment(1);
        true
    }

    async fn dead_letter(&mut self, delivery: &Delivery, error: &SagaError) -> Result<()> {
        let letter = DeadLetter::from_delivery(delivery, error.to_string());
        self.publisher
            .publish(DEAD_LETTER_TOPIC, &delivery.key, encode(&letter)?)
            .await?;
        Ok(())
    }

    async fn settle(&mut self, delivery: &Delivery, ack: bool) {
        let result = if ack {
            self.consumer.ack(delivery).await
        } else {
            self.consumer.nack(delivery).await
        };
        if let Err(e) = result {
            tracing::error!(error = %e, ack, "failed to settle delivery");
        }
    }
}

/// Resolves once the flag is `true` or the sender is gone.
pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
