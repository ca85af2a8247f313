use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, watch};

use crate::{Assignment, BusError, Consumer, Delivery, MessageBus, Publisher, Result};

/// A message as stored in a partition log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: String,
    pub payload: Vec<u8>,
}

struct TopicLog {
    partitions: Vec<Vec<Arc<Record>>>,
    appended: watch::Sender<u64>,
}

impl TopicLog {
    fn new(partitions: u32) -> Self {
        let (appended, _) = watch::channel(0);
        Self {
            partitions: (0..partitions).map(|_| Vec::new()).collect(),
            appended,
        }
    }
}

#[derive(Default)]
struct BusState {
    topics: HashMap<String, TopicLog>,
    /// Committed offset per (group, topic, partition): the next offset the
    /// group has not consumed yet.
    committed: HashMap<(String, String, u32), u64>,
}

impl BusState {
    fn topic_mut(&mut self, topic: &str, partitions: u32) -> &mut TopicLog {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| TopicLog::new(partitions))
    }
}

struct Inner {
    partitions: u32,
    state: Mutex<BusState>,
    closed: AtomicBool,
    fail_on_publish: AtomicBool,
}

/// In-process partitioned log with consumer groups.
///
/// Each topic has `partitions` append-only logs. Consumers of a group share
/// committed offsets, so a consumer opened after a restart resumes where the
/// group left off and re-reads anything that was delivered but never acked.
#[derive(Clone)]
pub struct InMemoryBus {
    inner: Arc<Inner>,
}

impl InMemoryBus {
    /// Creates a bus whose topics have `partitions` partitions each.
    pub fn new(partitions: u32) -> Self {
        Self {
            inner: Arc::new(Inner {
                partitions: partitions.max(1),
                state: Mutex::new(BusState::default()),
                closed: AtomicBool::new(false),
                fail_on_publish: AtomicBool::new(false),
            }),
        }
    }

    /// Partition a key is routed to.
    pub fn partition_for(&self, key: &str) -> u32 {
        partition_for(key, self.inner.partitions)
    }

    /// Makes every publish fail until switched off again.
    pub fn set_fail_on_publish(&self, fail: bool) {
        self.inner.fail_on_publish.store(fail, Ordering::SeqCst);
    }

    /// Stops the bus: pending and future `Consumer::next` calls return `None`.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let state = self.inner.state.lock().await;
        for log in state.topics.values() {
            log.appended.send_modify(|n| *n += 1);
        }
    }

    /// Every record of a topic, partition by partition.
    pub async fn records(&self, topic: &str) -> Vec<Record> {
        let state = self.inner.state.lock().await;
        state
            .topics
            .get(topic)
            .map(|log| {
                log.partitions
                    .iter()
                    .flat_map(|p| p.iter().map(|r| r.as_ref().clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Records of a topic published with `key`, in publish order.
    pub async fn records_for_key(&self, topic: &str, key: &str) -> Vec<Record> {
        let partition = self.partition_for(key) as usize;
        let state = self.inner.state.lock().await;
        state
            .topics
            .get(topic)
            .map(|log| {
                log.partitions[partition]
                    .iter()
                    .filter(|r| r.key == key)
                    .map(|r| r.as_ref().clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of messages of `topic` the group has not committed yet.
    pub async fn lag(&self, topic: &str, group: &str) -> u64 {
        let state = self.inner.state.lock().await;
        let Some(log) = state.topics.get(topic) else {
            return 0;
        };
        log.partitions
            .iter()
            .enumerate()
            .map(|(p, records)| {
                let committed = state
                    .committed
                    .get(&(group.to_string(), topic.to_string(), p as u32))
                    .copied()
                    .unwrap_or(0);
                records.len() as u64 - committed.min(records.len() as u64)
            })
            .sum()
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new(8)
    }
}

/// FNV-1a over the key bytes; stable across runs and platforms.
fn partition_for(key: &str, partitions: u32) -> u32 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in key.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    (hash % u64::from(partitions)) as u32
}

#[async_trait]
impl Publisher for InMemoryBus {
    async fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        if self.inner.fail_on_publish.load(Ordering::SeqCst) {
            return Err(BusError::PublishFailed {
                topic: topic.to_string(),
                reason: "broker unavailable".to_string(),
            });
        }

        let partition = partition_for(key, self.inner.partitions);
        let mut state = self.inner.state.lock().await;
        let log = state.topic_mut(topic, self.inner.partitions);
        log.partitions[partition as usize].push(Arc::new(Record {
            key: key.to_string(),
            payload,
        }));
        log.appended.send_modify(|n| *n += 1);

        metrics::counter!("bus_messages_published_total", "topic" => topic.to_string())
            .increment(1);
        tracing::trace!(topic, key, partition, "message published");
        Ok(())
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    fn partitions(&self) -> u32 {
        self.inner.partitions
    }

    fn publisher(&self) -> Box<dyn Publisher> {
        Box::new(self.clone())
    }

    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        assignment: Assignment,
    ) -> Result<Box<dyn Consumer>> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BusError::SubscriptionFailed {
                topic: topic.to_string(),
                reason: "bus closed".to_string(),
            });
        }

        let partitions = assignment.resolve(self.inner.partitions);
        let mut state = self.inner.state.lock().await;
        let appended = state.topic_mut(topic, self.inner.partitions).appended.subscribe();
        let positions = partitions
            .iter()
            .map(|p| {
                let committed = state
                    .committed
                    .get(&(group.to_string(), topic.to_string(), *p))
                    .copied()
                    .unwrap_or(0);
                (*p, committed)
            })
            .collect();

        tracing::debug!(topic, group, ?partitions, "consumer subscribed");

        Ok(Box::new(InMemoryConsumer {
            inner: Arc::clone(&self.inner),
            topic: topic.to_string(),
            group: group.to_string(),
            partitions,
            positions,
            in_flight: HashSet::new(),
            attempts: HashMap::new(),
            cursor: 0,
            appended,
        }))
    }
}

struct InMemoryConsumer {
    inner: Arc<Inner>,
    topic: String,
    group: String,
    partitions: Vec<u32>,
    /// Next offset to deliver, per partition.
    positions: HashMap<u32, u64>,
    /// Partitions with an unsettled delivery; nothing else is read from them.
    in_flight: HashSet<u32>,
    attempts: HashMap<(u32, u64), u32>,
    cursor: usize,
    appended: watch::Receiver<u64>,
}

impl InMemoryConsumer {
    async fn poll(&mut self) -> Option<Delivery> {
        let state = self.inner.state.lock().await;
        let log = state.topics.get(&self.topic)?;
        let n = self.partitions.len();

        for step in 0..n {
            let partition = self.partitions[(self.cursor + step) % n];
            if self.in_flight.contains(&partition) {
                continue;
            }
            let offset = self.positions.get(&partition).copied().unwrap_or(0);
            let Some(record) = log.partitions[partition as usize].get(offset as usize) else {
                continue;
            };

            self.cursor = (self.cursor + step + 1) % n;
            self.positions.insert(partition, offset + 1);
            self.in_flight.insert(partition);
            let attempt = self.attempts.entry((partition, offset)).or_insert(0);
            *attempt += 1;

            return Some(Delivery {
                topic: self.topic.clone(),
                partition,
                offset,
                key: record.key.clone(),
                payload: record.payload.clone(),
                attempt: *attempt,
            });
        }
        None
    }

    fn settle(&mut self, delivery: &Delivery) -> Result<()> {
        let expected = self.positions.get(&delivery.partition).copied();
        if delivery.topic != self.topic
            || !self.in_flight.remove(&delivery.partition)
            || expected != Some(delivery.offset + 1)
        {
            return Err(BusError::NotInFlight {
                topic: delivery.topic.clone(),
                partition: delivery.partition,
                offset: delivery.offset,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Consumer for InMemoryConsumer {
    async fn next(&mut self) -> Result<Option<Delivery>> {
        if self.partitions.is_empty() {
            // Nothing assigned: park until the bus closes.
            while !self.inner.closed.load(Ordering::SeqCst) {
                if self.appended.changed().await.is_err() {
                    break;
                }
            }
            return Ok(None);
        }

        loop {
            if self.inner.closed.load(Ordering::SeqCst) {
                return Ok(None);
            }
            self.appended.borrow_and_update();
            if let Some(delivery) = self.poll().await {
                return Ok(Some(delivery));
            }
            if self.appended.changed().await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<()> {
        self.settle(delivery)?;
        self.attempts.remove(&(delivery.partition, delivery.offset));

        let mut state = self.inner.state.lock().await;
        let committed = state
            .committed
            .entry((self.group.clone(), self.topic.clone(), delivery.partition))
            .or_insert(0);
        *committed = (*committed).max(delivery.offset + 1);
        Ok(())
    }

    async fn nack(&mut self, delivery: &Delivery) -> Result<()> {
        self.settle(delivery)?;
        self.positions.insert(delivery.partition, delivery.offset);
        metrics::counter!("bus_messages_redelivered_total", "topic" => self.topic.clone())
            .increment(1);
        Ok(())
    }
}
