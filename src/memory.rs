//! An event bus inside the process.
//!
//! Topics keep every record they receive. Each consumer group has an offset
//! per topic; subscribing replays the records past that offset and then
//! follows new ones as they are published. Useful for local runs and tests
//! where no broker is available.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::debug;

use crate::codec::ValueCodec;
use crate::consumer::{ConsumerDriver, EventBusConsumer, RecordStream};
use crate::error::Error;
use crate::event::{EventMetadata, EventSignal};
use crate::loader::{BoxError, Component, FactoryArgs};
use crate::producer::{BusRecord, EventBusProducer, full_topic_name};
use crate::types::EventData;

pub const CREATE_PRODUCER: &str = "hermes.memory.create_producer";
pub const CREATE_CONSUMER: &str = "hermes.memory.create_consumer";

const LIVE_CAPACITY: usize = 1024;

struct TopicLog {
    records: Vec<BusRecord>,
    offsets: HashMap<String, usize>,
    live: broadcast::Sender<(usize, BusRecord)>,
}

impl TopicLog {
    fn new() -> Self {
        let (live, _) = broadcast::channel(LIVE_CAPACITY);
        Self {
            records: Vec::new(),
            offsets: HashMap::new(),
            live,
        }
    }
}

#[derive(Default)]
pub struct MemoryBus {
    topics: Mutex<HashMap<String, TopicLog>>,
}

impl MemoryBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The bus shared by every in-memory producer and consumer of the process.
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<MemoryBus>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(MemoryBus::new))
    }

    pub fn publish(&self, record: BusRecord) {
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        let log = topics
            .entry(record.topic.clone())
            .or_insert_with(TopicLog::new);
        let index = log.records.len();
        log.records.push(record.clone());
        // No live subscribers is fine; they replay from the log.
        let _ = log.live.send((index, record));
    }

    /// Every record ever published to `topic`.
    pub fn records(&self, topic: &str) -> Vec<BusRecord> {
        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .map(|log| log.records.clone())
            .unwrap_or_default()
    }

    /// Index of the next record `group` will receive from `topic`.
    pub fn offset(&self, topic: &str, group: &str) -> usize {
        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .and_then(|log| log.offsets.get(group).copied())
            .unwrap_or(0)
    }

    fn commit(&self, topic: &str, group: &str, index: usize) {
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(log) = topics.get_mut(topic) {
            let offset = log.offsets.entry(group.to_string()).or_insert(0);
            *offset = (*offset).max(index + 1);
        }
    }

    /// Records of `topic` past the group's offset, then live records. Each
    /// delivered record advances the offset.
    pub fn subscribe(self: &Arc<Self>, topic: &str, group: &str) -> RecordStream {
        let (backlog, live) = {
            let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
            let log = topics.entry(topic.to_string()).or_insert_with(TopicLog::new);
            let offset = log.offsets.get(group).copied().unwrap_or(0);
            let backlog: Vec<_> = log
                .records
                .iter()
                .enumerate()
                .skip(offset)
                .map(|(index, record)| Ok::<_, Error>((index, record.clone())))
                .collect();
            (backlog, log.live.subscribe())
        };

        let live = BroadcastStream::new(live).map(|item| {
            item.map_err(|e: BroadcastStreamRecvError| {
                Error::decode(format!("in-memory consumer fell behind: {e}"))
            })
        });

        let bus = Arc::clone(self);
        let topic = topic.to_string();
        let group = group.to_string();
        futures::stream::iter(backlog)
            .chain(live)
            .map(move |item| {
                item.map(|(index, record)| {
                    bus.commit(&topic, &group, index);
                    record
                })
            })
            .boxed()
    }
}

pub struct MemoryProducer {
    bus: Arc<MemoryBus>,
    topic_prefix: Option<String>,
    codec: ValueCodec,
}

impl MemoryProducer {
    pub fn new(bus: Arc<MemoryBus>, topic_prefix: Option<String>, codec: ValueCodec) -> Self {
        Self {
            bus,
            topic_prefix,
            codec,
        }
    }
}

impl EventBusProducer for MemoryProducer {
    fn send(
        &self,
        signal: &EventSignal,
        topic: &str,
        key_field_path: &str,
        data: &EventData,
        metadata: &EventMetadata,
    ) -> Result<(), Error> {
        let topic = full_topic_name(self.topic_prefix.as_deref(), topic);
        let record = BusRecord::encode(signal, topic, key_field_path, data, metadata, &self.codec)?;
        debug!(
            topic = %record.topic,
            key = %record.key,
            event_id = %metadata.id,
            "Published event to in-memory bus"
        );
        self.bus.publish(record);
        Ok(())
    }
}

pub struct MemoryConsumer {
    bus: Arc<MemoryBus>,
    driver: ConsumerDriver,
}

impl MemoryConsumer {
    pub fn new(bus: Arc<MemoryBus>, driver: ConsumerDriver) -> Self {
        Self { bus, driver }
    }
}

#[async_trait]
impl EventBusConsumer for MemoryConsumer {
    async fn consume_indefinitely(&mut self) -> Result<(), Error> {
        let records = self
            .bus
            .subscribe(self.driver.topic(), self.driver.group_id());
        self.driver.run(records).await
    }
}

pub fn create_producer(args: &FactoryArgs<'_>) -> Result<Component, BoxError> {
    Ok(Component::Producer(Arc::new(MemoryProducer::new(
        MemoryBus::global(),
        args.settings.topic_prefix.clone(),
        ValueCodec::default(),
    ))))
}

pub fn create_consumer(args: &FactoryArgs<'_>) -> Result<Component, BoxError> {
    let consumer = args
        .consumer
        .ok_or("the in-memory consumer needs a topic, group and signal")?;
    let topic = full_topic_name(args.settings.topic_prefix(), &consumer.topic);
    let driver = ConsumerDriver::new(
        Arc::clone(&consumer.signal),
        topic,
        consumer.group_id.clone(),
        ValueCodec::default(),
    )?
    .debug(args.settings.debug);
    Ok(Component::Consumer(Box::new(MemoryConsumer::new(
        MemoryBus::global(),
        driver,
    ))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::collections::BTreeMap;

    fn record(topic: &str, key: &str) -> BusRecord {
        BusRecord {
            topic: topic.to_string(),
            key: key.to_string(),
            value: Bytes::from(key.to_string()),
            headers: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn subscribers_replay_the_backlog_then_follow_live_records() {
        let bus = MemoryBus::new();
        bus.publish(record("t", "a"));
        let mut stream = bus.subscribe("t", "g");
        bus.publish(record("t", "b"));

        let first = stream.next().await.unwrap().unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!((first.key.as_str(), second.key.as_str()), ("a", "b"));
        assert_eq!(bus.offset("t", "g"), 2);
    }

    #[tokio::test]
    async fn groups_resume_from_their_own_offset() {
        let bus = MemoryBus::new();
        for key in ["a", "b", "c"] {
            bus.publish(record("t", key));
        }
        let mut first = bus.subscribe("t", "g1");
        first.next().await.unwrap().unwrap();
        drop(first);

        let mut resumed = bus.subscribe("t", "g1");
        assert_eq!(resumed.next().await.unwrap().unwrap().key, "b");
        let mut other = bus.subscribe("t", "g2");
        assert_eq!(other.next().await.unwrap().unwrap().key, "a");
    }

    #[test]
    fn topics_are_isolated() {
        let bus = MemoryBus::new();
        bus.publish(record("t1", "a"));
        assert_eq!(bus.records("t1").len(), 1);
        assert!(bus.records("t2").is_empty());
        assert_eq!(bus.offset("t2", "g"), 0);
    }
}
