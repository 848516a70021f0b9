//! Sending emitted events to the bus.
//!
//! [`install_routing`] connects one receiver to every configured signal. On
//! each emission it asks the producer source for the current producer and
//! calls [`EventBusProducer::send`] once per enabled topic.
//!
//! Producers share the record pipeline in [`BusRecord::encode`]: derive the
//! signal's schema, serialize the data, extract the routing key, and frame the
//! datum as a container with the metadata as headers.

mod config;

pub use config::{ProducerConfig, TopicConfig, merge_producer_configs};

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::runtime::Handle;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::codec::ValueCodec;
use crate::error::Error;
use crate::event::{EventMetadata, EventSignal, SignalRegistry};
use crate::schema::derive_schema;
use crate::types::{DataType, Datum, EventData};
use crate::wire;

/// Receiver id used by [`install_routing`].
pub const ROUTING_RECEIVER: &str = "hermes.producer.route";

/// Sends events of any signal to a bus topic.
#[async_trait]
pub trait EventBusProducer: Send + Sync {
    fn send(
        &self,
        signal: &EventSignal,
        topic: &str,
        key_field_path: &str,
        data: &EventData,
        metadata: &EventMetadata,
    ) -> Result<(), Error>;

    /// Waits for sends still in flight. Called before the process exits.
    async fn prepare_for_shutdown(&self) {}

    /// True for the stand-in used when no real producer could be loaded.
    fn is_noop(&self) -> bool {
        false
    }
}

/// Writes a producer has started on the runtime but not yet seen finish.
#[derive(Default)]
pub struct PendingWrites {
    tasks: Mutex<JoinSet<()>>,
}

impl PendingWrites {
    /// Runs `write` on `runtime`, reaping writes that already finished.
    pub fn spawn<F>(&self, runtime: &Handle, write: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        while tasks.try_join_next().is_some() {}
        tasks.spawn_on(write, runtime);
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits for every write started so far.
    pub async fn drain(&self) {
        let mut tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        if !tasks.is_empty() {
            info!(pending = tasks.len(), "Waiting for in-flight event writes");
        }
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Event write task did not complete");
            }
        }
    }
}

/// Yields the producer to route through, resolved on every emission so that a
/// settings change takes effect without reconnecting receivers.
pub type ProducerSource = Arc<dyn Fn() -> Arc<dyn EventBusProducer> + Send + Sync>;

/// One encoded event as it travels on a topic.
#[derive(Debug, Clone, PartialEq)]
pub struct BusRecord {
    pub topic: String,
    pub key: String,
    pub value: Bytes,
    pub headers: BTreeMap<String, String>,
}

impl BusRecord {
    /// Runs the producer pipeline for one topic.
    pub fn encode(
        signal: &EventSignal,
        topic: impl Into<String>,
        key_field_path: &str,
        data: &EventData,
        metadata: &EventMetadata,
        codec: &ValueCodec,
    ) -> Result<Self, Error> {
        let schema = derive_schema(signal, codec.registry())?;
        let datum = codec.serialize_event_data(signal, data)?;
        let key = extract_key(&datum, key_field_path)?;
        let value = wire::encode_event(&schema, &datum)?;
        Ok(Self {
            topic: topic.into(),
            key,
            value,
            headers: metadata.to_headers(),
        })
    }

    pub fn event_type(&self) -> Option<&str> {
        self.headers.get("ce_type").map(String::as_str)
    }
}

/// Prepends `<prefix>-` to `topic` when a non-empty prefix is configured.
pub fn full_topic_name(prefix: Option<&str>, topic: &str) -> String {
    match prefix.map(str::trim).filter(|p| !p.is_empty()) {
        Some(prefix) => format!("{prefix}-{topic}"),
        None => topic.to_string(),
    }
}

/// Follows a dotted path through record fields and map entries and renders the
/// scalar at its end.
pub fn extract_key(datum: &Datum, path: &str) -> Result<String, Error> {
    let target = path.split('.').try_fold(datum, |current, segment| {
        current
            .get(segment)
            .ok_or_else(|| Error::encode(format!("key path '{path}' has no '{segment}'")))
    })?;
    target
        .scalar_string()
        .ok_or_else(|| Error::encode(format!("key path '{path}' ends at a {}", target.kind_name())))
}

/// Checks that `path` leads to a scalar through the signal's declared data.
pub(crate) fn validate_key_path(signal: &EventSignal, path: &str) -> Result<(), Error> {
    let fail = |reason: &str| {
        Error::producer_configuration(
            Some(signal.event_type().as_ref()),
            format!("key_field_path '{path}' {reason}"),
        )
    };

    let mut segments = path.split('.');
    let first = segments.next().unwrap_or_default();
    let mut current: DataType = signal
        .init_data()
        .iter()
        .find(|(name, _)| name == first)
        .map(|(_, data_type)| data_type.clone())
        .ok_or_else(|| fail("does not start with a declared argument"))?;

    let scope = signal.record_scope();
    for segment in segments {
        current = current
            .descend(segment, &scope)
            .ok_or_else(|| fail("is not reachable in the init data"))?;
    }
    if current.is_scalar() {
        Ok(())
    } else {
        Err(fail("does not end at a scalar field"))
    }
}

/// Connects the routing receiver to every signal named in `config`.
///
/// Each emission is narrowed to the signal's declared arguments and sent once
/// per enabled topic. A send error fails the receiver, which the emit mode
/// then either isolates or propagates.
pub fn install_routing(
    registry: &SignalRegistry,
    config: &ProducerConfig,
    producer_source: ProducerSource,
) -> Result<(), Error> {
    for (event_type, topics) in config.iter() {
        let signal = registry
            .get(event_type)
            .ok_or_else(|| {
                Error::producer_configuration(
                    Some(event_type),
                    format!("No registered signal of type '{event_type}'"),
                )
            })?;
        let enabled: Vec<(String, String)> = topics
            .iter()
            .filter(|(_, topic)| topic.enabled)
            .map(|(name, topic)| (name.clone(), topic.key_field_path.clone()))
            .collect();
        let source = Arc::clone(&producer_source);

        signal.connect(ROUTING_RECEIVER, move |emission| {
            let subset: EventData = emission
                .signal
                .init_data()
                .iter()
                .filter_map(|(name, _)| emission.data.get(name).map(|v| (name.clone(), v.clone())))
                .collect();
            let producer = source();
            for (topic, key_field_path) in &enabled {
                debug!(
                    event_type = %emission.signal.event_type(),
                    topic = %topic,
                    "routing event to producer"
                );
                producer.send(emission.signal, topic, key_field_path, &subset, emission.metadata)?;
            }
            Ok(())
        });
    }
    Ok(())
}
