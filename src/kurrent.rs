//! KurrentDB as the event bus.
//!
//! Every topic is a stream. The producer appends each record as a binary
//! event whose payload is the container bytes; the routing key and headers
//! travel as JSON in the event's custom metadata. Consumers read a topic
//! through a persistent subscription named after their group, acknowledge
//! what they emitted, park what they could not decode, and reconnect with
//! backoff whenever the subscription drops.

mod settings;

pub use settings::{ConnectionSettings, ConnectionSettingsBuilder};

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use eventstore::{
    AppendToStreamOptions, Client, ClientSettings, DeleteStreamOptions, NakAction,
    PersistentSubscription, PersistentSubscriptionOptions, ResolvedEvent,
    SubscribeToPersistentSubscriptionOptions,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tokio::runtime::Handle;
use tracing::{error, info, warn};

use crate::codec::ValueCodec;
use crate::consumer::{ConsumerDriver, EventBusConsumer};
use crate::delay::{Backoff, RetryDelay};
use crate::error::Error;
use crate::event::{EventMetadata, EventSignal};
use crate::loader::{BoxError, Component, FactoryArgs};
use crate::producer::{BusRecord, EventBusProducer, PendingWrites, full_topic_name};
use crate::settings::Settings;
use crate::types::EventData;

pub const CREATE_PRODUCER: &str = "hermes.kurrent.create_producer";
pub const CREATE_CONSUMER: &str = "hermes.kurrent.create_consumer";

/// Custom metadata stored with every appended event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Envelope {
    key: String,
    headers: BTreeMap<String, String>,
}

fn envelope_bytes(record: &BusRecord) -> Result<Bytes, Error> {
    let envelope = Envelope {
        key: record.key.clone(),
        headers: record.headers.clone(),
    };
    Ok(Bytes::from(serde_json::to_vec(&envelope)?))
}

fn record_from_parts(topic: &str, data: Bytes, custom_metadata: &[u8]) -> Result<BusRecord, Error> {
    let envelope: Envelope = serde_json::from_slice(custom_metadata)
        .map_err(|e| Error::decode(format!("event metadata is not a record envelope: {e}")))?;
    Ok(BusRecord {
        topic: topic.to_string(),
        key: envelope.key,
        value: data,
        headers: envelope.headers,
    })
}

/// A connected KurrentDB client.
#[derive(Clone)]
pub struct Kurrent {
    client: Client,
}

impl Kurrent {
    /// Connects using `settings`. Must be called inside a tokio runtime.
    pub fn new(settings: &ConnectionSettings) -> Result<Self, Error> {
        Self::with_client_settings(settings.to_client_settings()?)
    }

    pub fn from_url(url: &str) -> Result<Self, Error> {
        Self::with_client_settings(url.parse::<ClientSettings>()?)
    }

    /// Uses `EVENT_BUS_KURRENT_URL` when set, otherwise the `KURRENT_*`
    /// variables read by [`ConnectionSettings::from_env`].
    pub fn from_settings(settings: &Settings) -> Result<Self, Error> {
        match settings.kurrent_url.as_deref() {
            Some(url) => Self::from_url(url),
            None => Self::new(&ConnectionSettings::from_env()?),
        }
    }

    fn with_client_settings(settings: ClientSettings) -> Result<Self, Error> {
        Handle::try_current().map_err(|e| {
            Error::invalid_config(format!("a KurrentDB client needs a tokio runtime: {e}"), None)
        })?;
        let client = Client::new(settings).map_err(|e| {
            Error::invalid_config(format!("cannot create a KurrentDB client: {e:?}"), None)
        })?;
        Ok(Self { client })
    }

    /// Deletes a topic's stream. A stream that does not exist counts as deleted.
    pub async fn delete_topic(&self, topic: &str) -> Result<(), Error> {
        match self
            .client
            .delete_stream(topic, &DeleteStreamOptions::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(eventstore::Error::ResourceNotFound) => Ok(()),
            Err(eventstore::Error::Grpc { code, .. })
                if code == tonic::Code::FailedPrecondition || code == tonic::Code::NotFound =>
            {
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Appends one record to its topic's stream and waits for the write.
    pub async fn append(&self, record: &BusRecord, event_id: uuid::Uuid) -> Result<(), Error> {
        let event_type = record
            .event_type()
            .ok_or_else(|| Error::encode("record has no ce_type header"))?;
        let event = eventstore::EventData::binary(event_type, record.value.clone())
            .id(event_id)
            .metadata(envelope_bytes(record)?);
        self.client
            .append_to_stream(
                record.topic.as_str(),
                &AppendToStreamOptions::default(),
                vec![event],
            )
            .await?;
        Ok(())
    }

    /// Creates the persistent subscription for `group` unless it exists.
    async fn ensure_group(&self, topic: &str, group: &str) -> Result<(), Error> {
        match self
            .client
            .create_persistent_subscription(topic, group, &PersistentSubscriptionOptions::default())
            .await
        {
            Ok(()) => {
                info!(topic = %topic, group_id = %group, "Created persistent subscription");
                Ok(())
            }
            Err(eventstore::Error::ResourceAlreadyExists) => Ok(()),
            Err(eventstore::Error::Grpc { code, .. }) if code == tonic::Code::AlreadyExists => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Sends records on the tokio runtime it was created on. [`send`] returns once
/// the record is encoded; write failures are logged, and
/// [`prepare_for_shutdown`] waits for the writes still running.
///
/// [`send`]: EventBusProducer::send
/// [`prepare_for_shutdown`]: EventBusProducer::prepare_for_shutdown
pub struct KurrentProducer {
    kurrent: Kurrent,
    runtime: Handle,
    topic_prefix: Option<String>,
    codec: ValueCodec,
    pending: PendingWrites,
}

impl KurrentProducer {
    pub fn new(kurrent: Kurrent, topic_prefix: Option<String>, codec: ValueCodec) -> Result<Self, Error> {
        let runtime = Handle::try_current().map_err(|e| {
            Error::invalid_config(format!("the KurrentDB producer needs a tokio runtime: {e}"), None)
        })?;
        Ok(Self {
            kurrent,
            runtime,
            topic_prefix,
            codec,
            pending: PendingWrites::default(),
        })
    }
}

#[async_trait]
impl EventBusProducer for KurrentProducer {
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
        let kurrent = self.kurrent.clone();
        let event_id = metadata.id;
        self.pending.spawn(&self.runtime, async move {
            if let Err(e) = kurrent.append(&record, event_id).await {
                error!(
                    topic = %record.topic,
                    key = %record.key,
                    event_id = %event_id,
                    error = %e,
                    "Failed to append event to KurrentDB"
                );
            }
        });
        Ok(())
    }

    async fn prepare_for_shutdown(&self) {
        self.pending.drain().await;
    }
}

pub struct KurrentConsumer {
    kurrent: Kurrent,
    driver: ConsumerDriver,
    buffer_size: Option<usize>,
    backoff: Backoff,
}

impl KurrentConsumer {
    pub fn new(kurrent: Kurrent, driver: ConsumerDriver) -> Self {
        Self {
            kurrent,
            driver,
            buffer_size: None,
            backoff: Backoff::new(RetryDelay::default()),
        }
    }

    /// Number of in-flight events the server may push before acknowledgement.
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = Some(buffer_size);
        self
    }

    pub fn retry_delay(mut self, delay: RetryDelay) -> Self {
        self.backoff = Backoff::new(delay);
        self
    }

    async fn subscribe(&self) -> Result<PersistentSubscription, Error> {
        let topic = self.driver.topic();
        let group = self.driver.group_id();
        self.kurrent.ensure_group(topic, group).await?;
        let mut options = SubscribeToPersistentSubscriptionOptions::default();
        if let Some(buffer_size) = self.buffer_size {
            options = options.buffer_size(buffer_size);
        }
        Ok(self
            .kurrent
            .client
            .subscribe_to_persistent_subscription(topic, group, &options)
            .await?)
    }

    /// Processes events until the subscription fails.
    async fn drain(&self, subscription: &mut PersistentSubscription) -> Result<(), Error> {
        loop {
            let event = subscription.next().await?;
            match self.to_record(&event) {
                Ok(record) if self.driver.process(&record) => subscription.ack(event).await?,
                Ok(_) => {
                    subscription
                        .nack(event, NakAction::Park, "record could not be processed")
                        .await?
                }
                Err(e) => {
                    warn!(
                        topic = %self.driver.topic(),
                        error = %e,
                        "Parking event without a record envelope"
                    );
                    subscription
                        .nack(event, NakAction::Park, e.to_string())
                        .await?
                }
            }
        }
    }

    fn to_record(&self, event: &ResolvedEvent) -> Result<BusRecord, Error> {
        let original = event.get_original_event();
        record_from_parts(
            self.driver.topic(),
            original.data.clone(),
            &original.custom_metadata,
        )
    }
}

#[async_trait]
impl EventBusConsumer for KurrentConsumer {
    async fn consume_indefinitely(&mut self) -> Result<(), Error> {
        loop {
            match self.subscribe().await {
                Ok(mut subscription) => {
                    self.backoff.reset();
                    info!(
                        topic = %self.driver.topic(),
                        group_id = %self.driver.group_id(),
                        "Consuming from KurrentDB"
                    );
                    if let Err(e) = self.drain(&mut subscription).await {
                        warn!(
                            topic = %self.driver.topic(),
                            group_id = %self.driver.group_id(),
                            error = %e,
                            "KurrentDB subscription dropped"
                        );
                    }
                }
                Err(e) => warn!(
                    topic = %self.driver.topic(),
                    group_id = %self.driver.group_id(),
                    attempt = self.backoff.attempt(),
                    error = %e,
                    "Failed to subscribe to KurrentDB"
                ),
            }
            tokio::time::sleep(self.backoff.next_delay()).await;
        }
    }
}

pub fn create_producer(args: &FactoryArgs<'_>) -> Result<Component, BoxError> {
    let kurrent = Kurrent::from_settings(args.settings)?;
    let producer = KurrentProducer::new(
        kurrent,
        args.settings.topic_prefix.clone(),
        ValueCodec::default(),
    )?;
    Ok(Component::Producer(Arc::new(producer)))
}

/// Reads `buffer_size` from the consumer's extra options; other keys are
/// ignored with a warning.
pub fn create_consumer(args: &FactoryArgs<'_>) -> Result<Component, BoxError> {
    let consumer = args
        .consumer
        .ok_or("the KurrentDB consumer needs a topic, group and signal")?;
    let kurrent = Kurrent::from_settings(args.settings)?;
    let topic = full_topic_name(args.settings.topic_prefix(), &consumer.topic);
    let driver = ConsumerDriver::new(
        Arc::clone(&consumer.signal),
        topic,
        consumer.group_id.clone(),
        ValueCodec::default(),
    )?
    .debug(args.settings.debug);

    let mut built = KurrentConsumer::new(kurrent, driver);
    for (key, value) in &consumer.extra {
        match (key.as_str(), value) {
            ("buffer_size", Json::Number(n)) => {
                let size = n
                    .as_u64()
                    .and_then(|n| usize::try_from(n).ok())
                    .ok_or_else(|| format!("buffer_size must be a positive integer, got {n}"))?;
                built = built.buffer_size(size);
            }
            _ => warn!(option = %key, "Ignoring unknown KurrentDB consumer option"),
        }
    }
    Ok(Component::Consumer(Box::new(built)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> BusRecord {
        BusRecord {
            topic: "dev-xblock-published".to_string(),
            key: "block-v1:edX+D+1+type@html+block@a".to_string(),
            value: Bytes::from_static(b"Obj\x01"),
            headers: BTreeMap::from([(
                "ce_type".to_string(),
                "org.openedx.content_authoring.xblock.published.v1".to_string(),
            )]),
        }
    }

    #[test]
    fn envelopes_carry_key_and_headers() {
        let original = record();
        let metadata = envelope_bytes(&original).unwrap();
        let restored =
            record_from_parts(&original.topic, original.value.clone(), &metadata).unwrap();
        assert_eq!(restored, original);
    }

    #[test]
    fn events_without_an_envelope_are_decode_errors() {
        let err = record_from_parts("t", Bytes::new(), b"").unwrap_err();
        assert!(matches!(err, Error::Decode { .. }));
    }

    #[test]
    fn clients_need_a_runtime() {
        let settings = ConnectionSettings::builder().build().unwrap();
        assert!(matches!(Kurrent::new(&settings), Err(Error::InvalidConfig { .. })));
    }

    #[tokio::test]
    async fn clients_connect_lazily() {
        let settings = ConnectionSettings::builder().port(2199).build().unwrap();
        assert!(Kurrent::new(&settings).is_ok());
    }
}
