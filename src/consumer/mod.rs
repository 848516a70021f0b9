//! Receiving events from the bus and replaying them as local emissions.
//!
//! A transport yields [`BusRecord`]s; [`ConsumerDriver`] turns each one back
//! into the signal's data and emits it with the metadata carried in the record
//! headers. Records that cannot be decoded are logged and skipped so one bad
//! record never stops a consumer.

use std::pin::pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use tracing::{debug, error, warn};

use crate::codec::ValueCodec;
use crate::error::Error;
use crate::event::{EmitOptions, EventMetadata, EventSignal, ReceiverResponse};
use crate::producer::BusRecord;
use crate::schema::{Schema, derive_schema};
use crate::wire;

/// Records as a transport delivers them. Transport failures arrive in-band.
pub type RecordStream = BoxStream<'static, Result<BusRecord, Error>>;

/// A long-running consumer bound to one topic, group and signal.
#[async_trait]
pub trait EventBusConsumer: Send {
    /// Processes records until the transport ends or the future is dropped.
    async fn consume_indefinitely(&mut self) -> Result<(), Error>;
}

/// Decodes records of one topic and emits them through their signal.
pub struct ConsumerDriver {
    signal: Arc<EventSignal>,
    topic: String,
    group_id: String,
    codec: ValueCodec,
    reader: Schema,
    options: EmitOptions,
}

impl ConsumerDriver {
    /// # Errors
    ///
    /// [`Error::UnsupportedType`] when no schema can be derived for the signal.
    pub fn new(
        signal: Arc<EventSignal>,
        topic: impl Into<String>,
        group_id: impl Into<String>,
        codec: ValueCodec,
    ) -> Result<Self, Error> {
        let reader = derive_schema(&signal, codec.registry())?;
        Ok(Self {
            signal,
            topic: topic.into(),
            group_id: group_id.into(),
            codec,
            reader,
            options: EmitOptions::default(),
        })
    }

    /// Re-emits fail-fast, so the first receiver error fails the record.
    pub fn debug(mut self, debug: bool) -> Self {
        self.options.debug = debug;
        self
    }

    pub fn signal(&self) -> &Arc<EventSignal> {
        &self.signal
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Decodes one record and emits it.
    ///
    /// The record must carry the signal's event type in `ce_type`. Its value is
    /// resolved against the schema derived from the signal, so records written
    /// with an older or newer compatible schema still decode.
    pub fn handle_record(&self, record: &BusRecord) -> Result<Vec<ReceiverResponse>, Error> {
        let expected = self.signal.event_type().as_ref();
        match record.event_type() {
            Some(event_type) if event_type == expected => {}
            Some(event_type) => {
                return Err(Error::decode(format!(
                    "record of type '{event_type}' on a consumer for '{expected}'"
                )));
            }
            None => return Err(Error::decode("record has no ce_type header")),
        }

        let metadata = EventMetadata::from_headers(&record.headers)?;
        let datum = wire::decode_event(&record.value, &self.reader)?;
        let data = self.codec.deserialize_event_data(&self.signal, &datum)?;
        self.signal
            .emit_with_metadata(metadata, data, self.options)
    }

    /// Handles a record and logs the outcome. Returns whether the record was
    /// emitted.
    pub fn process(&self, record: &BusRecord) -> bool {
        match self.handle_record(record) {
            Ok(responses) => {
                for response in &responses {
                    if let Err(e) = &response.outcome {
                        error!(
                            event_type = %self.signal.event_type(),
                            receiver = %response.receiver,
                            error = %e,
                            "Receiver failed while handling a consumed event"
                        );
                    }
                }
                debug!(
                    topic = %self.topic,
                    key = %record.key,
                    receivers = responses.len(),
                    "Consumed event"
                );
                true
            }
            Err(e) if e.is_recoverable_record_error() => {
                warn!(
                    topic = %self.topic,
                    group_id = %self.group_id,
                    key = %record.key,
                    error = %e,
                    "Skipping record that could not be decoded"
                );
                false
            }
            Err(e) => {
                error!(
                    topic = %self.topic,
                    group_id = %self.group_id,
                    key = %record.key,
                    error = %e,
                    "Skipping record after a processing failure"
                );
                false
            }
        }
    }

    /// Processes records serially until the stream ends.
    pub async fn run<S>(&self, records: S) -> Result<(), Error>
    where
        S: Stream<Item = Result<BusRecord, Error>> + Send,
    {
        let mut records = pin!(records);
        while let Some(next) = records.next().await {
            match next {
                Ok(record) => {
                    self.process(&record);
                }
                Err(e) => warn!(
                    topic = %self.topic,
                    group_id = %self.group_id,
                    error = %e,
                    "Transport error while consuming"
                ),
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for ConsumerDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerDriver")
            .field("event_type", self.signal.event_type())
            .field("topic", &self.topic)
            .field("group_id", &self.group_id)
            .field("debug", &self.options.debug)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog;
    use crate::custom::OpaqueKey;
    use crate::types::{EventData, RecordValue};
    use std::sync::Mutex;

    fn published() -> Arc<EventSignal> {
        catalog::registry()
            .unwrap()
            .require(catalog::XBLOCK_PUBLISHED)
            .unwrap()
            .clone()
    }

    fn data() -> EventData {
        let key = OpaqueKey::usage("block-v1:edX+DemoX+2024+type@html+block@intro").unwrap();
        EventData::new().with(
            "xblock_info",
            RecordValue::new("XBlockData")
                .with("usage_key", key)
                .with("block_type", "html")
                .with("version", 4_i64),
        )
    }

    fn record(signal: &EventSignal, data: &EventData) -> BusRecord {
        let metadata = EventMetadata::generate(signal.event_type(), signal.minor_version());
        BusRecord::encode(
            signal,
            "xblock-published",
            "xblock_info.usage_key",
            data,
            &metadata,
            &ValueCodec::default(),
        )
        .unwrap()
    }

    fn capture(signal: &EventSignal) -> Arc<Mutex<Vec<EventData>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        signal.connect("test.capture", move |emission| {
            sink.lock().unwrap().push(emission.data.clone());
            Ok(())
        });
        seen
    }

    #[test]
    fn handled_records_are_emitted_with_their_data() {
        let signal = published();
        let seen = capture(&signal);
        let driver =
            ConsumerDriver::new(Arc::clone(&signal), "xblock-published", "g", ValueCodec::default())
                .unwrap();

        let responses = driver.handle_record(&record(&signal, &data())).unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(seen.lock().unwrap().as_slice(), &[data()]);
    }

    #[test]
    fn debug_mode_surfaces_receiver_failures() {
        let signal = published();
        signal.connect("test.failing", |_| Err(crate::event::ReceiverError::new("index offline")));
        let record = record(&signal, &data());

        let isolated =
            ConsumerDriver::new(Arc::clone(&signal), "xblock-published", "g", ValueCodec::default())
                .unwrap();
        let responses = isolated.handle_record(&record).unwrap();
        assert!(responses.iter().any(|r| r.outcome.is_err()));

        let fail_fast = isolated.debug(true);
        let err = fail_fast.handle_record(&record).unwrap_err();
        assert!(matches!(err, Error::Receiver { .. }), "{err}");
        assert!(!fail_fast.process(&record));
    }

    #[test]
    fn records_of_another_type_are_rejected() {
        let signal = published();
        let mut foreign = record(&signal, &data());
        foreign
            .headers
            .insert("ce_type".to_string(), catalog::XBLOCK_DELETED.to_string());
        let driver =
            ConsumerDriver::new(signal, "xblock-published", "g", ValueCodec::default()).unwrap();

        let err = driver.handle_record(&foreign).unwrap_err();
        assert!(matches!(err, Error::Decode { .. }));
    }

    #[test]
    fn unserializable_signals_cannot_be_consumed() {
        let signal = catalog::registry()
            .unwrap()
            .require(catalog::COURSE_DISCUSSIONS_CHANGED)
            .unwrap()
            .clone();
        let result = ConsumerDriver::new(signal, "discussions", "g", ValueCodec::default());
        assert!(matches!(result, Err(Error::UnsupportedType { .. })));
    }

    #[tokio::test]
    async fn run_skips_bad_records_and_keeps_going() {
        let signal = published();
        let seen = capture(&signal);
        let driver =
            ConsumerDriver::new(Arc::clone(&signal), "xblock-published", "g", ValueCodec::default())
                .unwrap();

        let mut corrupt = record(&signal, &data());
        corrupt.value = bytes::Bytes::from_static(b"not a container");
        let records = futures::stream::iter(vec![
            Ok(corrupt),
            Err(Error::decode("connection reset")),
            Ok(record(&signal, &data())),
        ]);

        driver.run(records).await.unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}
