//! Resolving the configured producer and consumer implementations.
//!
//! Settings name an implementation by a dotted reference such as
//! `hermes.memory.create_producer`. The [`Loader`] maps references to factory
//! functions. Nothing here fails: a missing setting, an unknown reference, a
//! failing or panicking factory, or a factory returning the wrong kind of
//! component all log a warning and yield a no-op implementation, so a
//! misconfigured bus never takes the host service down.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use serde_json::{Map, Value as Json};
use tracing::{info, warn};

use crate::consumer::EventBusConsumer;
use crate::error::Error;
use crate::event::{EventMetadata, EventSignal};
use crate::producer::{EventBusProducer, ProducerSource};
use crate::settings::Settings;
use crate::types::EventData;
use crate::{kurrent, memory};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// What a factory builds.
pub enum Component {
    Producer(Arc<dyn EventBusProducer>),
    Consumer(Box<dyn EventBusConsumer>),
}

impl Component {
    fn kind(&self) -> &'static str {
        match self {
            Component::Producer(_) => "producer",
            Component::Consumer(_) => "consumer",
        }
    }
}

/// What a consumer is asked to consume.
#[derive(Clone)]
pub struct ConsumerArgs {
    pub topic: String,
    pub group_id: String,
    pub signal: Arc<EventSignal>,
    /// Transport specific options, passed through untouched.
    pub extra: Map<String, Json>,
}

/// Input handed to every factory. `consumer` is set only when loading a consumer.
pub struct FactoryArgs<'a> {
    pub settings: &'a Settings,
    pub consumer: Option<&'a ConsumerArgs>,
}

pub type Factory = Arc<dyn Fn(&FactoryArgs<'_>) -> Result<Component, BoxError> + Send + Sync>;

pub struct Loader {
    factories: HashMap<String, Factory>,
}

impl Loader {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// A loader knowing the in-memory and KurrentDB implementations.
    pub fn with_defaults() -> Self {
        Self::empty()
            .with(memory::CREATE_PRODUCER, memory::create_producer)
            .with(memory::CREATE_CONSUMER, memory::create_consumer)
            .with(kurrent::CREATE_PRODUCER, kurrent::create_producer)
            .with(kurrent::CREATE_CONSUMER, kurrent::create_consumer)
    }

    pub fn with<F>(mut self, reference: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&FactoryArgs<'_>) -> Result<Component, BoxError> + Send + Sync + 'static,
    {
        self.register(reference, Arc::new(factory));
        self
    }

    pub fn register(&mut self, reference: impl Into<String>, factory: Factory) {
        self.factories.insert(reference.into(), factory);
    }

    pub fn references(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Runs the factory behind `reference`, turning panics into errors.
    pub fn build(&self, reference: &str, args: &FactoryArgs<'_>) -> Result<Component, BoxError> {
        let factory = self
            .factories
            .get(reference)
            .ok_or_else(|| format!("no factory registered as '{reference}'"))?;
        catch_unwind(AssertUnwindSafe(|| factory(args))).unwrap_or_else(|payload| {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(format!("factory '{reference}' panicked: {message}").into())
        })
    }

    /// Loads the producer named by `settings.producer`, or a no-op producer.
    pub fn load_producer(&self, settings: &Settings) -> Arc<dyn EventBusProducer> {
        let Some(reference) = settings.producer.as_deref() else {
            warn!("EVENT_BUS_PRODUCER is not set; events will not be sent to the event bus");
            return Arc::new(NoopProducer);
        };
        let args = FactoryArgs {
            settings,
            consumer: None,
        };
        match self.build(reference, &args) {
            Ok(Component::Producer(producer)) => {
                info!(reference = %reference, "Loaded event bus producer");
                producer
            }
            Ok(other) => {
                warn!(
                    reference = %reference,
                    kind = other.kind(),
                    "EVENT_BUS_PRODUCER does not build a producer; using a no-op producer"
                );
                Arc::new(NoopProducer)
            }
            Err(e) => {
                warn!(
                    reference = %reference,
                    error = %e,
                    "Failed to load event bus producer; using a no-op producer"
                );
                Arc::new(NoopProducer)
            }
        }
    }

    /// Loads the consumer named by `settings.consumer`, or a no-op consumer.
    /// Consumers are never cached.
    pub fn load_consumer(&self, settings: &Settings, args: &ConsumerArgs) -> Box<dyn EventBusConsumer> {
        let Some(reference) = settings.consumer.as_deref() else {
            warn!("EVENT_BUS_CONSUMER is not set; nothing will be consumed");
            return Box::new(NoopConsumer);
        };
        let factory_args = FactoryArgs {
            settings,
            consumer: Some(args),
        };
        match self.build(reference, &factory_args) {
            Ok(Component::Consumer(consumer)) => consumer,
            Ok(other) => {
                warn!(
                    reference = %reference,
                    kind = other.kind(),
                    "EVENT_BUS_CONSUMER does not build a consumer; using a no-op consumer"
                );
                Box::new(NoopConsumer)
            }
            Err(e) => {
                warn!(
                    reference = %reference,
                    error = %e,
                    "Failed to load event bus consumer; using a no-op consumer"
                );
                Box::new(NoopConsumer)
            }
        }
    }
}

impl Default for Loader {
    fn default() -> Self {
        Self::with_defaults()
    }
}

static PRODUCER: RwLock<Option<Arc<dyn EventBusProducer>>> = RwLock::new(None);

/// The process-wide producer, loaded on first use.
pub fn get_producer(loader: &Loader, settings: &Settings) -> Arc<dyn EventBusProducer> {
    if let Some(producer) = PRODUCER.read().unwrap_or_else(PoisonError::into_inner).as_ref() {
        return Arc::clone(producer);
    }
    let mut slot = PRODUCER.write().unwrap_or_else(PoisonError::into_inner);
    if let Some(producer) = slot.as_ref() {
        return Arc::clone(producer);
    }
    let producer = loader.load_producer(settings);
    *slot = Some(Arc::clone(&producer));
    producer
}

/// Drops the cached producer when the producer setting changes. Other names
/// are ignored.
pub fn settings_changed(name: &str) {
    if matches!(name, "producer" | "EVENT_BUS_PRODUCER") {
        PRODUCER
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

/// A [`ProducerSource`] over the process-wide producer.
/// Lets the cached producer, if one was loaded, finish what it is sending.
pub async fn shutdown_producer() {
    let producer = PRODUCER
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    if let Some(producer) = producer {
        producer.prepare_for_shutdown().await;
    }
}

pub fn producer_source(loader: Arc<Loader>, settings: Arc<Settings>) -> ProducerSource {
    Arc::new(move || get_producer(&loader, &settings))
}

/// Accepts and drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProducer;

impl EventBusProducer for NoopProducer {
    fn send(
        &self,
        _signal: &EventSignal,
        _topic: &str,
        _key_field_path: &str,
        _data: &EventData,
        _metadata: &EventMetadata,
    ) -> Result<(), Error> {
        Ok(())
    }

    fn is_noop(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopConsumer;

#[async_trait]
impl EventBusConsumer for NoopConsumer {
    async fn consume_indefinitely(&mut self) -> Result<(), Error> {
        Ok(())
    }
}
