//! Strongly typed domain events shared between services.
//!
//! A service declares an [`EventSignal`] per event type, with the typed
//! parameters every emission carries. From that declaration hermes derives an
//! Avro schema, serializes emissions to Avro container files, and routes them
//! to an event bus according to the producer configuration. On the other side a
//! consumer decodes the records and re-emits them through the same signal.
//!
//! The event bus itself is pluggable: the [`loader`] resolves producer and
//! consumer implementations by name from [`settings::Settings`], and falls
//! back to no-ops when they cannot be loaded.
//!
//! # Examples
//!
//! Routing an emission to the in-memory bus:
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use hermes::catalog;
//! use hermes::codec::ValueCodec;
//! use hermes::custom::OpaqueKey;
//! use hermes::event::EmitOptions;
//! use hermes::memory::{MemoryBus, MemoryProducer};
//! use hermes::producer::{EventBusProducer, ProducerConfig, ProducerSource, install_routing};
//! use hermes::types::{EventData, RecordValue};
//! use serde_json::json;
//!
//! let registry = catalog::registry()?;
//! let config = ProducerConfig::from_value(
//!     &json!({
//!         catalog::XBLOCK_PUBLISHED: {
//!             "xblock-published": {"key_field_path": "xblock_info.usage_key", "enabled": true}
//!         }
//!     }),
//!     &registry,
//! )?;
//!
//! let bus = MemoryBus::new();
//! let producer: Arc<dyn EventBusProducer> =
//!     Arc::new(MemoryProducer::new(bus.clone(), None, ValueCodec::default()));
//! let source: ProducerSource = Arc::new(move || Arc::clone(&producer));
//! install_routing(&registry, &config, source)?;
//!
//! let usage_key = OpaqueKey::usage("block-v1:edX+DemoX+2024+type@html+block@intro")?;
//! registry.require(catalog::XBLOCK_PUBLISHED)?.emit(
//!     EventData::new().with(
//!         "xblock_info",
//!         RecordValue::new("XBlockData")
//!             .with("usage_key", usage_key)
//!             .with("block_type", "html"),
//!     ),
//!     EmitOptions::default(),
//! )?;
//!
//! let records = bus.records("xblock-published");
//! assert_eq!(records.len(), 1);
//! assert_eq!(records[0].key, "block-v1:edX+DemoX+2024+type@html+block@intro");
//! # Ok::<(), hermes::Error>(())
//! ```

pub mod catalog;
pub mod cli;
pub mod codec;
pub mod commands;
pub mod consumer;
pub mod custom;
mod delay;
mod error;
pub mod event;
pub mod kurrent;
pub mod loader;
pub mod memory;
pub mod producer;
pub mod schema;
pub mod settings;
pub mod types;
pub mod wire;

pub use delay::RetryDelay;
pub use error::Error;
pub use event::{EmitOptions, EventMetadata, EventSignal, EventType, SignalRegistry};
pub use producer::{BusRecord, EventBusProducer};
pub use types::{DataType, EventData, RecordType, RecordValue, Value};
