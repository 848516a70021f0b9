use serde_json::{Map, Value as Json};
use tracing::info;

use crate::catalog;
use crate::error::Error;
use crate::event::SignalRegistry;
use crate::loader::{ConsumerArgs, Loader, shutdown_producer};
use crate::settings::Settings;

#[derive(Debug, Clone, Default)]
pub struct ConsumeRequest {
    pub topic: String,
    pub group_id: String,
    pub signal: String,
    /// Options for the consumer implementation.
    pub extra: Map<String, Json>,
}

/// Builds the configured consumer for one signal and runs it.
///
/// Unserializable signals are skipped with an info log. Returns when the
/// consumer stops, after the cached producer has finished its sends.
///
/// # Errors
///
/// [`Error::UnknownSignal`] for an unregistered event type, or whatever the
/// consumer fails with.
pub async fn consume_events(
    registry: &SignalRegistry,
    loader: &Loader,
    settings: &Settings,
    request: ConsumeRequest,
) -> Result<(), Error> {
    let signal = registry.require(&request.signal)?;
    if catalog::is_unserializable(&request.signal) {
        info!(
            event_type = %request.signal,
            "Signal has no serializable schema; not consuming"
        );
        return Ok(());
    }

    let args = ConsumerArgs {
        topic: request.topic,
        group_id: request.group_id,
        signal: signal.clone(),
        extra: request.extra,
    };
    info!(
        event_type = %request.signal,
        topic = %args.topic,
        group_id = %args.group_id,
        "Starting event consumer"
    );
    let mut consumer = loader.load_consumer(settings, &args);
    let result = consumer.consume_indefinitely().await;
    shutdown_producer().await;
    result
}
