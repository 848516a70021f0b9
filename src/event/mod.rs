//! Signal definitions and in-process emission.
//!
//! An [`EventSignal`] binds a versioned event type to the ordered, typed
//! parameters every emission must carry. Emitting validates the supplied
//! [`EventData`] against those parameters, stamps fresh [`EventMetadata`] and
//! then calls every connected receiver in connection order, on the caller's
//! thread.
//!
//! Dispatch has two modes. Fail-fast returns the first receiver error (and lets
//! panics unwind); it applies when the caller asks for it, when debug is set, or
//! when the signal allows send failures. Otherwise every receiver runs, and each
//! outcome, including a caught panic, comes back in a [`ReceiverResponse`].
//!
//! # Examples
//!
//! ```rust
//! use hermes::event::{EmitOptions, EventSignal};
//! use hermes::types::{DataType, EventData, RecordType, RecordValue};
//!
//! let signal = EventSignal::builder("org.example.user.created.v1")
//!     .init_data(
//!         "user",
//!         DataType::record(
//!             RecordType::builder("UserData")
//!                 .field("id", DataType::long())
//!                 .build(),
//!         ),
//!     )
//!     .build()?;
//!
//! signal.connect("audit", |emission| {
//!     assert_eq!(emission.metadata.event_type, "org.example.user.created.v1");
//!     Ok(())
//! });
//!
//! let data = EventData::new().with("user", RecordValue::new("UserData").with("id", 7_i64));
//! let responses = signal.emit(data, EmitOptions::default())?;
//! assert!(responses[0].outcome.is_ok());
//! # Ok::<(), hermes::Error>(())
//! ```

mod metadata;
pub mod registry;

pub use metadata::{EventMetadata, SourceInfo, configure_source};
pub use registry::{SignalRegistry, SignalRegistryBuilder};

use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use nutype::nutype;
use tracing::{info, warn};

use crate::error::Error;
use crate::types::{DataType, EventData, RecordScope};

/// A dotted event type ending in a `.vN` version segment, such as
/// `org.openedx.learning.course.enrollment.created.v1`.
#[nutype(
    sanitize(trim),
    validate(predicate = |event_type: &str| is_event_type(event_type)),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        PartialOrd,
        Ord,
        AsRef,
        Display,
        TryFrom,
        FromStr,
        Serialize,
        Deserialize
    )
)]
pub struct EventType(String);

fn is_event_type(event_type: &str) -> bool {
    let segments: Vec<_> = event_type.split('.').collect();
    let well_formed = segments.len() >= 2
        && segments.iter().all(|segment| {
            !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        });
    well_formed
        && segments.last().is_some_and(|version| {
            version
                .strip_prefix('v')
                .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
        })
}

/// The failure of one receiver, either returned by it or caught from a panic.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct ReceiverError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl ReceiverError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn from_error(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self {
            message: error.to_string(),
            source: Some(Box::new(error)),
        }
    }

    fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let detail = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Self::new(format!("receiver panicked: {detail}"))
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<Error> for ReceiverError {
    fn from(error: Error) -> Self {
        Self::from_error(error)
    }
}

/// What a receiver sees for one emission.
pub struct Emission<'a> {
    pub signal: &'a EventSignal,
    pub metadata: &'a EventMetadata,
    pub data: &'a EventData,
}

type ReceiverFn = dyn Fn(&Emission<'_>) -> Result<(), ReceiverError> + Send + Sync;

#[derive(Clone)]
struct Receiver {
    id: String,
    callback: Arc<ReceiverFn>,
}

/// One receiver's outcome in a fail-isolated dispatch.
#[derive(Debug)]
pub struct ReceiverResponse {
    pub receiver: String,
    pub outcome: Result<(), ReceiverError>,
}

#[derive(Debug, Clone, Copy)]
pub struct EmitOptions {
    /// Isolate receiver failures instead of stopping at the first one.
    pub send_robust: bool,
    /// Forces fail-fast dispatch, as `send_robust: false` does.
    pub debug: bool,
}

impl Default for EmitOptions {
    fn default() -> Self {
        Self {
            send_robust: true,
            debug: false,
        }
    }
}

impl EmitOptions {
    pub fn fail_fast() -> Self {
        Self {
            send_robust: false,
            debug: false,
        }
    }
}

/// A versioned event definition with its receivers.
pub struct EventSignal {
    event_type: EventType,
    init_data: Vec<(String, DataType)>,
    scope: RecordScope,
    minor_version: u32,
    allow_send_failure: bool,
    enabled: AtomicBool,
    receivers: RwLock<Vec<Receiver>>,
}

pub struct EventSignalBuilder {
    event_type: String,
    init_data: Vec<(String, DataType)>,
    minor_version: u32,
    allow_send_failure: bool,
}

impl EventSignalBuilder {
    /// Declares the next parameter. Parameters keep their declaration order.
    pub fn init_data(mut self, name: impl Into<String>, data_type: DataType) -> Self {
        self.init_data.push((name.into(), data_type));
        self
    }

    pub fn minor_version(mut self, minor_version: u32) -> Self {
        self.minor_version = minor_version;
        self
    }

    /// Makes every emission of this signal fail fast.
    pub fn allow_send_failure(mut self, allow: bool) -> Self {
        self.allow_send_failure = allow;
        self
    }

    /// # Errors
    ///
    /// [`Error::Instantiation`] when the event type is missing or malformed, when
    /// no parameters are declared, or when a parameter is declared twice.
    pub fn build(self) -> Result<Arc<EventSignal>, Error> {
        if self.event_type.trim().is_empty() {
            return Err(Error::instantiation(
                self.event_type,
                "Missing required argument 'event_type'",
            ));
        }
        if self.init_data.is_empty() {
            return Err(Error::instantiation(
                self.event_type,
                "Missing required argument 'init_data'",
            ));
        }
        let mut seen = HashSet::new();
        if let Some((duplicate, _)) = self.init_data.iter().find(|(name, _)| !seen.insert(name)) {
            return Err(Error::instantiation(
                self.event_type.clone(),
                format!("init_data declares '{duplicate}' more than once"),
            ));
        }
        let event_type = EventType::try_new(self.event_type.clone()).map_err(|_| {
            Error::instantiation(
                self.event_type.clone(),
                "event_type must be a dotted name ending in a '.vN' version",
            )
        })?;

        let scope = RecordScope::of_all(self.init_data.iter().map(|(_, data_type)| data_type));
        Ok(Arc::new(EventSignal {
            event_type,
            init_data: self.init_data,
            scope,
            minor_version: self.minor_version,
            allow_send_failure: self.allow_send_failure,
            enabled: AtomicBool::new(true),
            receivers: RwLock::new(Vec::new()),
        }))
    }
}

impl EventSignal {
    pub fn builder(event_type: impl Into<String>) -> EventSignalBuilder {
        EventSignalBuilder {
            event_type: event_type.into(),
            init_data: Vec::new(),
            minor_version: 0,
            allow_send_failure: false,
        }
    }

    pub fn event_type(&self) -> &EventType {
        &self.event_type
    }

    pub fn init_data(&self) -> &[(String, DataType)] {
        &self.init_data
    }

    pub fn minor_version(&self) -> u32 {
        self.minor_version
    }

    pub fn allows_send_failure(&self) -> bool {
        self.allow_send_failure
    }

    /// Records reachable from the declared parameters, for resolving named
    /// references.
    pub fn record_scope(&self) -> RecordScope {
        self.scope.clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    /// Turns emission into a no-op. Meant for tests.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    /// Connects a receiver under `id`. Connecting again with the same id
    /// replaces the earlier receiver in place.
    pub fn connect<F>(&self, id: impl Into<String>, receiver: F)
    where
        F: Fn(&Emission<'_>) -> Result<(), ReceiverError> + Send + Sync + 'static,
    {
        let receiver = Receiver {
            id: id.into(),
            callback: Arc::new(receiver),
        };
        let mut receivers = self.receivers.write().unwrap_or_else(PoisonError::into_inner);
        match receivers.iter_mut().find(|r| r.id == receiver.id) {
            Some(slot) => *slot = receiver,
            None => receivers.push(receiver),
        }
    }

    pub fn disconnect(&self, id: &str) -> bool {
        let mut receivers = self.receivers.write().unwrap_or_else(PoisonError::into_inner);
        let before = receivers.len();
        receivers.retain(|r| r.id != id);
        receivers.len() != before
    }

    pub fn receiver_ids(&self) -> Vec<String> {
        self.receivers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|r| r.id.clone())
            .collect()
    }

    /// Validates `data`, generates metadata and dispatches to every receiver.
    ///
    /// A disabled signal returns no responses without validating.
    ///
    /// # Errors
    ///
    /// [`Error::SenderValidation`] when `data` does not match the declared
    /// parameters, and [`Error::Receiver`] for a receiver failure in fail-fast
    /// mode.
    pub fn emit(&self, data: EventData, options: EmitOptions) -> Result<Vec<ReceiverResponse>, Error> {
        if !self.is_enabled() {
            return Ok(Vec::new());
        }
        self.validate(&data)?;
        let metadata = EventMetadata::generate(&self.event_type, self.minor_version);
        self.dispatch(&metadata, &data, options)
    }

    /// Emits with metadata received from elsewhere, as consumers do when they
    /// replay an event from the bus.
    pub fn emit_with_metadata(
        &self,
        metadata: EventMetadata,
        data: EventData,
        options: EmitOptions,
    ) -> Result<Vec<ReceiverResponse>, Error> {
        if metadata.event_type != self.event_type.as_ref() {
            return Err(Error::sender_validation(
                self.event_type.as_ref(),
                format!(
                    "metadata is for '{}', not this signal",
                    metadata.event_type
                ),
            ));
        }
        if !self.is_enabled() {
            return Ok(Vec::new());
        }
        self.validate(&data)?;
        self.dispatch(&metadata, &data, options)
    }

    /// Bypasses validation and metadata, so it only warns and dispatches nothing.
    #[deprecated(note = "use `emit`, which validates arguments and attaches metadata")]
    pub fn send(&self, _data: EventData) -> Vec<ReceiverResponse> {
        warn!(
            event_type = %self.event_type,
            "send called on an event signal; use emit instead"
        );
        Vec::new()
    }

    #[deprecated(note = "use `emit`, which validates arguments and attaches metadata")]
    pub fn send_robust(&self, _data: EventData) -> Vec<ReceiverResponse> {
        warn!(
            event_type = %self.event_type,
            "send_robust called on an event signal; use emit instead"
        );
        Vec::new()
    }

    fn validate(&self, data: &EventData) -> Result<(), Error> {
        for (name, data_type) in &self.init_data {
            let value = match data.get(name) {
                Some(value) if !value.is_null() => value,
                _ => {
                    return Err(Error::sender_validation(
                        self.event_type.as_ref(),
                        format!("Missing required argument '{name}'"),
                    ));
                }
            };
            if !data_type.accepts_in(value, &self.scope) {
                return Err(Error::sender_validation(
                    self.event_type.as_ref(),
                    format!(
                        "The argument '{name}' is not instance of the Class Attribute '{}'",
                        data_type.type_name()
                    ),
                ));
            }
        }
        if data.len() != self.init_data.len() {
            return Err(Error::sender_validation(
                self.event_type.as_ref(),
                "There's a mismatch between initialization data and send_event arguments",
            ));
        }
        Ok(())
    }

    fn dispatch(
        &self,
        metadata: &EventMetadata,
        data: &EventData,
        options: EmitOptions,
    ) -> Result<Vec<ReceiverResponse>, Error> {
        let receivers = self
            .receivers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let emission = Emission {
            signal: self,
            metadata,
            data,
        };

        if !options.send_robust || options.debug || self.allow_send_failure {
            let mut responses = Vec::with_capacity(receivers.len());
            for receiver in receivers {
                (receiver.callback)(&emission).map_err(|source| Error::Receiver {
                    receiver: receiver.id.clone(),
                    source,
                })?;
                responses.push(ReceiverResponse {
                    receiver: receiver.id,
                    outcome: Ok(()),
                });
            }
            return Ok(responses);
        }

        let responses: Vec<_> = receivers
            .into_iter()
            .map(|receiver| {
                let outcome = catch_unwind(AssertUnwindSafe(|| (receiver.callback)(&emission)))
                    .unwrap_or_else(|payload| Err(ReceiverError::from_panic(payload)));
                ReceiverResponse {
                    receiver: receiver.id,
                    outcome,
                }
            })
            .collect();

        info!(
            event_type = %self.event_type,
            event_id = %metadata.id,
            responses = ?ResponseSummary(&responses),
            "Responses of the event dispatch"
        );
        Ok(responses)
    }
}

impl fmt::Debug for EventSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSignal")
            .field("event_type", &self.event_type)
            .field("init_data", &self.init_data)
            .field("minor_version", &self.minor_version)
            .field("allow_send_failure", &self.allow_send_failure)
            .field("enabled", &self.is_enabled())
            .field("receivers", &self.receiver_ids())
            .finish()
    }
}

/// Logs each response as `receiver: ok` or `receiver: error message`.
struct ResponseSummary<'a>(&'a [ReceiverResponse]);

impl fmt::Debug for ResponseSummary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.0.iter().map(|response| {
                let outcome = match &response.outcome {
                    Ok(()) => "ok".to_string(),
                    Err(e) => format!("error: {e}"),
                };
                (response.receiver.as_str(), outcome)
            }))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RecordType, RecordValue, Value};
    use std::sync::Mutex;

    fn user_signal() -> Arc<EventSignal> {
        EventSignal::builder("org.example.user.created.v1")
            .init_data(
                "user",
                DataType::record(
                    RecordType::builder("UserData")
                        .field("id", DataType::long())
                        .field("username", DataType::string())
                        .nullable("email", DataType::string())
                        .build(),
                ),
            )
            .build()
            .unwrap()
    }

    fn user_data() -> EventData {
        EventData::new().with(
            "user",
            RecordValue::new("UserData").with("id", 1_i64).with("username", "ada"),
        )
    }

    #[test]
    fn event_types_need_a_version_suffix() {
        assert!(EventType::try_new("org.example.thing.v1").is_ok());
        assert!(EventType::try_new("org.example.thing.v12").is_ok());
        assert!(EventType::try_new("org.example.thing").is_err());
        assert!(EventType::try_new("org..thing.v1").is_err());
        assert!(EventType::try_new("v1").is_err());
    }

    #[test]
    fn building_without_event_type_or_init_data_fails() {
        let err = EventSignal::builder("")
            .init_data("user", DataType::string())
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("Missing required argument 'event_type'"));

        let err = EventSignal::builder("org.example.thing.v1").build().unwrap_err();
        assert!(matches!(err, Error::Instantiation { .. }));
    }

    #[test]
    fn missing_argument_is_reported_by_name() {
        let signal = user_signal();
        let data = EventData::new().with("student", "ada");
        let err = signal.emit(data, EmitOptions::default()).unwrap_err();
        assert!(err.to_string().contains("Missing required argument 'user'"));
    }

    #[test]
    fn null_counts_as_missing() {
        let signal = user_signal();
        let data = EventData::new().with("user", Value::Null);
        let err = signal.emit(data, EmitOptions::default()).unwrap_err();
        assert!(err.to_string().contains("Missing required argument 'user'"));
    }

    #[test]
    fn wrong_type_names_the_expected_class() {
        let signal = user_signal();
        let data = EventData::new().with("user", RecordValue::new("Student").with("id", 1_i64));
        let err = signal.emit(data, EmitOptions::default()).unwrap_err();
        assert!(
            err.to_string()
                .contains("The argument 'user' is not instance of the Class Attribute 'UserData'")
        );
    }

    #[test]
    fn extra_arguments_are_a_mismatch() {
        let signal = user_signal();
        let data = user_data().with("extra", 1_i64);
        let err = signal.emit(data, EmitOptions::default()).unwrap_err();
        assert!(err.to_string().contains("There's a mismatch"));
    }

    #[test]
    fn disabled_signals_return_no_responses() {
        let signal = user_signal();
        signal.connect("never", |_| panic!("should not run"));
        signal.disable();
        assert!(signal.emit(EventData::new(), EmitOptions::default()).unwrap().is_empty());
        signal.enable();
        assert!(signal.is_enabled());
    }

    #[test]
    fn robust_dispatch_isolates_errors_and_panics() {
        let signal = user_signal();
        let calls = Arc::new(Mutex::new(Vec::new()));

        let seen = Arc::clone(&calls);
        signal.connect("fails", move |_| {
            seen.lock().unwrap().push("fails");
            Err(ReceiverError::new("boom"))
        });
        signal.connect("panics", |_| panic!("kaboom"));
        let seen = Arc::clone(&calls);
        signal.connect("works", move |emission| {
            assert_eq!(emission.metadata.minor_version, 0);
            seen.lock().unwrap().push("works");
            Ok(())
        });

        let responses = signal.emit(user_data(), EmitOptions::default()).unwrap();
        assert_eq!(responses.len(), 3);
        assert_eq!(responses[0].outcome.as_ref().unwrap_err().message(), "boom");
        assert!(
            responses[1]
                .outcome
                .as_ref()
                .unwrap_err()
                .message()
                .contains("kaboom")
        );
        assert!(responses[2].outcome.is_ok());
        assert_eq!(*calls.lock().unwrap(), vec!["fails", "works"]);
    }

    #[test]
    fn fail_fast_stops_at_the_first_error() {
        let signal = user_signal();
        let reached = Arc::new(AtomicBool::new(false));
        signal.connect("fails", |_| Err(ReceiverError::new("boom")));
        let flag = Arc::clone(&reached);
        signal.connect("after", move |_| {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });

        let err = signal.emit(user_data(), EmitOptions::fail_fast()).unwrap_err();
        assert!(matches!(err, Error::Receiver { ref receiver, .. } if receiver == "fails"));
        assert!(!reached.load(Ordering::SeqCst));

        let debug = EmitOptions {
            send_robust: true,
            debug: true,
        };
        assert!(signal.emit(user_data(), debug).is_err());
    }

    #[test]
    fn allow_send_failure_forces_fail_fast() {
        let signal = EventSignal::builder("org.example.thing.v1")
            .init_data("name", DataType::string())
            .allow_send_failure(true)
            .build()
            .unwrap();
        signal.connect("fails", |_| Err(ReceiverError::new("boom")));
        let data = EventData::new().with("name", "x");
        assert!(signal.emit(data, EmitOptions::default()).is_err());
    }

    #[test]
    fn reconnecting_an_id_replaces_the_receiver() {
        let signal = user_signal();
        signal.connect("r", |_| Err(ReceiverError::new("old")));
        signal.connect("r", |_| Ok(()));
        assert_eq!(signal.receiver_ids(), vec!["r".to_string()]);
        let responses = signal.emit(user_data(), EmitOptions::default()).unwrap();
        assert!(responses[0].outcome.is_ok());
        assert!(signal.disconnect("r"));
        assert!(!signal.disconnect("r"));
    }

    #[test]
    fn metadata_for_another_signal_is_rejected() {
        let signal = user_signal();
        let metadata = EventMetadata::generate(
            &EventType::try_new("org.example.other.v1").unwrap(),
            0,
        );
        assert!(matches!(
            signal.emit_with_metadata(metadata, user_data(), EmitOptions::default()),
            Err(Error::SenderValidation { .. })
        ));
    }

    #[test]
    #[allow(deprecated)]
    fn deprecated_send_dispatches_nothing() {
        let signal = user_signal();
        signal.connect("never", |_| panic!("should not run"));
        assert!(signal.send(user_data()).is_empty());
        assert!(signal.send_robust(user_data()).is_empty());
    }
}
