//! The table of known signals, keyed by event type.
//!
//! Registries are built once and never change afterwards. The process-wide
//! registry returned by [`global`] holds the built-in catalog unless the
//! application called [`install`] with its own registry first.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use super::EventSignal;
use crate::catalog;
use crate::error::Error;

#[derive(Debug, Clone, Default)]
pub struct SignalRegistry {
    signals: BTreeMap<String, Arc<EventSignal>>,
}

#[derive(Debug, Default)]
pub struct SignalRegistryBuilder {
    signals: BTreeMap<String, Arc<EventSignal>>,
}

impl SignalRegistryBuilder {
    /// # Errors
    ///
    /// [`Error::DuplicateSignal`] when a signal with the same event type is
    /// already registered.
    pub fn register(mut self, signal: Arc<EventSignal>) -> Result<Self, Error> {
        let event_type = signal.event_type().to_string();
        if self.signals.contains_key(&event_type) {
            return Err(Error::DuplicateSignal { event_type });
        }
        self.signals.insert(event_type, signal);
        Ok(self)
    }

    pub fn register_all(
        self,
        signals: impl IntoIterator<Item = Arc<EventSignal>>,
    ) -> Result<Self, Error> {
        signals.into_iter().try_fold(self, Self::register)
    }

    pub fn build(self) -> SignalRegistry {
        SignalRegistry {
            signals: self.signals,
        }
    }
}

impl SignalRegistry {
    pub fn builder() -> SignalRegistryBuilder {
        SignalRegistryBuilder::default()
    }

    /// A builder holding every signal of this registry, to extend it.
    pub fn to_builder(&self) -> SignalRegistryBuilder {
        SignalRegistryBuilder {
            signals: self.signals.clone(),
        }
    }

    pub fn get(&self, event_type: &str) -> Option<&Arc<EventSignal>> {
        self.signals.get(event_type)
    }

    /// Like [`get`](Self::get), with [`Error::UnknownSignal`] for a miss.
    pub fn require(&self, event_type: &str) -> Result<&Arc<EventSignal>, Error> {
        self.get(event_type).ok_or_else(|| Error::UnknownSignal {
            event_type: event_type.to_string(),
        })
    }

    pub fn contains(&self, event_type: &str) -> bool {
        self.signals.contains_key(event_type)
    }

    /// Signals in event type order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<EventSignal>> {
        self.signals.values()
    }

    pub fn event_types(&self) -> impl Iterator<Item = &str> {
        self.signals.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.signals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }
}

static GLOBAL: OnceLock<SignalRegistry> = OnceLock::new();

/// The process-wide registry, seeded with the built-in catalog on first use.
pub fn global() -> Result<&'static SignalRegistry, Error> {
    if let Some(registry) = GLOBAL.get() {
        return Ok(registry);
    }
    let registry = catalog::registry()?;
    Ok(GLOBAL.get_or_init(|| registry))
}

/// Installs the process-wide registry.
///
/// # Errors
///
/// [`Error::InvalidConfig`] when a registry is already in place, including one
/// seeded implicitly by an earlier call to [`global`].
pub fn install(registry: SignalRegistry) -> Result<(), Error> {
    GLOBAL
        .set(registry)
        .map_err(|_| Error::invalid_config("the signal registry is already initialized", None))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DataType;

    fn signal(event_type: &str) -> Arc<EventSignal> {
        EventSignal::builder(event_type)
            .init_data("name", DataType::string())
            .build()
            .unwrap()
    }

    #[test]
    fn duplicate_event_types_fail_at_registration() {
        let err = SignalRegistry::builder()
            .register(signal("org.example.a.v1"))
            .unwrap()
            .register(signal("org.example.a.v1"))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateSignal { ref event_type } if event_type == "org.example.a.v1"));
    }

    #[test]
    fn iteration_is_sorted_by_event_type() {
        let registry = SignalRegistry::builder()
            .register_all([signal("org.example.b.v1"), signal("org.example.a.v1")])
            .unwrap()
            .build();
        let types: Vec<_> = registry.event_types().collect();
        assert_eq!(types, vec!["org.example.a.v1", "org.example.b.v1"]);
    }

    #[test]
    fn require_reports_unknown_signals() {
        let registry = SignalRegistry::builder().build();
        let err = registry.require("org.example.missing.v1").unwrap_err();
        assert_eq!(err.to_string(), "No registered signal of type 'org.example.missing.v1'");
    }

    #[test]
    fn global_holds_the_catalog() {
        let registry = global().unwrap();
        assert!(registry.contains(catalog::XBLOCK_PUBLISHED));
    }
}
