/// Error types for the hermes event system.
///
/// Every fallible operation in the crate returns this one error type. The first
/// five variants are the contract surfaced to callers; the rest wrap collaborators
/// (settings files, transports) and the pieces of the wire layer.
use eventstore::ClientSettingsParseError;
use std::fmt::Debug;
use thiserror::Error;

use crate::event::ReceiverError;

/// Represents errors that can occur in the hermes event system
#[derive(Debug, Error)]
pub enum Error {
    /// A signal was defined without an event type or without init data
    #[error("InstantiationError {event_type}: {message}")]
    Instantiation { event_type: String, message: String },

    /// Emitted arguments do not match the signal's declared init data
    #[error("SenderValidationError {event_type}: {message}")]
    SenderValidation { event_type: String, message: String },

    /// The producer configuration has the wrong shape or names an unknown signal
    #[error("ProducerConfigurationError{}: {message}", event_type.as_ref().map(|e| format!(" {e}")).unwrap_or_default())]
    ProducerConfiguration {
        event_type: Option<String>,
        message: String,
    },

    /// A type descriptor cannot be represented in the derived schema
    #[error("UnsupportedTypeError: {message}")]
    UnsupportedType { message: String },

    /// A primitive tree or encoded record could not be turned back into typed values
    #[error("DecodeError: {message}")]
    Decode { message: String },

    /// A value could not be converted or encoded for the wire
    #[error("EncodeError: {message}")]
    Encode { message: String },

    /// Two signals were registered under the same event type
    #[error("Signal already registered for event type '{event_type}'")]
    DuplicateSignal { event_type: String },

    /// No signal is registered for the requested event type
    #[error("No registered signal of type '{event_type}'")]
    UnknownSignal { event_type: String },

    /// An opaque key string did not match its family's format
    #[error("Invalid {family} key: '{value}'")]
    KeyFormat { family: String, value: String },

    /// A receiver failed while the signal was dispatched in fail-fast mode
    #[error("Receiver '{receiver}' failed: {source}")]
    Receiver {
        receiver: String,
        #[source]
        source: ReceiverError,
    },

    /// Indicates an invalid configuration parameter
    #[error("Invalid configuration{}: {message}", parameter.as_ref().map(|p| format!(" parameter '{p}'")).unwrap_or_default())]
    InvalidConfig {
        message: String,
        parameter: Option<String>,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    /// Indicates a failure to parse event store connection settings
    #[error(transparent)]
    TransportSettings(#[from] ClientSettingsParseError),

    /// Indicates a general event store error
    #[error(transparent)]
    Transport(#[from] eventstore::Error),
}

impl Error {
    pub fn instantiation(event_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Instantiation {
            event_type: event_type.into(),
            message: message.into(),
        }
    }

    pub fn sender_validation(event_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SenderValidation {
            event_type: event_type.into(),
            message: message.into(),
        }
    }

    pub fn producer_configuration(event_type: Option<&str>, message: impl Into<String>) -> Self {
        Self::ProducerConfiguration {
            event_type: event_type.map(str::to_string),
            message: message.into(),
        }
    }

    pub fn unsupported_type(message: impl Into<String>) -> Self {
        Self::UnsupportedType {
            message: message.into(),
        }
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    pub fn encode(message: impl Into<String>) -> Self {
        Self::Encode {
            message: message.into(),
        }
    }

    pub fn invalid_config(message: impl Into<String>, parameter: Option<&str>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
            parameter: parameter.map(str::to_string),
        }
    }

    /// True for failures the consume loop logs and skips instead of stopping on.
    pub fn is_recoverable_record_error(&self) -> bool {
        matches!(
            self,
            Self::Decode { .. } | Self::KeyFormat { .. } | Self::SenderValidation { .. }
        )
    }
}
