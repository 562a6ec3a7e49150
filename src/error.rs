//! Error types
//!
//! One enum per failure domain. Configuration errors are fatal at
//! construction; transport and transform errors are recoverable and are
//! either retried by the coordinator or surfaced to a write caller.

use thiserror::Error;

/// Descriptor validation failure. The coordinator refuses to start with one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("service identifier {0} is declared more than once")]
    DuplicateService(String),

    #[error("service {service}: characteristic identifier {characteristic} is declared more than once")]
    DuplicateCharacteristic {
        service: String,
        characteristic: String,
    },

    #[error("service {service}: characteristic {characteristic} reuses result key `{key}`")]
    DuplicateKey {
        service: String,
        characteristic: String,
        key: String,
    },

    #[error("service {service}: characteristic {characteristic} uses {strategy} without the {missing} property")]
    IncompatibleStrategy {
        service: String,
        characteristic: String,
        strategy: &'static str,
        missing: &'static str,
    },

    #[error("service {service}: characteristic {characteristic} has a write transform but is not writable")]
    WriteTransformNotWritable {
        service: String,
        characteristic: String,
    },

    #[error("service {service}: characteristic {characteristic} has a zero {what} interval")]
    ZeroInterval {
        service: String,
        characteristic: String,
        what: &'static str,
    },

    #[error("service {service}: empty {what}")]
    EmptyIdentifier { service: String, what: &'static str },
}

/// Failure reported by a [`Transport`](crate::infrastructure::bluetooth::Transport).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,

    #[error("characteristic {0} does not support this operation")]
    Unsupported(String),

    #[error("link error: {0}")]
    LinkError(String),

    #[error("device rejected the request: {0}")]
    Rejected(String),
}

/// Failure converting between raw bytes and a typed value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransformError {
    #[error("payload too short: expected at least {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },

    #[error("expected a {expected} value, got {actual}")]
    UnexpectedType {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("value out of range: {0}")]
    OutOfRange(String),

    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// Error returned synchronously from [`GattCoordinator::write`](crate::coordinator::GattCoordinator::write).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WriteError {
    #[error("no characteristic publishes key `{0}`")]
    UnknownKey(String),

    #[error("characteristic for key `{0}` is not writable")]
    NotWritable(String),

    #[error("coordinator is not connected")]
    NotConnected,

    #[error("write transform failed: {0}")]
    Transform(#[from] TransformError),

    #[error("transport write failed: {0}")]
    Transport(#[from] TransportError),
}
