//! Coordinator for a single remote GATT device: a declarative protocol
//! descriptor, byte transforms, a reconnecting connection state machine
//! and a published mapping of decoded values.

pub mod coordinator;
pub mod domain;
pub mod error;
pub mod infrastructure;

pub use coordinator::{ConnectionState, CoordinatorConfig, GattCoordinator, SubscriptionHandle};
pub use domain::{
    ChangeEvent, Characteristic, Descriptor, Properties, ReadStrategy, ReadTransform, Service,
    Value, ValueMapping, WriteTransform,
};
pub use error::{ConfigurationError, TransformError, TransportError, WriteError};
pub use infrastructure::bluetooth::Transport;
