//! Pure data: the protocol descriptor, values, transforms and settings.

pub mod descriptor;
pub mod settings;
pub mod transform;
pub mod value;

pub use descriptor::{Characteristic, Descriptor, Properties, ReadStrategy, Service};
pub use transform::{ReadTransform, WriteTransform};
pub use value::{ChangeEvent, ReadResult, Value, ValueMapping};
