//! Protocol Descriptor
//!
//! Declarative description of the remote GATT services, built once and
//! validated eagerly. After [`Descriptor::new`] returns, result keys and
//! characteristic identifiers are unique and every read strategy matches
//! the declared properties.

use crate::domain::transform::{ReadTransform, WriteTransform};
use crate::error::ConfigurationError;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

bitflags::bitflags! {
    /// Access properties of a characteristic.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Properties: u8 {
        const READABLE = 1 << 0;
        const WRITABLE = 1 << 1;
        const NOTIFIABLE = 1 << 2;
    }
}

/// How the coordinator keeps a characteristic's value fresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStrategy {
    /// Never read automatically.
    None,
    /// Read every `interval` while connected.
    Poll(Duration),
    /// Subscribe to pushed notifications.
    Notify,
    /// Read once each time the link comes up.
    Index,
    /// Read every `interval`, but only within `window` of the last
    /// successful write.
    AfterWrite { interval: Duration, window: Duration },
}

impl ReadStrategy {
    fn name(&self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Poll(_) => "POLL",
            Self::Notify => "NOTIFY",
            Self::Index => "INDEX",
            Self::AfterWrite { .. } => "AFTER_WRITE",
        }
    }

    /// Property the strategy depends on, if any.
    fn required_property(&self) -> Option<(Properties, &'static str)> {
        match self {
            Self::None => None,
            Self::Notify => Some((Properties::NOTIFIABLE, "NOTIFIABLE")),
            Self::Poll(_) | Self::Index | Self::AfterWrite { .. } => {
                Some((Properties::READABLE, "READABLE"))
            }
        }
    }
}

/// A single addressable data point on the remote device.
#[derive(Debug, Clone)]
pub struct Characteristic {
    pub id: String,
    pub name: String,
    /// Stable name the published value is stored under.
    pub key: String,
    pub properties: Properties,
    pub strategy: ReadStrategy,
    pub read_transform: ReadTransform,
    pub write_transform: Option<WriteTransform>,
}

impl Characteristic {
    pub fn new(id: impl Into<String>, name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            key: key.into(),
            properties: Properties::empty(),
            strategy: ReadStrategy::None,
            read_transform: ReadTransform::default(),
            write_transform: None,
        }
    }

    pub fn properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }

    pub fn strategy(mut self, strategy: ReadStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn read_transform(mut self, transform: ReadTransform) -> Self {
        self.read_transform = transform;
        self
    }

    pub fn write_transform(mut self, transform: WriteTransform) -> Self {
        self.write_transform = Some(transform);
        self
    }

    pub fn is_writable(&self) -> bool {
        self.properties.contains(Properties::WRITABLE)
    }

    /// Transform used for writes; raw bytes when none was declared.
    pub fn effective_write_transform(&self) -> WriteTransform {
        self.write_transform.clone().unwrap_or_default()
    }
}

/// A GATT service and its characteristics, in declaration order.
#[derive(Debug, Clone)]
pub struct Service {
    pub id: String,
    pub name: String,
    pub characteristics: Vec<Characteristic>,
}

impl Service {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            characteristics: Vec::new(),
        }
    }

    pub fn characteristic(mut self, characteristic: Characteristic) -> Self {
        self.characteristics.push(characteristic);
        self
    }
}

/// Validated, immutable protocol description with O(1) lookups.
#[derive(Debug)]
pub struct Descriptor {
    services: Vec<Service>,
    /// Characteristic identifier -> (service index, characteristic index).
    by_id: HashMap<String, (usize, usize)>,
    /// Result key -> characteristic identifier.
    by_key: HashMap<String, String>,
}

impl Descriptor {
    pub fn new(services: Vec<Service>) -> Result<Self, ConfigurationError> {
        let mut by_id = HashMap::new();
        let mut by_key = HashMap::new();
        let mut service_ids = HashSet::new();

        for (si, service) in services.iter().enumerate() {
            if service.id.is_empty() {
                return Err(ConfigurationError::EmptyIdentifier {
                    service: service.name.clone(),
                    what: "service identifier",
                });
            }
            if !service_ids.insert(service.id.as_str()) {
                return Err(ConfigurationError::DuplicateService(service.id.clone()));
            }

            for (ci, ch) in service.characteristics.iter().enumerate() {
                validate_characteristic(service, ch)?;

                if by_id.insert(ch.id.clone(), (si, ci)).is_some() {
                    return Err(ConfigurationError::DuplicateCharacteristic {
                        service: service.id.clone(),
                        characteristic: ch.id.clone(),
                    });
                }
                if by_key.insert(ch.key.clone(), ch.id.clone()).is_some() {
                    return Err(ConfigurationError::DuplicateKey {
                        service: service.id.clone(),
                        characteristic: ch.id.clone(),
                        key: ch.key.clone(),
                    });
                }
            }
        }

        Ok(Self {
            services,
            by_id,
            by_key,
        })
    }

    /// Convenience for sharing across coordinator tasks.
    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn services(&self) -> &[Service] {
        &self.services
    }

    /// All characteristics, service by service, in declaration order.
    pub fn characteristics(&self) -> impl Iterator<Item = &Characteristic> {
        self.services.iter().flat_map(|s| s.characteristics.iter())
    }

    pub fn by_id(&self, id: &str) -> Option<&Characteristic> {
        self.by_id
            .get(id)
            .map(|&(si, ci)| &self.services[si].characteristics[ci])
    }

    pub fn by_key(&self, key: &str) -> Option<&Characteristic> {
        self.by_key.get(key).and_then(|id| self.by_id(id))
    }

    /// Identifier of the service owning characteristic `id`.
    pub fn service_of(&self, id: &str) -> Option<&Service> {
        self.by_id.get(id).map(|&(si, _)| &self.services[si])
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.by_key.keys().map(String::as_str)
    }
}

fn validate_characteristic(service: &Service, ch: &Characteristic) -> Result<(), ConfigurationError> {
    if ch.id.is_empty() {
        return Err(ConfigurationError::EmptyIdentifier {
            service: service.id.clone(),
            what: "characteristic identifier",
        });
    }
    if ch.key.is_empty() {
        return Err(ConfigurationError::EmptyIdentifier {
            service: service.id.clone(),
            what: "result key",
        });
    }

    if let Some((property, missing)) = ch.strategy.required_property() {
        if !ch.properties.contains(property) {
            return Err(ConfigurationError::IncompatibleStrategy {
                service: service.id.clone(),
                characteristic: ch.id.clone(),
                strategy: ch.strategy.name(),
                missing,
            });
        }
    }

    let zero_interval = match ch.strategy {
        ReadStrategy::Poll(interval) => interval.is_zero().then_some("poll"),
        ReadStrategy::AfterWrite { interval, .. } => interval.is_zero().then_some("after-write"),
        _ => None,
    };
    if let Some(what) = zero_interval {
        return Err(ConfigurationError::ZeroInterval {
            service: service.id.clone(),
            characteristic: ch.id.clone(),
            what,
        });
    }

    if ch.write_transform.is_some() && !ch.is_writable() {
        return Err(ConfigurationError::WriteTransformNotWritable {
            service: service.id.clone(),
            characteristic: ch.id.clone(),
        });
    }

    Ok(())
}
