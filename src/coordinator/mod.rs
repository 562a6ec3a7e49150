//! Connection lifecycle, scheduling and change fan-out.

pub mod backoff;
pub mod diagnostics;
pub mod service;
pub mod state;
pub mod subscribers;

pub use backoff::{Backoff, BackoffConfig};
pub use diagnostics::Diagnostics;
pub use service::{CoordinatorConfig, GattCoordinator};
pub use state::ConnectionState;
pub use subscribers::{ChangeCallback, SubscriptionHandle};
