//! Bluetooth Module
//!
//! Link-layer access to the remote GATT device.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    GattCoordinator                       │
//! │        (state machine, scheduling, value mapping)        │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │ dyn Transport
//!         ┌─────────────┴─────────────┐
//!         │                           │
//!         ▼                           ▼
//! ┌────────────────┐         ┌────────────────────┐
//! │ WinRtTransport │         │ SimulatedTransport │
//! │                │         │                    │
//! │ - BLE device   │         │ - scripted values  │
//! │ - GATT access  │         │ - injected faults  │
//! └────────────────┘         └────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`transport`] - The capability set the coordinator depends on
//! - [`simulated`] - In-memory device for tests and the demo
//! - `winrt` - Windows Bluetooth LE backend (Windows only)

pub mod simulated;
pub mod transport;
#[cfg(windows)]
pub mod winrt;

pub use simulated::{CallCounts, SimulatedTransport};
pub use transport::{LinkStatus, NotifyCallback, Transport};
#[cfg(windows)]
pub use winrt::WinRtTransport;
