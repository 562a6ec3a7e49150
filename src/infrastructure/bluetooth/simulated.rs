//! In-memory transport
//!
//! Behaves like a connected GATT peripheral whose characteristic values,
//! failures and link drops are scripted by the caller. Used by the demo
//! binary on platforms without a native backend and by the test suite.

use super::transport::{LinkStatus, NotifyCallback, Transport};
use crate::error::TransportError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Number of calls received per transport operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub connect: usize,
    pub disconnect: usize,
    pub read: usize,
    pub write: usize,
    pub subscribe: usize,
}

impl CallCounts {
    pub fn total(&self) -> usize {
        self.connect + self.disconnect + self.read + self.write + self.subscribe
    }
}

#[derive(Default)]
struct Device {
    connected: bool,
    values: HashMap<String, Vec<u8>>,
    read_failures: HashMap<String, TransportError>,
    read_delays: HashMap<String, Duration>,
    write_rejection: Option<String>,
    failing_connects: u32,
    failing_subscribes: u32,
    subscribers: HashMap<String, Vec<Arc<NotifyCallback>>>,
    writes: Vec<(String, Vec<u8>)>,
    connect_attempts: Vec<Instant>,
    calls: CallCounts,
}

/// Scriptable [`Transport`] backed by a map of characteristic values.
///
/// Cloning shares the same simulated device, so a test can keep a handle
/// while the coordinator owns another.
#[derive(Clone)]
pub struct SimulatedTransport {
    device: Arc<Mutex<Device>>,
    link: Arc<watch::Sender<LinkStatus>>,
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedTransport {
    pub fn new() -> Self {
        let (link, _) = watch::channel(LinkStatus::Down);
        Self {
            device: Arc::new(Mutex::new(Device::default())),
            link: Arc::new(link),
        }
    }

    /// Set the bytes returned by the next reads of `characteristic_id`.
    pub fn set_value(&self, characteristic_id: &str, bytes: impl Into<Vec<u8>>) {
        self.device
            .lock()
            .values
            .insert(characteristic_id.to_string(), bytes.into());
    }

    pub fn value(&self, characteristic_id: &str) -> Option<Vec<u8>> {
        self.device.lock().values.get(characteristic_id).cloned()
    }

    /// Push a notification. Returns how many callbacks received it; zero
    /// when disconnected or nobody subscribed.
    pub fn notify(&self, characteristic_id: &str, bytes: impl Into<Vec<u8>>) -> usize {
        let bytes = bytes.into();
        let callbacks = {
            let device = self.device.lock();
            if !device.connected {
                return 0;
            }
            device
                .subscribers
                .get(characteristic_id)
                .cloned()
                .unwrap_or_default()
        };
        trace!("Simulated notify on {}: {:02X?}", characteristic_id, bytes);
        for callback in &callbacks {
            (**callback)(bytes.clone());
        }
        callbacks.len()
    }

    /// Make every read of `characteristic_id` fail with `error`.
    pub fn fail_reads(&self, characteristic_id: &str, error: TransportError) {
        self.device
            .lock()
            .read_failures
            .insert(characteristic_id.to_string(), error);
    }

    pub fn clear_read_failure(&self, characteristic_id: &str) {
        self.device.lock().read_failures.remove(characteristic_id);
    }

    /// Delay every read of `characteristic_id` by `delay`.
    pub fn set_read_delay(&self, characteristic_id: &str, delay: Duration) {
        self.device
            .lock()
            .read_delays
            .insert(characteristic_id.to_string(), delay);
    }

    /// Reject all writes with `reason`, or accept them again with `None`.
    pub fn reject_writes(&self, reason: Option<&str>) {
        self.device.lock().write_rejection = reason.map(str::to_string);
    }

    /// Fail the next `count` connect attempts with a link error.
    pub fn fail_next_connects(&self, count: u32) {
        self.device.lock().failing_connects = count;
    }

    /// Refuse the next `count` notification subscriptions.
    pub fn fail_next_subscribes(&self, count: u32) {
        self.device.lock().failing_subscribes = count;
    }

    /// Simulate the peripheral going out of range.
    pub fn drop_link(&self) {
        {
            let mut device = self.device.lock();
            device.connected = false;
            device.subscribers.clear();
        }
        debug!("Simulated link dropped");
        self.link.send_replace(LinkStatus::Down);
    }

    pub fn is_connected(&self) -> bool {
        self.device.lock().connected
    }

    pub fn calls(&self) -> CallCounts {
        self.device.lock().calls
    }

    /// Every acknowledged write, in order.
    pub fn writes(&self) -> Vec<(String, Vec<u8>)> {
        self.device.lock().writes.clone()
    }

    /// Time of every connect call, successful or not.
    pub fn connect_attempts(&self) -> Vec<Instant> {
        self.device.lock().connect_attempts.clone()
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        {
            let mut device = self.device.lock();
            device.calls.connect += 1;
            device.connect_attempts.push(Instant::now());

            if device.connected {
                return Ok(());
            }
            if device.failing_connects > 0 {
                device.failing_connects -= 1;
                return Err(TransportError::LinkError(
                    "simulated device unreachable".to_string(),
                ));
            }
            device.connected = true;
        }
        self.link.send_replace(LinkStatus::Up);
        Ok(())
    }

    async fn disconnect(&self) {
        let was_connected = {
            let mut device = self.device.lock();
            device.calls.disconnect += 1;
            device.subscribers.clear();
            std::mem::replace(&mut device.connected, false)
        };
        if was_connected {
            self.link.send_replace(LinkStatus::Down);
        }
    }

    async fn read(&self, characteristic_id: &str) -> Result<Vec<u8>, TransportError> {
        let delay = {
            let mut device = self.device.lock();
            device.calls.read += 1;
            device.read_delays.get(characteristic_id).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let device = self.device.lock();
        if !device.connected {
            return Err(TransportError::NotConnected);
        }
        if let Some(error) = device.read_failures.get(characteristic_id) {
            return Err(error.clone());
        }
        device
            .values
            .get(characteristic_id)
            .cloned()
            .ok_or_else(|| TransportError::Unsupported(characteristic_id.to_string()))
    }

    async fn write(&self, characteristic_id: &str, bytes: &[u8]) -> Result<(), TransportError> {
        let mut device = self.device.lock();
        device.calls.write += 1;
        if !device.connected {
            return Err(TransportError::NotConnected);
        }
        if let Some(reason) = &device.write_rejection {
            return Err(TransportError::Rejected(reason.clone()));
        }
        device
            .values
            .insert(characteristic_id.to_string(), bytes.to_vec());
        device
            .writes
            .push((characteristic_id.to_string(), bytes.to_vec()));
        Ok(())
    }

    async fn subscribe(
        &self,
        characteristic_id: &str,
        on_notify: NotifyCallback,
    ) -> Result<(), TransportError> {
        let mut device = self.device.lock();
        device.calls.subscribe += 1;
        if !device.connected {
            return Err(TransportError::NotConnected);
        }
        if device.failing_subscribes > 0 {
            device.failing_subscribes -= 1;
            return Err(TransportError::Rejected(
                "notifications not permitted".to_string(),
            ));
        }
        device
            .subscribers
            .entry(characteristic_id.to_string())
            .or_default()
            .push(Arc::new(on_notify));
        Ok(())
    }

    fn link_status(&self) -> watch::Receiver<LinkStatus> {
        self.link.subscribe()
    }
}
