//! GATT data coordinator
//!
//! Owns the transport, drives the connection state machine, schedules
//! polls and notification handling per characteristic, merges transformed
//! results into the value mapping and publishes changes to subscribers.
//!
//! ```text
//!            start()                connect ok
//! DISCONNECTED ──────▶ CONNECTING ─────────────▶ CONNECTED
//!      ▲                   │ connect failed          │ link lost
//!      │ stop()            ▼                         ▼
//!      └────────────── RECONNECTING ◀──── backoff ───┘
//! ```
//!
//! Every scheduled unit (one poll loop per polled characteristic, one
//! consumer per notified characteristic, the reconnect supervisor) runs as
//! its own task. Merges for the same key are serialized by a per-key lock;
//! the mapping itself sits behind a read/write lock so snapshots are
//! consistent across keys.

use super::backoff::{Backoff, BackoffConfig};
use super::diagnostics::{bump, Counters, Diagnostics};
use super::state::ConnectionState;
use super::subscribers::{SubscriberRegistry, SubscriptionHandle};
use crate::domain::descriptor::{Characteristic, Descriptor, Properties, ReadStrategy, Service};
use crate::domain::settings::Settings;
use crate::domain::value::{ChangeEvent, MergeOutcome, Value, ValueMapping};
use crate::error::{ConfigurationError, WriteError};
use crate::infrastructure::bluetooth::{LinkStatus, NotifyCallback, Transport};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Runtime knobs for a coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorConfig {
    pub backoff: BackoffConfig,
    /// Pause after each acknowledged write.
    pub write_settle: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            write_settle: Duration::from_millis(100),
        }
    }
}

impl From<&Settings> for CoordinatorConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            backoff: BackoffConfig::from(&settings.connection),
            write_settle: settings.connection.write_settle(),
        }
    }
}

/// One `start()`..`stop()` span. Work spawned for a session stops merging
/// as soon as the session is deactivated.
struct Session {
    /// Only cleared while holding both the lifecycle and the values lock.
    active: AtomicBool,
    cancel: watch::Sender<bool>,
}

impl Session {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

enum LinkOutcome {
    Lost,
    /// A subscription could not be set up; the link is torn down and retried.
    SetupFailed,
    Cancelled,
}

struct Inner {
    descriptor: Arc<Descriptor>,
    transport: Arc<dyn Transport>,
    config: CoordinatorConfig,
    state: watch::Sender<ConnectionState>,
    values: RwLock<ValueMapping>,
    key_locks: HashMap<String, tokio::sync::Mutex<()>>,
    subscribers: SubscriberRegistry,
    counters: Arc<Counters>,
    lifecycle: Mutex<Option<Arc<Session>>>,
    last_write: Mutex<Option<Instant>>,
}

/// Coordinator for a single remote GATT device.
pub struct GattCoordinator {
    inner: Arc<Inner>,
}

impl GattCoordinator {
    pub fn new(
        descriptor: impl Into<Arc<Descriptor>>,
        transport: Arc<dyn Transport>,
        config: CoordinatorConfig,
    ) -> Self {
        let descriptor = descriptor.into();
        let key_locks = descriptor
            .keys()
            .map(|key| (key.to_string(), tokio::sync::Mutex::new(())))
            .collect();
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Self {
            inner: Arc::new(Inner {
                descriptor,
                transport,
                config,
                state,
                values: RwLock::new(ValueMapping::new()),
                key_locks,
                subscribers: SubscriberRegistry::default(),
                counters: Arc::new(Counters::default()),
                lifecycle: Mutex::new(None),
                last_write: Mutex::new(None),
            }),
        }
    }

    /// Validate `services` and build a coordinator in one step.
    pub fn from_services(
        services: Vec<Service>,
        transport: Arc<dyn Transport>,
        config: CoordinatorConfig,
    ) -> Result<Self, ConfigurationError> {
        let descriptor = Descriptor::new(services)?;
        Ok(Self::new(descriptor, transport, config))
    }

    /// Begin connecting in the background. No-op when already started.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn start(&self) {
        let session = {
            let mut lifecycle = self.inner.lifecycle.lock();
            if lifecycle.is_some() {
                debug!("Coordinator already started");
                return;
            }
            let (cancel, _) = watch::channel(false);
            let session = Arc::new(Session {
                active: AtomicBool::new(true),
                cancel,
            });
            *lifecycle = Some(session.clone());
            self.inner.state.send_replace(ConnectionState::Connecting);
            session
        };

        info!("Coordinator starting");
        tokio::spawn(supervise(self.inner.clone(), session));
    }

    /// Cancel every timer, retry and subscription, then release the link.
    ///
    /// In-flight transport calls are left to finish, but their results are
    /// discarded: the value mapping does not change after `stop` returns.
    pub async fn stop(&self) {
        if self.inner.halt() {
            self.inner.transport.disconnect().await;
            info!("Coordinator stopped");
        }
    }

    /// Stop, release the transport and drop every subscriber.
    pub async fn shutdown(self) {
        self.stop().await;
        self.inner.transport.disconnect().await;
        self.inner.subscribers.clear();
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Follow state transitions, e.g. to show a "link down" indicator.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Consistent point-in-time copy of every observed key.
    pub fn snapshot(&self) -> ValueMapping {
        self.inner.values.read().clone()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.values.read().get(key).cloned()
    }

    /// Register `callback` for every change of any key.
    ///
    /// Callbacks run on the coordinator's tasks and must return quickly.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionHandle
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.inner.subscribers.insert(Arc::new(callback))
    }

    /// Returns `false` when the handle was already removed.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.inner.subscribers.remove(handle)
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.inner.descriptor
    }

    pub fn diagnostics(&self) -> Diagnostics {
        self.inner.counters.snapshot()
    }

    /// Write `value` to the characteristic publishing `key`.
    ///
    /// Returns once the device acknowledged the write. Failures are never
    /// retried.
    pub async fn write(&self, key: &str, value: Value) -> Result<(), WriteError> {
        let inner = &self.inner;
        let ch = inner
            .descriptor
            .by_key(key)
            .ok_or_else(|| WriteError::UnknownKey(key.to_string()))?;
        if !ch.is_writable() {
            return Err(WriteError::NotWritable(key.to_string()));
        }
        if self.state() != ConnectionState::Connected {
            return Err(WriteError::NotConnected);
        }

        let bytes = ch.effective_write_transform().apply(&value)?;
        debug!("Writing {} bytes to {} ({})", bytes.len(), ch.id, key);

        if let Err(e) = inner.transport.write(&ch.id, &bytes).await {
            bump(&inner.counters.write_failures);
            warn!("Write to {} ({}) failed: {}", ch.id, key, e);
            return Err(e.into());
        }

        bump(&inner.counters.writes);
        *inner.last_write.lock() = Some(Instant::now());

        if !inner.config.write_settle.is_zero() {
            tokio::time::sleep(inner.config.write_settle).await;
        }
        Ok(())
    }

    /// Apply `writes` in order, stopping at the first failure.
    pub async fn write_all<I, K>(&self, writes: I) -> Result<(), WriteError>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: AsRef<str>,
    {
        for (key, value) in writes {
            self.write(key.as_ref(), value).await?;
        }
        Ok(())
    }
}

impl Drop for GattCoordinator {
    fn drop(&mut self) {
        if self.inner.halt() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let transport = self.inner.transport.clone();
                handle.spawn(async move { transport.disconnect().await });
            }
        }
        self.inner.subscribers.clear();
    }
}

impl Inner {
    /// Deactivate the current session and settle on DISCONNECTED.
    /// Returns `false` when nothing was running.
    fn halt(&self) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        let Some(session) = lifecycle.take() else {
            return false;
        };
        {
            let _fence = self.values.write();
            session.active.store(false, Ordering::SeqCst);
        }
        session.cancel.send_replace(true);
        self.state.send_replace(ConnectionState::Disconnected);
        true
    }

    /// Move to `next` unless `session` was stopped meanwhile.
    fn transition(&self, session: &Session, next: ConnectionState) -> bool {
        let _lifecycle = self.lifecycle.lock();
        if !session.is_active() {
            return false;
        }
        let previous = self.state.send_replace(next);
        if previous != next {
            info!("Connection state {} -> {}", previous, next);
        }
        true
    }

    fn wrote_within(&self, window: Duration) -> bool {
        self.last_write
            .lock()
            .map(|at| at.elapsed() < window)
            .unwrap_or(false)
    }

    /// Read `ch` once and feed the result through the pipeline.
    async fn refresh(&self, session: &Session, ch: &Characteristic) {
        match self.transport.read(&ch.id).await {
            Ok(bytes) => self.ingest(session, ch, &bytes).await,
            Err(e) => {
                bump(&self.counters.read_failures);
                warn!("Read of {} ({}) failed: {}", ch.id, ch.key, e);
            }
        }
    }

    /// Transform, merge and publish a payload for `ch`. Serialized per key.
    async fn ingest(&self, session: &Session, ch: &Characteristic, bytes: &[u8]) {
        let Some(key_lock) = self.key_locks.get(&ch.key) else {
            return;
        };
        let _serialized = key_lock.lock().await;

        let result = match ch.read_transform.apply(&ch.key, bytes) {
            Ok(result) => result,
            Err(e) => {
                bump(&self.counters.transform_failures);
                warn!(
                    "Transform for {} ({}) rejected {:02X?}: {}",
                    ch.id, ch.key, bytes, e
                );
                return;
            }
        };

        let value = result.value.clone();
        let outcome = {
            let mut values = self.values.write();
            if !session.is_active() {
                return;
            }
            bump(&self.counters.merges);
            values.merge(result)
        };

        let previous = match outcome {
            MergeOutcome::Unchanged => return,
            MergeOutcome::Inserted => None,
            MergeOutcome::Changed(previous) => Some(previous),
        };

        debug!("{} = {}", ch.key, value);
        let event = ChangeEvent {
            key: ch.key.clone(),
            value,
            previous,
        };
        self.subscribers.publish(&event);
        bump(&self.counters.changes_published);
    }
}

/// Resolves once `cancel` reads `true` or its sender is gone.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            return;
        }
    }
}

async fn link_down(link: &mut watch::Receiver<LinkStatus>) {
    loop {
        if *link.borrow_and_update() == LinkStatus::Down {
            return;
        }
        if link.changed().await.is_err() {
            return;
        }
    }
}

/// Connect, serve the link until it drops, back off, repeat until stopped.
async fn supervise(inner: Arc<Inner>, session: Arc<Session>) {
    let mut cancel = session.cancel.subscribe();
    let mut backoff = Backoff::new(inner.config.backoff);

    while session.is_active() {
        bump(&inner.counters.connect_attempts);
        match inner.transport.connect().await {
            Ok(()) => {
                if !inner.transition(&session, ConnectionState::Connected) {
                    // stop() raced the connect. Release the link unless a
                    // newer session already owns it.
                    let orphaned = inner.lifecycle.lock().is_none();
                    if orphaned {
                        inner.transport.disconnect().await;
                    }
                    break;
                }
                bump(&inner.counters.connects);
                backoff.reset();

                match serve_link(&inner, &session, &mut cancel).await {
                    LinkOutcome::Cancelled => break,
                    LinkOutcome::Lost => {
                        bump(&inner.counters.link_losses);
                        warn!("Link to device lost");
                        if session.is_active() {
                            inner.transport.disconnect().await;
                        }
                    }
                    LinkOutcome::SetupFailed => {
                        if session.is_active() {
                            inner.transport.disconnect().await;
                        }
                    }
                }
            }
            Err(e) => warn!("Connect attempt failed: {}", e),
        }

        if !inner.transition(&session, ConnectionState::Reconnecting) {
            break;
        }
        let delay = backoff.next_delay();
        debug!("Reconnecting in {:?}", delay);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancelled(&mut cancel) => break,
        }
    }

    debug!("Supervisor exited");
}

/// Set up subscriptions and timers for one link lifetime.
async fn serve_link(
    inner: &Arc<Inner>,
    session: &Arc<Session>,
    cancel: &mut watch::Receiver<bool>,
) -> LinkOutcome {
    let mut link = inner.transport.link_status();
    let (scope, scope_rx) = watch::channel(false);

    for ch in inner.descriptor.characteristics() {
        match ch.strategy {
            ReadStrategy::None => {}
            ReadStrategy::Notify => {
                // Only the latest payload is kept; a burst coalesces into
                // one merge of the newest bytes.
                let (latest, rx) = watch::channel(Vec::new());
                let counters = inner.counters.clone();
                let on_notify: NotifyCallback = Box::new(move |bytes| {
                    bump(&counters.notifications);
                    latest.send_replace(bytes);
                });
                if let Err(e) = inner.transport.subscribe(&ch.id, on_notify).await {
                    bump(&inner.counters.subscribe_failures);
                    warn!("Subscribe to {} ({}) failed: {}", ch.id, ch.key, e);
                    scope.send_replace(true);
                    return LinkOutcome::SetupFailed;
                }
                debug!("Subscribed to {} ({})", ch.id, ch.key);
                tokio::spawn(consume_notifications(
                    inner.clone(),
                    session.clone(),
                    ch.clone(),
                    rx,
                    scope_rx.clone(),
                ));
            }
            ReadStrategy::Index => {
                let (inner, session, ch) = (inner.clone(), session.clone(), ch.clone());
                tokio::spawn(async move { inner.refresh(&session, &ch).await });
            }
            ReadStrategy::Poll(interval) => {
                tokio::spawn(poll(
                    inner.clone(),
                    session.clone(),
                    ch.clone(),
                    interval,
                    None,
                    scope_rx.clone(),
                ));
            }
            ReadStrategy::AfterWrite { interval, window } => {
                {
                    let (inner, session, ch) = (inner.clone(), session.clone(), ch.clone());
                    tokio::spawn(async move { inner.refresh(&session, &ch).await });
                }
                tokio::spawn(poll(
                    inner.clone(),
                    session.clone(),
                    ch.clone(),
                    interval,
                    Some(window),
                    scope_rx.clone(),
                ));
            }
        }
    }

    let outcome = tokio::select! {
        biased;
        _ = cancelled(cancel) => LinkOutcome::Cancelled,
        _ = link_down(&mut link) => LinkOutcome::Lost,
    };
    scope.send_replace(true);
    outcome
}

/// Read `ch` every `interval`; with `window`, only shortly after a write.
async fn poll(
    inner: Arc<Inner>,
    session: Arc<Session>,
    ch: Characteristic,
    interval: Duration,
    window: Option<Duration>,
    mut scope: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancelled(&mut scope) => break,
        }
        if let Some(window) = window {
            if !inner.wrote_within(window) {
                continue;
            }
        }
        bump(&inner.counters.polls);
        inner.refresh(&session, &ch).await;
    }
}

/// Seed a readable characteristic with one read, then merge every pushed
/// payload. Notifications arriving during the read are applied after it.
async fn consume_notifications(
    inner: Arc<Inner>,
    session: Arc<Session>,
    ch: Characteristic,
    mut rx: watch::Receiver<Vec<u8>>,
    mut scope: watch::Receiver<bool>,
) {
    if ch.properties.contains(Properties::READABLE) {
        tokio::select! {
            _ = inner.refresh(&session, &ch) => {}
            _ = cancelled(&mut scope) => return,
        }
    }

    loop {
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = cancelled(&mut scope) => break,
        }
        let bytes = rx.borrow_and_update().clone();
        inner.ingest(&session, &ch, &bytes).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::transform::{self, ReadTransform};
    use crate::error::{TransformError, TransportError};
    use crate::infrastructure::bluetooth::SimulatedTransport;
    use std::collections::BTreeMap;

    const READ: Properties = Properties::READABLE;

    fn demo_services() -> Vec<Service> {
        vec![
            Service::new("180f", "Battery").characteristic(
                Characteristic::new("2a19", "Battery Level", "battery")
                    .properties(READ)
                    .strategy(ReadStrategy::Poll(Duration::from_secs(30)))
                    .read_transform(transform::u8_at(0)),
            ),
            Service::new("aa00", "Device")
                .characteristic(
                    Characteristic::new("aa01", "Status", "status")
                        .properties(Properties::NOTIFIABLE)
                        .strategy(ReadStrategy::Notify)
                        .read_transform(transform::u8_at(0)),
                )
                .characteristic(
                    Characteristic::new("aa02", "Firmware", "firmware")
                        .properties(READ)
                        .strategy(ReadStrategy::Index)
                        .read_transform(transform::utf8()),
                )
                .characteristic(
                    Characteristic::new("aa03", "Relay", "relay")
                        .properties(READ | Properties::WRITABLE)
                        .write_transform(transform::write_u8()),
                )
                .characteristic(Characteristic::new("aa04", "Serial", "serial").properties(READ)),
        ]
    }

    fn test_config() -> CoordinatorConfig {
        CoordinatorConfig {
            backoff: BackoffConfig {
                initial: Duration::from_secs(1),
                multiplier: 2.0,
                max: Duration::from_secs(4),
            },
            write_settle: Duration::ZERO,
        }
    }

    fn setup_with(services: Vec<Service>) -> (GattCoordinator, SimulatedTransport) {
        let transport = SimulatedTransport::new();
        transport.set_value("2a19", vec![80]);
        transport.set_value("aa02", b"1.0.3".to_vec());
        let coordinator =
            GattCoordinator::from_services(services, Arc::new(transport.clone()), test_config())
                .unwrap();
        (coordinator, transport)
    }

    fn setup() -> (GattCoordinator, SimulatedTransport) {
        setup_with(demo_services())
    }

    /// Let spawned tasks run without meaningfully advancing the clock.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    fn recorder(coordinator: &GattCoordinator) -> Arc<Mutex<Vec<ChangeEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        coordinator.subscribe(move |event| sink.lock().push(event.clone()));
        events
    }

    fn events_for(events: &Mutex<Vec<ChangeEvent>>, key: &str) -> Vec<ChangeEvent> {
        events
            .lock()
            .iter()
            .filter(|event| event.key == key)
            .cloned()
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_connects_and_reads_index_once() {
        let (coordinator, transport) = setup();
        let mut states = coordinator.watch_state();
        assert_eq!(coordinator.state(), ConnectionState::Disconnected);

        coordinator.start();
        assert_eq!(coordinator.state(), ConnectionState::Connecting);
        settle().await;

        assert_eq!(*states.borrow_and_update(), ConnectionState::Connected);
        assert_eq!(coordinator.get("firmware"), Some(Value::from("1.0.3")));
        assert_eq!(transport.calls().read, 1);

        // A second start is ignored.
        coordinator.start();
        settle().await;
        assert_eq!(transport.calls().connect, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_fires_once_per_interval() {
        let (coordinator, transport) = setup();
        coordinator.start();
        settle().await;
        assert!(coordinator.get("battery").is_none());

        tokio::time::sleep(Duration::from_secs(31)).await;

        assert_eq!(coordinator.get("battery"), Some(Value::Int(80)));
        assert_eq!(coordinator.diagnostics().polls, 1);
        // index read + one poll
        assert_eq!(transport.calls().read, 2);

        transport.set_value("2a19", vec![79]);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(coordinator.get("battery"), Some(Value::Int(79)));
        assert_eq!(coordinator.diagnostics().polls, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_notification_publishes_only_changes() {
        let (coordinator, transport) = setup();
        let events = recorder(&coordinator);
        coordinator.start();
        settle().await;

        assert_eq!(transport.notify("aa01", vec![5]), 1);
        settle().await;
        transport.notify("aa01", vec![5]);
        settle().await;
        transport.notify("aa01", vec![6]);
        settle().await;

        let status = events_for(&events, "status");
        assert_eq!(status.len(), 2);
        assert_eq!(status[0].value, Value::Int(5));
        assert_eq!(status[0].previous, None);
        assert_eq!(status[1].value, Value::Int(6));
        assert_eq!(status[1].previous, Some(Value::Int(5)));
        assert_eq!(coordinator.diagnostics().notifications, 3);
        assert_eq!(coordinator.diagnostics().merges, 4); // firmware + 3 notifications
    }

    #[tokio::test(start_paused = true)]
    async fn test_transform_failure_keeps_previous_value() {
        let (coordinator, transport) = setup();
        coordinator.start();
        settle().await;

        transport.notify("aa01", vec![7]);
        settle().await;
        let before = coordinator.snapshot();

        // Too short for u8_at(0).
        transport.notify("aa01", Vec::new());
        settle().await;

        assert_eq!(coordinator.snapshot(), before);
        assert_eq!(coordinator.get("status"), Some(Value::Int(7)));
        assert_eq!(coordinator.get("firmware"), Some(Value::from("1.0.3")));
        assert_eq!(coordinator.diagnostics().transform_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_poll_keeps_schedule() {
        let (coordinator, transport) = setup();
        transport.fail_reads("2a19", TransportError::LinkError("timeout".to_string()));
        coordinator.start();
        settle().await;

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(coordinator.diagnostics().read_failures, 1);
        assert!(coordinator.get("battery").is_none());
        assert_eq!(coordinator.state(), ConnectionState::Connected);

        transport.clear_read_failure("2a19");
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(coordinator.get("battery"), Some(Value::Int(80)));
        assert_eq!(coordinator.diagnostics().polls, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_rejections_make_no_transport_calls() {
        let (coordinator, transport) = setup();

        // Not started yet.
        assert_eq!(
            coordinator.write("relay", Value::Bool(true)).await,
            Err(WriteError::NotConnected)
        );
        assert_eq!(transport.calls().total(), 0);

        coordinator.start();
        settle().await;
        let before = transport.calls();

        assert_eq!(
            coordinator.write("serial", Value::Bytes(vec![1])).await,
            Err(WriteError::NotWritable("serial".to_string()))
        );
        assert_eq!(
            coordinator.write("nope", Value::Bool(true)).await,
            Err(WriteError::UnknownKey("nope".to_string()))
        );
        assert_eq!(
            coordinator.write("relay", Value::from("on")).await,
            Err(WriteError::Transform(TransformError::UnexpectedType {
                expected: "int",
                actual: "text",
            }))
        );
        assert_eq!(transport.calls(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_is_encoded_and_failures_surface() {
        let (coordinator, transport) = setup();
        coordinator.start();
        settle().await;

        coordinator.write("relay", Value::Bool(true)).await.unwrap();
        assert_eq!(transport.writes(), vec![("aa03".to_string(), vec![1])]);

        transport.reject_writes(Some("locked"));
        assert_eq!(
            coordinator.write("relay", Value::Int(0)).await,
            Err(WriteError::Transport(TransportError::Rejected(
                "locked".to_string()
            )))
        );
        assert_eq!(transport.writes().len(), 1);

        let diagnostics = coordinator.diagnostics();
        assert_eq!(diagnostics.writes, 1);
        assert_eq!(diagnostics.write_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_all_applies_in_order_and_stops_at_first_error() {
        let (coordinator, transport) = setup();
        coordinator.start();
        settle().await;

        let result = coordinator
            .write_all(vec![
                ("relay", Value::Int(1)),
                ("relay", Value::Int(2)),
                ("serial", Value::Bytes(vec![9])),
                ("relay", Value::Int(3)),
            ])
            .await;

        assert_eq!(result, Err(WriteError::NotWritable("serial".to_string())));
        assert_eq!(
            transport.writes(),
            vec![("aa03".to_string(), vec![1]), ("aa03".to_string(), vec![2])]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_settle_delays_return() {
        let transport = SimulatedTransport::new();
        let coordinator = GattCoordinator::from_services(
            demo_services(),
            Arc::new(transport.clone()),
            CoordinatorConfig {
                write_settle: Duration::from_millis(100),
                ..test_config()
            },
        )
        .unwrap();
        coordinator.start();
        settle().await;

        let started = Instant::now();
        coordinator
            .write_all([("relay", Value::Int(1)), ("relay", Value::Int(0))])
            .await
            .unwrap();
        assert_eq!(started.elapsed(), Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_backoff_grows_to_cap_and_resets() {
        let (coordinator, transport) = setup();
        transport.fail_next_connects(4);
        coordinator.start();
        settle().await;
        assert_eq!(coordinator.state(), ConnectionState::Reconnecting);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(coordinator.state(), ConnectionState::Connected);

        let attempts = transport.connect_attempts();
        assert_eq!(attempts.len(), 5);
        let gaps: Vec<Duration> = attempts.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(
            gaps,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(4),
            ]
        );

        // After a successful connect the schedule starts over.
        let dropped_at = Instant::now();
        transport.drop_link();
        settle().await;
        assert_eq!(coordinator.state(), ConnectionState::Reconnecting);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(coordinator.state(), ConnectionState::Connected);
        let last = *transport.connect_attempts().last().unwrap();
        assert_eq!(last - dropped_at, Duration::from_secs(1));

        let diagnostics = coordinator.diagnostics();
        assert_eq!(diagnostics.connect_attempts, 6);
        assert_eq!(diagnostics.connects, 2);
        assert_eq!(diagnostics.link_losses, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_loss_stops_polling_until_reconnected() {
        let (coordinator, transport) = setup();
        coordinator.start();
        settle().await;

        transport.fail_next_connects(100);
        transport.drop_link();
        settle().await;
        assert_eq!(coordinator.state(), ConnectionState::Reconnecting);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(coordinator.state(), ConnectionState::Reconnecting);
        assert_eq!(coordinator.diagnostics().polls, 0);
        assert!(coordinator.get("battery").is_none());
        assert_eq!(
            coordinator.write("relay", Value::Int(1)).await,
            Err(WriteError::NotConnected)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_freezes_values_and_cancels_work() {
        let (coordinator, transport) = setup();
        let events = recorder(&coordinator);
        coordinator.start();
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(coordinator.get("battery"), Some(Value::Int(80)));

        coordinator.stop().await;
        assert_eq!(coordinator.state(), ConnectionState::Disconnected);
        assert!(!transport.is_connected());

        let frozen = coordinator.snapshot();
        let reads = transport.calls().read;
        let published = events.lock().len();

        transport.set_value("2a19", vec![10]);
        assert_eq!(transport.notify("aa01", vec![1]), 0);
        tokio::time::sleep(Duration::from_secs(300)).await;

        assert_eq!(coordinator.snapshot(), frozen);
        assert_eq!(transport.calls().read, reads);
        assert_eq!(transport.calls().connect, 1);
        assert_eq!(events.lock().len(), published);
        assert_eq!(coordinator.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_backoff_cancels_retries() {
        let (coordinator, transport) = setup();
        transport.fail_next_connects(u32::MAX);
        coordinator.start();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        let attempts = transport.connect_attempts().len();

        coordinator.stop().await;
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(transport.connect_attempts().len(), attempts);
        assert_eq!(coordinator.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_discards_in_flight_read() {
        let (coordinator, transport) = setup();
        transport.set_read_delay("2a19", Duration::from_secs(5));
        coordinator.start();

        // Poll fires at 30s and is still waiting on the device at 32s.
        tokio::time::sleep(Duration::from_secs(32)).await;
        coordinator.stop().await;
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert!(coordinator.get("battery").is_none());
        assert_eq!(coordinator.diagnostics().merges, 1); // firmware only
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_after_stop() {
        let (coordinator, transport) = setup();
        coordinator.start();
        settle().await;
        coordinator.stop().await;

        coordinator.start();
        settle().await;
        assert_eq!(coordinator.state(), ConnectionState::Connected);
        assert!(transport.is_connected());
        assert_eq!(transport.notify("aa01", vec![3]), 1);
        settle().await;
        assert_eq!(coordinator.get("status"), Some(Value::Int(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_read_does_not_delay_other_characteristics() {
        let services = vec![Service::new("bb00", "Sensors")
            .characteristic(
                Characteristic::new("bb01", "Slow", "slow")
                    .properties(READ)
                    .strategy(ReadStrategy::Poll(Duration::from_secs(10)))
                    .read_transform(transform::u8_at(0)),
            )
            .characteristic(
                Characteristic::new("bb02", "Fast", "fast")
                    .properties(READ)
                    .strategy(ReadStrategy::Poll(Duration::from_secs(10)))
                    .read_transform(transform::u8_at(0)),
            )];
        let (coordinator, transport) = setup_with(services);
        transport.set_value("bb01", vec![1]);
        transport.set_value("bb02", vec![2]);
        transport.set_read_delay("bb01", Duration::from_secs(100));

        coordinator.start();
        tokio::time::sleep(Duration::from_secs(35)).await;

        assert_eq!(coordinator.get("fast"), Some(Value::Int(2)));
        assert!(coordinator.get("slow").is_none());
        // slow ticked once and is still blocked; fast ticked at 10, 20 and 30s
        assert_eq!(coordinator.diagnostics().polls, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_after_write_polls_only_inside_window() {
        let services = vec![Service::new("cc00", "Thermostat").characteristic(
            Characteristic::new("cc01", "Mode", "mode")
                .properties(READ | Properties::WRITABLE)
                .strategy(ReadStrategy::AfterWrite {
                    interval: Duration::from_secs(5),
                    window: Duration::from_secs(30),
                })
                .read_transform(transform::u8_at(0))
                .write_transform(transform::write_u8()),
        )];
        let (coordinator, transport) = setup_with(services);
        transport.set_value("cc01", vec![0]);
        coordinator.start();

        tokio::time::sleep(Duration::from_secs(22)).await;
        assert_eq!(coordinator.diagnostics().polls, 0);

        coordinator.write("mode", Value::Int(2)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(11)).await;
        // ticks at 25 and 30s
        assert_eq!(coordinator.diagnostics().polls, 2);
        assert_eq!(coordinator.get("mode"), Some(Value::Int(2)));

        tokio::time::sleep(Duration::from_secs(60)).await;
        // 35, 40, 45 and 50s are still within 30s of the write at 22s
        assert_eq!(coordinator.diagnostics().polls, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_up_seeds_after_write_and_readable_notify_keys() {
        let services = vec![Service::new("cc00", "Thermostat")
            .characteristic(
                Characteristic::new("cc01", "Mode", "mode")
                    .properties(READ | Properties::WRITABLE)
                    .strategy(ReadStrategy::AfterWrite {
                        interval: Duration::from_secs(5),
                        window: Duration::from_secs(30),
                    })
                    .read_transform(transform::u8_at(0))
                    .write_transform(transform::write_u8()),
            )
            .characteristic(
                Characteristic::new("cc02", "Level", "level")
                    .properties(READ | Properties::NOTIFIABLE)
                    .strategy(ReadStrategy::Notify)
                    .read_transform(transform::u8_at(0)),
            )];
        let (coordinator, transport) = setup_with(services);
        transport.set_value("cc01", vec![2]);
        transport.set_value("cc02", vec![7]);
        coordinator.start();
        settle().await;

        assert_eq!(coordinator.get("mode"), Some(Value::Int(2)));
        assert_eq!(coordinator.get("level"), Some(Value::Int(7)));
        assert_eq!(coordinator.diagnostics().polls, 0);

        transport.notify("cc02", vec![8]);
        settle().await;
        assert_eq!(coordinator.get("level"), Some(Value::Int(8)));

        // No writes: the after-write poll stays idle for the whole link.
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(coordinator.diagnostics().polls, 0);
        assert_eq!(transport.calls().read, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_identical_nan_rereads_publish_once() {
        let f32_le = ReadTransform::new(|bytes| {
            transform::require_len(bytes, 4)?;
            let raw = [bytes[0], bytes[1], bytes[2], bytes[3]];
            Ok(Value::Float(f64::from(f32::from_le_bytes(raw))))
        });
        let services = vec![Service::new("ee00", "Environment").characteristic(
            Characteristic::new("ee01", "Temperature", "temperature")
                .properties(READ)
                .strategy(ReadStrategy::Poll(Duration::from_secs(10)))
                .read_transform(f32_le),
        )];
        let (coordinator, transport) = setup_with(services);
        transport.set_value("ee01", f32::NAN.to_le_bytes().to_vec());
        let events = recorder(&coordinator);
        coordinator.start();

        tokio::time::sleep(Duration::from_secs(31)).await;

        assert_eq!(coordinator.diagnostics().polls, 3);
        assert_eq!(events_for(&events, "temperature").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_failure_tears_down_and_retries_link() {
        let (coordinator, transport) = setup();
        transport.fail_next_subscribes(1);
        coordinator.start();
        settle().await;

        assert_eq!(coordinator.state(), ConnectionState::Reconnecting);
        assert!(!transport.is_connected());
        assert_eq!(coordinator.diagnostics().subscribe_failures, 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(coordinator.state(), ConnectionState::Connected);
        assert_eq!(transport.calls().subscribe, 2);
        assert_eq!(transport.notify("aa01", vec![4]), 1);
        settle().await;
        assert_eq!(coordinator.get("status"), Some(Value::Int(4)));

        // The poll task from the torn-down link does not linger.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(coordinator.diagnostics().polls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_notification_burst_coalesces_to_latest() {
        let (coordinator, transport) = setup();
        let events = recorder(&coordinator);
        coordinator.start();
        settle().await;

        for level in 0..100u8 {
            transport.notify("aa01", vec![level]);
        }
        settle().await;

        let status = events_for(&events, "status");
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].value, Value::Int(99));
        assert_eq!(coordinator.diagnostics().notifications, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_stops_delivery() {
        let (coordinator, transport) = setup();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let handle = coordinator.subscribe(move |event: &ChangeEvent| {
            sink.lock().push(event.key.clone());
        });
        coordinator.start();
        settle().await;
        assert_eq!(*events.lock(), vec!["firmware".to_string()]);

        assert!(coordinator.unsubscribe(handle));
        assert!(!coordinator.unsubscribe(handle));
        transport.notify("aa01", vec![1]);
        settle().await;
        assert_eq!(events.lock().len(), 1);
        assert_eq!(coordinator.get("status"), Some(Value::Int(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_releases_link() {
        let (coordinator, transport) = setup();
        coordinator.start();
        settle().await;
        assert!(transport.is_connected());

        drop(coordinator);
        settle().await;
        assert!(!transport.is_connected());
        assert_eq!(transport.notify("aa01", vec![1]), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_disconnects() {
        let (coordinator, transport) = setup();
        coordinator.start();
        settle().await;

        coordinator.shutdown().await;
        assert!(!transport.is_connected());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_snapshots_never_see_torn_records() {
        // Both fields of a record always come from the same payload.
        let paired = ReadTransform::new(|bytes| {
            transform::require_len(bytes, 1)?;
            let mut record = BTreeMap::new();
            record.insert("a".to_string(), Value::Int(i64::from(bytes[0])));
            record.insert("b".to_string(), Value::Int(i64::from(bytes[0])));
            Ok(Value::Record(record))
        });
        let services = vec![Service::new("dd00", "Pairs")
            .characteristic(
                Characteristic::new("dd01", "Left", "left")
                    .properties(Properties::NOTIFIABLE)
                    .strategy(ReadStrategy::Notify)
                    .read_transform(paired.clone()),
            )
            .characteristic(
                Characteristic::new("dd02", "Right", "right")
                    .properties(Properties::NOTIFIABLE)
                    .strategy(ReadStrategy::Notify)
                    .read_transform(paired),
            )];
        let (coordinator, transport) = setup_with(services);
        coordinator.start();
        let mut states = coordinator.watch_state();
        states
            .wait_for(|state| *state == ConnectionState::Connected)
            .await
            .unwrap();
        while transport.notify("dd02", vec![0]) == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let pusher = {
            let transport = transport.clone();
            tokio::spawn(async move {
                for i in 0..=255u8 {
                    transport.notify("dd01", vec![i]);
                    transport.notify("dd02", vec![255 - i]);
                    tokio::task::yield_now().await;
                }
            })
        };

        while !pusher.is_finished() {
            for (_, value) in coordinator.snapshot().iter() {
                if let Value::Record(record) = value {
                    assert_eq!(record.get("a"), record.get("b"));
                }
            }
            tokio::task::yield_now().await;
        }
        pusher.await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while coordinator.get("left").is_none()
                || coordinator.diagnostics().notifications < 512
            {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        coordinator.stop().await;
    }
}
