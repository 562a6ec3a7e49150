use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters exposed through `GattCoordinator::diagnostics`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Diagnostics {
    pub connect_attempts: u64,
    pub connects: u64,
    pub link_losses: u64,
    pub polls: u64,
    pub notifications: u64,
    pub merges: u64,
    pub changes_published: u64,
    pub read_failures: u64,
    pub subscribe_failures: u64,
    pub transform_failures: u64,
    pub writes: u64,
    pub write_failures: u64,
}

#[derive(Default)]
pub(crate) struct Counters {
    pub connect_attempts: AtomicU64,
    pub connects: AtomicU64,
    pub link_losses: AtomicU64,
    pub polls: AtomicU64,
    pub notifications: AtomicU64,
    pub merges: AtomicU64,
    pub changes_published: AtomicU64,
    pub read_failures: AtomicU64,
    pub subscribe_failures: AtomicU64,
    pub transform_failures: AtomicU64,
    pub writes: AtomicU64,
    pub write_failures: AtomicU64,
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Counters {
    pub fn snapshot(&self) -> Diagnostics {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        Diagnostics {
            connect_attempts: load(&self.connect_attempts),
            connects: load(&self.connects),
            link_losses: load(&self.link_losses),
            polls: load(&self.polls),
            notifications: load(&self.notifications),
            merges: load(&self.merges),
            changes_published: load(&self.changes_published),
            read_failures: load(&self.read_failures),
            subscribe_failures: load(&self.subscribe_failures),
            transform_failures: load(&self.transform_failures),
            writes: load(&self.writes),
            write_failures: load(&self.write_failures),
        }
    }
}
