use std::sync::atomic::{AtomicU64, Ordering};

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metrics {
    pub systems_created: u64,
    pub systems_destroyed: u64,
    /// Operations whose entry was published to the submission ring.
    pub ops_submitted: u64,
    /// Completions observed by a poller and handed back to the pipeline.
    pub ops_completed: u64,
    /// Requests settled with an error before their entry was published.
    pub submissions_rejected: u64,
}

pub(crate) struct MetricsStorage {
    pub(crate) systems_created: AtomicU64,
    pub(crate) systems_destroyed: AtomicU64,
    pub(crate) ops_submitted: AtomicU64,
    pub(crate) ops_completed: AtomicU64,
    pub(crate) submissions_rejected: AtomicU64,
}

impl MetricsStorage {
    pub(crate) const fn new_const() -> Self {
        MetricsStorage {
            systems_created: AtomicU64::new(0),
            systems_destroyed: AtomicU64::new(0),
            ops_submitted: AtomicU64::new(0),
            ops_completed: AtomicU64::new(0),
            submissions_rejected: AtomicU64::new(0),
        }
    }

    pub(crate) fn make_pub(&self) -> Metrics {
        Metrics {
            systems_created: self.systems_created.load(Ordering::Relaxed),
            systems_destroyed: self.systems_destroyed.load(Ordering::Relaxed),
            ops_submitted: self.ops_submitted.load(Ordering::Relaxed),
            ops_completed: self.ops_completed.load(Ordering::Relaxed),
            submissions_rejected: self.submissions_rejected.load(Ordering::Relaxed),
        }
    }
}

pub(crate) static GLOBAL_STORAGE: MetricsStorage = MetricsStorage::new_const();

pub fn global() -> Metrics {
    GLOBAL_STORAGE.make_pub()
}
