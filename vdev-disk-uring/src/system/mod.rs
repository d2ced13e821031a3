use std::time::Duration;

pub(super) mod completion;
pub(crate) mod lifecycle;
pub(crate) mod slots;
pub(crate) mod submission;

/// Entries in the submission queue, and the bound on in-flight operations.
pub(crate) const RING_SIZE: u32 = 128;

/// Upper bound on how long the poller sleeps between completion checks.
pub(crate) const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Number of [`POLL_TIMEOUT`] cycles shutdown waits for in-flight operations
/// before abandoning them.
pub(crate) const SHUTDOWN_DRAIN_BUDGET: u32 = 50;
