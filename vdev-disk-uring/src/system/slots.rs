//! Structure to keep track of in-flight operations.
//!
//! [`Slots`] serves the following purposes:
//!
//! - Own the [`Op`]s, and with them the buffers and file descriptors the kernel
//!   operates on, from the moment their SQE is published until the completion
//!   is observed.
//! - Limit queue depth. The limit is hard-coded to [`RING_SIZE`]; there is no
//!   waiting in line, a submission that finds no free slot is rejected.
//! - Keep track of what is in flight so shutdown knows when it is done, and what
//!   it has to abandon if the kernel does not finish in time.
//!
//! The table also owns the split io_uring instance. The submission queue has a
//! single producer, so pushing an SQE, `io_uring_enter` and completion
//! harvesting are serialized by the table's lock. Callbacks into the pipeline
//! happen after it has been released.
//!
//! Once an SQE is published it cannot be taken back. If `io_uring_enter` does
//! not consume it, the entry stays queued and its op stays `Pending`. The next
//! submission or the poller's timeout flush hands it to the kernel, and the op
//! settles once, with the kernel's result.
//!
//! There is one [`Slots`] instance per [`crate::System`], shared by two
//! co-owners: the submit side ([`crate::SystemHandle`]) and the poller thread.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use tracing::{debug, trace, warn};
use uring_common::io_uring::{self, CompletionQueue, SubmissionQueue, Submitter};

use crate::ZioError;

use super::{submission::op::Op, RING_SIZE};

pub(crate) mod co_owner {
    pub const SUBMIT_SIDE: usize = 0;
    pub const POLLER: usize = 1;
    pub const NUM_CO_OWNERS: usize = 2;
}

/// See module-level comment [`crate::system::slots`].
pub(crate) struct Slots<const O: usize> {
    #[allow(dead_code)]
    id: usize,
    inner: Arc<Mutex<SlotsInner>>,
}

enum SlotsInner {
    Open(Box<SlotsInnerRing>),
    Draining(Box<SlotsInnerRing>),
    Drained,
    Undefined,
}

struct SlotsInnerRing {
    #[allow(dead_code)]
    id: usize,
    storage: [Option<Slot>; RING_SIZE as usize],
    unused_indices: Vec<usize>,
    co_owner_live: [bool; co_owner::NUM_CO_OWNERS],
    sq: SubmissionQueue<'static>,
    submitter: Submitter<'static>,
    cq: CompletionQueue<'static>,
    split_uring: *mut io_uring::IoUring,
    #[cfg(test)]
    submit_faults: std::collections::VecDeque<SubmitFault>,
}

// SAFETY: the queues point into the leaked IoUring, which outlives this struct
// (see `Slots::shutdown`), and all access is serialized by the Mutex.
unsafe impl Send for SlotsInnerRing {}
unsafe impl Sync for SlotsInnerRing {}

enum Slot {
    Undefined,
    Pending(Box<dyn Op>),
}

impl Slot {
    fn discriminant_str(&self) -> &'static str {
        match self {
            Slot::Undefined => "Undefined",
            Slot::Pending(_) => "Pending",
        }
    }
}

/// A request that could not be handed to the kernel. The caller settles it.
pub(crate) struct Rejected {
    pub(crate) op: Box<dyn Op>,
    pub(crate) error: ZioError,
}

/// What is left of a [`Slots`] after the poller is gone.
pub(crate) struct ShutdownOutcome {
    pub(crate) uring: Box<io_uring::IoUring>,
    pub(crate) completed: Vec<(Box<dyn Op>, i32)>,
    /// Ops still owned by the kernel. Their resources have been leaked.
    pub(crate) abandoned: Vec<Box<dyn Op>>,
}

/// Replaces the outcome of the next submission, for tests.
#[cfg(test)]
#[derive(Debug)]
pub(crate) enum SubmitFault {
    /// The submission queue refuses the push; nothing is published.
    QueueFull,
    /// The entry is published, then `io_uring_enter` reports zero entries consumed.
    NoneAccepted,
    /// The entry is published, then `io_uring_enter` fails with this errno.
    Errno(i32),
}

pub(super) fn new(
    id: usize,
    submitter: Submitter<'static>,
    sq: SubmissionQueue<'static>,
    cq: CompletionQueue<'static>,
    split_uring: *mut io_uring::IoUring,
) -> (
    Slots<{ co_owner::SUBMIT_SIDE }>,
    Slots<{ co_owner::POLLER }>,
) {
    let inner = Arc::new(Mutex::new(SlotsInner::Open(Box::new(SlotsInnerRing {
        id,
        storage: {
            const NONE: Option<Slot> = None;
            [NONE; RING_SIZE as usize]
        },
        unused_indices: (0..RING_SIZE as usize).collect(),
        co_owner_live: [false; co_owner::NUM_CO_OWNERS],
        sq,
        submitter,
        cq,
        split_uring,
        #[cfg(test)]
        submit_faults: Default::default(),
    }))));
    fn make_co_owner<const O: usize>(id: usize, inner: &Arc<Mutex<SlotsInner>>) -> Slots<O> {
        let mut guard = inner.lock().unwrap();
        let SlotsInner::Open(ring) = &mut *guard else {
            panic!("we just created it like this above");
        };
        ring.co_owner_live[O] = true;
        Slots {
            id,
            inner: Arc::clone(inner),
        }
    }
    (
        make_co_owner::<{ co_owner::SUBMIT_SIDE }>(id, &inner),
        make_co_owner::<{ co_owner::POLLER }>(id, &inner),
    )
}

impl<const O: usize> Drop for Slots<O> {
    fn drop(&mut self) {
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poison) => poison.into_inner(),
        };
        match &mut *guard {
            SlotsInner::Open(ring) | SlotsInner::Draining(ring) => ring.co_owner_live[O] = false,
            SlotsInner::Drained | SlotsInner::Undefined => (),
        }
    }
}

impl<const O: usize> Slots<O> {
    /// Number of slots not available for new submissions.
    pub(crate) fn in_flight_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        match &*inner {
            SlotsInner::Open(ring) | SlotsInner::Draining(ring) => {
                RING_SIZE as usize - ring.unused_indices.len()
            }
            SlotsInner::Drained => 0,
            SlotsInner::Undefined => unreachable!(),
        }
    }
}

impl Slots<{ co_owner::SUBMIT_SIDE }> {
    /// Publish `op`'s SQE and hand it to the kernel.
    ///
    /// On `Ok`, the op is owned by the table until the poller observes its completion.
    pub(crate) fn submit(&self, op: Box<dyn Op>) -> Result<(), Rejected> {
        let mut inner_guard = self.inner.lock().unwrap();
        let ring = match &mut *inner_guard {
            SlotsInner::Undefined => unreachable!(),
            SlotsInner::Open(ring) => ring,
            SlotsInner::Draining(_) | SlotsInner::Drained => {
                return Err(Rejected {
                    op,
                    error: ZioError::ShuttingDown,
                })
            }
        };
        ring.submit(op)
    }

    pub(super) fn set_draining(&self) {
        let mut inner_guard = self.inner.lock().unwrap();
        let cur = std::mem::replace(&mut *inner_guard, SlotsInner::Undefined);
        match cur {
            SlotsInner::Undefined => unreachable!(),
            SlotsInner::Open(ring) => *inner_guard = SlotsInner::Draining(ring),
            SlotsInner::Draining(_) | SlotsInner::Drained => {
                panic!("implementation error: must only call set_draining once")
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn inject_submit_fault(&self, fault: SubmitFault) {
        let mut inner_guard = self.inner.lock().unwrap();
        let SlotsInner::Open(ring) = &mut *inner_guard else {
            panic!("can only inject faults into an open system");
        };
        ring.submit_faults.push_back(fault);
    }
}

impl Slots<{ co_owner::POLLER }> {
    /// Harvest the completion queue. The returned ops have left the table;
    /// the caller runs their completion callbacks.
    pub(crate) fn take_completions(&self) -> Vec<(Box<dyn Op>, i32)> {
        let mut inner_guard = self.inner.lock().unwrap();
        match &mut *inner_guard {
            SlotsInner::Undefined => unreachable!(),
            SlotsInner::Open(ring) | SlotsInner::Draining(ring) => ring.take_completions(),
            SlotsInner::Drained => panic!("should not be called after draining done"),
        }
    }

    /// Retry `io_uring_enter` for entries left in the submission queue by a
    /// submission the kernel did not consume.
    pub(crate) fn flush_submission_queue(&self) {
        let mut inner_guard = self.inner.lock().unwrap();
        let ring = match &mut *inner_guard {
            SlotsInner::Undefined => unreachable!(),
            SlotsInner::Open(ring) | SlotsInner::Draining(ring) => ring,
            SlotsInner::Drained => return,
        };
        ring.sq.sync();
        if ring.sq.is_empty() {
            return;
        }
        match ring.submitter.submit() {
            Ok(n) => debug!(n, "flushed queued submission entries"),
            Err(e) => debug!(error = %e, "flushing queued submission entries failed, retrying on next timeout"),
        }
    }

    pub(super) fn poller_timeout_debug_dump(&self) {
        let inner = self.inner.lock().unwrap();
        let (storage, unused_indices) = match &*inner {
            SlotsInner::Undefined => unreachable!(),
            SlotsInner::Open(ring) | SlotsInner::Draining(ring) => {
                (&ring.storage, &ring.unused_indices)
            }
            SlotsInner::Drained => return,
        };
        let mut by_state_discr = HashMap::new();
        for s in storage {
            let discr = s.as_ref().map(Slot::discriminant_str).unwrap_or("None");
            by_state_discr
                .entry(discr)
                .and_modify(|v| *v += 1)
                .or_insert(1);
        }
        debug!(
            "poller got timeout: free slots = {} by state: {:?}",
            unused_indices.len(),
            by_state_discr
        );
    }

    /// Take the ring apart so it can be dropped.
    ///
    /// Must only be called once the submit side is gone and the poller has
    /// stopped. Ops still in flight are returned for the caller to settle;
    /// the memory the kernel may still touch is leaked.
    pub(crate) fn shutdown(self) -> ShutdownOutcome {
        let mut inner_guard = self.inner.lock().unwrap();
        let before = std::mem::replace(&mut *inner_guard, SlotsInner::Drained);
        let mut ring = match before {
            SlotsInner::Undefined => unreachable!(),
            SlotsInner::Open(_) => panic!("we should be Draining by now"),
            SlotsInner::Drained => panic!("we never get back here"),
            SlotsInner::Draining(ring) => ring,
        };
        assert!(
            !ring.co_owner_live[co_owner::SUBMIT_SIDE],
            "submit side must be gone before the ring is torn down"
        );

        let completed = ring.take_completions();

        let SlotsInnerRing {
            id: _,
            storage,
            unused_indices: _,
            co_owner_live: _,
            mut sq,
            submitter,
            cq,
            split_uring,
            #[cfg(test)]
                submit_faults: _,
        } = *ring;

        let mut abandoned = Vec::new();
        for slot in storage.into_iter().flatten() {
            match slot {
                Slot::Undefined => unreachable!(),
                Slot::Pending(mut op) => {
                    std::mem::forget(op.take_resources_owned_by_kernel());
                    abandoned.push(op);
                }
            }
        }
        if !abandoned.is_empty() {
            warn!(
                abandoned = abandoned.len(),
                "kernel still owns operations at teardown, leaking their buffers"
            );
        }
        sq.sync();
        if !sq.is_empty() {
            debug!(unsubmitted = sq.len(), "dropping unsubmitted entries");
        }

        #[allow(clippy::drop_non_drop)]
        {
            drop(cq);
            drop(sq);
            drop(submitter);
        }
        // SAFETY: all borrows of the IoUring were the split parts dropped above
        let uring: Box<io_uring::IoUring> = unsafe { Box::from_raw(split_uring) };
        ShutdownOutcome {
            uring,
            completed,
            abandoned,
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum SubmitError {
    /// Nothing was published.
    #[error("submission queue full")]
    QueueFull,
    /// Published, but `io_uring_enter` did not consume the entry.
    #[error("submission not consumed: {0}")]
    NotConsumed(std::io::Error),
}

impl SlotsInnerRing {
    fn submit(&mut self, mut op: Box<dyn Op>) -> Result<(), Rejected> {
        let Some(idx) = self.unused_indices.pop() else {
            trace!("all slots in use");
            return Err(Rejected {
                op,
                error: ZioError::TryAgain,
            });
        };

        let sqe = op.make_sqe().user_data(idx as u64);
        assert!(self.storage[idx].is_none());
        self.storage[idx] = Some(Slot::Pending(op));

        match self.submit_raw(sqe) {
            Ok(()) => {
                trace!(idx, "submitted");
                Ok(())
            }
            Err(SubmitError::QueueFull) => {
                // never published, the kernel has not seen the memory
                let op = self.take_pending(idx);
                self.unused_indices.push(idx);
                Err(Rejected {
                    op,
                    error: ZioError::TryAgain,
                })
            }
            Err(SubmitError::NotConsumed(error)) => {
                // the kernel can still consume the entry, so the op stays Pending
                debug!(idx, %error, "entry stays queued until the next flush");
                Ok(())
            }
        }
    }

    fn submit_raw(&mut self, sqe: io_uring::squeue::Entry) -> Result<(), SubmitError> {
        #[cfg(test)]
        let fault = self.submit_faults.pop_front();
        #[cfg(test)]
        if matches!(fault, Some(SubmitFault::QueueFull)) {
            trace!("injecting full submission queue");
            return Err(SubmitError::QueueFull);
        }

        self.sq.sync();
        // SAFETY: the memory the SQE points to is owned by the op in `storage`
        // until its completion is observed.
        if unsafe { self.sq.push(&sqe) }.is_err() {
            return Err(SubmitError::QueueFull);
        }
        self.sq.sync();
        // our entry is the last one in the queue
        let queued = self.sq.len();
        loop {
            #[cfg(test)]
            let result = match &fault {
                Some(SubmitFault::NoneAccepted) => Ok(0),
                Some(SubmitFault::Errno(errno)) => {
                    Err(std::io::Error::from_raw_os_error(*errno))
                }
                Some(SubmitFault::QueueFull) | None => self.submitter.submit(),
            };
            #[cfg(not(test))]
            let result = self.submitter.submit();
            match result {
                Ok(consumed) if consumed >= queued => return Ok(()),
                Ok(consumed) => {
                    return Err(SubmitError::NotConsumed(std::io::Error::new(
                        std::io::ErrorKind::WouldBlock,
                        format!("kernel consumed {consumed} of {queued} entries"),
                    )))
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(SubmitError::NotConsumed(e)),
            }
        }
    }

    fn take_pending(&mut self, idx: usize) -> Box<dyn Op> {
        match self.storage[idx].take() {
            Some(Slot::Pending(op)) => op,
            other => panic!(
                "implementation error: slot {idx} is {:?}, expected Pending",
                other.as_ref().map(Slot::discriminant_str)
            ),
        }
    }

    fn take_completions(&mut self) -> Vec<(Box<dyn Op>, i32)> {
        let mut completed = Vec::new();
        self.cq.sync();
        loop {
            let Some(cqe) = self.cq.next() else {
                break;
            };
            let idx = cqe.user_data() as usize;
            let slot = std::mem::replace(&mut self.storage[idx], Some(Slot::Undefined));
            match slot {
                None | Some(Slot::Undefined) => {
                    unreachable!("implementation error: completion for unused slot {idx}")
                }
                Some(Slot::Pending(op)) => completed.push((op, cqe.result())),
            }
            self.storage[idx] = None;
            self.unused_indices.push(idx);
        }
        self.cq.sync();
        assert!(
            completed.len() <= RING_SIZE as usize,
            "implementation error: harvested {} completions but at most {RING_SIZE} can be in flight",
            completed.len()
        );
        completed
    }
}
