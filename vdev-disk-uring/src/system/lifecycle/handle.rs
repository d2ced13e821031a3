//! Owned handle to a [`System::launch`](crate::System::launch)ed system.

use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span};

use crate::{
    metrics::MetricsStorage,
    system::{completion::Poller, submission::op::Op, submission::SubmitSide},
};

/// Owned handle to the [`System`](crate::System) created by [`System::launch`](crate::System::launch).
///
/// Vdevs submit through a shared reference, so the handle can be put in an
/// `Arc` and used from any number of threads.
///
/// Call [`initiate_shutdown`](SystemHandle::initiate_shutdown) for explicit shutdown.
/// `drop` performs the same shutdown.
///
/// This handle is [`Send`] and [`Sync`] but not [`Clone`].
pub struct SystemHandle {
    inner: Option<SystemHandleInner>,
}

struct SystemHandleInner {
    id: usize,
    submit_side: SubmitSide,
    poller: std::thread::JoinHandle<Poller>,
    stop: CancellationToken,
    metrics: &'static MetricsStorage,
}

impl SystemHandle {
    pub(crate) fn new(
        id: usize,
        submit_side: SubmitSide,
        poller: std::thread::JoinHandle<Poller>,
        stop: CancellationToken,
        metrics: &'static MetricsStorage,
    ) -> Self {
        SystemHandle {
            inner: Some(SystemHandleInner {
                id,
                submit_side,
                poller,
                stop,
                metrics,
            }),
        }
    }

    fn inner(&self) -> &SystemHandleInner {
        self.inner
            .as_ref()
            .expect("we only take `inner` when consuming self or during Drop")
    }

    pub fn id(&self) -> usize {
        self.inner().id
    }

    /// Operations currently owned by the kernel, including entries left in
    /// the submission queue by a submission the kernel did not accept.
    pub fn in_flight(&self) -> usize {
        self.inner().submit_side.in_flight_count()
    }

    /// Whether the poller thread is still observing completions.
    pub fn poller_is_running(&self) -> bool {
        !self.inner().poller.is_finished()
    }

    pub(crate) fn submit(&self, op: Box<dyn Op>) {
        self.inner().submit_side.submit(op)
    }

    #[cfg(test)]
    pub(crate) fn inject_submit_fault(&self, fault: crate::system::slots::SubmitFault) {
        self.inner().submit_side.slots().inject_submit_fault(fault)
    }

    /// Stop the system and wait for the poller thread to exit.
    ///
    /// The poller keeps observing completions for a bounded time so that
    /// operations already in the kernel get their regular completion. Whatever
    /// is still in flight after that is settled with
    /// [`ZioError::ShuttingDown`](crate::ZioError::ShuttingDown) and its
    /// buffers are leaked.
    ///
    /// Blocks the calling thread. Must not be called from a pipeline
    /// continuation, which may run on the poller thread.
    pub fn initiate_shutdown(mut self) {
        let inner = self
            .inner
            .take()
            .expect("we only consume here and during Drop");
        inner.shutdown()
    }
}

impl Drop for SystemHandle {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.shutdown();
        }
    }
}

impl SystemHandleInner {
    fn shutdown(self) {
        let span = info_span!("shutdown", system=%self.id);
        let _entered = span.enter();
        info!("shutdown start");
        scopeguard::defer_on_success! {info!("shutdown end")};
        scopeguard::defer_on_unwind! {error!("shutdown panic")};

        let SystemHandleInner {
            id: _,
            submit_side,
            poller,
            stop,
            metrics,
        } = self;

        // puts the slots into draining state, no submissions from here on
        drop(submit_side);
        stop.cancel();
        let poller = match poller.join() {
            Ok(poller) => poller,
            Err(panic) => std::panic::resume_unwind(panic),
        };
        super::finish_shutdown(poller.into_slots());

        metrics
            .systems_destroyed
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }
}
