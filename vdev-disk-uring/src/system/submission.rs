pub(crate) mod op;

use tracing::trace;

use crate::metrics::MetricsStorage;

use super::slots::{self, Rejected, Slots};

use op::Op;

pub(crate) struct SubmitSideNewArgs {
    pub(crate) id: usize,
    pub(crate) slots: Slots<{ slots::co_owner::SUBMIT_SIDE }>,
    pub(crate) metrics: &'static MetricsStorage,
}

impl SubmitSide {
    pub(crate) fn new(args: SubmitSideNewArgs) -> SubmitSide {
        let SubmitSideNewArgs { id, slots, metrics } = args;
        SubmitSide { id, slots, metrics }
    }
}

pub(crate) struct SubmitSide {
    #[allow(dead_code)]
    id: usize,
    slots: Slots<{ slots::co_owner::SUBMIT_SIDE }>,
    metrics: &'static MetricsStorage,
}

impl SubmitSide {
    /// Hand `op` to the kernel, or settle it right here if that is not possible.
    ///
    /// The op's failure callback runs on the calling thread, after all locks
    /// have been released, so it may submit again.
    pub(crate) fn submit(&self, op: Box<dyn Op>) {
        match self.slots.submit(op) {
            Ok(()) => {
                self.metrics
                    .ops_submitted
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
            Err(Rejected { op, error }) => {
                trace!(%error, "submission rejected");
                self.metrics
                    .submissions_rejected
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                op.on_failed_submission(error);
            }
        }
    }

    pub(crate) fn in_flight_count(&self) -> usize {
        self.slots.in_flight_count()
    }

    #[cfg(test)]
    pub(crate) fn slots(&self) -> &Slots<{ slots::co_owner::SUBMIT_SIDE }> {
        &self.slots
    }
}

impl Drop for SubmitSide {
    fn drop(&mut self) {
        self.slots.set_draining()
    }
}
