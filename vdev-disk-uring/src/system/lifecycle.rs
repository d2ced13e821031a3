use std::os::fd::AsRawFd;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn};
use uring_common::io_uring;

pub mod handle;

use crate::{
    metrics::{MetricsStorage, GLOBAL_STORAGE},
    LaunchError, ZioError,
};

use super::{
    completion::{Poller, PollerLaunchError, PollerNewArgs},
    slots::{self, co_owner, ShutdownOutcome, Slots},
    submission::{SubmitSide, SubmitSideNewArgs},
    RING_SIZE,
};
use handle::SystemHandle;

/// Entry point for setting up the io_uring context that serves disk vdevs.
/// Use [`Self::launch`] to start, then [`SystemHandle`] to interact.
///
/// A process is expected to run one system; nothing prevents launching more,
/// each gets its own ring and poller thread.
pub struct System;

static SYSTEM_ID: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);

impl System {
    /// Sets up an io_uring instance and its poller thread.
    ///
    /// # Panics
    ///
    /// If the kernel refuses to create the ring or the poller cannot start.
    /// Disk vdevs cannot operate without the context; use [`Self::try_launch`]
    /// to handle the error instead.
    pub fn launch() -> SystemHandle {
        match Self::try_launch() {
            Ok(handle) => handle,
            Err(e) => {
                error!(error = %e, "cannot set up io_uring context");
                panic!("cannot set up io_uring context: {e}");
            }
        }
    }

    pub fn try_launch() -> Result<SystemHandle, LaunchError> {
        Self::launch_with_metrics(&GLOBAL_STORAGE)
    }

    pub(crate) fn launch_with_metrics(
        metrics: &'static MetricsStorage,
    ) -> Result<SystemHandle, LaunchError> {
        let id = SYSTEM_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let span = info_span!("launch", system=%id);
        let _entered = span.enter();

        let uring = io_uring::IoUring::new(RING_SIZE).map_err(LaunchError::IoUringBuild)?;
        let uring = Box::into_raw(Box::new(uring));
        // SAFETY: leaked above, unleaked by `Slots::shutdown` once the split parts are dropped
        let uring_fd = unsafe { (*uring).as_raw_fd() };
        let (submitter, sq, cq) = unsafe { (*uring).split() };

        let (slots_submit_side, slots_poller) = slots::new(id, submitter, sq, cq, uring);
        let submit_side = SubmitSide::new(SubmitSideNewArgs {
            id,
            slots: slots_submit_side,
            metrics,
        });
        let stop = CancellationToken::new();
        let poller = Poller::launch(PollerNewArgs {
            id,
            uring_fd,
            slots: slots_poller,
            stop: stop.clone(),
            metrics,
        });
        let poller = match poller {
            Ok(jh) => jh,
            Err(PollerLaunchError::Spawn(e)) => {
                // the failed spawn dropped the poller's co-ownership along
                // with the closure, the ring cannot be unsplit anymore
                warn!("leaking io_uring instance after failed poller spawn");
                drop(submit_side);
                return Err(LaunchError::PollerSpawn(e));
            }
            Err(PollerLaunchError::Setup(e, jh)) => {
                drop(submit_side);
                match jh.join() {
                    Ok(poller) => finish_shutdown(poller.into_slots()),
                    Err(panic) => std::panic::resume_unwind(panic),
                }
                return Err(LaunchError::PollerSetup(e));
            }
        };

        metrics
            .systems_created
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        info!("system launched");
        Ok(SystemHandle::new(id, submit_side, poller, stop, metrics))
    }
}

/// Tear down the ring once the poller has stopped.
///
/// Completions that arrived after the poller's last harvest are delivered
/// normally. Ops the kernel still owns are settled with
/// [`ZioError::ShuttingDown`]; their buffers are leaked because the kernel
/// may still write to them.
pub(crate) fn finish_shutdown(slots: Slots<{ co_owner::POLLER }>) {
    info!("ring teardown start");
    scopeguard::defer_on_success! {info!("ring teardown end")};
    scopeguard::defer_on_unwind! {error!("ring teardown panic")};

    let ShutdownOutcome {
        uring,
        completed,
        abandoned,
    } = slots.shutdown();

    // Drop the IoUring struct, cleaning up the underlying kernel resources.
    drop(uring);

    for (op, res) in completed {
        op.on_op_completion(res);
    }
    for op in abandoned {
        op.on_failed_submission(ZioError::ShuttingDown);
    }
}
