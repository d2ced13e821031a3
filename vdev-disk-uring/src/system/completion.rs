//! The poller: a dedicated thread that observes completions and hands them
//! back to the pipeline.

use std::{os::fd::RawFd, sync::mpsc};

use tokio::io::{unix::AsyncFd, Interest};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn};

use crate::metrics::MetricsStorage;

use super::{
    slots::{co_owner, Slots},
    POLL_TIMEOUT, SHUTDOWN_DRAIN_BUDGET,
};

pub(crate) struct PollerNewArgs {
    pub id: usize,
    pub uring_fd: RawFd,
    pub slots: Slots<{ co_owner::POLLER }>,
    pub stop: CancellationToken,
    pub metrics: &'static MetricsStorage,
}

pub(crate) struct Poller {
    id: usize,
    slots: Slots<{ co_owner::POLLER }>,
    metrics: &'static MetricsStorage,
}

#[derive(Debug, PartialEq, Eq)]
enum PollerExit {
    /// Stop was requested.
    Stopped,
    /// Waiting for ring readiness failed and cannot be retried.
    WaitFailed,
}

impl Poller {
    /// Spawn the poller thread and wait until it is ready to observe completions.
    ///
    /// The thread returns the [`Slots`] when it exits, so whoever joins it can
    /// tear the ring down. If startup fails, the thread has already exited and
    /// its handle is returned together with the error.
    pub(crate) fn launch(
        args: PollerNewArgs,
    ) -> Result<std::thread::JoinHandle<Poller>, PollerLaunchError> {
        let PollerNewArgs {
            id,
            uring_fd,
            slots,
            stop,
            metrics,
        } = args;
        let poller = Poller { id, slots, metrics };
        // std channel: the caller may be on a thread that runs an async runtime
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let jh = std::thread::Builder::new()
            .name(format!("{id}-poller-thread"))
            .spawn(move || poller_thread(poller, uring_fd, stop, ready_tx))
            .map_err(PollerLaunchError::Spawn)?;
        match ready_rx.recv() {
            Ok(Ok(())) => Ok(jh),
            Ok(Err(e)) => Err(PollerLaunchError::Setup(e, jh)),
            Err(_) => Err(PollerLaunchError::Setup(
                std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "poller thread exited during startup",
                ),
                jh,
            )),
        }
    }

    pub(crate) fn into_slots(self) -> Slots<{ co_owner::POLLER }> {
        self.slots
    }

    /// Harvest completions and run their callbacks. Returns how many there were.
    pub(crate) fn process_completions(&self) -> usize {
        let completed = self.slots.take_completions();
        let n = completed.len();
        for (op, res) in completed {
            trace!(res, "completion");
            // todo: catch_unwind so a panicking pipeline stage does not take the poller down?
            op.on_op_completion(res);
        }
        self.metrics
            .ops_completed
            .fetch_add(n as u64, std::sync::atomic::Ordering::Relaxed);
        n
    }
}

pub(crate) enum PollerLaunchError {
    Spawn(std::io::Error),
    Setup(std::io::Error, std::thread::JoinHandle<Poller>),
}

fn poller_thread(
    poller: Poller,
    uring_fd: RawFd,
    stop: CancellationToken,
    ready_tx: mpsc::SyncSender<std::io::Result<()>>,
) -> Poller {
    let span = info_span!("poller_thread", system=%poller.id);
    let _entered = span.enter(); // safe to use here because we use new_current_thread
    info!("poller thread running");
    scopeguard::defer_on_success! {info!("poller thread exiting")};
    scopeguard::defer_on_unwind! {error!("poller thread panic")};

    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .enable_io()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return poller;
        }
    };
    let fd = {
        let _rt_guard = rt.enter();
        match AsyncFd::with_interest(uring_fd, Interest::READABLE) {
            Ok(fd) => fd,
            Err(e) => {
                let _ = ready_tx.send(Err(e));
                return poller;
            }
        }
    };
    let _ = ready_tx.send(Ok(()));

    let exit = rt.block_on(poller_impl(&poller, &fd, &stop));
    match exit {
        PollerExit::Stopped => rt.block_on(drain(&poller)),
        PollerExit::WaitFailed => {
            warn!("poller stopped without a stop request, completions will not be observed until shutdown");
        }
    }
    drop(fd);
    poller
}

async fn poller_impl(poller: &Poller, fd: &AsyncFd<RawFd>, stop: &CancellationToken) -> PollerExit {
    info!("poller_impl running");
    loop {
        let mut is_timeout_wakeup = false;
        tokio::select! {
            biased;
            _ = stop.cancelled() => {
                debug!("got stop request");
                return PollerExit::Stopped;
            }
            ready_res = fd.readable() => {
                match ready_res {
                    Ok(mut guard) => guard.clear_ready(),
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                        trace!("wait interrupted, retrying");
                        continue;
                    }
                    Err(e) => {
                        error!(error = %e, "waiting for completions failed");
                        return PollerExit::WaitFailed;
                    }
                }
            }
            _ = tokio::time::sleep(POLL_TIMEOUT) => {
                is_timeout_wakeup = true;
            }
        }

        poller.process_completions();
        if is_timeout_wakeup {
            poller.slots.poller_timeout_debug_dump();
            poller.slots.flush_submission_queue();
        }
    }
}

/// Keep observing completions for a bounded number of cycles so that ops
/// submitted before the stop request get their regular completion callbacks.
async fn drain(poller: &Poller) {
    for _ in 0..SHUTDOWN_DRAIN_BUDGET {
        poller.process_completions();
        let in_flight = poller.slots.in_flight_count();
        debug!(in_flight, "waiting for in-flight operations to complete");
        if in_flight == 0 {
            return;
        }
        poller.slots.flush_submission_queue();
        tokio::time::sleep(POLL_TIMEOUT).await;
    }
    poller.process_completions();
    warn!(
        in_flight = poller.slots.in_flight_count(),
        "shutdown drain budget exhausted"
    );
}
