//! The monitor thread: logs a report every period, writes the JSON summary
//! once the clients are done.

use std::{sync::Barrier, time::Duration};

use itertools::Itertools;
use tracing::info;

use crate::{
    stats::{Recorder, Window, WindowReport},
    Args,
};

const MONITOR_PERIOD: Duration = Duration::from_secs(1);
const OUTPUT_PATH: &str = "benchmark.output.json";

pub(crate) struct ClientsRunResult {
    pub(crate) client_run_times: Vec<Duration>,
}

#[derive(serde::Serialize)]
struct BenchmarkOutput<'a> {
    args: &'a Args,
    /// Completed requests per client, ascending. Shows whether clients were
    /// served fairly in time-based runs.
    per_client_done: Vec<u64>,
    per_client_runtime_secs: Vec<f64>,
    periods: Vec<WindowReport>,
    total: WindowReport,
}

pub(crate) fn run(
    args: &Args,
    recorder: &Recorder,
    ready: &Barrier,
    mut clients_done: tokio::sync::oneshot::Receiver<ClientsRunResult>,
) {
    let block_size = 1u64 << args.block_size_shift.get();
    let mut per_client_done = vec![0; recorder.num_clients()];
    let mut periods = Vec::new();

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap();

    ready.wait();
    let mut total = Window::start();
    let mut ticker = rt.block_on(async { tokio::time::interval(MONITOR_PERIOD) });
    // the first tick fires right away
    rt.block_on(ticker.tick());

    let result = loop {
        let mut period = Window::start();
        let exit = rt.block_on(async {
            tokio::select! {
                _ = ticker.tick() => None,
                res = &mut clients_done => {
                    Some(res.expect("main sends the result before dropping the sender"))
                }
            }
        });
        recorder.drain_into(&mut period, &mut per_client_done);
        let report = period.report(block_size);
        info!("{report}");
        periods.push(report);
        total.merge(&period);
        if let Some(result) = exit {
            break result;
        }
    };
    info!("monitor shutting down");

    let total = total.report(block_size);
    info!("total: {total}");
    let output = BenchmarkOutput {
        args,
        per_client_done: per_client_done.into_iter().sorted().collect(),
        per_client_runtime_secs: result
            .client_run_times
            .iter()
            .sorted()
            .map(Duration::as_secs_f64)
            .collect(),
        periods,
        total,
    };
    info!(path = OUTPUT_PATH, "writing results");
    std::fs::write(OUTPUT_PATH, serde_json::to_string_pretty(&output).unwrap()).unwrap();
}
