use std::{
    io::{Seek, Write},
    num::{NonZeroU64, NonZeroUsize},
    ops::ControlFlow,
    path::{Path, PathBuf},
    str::FromStr,
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        mpsc, Arc, Barrier,
    },
    time::{Duration, Instant},
};

use clap::Parser;
use rand::{Rng, RngCore};
use tracing::{error, info, warn};
use vdev_disk_uring::{
    Abd, AccessMode, AlignedBuf, Config, System, SystemHandle, VdevDisk, Zio, ZioError, ZioType,
};

mod monitor;
mod stats;

use monitor::ClientsRunResult;
use stats::{Kind, Recorder};

#[derive(serde::Serialize, clap::Parser, Clone)]
struct Args {
    num_clients: NonZeroU64,
    file_size_mib: NonZeroU64,
    block_size_shift: NonZeroU64,
    #[clap(long, default_value = "until-ctrl-c")]
    run_duration: RunDuration,
    /// Requests each client keeps in flight.
    #[clap(long, default_value = "1")]
    queue_depth: NonZeroUsize,
    #[clap(long)]
    direct_io: bool,
    /// Run all clients against this device instead of per-client data files.
    #[clap(long)]
    device: Option<PathBuf>,
    /// Share of writes in the `mixed` workload.
    #[clap(long, default_value = "50", value_parser = clap::value_parser!(u8).range(0..=100))]
    write_percent: u8,
    #[clap(value_enum)]
    work_kind: WorkKind,
}

#[derive(Clone, serde::Serialize)]
enum RunDuration {
    UntilCtrlC,
    FixedDuration(Duration),
    FixedTotalIoCount(u64),
    FixedPerClientIoCount(u64),
}

fn parse_io_count(s: &str, suffix: &str) -> Result<u64, String> {
    let stripped = &s[..s.len() - suffix.len()];
    let (stripped, multiplier) = if let Some(x) = stripped.strip_suffix("k-") {
        (x, 1000)
    } else if let Some(x) = stripped.strip_suffix("m-") {
        (x, 1000 * 1000)
    } else if let Some(x) = stripped.strip_suffix("g-") {
        (x, 1000 * 1000 * 1000)
    } else {
        (stripped, 1)
    };
    match stripped.parse::<NonZeroU64>() {
        Ok(n) => Ok(n.get() * multiplier),
        Err(e) => Err(format!("invalid io count: {e}: {s:?}")),
    }
}

impl FromStr for RunDuration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "until-ctrl-c" => Ok(RunDuration::UntilCtrlC),
            x if x.ends_with("ios-total") => {
                parse_io_count(s, "ios-total").map(RunDuration::FixedTotalIoCount)
            }
            x if x.ends_with("ios-per-client") => {
                parse_io_count(s, "ios-per-client").map(RunDuration::FixedPerClientIoCount)
            }
            x => match humantime::parse_duration(x) {
                Ok(d) => Ok(RunDuration::FixedDuration(d)),
                Err(e) => Err(format!("invalid duration: {e}: {s:?}")),
            },
        }
    }
}

#[derive(Clone, Copy, clap::ValueEnum, serde::Serialize)]
enum WorkKind {
    Read,
    Write,
    Mixed,
}

impl WorkKind {
    fn next_io_type(self, write_percent: u8, rng: &mut impl Rng) -> ZioType {
        match self {
            WorkKind::Read => ZioType::Read,
            WorkKind::Write => ZioType::Write,
            WorkKind::Mixed if rng.gen_ratio(u32::from(write_percent), 100) => ZioType::Write,
            WorkKind::Mixed => ZioType::Read,
        }
    }

    fn access_mode(self) -> AccessMode {
        match self {
            WorkKind::Read => AccessMode::ReadOnly,
            WorkKind::Write | WorkKind::Mixed => AccessMode::ReadWrite,
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_file(true)
        .with_line_number(true)
        .with_env_filter({
            tracing_subscriber::EnvFilter::try_from_default_env()
                .expect("must set RUST_LOG variable")
        })
        .init();
    vdev_disk_uring::env_tunables::assert_no_unknown_env_vars();

    let args: Arc<Args> = Arc::new(Args::parse());

    let stop_clients = Arc::new(AtomicBool::new(false));
    let (stop_monitor_tx, stop_monitor_rx) = tokio::sync::oneshot::channel::<ClientsRunResult>();

    let works = setup_client_works(&args);

    let recorder = Arc::new(Recorder::new(works.len()));

    match args.run_duration {
        RunDuration::UntilCtrlC => {}
        RunDuration::FixedDuration(duration) => {
            let stop_clients = Arc::clone(&stop_clients);
            std::thread::spawn(move || {
                std::thread::sleep(duration);
                info!("configured runtime expired, setting stop flag");
                stop_clients.store(true, Ordering::Relaxed);
            });
        }
        RunDuration::FixedTotalIoCount(_) => {
            // done earlier in setup_client_works
        }
        RunDuration::FixedPerClientIoCount(_) => {
            // done earlier in setup_client_works
        }
    }

    ctrlc::set_handler({
        let stop_clients = Arc::clone(&stop_clients);
        move || {
            info!("ctrl-c, setting stop flag");
            if stop_clients.fetch_or(true, Ordering::Relaxed) {
                error!("stop flag was already set, aborting");
                std::process::abort();
            } else {
                info!("first ctrl-c, stop flag set");
            }
        }
    })
    .unwrap();

    let clients_and_monitor_ready = Arc::new(Barrier::new(works.len() + 1));

    let monitor = std::thread::Builder::new()
        .name("monitor".to_owned())
        .spawn({
            let args = Arc::clone(&args);
            let recorder = Arc::clone(&recorder);
            let ready = Arc::clone(&clients_and_monitor_ready);
            move || monitor::run(&args, &recorder, &ready, stop_monitor_rx)
        })
        .unwrap();

    let system = System::launch();
    let res = run_clients(
        &args,
        &system,
        works,
        &clients_and_monitor_ready,
        &stop_clients,
        &recorder,
    );
    stop_monitor_tx
        .send(res)
        .ok()
        .expect("monitor must not exit by itself");
    monitor.join().unwrap();
    system.initiate_shutdown();
    info!(metrics = ?vdev_disk_uring::metrics::global(), "system shut down");
}

#[derive(Clone)]
struct OpsLeft(Option<Arc<AtomicI64>>);

impl OpsLeft {
    fn take_one_op(&self) -> ControlFlow<()> {
        match &self.0 {
            None => (),
            Some(ops_left) => {
                let ops_left = ops_left.fetch_sub(1, Ordering::Relaxed);
                if ops_left <= 0 {
                    return ControlFlow::Break(());
                }
            }
        }
        ControlFlow::Continue(())
    }

    /// Give back an op whose request was rejected and has to be reissued.
    fn return_one_op(&self) {
        if let Some(ops_left) = &self.0 {
            ops_left.fetch_add(1, Ordering::Relaxed);
        }
    }
}

struct ClientWork {
    ops_left: OpsLeft,
    disk: VdevDisk,
}

fn setup_client_works(args: &Args) -> Vec<ClientWork> {
    let mut fixed_total_io_count_ops_left = None;
    let mut get_ops_left_for_client = || {
        match args.run_duration {
            RunDuration::UntilCtrlC => OpsLeft(None),
            RunDuration::FixedDuration(_) => OpsLeft(None),
            RunDuration::FixedTotalIoCount(total_io_count) => {
                let shared = fixed_total_io_count_ops_left.get_or_insert_with(|| {
                    Arc::new(AtomicI64::new(i64::try_from(total_io_count).unwrap()))
                });
                OpsLeft(Some(Arc::clone(shared)))
            }
            RunDuration::FixedPerClientIoCount(per_client) => {
                // create a separate OpsLeft per client
                OpsLeft(Some(Arc::new(AtomicI64::new(
                    i64::try_from(per_client).unwrap(),
                ))))
            }
        }
    };

    if args.device.is_none() {
        setup_files(args);
    } else if !matches!(args.work_kind, WorkKind::Read) {
        warn!(device = ?args.device, "write workload overwrites the device's contents");
    }

    let config = Config {
        direct_io: args.direct_io,
        ..Config::from_env()
    };
    (0..args.num_clients.get())
        .map(|i| {
            let path = match &args.device {
                Some(device) => device.clone(),
                None => std::fs::canonicalize(data_file_path(args, i)).unwrap(),
            };
            let mut disk = VdevDisk::new(path, args.work_kind.access_mode(), config);
            let geometry = disk.open().unwrap();
            assert!(
                geometry.psize >= args.file_size_mib.get() * 1024 * 1024,
                "device smaller than the requested working set: {geometry:?}"
            );
            info!(client = i, path = ?disk.path(), ?geometry, "client device open");
            ClientWork {
                ops_left: get_ops_left_for_client(),
                disk,
            }
        })
        .collect()
}

fn data_dir(_args: &Args) -> PathBuf {
    std::path::PathBuf::from("data")
}
fn data_file_path(_args: &Args, client_num: u64) -> PathBuf {
    std::path::PathBuf::from("data").join(format!("client_{}.data", client_num))
}

fn setup_files(args: &Args) {
    let data_dir = data_dir(args);
    std::fs::create_dir_all(&data_dir).unwrap();
    std::thread::scope(|scope| {
        for i in 0..args.num_clients.get() {
            let file_path = data_file_path(args, i);
            let (append_offset, append_megs) = match std::fs::metadata(&file_path) {
                Ok(md) => {
                    if md.len() >= args.file_size_mib.get() * 1024 * 1024 {
                        (0, 0)
                    } else {
                        info!("File {:?} exists but has wrong size", file_path);
                        let rounded_down_megs = md.len() / (1024 * 1024);
                        let rounded_down_offset = rounded_down_megs * 1024 * 1024;
                        let append_megs = args
                            .file_size_mib
                            .get()
                            .checked_sub(rounded_down_megs)
                            .unwrap();
                        (rounded_down_offset, append_megs)
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => (0, args.file_size_mib.get()),
                Err(e) => panic!("Error while checking file {:?}: {}", file_path, e),
            };
            if append_megs == 0 {
                continue;
            }
            let mut file = open_for_fill(&file_path);
            file.seek(std::io::SeekFrom::Start(append_offset)).unwrap();

            // fill the file with pseudo-random data
            scope.spawn(move || {
                let mut chunk = vec![0u8; 1 << 20];
                for _ in 0..append_megs {
                    rand::thread_rng().fill_bytes(&mut chunk);
                    file.write_all(&chunk).unwrap();
                }
            });
        }
    });
}

fn open_for_fill(path: &Path) -> std::fs::File {
    std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .open(path)
        .unwrap()
}

fn run_clients(
    args: &Args,
    system: &SystemHandle,
    works: Vec<ClientWork>,
    clients_ready: &Barrier,
    stop: &AtomicBool,
    recorder: &Recorder,
) -> ClientsRunResult {
    std::thread::scope(|scope| {
        assert_eq!(works.len(), args.num_clients.get() as usize);
        let jhs: Vec<_> = works
            .into_iter()
            .enumerate()
            .map(|(i, work)| {
                std::thread::Builder::new()
                    .name(format!("client-{i}"))
                    .spawn_scoped(scope, move || {
                        clients_ready.wait();
                        let start = Instant::now();
                        client(i, args, system, work, stop, recorder);
                        start.elapsed()
                    })
                    .unwrap()
            })
            .collect();
        let client_run_times = jhs.into_iter().map(|jh| jh.join().unwrap()).collect();
        ClientsRunResult { client_run_times }
    })
}

/// Keeps up to `queue_depth` requests against random aligned offsets in flight.
fn client(
    i: usize,
    args: &Args,
    system: &SystemHandle,
    work: ClientWork,
    stop: &AtomicBool,
    recorder: &Recorder,
) {
    info!("Client {i} starting");
    let block_size: usize = 1 << args.block_size_shift.get();
    let blocks = args.file_size_mib.get() * 1024 * 1024 / block_size as u64;
    assert!(blocks > 0, "block size exceeds the working set");
    let mut rng = rand::thread_rng();

    let (done_tx, done_rx) = mpsc::channel::<BenchCompletion>();
    let mut free_bufs: Vec<AlignedBuf> = Vec::with_capacity(args.queue_depth.get());
    let mut in_flight = 0;
    let mut exhausted = false;
    loop {
        while !exhausted && in_flight < args.queue_depth.get() {
            if stop.load(Ordering::Relaxed) || work.ops_left.take_one_op().is_break() {
                exhausted = true;
                break;
            }
            let buf = free_bufs.pop().unwrap_or_else(|| {
                let mut block = vec![0u8; block_size];
                rng.fill_bytes(&mut block);
                AlignedBuf::from_slice(&block)
            });
            let io_type = args.work_kind.next_io_type(args.write_percent, &mut rng);
            let offset = rng.gen_range(0..blocks) * block_size as u64;
            work.disk.start(
                system,
                BenchZio {
                    io_type,
                    offset,
                    size: block_size,
                    abd: BenchAbd { buf: Some(buf) },
                    error: None,
                    start: Instant::now(),
                    done: done_tx.clone(),
                },
            );
            in_flight += 1;
        }
        if in_flight == 0 {
            break;
        }

        let completion = done_rx
            .recv()
            .expect("we hold a sender, requests always settle");
        in_flight -= 1;
        if let Some(buf) = completion.buf {
            free_bufs.push(buf);
        }
        let kind = Kind::of(completion.io_type);
        match completion.error {
            None => recorder.record_done(i, kind, completion.latency),
            Some(ZioError::TryAgain) => {
                recorder.record_try_again(i, kind);
                work.ops_left.return_one_op();
            }
            Some(e) => {
                error!(client = i, offset = completion.offset, error = %e, "request failed");
                panic!("client {i}: request at offset {} failed: {e}", completion.offset);
            }
        }
    }
    info!("Client {i} stopping");
}

struct BenchCompletion {
    io_type: ZioType,
    offset: u64,
    latency: Duration,
    error: Option<ZioError>,
    buf: Option<AlignedBuf>,
}

/// One block, handed to the kernel as-is.
struct BenchAbd {
    buf: Option<AlignedBuf>,
}

impl Abd for BenchAbd {
    type Buf = AlignedBuf;

    fn borrow_buf(&mut self, size: usize) -> AlignedBuf {
        let buf = self.buf.take().expect("a request borrows its buffer once");
        assert!(buf.capacity() >= size);
        buf
    }

    fn borrow_buf_copy(&mut self, size: usize) -> AlignedBuf {
        // the block already holds the data
        self.borrow_buf(size)
    }

    fn return_buf(&mut self, buf: AlignedBuf, _size: usize) {
        self.buf = Some(buf);
    }

    fn return_buf_copy(&mut self, buf: AlignedBuf, size: usize) {
        self.return_buf(buf, size)
    }
}

struct BenchZio {
    io_type: ZioType,
    offset: u64,
    size: usize,
    abd: BenchAbd,
    error: Option<ZioError>,
    start: Instant,
    done: mpsc::Sender<BenchCompletion>,
}

impl BenchZio {
    fn finish(self) {
        let BenchZio {
            io_type,
            offset,
            abd,
            error,
            start,
            done,
            ..
        } = self;
        // the client stops receiving only after all its requests settled
        let _ = done.send(BenchCompletion {
            io_type,
            offset,
            latency: start.elapsed(),
            error,
            buf: abd.buf,
        });
    }
}

impl Zio for BenchZio {
    type Abd = BenchAbd;

    fn io_type(&self) -> ZioType {
        self.io_type
    }

    fn offset(&self) -> u64 {
        self.offset
    }

    fn size(&self) -> usize {
        self.size
    }

    fn abd(&mut self) -> &mut BenchAbd {
        &mut self.abd
    }

    fn set_error(&mut self, error: ZioError) {
        self.error = Some(error);
    }

    fn vdev_readable(&self) -> bool {
        true
    }

    fn interrupt(self) {
        self.finish()
    }

    fn execute(self) {
        self.finish()
    }
}
