//! Stand-ins for the storage pipeline, used by the unit tests.

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicIsize, Ordering},
        mpsc, Arc,
    },
    time::Duration,
};

use uring_common::buf::AlignedBuf;

use crate::{
    metrics::MetricsStorage, Abd, Config, Continuation, IoctlCmd, System, SystemHandle, Zio,
    ZioError, ZioType,
};

pub(crate) const RECV_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// A system with its own metrics, so tests running in parallel don't see each other.
pub(crate) fn launch_system() -> (SystemHandle, &'static MetricsStorage) {
    init_logging();
    let metrics: &'static MetricsStorage = Box::leak(Box::new(MetricsStorage::new_const()));
    let system = System::launch_with_metrics(metrics).unwrap();
    (system, metrics)
}

/// tmpfs and friends reject `O_DIRECT`.
pub(crate) fn test_config() -> Config {
    Config {
        direct_io: false,
        ..Config::default()
    }
}

/// A zero-filled regular file of `len` bytes standing in for a disk.
pub(crate) fn file_device(len: u64) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("disk.img");
    let file = std::fs::File::create(&path).unwrap();
    file.set_len(len).unwrap();
    (dir, path)
}

/// Number of buffers borrowed from a [`TestAbd`] and not yet returned.
#[derive(Clone)]
pub(crate) struct BufCounter(Arc<AtomicIsize>);

impl BufCounter {
    pub(crate) fn get(&self) -> isize {
        self.0.load(Ordering::SeqCst)
    }
}

pub(crate) struct TestAbd {
    data: Vec<u8>,
    outstanding: BufCounter,
    copies_back: usize,
}

impl Abd for TestAbd {
    type Buf = AlignedBuf;

    fn borrow_buf(&mut self, size: usize) -> AlignedBuf {
        self.outstanding.0.fetch_add(1, Ordering::SeqCst);
        AlignedBuf::with_capacity(size)
    }

    fn borrow_buf_copy(&mut self, size: usize) -> AlignedBuf {
        self.outstanding.0.fetch_add(1, Ordering::SeqCst);
        AlignedBuf::from_slice(&self.data[..size])
    }

    fn return_buf(&mut self, buf: AlignedBuf, _size: usize) {
        self.outstanding.0.fetch_sub(1, Ordering::SeqCst);
        drop(buf);
    }

    fn return_buf_copy(&mut self, buf: AlignedBuf, size: usize) {
        let n = buf.len().min(size);
        self.data[..n].copy_from_slice(&buf[..n]);
        self.copies_back += 1;
        self.return_buf(buf, size);
    }
}

/// What a [`TestZio`] looked like when it re-entered the pipeline.
#[derive(Debug)]
pub(crate) struct Settled {
    pub(crate) tag: usize,
    pub(crate) io_type: ZioType,
    pub(crate) continuation: Continuation,
    pub(crate) error: Option<ZioError>,
    pub(crate) data: Vec<u8>,
    pub(crate) copies_back: usize,
}

/// A pipeline request that reports how it was settled over a channel.
pub(crate) struct TestZio {
    tag: usize,
    io_type: ZioType,
    offset: u64,
    size: usize,
    abd: TestAbd,
    error: Option<ZioError>,
    readable: bool,
    done: mpsc::Sender<Settled>,
}

impl TestZio {
    pub(crate) fn with_sender(
        tag: usize,
        io_type: ZioType,
        offset: u64,
        data: Vec<u8>,
        done: mpsc::Sender<Settled>,
    ) -> Self {
        TestZio {
            tag,
            io_type,
            offset,
            size: data.len(),
            abd: TestAbd {
                data,
                outstanding: BufCounter(Arc::new(AtomicIsize::new(0))),
                copies_back: 0,
            },
            error: None,
            readable: true,
            done,
        }
    }

    fn with_channel(io_type: ZioType, offset: u64, data: Vec<u8>) -> (Self, mpsc::Receiver<Settled>) {
        let (tx, rx) = mpsc::channel();
        (Self::with_sender(0, io_type, offset, data, tx), rx)
    }

    pub(crate) fn read(offset: u64, size: usize) -> (Self, mpsc::Receiver<Settled>) {
        Self::with_channel(ZioType::Read, offset, vec![0; size])
    }

    pub(crate) fn write(offset: u64, data: Vec<u8>) -> (Self, mpsc::Receiver<Settled>) {
        Self::with_channel(ZioType::Write, offset, data)
    }

    pub(crate) fn ioctl(cmd: IoctlCmd) -> (Self, mpsc::Receiver<Settled>) {
        Self::with_channel(ZioType::Ioctl(cmd), 0, Vec::new())
    }

    pub(crate) fn other() -> (Self, mpsc::Receiver<Settled>) {
        Self::with_channel(ZioType::Other, 0, Vec::new())
    }

    pub(crate) fn unreadable(mut self) -> Self {
        self.readable = false;
        self
    }

    /// Claim a size larger than the data held. Only for requests that are
    /// rejected before a buffer is borrowed.
    pub(crate) fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    pub(crate) fn outstanding_bufs(&self) -> BufCounter {
        self.abd.outstanding.clone()
    }

    fn finish(self, continuation: Continuation) {
        let TestZio {
            tag,
            io_type,
            abd,
            error,
            done,
            ..
        } = self;
        // the receiver may be gone in tests that only check side effects
        let _ = done.send(Settled {
            tag,
            io_type,
            continuation,
            error,
            data: abd.data,
            copies_back: abd.copies_back,
        });
    }
}

impl Zio for TestZio {
    type Abd = TestAbd;

    fn io_type(&self) -> ZioType {
        self.io_type
    }

    fn offset(&self) -> u64 {
        self.offset
    }

    fn size(&self) -> usize {
        self.size
    }

    fn abd(&mut self) -> &mut TestAbd {
        &mut self.abd
    }

    fn set_error(&mut self, error: ZioError) {
        assert!(self.error.is_none(), "error set twice: {error}");
        self.error = Some(error);
    }

    fn vdev_readable(&self) -> bool {
        self.readable
    }

    fn interrupt(self) {
        self.finish(Continuation::Deferred)
    }

    fn execute(self) {
        self.finish(Continuation::Direct)
    }
}

pub(crate) fn recv(rx: &mpsc::Receiver<Settled>) -> Settled {
    rx.recv_timeout(RECV_TIMEOUT)
        .expect("request settles within the timeout")
}
