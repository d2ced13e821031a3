use std::{
    collections::HashSet,
    os::fd::OwnedFd,
    path::PathBuf,
    sync::{atomic::Ordering, mpsc, Arc},
};

use uring_common::libc;

use super::{task::MAX_TRANSFER, VdevOps};
use crate::{
    test_util::{file_device, launch_system, recv, test_config, Settled, TestZio},
    AccessMode, Config, Continuation, IoctlCmd, OpenError, VdevAux, VdevDisk, ZioError, ZioType,
};

fn open_disk(path: PathBuf, config: Config) -> VdevDisk {
    let mut disk = VdevDisk::new(path, AccessMode::ReadWrite, config);
    disk.open().unwrap();
    disk
}

#[test]
fn relative_or_empty_path_is_a_bad_label() {
    for path in ["disk.img", ""] {
        let mut disk = VdevDisk::new(path, AccessMode::ReadWrite, test_config());
        let err = disk.open().unwrap_err();
        assert!(matches!(err, OpenError::BadPath { .. }), "{err:?}");
        assert_eq!(err.aux(), VdevAux::BadLabel);
        assert_eq!(err.errno(), libc::EINVAL);
        assert!(!disk.is_open());
    }
}

#[test]
fn missing_device_fails_to_open() {
    let dir = tempfile::tempdir().unwrap();
    let mut disk = VdevDisk::new(
        dir.path().join("nonexistent"),
        AccessMode::ReadOnly,
        test_config(),
    );
    let err = disk.open().unwrap_err();
    assert!(matches!(err, OpenError::OpenFailed { .. }), "{err:?}");
    assert_eq!(err.aux(), VdevAux::OpenFailed);
    assert_eq!(err.errno(), libc::ENOENT);
    assert!(!disk.is_open());
    assert!(disk.geometry().is_none());
}

#[test]
fn regular_file_geometry() {
    let (_dir, path) = file_device(1 << 20);
    let mut disk = VdevDisk::new(path, AccessMode::ReadWrite, test_config());
    let geometry = disk.open().unwrap();
    assert_eq!(geometry.psize, 1 << 20);
    assert_eq!(geometry.max_psize, geometry.psize);
    assert_eq!(geometry.ashift, 9);
    assert!(geometry.nonrot);
    assert_eq!(disk.geometry(), Some(geometry));
}

#[test]
fn close_releases_the_descriptor() {
    let (_dir, path) = file_device(1 << 20);
    let mut disk = open_disk(path, test_config());
    let weak = Arc::downgrade(disk.descriptor().unwrap());
    disk.set_delayed_close();

    disk.close();
    assert!(!disk.is_open());
    assert!(!disk.delayed_close());
    assert!(disk.geometry().is_none());
    assert!(weak.upgrade().is_none());

    // closing twice is harmless
    disk.close();
}

#[test]
fn reopen_keeps_descriptor_and_refreshes_geometry() {
    let (_dir, path) = file_device(1 << 20);
    let mut disk = open_disk(path.clone(), test_config());
    let before = Arc::clone(disk.descriptor().unwrap());

    std::fs::OpenOptions::new()
        .write(true)
        .open(&path)
        .unwrap()
        .set_len(2 << 20)
        .unwrap();

    let geometry = disk.reopen().unwrap();
    assert_eq!(geometry.psize, 2 << 20);
    assert!(!disk.is_reopening());
    assert!(Arc::ptr_eq(&before, disk.descriptor().unwrap()));
}

#[test]
fn fresh_open_unwinds_when_geometry_fails() {
    let mut disk = VdevDisk::new("/dev/null", AccessMode::ReadOnly, test_config());
    let err = disk.open().unwrap_err();
    assert!(matches!(err, OpenError::OpenFailed { .. }), "{err:?}");
    assert_eq!(err.aux(), VdevAux::OpenFailed);
    assert_eq!(err.errno(), libc::ENOTBLK);
    assert!(!disk.is_open());
    assert!(disk.descriptor().is_none());
    assert!(disk.geometry().is_none());
}

#[test]
fn reopen_keeps_descriptor_when_geometry_fails() {
    let (_dir, path) = file_device(1 << 20);
    let mut disk = open_disk(path, test_config());
    let before = disk.geometry();

    // a pipe has no geometry
    let (reader, _writer) = os_pipe::pipe().unwrap();
    let fd = Arc::new(OwnedFd::from(reader));
    disk.replace_descriptor(Arc::clone(&fd));

    let err = disk.reopen().unwrap_err();
    assert!(matches!(err, OpenError::OpenFailed { .. }), "{err:?}");
    assert_eq!(err.errno(), libc::ENOTBLK);
    assert!(!disk.is_reopening());
    assert!(disk.is_open());
    assert!(Arc::ptr_eq(&fd, disk.descriptor().unwrap()));
    assert_eq!(disk.geometry(), before);

    // the vdev layer decides to close after a failed reopen
    disk.close();
    assert!(!disk.is_open());
    assert_eq!(Arc::strong_count(&fd), 1);
}

#[test]
fn oversized_request_is_rejected_without_submission() {
    let (system, metrics) = launch_system();
    let (_dir, path) = file_device(1 << 20);
    let disk = open_disk(path, test_config());

    let (zio, rx) = TestZio::write(0, vec![1; 512]);
    let zio = zio.with_size(MAX_TRANSFER + 1);
    let outstanding = zio.outstanding_bufs();
    disk.io_start(&system, zio);
    let settled = rx.try_recv().unwrap();
    assert_eq!(settled.error.map(|e| e.errno()), Some(libc::EINVAL));
    assert_eq!(settled.continuation, Continuation::Deferred);
    assert_eq!(outstanding.get(), 0);
    assert_eq!(0, metrics.ops_submitted.load(Ordering::Relaxed));
    assert_eq!(system.in_flight(), 0);
}

#[test]
fn write_flush_read() {
    let (system, metrics) = launch_system();
    let (_dir, path) = file_device(1 << 20);
    let disk = open_disk(path.clone(), test_config());

    let data: Vec<u8> = (0..4096).map(|i| (i % 251) as u8).collect();
    let (zio, rx) = TestZio::write(8192, data.clone());
    let outstanding = zio.outstanding_bufs();
    disk.io_start(&system, zio);
    let settled = recv(&rx);
    assert!(settled.error.is_none(), "{:?}", settled.error);
    assert_eq!(settled.continuation, Continuation::Direct);
    assert_eq!(outstanding.get(), 0);

    let (zio, rx) = TestZio::ioctl(IoctlCmd::FlushWriteCache);
    disk.io_start(&system, zio);
    let settled = recv(&rx);
    assert!(settled.error.is_none(), "{:?}", settled.error);
    assert_eq!(settled.continuation, Continuation::Direct);

    let (zio, rx) = TestZio::read(8192, 4096);
    disk.io_start(&system, zio);
    let settled = recv(&rx);
    assert!(settled.error.is_none(), "{:?}", settled.error);
    assert_eq!(settled.continuation, Continuation::Deferred);
    assert_eq!(settled.copies_back, 1);
    assert_eq!(settled.data, data);

    system.initiate_shutdown();
    assert_eq!(3, metrics.ops_submitted.load(Ordering::Relaxed));
    assert_eq!(3, metrics.ops_completed.load(Ordering::Relaxed));

    let contents = std::fs::read(&path).unwrap();
    assert_eq!(&contents[8192..8192 + 4096], &data[..]);
}

#[test]
fn unsupported_ioctl_resumes_directly_without_submission() {
    let (system, metrics) = launch_system();
    let (_dir, path) = file_device(1 << 20);
    let disk = open_disk(path, test_config());

    let (zio, rx) = TestZio::ioctl(IoctlCmd::Other(0x1234));
    disk.io_start(&system, zio);
    let settled = rx.try_recv().unwrap();
    assert!(matches!(settled.error, Some(ZioError::NotSupported)));
    assert_eq!(settled.continuation, Continuation::Direct);
    assert_eq!(0, metrics.ops_submitted.load(Ordering::Relaxed));
}

#[test]
fn flush_on_unreadable_vdev_is_no_device() {
    let (system, metrics) = launch_system();
    let (_dir, path) = file_device(1 << 20);
    let disk = open_disk(path, test_config());

    let (zio, rx) = TestZio::ioctl(IoctlCmd::FlushWriteCache);
    disk.io_start(&system, zio.unreadable());
    let settled = rx.try_recv().unwrap();
    assert!(matches!(settled.error, Some(ZioError::NoDevice)));
    assert_eq!(settled.error.as_ref().map(|e| e.errno()), Some(libc::ENXIO));
    assert_eq!(settled.continuation, Continuation::Deferred);
    assert_eq!(0, metrics.ops_submitted.load(Ordering::Relaxed));
}

#[test]
fn nocacheflush_skips_the_flush() {
    let (system, metrics) = launch_system();
    let (_dir, path) = file_device(1 << 20);
    let config = Config {
        nocacheflush: true,
        ..test_config()
    };
    let disk = open_disk(path, config);

    let (zio, rx) = TestZio::ioctl(IoctlCmd::FlushWriteCache);
    disk.io_start(&system, zio);
    let settled = rx.try_recv().unwrap();
    assert!(settled.error.is_none());
    assert_eq!(settled.continuation, Continuation::Direct);
    assert_eq!(0, metrics.ops_submitted.load(Ordering::Relaxed));
}

#[test]
fn other_request_types_are_not_supported() {
    let (system, _metrics) = launch_system();
    let (_dir, path) = file_device(1 << 20);
    let disk = open_disk(path, test_config());

    let (zio, rx) = TestZio::other();
    disk.io_start(&system, zio);
    let settled = rx.try_recv().unwrap();
    assert_eq!(settled.io_type, ZioType::Other);
    assert!(matches!(settled.error, Some(ZioError::NotSupported)));
    assert_eq!(settled.continuation, Continuation::Deferred);
}

#[test]
fn short_read_at_end_of_device() {
    let (system, _metrics) = launch_system();
    let (_dir, path) = file_device(1 << 20);
    let disk = open_disk(path, test_config());

    let (zio, rx) = TestZio::read((1 << 20) - 1024, 4096);
    disk.io_start(&system, zio);
    let settled = recv(&rx);
    assert!(
        matches!(
            settled.error,
            Some(ZioError::ShortTransfer {
                expected: 4096,
                actual: 1024
            })
        ),
        "{:?}",
        settled.error
    );
    assert_eq!(settled.error.map(|e| e.errno()), Some(libc::ENOSPC));
    assert_eq!(settled.continuation, Continuation::Deferred);
}

#[test]
fn request_before_open_is_no_device() {
    let (system, metrics) = launch_system();
    let (_dir, path) = file_device(1 << 20);
    let disk = VdevDisk::new(path, AccessMode::ReadWrite, test_config());

    let (zio, rx) = TestZio::read(0, 512);
    let outstanding = zio.outstanding_bufs();
    disk.io_start(&system, zio);
    let settled = rx.try_recv().unwrap();
    assert!(matches!(settled.error, Some(ZioError::NoDevice)));
    assert_eq!(settled.continuation, Continuation::Deferred);
    assert_eq!(outstanding.get(), 0);
    assert_eq!(0, metrics.ops_submitted.load(Ordering::Relaxed));
}

#[test]
fn in_flight_request_survives_close() {
    let (system, _metrics) = launch_system();
    let (_dir, path) = file_device(1 << 20);
    let mut disk = open_disk(path, test_config());

    let (zio, rx) = TestZio::write(0, vec![3; 4096]);
    disk.io_start(&system, zio);
    disk.close();
    let settled = recv(&rx);
    assert!(settled.error.is_none(), "{:?}", settled.error);
}

#[test]
fn concurrent_submitters() {
    const THREADS: usize = 2;
    const OPS_PER_THREAD: usize = 200;
    const WINDOW: usize = 50;

    let (system, _metrics) = launch_system();
    let (_dir, path) = file_device(4 << 20);
    let disk = open_disk(path, test_config());
    let system = Arc::new(system);
    let disk = Arc::new(disk);

    let (tx, rx) = mpsc::channel::<Settled>();
    let submitters: Vec<_> = (0..THREADS)
        .map(|thread| {
            let system = Arc::clone(&system);
            let disk = Arc::clone(&disk);
            let tx = tx.clone();
            std::thread::spawn(move || {
                let (done_tx, done_rx) = mpsc::channel();
                let mut outstanding = 0;
                for i in 0..OPS_PER_THREAD {
                    if outstanding == WINDOW {
                        tx.send(recv(&done_rx)).unwrap();
                        outstanding -= 1;
                    }
                    let tag = thread * OPS_PER_THREAD + i;
                    let offset = (tag * 4096) as u64;
                    let zio = if i % 2 == 0 {
                        TestZio::with_sender(tag, ZioType::Write, offset, vec![tag as u8; 4096], done_tx.clone())
                    } else {
                        TestZio::with_sender(tag, ZioType::Read, offset, vec![0; 4096], done_tx.clone())
                    };
                    disk.io_start(&system, zio);
                    outstanding += 1;
                }
                for _ in 0..outstanding {
                    tx.send(recv(&done_rx)).unwrap();
                }
            })
        })
        .collect();
    drop(tx);

    let mut tags = HashSet::new();
    for settled in rx.iter() {
        assert!(settled.error.is_none(), "{:?}", settled.error);
        assert!(tags.insert(settled.tag), "tag {} settled twice", settled.tag);
    }
    for submitter in submitters {
        submitter.join().unwrap();
    }
    assert_eq!(tags.len(), THREADS * OPS_PER_THREAD);
    assert!(system.poller_is_running());
    assert_eq!(system.in_flight(), 0);
}

#[test]
fn hold_rele_and_io_done() {
    let (_dir, path) = file_device(1 << 20);
    let disk = open_disk(path, test_config());
    disk.hold();
    let (mut zio, _rx) = TestZio::read(0, 512);
    disk.io_done(&mut zio);
    disk.rele();
}

#[test]
#[should_panic(expected = "hold on a vdev without a path")]
fn hold_without_path() {
    VdevDisk::new("", AccessMode::ReadOnly, test_config()).hold();
}

#[test]
fn registered_as_leaf_disk() {
    assert_eq!(<VdevDisk as VdevOps>::TYPE, "disk");
    assert!(<VdevDisk as VdevOps>::LEAF);
}
