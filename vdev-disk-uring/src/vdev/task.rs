use std::{
    any::Any,
    os::fd::{AsRawFd, OwnedFd},
    sync::Arc,
};

use uring_common::{
    buf::{IoBuf, IoBufMut},
    io_uring,
};

use crate::{
    system::submission::op::Op,
    zio::{settle, Abd, Continuation, Zio, ZioType},
    ZioError,
};

type BufOf<Z> = <<Z as Zio>::Abd as Abd>::Buf;

/// Largest transfer a single read or write SQE can describe.
pub(crate) const MAX_TRANSFER: usize = u32::MAX as usize;

/// The kernel operation backing a request, and the buffer it was staged in.
enum TaskOp<B> {
    Flush,
    Read(B),
    Write(B),
    /// Resources were moved out while the kernel may still be using them.
    Detached,
}

/// Per-request state while the request is owned by the vdev.
///
/// Holds its own reference to the device descriptor, so closing the vdev
/// never invalidates a descriptor the kernel is still using.
pub(crate) struct Task<Z: Zio> {
    zio: Z,
    fd: Option<Arc<OwnedFd>>,
    len: u32,
    op: TaskOp<BufOf<Z>>,
}

impl<Z: Zio> Task<Z> {
    /// Stage `zio` for submission. Reads and writes borrow a buffer from the
    /// request's data; writes copy the data into it.
    ///
    /// # Panics
    ///
    /// If the request is not a read, write or control request, or if it is
    /// larger than [`MAX_TRANSFER`].
    pub(crate) fn new(mut zio: Z, fd: Arc<OwnedFd>) -> Self {
        let size = zio.size();
        let len = u32::try_from(size).expect("oversized requests are settled before staging");
        let op = match zio.io_type() {
            ZioType::Ioctl(_) => TaskOp::Flush,
            ZioType::Read => TaskOp::Read(zio.abd().borrow_buf(size)),
            ZioType::Write => TaskOp::Write(zio.abd().borrow_buf_copy(size)),
            ZioType::Other => unreachable!("caller filters out unsupported request types"),
        };
        Task {
            zio,
            fd: Some(fd),
            len,
            op,
        }
    }
}

fn transfer_result(res: i32, expected: usize) -> Option<ZioError> {
    if res < 0 {
        return Some(ZioError::from_cqe_result(res));
    }
    let actual = res as usize;
    if actual != expected {
        return Some(ZioError::ShortTransfer { expected, actual });
    }
    None
}

impl<Z: Zio> Op for Task<Z> {
    fn make_sqe(&mut self) -> io_uring::squeue::Entry {
        let fd = io_uring::types::Fd(
            self.fd
                .as_ref()
                .expect("resources are only detached after submission")
                .as_raw_fd(),
        );
        let offset = self.zio.offset();
        let len = self.len;
        match &mut self.op {
            TaskOp::Flush => io_uring::opcode::Fsync::new(fd).build(),
            TaskOp::Read(buf) => {
                assert!(buf.bytes_total() >= len as usize);
                io_uring::opcode::Read::new(fd, buf.stable_mut_ptr(), len)
                    .offset(offset)
                    .build()
            }
            TaskOp::Write(buf) => {
                assert!(buf.bytes_init() >= len as usize);
                io_uring::opcode::Write::new(fd, buf.stable_ptr(), len)
                    .offset(offset)
                    .build()
            }
            TaskOp::Detached => unreachable!("resources are only detached after submission"),
        }
    }

    fn on_op_completion(self: Box<Self>, res: i32) {
        let Task { mut zio, fd, op, .. } = *self;
        drop(fd);
        let io_type = zio.io_type();
        let size = zio.size();
        let error = match op {
            TaskOp::Flush => (res < 0).then(|| ZioError::from_cqe_result(res)),
            TaskOp::Read(mut buf) => {
                if res > 0 {
                    // SAFETY: the kernel initialized `res` bytes
                    unsafe { buf.set_init(res as usize) };
                }
                zio.abd().return_buf_copy(buf, size);
                transfer_result(res, size)
            }
            TaskOp::Write(buf) => {
                zio.abd().return_buf(buf, size);
                transfer_result(res, size)
            }
            TaskOp::Detached => unreachable!("detached tasks never complete"),
        };
        settle(zio, error, Continuation::after_completion(io_type));
    }

    fn on_failed_submission(self: Box<Self>, error: ZioError) {
        let Task { mut zio, op, .. } = *self;
        let size = zio.size();
        match op {
            TaskOp::Read(buf) | TaskOp::Write(buf) => zio.abd().return_buf(buf, size),
            TaskOp::Flush | TaskOp::Detached => (),
        }
        settle(zio, Some(error), Continuation::Deferred);
    }

    fn take_resources_owned_by_kernel(&mut self) -> Box<dyn Any + Send> {
        let op = std::mem::replace(&mut self.op, TaskOp::Detached);
        let buf = match op {
            TaskOp::Read(buf) | TaskOp::Write(buf) => Some(buf),
            TaskOp::Flush | TaskOp::Detached => None,
        };
        Box::new((self.fd.take(), buf))
    }
}
