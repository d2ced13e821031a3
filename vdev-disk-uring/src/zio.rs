//! The contract between the storage pipeline and a disk vdev.
//!
//! A [`Zio`] is moved into [`VdevDisk::start`](crate::VdevDisk::start) and
//! handed back to the pipeline exactly once, through either
//! [`Zio::interrupt`] or [`Zio::execute`]. Ownership makes the "exactly once"
//! part a compile-time property: both continuations consume the request.
//!
//! Data is staged through an [`Abd`]: the vdev borrows a flat buffer for the
//! kernel to use and returns it when the operation settles, optionally copying
//! its contents back into the logical data.

use uring_common::buf::IoBufMut;

use crate::ZioError;

/// Control commands a pipeline may issue through [`ZioType::Ioctl`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoctlCmd {
    FlushWriteCache,
    Other(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZioType {
    Read,
    Write,
    Ioctl(IoctlCmd),
    /// Any request kind a disk vdev has no handler for (frees, claims, ...).
    Other,
}

/// How a settled request re-enters the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuation {
    /// Hand the request to the pipeline's deferred executor ([`Zio::interrupt`]).
    Deferred,
    /// Run the next pipeline stage on the calling thread ([`Zio::execute`]).
    Direct,
}

impl Continuation {
    /// Path taken by a request whose operation went through the kernel.
    ///
    /// Reads are deferred because the stage after them verifies checksums and
    /// must not run on the poller thread. Writes and flushes resume inline.
    pub fn after_completion(io_type: ZioType) -> Self {
        match io_type {
            ZioType::Read => Continuation::Deferred,
            ZioType::Write | ZioType::Ioctl(_) | ZioType::Other => Continuation::Direct,
        }
    }

    pub(crate) fn resume<Z: Zio>(self, zio: Z) {
        match self {
            Continuation::Deferred => zio.interrupt(),
            Continuation::Direct => zio.execute(),
        }
    }
}

/// Records `error` (if any) on `zio` and hands it back to the pipeline.
pub(crate) fn settle<Z: Zio>(mut zio: Z, error: Option<ZioError>, continuation: Continuation) {
    if let Some(error) = error {
        zio.set_error(error);
    }
    continuation.resume(zio);
}

/// Scatter/gather data behind a request, as seen by the vdev.
pub trait Abd: Send + 'static {
    /// The flat buffer type handed to the kernel.
    type Buf: IoBufMut;

    /// Borrow a buffer of `size` bytes for the kernel to read into.
    /// Its contents are unspecified.
    fn borrow_buf(&mut self, size: usize) -> Self::Buf;

    /// Borrow a buffer holding a copy of the first `size` bytes of the data.
    fn borrow_buf_copy(&mut self, size: usize) -> Self::Buf;

    /// Release a borrowed buffer without copying anything back.
    fn return_buf(&mut self, buf: Self::Buf, size: usize);

    /// Copy the first `size` bytes of `buf` back into the data, then release it.
    fn return_buf_copy(&mut self, buf: Self::Buf, size: usize);
}

/// A pipeline I/O request.
pub trait Zio: Send + 'static {
    type Abd: Abd;

    fn io_type(&self) -> ZioType;
    /// Byte offset on the device.
    fn offset(&self) -> u64;
    /// Transfer length in bytes.
    fn size(&self) -> usize;
    fn abd(&mut self) -> &mut Self::Abd;
    fn set_error(&mut self, error: ZioError);
    /// Whether the vdev this request targets can currently be read from.
    fn vdev_readable(&self) -> bool;

    /// Deferred continuation. Must not block.
    fn interrupt(self);
    /// Direct continuation.
    fn execute(self);
}
