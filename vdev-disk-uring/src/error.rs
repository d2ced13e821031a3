//! Error types surfaced to the pipeline and to the vdev layer.

use std::path::PathBuf;

use uring_common::libc;

/// Failure recorded on a [`Zio`](crate::Zio) before it re-enters the pipeline.
///
/// [`ZioError::errno`] maps every variant to the errno the rest of the storage
/// stack expects.
#[derive(Debug, thiserror::Error)]
pub enum ZioError {
    /// The device cannot service control requests right now.
    #[error("device is not readable")]
    NoDevice,
    /// The request type or control command has no meaning for a disk vdev.
    #[error("operation not supported")]
    NotSupported,
    /// No free slot, or no room in the submission queue. Nothing reached the kernel.
    #[error("no room for the submission, try again")]
    TryAgain,
    /// The kernel transferred a different number of bytes than requested.
    #[error("short transfer: {actual} of {expected} bytes")]
    ShortTransfer { expected: usize, actual: usize },
    #[error(transparent)]
    Os(std::io::Error),
    /// The context was torn down before the kernel reported a completion.
    #[error("io_uring context is shutting down")]
    ShuttingDown,
}

impl ZioError {
    /// Error for a negative io_uring result.
    pub(crate) fn from_cqe_result(res: i32) -> Self {
        debug_assert!(res < 0);
        ZioError::Os(std::io::Error::from_raw_os_error(-res))
    }

    pub fn errno(&self) -> i32 {
        match self {
            ZioError::NoDevice => libc::ENXIO,
            ZioError::NotSupported => libc::ENOTSUP,
            ZioError::TryAgain => libc::EAGAIN,
            ZioError::ShortTransfer { .. } => libc::ENOSPC,
            ZioError::Os(e) => e.raw_os_error().unwrap_or(libc::EIO),
            ZioError::ShuttingDown => libc::ESHUTDOWN,
        }
    }
}

/// Auxiliary state the vdev layer records next to a failed open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VdevAux {
    /// The configured path cannot name a device.
    BadLabel,
    /// The device exists in configuration but could not be opened or probed.
    OpenFailed,
}

#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    #[error("vdev path must be absolute, got {path:?}")]
    BadPath { path: PathBuf },
    #[error("cannot open {path:?}: {source}")]
    OpenFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl OpenError {
    pub fn aux(&self) -> VdevAux {
        match self {
            OpenError::BadPath { .. } => VdevAux::BadLabel,
            OpenError::OpenFailed { .. } => VdevAux::OpenFailed,
        }
    }

    pub fn errno(&self) -> i32 {
        match self {
            OpenError::BadPath { .. } => libc::EINVAL,
            OpenError::OpenFailed { source, .. } => source.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

/// Why [`System::try_launch`](crate::System::try_launch) could not produce a context.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("io_uring setup failed: {0}")]
    IoUringBuild(#[source] std::io::Error),
    #[error("cannot spawn poller thread: {0}")]
    PollerSpawn(#[source] std::io::Error),
    #[error("poller thread failed to start: {0}")]
    PollerSetup(#[source] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(ZioError::NoDevice.errno(), libc::ENXIO);
        assert_eq!(ZioError::NotSupported.errno(), libc::ENOTSUP);
        assert_eq!(ZioError::TryAgain.errno(), libc::EAGAIN);
        assert_eq!(
            ZioError::ShortTransfer {
                expected: 4096,
                actual: 512
            }
            .errno(),
            libc::ENOSPC
        );
        assert_eq!(ZioError::from_cqe_result(-libc::EIO).errno(), libc::EIO);
        assert_eq!(
            ZioError::Os(std::io::Error::new(std::io::ErrorKind::Other, "no errno")).errno(),
            libc::EIO
        );
    }

    #[test]
    fn open_error_aux() {
        let e = OpenError::BadPath {
            path: "dev/sda".into(),
        };
        assert_eq!(e.aux(), VdevAux::BadLabel);
        assert_eq!(e.errno(), libc::EINVAL);

        let e = OpenError::OpenFailed {
            path: "/dev/nonexistent".into(),
            source: std::io::Error::from_raw_os_error(libc::ENOENT),
        };
        assert_eq!(e.aux(), VdevAux::OpenFailed);
        assert_eq!(e.errno(), libc::ENOENT);
    }
}
