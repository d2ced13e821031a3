use std::{
    fs::OpenOptions,
    os::{
        fd::{AsFd, OwnedFd},
        unix::fs::OpenOptionsExt,
    },
    path::{Path, PathBuf},
    sync::Arc,
};

use tracing::{debug, trace, warn};
use uring_common::libc;

use crate::{
    zio::{settle, Continuation, IoctlCmd, Zio, ZioType},
    Config, OpenError, SystemHandle, ZioError,
};

use super::{
    geometry::{self, ashift_for},
    task::{Task, MAX_TRANSFER},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

/// What the vdev layer learns about a device when opening it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Usable capacity in bytes.
    pub psize: u64,
    /// Capacity the device could grow to. Disks do not grow, so this equals `psize`.
    pub max_psize: u64,
    /// log2 of the smallest allocation unit.
    pub ashift: u64,
    /// The device has no seek penalty.
    pub nonrot: bool,
}

/// A leaf vdev backed by a block device (or a regular file standing in for one).
pub struct VdevDisk {
    path: PathBuf,
    mode: AccessMode,
    config: Config,
    fd: Option<Arc<OwnedFd>>,
    geometry: Option<Geometry>,
    reopening: bool,
    delayed_close: bool,
}

impl VdevDisk {
    pub fn new(path: impl Into<PathBuf>, mode: AccessMode, config: Config) -> Self {
        VdevDisk {
            path: path.into(),
            mode,
            config,
            fd: None,
            geometry: None,
            reopening: false,
            delayed_close: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_open(&self) -> bool {
        self.fd.is_some()
    }

    /// Geometry reported by the last successful open.
    pub fn geometry(&self) -> Option<Geometry> {
        self.geometry
    }

    pub fn is_reopening(&self) -> bool {
        self.reopening
    }

    pub fn delayed_close(&self) -> bool {
        self.delayed_close
    }

    /// Mark the device for closing once outstanding activity has drained.
    /// [`close`](Self::close) clears the mark.
    pub fn set_delayed_close(&mut self) {
        self.delayed_close = true;
    }

    #[cfg(test)]
    pub(crate) fn descriptor(&self) -> Option<&Arc<OwnedFd>> {
        self.fd.as_ref()
    }

    /// Swap the descriptor behind an open device, e.g. for one whose geometry
    /// cannot be queried.
    #[cfg(test)]
    pub(crate) fn replace_descriptor(&mut self, fd: Arc<OwnedFd>) {
        assert!(self.is_open());
        self.fd = Some(fd);
    }

    /// Open the device (unless a reopen keeps the current descriptor) and
    /// query its geometry.
    ///
    /// On failure no descriptor opened by this call is retained.
    pub fn open(&mut self) -> Result<Geometry, OpenError> {
        if !self.path.is_absolute() {
            return Err(OpenError::BadPath {
                path: self.path.clone(),
            });
        }

        let fd = match &self.fd {
            Some(fd) => {
                if !self.reopening {
                    debug!(path = ?self.path, "device already open, keeping descriptor");
                }
                Arc::clone(fd)
            }
            None => Arc::new(self.open_device().map_err(|source| {
                debug!(path = ?self.path, error = %source, "cannot open device");
                OpenError::OpenFailed {
                    path: self.path.clone(),
                    source,
                }
            })?),
        };

        let raw = match geometry::query(fd.as_fd()) {
            Ok(raw) => raw,
            Err(source) => {
                warn!(path = ?self.path, error = %source, "cannot query device geometry");
                return Err(OpenError::OpenFailed {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        let geometry = Geometry {
            psize: raw.size,
            max_psize: raw.size,
            ashift: ashift_for(raw.sector_size),
            nonrot: !raw.rotational,
        };
        debug!(path = ?self.path, ?geometry, sector_size = raw.sector_size, "device open");
        self.fd = Some(fd);
        self.geometry = Some(geometry);
        Ok(geometry)
    }

    fn open_device(&self) -> std::io::Result<OwnedFd> {
        let mut options = OpenOptions::new();
        options
            .read(true)
            .write(self.mode == AccessMode::ReadWrite);
        if self.config.direct_io {
            options.custom_flags(libc::O_DIRECT);
        }
        Ok(OwnedFd::from(options.open(&self.path)?))
    }

    /// Release the device. A no-op while reopening or when not open.
    ///
    /// Operations still in flight keep the descriptor alive until they complete.
    pub fn close(&mut self) {
        if self.reopening || self.fd.is_none() {
            return;
        }
        debug!(path = ?self.path, "closing device");
        self.fd = None;
        self.geometry = None;
        self.delayed_close = false;
    }

    /// Refresh the geometry without giving up the descriptor.
    ///
    /// If the refresh fails the descriptor is kept; the vdev layer closes the
    /// device afterwards.
    pub fn reopen(&mut self) -> Result<Geometry, OpenError> {
        self.reopening = true;
        self.close();
        let res = self.open();
        self.reopening = false;
        res
    }

    /// Take ownership of `zio` and either submit it to the kernel or settle it
    /// right away.
    pub fn start<Z: Zio>(&self, system: &SystemHandle, zio: Z) {
        match zio.io_type() {
            ZioType::Ioctl(cmd) => {
                if !zio.vdev_readable() {
                    return settle(zio, Some(ZioError::NoDevice), Continuation::Deferred);
                }
                if cmd != IoctlCmd::FlushWriteCache {
                    trace!(?cmd, "unsupported control command");
                    return settle(zio, Some(ZioError::NotSupported), Continuation::Direct);
                }
                if self.config.nocacheflush {
                    return settle(zio, None, Continuation::Direct);
                }
            }
            ZioType::Read | ZioType::Write => {
                if zio.size() > MAX_TRANSFER {
                    debug!(size = zio.size(), "request does not fit a single transfer");
                    let error = std::io::Error::from_raw_os_error(libc::EINVAL);
                    return settle(zio, Some(ZioError::Os(error)), Continuation::Deferred);
                }
            }
            ZioType::Other => {
                return settle(zio, Some(ZioError::NotSupported), Continuation::Deferred);
            }
        }

        let Some(fd) = &self.fd else {
            debug!(path = ?self.path, "request for a device that is not open");
            return settle(zio, Some(ZioError::NoDevice), Continuation::Deferred);
        };
        system.submit(Box::new(Task::new(zio, Arc::clone(fd))));
    }

    /// Per-request completion hook. Nothing to do for disks.
    pub fn io_done<Z: Zio>(&self, _zio: &mut Z) {}

    pub fn hold(&self) {
        assert!(!self.path.as_os_str().is_empty(), "hold on a vdev without a path");
    }

    pub fn rele(&self) {
        assert!(!self.path.as_os_str().is_empty(), "rele on a vdev without a path");
    }
}
