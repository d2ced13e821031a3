//! A disk-backed leaf vdev that issues block I/O through Linux `io_uring`.
//!
//! # Usage
//!
//! 1. Launch a [`System`] once per process to get a [`SystemHandle`].
//!    The system owns the io_uring instance and a dedicated *poller thread*
//!    that observes completions.
//! 2. Create a [`VdevDisk`] per device path and [`VdevDisk::open`] it to learn
//!    the device's geometry.
//! 3. Hand pipeline requests ([`Zio`]) to [`VdevDisk::start`]. Ownership of the
//!    request moves into the vdev until it is settled, at which point it is
//!    handed back through [`Zio::interrupt`] or [`Zio::execute`].
//! 4. [`SystemHandle::initiate_shutdown`] (or dropping the handle) stops the
//!    poller thread, waits a bounded time for in-flight operations, and tears
//!    the ring down.
//!
//! Buffers borrowed from a request's [`Abd`] are owned by the kernel while an
//! operation is in flight. The system keeps them alive until the kernel
//! reports the completion. Only a request still in flight at teardown is
//! settled earlier (see [`ZioError::ShuttingDown`]); its buffer is leaked.
//!
//! # Queue depth
//!
//! At most 128 operations are in flight per [`System`]. Requests beyond that
//! are not queued: they settle immediately with [`ZioError::TryAgain`] and the
//! pipeline decides whether to retry.

mod config;
mod error;
pub mod metrics;
mod system;
mod vdev;
mod zio;

pub use config::Config;
pub use error::{LaunchError, OpenError, VdevAux, ZioError};
pub use system::lifecycle::handle::SystemHandle;
pub use system::lifecycle::System;
pub use vdev::{AccessMode, Geometry, VdevDisk, VdevOps};
pub use zio::{Abd, Continuation, IoctlCmd, Zio, ZioType};

pub use uring_common::buf::{AlignedBuf, IoBuf, IoBufMut};

#[cfg(test)]
mod test_util;

#[doc(hidden)]
pub mod env_tunables {
    fn bool_tunable(name: &str, default: bool) -> bool {
        match std::env::var(name) {
            Ok(v) => parse_bool(&v).unwrap_or_else(|| panic!("{name} must be 0 or 1, got {v:?}")),
            Err(std::env::VarError::NotPresent) => default,
            Err(std::env::VarError::NotUnicode(_)) => panic!("{name} must be a unicode string"),
        }
    }

    fn parse_bool(v: &str) -> Option<bool> {
        match v {
            "1" => Some(true),
            "0" => Some(false),
            _ => None,
        }
    }

    pub(crate) static NOCACHEFLUSH: once_cell::sync::Lazy<bool> =
        once_cell::sync::Lazy::new(|| bool_tunable("VDEV_URING_NOCACHEFLUSH", false));
    pub(crate) static DIRECT_IO: once_cell::sync::Lazy<bool> =
        once_cell::sync::Lazy::new(|| bool_tunable("VDEV_URING_DIRECT_IO", true));

    pub fn assert_no_unknown_env_vars() {
        std::env::vars()
            .filter_map(|(v, _)| {
                if v.starts_with("VDEV_URING_") {
                    Some(v)
                } else {
                    None
                }
            })
            .for_each(|v| match v.as_str() {
                "VDEV_URING_NOCACHEFLUSH" | "VDEV_URING_DIRECT_IO" => {}
                x => panic!("env var starts with VDEV_URING but is not an env_tunable: {x:?}"),
            });
    }

    #[cfg(test)]
    mod tests {
        #[test]
        fn parse_bool() {
            assert_eq!(super::parse_bool("1"), Some(true));
            assert_eq!(super::parse_bool("0"), Some(false));
            assert_eq!(super::parse_bool("yes"), None);
            assert_eq!(super::parse_bool(""), None);
        }
    }
}
