//! Device geometry probing.

use std::os::fd::{AsRawFd, BorrowedFd};

use nix::sys::stat::{fstat, SFlag};
use uring_common::libc;

/// Smallest block the pool allocates.
pub(crate) const SPA_MINBLOCKSIZE: u64 = 512;

mod ioctl {
    use uring_common::libc;

    // <linux/fs.h>
    nix::ioctl_read_bad!(blksszget, nix::request_code_none!(0x12, 104), libc::c_int);
    nix::ioctl_read!(blkgetsize64, 0x12, 114, u64);
    nix::ioctl_read_bad!(blkrotational, nix::request_code_none!(0x12, 126), libc::c_ushort);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RawGeometry {
    pub(crate) sector_size: u64,
    pub(crate) size: u64,
    pub(crate) rotational: bool,
}

/// Query sector size, capacity and rotational flag of the device behind `fd`.
///
/// Regular files are accepted as file-backed devices: their capacity is the
/// file length, they have 512-byte sectors and are reported non-rotational.
/// Anything else that is not a block device fails with `ENOTBLK`.
pub(crate) fn query(fd: BorrowedFd<'_>) -> std::io::Result<RawGeometry> {
    let raw = fd.as_raw_fd();
    let stat = fstat(raw)?;
    let kind = SFlag::from_bits_truncate(stat.st_mode) & SFlag::S_IFMT;
    if kind == SFlag::S_IFBLK {
        let mut sector_size: libc::c_int = 0;
        let mut size: u64 = 0;
        let mut rotational: libc::c_ushort = 0;
        // SAFETY: each ioctl writes a single value of the pointee's type
        unsafe {
            ioctl::blksszget(raw, &mut sector_size)?;
            ioctl::blkgetsize64(raw, &mut size)?;
            ioctl::blkrotational(raw, &mut rotational)?;
        }
        Ok(RawGeometry {
            sector_size: u64::try_from(sector_size).unwrap_or(0),
            size,
            rotational: rotational != 0,
        })
    } else if kind == SFlag::S_IFREG {
        Ok(RawGeometry {
            sector_size: SPA_MINBLOCKSIZE,
            size: u64::try_from(stat.st_size).unwrap_or(0),
            rotational: false,
        })
    } else {
        Err(std::io::Error::from_raw_os_error(libc::ENOTBLK))
    }
}

/// log2 of the allocation unit for a device with `sector_size`-byte sectors,
/// never below [`SPA_MINBLOCKSIZE`].
pub(crate) fn ashift_for(sector_size: u64) -> u64 {
    let sz = sector_size.max(SPA_MINBLOCKSIZE);
    u64::from(63 - sz.leading_zeros())
}
