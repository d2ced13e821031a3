mod disk;
mod geometry;
pub(crate) mod task;
#[cfg(test)]
mod tests;

pub use disk::{AccessMode, Geometry, VdevDisk};

use crate::{OpenError, SystemHandle, Zio};

/// Operations the vdev layer performs on a leaf device backend.
pub trait VdevOps {
    /// Name the vdev layer registers the backend under.
    const TYPE: &'static str;
    /// Leaf vdevs have no children and perform I/O themselves.
    const LEAF: bool;

    fn open(&mut self) -> Result<Geometry, OpenError>;
    fn close(&mut self);
    /// Take ownership of `zio` and settle it exactly once.
    fn io_start<Z: Zio>(&self, system: &SystemHandle, zio: Z);
    fn io_done<Z: Zio>(&self, zio: &mut Z);
    fn hold(&self);
    fn rele(&self);
}

impl VdevOps for VdevDisk {
    const TYPE: &'static str = "disk";
    const LEAF: bool = true;

    fn open(&mut self) -> Result<Geometry, OpenError> {
        VdevDisk::open(self)
    }

    fn close(&mut self) {
        VdevDisk::close(self)
    }

    fn io_start<Z: Zio>(&self, system: &SystemHandle, zio: Z) {
        self.start(system, zio)
    }

    fn io_done<Z: Zio>(&self, zio: &mut Z) {
        VdevDisk::io_done(self, zio)
    }

    fn hold(&self) {
        VdevDisk::hold(self)
    }

    fn rele(&self) {
        VdevDisk::rele(self)
    }
}
