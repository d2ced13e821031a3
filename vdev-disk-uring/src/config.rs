/// Tunables of a disk vdev and the io_uring context serving it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Settle cache-flush requests immediately instead of issuing an fsync.
    pub nocacheflush: bool,
    /// Open devices with `O_DIRECT`.
    ///
    /// Tests run against files on filesystems that may reject direct I/O,
    /// so this can be turned off.
    pub direct_io: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            nocacheflush: false,
            direct_io: true,
        }
    }
}

impl Config {
    /// Defaults, overridden by the `VDEV_URING_*` environment variables.
    /// See [`crate::env_tunables`].
    pub fn from_env() -> Self {
        Config {
            nocacheflush: *crate::env_tunables::NOCACHEFLUSH,
            direct_io: *crate::env_tunables::DIRECT_IO,
        }
    }
}
