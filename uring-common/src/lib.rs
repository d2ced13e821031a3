//! Types shared between the io_uring engine and the code that stages data for it.

pub mod buf;

#[cfg(target_os = "linux")]
pub use io_uring;
pub use libc;
