use std::any::Any;

use uring_common::io_uring;

use crate::ZioError;

/// An io_uring operation together with the request it serves and the
/// resources the kernel reads or writes.
///
/// Ops are type-erased into the [`Slots`](crate::system::slots) table while
/// in flight, so every callback consumes a `Box<Self>`.
pub(crate) trait Op: Send + 'static {
    /// Build the SQE. The pointers in it stay valid for as long as `self` is alive.
    fn make_sqe(&mut self) -> io_uring::squeue::Entry;

    /// The kernel reported `res` for this op.
    fn on_op_completion(self: Box<Self>, res: i32);

    /// The op never reached the kernel, or its resources were taken by
    /// [`Op::take_resources_owned_by_kernel`] and it is being settled early.
    fn on_failed_submission(self: Box<Self>, error: ZioError);

    /// Move out everything the SQE points to, so the request can be settled
    /// while the kernel may still use the memory.
    fn take_resources_owned_by_kernel(&mut self) -> Box<dyn Any + Send>;
}
