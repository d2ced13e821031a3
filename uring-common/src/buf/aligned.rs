use std::alloc::{self, Layout};
use std::ops::Deref;
use std::ptr::NonNull;

use super::{IoBuf, IoBufMut};

/// A heap buffer whose start address is aligned for `O_DIRECT` transfers.
///
/// `bytes_total` is exactly the length asked for at construction; the
/// allocation behind it is rounded up to a multiple of the alignment so the
/// kernel never sees a partial trailing block of foreign memory.
/// Freshly allocated memory is zeroed, so every byte up to `bytes_total` is
/// initialized from Rust's point of view even before a read fills it.
pub struct AlignedBuf {
    ptr: NonNull<u8>,
    layout: Layout,
    init: usize,
    total: usize,
}

// Safety: AlignedBuf owns its allocation exclusively.
unsafe impl Send for AlignedBuf {}
unsafe impl Sync for AlignedBuf {}

impl AlignedBuf {
    /// Logical block size used by most devices that enforce direct-I/O alignment.
    pub const DEFAULT_ALIGN: usize = 4096;

    /// A buffer able to hold `len` bytes, none of them initialized yet.
    pub fn with_capacity(len: usize) -> Self {
        Self::with_alignment(len, Self::DEFAULT_ALIGN)
    }

    /// # Panics
    ///
    /// If `align` is not a power of two.
    pub fn with_alignment(len: usize, align: usize) -> Self {
        assert!(align.is_power_of_two(), "alignment must be a power of two: {align}");
        let alloc_len = len.max(1).next_multiple_of(align);
        let layout = match Layout::from_size_align(alloc_len, align) {
            Ok(layout) => layout,
            Err(e) => panic!("invalid buffer layout len={len} align={align}: {e}"),
        };
        // Safety: layout has non-zero size
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(ptr) else {
            alloc::handle_alloc_error(layout);
        };
        AlignedBuf {
            ptr,
            layout,
            init: 0,
            total: len,
        }
    }

    /// A buffer initialized with a copy of `data`.
    pub fn from_slice(data: &[u8]) -> Self {
        let mut buf = Self::with_capacity(data.len());
        buf.extend_from_slice(data);
        buf
    }

    pub fn len(&self) -> usize {
        self.init
    }

    pub fn is_empty(&self) -> bool {
        self.init == 0
    }

    pub fn capacity(&self) -> usize {
        self.total
    }

    pub fn alignment(&self) -> usize {
        self.layout.align()
    }

    /// Appends `data` after the initialized bytes.
    ///
    /// # Panics
    ///
    /// If the result would not fit in the capacity.
    pub fn extend_from_slice(&mut self, data: &[u8]) {
        let end = self.init + data.len();
        assert!(
            end <= self.total,
            "extend past capacity: {end} > {}",
            self.total
        );
        // Safety: the allocation is at least `total` bytes and does not overlap `data`.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(self.init), data.len());
        }
        self.init = end;
    }

    pub fn clear(&mut self) {
        self.init = 0;
    }
}

impl Deref for AlignedBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        super::deref(self)
    }
}

impl std::ops::DerefMut for AlignedBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        super::deref_mut(self)
    }
}

impl std::fmt::Debug for AlignedBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuf")
            .field("ptr", &self.ptr)
            .field("init", &self.init)
            .field("total", &self.total)
            .field("align", &self.layout.align())
            .finish()
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        // Safety: ptr was allocated with exactly this layout
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

unsafe impl IoBuf for AlignedBuf {
    fn stable_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    fn bytes_init(&self) -> usize {
        self.init
    }

    fn bytes_total(&self) -> usize {
        self.total
    }
}

unsafe impl IoBufMut for AlignedBuf {
    fn stable_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    unsafe fn set_init(&mut self, pos: usize) {
        debug_assert!(pos <= self.total);
        if self.init < pos {
            self.init = pos;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_is_aligned() {
        for align in [512, 4096, 65536] {
            let buf = AlignedBuf::with_alignment(100, align);
            assert_eq!(buf.stable_ptr() as usize % align, 0);
            assert_eq!(buf.bytes_total(), 100);
            assert_eq!(buf.bytes_init(), 0);
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn zero_length_is_allowed() {
        let buf = AlignedBuf::with_capacity(0);
        assert_eq!(buf.bytes_total(), 0);
        assert_eq!(&buf[..], &[] as &[u8]);
    }

    #[test]
    fn extend_and_deref() {
        let mut buf = AlignedBuf::with_capacity(8);
        buf.extend_from_slice(b"abc");
        buf.extend_from_slice(b"de");
        assert_eq!(&buf[..], b"abcde");
        buf[0] = b'x';
        assert_eq!(&buf[..], b"xbcde");
        buf.clear();
        assert!(buf.is_empty());
    }

    #[test]
    #[should_panic(expected = "extend past capacity")]
    fn extend_past_capacity_panics() {
        let mut buf = AlignedBuf::with_capacity(2);
        buf.extend_from_slice(b"abc");
    }

    #[test]
    fn set_init_exposes_kernel_written_bytes() {
        let mut buf = AlignedBuf::with_capacity(4096);
        unsafe {
            std::ptr::write_bytes(buf.stable_mut_ptr(), 7, 10);
            buf.set_init(10);
            // lower water marks are ignored
            buf.set_init(3);
        }
        assert_eq!(buf.len(), 10);
        assert!(buf.iter().all(|b| *b == 7));
    }
}
