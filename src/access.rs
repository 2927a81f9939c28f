//! Bounds-clamped access to a mapped view



use std::{mem::size_of, ptr};



/// An address range that can be read from and, if writable, written to.
///
/// A view never owns its memory; whoever hands one out keeps the region mapped for as long as the
/// view is in use. Every access is clamped to `[0, len)`. Out of range requests copy nothing and
/// report zero instead of failing.
#[derive(Clone, Copy, Debug)]
pub(crate) struct View {
    addr: *mut u8,
    len: usize,
    writable: bool,
}

impl View {
    /// A view over nothing. Every read returns zero and every write is dropped.
    pub(crate) const EMPTY: View = View {
        addr: ptr::null_mut(),
        len: 0,
        writable: false,
    };

    /// # Safety
    /// `addr` must either be null or point to `len` bytes that stay mapped (and writable, if
    /// `writable` is set) for as long as this view is used.
    pub(crate) unsafe fn new(addr: *mut u8, len: usize, writable: bool) -> Self {
        if addr.is_null() {
            return Self::EMPTY;
        }
        Self { addr, len, writable }
    }

    pub(crate) fn addr(&self) -> *mut u8 {
        self.addr
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_null(&self) -> bool {
        self.addr.is_null()
    }

    pub(crate) fn is_writable(&self) -> bool {
        self.writable
    }

    /// Number of bytes available for a `count`-byte access at `offset`.
    fn clamp(&self, offset: usize, count: usize) -> usize {
        if self.is_null() || offset >= self.len {
            return 0;
        }
        count.min(self.len - offset)
    }

    /// Whether all `width` bytes at `offset` lie inside the view.
    fn fits(&self, offset: usize, width: usize) -> bool {
        !self.is_null()
            && offset
                .checked_add(width)
                .is_some_and(|end| end <= self.len)
    }

    pub(crate) fn read(&self, offset: usize, buf: &mut [u8]) -> usize {
        let count = self.clamp(offset, buf.len());
        if count > 0 {
            // SAFETY: `clamp` keeps `offset..offset + count` inside the mapped range, and `buf`
            // is a distinct Rust allocation.
            unsafe { ptr::copy_nonoverlapping(self.addr.add(offset), buf.as_mut_ptr(), count) };
        }
        count
    }

    pub(crate) fn write(&self, offset: usize, buf: &[u8]) -> usize {
        if !self.writable {
            return 0;
        }
        let count = self.clamp(offset, buf.len());
        if count > 0 {
            // SAFETY: See `read`. The view was created writable.
            unsafe { ptr::copy_nonoverlapping(buf.as_ptr(), self.addr.add(offset), count) };
        }
        count
    }

    pub(crate) fn read_byte(&self, offset: usize) -> u8 {
        let mut byte = [0u8; 1];
        self.read(offset, &mut byte);
        byte[0]
    }

    pub(crate) fn write_byte(&self, offset: usize, value: u8) {
        self.write(offset, &[value]);
    }

    // Mapped memory has no alignment guarantee at an arbitrary offset, so words go through
    // unaligned loads and stores.

    pub(crate) fn read_i32(&self, offset: usize) -> i32 {
        if !self.fits(offset, size_of::<i32>()) {
            return 0;
        }
        // SAFETY: `fits` checked that all four bytes are mapped.
        unsafe { ptr::read_unaligned(self.addr.add(offset) as *const i32) }
    }

    pub(crate) fn write_i32(&self, offset: usize, value: i32) {
        if !self.writable || !self.fits(offset, size_of::<i32>()) {
            return;
        }
        // SAFETY: `fits` checked that all four bytes are mapped, and the view is writable.
        unsafe { ptr::write_unaligned(self.addr.add(offset) as *mut i32, value) }
    }
}
