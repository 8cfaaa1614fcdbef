use std::{ptr, slice, str::Utf8Error};

use crate::{Gc, ObjPtr, RootFrame, heap};

/// Immutable byte string.
#[repr(C)]
pub struct Str {
    _bytes: [u8; 0],
}

/// Uninitialized string storage with room for `capacity` bytes.
pub(crate) fn alloc_storage(len: usize, capacity: usize) -> Gc<Str> {
    let obj: ObjPtr = heap::alloc_bytes(len, capacity);
    // SAFETY: opaque payload of at least `capacity` bytes
    unsafe { Gc::from_raw(obj) }
}

/// Copies `bytes` into a fresh string.
///
/// `bytes` may point into another heap object as long as that object is
/// rooted: the heap never moves objects.
pub fn alloc_str(bytes: &[u8]) -> Gc<Str> {
    let s = alloc_storage(bytes.len(), bytes.len());
    // SAFETY: fresh payload of `bytes.len()` bytes
    unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), s.raw().as_ptr(), bytes.len()) };
    s
}

impl Gc<Str> {
    pub fn as_bytes(&self) -> &[u8] {
        let obj = self.raw();
        // SAFETY: the header records how many payload bytes are in use
        unsafe { slice::from_raw_parts(obj.as_ptr(), obj.header_ptr().as_ref().len()) }
    }

    pub fn as_str(&self) -> Result<&str, Utf8Error> {
        std::str::from_utf8(self.as_bytes())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.header().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Splits around the first occurrence of `delim`.
    pub fn split_once(self, delim: &[u8]) -> Option<(Gc<Str>, Gc<Str>)> {
        let bytes = self.as_bytes();
        if delim.is_empty() || delim.len() > bytes.len() {
            return None;
        }
        let at = bytes.windows(delim.len()).position(|w| w == delim)?;

        let frame = RootFrame::new();
        frame.keep(self);
        let head = alloc_str(&bytes[..at]);
        frame.keep(head);
        let tail = alloc_str(&bytes[at + delim.len()..]);
        Some((head, tail))
    }
}
