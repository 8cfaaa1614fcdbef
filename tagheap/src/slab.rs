use std::{marker::PhantomData, ptr};

use crate::{Gc, HeapTag, WORD_SIZE, Word};

/// Variable-length array of words owned by a single container.
///
/// The payload is `Scanned` when `T` is a reference type and `Opaque`
/// otherwise, so element words are traced exactly when they can hold
/// references. Fresh slabs are all zero.
#[repr(C)]
pub struct Slab<T> {
    _words: [usize; 0],
    _marker: PhantomData<T>,
}

impl<T: Word> Slab<T> {
    pub fn tag() -> HeapTag {
        if T::IS_REF {
            HeapTag::Scanned
        } else {
            HeapTag::Opaque
        }
    }
}

impl<T: Word> Gc<Slab<T>> {
    #[inline]
    pub fn capacity(self) -> usize {
        let header = self.header();
        match header.tag() {
            HeapTag::Scanned => header.len(),
            _ => header.len() / WORD_SIZE,
        }
    }

    #[inline]
    fn word(self, index: usize) -> *mut usize {
        self.raw().word_ptr(index)
    }

    #[inline]
    pub fn get(self, index: usize) -> Option<T> {
        if index >= self.capacity() {
            return None;
        }
        // SAFETY: bounds checked above, nonzero slab words are written from
        // `T` and `decode` rejects zero words for non-null references
        unsafe { T::decode(self.word(index).read()) }
    }

    /// Writes `value` at `index`. Returns `false` when out of bounds.
    #[inline]
    pub fn set(self, index: usize, value: T) -> bool {
        if index >= self.capacity() {
            return false;
        }
        // SAFETY: bounds checked above
        unsafe { self.word(index).write(value.to_word()) };
        true
    }

    /// Resets `index` to the zero word.
    #[inline]
    pub(crate) fn clear(self, index: usize) {
        debug_assert!(index < self.capacity());
        // SAFETY: callers stay within capacity
        unsafe { self.word(index).write(0) };
    }

    /// Copies the first `count` words of `src`.
    pub(crate) fn copy_from(self, src: Self, count: usize) {
        assert!(count <= src.capacity() && count <= self.capacity());
        // SAFETY: distinct objects, both at least `count` words long
        unsafe { ptr::copy_nonoverlapping(src.word(0), self.word(0), count) };
    }
}
