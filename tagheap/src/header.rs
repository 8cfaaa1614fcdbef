use std::{cell::Cell, fmt, mem, ops::BitOr};

use bitflags::bitflags;

use crate::ShapeId;

pub const WORD_SIZE: usize = mem::size_of::<usize>();

/// Number of payload words a field mask can describe.
pub const MAX_MASK_WORDS: usize = u32::BITS as usize;

pub const HEADER_SIZE: usize = mem::size_of::<Header>();

const _: () = assert!(HEADER_SIZE == 16);
const _: () = assert!(HEADER_SIZE % WORD_SIZE == 0);

/// Tracing strategy of an object.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum HeapTag {
    /// Fixed layout, references located through the field mask.
    FixedSize = 0,
    /// Variable length, every payload word is a reference or null.
    Scanned = 1,
    /// Variable length, no references.
    Opaque = 2,
}

bitflags! {
    #[repr(transparent)]
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct HeaderFlags: u8 {
        const MARKED = 1 << 0;
    }
}

/// Bit `k` is set when payload word `k` holds an owning reference.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct FieldMask(u32);

impl FieldMask {
    pub const EMPTY: Self = Self(0);

    #[inline]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Mask with only `word` set, `None` when the word does not fit.
    #[inline]
    pub const fn for_word(word: usize) -> Option<Self> {
        if word < MAX_MASK_WORDS {
            Some(Self(1 << word))
        } else {
            None
        }
    }

    /// Mask for a byte offset into the payload, `None` when misaligned or too far.
    #[inline]
    pub const fn for_offset(offset: usize) -> Option<Self> {
        if offset % WORD_SIZE != 0 {
            return None;
        }
        Self::for_word(offset / WORD_SIZE)
    }

    #[inline]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[inline]
    pub const fn contains(self, word: usize) -> bool {
        word < MAX_MASK_WORDS && self.0 & (1 << word) != 0
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// Highest set word index.
    #[inline]
    pub const fn highest_word(self) -> Option<usize> {
        if self.0 == 0 {
            None
        } else {
            Some((u32::BITS - 1 - self.0.leading_zeros()) as usize)
        }
    }

    /// Payload words holding references, lowest first.
    pub fn words(self) -> impl Iterator<Item = usize> {
        let mut bits = self.0;
        std::iter::from_fn(move || {
            if bits == 0 {
                return None;
            }
            let word = bits.trailing_zeros() as usize;
            bits &= bits - 1;
            Some(word)
        })
    }
}

impl BitOr for FieldMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl fmt::Debug for FieldMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FieldMask({:#034b})", self.0)
    }
}

/// Precedes every payload in the heap.
#[repr(C, align(8))]
pub struct Header {
    tag: HeapTag,
    flags: Cell<HeaderFlags>,
    shape: ShapeId,
    field_mask: FieldMask,
    len: Cell<u32>,
    capacity: u32,
}

impl Header {
    pub(crate) fn new(
        tag: HeapTag,
        shape: ShapeId,
        field_mask: FieldMask,
        len: u32,
        capacity: u32,
    ) -> Self {
        Self {
            tag,
            flags: Cell::new(HeaderFlags::empty()),
            shape,
            field_mask,
            len: Cell::new(len),
            capacity,
        }
    }

    #[inline]
    pub fn tag(&self) -> HeapTag {
        self.tag
    }

    #[inline]
    pub fn shape(&self) -> ShapeId {
        self.shape
    }

    #[inline]
    pub fn field_mask(&self) -> FieldMask {
        self.field_mask
    }

    /// Payload bytes for `FixedSize` and `Opaque`, word count for `Scanned`.
    #[inline]
    pub fn len(&self) -> usize {
        self.len.get() as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len.get() == 0
    }

    /// Payload bytes actually allocated.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// Only shrinks or grows `len` within the allocated payload.
    #[inline]
    pub(crate) fn set_len(&self, len: usize) {
        debug_assert!(
            match self.tag {
                HeapTag::Scanned => len * WORD_SIZE <= self.capacity(),
                _ => len <= self.capacity(),
            },
            "header len {len} exceeds capacity {}",
            self.capacity
        );
        self.len.set(len as u32);
    }

    #[inline]
    pub fn flags(&self) -> HeaderFlags {
        self.flags.get()
    }

    #[inline]
    pub fn is_marked(&self) -> bool {
        self.flags.get().contains(HeaderFlags::MARKED)
    }

    /// Sets the mark bit, returning `true` if it was previously clear.
    #[inline]
    pub(crate) fn mark(&self) -> bool {
        let flags = self.flags.get();
        if flags.contains(HeaderFlags::MARKED) {
            return false;
        }
        self.flags.set(flags | HeaderFlags::MARKED);
        true
    }

    /// Clears the mark bit, returning whether it was set.
    #[inline]
    pub(crate) fn unmark(&self) -> bool {
        let flags = self.flags.get();
        self.flags.set(flags - HeaderFlags::MARKED);
        flags.contains(HeaderFlags::MARKED)
    }
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Header")
            .field("tag", &self.tag)
            .field("flags", &self.flags.get())
            .field("shape", &self.shape)
            .field("field_mask", &self.field_mask)
            .field("len", &self.len.get())
            .field("capacity", &self.capacity)
            .finish()
    }
}
