use std::{cell::Cell, mem::offset_of, ptr};

use crate::{
    Error, Gc, Managed, Result, RootFrame, Shape, Str, Violation, heap, str::alloc_storage,
};

const MIN_CAPACITY: usize = 8;

/// Growable byte buffer that can be frozen into a [`Str`] in place.
///
/// The backing storage is a `Str` whose header length tracks the bytes
/// written so far. Freezing hands that storage out as the result and
/// leaves the buffer unusable.
#[repr(C)]
pub struct Buf {
    storage: Cell<Option<Gc<Str>>>,
    frozen: Cell<bool>,
}

impl Managed for Buf {
    fn shape() -> Result<Shape, Violation> {
        Shape::fixed::<Self>("Buf")
            .pointer(offset_of!(Self, storage))
            .build()
    }
}

pub fn new_buf(initial_capacity: usize) -> Gc<Buf> {
    let storage = alloc_storage(0, initial_capacity);
    heap::alloc(Buf {
        storage: Cell::new(Some(storage)),
        frozen: Cell::new(false),
    })
}

impl Gc<Buf> {
    #[inline]
    pub fn is_frozen(self) -> bool {
        self.frozen.get()
    }

    /// Bytes written so far. Zero once frozen.
    pub fn len(self) -> usize {
        self.storage.get().map_or(0, |s| s.len())
    }

    pub fn is_empty(self) -> bool {
        self.len() == 0
    }

    /// Bytes the storage can hold before growing. Zero once frozen.
    pub fn capacity(self) -> usize {
        self.storage.get().map_or(0, |s| s.header().capacity())
    }

    /// Contents written so far.
    pub fn as_bytes(&self) -> &[u8] {
        match self.storage.get() {
            Some(storage) => {
                let bytes = storage.as_bytes();
                // SAFETY: storage is owned by this buffer and outlives the borrow
                unsafe { std::slice::from_raw_parts(bytes.as_ptr(), bytes.len()) }
            }
            None => &[],
        }
    }

    /// Appends `bytes`, which may live in another rooted heap object.
    pub fn extend(self, bytes: &[u8]) -> Result<()> {
        if self.is_frozen() {
            return Err(Error::UseAfterFreeze);
        }
        if bytes.is_empty() {
            return Ok(());
        }
        let len = self.len();
        let needed = len + bytes.len();
        if needed > self.capacity() {
            let frame = RootFrame::new();
            frame.keep(self);
            let grown = alloc_storage(len, needed.max(self.capacity() * 2).max(MIN_CAPACITY));
            if let Some(old) = self.storage.get() {
                // SAFETY: distinct objects, the new one holds at least `len` bytes
                unsafe { ptr::copy_nonoverlapping(old.raw().as_ptr(), grown.raw().as_ptr(), len) };
            }
            self.storage.set(Some(grown));
        }

        let Some(storage) = self.storage.get() else {
            return Err(Error::UseAfterFreeze);
        };
        // SAFETY: capacity was checked above, source and target never overlap
        // because the storage is never handed out before freezing
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), storage.raw().as_ptr().add(len), bytes.len())
        };
        storage.header().set_len(needed);
        Ok(())
    }

    /// Turns the buffer into a string without copying.
    pub fn freeze(self) -> Result<Gc<Str>> {
        if self.is_frozen() {
            return Err(Error::UseAfterFreeze);
        }
        self.frozen.set(true);
        let frozen = match self.storage.take() {
            Some(storage) => storage,
            None => alloc_storage(0, 0),
        };
        log::trace!("froze buffer into {:?} ({} bytes)", frozen.raw(), frozen.len());
        Ok(frozen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{HeapSettings, collect, init, is_live, shutdown, stats};

    #[test]
    fn freeze_is_zero_copy() {
        init(HeapSettings::default());
        let buf = new_buf(8);
        assert_eq!(buf.capacity(), 8);
        buf.extend(b"AB").unwrap();
        buf.extend(b"CD").unwrap();
        assert_eq!(buf.len(), 4);
        assert_eq!(buf.as_bytes(), b"ABCD");

        let storage = buf.storage.get().unwrap();
        let s = buf.freeze().unwrap();
        assert!(Gc::ptr_eq(s, storage), "frozen string reuses the buffer storage");
        assert_eq!(s.as_bytes(), b"ABCD");
        assert_eq!(s.len(), 4);
        assert!(buf.is_frozen());

        assert!(matches!(buf.extend(b"E"), Err(Error::UseAfterFreeze)));
        assert!(matches!(buf.freeze(), Err(Error::UseAfterFreeze)));
        assert_eq!(s.as_bytes(), b"ABCD", "frozen value is unchanged");
        shutdown();
    }

    #[test]
    fn empty_extend_is_a_no_op() {
        init(HeapSettings::default());
        let buf = new_buf(0);
        let before = stats().objects_allocated;
        buf.extend(b"").unwrap();
        assert_eq!((buf.len(), buf.capacity()), (0, 0));
        assert_eq!(stats().objects_allocated, before, "no storage was allocated");
        buf.freeze().unwrap();
        assert!(matches!(buf.extend(b""), Err(Error::UseAfterFreeze)));
        shutdown();
    }

    #[test]
    fn growth_doubles_and_keeps_contents() {
        init(HeapSettings::default());
        let buf = new_buf(4);
        buf.extend(b"abc").unwrap();
        buf.extend(b"defgh").unwrap();
        assert_eq!(buf.capacity(), 8);
        buf.extend(b"i").unwrap();
        assert_eq!(buf.capacity(), 16);
        assert_eq!(buf.as_bytes(), b"abcdefghi");
        shutdown();
    }

    #[test]
    fn freezing_an_empty_buffer() {
        init(HeapSettings::default());
        let s = new_buf(0).freeze().unwrap();
        assert!(s.is_empty());
        shutdown();
    }

    #[test]
    fn buffer_storage_survives_collection() {
        init(HeapSettings {
            initial_threshold: 128,
            growth_factor: 1.0,
            max_bytes: None,
        });
        let frame = RootFrame::new();
        let buf = frame.root(new_buf(1));
        for _ in 0..100 {
            buf.get().extend(b"xyz").unwrap();
        }
        assert!(stats().collections > 0);
        let s = buf.get().freeze().unwrap();
        assert_eq!(s.len(), 300);
        assert!(s.as_bytes().chunks(3).all(|c| c == b"xyz"));
        let root = frame.root(s);
        collect();
        assert!(is_live(root.get().raw()));
        drop(frame);
        shutdown();
    }
}
