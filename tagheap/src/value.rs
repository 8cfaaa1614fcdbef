use std::{fmt, hash, marker::PhantomData, ops::Deref, ptr::NonNull};

use crate::{HEADER_SIZE, Header};

/// Untyped pointer to the payload of a heap object.
///
/// The header sits immediately before the payload. An `ObjPtr` stays valid
/// for as long as the object is reachable from a root.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjPtr(NonNull<u8>);

impl ObjPtr {
    /// # Safety
    /// `header` must point at a header written by the heap.
    #[inline]
    pub(crate) unsafe fn from_header(header: NonNull<Header>) -> Self {
        // SAFETY: the payload follows the header inside the same allocation
        Self(unsafe { header.cast::<u8>().add(HEADER_SIZE) })
    }

    /// # Safety
    /// A nonzero `addr` must be the payload address of a live object.
    #[inline]
    pub(crate) unsafe fn from_addr(addr: usize) -> Option<Self> {
        NonNull::new(addr as *mut u8).map(Self)
    }

    #[inline]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    #[inline]
    pub fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    #[inline]
    pub(crate) fn header_ptr(self) -> NonNull<Header> {
        // SAFETY: every ObjPtr is produced by `from_header`
        unsafe { self.0.sub(HEADER_SIZE).cast() }
    }

    #[inline]
    pub fn header(&self) -> &Header {
        // SAFETY: the header lives as long as the object it describes
        unsafe { self.header_ptr().as_ref() }
    }

    /// Address of payload word `index`.
    #[inline]
    pub(crate) fn word_ptr(self, index: usize) -> *mut usize {
        // SAFETY: callers stay within the payload described by the header
        unsafe { self.0.cast::<usize>().as_ptr().add(index) }
    }
}

impl fmt::Debug for ObjPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjPtr({:p})", self.0)
    }
}

/// Typed reference to a heap object.
///
/// `Gc` is a plain pointer: copying it does not keep the object alive.
/// Anything that must survive an allocation has to be reachable from a
/// [`RootFrame`](crate::RootFrame) or another reachable object.
#[repr(transparent)]
pub struct Gc<T> {
    ptr: NonNull<T>,
    _marker: PhantomData<*const T>,
}

impl<T> Gc<T> {
    /// # Safety
    /// `ptr` must be the payload of a live object whose layout is `T`.
    #[inline]
    pub unsafe fn from_raw(ptr: ObjPtr) -> Self {
        Self {
            ptr: ptr.0.cast(),
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn raw(self) -> ObjPtr {
        ObjPtr(self.ptr.cast())
    }

    #[inline]
    pub fn header(&self) -> &Header {
        // SAFETY: the header lives as long as the object it describes
        unsafe { self.raw().header_ptr().as_ref() }
    }

    #[inline]
    pub fn ptr_eq(a: Self, b: Self) -> bool {
        a.ptr == b.ptr
    }
}

impl<T> Clone for Gc<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Gc<T> {}

impl<T> PartialEq for Gc<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl<T> Eq for Gc<T> {}

impl<T> hash::Hash for Gc<T> {
    fn hash<H: hash::Hasher>(&self, state: &mut H) {
        self.ptr.hash(state)
    }
}

impl<T> Deref for Gc<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // SAFETY: a Gc is only constructed over a payload of type T
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> fmt::Debug for Gc<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Gc({:p})", self.ptr)
    }
}

/// A value that fits in one heap word.
///
/// Containers and root slots store their elements as raw words;
/// `IS_REF` tells the collector whether those words are references.
pub trait Word: Copy + 'static {
    const IS_REF: bool;

    fn to_word(self) -> usize;

    /// # Safety
    /// `word` must come from `to_word` on the same type, or be zero for
    /// types that admit null.
    unsafe fn from_word(word: usize) -> Self;

    /// Like `from_word`, but a zero word yields `None` for types without
    /// a null value.
    ///
    /// # Safety
    /// A nonzero `word` must come from `to_word` on the same type.
    #[inline]
    unsafe fn decode(word: usize) -> Option<Self> {
        // SAFETY: forwarded to the caller
        Some(unsafe { Self::from_word(word) })
    }
}

/// The object `value` refers to, if it is a non-null reference.
#[inline]
pub(crate) fn word_ref<W: Word>(value: W) -> Option<ObjPtr> {
    if W::IS_REF {
        // SAFETY: reference words are payload addresses or null
        unsafe { ObjPtr::from_addr(value.to_word()) }
    } else {
        None
    }
}

impl Word for i64 {
    const IS_REF: bool = false;

    fn to_word(self) -> usize {
        self as usize
    }

    unsafe fn from_word(word: usize) -> Self {
        word as i64
    }
}

impl Word for usize {
    const IS_REF: bool = false;

    fn to_word(self) -> usize {
        self
    }

    unsafe fn from_word(word: usize) -> Self {
        word
    }
}

impl Word for bool {
    const IS_REF: bool = false;

    fn to_word(self) -> usize {
        self as usize
    }

    unsafe fn from_word(word: usize) -> Self {
        word != 0
    }
}

impl Word for ObjPtr {
    const IS_REF: bool = true;

    fn to_word(self) -> usize {
        self.addr()
    }

    unsafe fn from_word(word: usize) -> Self {
        // SAFETY: non-null by contract
        Self(unsafe { NonNull::new_unchecked(word as *mut u8) })
    }

    unsafe fn decode(word: usize) -> Option<Self> {
        NonNull::new(word as *mut u8).map(Self)
    }
}

impl Word for Option<ObjPtr> {
    const IS_REF: bool = true;

    fn to_word(self) -> usize {
        self.map_or(0, ObjPtr::addr)
    }

    unsafe fn from_word(word: usize) -> Self {
        NonNull::new(word as *mut u8).map(ObjPtr)
    }
}

impl<T: 'static> Word for Gc<T> {
    const IS_REF: bool = true;

    fn to_word(self) -> usize {
        self.ptr.as_ptr() as usize
    }

    unsafe fn from_word(word: usize) -> Self {
        Self {
            // SAFETY: non-null by contract
            ptr: unsafe { NonNull::new_unchecked(word as *mut T) },
            _marker: PhantomData,
        }
    }

    unsafe fn decode(word: usize) -> Option<Self> {
        NonNull::new(word as *mut T).map(|ptr| Self {
            ptr,
            _marker: PhantomData,
        })
    }
}

impl<T: 'static> Word for Option<Gc<T>> {
    const IS_REF: bool = true;

    fn to_word(self) -> usize {
        self.map_or(0, Word::to_word)
    }

    unsafe fn from_word(word: usize) -> Self {
        NonNull::new(word as *mut T).map(|ptr| Gc {
            ptr,
            _marker: PhantomData,
        })
    }
}
