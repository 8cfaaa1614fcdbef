//! Precise, non-moving mark-sweep heap.
//!
//! Each thread owns at most one heap, set up with [`init`] and torn down with
//! [`shutdown`]. Every allocation may run a collection first; anything not
//! reachable from an open [`RootFrame`](crate::RootFrame) or a global root
//! at that point is reclaimed.

use std::{
    alloc::{self, Layout},
    cell::RefCell,
    ptr::NonNull,
};

use crate::{
    FieldMask, Gc, HEADER_SIZE, Header, HeapTag, Managed, ObjPtr, Shape, ShapeId, ShapeTable,
    Slab, Violation, WORD_SIZE, Word, error::Fatal, fatal, roots,
};

thread_local! {
    static HEAP: RefCell<Option<Heap>> = const { RefCell::new(None) };
}

const MIN_THRESHOLD: usize = 4 * 1024;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeapSettings {
    /// Bytes allocated between collections while the heap is small.
    pub initial_threshold: usize,
    /// Next threshold as a multiple of the bytes that survived a collection.
    pub growth_factor: f64,
    /// Hard cap on bytes held by the heap.
    pub max_bytes: Option<usize>,
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            initial_threshold: 1 << 20,
            growth_factor: 2.0,
            max_bytes: None,
        }
    }
}

impl HeapSettings {
    /// Settings tuned for a program expected to keep about `bytes` live.
    pub fn with_size_hint(bytes: usize) -> Self {
        Self {
            initial_threshold: bytes.max(MIN_THRESHOLD),
            ..Self::default()
        }
    }

    pub fn with_growth_factor(mut self, growth_factor: f64) -> Self {
        self.growth_factor = growth_factor;
        self
    }

    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = Some(max_bytes);
        self
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.initial_threshold == 0 {
            return Err("initial threshold must be non-zero");
        }
        if !self.growth_factor.is_finite() || self.growth_factor < 1.0 {
            return Err("growth factor must be a finite value of at least 1.0");
        }
        if self.max_bytes == Some(0) {
            return Err("max bytes must be non-zero");
        }
        Ok(())
    }
}

/// Instrumented counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    pub objects_allocated: usize,
    pub bytes_allocated: usize,
    pub objects_live: usize,
    pub bytes_live: usize,
    pub objects_freed: usize,
    pub bytes_freed: usize,
    pub collections: usize,
}

/// Source of references the collector must treat as live.
pub trait RootProvider {
    fn visit_roots(&self, visitor: &mut dyn FnMut(ObjPtr));
}

/// Pointer fields of a value that is about to move into a fresh object.
struct PendingFields {
    base: *const usize,
    mask: FieldMask,
}

struct WithPending<'a> {
    roots: &'a dyn RootProvider,
    pending: PendingFields,
}

impl RootProvider for WithPending<'_> {
    fn visit_roots(&self, visitor: &mut dyn FnMut(ObjPtr)) {
        self.roots.visit_roots(visitor);
        for word in self.pending.mask.words() {
            // SAFETY: masked words of the pending value are initialized references
            let value = unsafe { self.pending.base.add(word).read() };
            // SAFETY: reference words are payload addresses or null
            if let Some(ptr) = unsafe { ObjPtr::from_addr(value) } {
                visitor(ptr);
            }
        }
    }
}

struct Request {
    tag: HeapTag,
    shape: ShapeId,
    mask: FieldMask,
    len: usize,
    payload: usize,
}

fn layout_for(payload: usize) -> Option<Layout> {
    Layout::from_size_align(HEADER_SIZE.checked_add(payload)?, WORD_SIZE).ok()
}

fn round_to_words(bytes: usize) -> Option<usize> {
    Some(bytes.checked_add(WORD_SIZE - 1)? & !(WORD_SIZE - 1))
}

pub struct Heap {
    settings: HeapSettings,
    shapes: ShapeTable,
    objects: Vec<ObjPtr>,
    globals: Vec<ObjPtr>,
    threshold: usize,
    since_collection: usize,
    stats: HeapStats,
}

impl Heap {
    pub fn new(settings: HeapSettings) -> Self {
        if let Err(reason) = settings.validate() {
            fatal(Violation::InvalidSettings(reason));
        }
        Self {
            settings,
            shapes: ShapeTable::new(),
            objects: Vec::new(),
            globals: Vec::new(),
            threshold: settings.initial_threshold,
            since_collection: 0,
            stats: HeapStats::default(),
        }
    }

    #[inline]
    pub fn settings(&self) -> &HeapSettings {
        &self.settings
    }

    #[inline]
    pub fn stats(&self) -> HeapStats {
        self.stats
    }

    #[inline]
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    #[inline]
    pub fn shapes(&self) -> &ShapeTable {
        &self.shapes
    }

    /// Whether `ptr` is the payload of an object this heap still holds.
    pub fn is_live(&self, ptr: ObjPtr) -> bool {
        self.objects.contains(&ptr)
    }

    /// Descriptor of the object at `ptr`.
    pub fn shape_of(&self, ptr: ObjPtr) -> Option<&Shape> {
        self.shapes.get(ptr.header().shape())
    }

    pub fn describe<T: Managed>(&mut self) -> Result<Shape, Violation> {
        let id = self.shapes.register::<T>()?;
        self.shapes.get(id).cloned().ok_or(Violation::TooManyShapes)
    }

    pub fn add_global_root(&mut self, ptr: ObjPtr) {
        self.globals.push(ptr);
    }

    /// Zeroed object of `size` payload bytes.
    pub fn allocate(
        &mut self,
        tag: HeapTag,
        mask: FieldMask,
        size: usize,
        roots: &dyn RootProvider,
    ) -> ObjPtr {
        let fits = match tag {
            HeapTag::FixedSize => mask
                .highest_word()
                .is_none_or(|word| (word + 1) * WORD_SIZE <= size),
            HeapTag::Scanned | HeapTag::Opaque => mask.is_empty(),
        };
        if !fits {
            fatal(Violation::MaskBeyondPayload {
                tag,
                mask: mask.bits(),
                size,
            });
        }
        let len = match tag {
            HeapTag::Scanned if size % WORD_SIZE != 0 => {
                fatal(Violation::UnalignedScannedSize { size })
            }
            HeapTag::Scanned => size / WORD_SIZE,
            HeapTag::FixedSize | HeapTag::Opaque => size,
        };
        self.allocate_request(
            Request {
                tag,
                shape: ShapeId::RAW,
                mask,
                len,
                payload: size,
            },
            roots,
        )
    }

    /// Moves `value` into a fresh object traced through its registered shape.
    pub fn alloc<T: Managed>(&mut self, value: T, roots: &dyn RootProvider) -> Gc<T> {
        let id = self.shapes.register::<T>().unwrap_or_else(|v| fatal(v));
        let Some(shape) = self.shapes.get(id) else {
            fatal(Violation::TooManyShapes)
        };
        let (mask, size) = (shape.field_mask(), shape.size());

        let roots = WithPending {
            roots,
            pending: PendingFields {
                base: (&raw const value).cast::<usize>(),
                mask,
            },
        };
        let obj = self.allocate_request(
            Request {
                tag: HeapTag::FixedSize,
                shape: id,
                mask,
                len: size,
                payload: size,
            },
            &roots,
        );
        // SAFETY: the payload is `size_of::<T>()` bytes, word aligned
        unsafe {
            obj.as_ptr().cast::<T>().write(value);
            Gc::from_raw(obj)
        }
    }

    /// Backing array of `capacity` words, every one zero.
    pub fn alloc_slab<T: Word>(&mut self, capacity: usize, roots: &dyn RootProvider) -> Gc<Slab<T>> {
        let Some(payload) = capacity.checked_mul(WORD_SIZE) else {
            fatal(Fatal::OutOfMemory {
                requested: usize::MAX,
                live: self.stats.bytes_live,
            })
        };
        let tag = Slab::<T>::tag();
        let len = match tag {
            HeapTag::Scanned => capacity,
            _ => payload,
        };
        let obj = self.allocate_request(
            Request {
                tag,
                shape: ShapeId::RAW,
                mask: FieldMask::EMPTY,
                len,
                payload,
            },
            roots,
        );
        // SAFETY: freshly allocated slab payload
        unsafe { Gc::from_raw(obj) }
    }

    /// Opaque object with room for `capacity` bytes, of which `len` are in use.
    pub(crate) fn alloc_bytes(
        &mut self,
        len: usize,
        capacity: usize,
        roots: &dyn RootProvider,
    ) -> ObjPtr {
        debug_assert!(len <= capacity);
        self.allocate_request(
            Request {
                tag: HeapTag::Opaque,
                shape: ShapeId::RAW,
                mask: FieldMask::EMPTY,
                len,
                payload: capacity,
            },
            roots,
        )
    }

    fn out_of_memory(&self, requested: usize) -> ! {
        fatal(Fatal::OutOfMemory {
            requested,
            live: self.stats.bytes_live,
        })
    }

    fn allocate_request(&mut self, request: Request, roots: &dyn RootProvider) -> ObjPtr {
        let Some(payload) = round_to_words(request.payload) else {
            self.out_of_memory(request.payload)
        };
        let (Ok(len), Ok(capacity)) = (u32::try_from(request.len), u32::try_from(payload)) else {
            self.out_of_memory(payload)
        };
        let Some(layout) = layout_for(payload) else {
            self.out_of_memory(payload)
        };
        let bytes = layout.size();

        let mut collected = false;
        if self.since_collection + bytes > self.threshold {
            self.collect(roots);
            collected = true;
        }
        if let Some(limit) = self.settings.max_bytes {
            if self.stats.bytes_live + bytes > limit {
                if !collected {
                    self.collect(roots);
                }
                if self.stats.bytes_live + bytes > limit {
                    self.out_of_memory(bytes);
                }
            }
        }

        // SAFETY: layout has a non-zero size, it always includes the header
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let Some(raw) = NonNull::new(raw) else {
            self.out_of_memory(bytes)
        };
        let header = raw.cast::<Header>();
        // SAFETY: fresh allocation, aligned for Header
        let obj = unsafe {
            header.write(Header::new(
                request.tag,
                request.shape,
                request.mask,
                len,
                capacity,
            ));
            ObjPtr::from_header(header)
        };

        self.objects.push(obj);
        self.since_collection += bytes;
        self.stats.objects_allocated += 1;
        self.stats.bytes_allocated += bytes;
        self.stats.objects_live += 1;
        self.stats.bytes_live += bytes;
        log::trace!(
            "allocated {:?} {:?} with {} payload bytes",
            request.tag,
            obj,
            payload
        );
        obj
    }

    /// Full mark-sweep pass.
    pub fn collect(&mut self, roots: &dyn RootProvider) {
        let before = self.stats;
        let marked = self.mark(roots);
        self.sweep();

        self.stats.collections += 1;
        self.since_collection = 0;
        self.threshold = self
            .settings
            .initial_threshold
            .max((self.stats.bytes_live as f64 * self.settings.growth_factor) as usize);

        log::debug!(
            "collection #{}: marked {}, freed {} objects ({} bytes), {} bytes live, next threshold {}",
            self.stats.collections,
            marked,
            self.stats.objects_freed - before.objects_freed,
            self.stats.bytes_freed - before.bytes_freed,
            self.stats.bytes_live,
            self.threshold
        );
    }

    fn mark(&mut self, roots: &dyn RootProvider) -> usize {
        fn push_unmarked(worklist: &mut Vec<ObjPtr>, ptr: ObjPtr) {
            if ptr.header().mark() {
                worklist.push(ptr);
            }
        }

        let mut marked = 0;
        let mut worklist = Vec::new();
        roots.visit_roots(&mut |ptr| push_unmarked(&mut worklist, ptr));
        for &ptr in &self.globals {
            push_unmarked(&mut worklist, ptr);
        }

        while let Some(obj) = worklist.pop() {
            marked += 1;
            // SAFETY: obj came from a root or a traced edge, so it is live
            unsafe { visit_edges(obj, &mut |child| push_unmarked(&mut worklist, child)) };
        }
        marked
    }

    fn sweep(&mut self) {
        let stats = &mut self.stats;
        self.objects.retain(|&obj| {
            if obj.header().unmark() {
                return true;
            }
            let capacity = obj.header().capacity();
            // layout_for succeeded when the object was allocated
            if let Some(layout) = layout_for(capacity) {
                stats.objects_live -= 1;
                stats.bytes_live -= layout.size();
                stats.objects_freed += 1;
                stats.bytes_freed += layout.size();
                // SAFETY: allocated in allocate_request with this layout
                unsafe { alloc::dealloc(obj.header_ptr().as_ptr().cast(), layout) };
            }
            false
        });
    }
}

/// Calls `visitor` for every non-null reference held by `obj`.
///
/// # Safety
/// `obj` must be a live object of this heap.
pub unsafe fn visit_edges(obj: ObjPtr, visitor: &mut dyn FnMut(ObjPtr)) {
    let header = obj.header();
    let mut visit_word = |index: usize| {
        // SAFETY: index lies within the payload
        let word = unsafe { obj.word_ptr(index).read() };
        // SAFETY: reference words are payload addresses or null
        if let Some(child) = unsafe { ObjPtr::from_addr(word) } {
            visitor(child);
        }
    };
    match header.tag() {
        HeapTag::FixedSize => header.field_mask().words().for_each(&mut visit_word),
        HeapTag::Scanned => (0..header.len()).for_each(&mut visit_word),
        HeapTag::Opaque => {}
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        for obj in self.objects.drain(..) {
            if let Some(layout) = layout_for(obj.header().capacity()) {
                // SAFETY: allocated in allocate_request with this layout
                unsafe { alloc::dealloc(obj.header_ptr().as_ptr().cast(), layout) };
            }
        }
    }
}

/// Runs `f` with this thread's heap and root stack.
fn with_heap<R>(f: impl FnOnce(&mut Heap, &dyn RootProvider) -> R) -> R {
    HEAP.with_borrow_mut(|slot| {
        let Some(heap) = slot.as_mut() else {
            fatal(Violation::NotInitialized)
        };
        roots::with_stack(|stack| f(heap, stack))
    })
}

/// Sets up this thread's heap.
pub fn init(settings: HeapSettings) {
    HEAP.with_borrow_mut(|slot| {
        if slot.is_some() {
            fatal(Violation::AlreadyInitialized);
        }
        *slot = Some(Heap::new(settings));
    });
    log::info!("heap initialized with {settings:?}");
}

pub fn init_default() {
    init(HeapSettings::default())
}

pub fn is_initialized() -> bool {
    HEAP.with_borrow(Option::is_some)
}

/// Releases every object. All root frames must be closed.
pub fn shutdown() {
    let open = roots::depth();
    if open > 0 {
        fatal(Violation::FramesOpenAtShutdown { open });
    }
    let Some(heap) = HEAP.with_borrow_mut(Option::take) else {
        fatal(Violation::NotInitialized)
    };
    let stats = heap.stats();
    drop(heap);
    log::info!(
        "heap shut down after {} collections, released {} objects ({} bytes)",
        stats.collections,
        stats.objects_live,
        stats.bytes_live
    );
}

/// Process-exit hook, see [`shutdown`].
pub fn clean_exit() {
    shutdown()
}

pub fn allocate(tag: HeapTag, mask: FieldMask, size: usize) -> ObjPtr {
    with_heap(|heap, roots| heap.allocate(tag, mask, size, roots))
}

pub fn alloc<T: Managed>(value: T) -> Gc<T> {
    with_heap(|heap, roots| heap.alloc(value, roots))
}

pub fn alloc_slab<T: Word>(capacity: usize) -> Gc<Slab<T>> {
    with_heap(|heap, roots| heap.alloc_slab(capacity, roots))
}

pub(crate) fn alloc_bytes(len: usize, capacity: usize) -> ObjPtr {
    with_heap(|heap, roots| heap.alloc_bytes(len, capacity, roots))
}

pub fn collect() {
    with_heap(|heap, roots| heap.collect(roots))
}

pub fn stats() -> HeapStats {
    with_heap(|heap, _| heap.stats())
}

pub fn describe<T: Managed>() -> Result<Shape, Violation> {
    with_heap(|heap, _| heap.describe::<T>())
}

pub fn add_global_root(ptr: ObjPtr) {
    with_heap(|heap, _| heap.add_global_root(ptr))
}

pub fn is_live(ptr: ObjPtr) -> bool {
    with_heap(|heap, _| heap.is_live(ptr))
}
