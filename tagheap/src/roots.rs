//! Scope-bound root frames.
//!
//! Every thread owns a LIFO stack of frames. A [`RootFrame`] guard pushes a
//! frame on creation and pops it when dropped, so frames close on every exit
//! path: normal return, `?` propagation and unwinding. The collector treats
//! every reference stored in an open frame as live.

use std::{cell::RefCell, fmt, marker::PhantomData, thread};

use crate::{Gc, ObjPtr, RootProvider, Violation, Word, fatal, value::word_ref};

thread_local! {
    static ROOTS: RefCell<RootStack> = RefCell::new(RootStack::new());
}

/// Identifies one pushed frame for the lifetime of the thread.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId(u64);

impl FrameId {
    #[inline]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame#{}", self.0)
    }
}

#[derive(Debug, Copy, Clone)]
struct Slot {
    word: usize,
    traced: bool,
}

#[derive(Debug)]
struct Frame {
    id: FrameId,
    slots: Vec<Slot>,
}

/// The per-thread stack of root frames.
#[derive(Debug, Default)]
pub struct RootStack {
    frames: Vec<Frame>,
    next_id: u64,
}

impl RootStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_frame(&mut self) -> FrameId {
        self.next_id += 1;
        let id = FrameId(self.next_id);
        self.frames.push(Frame {
            id,
            slots: Vec::new(),
        });
        log::trace!("push {id:?} at depth {}", self.frames.len());
        id
    }

    /// Pops `id`, which must be the innermost open frame.
    pub fn pop_frame(&mut self, id: FrameId) -> Result<(), Violation> {
        match self.frames.last() {
            Some(top) if top.id == id => {
                self.frames.pop();
                log::trace!("pop {id:?}");
                Ok(())
            }
            Some(top) => Err(Violation::FrameOutOfOrder {
                expected: top.id.0,
                found: id.0,
            }),
            None => Err(Violation::FrameNotOpen(id.0)),
        }
    }

    /// Drops `id` wherever it sits in the stack.
    fn remove_frame(&mut self, id: FrameId) {
        self.frames.retain(|frame| frame.id != id);
    }

    fn frame_mut(&mut self, id: FrameId) -> Result<&mut Frame, Violation> {
        self.frames
            .iter_mut()
            .rev()
            .find(|frame| frame.id == id)
            .ok_or(Violation::FrameNotOpen(id.0))
    }

    fn frame(&self, id: FrameId) -> Result<&Frame, Violation> {
        self.frames
            .iter()
            .rev()
            .find(|frame| frame.id == id)
            .ok_or(Violation::FrameNotOpen(id.0))
    }

    /// Stores `value` in a fresh slot of frame `id` and returns the slot index.
    pub fn register<W: Word>(&mut self, id: FrameId, value: W) -> Result<usize, Violation> {
        let frame = self.frame_mut(id)?;
        frame.slots.push(Slot {
            word: value.to_word(),
            traced: W::IS_REF,
        });
        Ok(frame.slots.len() - 1)
    }

    /// Registers into the innermost open frame.
    pub fn register_top<W: Word>(&mut self, value: W) -> Result<(), Violation> {
        let frame = self.frames.last_mut().ok_or(Violation::NoOpenFrame)?;
        frame.slots.push(Slot {
            word: value.to_word(),
            traced: W::IS_REF,
        });
        Ok(())
    }

    fn read(&self, id: FrameId, slot: usize) -> Result<usize, Violation> {
        let frame = self.frame(id)?;
        Ok(frame.slots[slot].word)
    }

    fn write(&mut self, id: FrameId, slot: usize, word: usize) -> Result<(), Violation> {
        let frame = self.frame_mut(id)?;
        frame.slots[slot].word = word;
        Ok(())
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Registered slots across all open frames, null ones included.
    pub fn root_count(&self) -> usize {
        self.frames.iter().map(|frame| frame.slots.len()).sum()
    }
}

impl RootProvider for RootStack {
    fn visit_roots(&self, visitor: &mut dyn FnMut(ObjPtr)) {
        for frame in &self.frames {
            for slot in frame.slots.iter().filter(|slot| slot.traced) {
                // SAFETY: traced slots hold payload addresses or null
                if let Some(ptr) = unsafe { ObjPtr::from_addr(slot.word) } {
                    visitor(ptr);
                }
            }
        }
    }
}

/// Runs `f` against this thread's root stack.
pub(crate) fn with_stack<R>(f: impl FnOnce(&RootStack) -> R) -> R {
    ROOTS.with_borrow(f)
}

fn with_stack_mut<R>(f: impl FnOnce(&mut RootStack) -> R) -> R {
    ROOTS.with_borrow_mut(f)
}

/// Number of open frames on this thread.
pub fn depth() -> usize {
    with_stack(RootStack::depth)
}

/// Number of registered root slots on this thread.
pub fn root_count() -> usize {
    with_stack(RootStack::root_count)
}

/// Roots `value` in the innermost open frame.
///
/// Meant for values that are created and handed back through an error path
/// before any named local could hold them.
pub fn root_in_current_frame<W: Word>(value: W) {
    if let Err(violation) = with_stack_mut(|stack| stack.register_top(value)) {
        fatal(violation);
    }
}

/// RAII guard for one frame of the root stack.
#[must_use = "dropping a root frame immediately unregisters its roots"]
pub struct RootFrame {
    id: FrameId,
    _not_send: PhantomData<*const ()>,
}

impl RootFrame {
    pub fn new() -> Self {
        Self {
            id: with_stack_mut(RootStack::push_frame),
            _not_send: PhantomData,
        }
    }

    #[inline]
    pub fn id(&self) -> FrameId {
        self.id
    }

    /// Registers `value` in a fresh slot of this frame.
    pub fn root<W: Word>(&self, value: W) -> Root<'_, W> {
        match with_stack_mut(|stack| stack.register(self.id, value)) {
            Ok(slot) => Root {
                frame: self,
                slot,
                _type: PhantomData,
            },
            Err(violation) => fatal(violation),
        }
    }

    /// Registers an empty reference slot.
    pub fn root_null<T: 'static>(&self) -> Root<'_, Option<Gc<T>>> {
        self.root(None)
    }

    /// Registers an untyped object pointer.
    pub fn root_word(&self, ptr: Option<ObjPtr>) -> Root<'_, Option<ObjPtr>> {
        self.root(ptr)
    }

    /// Keeps `value` alive until the frame closes without handing out a slot.
    pub(crate) fn keep<W: Word>(&self, value: W) {
        if word_ref(value).is_none() {
            return;
        }
        if let Err(violation) = with_stack_mut(|stack| stack.register(self.id, value)) {
            fatal(violation);
        }
    }

    /// Slots registered in this frame.
    pub fn len(&self) -> usize {
        with_stack(|stack| stack.frame(self.id).map_or(0, |frame| frame.slots.len()))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes the frame. Same as dropping it.
    pub fn pop(self) {}
}

impl Default for RootFrame {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RootFrame {
    fn drop(&mut self) {
        let id = self.id;
        let popped = with_stack_mut(|stack| {
            stack.pop_frame(id).inspect_err(|_| stack.remove_frame(id))
        });
        if let Err(violation) = popped {
            if thread::panicking() {
                log::debug!("removed {id:?} out of order while unwinding");
            } else {
                fatal(violation);
            }
        }
    }
}

impl fmt::Debug for RootFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootFrame").field("id", &self.id).finish()
    }
}

/// A root slot owned by a frame.
pub struct Root<'frame, W: Word> {
    frame: &'frame RootFrame,
    slot: usize,
    _type: PhantomData<W>,
}

impl<W: Word> Root<'_, W> {
    pub fn get(&self) -> W {
        match with_stack(|stack| stack.read(self.frame.id, self.slot)) {
            // SAFETY: the slot only ever holds words written from a `W`
            Ok(word) => unsafe { W::from_word(word) },
            Err(violation) => fatal(violation),
        }
    }

    pub fn set(&self, value: W) {
        let id = self.frame.id;
        if let Err(violation) = with_stack_mut(|stack| stack.write(id, self.slot, value.to_word())) {
            fatal(violation);
        }
    }
}

impl<W: Word + fmt::Debug> fmt::Debug for Root<'_, W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Root")
            .field("frame", &self.frame.id)
            .field("slot", &self.slot)
            .field("value", &self.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect_roots(stack: &RootStack) -> Vec<usize> {
        let mut seen = Vec::new();
        stack.visit_roots(&mut |ptr| seen.push(ptr.addr()));
        seen
    }

    #[test]
    fn stack_pops_in_lifo_order() {
        let mut stack = RootStack::new();
        let outer = stack.push_frame();
        let inner = stack.push_frame();
        assert_eq!(
            stack.pop_frame(outer),
            Err(Violation::FrameOutOfOrder {
                expected: inner.get(),
                found: outer.get()
            })
        );
        assert_eq!(stack.pop_frame(inner), Ok(()));
        assert_eq!(stack.pop_frame(outer), Ok(()));
        assert_eq!(stack.pop_frame(outer), Err(Violation::FrameNotOpen(outer.get())));
    }

    #[test]
    fn only_reference_slots_are_visited() {
        let mut stack = RootStack::new();
        let id = stack.push_frame();
        stack.register(id, 0x1000usize).unwrap();
        stack.register(id, None::<ObjPtr>).unwrap();
        // SAFETY: the stack never dereferences what it visits
        let fake = unsafe { ObjPtr::from_addr(0x2000) };
        stack.register(id, fake).unwrap();
        assert_eq!(stack.root_count(), 3);
        assert_eq!(collect_roots(&stack), vec![0x2000]);
    }

    #[test]
    fn register_top_needs_a_frame() {
        let mut stack = RootStack::new();
        assert_eq!(stack.register_top(1i64), Err(Violation::NoOpenFrame));
        stack.push_frame();
        assert_eq!(stack.register_top(1i64), Ok(()));
    }

    #[test]
    fn frames_unregister_on_drop() {
        assert_eq!(depth(), 0);
        {
            let outer = RootFrame::new();
            let a = outer.root(7i64);
            {
                let inner = RootFrame::new();
                let _b = inner.root(8i64);
                let _c = inner.root_null::<u64>();
                assert_eq!(depth(), 2);
                assert_eq!(root_count(), 3);
                assert_eq!(inner.len(), 2);
            }
            assert_eq!(depth(), 1);
            assert_eq!(root_count(), 1);
            a.set(9);
            assert_eq!(a.get(), 9);
        }
        assert_eq!(depth(), 0);
        assert_eq!(root_count(), 0);
    }

    #[test]
    fn each_registration_gets_a_fresh_slot() {
        let frame = RootFrame::new();
        let a = frame.root(1i64);
        let b = frame.root(1i64);
        b.set(2);
        assert_eq!((a.get(), b.get()), (1, 2));
        assert_eq!(frame.len(), 2);
    }

    #[test]
    fn nested_frames_balance() {
        fn recurse(n: usize) -> usize {
            let frame = RootFrame::new();
            let _slot = frame.root(n as i64);
            if n == 0 { depth() } else { recurse(n - 1) }
        }
        assert_eq!(recurse(9), 10);
        assert_eq!(depth(), 0);
    }

    #[test]
    fn frames_close_on_early_return() {
        fn fallible(fail: bool) -> Result<(), &'static str> {
            let frame = RootFrame::new();
            let _slot = frame.root(1i64);
            if fail {
                return Err("bail");
            }
            Ok(())
        }
        assert!(fallible(true).is_err());
        assert!(fallible(false).is_ok());
        assert_eq!(depth(), 0);
    }

    #[test]
    fn root_in_current_frame_uses_innermost() {
        let outer = RootFrame::new();
        let inner = RootFrame::new();
        root_in_current_frame(3i64);
        assert_eq!((outer.len(), inner.len()), (0, 1));
    }

    #[test]
    #[should_panic(expected = "no root frame is open")]
    fn root_in_current_frame_without_frame() {
        root_in_current_frame(3i64);
    }

    #[test]
    #[should_panic(expected = "closed while")]
    fn out_of_order_pop_is_fatal() {
        let outer = RootFrame::new();
        let _inner = RootFrame::new();
        outer.pop();
    }

    #[test]
    fn out_of_order_drop_during_unwind_is_quiet() {
        let result = std::panic::catch_unwind(|| {
            let outer = RootFrame::new();
            let inner = RootFrame::new();
            let _guard = (outer, inner);
            panic!("boom");
        });
        assert!(result.is_err());
        assert_eq!(depth(), 0, "every frame was removed while unwinding");
    }
}
