use std::{cell::Cell, mem::offset_of};

use crate::{Error, Gc, Managed, Result, RootFrame, Shape, Slab, Violation, Word, heap};

const MIN_CAPACITY: usize = 4;

/// Growable sequence of words.
#[repr(C)]
pub struct List<T: Word> {
    len: Cell<usize>,
    slab: Cell<Option<Gc<Slab<T>>>>,
}

impl<T: Word> Managed for List<T> {
    fn shape() -> Result<Shape, Violation> {
        Shape::fixed::<Self>("List")
            .pointer(offset_of!(Self, slab))
            .build()
    }
}

pub fn new_list<T: Word>() -> Gc<List<T>> {
    heap::alloc(List {
        len: Cell::new(0),
        slab: Cell::new(None),
    })
}

pub fn list_with_capacity<T: Word>(capacity: usize) -> Gc<List<T>> {
    let list = new_list();
    if capacity > 0 {
        let frame = RootFrame::new();
        frame.keep(list);
        list.reserve(capacity);
    }
    list
}

impl<T: Word> Gc<List<T>> {
    #[inline]
    pub fn len(self) -> usize {
        self.len.get()
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.len() == 0
    }

    pub fn capacity(self) -> usize {
        self.slab.get().map_or(0, |slab| slab.capacity())
    }

    /// Grows the slab to hold at least `needed` elements. `self` must be rooted.
    fn reserve(self, needed: usize) {
        let capacity = self.capacity();
        if needed <= capacity {
            return;
        }
        let new_capacity = needed.max(capacity * 2).max(MIN_CAPACITY);
        let grown = heap::alloc_slab::<T>(new_capacity);
        if let Some(old) = self.slab.get() {
            grown.copy_from(old, self.len());
        }
        self.slab.set(Some(grown));
    }

    pub fn append(self, value: T) {
        let len = self.len();
        if len == self.capacity() {
            let frame = RootFrame::new();
            frame.keep(self);
            frame.keep(value);
            self.reserve(len + 1);
        }
        if let Some(slab) = self.slab.get() {
            slab.set(len, value);
        }
        self.len.set(len + 1);
    }

    pub fn extend(self, values: impl IntoIterator<Item = T>) {
        let frame = RootFrame::new();
        frame.keep(self);
        let values = values.into_iter();
        let (lower, _) = values.size_hint();
        self.reserve(self.len() + lower);
        for value in values {
            self.append(value);
        }
    }

    pub fn get(self, index: usize) -> Result<T> {
        let len = self.len();
        if index >= len {
            return Err(Error::IndexOutOfRange { index, len });
        }
        self.slab
            .get()
            .and_then(|slab| slab.get(index))
            .ok_or(Error::IndexOutOfRange { index, len })
    }

    pub fn set(self, index: usize, value: T) -> Result<()> {
        let len = self.len();
        match self.slab.get() {
            Some(slab) if index < len => {
                slab.set(index, value);
                Ok(())
            }
            _ => Err(Error::IndexOutOfRange { index, len }),
        }
    }

    pub fn pop(self) -> Option<T> {
        let len = self.len().checked_sub(1)?;
        let slab = self.slab.get()?;
        let value = slab.get(len)?;
        slab.clear(len);
        self.len.set(len);
        Some(value)
    }

    pub fn iter(self) -> Iter<T> {
        Iter {
            list: self,
            index: 0,
        }
    }

    pub fn to_vec(self) -> Vec<T> {
        self.iter().collect()
    }
}

/// Reads elements by index, so it tolerates appends while iterating.
pub struct Iter<T: Word> {
    list: Gc<List<T>>,
    index: usize,
}

impl<T: Word> Iterator for Iter<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        let value = self.list.get(self.index).ok()?;
        self.index += 1;
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        Str, alloc_str,
        heap::{HeapSettings, collect, init, is_live, shutdown, stats},
    };

    fn small_heap() -> HeapSettings {
        HeapSettings {
            initial_threshold: 256,
            growth_factor: 1.5,
            max_bytes: None,
        }
    }

    #[test]
    fn append_get_set() {
        init(HeapSettings::default());
        let list = new_list::<i64>();
        assert!(list.is_empty());
        assert_eq!(list.capacity(), 0);
        for i in 0..10 {
            list.append(i * 10);
        }
        assert_eq!(list.len(), 10);
        assert!(list.capacity() >= 10);
        assert_eq!(list.get(9).unwrap(), 90);
        list.set(0, -1).unwrap();
        assert_eq!(list.get(0).unwrap(), -1);
        assert!(matches!(
            list.get(10),
            Err(Error::IndexOutOfRange { index: 10, len: 10 })
        ));
        assert!(matches!(
            list.set(11, 0),
            Err(Error::IndexOutOfRange { index: 11, len: 10 })
        ));
        shutdown();
    }

    #[test]
    fn capacity_doubles() {
        init(HeapSettings::default());
        let list = new_list::<i64>();
        let mut capacities = Vec::new();
        for i in 0..33 {
            list.append(i);
            if capacities.last() != Some(&list.capacity()) {
                capacities.push(list.capacity());
            }
        }
        assert_eq!(capacities, vec![4, 8, 16, 32, 64]);
        shutdown();
    }

    #[test]
    fn index_beyond_len_but_within_capacity_is_rejected() {
        init(HeapSettings::default());
        let list = list_with_capacity::<i64>(8);
        list.append(1);
        assert_eq!(list.capacity(), 8);
        assert!(list.get(3).is_err());
        shutdown();
    }

    #[test]
    fn reference_lists_stop_at_len() {
        init(HeapSettings::default());
        let frame = RootFrame::new();
        let list = frame.root(list_with_capacity::<Gc<Str>>(4)).get();
        list.append(alloc_str(b"a"));
        assert!(matches!(
            list.get(2),
            Err(Error::IndexOutOfRange { index: 2, len: 1 })
        ));
        assert!(list.get(1).is_err());
        assert_eq!(list.iter().count(), 1);
        assert_eq!(list.iter().last().map(|s| s.as_bytes().to_vec()), Some(b"a".to_vec()));
        list.pop();
        assert_eq!(list.iter().count(), 0);
        drop(frame);
        shutdown();
    }

    #[test]
    fn pop_extend_and_iter() {
        init(HeapSettings::default());
        let list = new_list::<i64>();
        list.extend([1, 2, 3, 4, 5]);
        assert_eq!(list.pop(), Some(5));
        assert_eq!(list.to_vec(), vec![1, 2, 3, 4]);
        assert_eq!(list.iter().sum::<i64>(), 10);
        while list.pop().is_some() {}
        assert!(list.is_empty());
        assert_eq!(list.pop(), None);
        shutdown();
    }

    #[test]
    fn elements_survive_growth_under_pressure() {
        init(small_heap());
        let frame = RootFrame::new();
        let list = frame.root(new_list::<Gc<Str>>());
        for i in 0..200 {
            let s = alloc_str(format!("item {i}").as_bytes());
            list.get().append(s);
        }
        assert!(stats().collections > 0);
        let list = list.get();
        assert_eq!(list.len(), 200);
        for (i, s) in list.iter().enumerate() {
            assert_eq!(s.as_bytes(), format!("item {i}").as_bytes());
        }
        drop(frame);
        shutdown();
    }

    #[test]
    fn popped_references_are_released() {
        init(HeapSettings::default());
        let frame = RootFrame::new();
        let list = frame.root(new_list::<Gc<Str>>());
        let s = alloc_str(b"x");
        list.get().append(s);
        collect();
        assert!(is_live(s.raw()));
        list.get().pop();
        collect();
        assert!(!is_live(s.raw()), "popped slot was cleared");
        drop(frame);
        shutdown();
    }

    #[test]
    fn unrooted_list_storage_is_collected() {
        init(HeapSettings::default());
        let list = new_list::<i64>();
        list.extend(0..100);
        collect();
        assert_eq!(stats().objects_live, 0);
        shutdown();
    }
}
