//! Insertion-ordered hash map.
//!
//! Entries live in three parallel slabs (`keys`, `values`, `states`) in the
//! order they were inserted. A separate power-of-two `index` slab maps probe
//! positions to entry positions plus one, zero meaning an empty cell.
//! Erasing an entry leaves a tombstone: its key and value words are zeroed
//! but its index cell keeps pointing at it so later probes walk past it.

use std::{cell::Cell, mem::offset_of};

use ahash::RandomState;

use crate::{Gc, Managed, RootFrame, Shape, Slab, Str, Violation, Word, heap};

const MIN_CAPACITY: usize = 8;

const STR_SEEDS: [u64; 4] = [
    0x243f_6a88_85a3_08d3,
    0x1319_8a2e_0370_7344,
    0xa409_3822_299f_31d0,
    0x082e_fa98_ec4e_6c89,
];

/// Hashing and equality for dictionary keys.
pub trait DictKey: Word {
    fn hash_key(self) -> u64;
    fn key_eq(self, other: Self) -> bool;
}

impl DictKey for i64 {
    fn hash_key(self) -> u64 {
        self as u64
    }

    fn key_eq(self, other: Self) -> bool {
        self == other
    }
}

impl DictKey for usize {
    fn hash_key(self) -> u64 {
        self as u64
    }

    fn key_eq(self, other: Self) -> bool {
        self == other
    }
}

impl DictKey for Gc<Str> {
    fn hash_key(self) -> u64 {
        let [k0, k1, k2, k3] = STR_SEEDS;
        RandomState::with_seeds(k0, k1, k2, k3).hash_one(self.as_bytes())
    }

    fn key_eq(self, other: Self) -> bool {
        Gc::ptr_eq(self, other) || self.as_bytes() == other.as_bytes()
    }
}

#[repr(usize)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum EntryState {
    Empty = 0,
    Occupied = 1,
    Tombstone = 2,
}

impl EntryState {
    fn from_word(word: usize) -> Self {
        match word {
            1 => Self::Occupied,
            2 => Self::Tombstone,
            _ => Self::Empty,
        }
    }
}

#[repr(C)]
pub struct Dict<K: DictKey, V: Word> {
    len: Cell<usize>,
    used: Cell<usize>,
    index: Cell<Option<Gc<Slab<usize>>>>,
    states: Cell<Option<Gc<Slab<usize>>>>,
    keys: Cell<Option<Gc<Slab<K>>>>,
    values: Cell<Option<Gc<Slab<V>>>>,
}

impl<K: DictKey, V: Word> Managed for Dict<K, V> {
    fn shape() -> Result<Shape, Violation> {
        Shape::fixed::<Self>("Dict")
            .pointer(offset_of!(Self, index))
            .pointer(offset_of!(Self, states))
            .pointer(offset_of!(Self, keys))
            .pointer(offset_of!(Self, values))
            .build()
    }
}

pub fn new_dict<K: DictKey, V: Word>() -> Gc<Dict<K, V>> {
    heap::alloc(Dict {
        len: Cell::new(0),
        used: Cell::new(0),
        index: Cell::new(None),
        states: Cell::new(None),
        keys: Cell::new(None),
        values: Cell::new(None),
    })
}

/// The four slabs of a dictionary that has storage.
#[derive(Copy, Clone)]
struct Table<K: DictKey, V: Word> {
    index: Gc<Slab<usize>>,
    states: Gc<Slab<usize>>,
    keys: Gc<Slab<K>>,
    values: Gc<Slab<V>>,
}

impl<K: DictKey, V: Word> Table<K, V> {
    fn state(self, entry: usize) -> EntryState {
        EntryState::from_word(self.states.get(entry).unwrap_or(0))
    }

    /// Index cell holding `key`'s entry, or the empty cell ending its probe.
    fn probe(self, key: K) -> (usize, Option<usize>) {
        let mask = self.index.capacity() - 1;
        let mut cell = key.hash_key() as usize & mask;
        loop {
            match self.index.get(cell) {
                Some(0) | None => return (cell, None),
                Some(slot) => {
                    let entry = slot - 1;
                    if self.state(entry) == EntryState::Occupied
                        && self.keys.get(entry).is_some_and(|k| k.key_eq(key))
                    {
                        return (cell, Some(entry));
                    }
                }
            }
            cell = (cell + 1) & mask;
        }
    }

    fn push(self, entry: usize, key: K, value: V) {
        let (cell, found) = self.probe(key);
        debug_assert!(found.is_none());
        self.index.set(cell, entry + 1);
        self.keys.set(entry, key);
        self.values.set(entry, value);
        self.states.set(entry, EntryState::Occupied as usize);
    }
}

impl<K: DictKey, V: Word> Gc<Dict<K, V>> {
    fn table(self) -> Option<Table<K, V>> {
        Some(Table {
            index: self.index.get()?,
            states: self.states.get()?,
            keys: self.keys.get()?,
            values: self.values.get()?,
        })
    }

    /// Live entries.
    #[inline]
    pub fn len(self) -> usize {
        self.len.get()
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.len() == 0
    }

    /// Size of the probe index.
    pub fn capacity(self) -> usize {
        self.index.get().map_or(0, |index| index.capacity())
    }

    /// Erased entries still occupying probe cells.
    pub fn tombstones(self) -> usize {
        self.used.get() - self.len()
    }

    fn find(self, key: K) -> Option<(Table<K, V>, usize)> {
        let table = self.table()?;
        let (_, entry) = table.probe(key);
        Some((table, entry?))
    }

    pub fn get(self, key: K) -> Option<V> {
        let (table, entry) = self.find(key)?;
        table.values.get(entry)
    }

    pub fn contains_key(self, key: K) -> bool {
        self.find(key).is_some()
    }

    pub fn insert(self, key: K, value: V) {
        if let Some((table, entry)) = self.find(key) {
            table.values.set(entry, value);
            return;
        }
        let used = self.used.get();
        if (used + 1) * 4 > self.capacity() * 3 {
            let frame = RootFrame::new();
            frame.keep(self);
            frame.keep(key);
            frame.keep(value);
            self.rehash();
        }
        let Some(table) = self.table() else {
            unreachable!("rehash always installs a table");
        };
        let entry = self.used.get();
        table.push(entry, key, value);
        self.used.set(entry + 1);
        self.len.set(self.len() + 1);
    }

    /// Removes `key` if present.
    pub fn erase(self, key: K) {
        let Some((table, entry)) = self.find(key) else {
            return;
        };
        table.states.set(entry, EntryState::Tombstone as usize);
        table.keys.clear(entry);
        table.values.clear(entry);
        self.len.set(self.len() - 1);
    }

    /// Rebuilds storage with room for one more entry, dropping tombstones.
    /// `self` must be rooted.
    fn rehash(self) {
        let len = self.len();
        let mut capacity = self.capacity().max(MIN_CAPACITY);
        while (len + 1) * 4 > capacity * 3 {
            capacity *= 2;
        }

        let frame = RootFrame::new();
        let index = heap::alloc_slab::<usize>(capacity);
        frame.keep(index);
        let states = heap::alloc_slab::<usize>(capacity);
        frame.keep(states);
        let keys = heap::alloc_slab::<K>(capacity);
        frame.keep(keys);
        let values = heap::alloc_slab::<V>(capacity);
        let fresh = Table {
            index,
            states,
            keys,
            values,
        };

        let mut moved = 0;
        if let Some(old) = self.table() {
            for entry in 0..self.used.get() {
                if old.state(entry) != EntryState::Occupied {
                    continue;
                }
                if let (Some(key), Some(value)) = (old.keys.get(entry), old.values.get(entry)) {
                    fresh.push(moved, key, value);
                    moved += 1;
                }
            }
        }
        log::trace!(
            "dict rehash: {} -> {} cells, dropped {} tombstones",
            self.capacity(),
            capacity,
            self.tombstones()
        );

        self.index.set(Some(index));
        self.states.set(Some(states));
        self.keys.set(Some(keys));
        self.values.set(Some(values));
        self.used.set(moved);
        self.len.set(moved);
    }

    /// Live entries in insertion order.
    pub fn iter(self) -> Iter<K, V> {
        Iter {
            dict: self,
            entry: 0,
        }
    }

    pub fn keys(self) -> impl Iterator<Item = K> {
        self.iter().map(|(key, _)| key)
    }

    pub fn values(self) -> impl Iterator<Item = V> {
        self.iter().map(|(_, value)| value)
    }
}

pub struct Iter<K: DictKey, V: Word> {
    dict: Gc<Dict<K, V>>,
    entry: usize,
}

impl<K: DictKey, V: Word> Iterator for Iter<K, V> {
    type Item = (K, V);

    fn next(&mut self) -> Option<(K, V)> {
        let table = self.dict.table()?;
        while self.entry < self.dict.used.get() {
            let entry = self.entry;
            self.entry += 1;
            if table.state(entry) == EntryState::Occupied {
                return Some((table.keys.get(entry)?, table.values.get(entry)?));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        alloc_str,
        heap::{HeapSettings, collect, init, is_live, shutdown, stats},
    };

    #[test]
    fn insert_get_overwrite() {
        init(HeapSettings::default());
        let dict = new_dict::<i64, i64>();
        assert_eq!(dict.get(1), None);
        dict.insert(1, 10);
        dict.insert(2, 20);
        dict.insert(1, 11);
        assert_eq!(dict.len(), 2);
        assert_eq!(dict.get(1), Some(11));
        assert!(dict.contains_key(2));
        assert!(!dict.contains_key(3));
        assert_eq!(dict.keys().collect::<Vec<_>>(), vec![1, 2], "overwrite keeps position");
        shutdown();
    }

    #[test]
    fn tombstones_keep_probe_chains_intact() {
        init(HeapSettings::default());
        let dict = new_dict::<i64, i64>();
        // all three land in cell 1 of an eight cell index
        let (a, b, c) = (1, 9, 17);
        dict.insert(a, 100);
        dict.insert(b, 200);
        dict.insert(c, 300);
        assert_eq!(dict.capacity(), 8);

        dict.erase(b);
        assert_eq!(dict.len(), 2);
        assert_eq!(dict.tombstones(), 1);
        assert_eq!(dict.get(b), None);
        assert_eq!(dict.get(c), Some(300), "probe walks past the tombstone");

        dict.insert(b, 201);
        assert_eq!(dict.keys().collect::<Vec<_>>(), vec![a, c, b]);
        assert_eq!(dict.values().collect::<Vec<_>>(), vec![100, 300, 201]);
        assert_eq!(dict.len(), 3);
        shutdown();
    }

    #[test]
    fn erased_words_are_zeroed() {
        init(HeapSettings::default());
        let dict = new_dict::<i64, i64>();
        dict.insert(5, 50);
        dict.erase(5);
        dict.erase(5);
        dict.erase(42);
        let table = dict.table().unwrap();
        assert_eq!(table.keys.get(0), Some(0));
        assert_eq!(table.values.get(0), Some(0));
        assert_eq!(table.state(0), EntryState::Tombstone);
        assert_eq!(dict.len(), 0);
        assert_eq!(dict.iter().count(), 0);
        shutdown();
    }

    #[test]
    fn resize_drops_tombstones_and_keeps_order() {
        init(HeapSettings::default());
        let dict = new_dict::<i64, i64>();
        for k in 0..6 {
            dict.insert(k, k * k);
        }
        dict.erase(0);
        dict.erase(3);
        assert_eq!(dict.tombstones(), 2);
        // used is 6 of 8 cells, so the next insert rehashes
        dict.insert(100, 1);
        assert_eq!(dict.tombstones(), 0);
        assert_eq!(dict.capacity(), 8);
        assert_eq!(dict.keys().collect::<Vec<_>>(), vec![1, 2, 4, 5, 100]);

        for k in 200..300 {
            dict.insert(k, k);
        }
        assert_eq!(dict.len(), 105);
        assert!(dict.len() * 4 <= dict.capacity() * 3);
        assert_eq!(dict.get(250), Some(250));
        assert_eq!(dict.keys().take(3).collect::<Vec<_>>(), vec![1, 2, 4]);
        shutdown();
    }

    #[test]
    fn string_keys_compare_by_content() {
        init(HeapSettings::default());
        let frame = RootFrame::new();
        let dict = frame.root(new_dict::<Gc<Str>, i64>());
        let key = alloc_str(b"apple");
        dict.get().insert(key, 1);
        let same = alloc_str(b"apple");
        assert_eq!(dict.get().get(same), Some(1));
        assert_eq!(same.hash_key(), key.hash_key());
        dict.get().insert(same, 2);
        assert_eq!(dict.get().len(), 1);
        assert_eq!(dict.get().get(key), Some(2));
        drop(frame);
        shutdown();
    }

    #[test]
    fn references_survive_collection() {
        init(HeapSettings {
            initial_threshold: 512,
            growth_factor: 1.5,
            max_bytes: None,
        });
        let frame = RootFrame::new();
        let dict = frame.root(new_dict::<Gc<Str>, Gc<Str>>());
        for i in 0..50 {
            let key = alloc_str(format!("k{i}").as_bytes());
            let inner = RootFrame::new();
            inner.keep(key);
            let value = alloc_str(format!("v{i}").as_bytes());
            dict.get().insert(key, value);
        }
        assert!(stats().collections > 0);
        let probe = alloc_str(b"k42");
        let value = dict.get().get(probe).map(|v| v.as_bytes().to_vec());
        assert_eq!(value.as_deref(), Some(&b"v42"[..]));

        let erased = dict.get().get(alloc_str(b"k7")).unwrap();
        dict.get().erase(alloc_str(b"k7"));
        collect();
        assert!(!is_live(erased.raw()), "tombstoned value is no longer reachable");
        drop(frame);
        shutdown();
    }
}
