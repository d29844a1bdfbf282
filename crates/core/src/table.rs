//! An open-addressed, linear-probing hash table keyed by interned strings
//! (§4.C). Used for globals, instance fields, class method tables, and (as a
//! set, with every value ignored) the string intern table itself.
//!
//! ```text
//! ┌─────────┬─────────┬─────────┬─────────┬─────────┐
//! │ entry 0 │ entry 1 │ entry 2 │   ...   │ entry N │   capacity N+1, power of two
//! └─────────┴─────────┴─────────┴─────────┴─────────┘
//! each entry: { key: Option<ObjRef>, value: Value }
//!   empty:     key = None,    value = nil
//!   tombstone: key = None,    value = bool(true)   (deleted, keeps probe chains intact)
//!   occupied:  key = Some(s), value = <whatever was stored>
//! ```

use crate::object::{Obj, ObjRef};
use crate::value::Value;

const MAX_LOAD_FACTOR: f64 = 0.75;
const MIN_CAPACITY: usize = 8;

#[derive(Clone, Copy)]
struct Entry {
    key: Option<ObjRef>,
    value: Value,
}

fn is_tombstone(entry: &Entry) -> bool {
    entry.key.is_none() && !entry.value.is_nil()
}

/// Open-addressed hash table from interned-string keys to `Value`s.
pub struct Table {
    entries: Vec<Entry>,
    /// Occupied slots plus tombstones (§4.C: "the count is incremented only
    /// when filling a previously empty... slot").
    count: usize,
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}

impl Table {
    pub fn new() -> Self {
        Table {
            entries: Vec::new(),
            count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.key.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Probe from `hash mod capacity`: return the first matching occupied
    /// slot, else the first tombstone seen, else the terminating empty slot.
    fn find_index(entries: &[Entry], capacity: usize, key: ObjRef) -> usize {
        let mut index = (key.as_string().expect("table keys are strings").hash() as usize)
            % capacity;
        let mut tombstone: Option<usize> = None;
        loop {
            let entry = &entries[index];
            match entry.key {
                Some(k) if k == key => return index,
                None if entry.value.is_nil() => {
                    // Truly empty: the search ends here, preferring an
                    // earlier tombstone if one was passed over.
                    return tombstone.unwrap_or(index);
                }
                None => {
                    if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
                Some(_) => {}
            }
            index = (index + 1) % capacity;
        }
    }

    fn grow(&mut self, new_capacity: usize) {
        let mut new_entries = vec![
            Entry {
                key: None,
                value: Value::nil(),
            };
            new_capacity
        ];
        let mut new_count = 0;
        for entry in self.entries.iter() {
            if let Some(key) = entry.key {
                let index = Table::find_index(&new_entries, new_capacity, key);
                new_entries[index] = *entry;
                new_count += 1;
            }
        }
        self.entries = new_entries;
        self.count = new_count;
    }

    fn ensure_capacity(&mut self) {
        if self.capacity() == 0 {
            self.grow(MIN_CAPACITY);
            return;
        }
        if (self.count + 1) as f64 > self.capacity() as f64 * MAX_LOAD_FACTOR {
            self.grow(self.capacity() * 2);
        }
    }

    /// Returns the value for `key`, or `None` on a miss.
    pub fn get(&self, key: ObjRef) -> Option<Value> {
        if self.entries.is_empty() {
            return None;
        }
        let index = Table::find_index(&self.entries, self.capacity(), key);
        self.entries[index].key.map(|_| self.entries[index].value)
    }

    pub fn contains_key(&self, key: ObjRef) -> bool {
        self.get(key).is_some()
    }

    /// Inserts or overwrites `key`. Returns `true` if `key` was not
    /// previously present.
    pub fn set(&mut self, key: ObjRef, value: Value) -> bool {
        self.ensure_capacity();
        let index = Table::find_index(&self.entries, self.capacity(), key);
        let is_new_key = self.entries[index].key.is_none();
        if is_new_key && !is_tombstone(&self.entries[index]) {
            self.count += 1;
        }
        self.entries[index] = Entry {
            key: Some(key),
            value,
        };
        is_new_key
    }

    /// Converts `key`'s entry to a tombstone. Does not decrement `count`
    /// (§4.C "delete") so later probes still skip over it correctly.
    pub fn delete(&mut self, key: ObjRef) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let index = Table::find_index(&self.entries, self.capacity(), key);
        if self.entries[index].key.is_none() {
            return false;
        }
        self.entries[index] = Entry {
            key: None,
            value: Value::bool(true),
        };
        true
    }

    /// Bulk-copies every entry from `src` into `self`.
    pub fn add_all(&mut self, src: &Table) {
        for entry in src.entries.iter() {
            if let Some(key) = entry.key {
                self.set(key, entry.value);
            }
        }
    }

    /// Lookup used only by the intern table: finds an already-interned
    /// string with the given bytes and hash without needing an `ObjRef` to
    /// probe with yet (§4.C "findString").
    pub fn find_string(&self, bytes: &[u8], hash: u32) -> Option<ObjRef> {
        if self.entries.is_empty() {
            return None;
        }
        let capacity = self.capacity();
        let mut index = (hash as usize) % capacity;
        loop {
            let entry = &self.entries[index];
            match entry.key {
                None if entry.value.is_nil() => return None,
                Some(key) => {
                    let s = key.as_string().expect("intern table keys are strings");
                    if s.hash() == hash && s.as_str().as_bytes() == bytes {
                        return Some(key);
                    }
                }
                None => {}
            }
            index = (index + 1) % capacity;
        }
    }

    /// During GC: erase every entry whose key object is unmarked (white),
    /// so a dead-but-still-interned string doesn't resurrect (§4.H step 3).
    pub fn remove_white(&mut self) {
        for i in 0..self.entries.len() {
            if let Some(key) = self.entries[i].key {
                if !key.is_marked() {
                    self.entries[i] = Entry {
                        key: None,
                        value: Value::bool(true),
                    };
                }
            }
        }
    }

    /// Marks every entry's key and value as a GC root.
    pub fn mark(&self, mark_value: &mut dyn FnMut(Value), mark_object: &mut dyn FnMut(ObjRef)) {
        for entry in self.entries.iter() {
            if let Some(key) = entry.key {
                mark_object(key);
                mark_value(entry.value);
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, Value)> + '_ {
        self.entries
            .iter()
            .filter_map(|e| e.key.map(|k| (k, e.value)))
    }
}

/// Marker used only to document that `Table` keys must be `Obj::String`;
/// kept here rather than enforced structurally since `ObjRef` is untyped.
#[allow(dead_code)]
fn assert_string_key(r: ObjRef) {
    debug_assert!(matches!(r.get(), Obj::String(_)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heap;

    #[test]
    fn set_get_delete_roundtrip() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        let key = heap.intern("answer");
        assert!(table.set(key, Value::number(42.0)));
        assert_eq!(table.get(key).unwrap().as_number(), 42.0);
        assert!(table.delete(key));
        assert!(table.get(key).is_none());
        // Re-inserting after delete must not double count.
        assert!(table.set(key, Value::number(7.0)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn set_returns_false_for_overwrite() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        let key = heap.intern("x");
        assert!(table.set(key, Value::number(1.0)));
        assert!(!table.set(key, Value::number(2.0)));
        assert_eq!(table.get(key).unwrap().as_number(), 2.0);
    }

    #[test]
    fn grows_past_load_factor() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        for i in 0..100 {
            let key = heap.intern(&format!("k{i}"));
            table.set(key, Value::number(i as f64));
        }
        for i in 0..100 {
            let key = heap.intern(&format!("k{i}"));
            assert_eq!(table.get(key).unwrap().as_number(), i as f64);
        }
    }

    #[test]
    fn find_string_dedupes_without_a_key() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        let key = heap.intern("hello");
        table.set(key, Value::nil());
        let hash = crate::object::fnv1a_hash(b"hello");
        assert_eq!(table.find_string(b"hello", hash), Some(key));
        assert_eq!(table.find_string(b"nope", crate::object::fnv1a_hash(b"nope")), None);
    }
}
