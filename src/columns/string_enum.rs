//! Dictionary-compressed string column: a sorted leaf of distinct keys plus
//! an int array mapping each row to its key. Produced by the enumeration
//! pass; reads and writes are transparent to callers, which keep seeing a
//! string column.
//!
//! Invariant: every stored key index addresses a live dictionary entry.
//! Inserting a new key into the sorted dictionary therefore rewrites every
//! stored index at or past the insertion point.

use eyre::{ensure, Result};

use crate::arena::{Alloc, Ref};

#[derive(Debug)]
pub struct StringEnumColumn {
    alloc: Alloc,
    keys: Ref,
    values: Ref,
}

impl StringEnumColumn {
    pub fn attach(alloc: &Alloc, keys: Ref, values: Ref) -> Self {
        StringEnumColumn {
            alloc: alloc.clone(),
            keys,
            values,
        }
    }

    pub fn keys_root(&self) -> Ref {
        self.keys
    }

    pub fn values_root(&self) -> Ref {
        self.values
    }

    pub fn size(&self) -> usize {
        self.alloc.borrow().ints_len(self.values)
    }

    pub fn dictionary_size(&self) -> usize {
        self.alloc.borrow().strings_len(self.keys)
    }

    pub fn get(&self, ndx: usize) -> Result<String> {
        ensure!(ndx < self.size(), "row index {ndx} out of bounds");
        let arena = self.alloc.borrow();
        let key = arena.get_int(self.values, ndx) as usize;
        Ok(arena.get_str(self.keys, key).to_owned())
    }

    /// Key id for `value`, or None when it is not in the dictionary.
    fn key_of(&self, value: &str) -> Option<usize> {
        let arena = self.alloc.borrow();
        let pos = arena.lower_bound_str(self.keys, value);
        (pos < arena.strings_len(self.keys) && arena.get_str(self.keys, pos) == value)
            .then_some(pos)
    }

    /// Key id for `value`, inserting it into the sorted dictionary (and
    /// renumbering stored indexes) when absent.
    fn intern(&mut self, value: &str) -> Result<usize> {
        ensure!(
            !value.bytes().any(|b| b == 0),
            "strings must not contain NUL"
        );
        if let Some(key) = self.key_of(value) {
            return Ok(key);
        }
        let mut arena = self.alloc.borrow_mut();
        let pos = arena.lower_bound_str(self.keys, value);
        arena.insert_str(self.keys, pos, value);
        for i in 0..arena.ints_len(self.values) {
            let key = arena.get_int(self.values, i);
            if key >= pos as i64 {
                arena.set_int(self.values, i, key + 1);
            }
        }
        Ok(pos)
    }

    pub fn set(&mut self, ndx: usize, value: &str) -> Result<()> {
        ensure!(ndx < self.size(), "row index {ndx} out of bounds");
        let key = self.intern(value)?;
        self.alloc.borrow_mut().set_int(self.values, ndx, key as i64);
        Ok(())
    }

    pub fn add(&mut self) -> Result<()> {
        let ndx = self.size();
        self.insert(ndx, "")
    }

    pub fn insert(&mut self, ndx: usize, value: &str) -> Result<()> {
        ensure!(ndx <= self.size(), "row index {ndx} out of bounds");
        let key = self.intern(value)?;
        self.alloc
            .borrow_mut()
            .insert_int(self.values, ndx, key as i64);
        Ok(())
    }

    pub fn delete(&mut self, ndx: usize) -> Result<()> {
        ensure!(ndx < self.size(), "row index {ndx} out of bounds");
        self.alloc.borrow_mut().remove_int(self.values, ndx);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.alloc.borrow_mut().clear_ints(self.values);
    }

    /// Resolves `value` in the dictionary, then searches the key ids. A
    /// value missing from the dictionary is simply absent; no value-array
    /// probe happens.
    pub fn find(&self, value: &str, start: usize, end: usize) -> Option<usize> {
        let key = self.key_of(value)?;
        let arena = self.alloc.borrow();
        let end = end.min(arena.ints_len(self.values));
        arena.find_int(self.values, key as i64, start, end)
    }

    pub fn find_all(&self, sink: &mut Vec<usize>, value: &str) {
        let Some(key) = self.key_of(value) else {
            return;
        };
        let arena = self.alloc.borrow();
        for i in 0..arena.ints_len(self.values) {
            if arena.get_int(self.values, i) == key as i64 {
                sink.push(i);
            }
        }
    }

    /// Consistency walk: every key id must address a dictionary entry and
    /// the dictionary must be sorted.
    pub fn verify(&self) -> Result<()> {
        let arena = self.alloc.borrow();
        let dict = arena.strings_len(self.keys);
        for i in 1..dict {
            ensure!(
                arena.get_str(self.keys, i - 1) < arena.get_str(self.keys, i),
                "dictionary not sorted at {i}"
            );
        }
        for i in 0..arena.ints_len(self.values) {
            let key = arena.get_int(self.values, i);
            ensure!(
                (key as usize) < dict,
                "row {i} references key {key} beyond dictionary size {dict}"
            );
        }
        Ok(())
    }
}
