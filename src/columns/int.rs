//! Integer column: one int array, shared by the int, bool and date column
//! types (bool as 0/1, date as epoch seconds). Optionally carries a
//! secondary [`IntIndex`], in which case every mutation keeps the index in
//! step and `find` takes the sorted fast path.

use eyre::{ensure, Result};

use super::IntIndex;
use crate::arena::{Alloc, Ref};

#[derive(Debug)]
pub struct IntColumn {
    alloc: Alloc,
    root: Ref,
    index: Option<IntIndex>,
}

impl IntColumn {
    pub fn new(alloc: &Alloc) -> Self {
        let root = alloc.borrow_mut().new_ints();
        IntColumn {
            alloc: alloc.clone(),
            root,
            index: None,
        }
    }

    pub fn attach(alloc: &Alloc, root: Ref) -> Self {
        IntColumn {
            alloc: alloc.clone(),
            root,
            index: None,
        }
    }

    pub fn root(&self) -> Ref {
        self.root
    }

    pub fn size(&self) -> usize {
        self.alloc.borrow().ints_len(self.root)
    }

    pub fn get(&self, ndx: usize) -> Result<i64> {
        ensure!(ndx < self.size(), "row index {ndx} out of bounds");
        Ok(self.alloc.borrow().get_int(self.root, ndx))
    }

    pub fn set(&mut self, ndx: usize, value: i64) -> Result<()> {
        ensure!(ndx < self.size(), "row index {ndx} out of bounds");
        let old = self.alloc.borrow().get_int(self.root, ndx);
        self.alloc.borrow_mut().set_int(self.root, ndx, value);
        if let Some(index) = &mut self.index {
            index.remove(old, ndx);
            index.add(value, ndx);
        }
        Ok(())
    }

    pub fn add(&mut self) {
        let ndx = self.size();
        self.alloc.borrow_mut().push_int(self.root, 0);
        if let Some(index) = &mut self.index {
            index.add(0, ndx);
        }
    }

    pub fn insert(&mut self, ndx: usize, value: i64) -> Result<()> {
        ensure!(ndx <= self.size(), "row index {ndx} out of bounds");
        self.alloc.borrow_mut().insert_int(self.root, ndx, value);
        if let Some(index) = &mut self.index {
            index.shift_rows(ndx, 1);
            index.add(value, ndx);
        }
        Ok(())
    }

    pub fn delete(&mut self, ndx: usize) -> Result<()> {
        ensure!(ndx < self.size(), "row index {ndx} out of bounds");
        let old = self.alloc.borrow_mut().remove_int(self.root, ndx);
        if let Some(index) = &mut self.index {
            index.remove(old, ndx);
            index.shift_rows(ndx + 1, -1);
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        self.alloc.borrow_mut().clear_ints(self.root);
        if let Some(index) = &mut self.index {
            index.clear();
        }
    }

    /// Smallest row in `[start, end)` holding `value`; O(log n) when
    /// indexed, linear scan otherwise.
    pub fn find(&self, value: i64, start: usize, end: usize) -> Option<usize> {
        let end = end.min(self.size());
        if let Some(index) = &self.index {
            return index.find_first(value, start, end);
        }
        self.alloc.borrow().find_int(self.root, value, start, end)
    }

    pub fn find_all(&self, sink: &mut Vec<usize>, value: i64) {
        if let Some(index) = &self.index {
            index.find_all(sink, value);
            return;
        }
        let arena = self.alloc.borrow();
        for i in 0..arena.ints_len(self.root) {
            if arena.get_int(self.root, i) == value {
                sink.push(i);
            }
        }
    }

    /// Rows whose value is within `max_dist` bits of `value`.
    pub fn find_all_hamming(&self, sink: &mut Vec<usize>, value: u64, max_dist: u32) {
        let arena = self.alloc.borrow();
        for i in 0..arena.ints_len(self.root) {
            let v = arena.get_int(self.root, i) as u64;
            if (v ^ value).count_ones() <= max_dist {
                sink.push(i);
            }
        }
    }

    pub fn has_index(&self) -> bool {
        self.index.is_some()
    }

    pub fn index_root(&self) -> Option<Ref> {
        self.index.as_ref().map(|i| i.root())
    }

    /// Builds a fresh index over the current contents and returns its root
    /// for the caller to store.
    pub fn build_index(&mut self) -> Ref {
        let arena = self.alloc.borrow();
        let data: Vec<i64> = (0..arena.ints_len(self.root))
            .map(|i| arena.get_int(self.root, i))
            .collect();
        drop(arena);
        let index = IntIndex::build(&self.alloc, data.into_iter());
        let root = index.root();
        self.index = Some(index);
        root
    }

    /// Re-attaches a persisted index (the attach-from-ref path).
    pub fn set_index_ref(&mut self, root: Ref) -> Result<()> {
        self.index = Some(IntIndex::attach(&self.alloc, root)?);
        Ok(())
    }
}
