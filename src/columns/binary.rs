//! Binary blob column: `[offsets, data]` under one root, where `offsets[i]`
//! is the end position of element `i` in the data leaf.

use eyre::{ensure, Result};

use crate::arena::{Alloc, Ref};

#[derive(Debug)]
pub struct BinaryColumn {
    alloc: Alloc,
    root: Ref,
    offsets: Ref,
    data: Ref,
}

impl BinaryColumn {
    pub fn new(alloc: &Alloc) -> Self {
        let mut arena = alloc.borrow_mut();
        let offsets = arena.new_ints();
        let data = arena.new_blob();
        let root = arena.new_refs();
        arena.push_ref(root, offsets);
        arena.push_ref(root, data);
        drop(arena);
        BinaryColumn {
            alloc: alloc.clone(),
            root,
            offsets,
            data,
        }
    }

    pub fn attach(alloc: &Alloc, root: Ref) -> Result<Self> {
        let (offsets, data) = {
            let arena = alloc.borrow();
            ensure!(
                arena.is_live(root) && arena.refs_len(root) == 2,
                "binary column ref does not address an [offsets, data] pair"
            );
            (arena.get_ref(root, 0), arena.get_ref(root, 1))
        };
        Ok(BinaryColumn {
            alloc: alloc.clone(),
            root,
            offsets,
            data,
        })
    }

    pub fn root(&self) -> Ref {
        self.root
    }

    pub fn size(&self) -> usize {
        self.alloc.borrow().ints_len(self.offsets)
    }

    fn bounds(&self, ndx: usize) -> (usize, usize) {
        let arena = self.alloc.borrow();
        let start = if ndx == 0 {
            0
        } else {
            arena.get_int(self.offsets, ndx - 1) as usize
        };
        let end = arena.get_int(self.offsets, ndx) as usize;
        (start, end)
    }

    pub fn get(&self, ndx: usize) -> Result<Vec<u8>> {
        ensure!(ndx < self.size(), "row index {ndx} out of bounds");
        let (start, end) = self.bounds(ndx);
        Ok(self.alloc.borrow().blob_slice(self.data, start, end).to_vec())
    }

    pub fn len_of(&self, ndx: usize) -> Result<usize> {
        ensure!(ndx < self.size(), "row index {ndx} out of bounds");
        let (start, end) = self.bounds(ndx);
        Ok(end - start)
    }

    pub fn set(&mut self, ndx: usize, value: &[u8]) -> Result<()> {
        ensure!(ndx < self.size(), "row index {ndx} out of bounds");
        let (start, end) = self.bounds(ndx);
        let diff = value.len() as i64 - (end - start) as i64;
        let mut arena = self.alloc.borrow_mut();
        arena.blob_splice(self.data, start, end, value);
        for i in ndx..arena.ints_len(self.offsets) {
            let off = arena.get_int(self.offsets, i);
            arena.set_int(self.offsets, i, off + diff);
        }
        Ok(())
    }

    pub fn add(&mut self) {
        let ndx = self.size();
        self.insert(ndx, b"").expect("append is always in bounds");
    }

    pub fn insert(&mut self, ndx: usize, value: &[u8]) -> Result<()> {
        ensure!(ndx <= self.size(), "row index {ndx} out of bounds");
        let start = if ndx == 0 {
            0
        } else {
            self.alloc.borrow().get_int(self.offsets, ndx - 1) as usize
        };
        let mut arena = self.alloc.borrow_mut();
        arena.blob_splice(self.data, start, start, value);
        arena.insert_int(self.offsets, ndx, (start + value.len()) as i64);
        for i in ndx + 1..arena.ints_len(self.offsets) {
            let off = arena.get_int(self.offsets, i);
            arena.set_int(self.offsets, i, off + value.len() as i64);
        }
        Ok(())
    }

    pub fn delete(&mut self, ndx: usize) -> Result<()> {
        ensure!(ndx < self.size(), "row index {ndx} out of bounds");
        let (start, end) = self.bounds(ndx);
        let removed = (end - start) as i64;
        let mut arena = self.alloc.borrow_mut();
        arena.blob_splice(self.data, start, end, b"");
        arena.remove_int(self.offsets, ndx);
        for i in ndx..arena.ints_len(self.offsets) {
            let off = arena.get_int(self.offsets, i);
            arena.set_int(self.offsets, i, off - removed);
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        let mut arena = self.alloc.borrow_mut();
        arena.clear_ints(self.offsets);
        arena.clear_blob(self.data);
    }

    pub fn find(&self, value: &[u8], start: usize, end: usize) -> Option<usize> {
        let end = end.min(self.size());
        for i in start..end {
            let (s, e) = self.bounds(i);
            if self.alloc.borrow().blob_slice(self.data, s, e) == value {
                return Some(i);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column_with(values: &[&[u8]]) -> (Alloc, BinaryColumn) {
        let alloc = Alloc::new();
        let mut col = BinaryColumn::new(&alloc);
        for v in values {
            col.insert(col.size(), v).unwrap();
        }
        (alloc, col)
    }

    #[test]
    fn basic_ops() {
        let (_alloc, mut col) = column_with(&[b"abc", b"", b"xy"]);
        assert_eq!(col.size(), 3);
        assert_eq!(col.get(0).unwrap(), b"abc");
        assert_eq!(col.get(1).unwrap(), b"");
        assert_eq!(col.get(2).unwrap(), b"xy");
        assert_eq!(col.len_of(2).unwrap(), 2);

        col.set(0, b"longer payload").unwrap();
        assert_eq!(col.get(0).unwrap(), b"longer payload");
        assert_eq!(col.get(2).unwrap(), b"xy", "later offsets track the edit");

        col.delete(0).unwrap();
        assert_eq!(col.size(), 2);
        assert_eq!(col.get(1).unwrap(), b"xy");
        assert!(col.get(2).is_err());
    }

    #[test]
    fn insert_mid_column() {
        let (_alloc, mut col) = column_with(&[b"aa", b"cc"]);
        col.insert(1, b"bb").unwrap();
        assert_eq!(col.get(0).unwrap(), b"aa");
        assert_eq!(col.get(1).unwrap(), b"bb");
        assert_eq!(col.get(2).unwrap(), b"cc");
        assert_eq!(col.find(b"cc", 0, 3), Some(2));
        assert_eq!(col.find(b"dd", 0, 3), None);
    }

    #[test]
    fn attach_round_trip() {
        let (alloc, col) = column_with(&[b"one", b"two"]);
        let again = BinaryColumn::attach(&alloc, col.root()).unwrap();
        assert_eq!(again.get(1).unwrap(), b"two");
    }
}
