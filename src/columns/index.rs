//! Secondary index for integer columns: the pair arrays `[values, rows]`
//! kept sorted by `(value, row)`, giving `find` a binary-search fast path.
//!
//! Row ids stored here shift whenever the indexed column inserts or deletes
//! a row; the column is responsible for calling [`IntIndex::shift_rows`] in
//! the same mutation.

use eyre::Result;

use crate::arena::{Alloc, Ref};

#[derive(Debug)]
pub struct IntIndex {
    alloc: Alloc,
    root: Ref,
    values: Ref,
    rows: Ref,
}

impl IntIndex {
    /// Builds an index over `(value, row)` pairs in one pass.
    pub fn build(alloc: &Alloc, entries: impl Iterator<Item = i64>) -> Self {
        let mut pairs: Vec<(i64, i64)> = entries
            .enumerate()
            .map(|(row, v)| (v, row as i64))
            .collect();
        pairs.sort_unstable();

        let mut arena = alloc.borrow_mut();
        let values = arena.new_ints();
        let rows = arena.new_ints();
        for (v, row) in pairs {
            arena.push_int(values, v);
            arena.push_int(rows, row);
        }
        let root = arena.new_refs();
        arena.push_ref(root, values);
        arena.push_ref(root, rows);
        drop(arena);

        IntIndex {
            alloc: alloc.clone(),
            root,
            values,
            rows,
        }
    }

    /// Attaches to a persisted `[values, rows]` pair.
    pub fn attach(alloc: &Alloc, root: Ref) -> Result<Self> {
        let (values, rows) = {
            let arena = alloc.borrow();
            eyre::ensure!(
                arena.is_live(root) && arena.refs_len(root) == 2,
                "index ref does not address a [values, rows] pair"
            );
            (arena.get_ref(root, 0), arena.get_ref(root, 1))
        };
        Ok(IntIndex {
            alloc: alloc.clone(),
            root,
            values,
            rows,
        })
    }

    pub fn root(&self) -> Ref {
        self.root
    }

    /// Smallest indexed row in `[start, end)` holding `value`.
    pub fn find_first(&self, value: i64, start: usize, end: usize) -> Option<usize> {
        let arena = self.alloc.borrow();
        let len = arena.ints_len(self.values);
        let pos = arena.lower_bound_pair(self.values, self.rows, value, start as i64);
        if pos < len && arena.get_int(self.values, pos) == value {
            let row = arena.get_int(self.rows, pos) as usize;
            (row < end).then_some(row)
        } else {
            None
        }
    }

    /// All rows holding `value`, ascending.
    pub fn find_all(&self, sink: &mut Vec<usize>, value: i64) {
        let arena = self.alloc.borrow();
        let len = arena.ints_len(self.values);
        let mut pos = arena.lower_bound_pair(self.values, self.rows, value, 0);
        while pos < len && arena.get_int(self.values, pos) == value {
            sink.push(arena.get_int(self.rows, pos) as usize);
            pos += 1;
        }
    }

    pub fn add(&mut self, value: i64, row: usize) {
        let mut arena = self.alloc.borrow_mut();
        let pos = arena.lower_bound_pair(self.values, self.rows, value, row as i64);
        arena.insert_int(self.values, pos, value);
        arena.insert_int(self.rows, pos, row as i64);
    }

    pub fn remove(&mut self, value: i64, row: usize) {
        let mut arena = self.alloc.borrow_mut();
        let pos = arena.lower_bound_pair(self.values, self.rows, value, row as i64);
        debug_assert!(
            pos < arena.ints_len(self.values)
                && arena.get_int(self.values, pos) == value
                && arena.get_int(self.rows, pos) == row as i64,
            "index entry ({value}, {row}) missing"
        );
        arena.remove_int(self.values, pos);
        arena.remove_int(self.rows, pos);
    }

    /// Adds `diff` to every stored row id `>= from_row`. Within a run of
    /// equal values rows stay ascending, so the pair ordering is preserved.
    pub fn shift_rows(&mut self, from_row: usize, diff: i64) {
        let mut arena = self.alloc.borrow_mut();
        let len = arena.ints_len(self.rows);
        for i in 0..len {
            let row = arena.get_int(self.rows, i);
            if row >= from_row as i64 {
                arena.set_int(self.rows, i, row + diff);
            }
        }
    }

    pub fn clear(&mut self) {
        let mut arena = self.alloc.borrow_mut();
        arena.clear_ints(self.values);
        arena.clear_ints(self.rows);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index_over(data: &[i64]) -> (Alloc, IntIndex) {
        let alloc = Alloc::new();
        let index = IntIndex::build(&alloc, data.iter().copied());
        (alloc, index)
    }

    #[test]
    fn build_and_find() {
        let (_alloc, index) = index_over(&[30, 10, 20, 10]);
        assert_eq!(index.find_first(10, 0, 4), Some(1));
        assert_eq!(index.find_first(10, 2, 4), Some(3));
        assert_eq!(index.find_first(10, 0, 1), None);
        assert_eq!(index.find_first(25, 0, 4), None);

        let mut hits = Vec::new();
        index.find_all(&mut hits, 10);
        assert_eq!(hits, vec![1, 3]);
    }

    #[test]
    fn mutations_keep_order() {
        let (_alloc, mut index) = index_over(&[5, 5, 9]);
        // Row 1 changes from 5 to 9.
        index.remove(5, 1);
        index.add(9, 1);
        assert_eq!(index.find_first(9, 0, 3), Some(1));
        assert_eq!(index.find_first(5, 1, 3), None);

        // A row is inserted at position 0: everything shifts up, then the
        // new entry lands.
        index.shift_rows(0, 1);
        index.add(7, 0);
        assert_eq!(index.find_first(5, 0, 4), Some(1));
        assert_eq!(index.find_first(7, 0, 4), Some(0));
        assert_eq!(index.find_first(9, 0, 4), Some(2));
    }

    #[test]
    fn attach_round_trip() {
        let (alloc, index) = index_over(&[1, 2, 3]);
        let again = IntIndex::attach(&alloc, index.root()).unwrap();
        assert_eq!(again.find_first(2, 0, 3), Some(1));
        assert!(IntIndex::attach(&alloc, Ref::NULL).is_err());
    }
}
