//! Subtable column: a ref array with one slot per row, each holding either
//! 0 (a logically empty subtable) or the ref of that row's columns array.
//! All rows share one sub-spec stored in the owning table's spec.
//!
//! The column owns every byte of its subtrees: deleting or clearing a row
//! destroys the subtree first. Table views handed out for a cell borrow the
//! storage and free nothing.

use eyre::{ensure, Result};

use super::column_len_at;
use crate::arena::{Alloc, Ref};
use crate::schema::Spec;

#[derive(Debug)]
pub struct SubtableColumn {
    alloc: Alloc,
    root: Ref,
    sub_spec: Ref,
}

impl SubtableColumn {
    pub fn new(alloc: &Alloc, sub_spec: Ref) -> Self {
        let root = alloc.borrow_mut().new_refs();
        SubtableColumn {
            alloc: alloc.clone(),
            root,
            sub_spec,
        }
    }

    pub fn attach(alloc: &Alloc, root: Ref, sub_spec: Ref) -> Self {
        SubtableColumn {
            alloc: alloc.clone(),
            root,
            sub_spec,
        }
    }

    pub fn root(&self) -> Ref {
        self.root
    }

    pub fn sub_spec_ref(&self) -> Ref {
        self.sub_spec
    }

    pub fn size(&self) -> usize {
        self.alloc.borrow().refs_len(self.root)
    }

    /// Columns ref of the row's subtable; NULL for the empty subtable.
    pub fn cell_ref(&self, ndx: usize) -> Result<Ref> {
        ensure!(ndx < self.size(), "row index {ndx} out of bounds");
        Ok(self.alloc.borrow().get_ref(self.root, ndx))
    }

    /// Row count of the subtable at `ndx`, read without materializing a
    /// table view. 0-refs are empty by definition.
    pub fn table_size(&self, ndx: usize) -> Result<usize> {
        let columns = self.cell_ref(ndx)?;
        if columns.is_null() {
            return Ok(0);
        }
        let spec = Spec::attach(&self.alloc, self.sub_spec)?;
        if spec.column_count() == 0 {
            return Ok(0);
        }
        let kind = spec.real_column_type(0)?;
        let arena = self.alloc.borrow();
        if arena.refs_len(columns) == 0 {
            return Ok(0);
        }
        column_len_at(&arena, kind, columns, 0)
    }

    pub fn add(&mut self) {
        self.alloc.borrow_mut().push_null(self.root);
    }

    /// Inserts a row holding the empty subtable.
    pub fn insert(&mut self, ndx: usize) -> Result<()> {
        ensure!(ndx <= self.size(), "row index {ndx} out of bounds");
        self.alloc.borrow_mut().insert_null(self.root, ndx);
        Ok(())
    }

    pub fn delete(&mut self, ndx: usize) -> Result<()> {
        let columns = self.cell_ref(ndx)?;
        let mut arena = self.alloc.borrow_mut();
        if !columns.is_null() {
            arena.destroy_tree(columns);
        }
        arena.remove_slot(self.root, ndx);
        Ok(())
    }

    /// Destroys the row's subtree and marks the cell empty again.
    pub fn clear_cell(&mut self, ndx: usize) -> Result<()> {
        let columns = self.cell_ref(ndx)?;
        if columns.is_null() {
            return Ok(());
        }
        let mut arena = self.alloc.borrow_mut();
        arena.destroy_tree(columns);
        arena.set_null(self.root, ndx);
        Ok(())
    }

    pub fn clear(&mut self) -> Result<()> {
        let mut arena = self.alloc.borrow_mut();
        for i in 0..arena.refs_len(self.root) {
            let columns = arena.get_ref(self.root, i);
            if !columns.is_null() {
                arena.destroy_tree(columns);
            }
        }
        arena.clear_refs(self.root);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnKind;

    fn column() -> (Alloc, SubtableColumn) {
        let alloc = Alloc::new();
        let spec = Spec::new(&alloc);
        spec.add_column(ColumnKind::Int, "v").unwrap();
        let col = SubtableColumn::new(&alloc, spec.reference());
        (alloc, col)
    }

    #[test]
    fn empty_cells_report_zero_rows() {
        let (_alloc, mut col) = column();
        col.add();
        col.insert(0).unwrap();
        assert_eq!(col.size(), 2);
        assert!(col.cell_ref(0).unwrap().is_null());
        assert_eq!(col.table_size(0).unwrap(), 0);
        assert!(col.table_size(2).is_err());
    }

    #[test]
    fn delete_destroys_subtree() {
        let (alloc, mut col) = column();
        col.add();

        // Hand-build a one-column, two-row subtable in the cell.
        let columns = {
            let mut arena = alloc.borrow_mut();
            let ints = arena.new_ints();
            arena.push_int(ints, 1);
            arena.push_int(ints, 2);
            let columns = arena.new_refs();
            arena.push_ref(columns, ints);
            arena.set_ref(col.root(), 0, columns);
            columns
        };
        assert_eq!(col.table_size(0).unwrap(), 2);

        let live_before = alloc.borrow().live_count();
        col.delete(0).unwrap();
        assert_eq!(alloc.borrow().live_count(), live_before - 2);
        assert!(!alloc.borrow().is_live(columns));
        assert_eq!(col.size(), 0);
    }

    #[test]
    fn clear_cell_keeps_the_row() {
        let (alloc, mut col) = column();
        col.add();
        {
            let mut arena = alloc.borrow_mut();
            let ints = arena.new_ints();
            arena.push_int(ints, 9);
            let columns = arena.new_refs();
            arena.push_ref(columns, ints);
            arena.set_ref(col.root(), 0, columns);
        }
        assert_eq!(col.table_size(0).unwrap(), 1);

        col.clear_cell(0).unwrap();
        assert_eq!(col.size(), 1);
        assert!(col.cell_ref(0).unwrap().is_null());
        assert_eq!(col.table_size(0).unwrap(), 0);
        // Clearing an already empty cell is a no-op.
        col.clear_cell(0).unwrap();
    }
}
