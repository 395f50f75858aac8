//! Mixed column: per row a tagged payload of any scalar type, a blob, or an
//! embedded table with its own row-local spec.
//!
//! ## Layout
//!
//! ```text
//! root (refs) ── [0] types   int array of ColumnKind codes
//!             ── [1] values  ref array: tagged scalar, or table top ref
//!             ── [2] blobs   binary column (same length, empty for
//!                            non-blob rows) holding string/binary payloads
//! ```
//!
//! Scalars live in the tagged slots of `values`, which bounds them to 63
//! bits. An embedded table's slot holds the ref of a `[spec, columns]` top,
//! so destroying the row destroys the whole embedded tree.

use eyre::{bail, ensure, Result};

use super::BinaryColumn;
use crate::arena::{Alloc, Ref};
use crate::schema::{ColumnKind, Spec};

/// Runtime value of one mixed cell. The `Table` variant is a marker; the
/// rows of an embedded table are reached through `Table::subtable`.
#[derive(Debug, Clone, PartialEq)]
pub enum MixedValue {
    Int(i64),
    Bool(bool),
    Date(i64),
    String(String),
    Binary(Vec<u8>),
    Table,
}

impl MixedValue {
    pub fn kind(&self) -> ColumnKind {
        match self {
            MixedValue::Int(_) => ColumnKind::Int,
            MixedValue::Bool(_) => ColumnKind::Bool,
            MixedValue::Date(_) => ColumnKind::Date,
            MixedValue::String(_) => ColumnKind::String,
            MixedValue::Binary(_) => ColumnKind::Binary,
            MixedValue::Table => ColumnKind::Table,
        }
    }
}

#[derive(Debug)]
pub struct MixedColumn {
    alloc: Alloc,
    root: Ref,
    types: Ref,
    values: Ref,
    blobs: BinaryColumn,
}

impl MixedColumn {
    pub fn new(alloc: &Alloc) -> Self {
        let blobs = BinaryColumn::new(alloc);
        let (root, types, values) = {
            let mut arena = alloc.borrow_mut();
            let types = arena.new_ints();
            let values = arena.new_refs();
            let root = arena.new_refs();
            arena.push_ref(root, types);
            arena.push_ref(root, values);
            arena.push_ref(root, blobs.root());
            (root, types, values)
        };
        MixedColumn {
            alloc: alloc.clone(),
            root,
            types,
            values,
            blobs,
        }
    }

    pub fn attach(alloc: &Alloc, root: Ref) -> Result<Self> {
        let (types, values, blobs_root) = {
            let arena = alloc.borrow();
            ensure!(
                arena.is_live(root) && arena.refs_len(root) == 3,
                "mixed column ref does not address a [types, values, blobs] triple"
            );
            (
                arena.get_ref(root, 0),
                arena.get_ref(root, 1),
                arena.get_ref(root, 2),
            )
        };
        Ok(MixedColumn {
            alloc: alloc.clone(),
            root,
            types,
            values,
            blobs: BinaryColumn::attach(alloc, blobs_root)?,
        })
    }

    pub fn root(&self) -> Ref {
        self.root
    }

    /// Root of the tagged value array; subtable views anchor their parent
    /// link here.
    pub fn values_root(&self) -> Ref {
        self.values
    }

    pub fn size(&self) -> usize {
        self.alloc.borrow().ints_len(self.types)
    }

    pub fn value_type(&self, ndx: usize) -> Result<ColumnKind> {
        ensure!(ndx < self.size(), "row index {ndx} out of bounds");
        ColumnKind::from_code(self.alloc.borrow().get_int(self.types, ndx))
    }

    pub fn get(&self, ndx: usize) -> Result<MixedValue> {
        let kind = self.value_type(ndx)?;
        Ok(match kind {
            ColumnKind::Int => MixedValue::Int(self.tagged(ndx)?),
            ColumnKind::Bool => MixedValue::Bool(self.tagged(ndx)? != 0),
            ColumnKind::Date => MixedValue::Date(self.tagged(ndx)?),
            ColumnKind::String => {
                let bytes = self.blobs.get(ndx)?;
                MixedValue::String(
                    String::from_utf8(bytes).map_err(|_| eyre::eyre!("corrupt string payload"))?,
                )
            }
            ColumnKind::Binary => MixedValue::Binary(self.blobs.get(ndx)?),
            ColumnKind::Table => MixedValue::Table,
            other => bail!("invalid mixed tag {other:?} at row {ndx}"),
        })
    }

    fn tagged(&self, ndx: usize) -> Result<i64> {
        self.alloc
            .borrow()
            .get_tagged(self.values, ndx)
            .ok_or_else(|| eyre::eyre!("mixed scalar slot {ndx} holds no tagged value"))
    }

    /// Top ref (`[spec, columns]`) of the embedded table at `ndx`.
    pub fn cell_table_top(&self, ndx: usize) -> Result<Ref> {
        ensure!(
            self.value_type(ndx)? == ColumnKind::Table,
            "mixed cell {ndx} does not hold a table"
        );
        Ok(self.alloc.borrow().get_ref(self.values, ndx))
    }

    /// Frees whatever payload the cell currently holds, leaving the slot
    /// ready for a new tag.
    fn drop_payload(&mut self, ndx: usize) -> Result<()> {
        match self.value_type(ndx)? {
            ColumnKind::Table => {
                let top = self.alloc.borrow().get_ref(self.values, ndx);
                if !top.is_null() {
                    self.alloc.borrow_mut().destroy_tree(top);
                }
                self.alloc.borrow_mut().set_null(self.values, ndx);
            }
            ColumnKind::String | ColumnKind::Binary => {
                self.blobs.set(ndx, b"")?;
            }
            _ => {}
        }
        Ok(())
    }

    fn set_scalar(&mut self, ndx: usize, kind: ColumnKind, value: i64) -> Result<()> {
        self.drop_payload(ndx)?;
        let mut arena = self.alloc.borrow_mut();
        arena.set_int(self.types, ndx, kind as i64);
        arena.set_tagged(self.values, ndx, value);
        Ok(())
    }

    pub fn set_int(&mut self, ndx: usize, value: i64) -> Result<()> {
        self.set_scalar(ndx, ColumnKind::Int, value)
    }

    pub fn set_bool(&mut self, ndx: usize, value: bool) -> Result<()> {
        self.set_scalar(ndx, ColumnKind::Bool, value as i64)
    }

    pub fn set_date(&mut self, ndx: usize, value: i64) -> Result<()> {
        self.set_scalar(ndx, ColumnKind::Date, value)
    }

    pub fn set_string(&mut self, ndx: usize, value: &str) -> Result<()> {
        self.drop_payload(ndx)?;
        self.blobs.set(ndx, value.as_bytes())?;
        let mut arena = self.alloc.borrow_mut();
        arena.set_int(self.types, ndx, ColumnKind::String as i64);
        arena.set_tagged(self.values, ndx, 0);
        Ok(())
    }

    pub fn set_binary(&mut self, ndx: usize, value: &[u8]) -> Result<()> {
        self.drop_payload(ndx)?;
        self.blobs.set(ndx, value)?;
        let mut arena = self.alloc.borrow_mut();
        arena.set_int(self.types, ndx, ColumnKind::Binary as i64);
        arena.set_tagged(self.values, ndx, 0);
        Ok(())
    }

    /// Replaces the cell with a fresh empty table carrying its own spec.
    pub fn set_table(&mut self, ndx: usize) -> Result<()> {
        ensure!(ndx < self.size(), "row index {ndx} out of bounds");
        self.drop_payload(ndx)?;
        let spec = Spec::new(&self.alloc);
        let mut arena = self.alloc.borrow_mut();
        let top = arena.new_refs();
        arena.push_ref(top, spec.reference());
        arena.push_null(top);
        arena.set_int(self.types, ndx, ColumnKind::Table as i64);
        arena.set_ref(self.values, ndx, top);
        Ok(())
    }

    /// Appends a default cell (integer 0), mirroring the other columns'
    /// type-appropriate defaults.
    pub fn add(&mut self) {
        let ndx = self.size();
        self.insert_int(ndx, 0).expect("append is always in bounds");
    }

    fn insert_slot(&mut self, ndx: usize, kind: ColumnKind, tagged: i64) -> Result<()> {
        ensure!(ndx <= self.size(), "row index {ndx} out of bounds");
        self.blobs.insert(ndx, b"")?;
        let mut arena = self.alloc.borrow_mut();
        arena.insert_int(self.types, ndx, kind as i64);
        arena.insert_tagged(self.values, ndx, tagged);
        Ok(())
    }

    pub fn insert_int(&mut self, ndx: usize, value: i64) -> Result<()> {
        self.insert_slot(ndx, ColumnKind::Int, value)
    }

    pub fn insert_bool(&mut self, ndx: usize, value: bool) -> Result<()> {
        self.insert_slot(ndx, ColumnKind::Bool, value as i64)
    }

    pub fn insert_date(&mut self, ndx: usize, value: i64) -> Result<()> {
        self.insert_slot(ndx, ColumnKind::Date, value)
    }

    pub fn insert_string(&mut self, ndx: usize, value: &str) -> Result<()> {
        self.insert_slot(ndx, ColumnKind::String, 0)?;
        self.blobs.set(ndx, value.as_bytes())
    }

    pub fn insert_binary(&mut self, ndx: usize, value: &[u8]) -> Result<()> {
        self.insert_slot(ndx, ColumnKind::Binary, 0)?;
        self.blobs.set(ndx, value)
    }

    pub fn insert_table(&mut self, ndx: usize) -> Result<()> {
        self.insert_slot(ndx, ColumnKind::Int, 0)?;
        self.set_table(ndx)
    }

    pub fn delete(&mut self, ndx: usize) -> Result<()> {
        self.drop_payload(ndx)?;
        self.blobs.delete(ndx)?;
        let mut arena = self.alloc.borrow_mut();
        arena.remove_int(self.types, ndx);
        arena.remove_slot(self.values, ndx);
        Ok(())
    }

    pub fn clear(&mut self) -> Result<()> {
        for i in 0..self.size() {
            self.drop_payload(i)?;
        }
        self.blobs.clear();
        let mut arena = self.alloc.borrow_mut();
        arena.clear_ints(self.types);
        arena.clear_refs(self.values);
        Ok(())
    }
}
