//! # Table
//!
//! A [`Table`] binds a [`Spec`] to a tuple of equally-long columns and
//! exposes the row/cell surface of the engine. All state lives in the shared
//! arena as a small tree:
//!
//! ```text
//! top (refs) ── [0] spec_root
//!            ── [1] columns (refs) ── column roots, laid out per
//!                                     Spec::column_ref_pos
//! ```
//!
//! ## Ownership
//!
//! Exactly one owner exists for every byte of the tree:
//!
//! - A free-standing table (`new`, `from_ref`) owns its top and destroys the
//!   whole tree on drop.
//! - An accessor (`attach`) borrows a tree owned elsewhere and frees
//!   nothing.
//! - A subtable view (`subtable`) borrows a cell of a parent column. Its
//!   storage belongs to the parent; dropping the view frees nothing.
//!
//! ## Deferred instantiation
//!
//! A subtable cell holding ref 0 is a logically empty table with no storage.
//! A view attached to it carries no columns; the first mutation materializes
//! the columns from the shared spec and writes the new ref back into the
//! parent cell. Mutators re-read the parent cell first, so two views over
//! one cell never materialize twice.
//!
//! ## Schema evolution
//!
//! [`Table::optimize`] converts repetitive string columns to dictionary
//! enums. The mutation order is load-bearing: the spec entry changes first,
//! then the columns array is respliced, and only then is the in-memory cache
//! swapped, so the persisted layout is the source of truth at every step.

mod json;

use eyre::{bail, ensure, Result};
use smallvec::SmallVec;
use tracing::debug;

use crate::arena::{Alloc, Ref};
use crate::columns::{
    BinaryColumn, CachedColumn, ColumnData, IntColumn, MixedColumn, MixedValue, StringColumn,
    StringEnumColumn, SubtableColumn,
};
use crate::schema::{ColumnKind, Spec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParentKind {
    /// Parent cell holds our columns ref directly (shared-spec subtable).
    SubtableCell,
    /// Parent cell holds our top ref (mixed-column embedded table).
    MixedCell,
}

#[derive(Debug, Clone, Copy)]
struct ParentLink {
    container: Ref,
    slot: usize,
    kind: ParentKind,
}

pub struct Table {
    alloc: Alloc,
    /// `[spec, columns]` pair; NULL for shared-spec subtable views.
    top: Ref,
    spec: Spec,
    /// NULL while the table is deferred.
    columns: Ref,
    cols: SmallVec<[CachedColumn; 8]>,
    size: usize,
    parent: Option<ParentLink>,
    owned: bool,
}

impl Table {
    // ---- creation -------------------------------------------------------

    /// Creates a free-standing empty table owning its whole tree.
    pub fn new(alloc: &Alloc) -> Self {
        let spec = Spec::new(alloc);
        let (top, columns) = {
            let mut arena = alloc.borrow_mut();
            let columns = arena.new_refs();
            let top = arena.new_refs();
            arena.push_ref(top, spec.reference());
            arena.push_ref(top, columns);
            (top, columns)
        };
        Table {
            alloc: alloc.clone(),
            top,
            spec,
            columns,
            cols: SmallVec::new(),
            size: 0,
            parent: None,
            owned: true,
        }
    }

    /// Re-opens a table from a persisted top ref, taking ownership of the
    /// tree.
    pub fn from_ref(alloc: &Alloc, top: Ref) -> Result<Self> {
        let mut t = Self::attach(alloc, top)?;
        t.owned = true;
        Ok(t)
    }

    /// Opens a non-owning accessor over a tree owned elsewhere.
    pub fn attach(alloc: &Alloc, top: Ref) -> Result<Self> {
        let (spec_ref, columns) = {
            let arena = alloc.borrow();
            ensure!(arena.is_live(top), "table ref does not address a live node");
            ensure!(
                arena.refs_len(top) == 2,
                "table top has {} slots, expected 2",
                arena.refs_len(top)
            );
            (arena.get_ref(top, 0), arena.get_ref(top, 1))
        };
        let spec = Spec::attach(alloc, spec_ref)?;
        let mut t = Table {
            alloc: alloc.clone(),
            top,
            spec,
            columns,
            cols: SmallVec::new(),
            size: 0,
            parent: None,
            owned: false,
        };
        if !t.columns.is_null() {
            t.cache_columns()?;
        }
        Ok(t)
    }

    fn subtable_view(
        alloc: &Alloc,
        spec_ref: Ref,
        columns: Ref,
        parent: ParentLink,
    ) -> Result<Self> {
        let spec = Spec::attach(alloc, spec_ref)?;
        let mut t = Table {
            alloc: alloc.clone(),
            top: Ref::NULL,
            spec,
            columns,
            cols: SmallVec::new(),
            size: 0,
            parent: Some(parent),
            owned: false,
        };
        if !t.columns.is_null() {
            t.cache_columns()?;
        }
        Ok(t)
    }

    /// Persisted top ref, for re-opening later.
    pub fn top_ref(&self) -> Ref {
        self.top
    }

    pub fn spec(&self) -> &Spec {
        &self.spec
    }

    // ---- schema ---------------------------------------------------------

    pub fn column_count(&self) -> usize {
        self.spec.column_count()
    }

    pub fn column_name(&self, col: usize) -> Result<String> {
        self.spec.column_name(col)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.spec.column_index(name)
    }

    pub fn column_type(&self, col: usize) -> Result<ColumnKind> {
        self.spec.column_type(col)
    }

    pub fn real_column_type(&self, col: usize) -> Result<ColumnKind> {
        self.spec.real_column_type(col)
    }

    /// Sub-spec view of a subtable column, for building out nested schemas.
    pub fn sub_spec(&self, col: usize) -> Result<Spec> {
        self.spec.sub_spec(col)
    }

    /// Appends a column to the schema and backfills it with default rows so
    /// the size invariant holds.
    pub fn add_column(&mut self, kind: ColumnKind, name: &str) -> Result<usize> {
        ensure!(
            !self.top.is_null(),
            "schema changes go through the table owning the spec"
        );
        self.update_from_parent()?;
        self.instantiate_before_change()?;

        // Spec first, columns second: the persisted layout stays consistent
        // at every step.
        let col = self.spec.add_column(kind, name)?;
        let mut data = self.build_column(kind, col)?;
        for _ in 0..self.size {
            data.add()?;
        }
        let pos = self.alloc.borrow().refs_len(self.columns);
        for root in data.roots() {
            self.alloc.borrow_mut().push_ref(self.columns, root);
        }
        self.cols.push(CachedColumn { pos, data });
        Ok(col)
    }

    fn build_column(&self, kind: ColumnKind, col: usize) -> Result<ColumnData> {
        Ok(match kind {
            ColumnKind::Int | ColumnKind::Bool | ColumnKind::Date => {
                ColumnData::Int(IntColumn::new(&self.alloc))
            }
            ColumnKind::String => ColumnData::String(StringColumn::new(&self.alloc)),
            ColumnKind::Binary => ColumnData::Binary(BinaryColumn::new(&self.alloc)),
            ColumnKind::Table => {
                let ordinal = self.spec.subtable_ordinal(col)?;
                let sub_spec = self.spec.sub_spec_ref(ordinal)?;
                ColumnData::Subtable(SubtableColumn::new(&self.alloc, sub_spec))
            }
            ColumnKind::Mixed => ColumnData::Mixed(MixedColumn::new(&self.alloc)),
            other => bail!("cannot build a column of kind {other:?}"),
        })
    }

    // ---- column materialization ----------------------------------------

    /// Builds columns from the spec for a table attached to a zero
    /// columns-ref, writing the new ref back to wherever the table hangs.
    fn create_columns(&mut self) -> Result<()> {
        debug_assert!(self.columns.is_null() || self.alloc.borrow().refs_len(self.columns) == 0);
        if self.columns.is_null() {
            self.columns = self.alloc.borrow_mut().new_refs();
            if !self.top.is_null() {
                self.alloc.borrow_mut().set_ref(self.top, 1, self.columns);
            } else if let Some(parent) = self.parent {
                debug_assert_eq!(parent.kind, ParentKind::SubtableCell);
                self.alloc
                    .borrow_mut()
                    .set_ref(parent.container, parent.slot, self.columns);
            }
        }

        let entries = self.spec.type_attr_count();
        let mut col = 0;
        let mut entry = 0;
        while entry < entries {
            let kind = self.spec.type_attr(entry)?;
            ensure!(!kind.is_attr(), "dangling attribute entry at {entry}");
            let mut data = self.build_column(kind, col)?;
            let pos = self.alloc.borrow().refs_len(self.columns);
            for root in data.roots() {
                self.alloc.borrow_mut().push_ref(self.columns, root);
            }
            // An attribute entry after the column means it is indexed; build
            // the index eagerly so the spec never dangles.
            if entry + 1 < entries && self.spec.type_attr(entry + 1)?.is_attr() {
                let ColumnData::Int(int_col) = &mut data else {
                    bail!("index attribute on non-integer column {col}");
                };
                let index_root = int_col.build_index();
                self.alloc.borrow_mut().push_ref(self.columns, index_root);
                entry += 1;
            }
            self.cols.push(CachedColumn { pos, data });
            col += 1;
            entry += 1;
        }
        self.size = 0;
        Ok(())
    }

    /// Reconstructs the typed column cache from a populated columns array,
    /// asserting the size invariant along the way.
    fn cache_columns(&mut self) -> Result<()> {
        debug_assert!(self.cols.is_empty());
        let entries = self.spec.type_attr_count();
        let mut size: Option<usize> = None;
        let mut slot = 0;
        let mut col = 0;
        let mut entry = 0;
        while entry < entries {
            let kind = self.spec.type_attr(entry)?;
            ensure!(!kind.is_attr(), "dangling attribute entry at {entry}");
            let root = {
                let arena = self.alloc.borrow();
                ensure!(
                    slot < arena.refs_len(self.columns),
                    "columns array ends before column {col}"
                );
                arena.get_ref(self.columns, slot)
            };
            let mut data = match kind {
                ColumnKind::Int | ColumnKind::Bool | ColumnKind::Date => {
                    ColumnData::Int(IntColumn::attach(&self.alloc, root))
                }
                ColumnKind::String => ColumnData::String(StringColumn::attach(&self.alloc, root)),
                ColumnKind::StringEnum => {
                    let values = self.alloc.borrow().get_ref(self.columns, slot + 1);
                    ColumnData::StringEnum(StringEnumColumn::attach(&self.alloc, root, values))
                }
                ColumnKind::Binary => ColumnData::Binary(BinaryColumn::attach(&self.alloc, root)?),
                ColumnKind::Table => {
                    let ordinal = self.spec.subtable_ordinal(col)?;
                    let sub_spec = self.spec.sub_spec_ref(ordinal)?;
                    ColumnData::Subtable(SubtableColumn::attach(&self.alloc, root, sub_spec))
                }
                ColumnKind::Mixed => ColumnData::Mixed(MixedColumn::attach(&self.alloc, root)?),
                other => bail!("cannot cache a column of kind {other:?}"),
            };
            let mut width = kind.slot_width();
            if entry + 1 < entries && self.spec.type_attr(entry + 1)?.is_attr() {
                let index_root = self.alloc.borrow().get_ref(self.columns, slot + width);
                let ColumnData::Int(int_col) = &mut data else {
                    bail!("index attribute on non-integer column {col}");
                };
                int_col.set_index_ref(index_root)?;
                width += 1;
                entry += 1;
            }
            let col_size = data.size();
            match size {
                None => size = Some(col_size),
                Some(s) => ensure!(
                    s == col_size,
                    "column {col} has {col_size} rows, expected {s}"
                ),
            }
            self.cols.push(CachedColumn { pos: slot, data });
            slot += width;
            col += 1;
            entry += 1;
        }
        self.size = size.unwrap_or(0);
        Ok(())
    }

    fn instantiate_before_change(&mut self) -> Result<()> {
        if self.columns.is_null() {
            self.create_columns()?;
        }
        Ok(())
    }

    /// Re-reads this table's refs from its parent. For subtable views this
    /// picks up materialization or clearing done through a sibling view; a
    /// view whose parent cell is gone refuses further work.
    pub fn update_from_parent(&mut self) -> Result<()> {
        let Some(parent) = self.parent else {
            return Ok(());
        };
        let (live, current) = {
            let arena = self.alloc.borrow();
            if !arena.is_live(parent.container) || parent.slot >= arena.refs_len(parent.container) {
                (false, Ref::NULL)
            } else {
                let slot = arena.slot(parent.container, parent.slot);
                if slot != 0 && slot & 1 == 1 {
                    // The cell was retagged to a scalar; the view dangles.
                    (false, Ref::NULL)
                } else {
                    (true, arena.get_ref(parent.container, parent.slot))
                }
            }
        };
        ensure!(live, "subtable view has lost its parent");
        match parent.kind {
            ParentKind::SubtableCell => {
                if current != self.columns {
                    self.columns = current;
                    self.cols.clear();
                    self.size = 0;
                    if !self.columns.is_null() {
                        self.cache_columns()?;
                    }
                }
            }
            ParentKind::MixedCell => {
                ensure!(current == self.top, "subtable view has lost its parent");
                let columns = self.alloc.borrow().get_ref(self.top, 1);
                if columns != self.columns {
                    self.columns = columns;
                    self.cols.clear();
                    self.size = 0;
                    if !self.columns.is_null() {
                        self.cache_columns()?;
                    }
                }
            }
        }
        Ok(())
    }

    // ---- column access --------------------------------------------------

    fn col(&self, ndx: usize) -> Result<&CachedColumn> {
        ensure!(
            ndx < self.cols.len(),
            "column index {ndx} out of bounds ({})",
            self.cols.len()
        );
        Ok(&self.cols[ndx])
    }

    fn col_mut(&mut self, ndx: usize) -> Result<&mut CachedColumn> {
        ensure!(
            ndx < self.cols.len(),
            "column index {ndx} out of bounds ({})",
            self.cols.len()
        );
        Ok(&mut self.cols[ndx])
    }

    fn expect_kind(&self, col: usize, expected: ColumnKind) -> Result<()> {
        let actual = self.spec.real_column_type(col)?;
        ensure!(
            actual == expected,
            "column {col} is {actual:?}, operation expects {expected:?}"
        );
        Ok(())
    }

    fn int_data(&self, col: usize, expected: ColumnKind) -> Result<&IntColumn> {
        self.expect_kind(col, expected)?;
        match &self.col(col)?.data {
            ColumnData::Int(c) => Ok(c),
            other => bail!("column {col} cached as {:?}", other.kind()),
        }
    }

    fn int_data_mut(&mut self, col: usize, expected: ColumnKind) -> Result<&mut IntColumn> {
        self.expect_kind(col, expected)?;
        match &mut self.col_mut(col)?.data {
            ColumnData::Int(c) => Ok(c),
            other => bail!("column {col} cached as {:?}", other.kind()),
        }
    }

    fn mixed_data(&self, col: usize) -> Result<&MixedColumn> {
        self.expect_kind(col, ColumnKind::Mixed)?;
        match &self.col(col)?.data {
            ColumnData::Mixed(c) => Ok(c),
            other => bail!("column {col} cached as {:?}", other.kind()),
        }
    }

    fn mixed_data_mut(&mut self, col: usize) -> Result<&mut MixedColumn> {
        self.expect_kind(col, ColumnKind::Mixed)?;
        match &mut self.col_mut(col)?.data {
            ColumnData::Mixed(c) => Ok(c),
            other => bail!("column {col} cached as {:?}", other.kind()),
        }
    }

    fn subtable_data(&self, col: usize) -> Result<&SubtableColumn> {
        self.expect_kind(col, ColumnKind::Table)?;
        match &self.col(col)?.data {
            ColumnData::Subtable(c) => Ok(c),
            other => bail!("column {col} cached as {:?}", other.kind()),
        }
    }

    fn subtable_data_mut(&mut self, col: usize) -> Result<&mut SubtableColumn> {
        self.expect_kind(col, ColumnKind::Table)?;
        match &mut self.col_mut(col)?.data {
            ColumnData::Subtable(c) => Ok(c),
            other => bail!("column {col} cached as {:?}", other.kind()),
        }
    }

    pub(crate) fn column_data(&self, col: usize) -> Result<&ColumnData> {
        Ok(&self.col(col)?.data)
    }

    // ---- row operations -------------------------------------------------

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Appends one default row to every column and returns its index.
    pub fn add_row(&mut self) -> Result<usize> {
        self.update_from_parent()?;
        self.instantiate_before_change()?;
        for col in &mut self.cols {
            col.data.add()?;
        }
        let ndx = self.size;
        self.size += 1;
        Ok(ndx)
    }

    pub fn delete_row(&mut self, ndx: usize) -> Result<()> {
        self.update_from_parent()?;
        ensure!(ndx < self.size, "row index {ndx} out of bounds ({})", self.size);
        for col in &mut self.cols {
            col.data.delete(ndx)?;
        }
        self.size -= 1;
        Ok(())
    }

    pub fn clear(&mut self) -> Result<()> {
        self.update_from_parent()?;
        for col in &mut self.cols {
            col.data.clear()?;
        }
        self.size = 0;
        Ok(())
    }

    /// Closes a batch of per-column `insert_*` calls at one row index. The
    /// caller is responsible for having inserted into every column exactly
    /// once; `verify` will catch a missed column in debug builds.
    pub fn insert_done(&mut self) -> Result<()> {
        self.size += 1;
        #[cfg(debug_assertions)]
        self.verify()?;
        Ok(())
    }

    // ---- cell operations ------------------------------------------------

    pub fn get_int(&self, col: usize, ndx: usize) -> Result<i64> {
        self.int_data(col, ColumnKind::Int)?.get(ndx)
    }

    pub fn set_int(&mut self, col: usize, ndx: usize, value: i64) -> Result<()> {
        self.update_from_parent()?;
        self.int_data_mut(col, ColumnKind::Int)?.set(ndx, value)
    }

    pub fn insert_int(&mut self, col: usize, ndx: usize, value: i64) -> Result<()> {
        self.update_from_parent()?;
        self.instantiate_before_change()?;
        self.int_data_mut(col, ColumnKind::Int)?.insert(ndx, value)
    }

    pub fn get_bool(&self, col: usize, ndx: usize) -> Result<bool> {
        Ok(self.int_data(col, ColumnKind::Bool)?.get(ndx)? != 0)
    }

    pub fn set_bool(&mut self, col: usize, ndx: usize, value: bool) -> Result<()> {
        self.update_from_parent()?;
        self.int_data_mut(col, ColumnKind::Bool)?
            .set(ndx, value as i64)
    }

    pub fn insert_bool(&mut self, col: usize, ndx: usize, value: bool) -> Result<()> {
        self.update_from_parent()?;
        self.instantiate_before_change()?;
        self.int_data_mut(col, ColumnKind::Bool)?
            .insert(ndx, value as i64)
    }

    /// Dates are UTC epoch seconds.
    pub fn get_date(&self, col: usize, ndx: usize) -> Result<i64> {
        self.int_data(col, ColumnKind::Date)?.get(ndx)
    }

    pub fn set_date(&mut self, col: usize, ndx: usize, value: i64) -> Result<()> {
        self.update_from_parent()?;
        self.int_data_mut(col, ColumnKind::Date)?.set(ndx, value)
    }

    pub fn insert_date(&mut self, col: usize, ndx: usize, value: i64) -> Result<()> {
        self.update_from_parent()?;
        self.instantiate_before_change()?;
        self.int_data_mut(col, ColumnKind::Date)?.insert(ndx, value)
    }

    pub fn get_string(&self, col: usize, ndx: usize) -> Result<String> {
        match &self.col(col)?.data {
            ColumnData::String(c) => c.get(ndx),
            ColumnData::StringEnum(c) => c.get(ndx),
            other => bail!("column {col} is {:?}, operation expects a string", other.kind()),
        }
    }

    pub fn set_string(&mut self, col: usize, ndx: usize, value: &str) -> Result<()> {
        self.update_from_parent()?;
        match &mut self.col_mut(col)?.data {
            ColumnData::String(c) => c.set(ndx, value),
            ColumnData::StringEnum(c) => c.set(ndx, value),
            other => bail!("column {col} is {:?}, operation expects a string", other.kind()),
        }
    }

    pub fn insert_string(&mut self, col: usize, ndx: usize, value: &str) -> Result<()> {
        self.update_from_parent()?;
        self.instantiate_before_change()?;
        match &mut self.col_mut(col)?.data {
            ColumnData::String(c) => c.insert(ndx, value),
            ColumnData::StringEnum(c) => c.insert(ndx, value),
            other => bail!("column {col} is {:?}, operation expects a string", other.kind()),
        }
    }

    pub fn get_binary(&self, col: usize, ndx: usize) -> Result<Vec<u8>> {
        self.expect_kind(col, ColumnKind::Binary)?;
        match &self.col(col)?.data {
            ColumnData::Binary(c) => c.get(ndx),
            other => bail!("column {col} cached as {:?}", other.kind()),
        }
    }

    pub fn set_binary(&mut self, col: usize, ndx: usize, value: &[u8]) -> Result<()> {
        self.update_from_parent()?;
        self.expect_kind(col, ColumnKind::Binary)?;
        match &mut self.col_mut(col)?.data {
            ColumnData::Binary(c) => c.set(ndx, value),
            other => bail!("column {col} cached as {:?}", other.kind()),
        }
    }

    pub fn insert_binary(&mut self, col: usize, ndx: usize, value: &[u8]) -> Result<()> {
        self.update_from_parent()?;
        self.instantiate_before_change()?;
        self.expect_kind(col, ColumnKind::Binary)?;
        match &mut self.col_mut(col)?.data {
            ColumnData::Binary(c) => c.insert(ndx, value),
            other => bail!("column {col} cached as {:?}", other.kind()),
        }
    }

    pub fn get_mixed(&self, col: usize, ndx: usize) -> Result<MixedValue> {
        self.mixed_data(col)?.get(ndx)
    }

    pub fn get_mixed_type(&self, col: usize, ndx: usize) -> Result<ColumnKind> {
        self.mixed_data(col)?.value_type(ndx)
    }

    pub fn set_mixed(&mut self, col: usize, ndx: usize, value: MixedValue) -> Result<()> {
        self.update_from_parent()?;
        let c = self.mixed_data_mut(col)?;
        match value {
            MixedValue::Int(v) => c.set_int(ndx, v),
            MixedValue::Bool(v) => c.set_bool(ndx, v),
            MixedValue::Date(v) => c.set_date(ndx, v),
            MixedValue::String(v) => c.set_string(ndx, &v),
            MixedValue::Binary(v) => c.set_binary(ndx, &v),
            MixedValue::Table => c.set_table(ndx),
        }
    }

    pub fn insert_mixed(&mut self, col: usize, ndx: usize, value: MixedValue) -> Result<()> {
        self.update_from_parent()?;
        self.instantiate_before_change()?;
        let c = self.mixed_data_mut(col)?;
        match value {
            MixedValue::Int(v) => c.insert_int(ndx, v),
            MixedValue::Bool(v) => c.insert_bool(ndx, v),
            MixedValue::Date(v) => c.insert_date(ndx, v),
            MixedValue::String(v) => c.insert_string(ndx, &v),
            MixedValue::Binary(v) => c.insert_binary(ndx, &v),
            MixedValue::Table => c.insert_table(ndx),
        }
    }

    // ---- subtables ------------------------------------------------------

    /// Inserts a row holding the empty subtable into a subtable column.
    pub fn insert_table(&mut self, col: usize, ndx: usize) -> Result<()> {
        self.update_from_parent()?;
        self.instantiate_before_change()?;
        self.subtable_data_mut(col)?.insert(ndx)
    }

    /// Resets a subtable cell to the empty subtable.
    pub fn clear_table(&mut self, col: usize, ndx: usize) -> Result<()> {
        self.update_from_parent()?;
        self.subtable_data_mut(col)?.clear_cell(ndx)
    }

    /// Row count of a subtable cell, without materializing a view.
    pub fn table_size(&self, col: usize, ndx: usize) -> Result<usize> {
        self.subtable_data(col)?.table_size(ndx)
    }

    /// Opens a view over a subtable cell. The view borrows storage owned by
    /// this table; mutations through it land in the shared tree.
    pub fn subtable(&self, col: usize, ndx: usize) -> Result<Table> {
        ensure!(ndx < self.size, "row index {ndx} out of bounds ({})", self.size);
        match self.real_column_type(col)? {
            ColumnKind::Table => {
                let sub = self.subtable_data(col)?;
                Table::subtable_view(
                    &self.alloc,
                    sub.sub_spec_ref(),
                    sub.cell_ref(ndx)?,
                    ParentLink {
                        container: sub.root(),
                        slot: ndx,
                        kind: ParentKind::SubtableCell,
                    },
                )
            }
            ColumnKind::Mixed => {
                let mixed = self.mixed_data(col)?;
                let top = mixed.cell_table_top(ndx)?;
                let mut view = Table::attach(&self.alloc, top)?;
                view.parent = Some(ParentLink {
                    container: mixed.values_root(),
                    slot: ndx,
                    kind: ParentKind::MixedCell,
                });
                Ok(view)
            }
            other => bail!("column {col} is {other:?}, not a subtable column"),
        }
    }

    // ---- search ---------------------------------------------------------

    pub fn find(&self, col: usize, value: i64) -> Result<Option<usize>> {
        Ok(self
            .int_data(col, ColumnKind::Int)?
            .find(value, 0, self.size))
    }

    pub fn find_bool(&self, col: usize, value: bool) -> Result<Option<usize>> {
        Ok(self
            .int_data(col, ColumnKind::Bool)?
            .find(value as i64, 0, self.size))
    }

    pub fn find_date(&self, col: usize, value: i64) -> Result<Option<usize>> {
        Ok(self
            .int_data(col, ColumnKind::Date)?
            .find(value, 0, self.size))
    }

    pub fn find_string(&self, col: usize, value: &str) -> Result<Option<usize>> {
        Ok(match &self.col(col)?.data {
            ColumnData::String(c) => c.find(value, 0, self.size),
            ColumnData::StringEnum(c) => c.find(value, 0, self.size),
            other => bail!("column {col} is {:?}, operation expects a string", other.kind()),
        })
    }

    pub fn find_all(&self, col: usize, value: i64) -> Result<Vec<usize>> {
        let mut hits = Vec::new();
        self.int_data(col, ColumnKind::Int)?
            .find_all(&mut hits, value);
        Ok(hits)
    }

    pub fn find_all_bool(&self, col: usize, value: bool) -> Result<Vec<usize>> {
        let mut hits = Vec::new();
        self.int_data(col, ColumnKind::Bool)?
            .find_all(&mut hits, value as i64);
        Ok(hits)
    }

    pub fn find_all_string(&self, col: usize, value: &str) -> Result<Vec<usize>> {
        let mut hits = Vec::new();
        match &self.col(col)?.data {
            ColumnData::String(c) => c.find_all(&mut hits, value),
            ColumnData::StringEnum(c) => c.find_all(&mut hits, value),
            other => bail!("column {col} is {:?}, operation expects a string", other.kind()),
        }
        Ok(hits)
    }

    /// Rows whose integer value is within `max_dist` bits of `value`.
    pub fn find_all_hamming(&self, col: usize, value: u64, max_dist: u32) -> Result<Vec<usize>> {
        let mut hits = Vec::new();
        self.int_data(col, ColumnKind::Int)?
            .find_all_hamming(&mut hits, value, max_dist);
        Ok(hits)
    }

    // ---- indexes --------------------------------------------------------

    pub fn has_index(&self, col: usize) -> Result<bool> {
        Ok(match &self.col(col)?.data {
            ColumnData::Int(c) => c.has_index(),
            _ => false,
        })
    }

    /// Builds a secondary index over an integer column. Subsequent exact
    /// finds on the column run in O(log n).
    pub fn set_index(&mut self, col: usize) -> Result<()> {
        self.update_from_parent()?;
        self.instantiate_before_change()?;
        if self.has_index(col)? {
            return Ok(());
        }
        let pos = self.col(col)?.pos;
        let int_col = match &mut self.col_mut(col)?.data {
            ColumnData::Int(c) => c,
            other => bail!("indexes require an integer column, got {:?}", other.kind()),
        };
        let index_root = int_col.build_index();

        // Spec first, columns second, cache positions last.
        self.spec.set_index_attr(col)?;
        self.alloc
            .borrow_mut()
            .insert_ref(self.columns, pos + 1, index_root);
        self.update_column_refs(col + 1, 1);
        Ok(())
    }

    // ---- schema evolution -----------------------------------------------

    /// Converts every string column whose dictionary form is smaller into a
    /// string enum. Observable cell values are unchanged.
    pub fn optimize(&mut self) -> Result<()> {
        self.update_from_parent()?;
        if self.columns.is_null() {
            return Ok(());
        }
        for col in 0..self.column_count() {
            if self.spec.real_column_type(col)? != ColumnKind::String {
                continue;
            }
            let ColumnData::String(string_col) = &self.col(col)?.data else {
                bail!("column {col} cached with the wrong type");
            };
            let Some((keys, values)) = string_col.auto_enumerate()? else {
                continue;
            };
            let old_root = string_col.root();
            let pos = self.col(col)?.pos;

            // The persisted layout is rewritten front to back: spec entry,
            // then the columns array, and only then the in-memory cache.
            self.spec.set_column_type(col, ColumnKind::StringEnum)?;
            {
                let mut arena = self.alloc.borrow_mut();
                arena.set_ref(self.columns, pos, keys);
                arena.insert_ref(self.columns, pos + 1, values);
            }
            self.update_column_refs(col + 1, 1);
            self.cols[col].data =
                ColumnData::StringEnum(StringEnumColumn::attach(&self.alloc, keys, values));
            self.alloc.borrow_mut().destroy_tree(old_root);
            debug!(column = col, "converted string column to enum dictionary");
        }
        #[cfg(debug_assertions)]
        self.verify()?;
        Ok(())
    }

    /// Shifts the cached physical positions of columns `from..` by `diff`
    /// slots, after the columns array gained or lost a slot before them.
    fn update_column_refs(&mut self, from: usize, diff: isize) {
        for col in &mut self.cols[from..] {
            col.bump_pos(diff);
        }
    }

    // ---- verification ---------------------------------------------------

    /// Structural consistency walk: spec shape, size uniformity, and the
    /// agreement between the columns array and the cached views.
    pub fn verify(&self) -> Result<()> {
        self.spec.verify()?;
        if self.columns.is_null() {
            ensure!(self.size == 0, "deferred table claims {} rows", self.size);
            return Ok(());
        }
        ensure!(
            self.cols.len() == self.column_count(),
            "{} cached columns for {} spec columns",
            self.cols.len(),
            self.column_count()
        );
        for (i, col) in self.cols.iter().enumerate() {
            ensure!(
                col.data.size() == self.size,
                "column {i} has {} rows, table has {}",
                col.data.size(),
                self.size
            );
            let expected_pos = self.spec.column_ref_pos(i)?;
            ensure!(
                col.pos == expected_pos,
                "column {i} cached at slot {}, spec says {expected_pos}",
                col.pos
            );
            let arena = self.alloc.borrow();
            let roots = col.data.roots();
            let width = roots.len();
            for (k, root) in roots.into_iter().enumerate() {
                ensure!(
                    arena.get_ref(self.columns, col.pos + k) == root,
                    "column {i} root {k} disagrees with columns array"
                );
            }
            if let ColumnData::Int(c) = &col.data {
                if let Some(index_root) = c.index_root() {
                    ensure!(
                        arena.get_ref(self.columns, col.pos + width) == index_root,
                        "column {i} index root disagrees with columns array"
                    );
                }
            }
            if let ColumnData::StringEnum(c) = &col.data {
                c.verify()?;
            }
        }
        Ok(())
    }
}

impl Drop for Table {
    fn drop(&mut self) {
        // Free-standing owners destroy the whole tree; accessors and
        // parent-owned subtable views free nothing.
        if self.owned && self.parent.is_none() && !self.top.is_null() {
            self.alloc.borrow_mut().destroy_tree(self.top);
        }
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("columns", &self.column_count())
            .field("rows", &self.size)
            .field("top", &self.top)
            .field("owned", &self.owned)
            .finish()
    }
}
