//! # Schema Definition
//!
//! A table's schema is a [`Spec`]: an ordered list of type-or-attribute
//! entries plus one name per user-visible column, persisted as a small arena
//! tree so a table can be re-attached from a single ref.
//!
//! ## Layout
//!
//! ```text
//! spec_root (refs) ── [0] types     int array of TypeAttr codes
//!                  ── [1] names     string leaf, one per user column
//!                  ── [2] subspecs  ref array, one sub-spec root per Table entry
//! ```
//!
//! Attribute entries (`AttrIndexed`, `AttrUnique`) immediately follow the
//! column entry they annotate and have no name of their own. A `StringEnum`
//! entry is an internal representation detail: the public column type folds
//! it back to `String`, and its dictionary lives in the table's columns
//! array, not here.
//!
//! [`Spec::column_ref_pos`] is the single source of truth for how spec
//! entries map onto physical slots of a table's columns array: attributes
//! are skipped, a `StringEnum` column occupies two slots, everything else
//! one slot, and an indexed column is followed by one extra slot for its
//! index.

use eyre::{bail, ensure, Result};

use crate::arena::{Alloc, Ref};

/// Type-or-attribute code stored in a spec's entry list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum ColumnKind {
    Int = 0,
    Bool = 1,
    String = 2,
    StringEnum = 3,
    Binary = 4,
    Table = 5,
    Mixed = 6,
    Date = 7,
    AttrIndexed = 8,
    AttrUnique = 9,
}

impl ColumnKind {
    pub fn from_code(code: i64) -> Result<Self> {
        Ok(match code {
            0 => ColumnKind::Int,
            1 => ColumnKind::Bool,
            2 => ColumnKind::String,
            3 => ColumnKind::StringEnum,
            4 => ColumnKind::Binary,
            5 => ColumnKind::Table,
            6 => ColumnKind::Mixed,
            7 => ColumnKind::Date,
            8 => ColumnKind::AttrIndexed,
            9 => ColumnKind::AttrUnique,
            other => bail!("unknown column type code {other}"),
        })
    }

    pub fn is_attr(self) -> bool {
        matches!(self, ColumnKind::AttrIndexed | ColumnKind::AttrUnique)
    }

    /// Slots this column occupies in a table's columns array (indexes not
    /// counted; they add one more).
    pub(crate) fn slot_width(self) -> usize {
        match self {
            ColumnKind::StringEnum => 2,
            _ => 1,
        }
    }

    /// Folds internal representations back to the user-visible type.
    pub fn user_type(self) -> ColumnKind {
        match self {
            ColumnKind::StringEnum => ColumnKind::String,
            other => other,
        }
    }
}

/// Schema view rooted at a persisted spec ref.
///
/// A `Spec` is cheap to clone: it is a handle plus a root ref. Mutating it
/// mutates the shared arena tree, which is how a table column and all of its
/// subtable rows observe one schema.
#[derive(Debug, Clone)]
pub struct Spec {
    alloc: Alloc,
    root: Ref,
}

impl Spec {
    /// Allocates an empty spec tree.
    pub fn new(alloc: &Alloc) -> Self {
        let root = {
            let mut arena = alloc.borrow_mut();
            let types = arena.new_ints();
            let names = arena.new_strings();
            let subspecs = arena.new_refs();
            let root = arena.new_refs();
            arena.push_ref(root, types);
            arena.push_ref(root, names);
            arena.push_ref(root, subspecs);
            root
        };
        Spec {
            alloc: alloc.clone(),
            root,
        }
    }

    /// Attaches to an existing spec tree.
    pub fn attach(alloc: &Alloc, root: Ref) -> Result<Self> {
        {
            let arena = alloc.borrow();
            ensure!(arena.is_live(root), "spec ref does not address a live node");
            ensure!(
                arena.refs_len(root) == 3,
                "spec root has {} slots, expected 3",
                arena.refs_len(root)
            );
        }
        Ok(Spec {
            alloc: alloc.clone(),
            root,
        })
    }

    pub fn reference(&self) -> Ref {
        self.root
    }

    fn types_ref(&self) -> Ref {
        self.alloc.borrow().get_ref(self.root, 0)
    }

    fn names_ref(&self) -> Ref {
        self.alloc.borrow().get_ref(self.root, 1)
    }

    fn subspecs_ref(&self) -> Ref {
        self.alloc.borrow().get_ref(self.root, 2)
    }

    /// Appends a column entry. `Table` columns get a fresh empty sub-spec;
    /// build it out through [`Spec::sub_spec`] before the first row lands.
    pub fn add_column(&self, kind: ColumnKind, name: &str) -> Result<usize> {
        ensure!(!kind.is_attr(), "attributes are not columns");
        ensure!(
            kind != ColumnKind::StringEnum,
            "string enums are produced by optimize(), not declared"
        );
        ensure!(!name.is_empty(), "column name must be non-empty");
        ensure!(
            !name.bytes().any(|b| b == 0),
            "column name must not contain NUL"
        );
        ensure!(
            self.column_index(name).is_none(),
            "duplicate column name '{name}'"
        );

        let ndx = self.column_count();
        let types = self.types_ref();
        let names = self.names_ref();
        {
            let mut arena = self.alloc.borrow_mut();
            arena.push_int(types, kind as i64);
            arena.push_str(names, name);
        }
        if kind == ColumnKind::Table {
            let sub = Spec::new(&self.alloc);
            let subspecs = self.subspecs_ref();
            self.alloc.borrow_mut().push_ref(subspecs, sub.reference());
        }
        Ok(ndx)
    }

    pub fn column_count(&self) -> usize {
        let types = self.types_ref();
        let arena = self.alloc.borrow();
        (0..arena.ints_len(types))
            .filter(|&i| {
                ColumnKind::from_code(arena.get_int(types, i))
                    .map(|k| !k.is_attr())
                    .unwrap_or(false)
            })
            .count()
    }

    pub fn column_name(&self, ndx: usize) -> Result<String> {
        let names = self.names_ref();
        let arena = self.alloc.borrow();
        ensure!(
            ndx < arena.strings_len(names),
            "column index {ndx} out of bounds"
        );
        Ok(arena.get_str(names, ndx).to_owned())
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        let names = self.names_ref();
        let arena = self.alloc.borrow();
        arena.find_str(names, name, 0, arena.strings_len(names))
    }

    /// The stored type of a column, `StringEnum` included.
    pub fn real_column_type(&self, ndx: usize) -> Result<ColumnKind> {
        let entry = self.entry_for_column(ndx)?;
        self.type_attr(entry)
    }

    /// The user-visible type of a column (`StringEnum` folds to `String`).
    pub fn column_type(&self, ndx: usize) -> Result<ColumnKind> {
        Ok(self.real_column_type(ndx)?.user_type())
    }

    /// Rewrites a column's stored type; used by the enumeration pass.
    pub fn set_column_type(&self, ndx: usize, kind: ColumnKind) -> Result<()> {
        ensure!(!kind.is_attr(), "attributes are not column types");
        let entry = self.entry_for_column(ndx)?;
        let types = self.types_ref();
        self.alloc.borrow_mut().set_int(types, entry, kind as i64);
        Ok(())
    }

    /// Records an index attribute immediately after the column's entry.
    pub fn set_index_attr(&self, ndx: usize) -> Result<()> {
        ensure!(!self.has_index_attr(ndx)?, "column {ndx} already indexed");
        let entry = self.entry_for_column(ndx)?;
        let types = self.types_ref();
        self.alloc
            .borrow_mut()
            .insert_int(types, entry + 1, ColumnKind::AttrIndexed as i64);
        Ok(())
    }

    pub fn has_index_attr(&self, ndx: usize) -> Result<bool> {
        let entry = self.entry_for_column(ndx)?;
        if entry + 1 >= self.type_attr_count() {
            return Ok(false);
        }
        Ok(self.type_attr(entry + 1)?.is_attr())
    }

    /// Raw entry count, attributes included. This is how tables walk the
    /// schema when building or caching columns.
    pub fn type_attr_count(&self) -> usize {
        let types = self.types_ref();
        self.alloc.borrow().ints_len(types)
    }

    pub fn type_attr(&self, entry: usize) -> Result<ColumnKind> {
        let types = self.types_ref();
        let code = {
            let arena = self.alloc.borrow();
            ensure!(
                entry < arena.ints_len(types),
                "spec entry {entry} out of bounds"
            );
            arena.get_int(types, entry)
        };
        ColumnKind::from_code(code)
    }

    /// Sub-spec root for the n'th `Table` entry of this spec.
    pub fn sub_spec_ref(&self, subtable_ordinal: usize) -> Result<Ref> {
        let subspecs = self.subspecs_ref();
        let arena = self.alloc.borrow();
        ensure!(
            subtable_ordinal < arena.refs_len(subspecs),
            "subtable ordinal {subtable_ordinal} out of bounds"
        );
        Ok(arena.get_ref(subspecs, subtable_ordinal))
    }

    /// Sub-spec view for a `Table` column, addressed by column index.
    pub fn sub_spec(&self, col_ndx: usize) -> Result<Spec> {
        ensure!(
            self.real_column_type(col_ndx)? == ColumnKind::Table,
            "column {col_ndx} is not a subtable column"
        );
        let ordinal = self.subtable_ordinal(col_ndx)?;
        Spec::attach(&self.alloc, self.sub_spec_ref(ordinal)?)
    }

    /// How many `Table` columns precede `col_ndx`.
    pub(crate) fn subtable_ordinal(&self, col_ndx: usize) -> Result<usize> {
        let mut ordinal = 0;
        for i in 0..col_ndx {
            if self.real_column_type(i)? == ColumnKind::Table {
                ordinal += 1;
            }
        }
        Ok(ordinal)
    }

    /// Physical starting slot in the columns array for a user column:
    /// attributes contribute their index slot, `StringEnum` counts as two.
    pub fn column_ref_pos(&self, col_ndx: usize) -> Result<usize> {
        let count = self.type_attr_count();
        let mut pos = 0;
        let mut current = 0;
        let mut i = 0;
        while i < count {
            let kind = self.type_attr(i)?;
            ensure!(!kind.is_attr(), "dangling attribute entry at {i}");
            if current == col_ndx {
                return Ok(pos);
            }
            pos += kind.slot_width();
            // An attribute entry after the column adds one index slot.
            if i + 1 < count && self.type_attr(i + 1)?.is_attr() {
                pos += 1;
                i += 1;
            }
            current += 1;
            i += 1;
        }
        bail!("column index {col_ndx} out of bounds")
    }

    fn entry_for_column(&self, col_ndx: usize) -> Result<usize> {
        let count = self.type_attr_count();
        let mut current = 0;
        for i in 0..count {
            if self.type_attr(i)?.is_attr() {
                continue;
            }
            if current == col_ndx {
                return Ok(i);
            }
            current += 1;
        }
        bail!("column index {col_ndx} out of bounds")
    }

    /// Structural self-check: every column named, one sub-spec per `Table`
    /// entry, no dangling attribute entries.
    pub fn verify(&self) -> Result<()> {
        let count = self.type_attr_count();
        let mut columns = 0;
        let mut subtables = 0;
        let mut prev_was_attr = true; // a leading attribute is dangling
        for i in 0..count {
            let kind = self.type_attr(i)?;
            if kind.is_attr() {
                ensure!(!prev_was_attr, "attribute entry at {i} follows no column");
                prev_was_attr = true;
                continue;
            }
            prev_was_attr = false;
            if kind == ColumnKind::Table {
                subtables += 1;
            }
            columns += 1;
        }

        let names = self.names_ref();
        let subspecs = self.subspecs_ref();
        let arena = self.alloc.borrow();
        ensure!(
            arena.strings_len(names) == columns,
            "{} names for {columns} columns",
            arena.strings_len(names)
        );
        for i in 0..columns {
            ensure!(!arena.get_str(names, i).is_empty(), "column {i} has no name");
        }
        ensure!(
            arena.refs_len(subspecs) == subtables,
            "{} sub-specs for {subtables} subtable columns",
            arena.refs_len(subspecs)
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Spec {
        let alloc = Alloc::new();
        let spec = Spec::new(&alloc);
        spec.add_column(ColumnKind::Int, "x").unwrap();
        spec.add_column(ColumnKind::String, "name").unwrap();
        spec.add_column(ColumnKind::Table, "children").unwrap();
        spec
    }

    #[test]
    fn add_and_look_up_columns() {
        let spec = sample();
        assert_eq!(spec.column_count(), 3);
        assert_eq!(spec.column_name(1).unwrap(), "name");
        assert_eq!(spec.column_index("children"), Some(2));
        assert_eq!(spec.column_index("absent"), None);
        assert_eq!(spec.real_column_type(0).unwrap(), ColumnKind::Int);
        spec.verify().unwrap();
    }

    #[test]
    fn rejects_bad_columns() {
        let spec = sample();
        assert!(spec.add_column(ColumnKind::Int, "").is_err());
        assert!(spec.add_column(ColumnKind::Int, "x").is_err());
        assert!(spec.add_column(ColumnKind::AttrIndexed, "i").is_err());
        assert!(spec.add_column(ColumnKind::StringEnum, "e").is_err());
    }

    #[test]
    fn enum_conversion_folds_to_string() {
        let spec = sample();
        spec.set_column_type(1, ColumnKind::StringEnum).unwrap();
        assert_eq!(spec.real_column_type(1).unwrap(), ColumnKind::StringEnum);
        assert_eq!(spec.column_type(1).unwrap(), ColumnKind::String);
    }

    #[test]
    fn ref_pos_accounts_for_enums_and_indexes() {
        let spec = sample();
        assert_eq!(spec.column_ref_pos(0).unwrap(), 0);
        assert_eq!(spec.column_ref_pos(1).unwrap(), 1);
        assert_eq!(spec.column_ref_pos(2).unwrap(), 2);

        // Enum column widens to two slots.
        spec.set_column_type(1, ColumnKind::StringEnum).unwrap();
        assert_eq!(spec.column_ref_pos(2).unwrap(), 3);

        // An index on column 0 adds one more slot before everything else.
        spec.set_index_attr(0).unwrap();
        assert_eq!(spec.column_ref_pos(0).unwrap(), 0);
        assert_eq!(spec.column_ref_pos(1).unwrap(), 2);
        assert_eq!(spec.column_ref_pos(2).unwrap(), 4);
        assert!(spec.has_index_attr(0).unwrap());
        assert!(!spec.has_index_attr(1).unwrap());
        spec.verify().unwrap();
    }

    #[test]
    fn subtable_columns_get_sub_specs() {
        let spec = sample();
        let sub = spec.sub_spec(2).unwrap();
        sub.add_column(ColumnKind::Int, "v").unwrap();
        assert_eq!(sub.column_count(), 1);

        // The sub-spec is persisted through the parent: re-attach and look.
        let again = spec.sub_spec(2).unwrap();
        assert_eq!(again.column_name(0).unwrap(), "v");
        assert_eq!(again.reference(), sub.reference());
        assert!(spec.sub_spec(0).is_err());
    }

    #[test]
    fn attach_validates_root() {
        let alloc = Alloc::new();
        let spec = Spec::new(&alloc);
        let ok = Spec::attach(&alloc, spec.reference()).unwrap();
        assert_eq!(ok.column_count(), 0);
        assert!(Spec::attach(&alloc, Ref(999)).is_err());
    }
}
