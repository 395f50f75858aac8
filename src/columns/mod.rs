//! # Column Family
//!
//! Typed views over one or two arena arrays, all of uniform length within a
//! table. The taxonomy is closed and exhaustively matched (JSON export,
//! verification and the enumeration pass all need to see every variant),
//! so the family is a plain enum rather than a trait object.
//!
//! | Variant      | Backing arrays                            |
//! |--------------|-------------------------------------------|
//! | `Int`        | one int array (also bool and date)        |
//! | `String`     | one adaptive-width string leaf            |
//! | `Binary`     | `[offsets, data]` under one ref array     |
//! | `StringEnum` | dictionary string leaf + key-index ints   |
//! | `Subtable`   | ref array of subtable columns roots       |
//! | `Mixed`      | `[types, values, blobs]` under one root   |
//!
//! Every column knows the physical slot (`pos`) its root occupies in the
//! owning table's columns array. The slot shifts when an earlier string
//! column is converted to an enum (it grows to two slots) or gains an index;
//! [`CachedColumn::bump_pos`] is how the table propagates that shift.

mod binary;
mod index;
mod int;
mod mixed;
mod string;
mod string_enum;
mod subtable;

pub use binary::BinaryColumn;
pub use index::IntIndex;
pub use int::IntColumn;
pub use mixed::{MixedColumn, MixedValue};
pub use string::StringColumn;
pub use string_enum::StringEnumColumn;
pub use subtable::SubtableColumn;

use eyre::Result;
use smallvec::SmallVec;

use crate::arena::{Arena, Ref};
use crate::schema::ColumnKind;

/// One cached column of a table: the typed view plus its physical slot in
/// the table's columns array.
#[derive(Debug)]
pub struct CachedColumn {
    pub pos: usize,
    pub data: ColumnData,
}

impl CachedColumn {
    pub fn bump_pos(&mut self, diff: isize) {
        self.pos = (self.pos as isize + diff) as usize;
    }
}

/// Closed set of column representations.
#[derive(Debug)]
pub enum ColumnData {
    Int(IntColumn),
    String(StringColumn),
    Binary(BinaryColumn),
    StringEnum(StringEnumColumn),
    Subtable(SubtableColumn),
    Mixed(MixedColumn),
}

impl ColumnData {
    pub fn kind(&self) -> ColumnKind {
        match self {
            ColumnData::Int(_) => ColumnKind::Int,
            ColumnData::String(_) => ColumnKind::String,
            ColumnData::Binary(_) => ColumnKind::Binary,
            ColumnData::StringEnum(_) => ColumnKind::StringEnum,
            ColumnData::Subtable(_) => ColumnKind::Table,
            ColumnData::Mixed(_) => ColumnKind::Mixed,
        }
    }

    pub fn size(&self) -> usize {
        match self {
            ColumnData::Int(c) => c.size(),
            ColumnData::String(c) => c.size(),
            ColumnData::Binary(c) => c.size(),
            ColumnData::StringEnum(c) => c.size(),
            ColumnData::Subtable(c) => c.size(),
            ColumnData::Mixed(c) => c.size(),
        }
    }

    /// Appends one type-appropriate default row.
    pub fn add(&mut self) -> Result<()> {
        match self {
            ColumnData::Int(c) => {
                c.add();
                Ok(())
            }
            ColumnData::String(c) => c.add(),
            ColumnData::Binary(c) => {
                c.add();
                Ok(())
            }
            ColumnData::StringEnum(c) => c.add(),
            ColumnData::Subtable(c) => {
                c.add();
                Ok(())
            }
            ColumnData::Mixed(c) => {
                c.add();
                Ok(())
            }
        }
    }

    pub fn delete(&mut self, ndx: usize) -> Result<()> {
        match self {
            ColumnData::Int(c) => c.delete(ndx),
            ColumnData::String(c) => c.delete(ndx),
            ColumnData::Binary(c) => c.delete(ndx),
            ColumnData::StringEnum(c) => c.delete(ndx),
            ColumnData::Subtable(c) => c.delete(ndx),
            ColumnData::Mixed(c) => c.delete(ndx),
        }
    }

    pub fn clear(&mut self) -> Result<()> {
        match self {
            ColumnData::Int(c) => {
                c.clear();
                Ok(())
            }
            ColumnData::String(c) => {
                c.clear();
                Ok(())
            }
            ColumnData::Binary(c) => {
                c.clear();
                Ok(())
            }
            ColumnData::StringEnum(c) => {
                c.clear();
                Ok(())
            }
            ColumnData::Subtable(c) => c.clear(),
            ColumnData::Mixed(c) => c.clear(),
        }
    }

    /// Root refs this column stores in the table's columns array, in slot
    /// order. Used for the ref-consistency check in `Table::verify`.
    pub fn roots(&self) -> SmallVec<[Ref; 2]> {
        match self {
            ColumnData::Int(c) => SmallVec::from_slice(&[c.root()]),
            ColumnData::String(c) => SmallVec::from_slice(&[c.root()]),
            ColumnData::Binary(c) => SmallVec::from_slice(&[c.root()]),
            ColumnData::StringEnum(c) => SmallVec::from_slice(&[c.keys_root(), c.values_root()]),
            ColumnData::Subtable(c) => SmallVec::from_slice(&[c.root()]),
            ColumnData::Mixed(c) => SmallVec::from_slice(&[c.root()]),
        }
    }
}

/// Row count of the column of `kind` whose root sits at `slot` of a columns
/// array, read without materializing a column view. `StringEnum` reads its
/// value array one slot further.
pub(crate) fn column_len_at(
    arena: &Arena,
    kind: ColumnKind,
    columns_root: Ref,
    slot: usize,
) -> Result<usize> {
    let root = arena.get_ref(columns_root, slot);
    Ok(match kind {
        ColumnKind::Int | ColumnKind::Bool | ColumnKind::Date => arena.ints_len(root),
        ColumnKind::String => arena.strings_len(root),
        ColumnKind::StringEnum => {
            let values = arena.get_ref(columns_root, slot + 1);
            arena.ints_len(values)
        }
        ColumnKind::Binary => {
            let offsets = arena.get_ref(root, 0);
            arena.ints_len(offsets)
        }
        ColumnKind::Table => arena.refs_len(root),
        ColumnKind::Mixed => {
            let types = arena.get_ref(root, 0);
            arena.ints_len(types)
        }
        ColumnKind::AttrIndexed | ColumnKind::AttrUnique => {
            eyre::bail!("attribute entries have no length")
        }
    })
}
