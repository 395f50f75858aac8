//! # stratadb - Embedded Columnar Table Engine
//!
//! stratadb is an embedded, schema-typed, columnar table database with
//! optional transparent page-level authenticated encryption. Tables hold
//! homogeneously typed columns (integer, boolean, date, string, binary,
//! nested table, mixed) in a shared arena of reference-counted array nodes,
//! support nested subtables to arbitrary depth, and are queried through a
//! composable tree of predicate nodes.
//!
//! ## Quick Start
//!
//! ```ignore
//! use stratadb::{Alloc, ColumnKind, Query, Table};
//!
//! let alloc = Alloc::new();
//! let mut people = Table::new(&alloc);
//! people.add_column(ColumnKind::Int, "age")?;
//! people.add_column(ColumnKind::String, "name")?;
//!
//! let row = people.add_row()?;
//! people.set_int(0, row, 42)?;
//! people.set_string(1, row, "ada")?;
//!
//! let hits = Query::new().greater(0, 18).find_all(&people)?;
//! let json = people.to_json()?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │    Public API (Table / Query)        │
//! ├─────────────────────────────────────┤
//! │  Schema (Spec) │ Column family       │
//! ├────────────────┴────────────────────┤
//! │     Array arena (refs + nodes)       │
//! ├─────────────────────────────────────┤
//! │  Encrypted storage (cryptor +        │
//! │  page mapping, optional)             │
//! └─────────────────────────────────────┘
//! ```
//!
//! Every table is a small tree of array nodes addressed by refs inside an
//! [`Alloc`] arena: a `[spec, columns]` top, the schema tree, and one or two
//! arrays per column. Subtables store their columns ref in a cell of the
//! parent column, which is what makes nesting and structural sharing cheap.
//! A table can be re-opened later from its top ref alone.
//!
//! The encrypted storage layer is independent of the table engine: a
//! [`storage::PageCryptor`] implements AES-256-CBC + HMAC-SHA-224 over
//! 4096-byte blocks with a crash-consistent IV table, and
//! [`storage::EncryptedFileMapping`] layers lazy decrypt-on-read,
//! dirty-page tracking and multi-mapping coherence on top of it.
//!
//! ## Concurrency Model
//!
//! Table handles are single-writer: the engine never spawns threads, and
//! all mutation of one database must be externally serialized. The shared
//! arena handle is deliberately not `Send`/`Sync`. Encrypted mappings may
//! live on different threads; their shared per-file state serializes on a
//! process-wide registry and one lock per physical file.
//!
//! ## Error Handling
//!
//! Fallible operations return [`eyre::Result`]. Precondition violations
//! (bad indexes, wrong column types, detached subtable views) refuse the
//! operation with a descriptive error. The storage layer's
//! caller-distinguishable kinds are typed in [`error::StorageError`] and
//! can be downcast from any report.

pub mod arena;
pub mod columns;
pub mod error;
pub mod query;
pub mod schema;
pub mod storage;
pub mod table;

pub use arena::{Alloc, Ref};
pub use columns::MixedValue;
pub use error::StorageError;
pub use query::{IntOp, Query, StrOp};
pub use schema::{ColumnKind, Spec};
pub use storage::{EncryptedFileMapping, PageCryptor};
pub use table::Table;
