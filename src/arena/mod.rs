//! # Array Arena
//!
//! This module provides the reference-counted array store that backs every
//! table, spec and column in the engine. All persistent state is a tree of
//! small array nodes living in one [`Arena`]; a node is addressed by an
//! opaque [`Ref`] and the tree structure is encoded by ref-arrays whose slots
//! point at child nodes.
//!
//! ## Node Flavors
//!
//! | Payload   | Contents                               | Used by              |
//! |-----------|----------------------------------------|----------------------|
//! | `Ints`    | signed 64-bit integers                 | int/bool/date columns, offsets, enum indices |
//! | `Refs`    | child refs or tagged 63-bit integers   | tops, column lists, subtable cells, mixed values |
//! | `Strings` | fixed-width zero-terminated string leaf| string columns, names, enum keys |
//! | `Blob`    | raw bytes                              | binary column data   |
//!
//! ## Ref Encoding
//!
//! A `Ref` is a `u32` slot id; `Ref::NULL` (0) means "absent/empty subtree".
//! Inside a `Refs` payload the classic tagging convention applies: a slot
//! value of 0 is null, an even value is a child ref shifted left by one, and
//! an odd value is a tagged integer `(v << 1) | 1`. Structural walks
//! (subtree destruction) recurse into even non-zero slots only.
//!
//! ## Parent Back-Links
//!
//! Every node records the `(parent_ref, slot)` it is stored under. The
//! invariant is maintained by the ref-array mutators: inserting or removing
//! a slot renumbers the back-links of all children at later slots, and
//! overwriting a slot re-parents the new child. Refs are stable for the
//! lifetime of a node (the arena never relocates live nodes), so back-links
//! are plain integers rather than pointers.
//!
//! ## Sharing
//!
//! Tables, columns and subtable views all operate on one arena through a
//! cloneable [`Alloc`] handle (`Rc<RefCell<Arena>>`). The handle is
//! deliberately not `Send`/`Sync`: table mutation is single-writer and
//! externally serialized, exactly like the database handles layered above.

mod array;

pub(crate) use array::width_for;

use std::cell::{Ref as CellRef, RefCell, RefMut};
use std::rc::Rc;

/// Opaque handle identifying an array node inside an [`Arena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ref(pub(crate) u32);

impl Ref {
    /// The null ref, denoting an absent or logically empty subtree.
    pub const NULL: Ref = Ref(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Raw slot encoding of this ref inside a `Refs` payload.
    pub(crate) fn encode(self) -> i64 {
        (self.0 as i64) << 1
    }

    pub(crate) fn decode(slot: i64) -> Ref {
        debug_assert!(slot >= 0 && slot & 1 == 0, "slot {slot} is not a ref");
        Ref((slot >> 1) as u32)
    }
}

/// The contents of one array node.
#[derive(Debug, Clone)]
pub(crate) enum Payload {
    Ints(Vec<i64>),
    Refs(Vec<i64>),
    Strings {
        /// Bytes per element including the zero terminator; 0 while every
        /// element is the empty string.
        width: usize,
        len: usize,
        data: Vec<u8>,
    },
    Blob(Vec<u8>),
}

#[derive(Debug)]
pub(crate) struct Node {
    pub(crate) payload: Payload,
    pub(crate) parent: Option<(Ref, usize)>,
}

/// Slab of array nodes addressed by [`Ref`].
#[derive(Debug, Default)]
pub struct Arena {
    nodes: Vec<Option<Node>>,
    free: Vec<u32>,
}

impl Arena {
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc(&mut self, payload: Payload) -> Ref {
        let node = Node {
            payload,
            parent: None,
        };
        match self.free.pop() {
            Some(ndx) => {
                self.nodes[ndx as usize] = Some(node);
                Ref(ndx + 1)
            }
            None => {
                self.nodes.push(Some(node));
                Ref(self.nodes.len() as u32)
            }
        }
    }

    pub fn new_ints(&mut self) -> Ref {
        self.alloc(Payload::Ints(Vec::new()))
    }

    pub fn new_refs(&mut self) -> Ref {
        self.alloc(Payload::Refs(Vec::new()))
    }

    pub fn new_strings(&mut self) -> Ref {
        self.alloc(Payload::Strings {
            width: 0,
            len: 0,
            data: Vec::new(),
        })
    }

    pub fn new_blob(&mut self) -> Ref {
        self.alloc(Payload::Blob(Vec::new()))
    }

    /// Frees a single node. The caller is responsible for having detached or
    /// destroyed its children first; see [`Arena::destroy_tree`].
    pub fn free(&mut self, r: Ref) {
        let ndx = self.index(r);
        assert!(self.nodes[ndx].is_some(), "double free of {r:?}");
        self.nodes[ndx] = None;
        self.free.push(ndx as u32);
    }

    pub fn is_live(&self, r: Ref) -> bool {
        !r.is_null()
            && (r.0 as usize) <= self.nodes.len()
            && self.nodes[r.0 as usize - 1].is_some()
    }

    /// Recursively frees a subtree: ref-array slots holding even non-zero
    /// values are treated as children, tagged and null slots are skipped.
    pub fn destroy_tree(&mut self, r: Ref) {
        if r.is_null() {
            return;
        }
        if let Payload::Refs(slots) = &self.node(r).payload {
            let children: Vec<Ref> = slots
                .iter()
                .filter(|&&s| s != 0 && s & 1 == 0)
                .map(|&s| Ref::decode(s))
                .collect();
            for child in children {
                self.destroy_tree(child);
            }
        }
        self.free(r);
    }

    pub fn parent(&self, r: Ref) -> Option<(Ref, usize)> {
        self.node(r).parent
    }

    pub fn set_parent(&mut self, r: Ref, parent: Option<(Ref, usize)>) {
        self.node_mut(r).parent = parent;
    }

    /// Number of live nodes, mostly for leak assertions in tests.
    pub fn live_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }

    fn index(&self, r: Ref) -> usize {
        assert!(!r.is_null(), "null ref dereferenced");
        r.0 as usize - 1
    }

    #[track_caller]
    pub(crate) fn node(&self, r: Ref) -> &Node {
        let ndx = self.index(r);
        self.nodes[ndx].as_ref().expect("dangling ref dereferenced")
    }

    #[track_caller]
    pub(crate) fn node_mut(&mut self, r: Ref) -> &mut Node {
        let ndx = self.index(r);
        self.nodes[ndx].as_mut().expect("dangling ref dereferenced")
    }
}

/// Cloneable handle to a shared [`Arena`].
///
/// Plays the role the allocator reference plays for the array tree: every
/// table, column and subtable view over the same storage clones one handle.
#[derive(Clone, Default)]
pub struct Alloc {
    inner: Rc<RefCell<Arena>>,
}

impl Alloc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn borrow(&self) -> CellRef<'_, Arena> {
        self.inner.borrow()
    }

    pub fn borrow_mut(&self) -> RefMut<'_, Arena> {
        self.inner.borrow_mut()
    }

    /// True when both handles address the same arena. Cross-arena ref mixing
    /// is a precondition violation everywhere in the engine.
    pub fn same_arena(&self, other: &Alloc) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Alloc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Alloc")
            .field("live", &self.inner.borrow().live_count())
            .finish()
    }
}
