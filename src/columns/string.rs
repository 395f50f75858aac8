//! Adaptive-width string column: a single string leaf whose element width
//! grows through fixed buckets as longer strings appear.
//!
//! [`StringColumn::auto_enumerate`] is the schema-evolution hook: when the
//! distinct-value set is small relative to the row count it emits the
//! dictionary representation a [`super::StringEnumColumn`] attaches to, and
//! the owning table rewrites its spec and columns array around it.

use eyre::{ensure, Result};
use hashbrown::HashSet;

use crate::arena::{Alloc, Ref};

#[derive(Debug)]
pub struct StringColumn {
    alloc: Alloc,
    root: Ref,
}

impl StringColumn {
    pub fn new(alloc: &Alloc) -> Self {
        let root = alloc.borrow_mut().new_strings();
        StringColumn {
            alloc: alloc.clone(),
            root,
        }
    }

    pub fn attach(alloc: &Alloc, root: Ref) -> Self {
        StringColumn {
            alloc: alloc.clone(),
            root,
        }
    }

    pub fn root(&self) -> Ref {
        self.root
    }

    pub fn size(&self) -> usize {
        self.alloc.borrow().strings_len(self.root)
    }

    pub fn get(&self, ndx: usize) -> Result<String> {
        ensure!(ndx < self.size(), "row index {ndx} out of bounds");
        Ok(self.alloc.borrow().get_str(self.root, ndx).to_owned())
    }

    pub fn set(&mut self, ndx: usize, value: &str) -> Result<()> {
        ensure!(ndx < self.size(), "row index {ndx} out of bounds");
        ensure!(
            !value.bytes().any(|b| b == 0),
            "strings must not contain NUL"
        );
        self.alloc.borrow_mut().set_str(self.root, ndx, value);
        Ok(())
    }

    pub fn add(&mut self) -> Result<()> {
        let ndx = self.size();
        self.insert(ndx, "")
    }

    pub fn insert(&mut self, ndx: usize, value: &str) -> Result<()> {
        ensure!(ndx <= self.size(), "row index {ndx} out of bounds");
        ensure!(
            !value.bytes().any(|b| b == 0),
            "strings must not contain NUL"
        );
        self.alloc.borrow_mut().insert_str(self.root, ndx, value);
        Ok(())
    }

    pub fn delete(&mut self, ndx: usize) -> Result<()> {
        ensure!(ndx < self.size(), "row index {ndx} out of bounds");
        self.alloc.borrow_mut().remove_str(self.root, ndx);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.alloc.borrow_mut().clear_strings(self.root);
    }

    pub fn find(&self, value: &str, start: usize, end: usize) -> Option<usize> {
        let arena = self.alloc.borrow();
        let end = end.min(arena.strings_len(self.root));
        arena.find_str(self.root, value, start, end)
    }

    pub fn find_all(&self, sink: &mut Vec<usize>, value: &str) {
        let arena = self.alloc.borrow();
        for i in 0..arena.strings_len(self.root) {
            if arena.get_str(self.root, i) == value {
                sink.push(i);
            }
        }
    }

    /// Decides whether the dictionary form would be strictly smaller than
    /// the flat leaf, and if so builds it: a sorted leaf of distinct keys
    /// plus an int array mapping every row to its key.
    ///
    /// The size model mirrors the persisted format: key storage is
    /// `bucket_width * distinct_count`, index storage packs each entry into
    /// the minimal power-of-two bit width for `distinct_count - 1`.
    pub fn auto_enumerate(&self) -> Result<Option<(Ref, Ref)>> {
        let arena = self.alloc.borrow();
        let len = arena.strings_len(self.root);
        if len == 0 {
            return Ok(None);
        }

        let mut seen: HashSet<&str> = HashSet::new();
        let mut longest = 0usize;
        for i in 0..len {
            let s = arena.get_str(self.root, i);
            if seen.insert(s) {
                longest = longest.max(s.len());
            }
        }
        let distinct = seen.len();

        let flat_bytes = arena.strings_byte_size(self.root);
        let key_bytes = crate::arena::width_for(longest) * distinct;
        let index_bytes = (len * index_bit_width(distinct) + 7) / 8;
        if key_bytes + index_bytes >= flat_bytes {
            return Ok(None);
        }

        let mut keys: Vec<&str> = seen.into_iter().collect();
        keys.sort_unstable();
        let key_ids: Vec<i64> = (0..len)
            .map(|i| {
                let s = arena.get_str(self.root, i);
                keys.binary_search(&s).expect("key collected above") as i64
            })
            .collect();
        let keys: Vec<String> = keys.into_iter().map(str::to_owned).collect();
        drop(arena);

        let mut arena = self.alloc.borrow_mut();
        let keys_ref = arena.new_strings();
        for k in &keys {
            arena.push_str(keys_ref, k);
        }
        let values_ref = arena.new_ints();
        for id in key_ids {
            arena.push_int(values_ref, id);
        }
        Ok(Some((keys_ref, values_ref)))
    }
}

/// Bit width the persisted int format would use for key indexes up to
/// `distinct - 1`: 0 when one key covers everything, else the next power of
/// two up to 64.
fn index_bit_width(distinct: usize) -> usize {
    if distinct <= 1 {
        return 0;
    }
    let needed = usize::BITS - (distinct - 1).leading_zeros();
    let mut width = 1;
    while width < needed as usize {
        width *= 2;
    }
    width.min(64)
}
