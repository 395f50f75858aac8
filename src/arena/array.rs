//! Typed operations over arena nodes: integer arrays, ref arrays with
//! back-link maintenance, adaptive-width string leaves and blob leaves.
//!
//! The mutators here are the only code allowed to restructure a node, which
//! is what keeps the parent back-link invariant centralized: any insert,
//! remove or overwrite of a ref-array slot renumbers or re-parents the
//! affected children before it returns.

use super::{Arena, Payload, Ref};

// String leaf widths grow through fixed buckets so that a leaf only has to
// be rewritten when a longer string class first appears.
const STRING_WIDTHS: [usize; 7] = [4, 8, 16, 32, 64, 128, 256];

pub(crate) fn width_for(byte_len: usize) -> usize {
    for w in STRING_WIDTHS {
        if byte_len < w {
            return w;
        }
    }
    // Beyond the fixed buckets, round up to the next power of two.
    (byte_len + 1).next_power_of_two()
}

impl Arena {
    // ---- integer arrays -------------------------------------------------

    fn ints(&self, r: Ref) -> &Vec<i64> {
        match &self.node(r).payload {
            Payload::Ints(v) => v,
            other => panic!("expected int array, found {other:?}"),
        }
    }

    fn ints_mut(&mut self, r: Ref) -> &mut Vec<i64> {
        match &mut self.node_mut(r).payload {
            Payload::Ints(v) => v,
            other => panic!("expected int array, found {other:?}"),
        }
    }

    pub fn ints_len(&self, r: Ref) -> usize {
        self.ints(r).len()
    }

    pub fn get_int(&self, r: Ref, ndx: usize) -> i64 {
        self.ints(r)[ndx]
    }

    pub fn set_int(&mut self, r: Ref, ndx: usize, value: i64) {
        self.ints_mut(r)[ndx] = value;
    }

    pub fn push_int(&mut self, r: Ref, value: i64) {
        self.ints_mut(r).push(value);
    }

    pub fn insert_int(&mut self, r: Ref, ndx: usize, value: i64) {
        self.ints_mut(r).insert(ndx, value);
    }

    pub fn remove_int(&mut self, r: Ref, ndx: usize) -> i64 {
        self.ints_mut(r).remove(ndx)
    }

    pub fn clear_ints(&mut self, r: Ref) {
        self.ints_mut(r).clear();
    }

    pub fn find_int(&self, r: Ref, value: i64, start: usize, end: usize) -> Option<usize> {
        let v = self.ints(r);
        let end = end.min(v.len());
        (start..end).find(|&i| v[i] == value)
    }

    /// Binary search over an int array sorted by `(value, paired row)`;
    /// `rows` supplies the pair element. Returns the first position whose
    /// pair is `>= (value, row)`.
    pub fn lower_bound_pair(&self, values: Ref, rows: Ref, value: i64, row: i64) -> usize {
        let vs = self.ints(values);
        let rs = self.ints(rows);
        debug_assert_eq!(vs.len(), rs.len());
        let mut lo = 0;
        let mut hi = vs.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if (vs[mid], rs[mid]) < (value, row) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    // ---- ref arrays -----------------------------------------------------

    fn refs(&self, r: Ref) -> &Vec<i64> {
        match &self.node(r).payload {
            Payload::Refs(v) => v,
            other => panic!("expected ref array, found {other:?}"),
        }
    }

    fn refs_mut(&mut self, r: Ref) -> &mut Vec<i64> {
        match &mut self.node_mut(r).payload {
            Payload::Refs(v) => v,
            other => panic!("expected ref array, found {other:?}"),
        }
    }

    pub fn refs_len(&self, r: Ref) -> usize {
        self.refs(r).len()
    }

    /// Raw slot value: 0 = null, even = encoded ref, odd = tagged integer.
    pub fn slot(&self, r: Ref, ndx: usize) -> i64 {
        self.refs(r)[ndx]
    }

    /// Decodes the slot as a child ref; null slots yield [`Ref::NULL`].
    /// Calling this on a tagged slot is an engine bug.
    pub fn get_ref(&self, r: Ref, ndx: usize) -> Ref {
        let slot = self.refs(r)[ndx];
        if slot == 0 {
            Ref::NULL
        } else {
            Ref::decode(slot)
        }
    }

    pub fn get_tagged(&self, r: Ref, ndx: usize) -> Option<i64> {
        let slot = self.refs(r)[ndx];
        (slot & 1 == 1).then(|| slot >> 1)
    }

    /// Overwrites a slot with a child ref and re-parents the child. Does not
    /// free whatever the slot held before; that is the caller's decision.
    pub fn set_ref(&mut self, r: Ref, ndx: usize, child: Ref) {
        self.refs_mut(r)[ndx] = child.encode();
        if !child.is_null() {
            self.set_parent(child, Some((r, ndx)));
        }
    }

    pub fn set_tagged(&mut self, r: Ref, ndx: usize, value: i64) {
        self.refs_mut(r)[ndx] = (value << 1) | 1;
    }

    pub fn set_null(&mut self, r: Ref, ndx: usize) {
        self.refs_mut(r)[ndx] = 0;
    }

    pub fn push_ref(&mut self, r: Ref, child: Ref) {
        let ndx = self.refs(r).len();
        self.refs_mut(r).push(child.encode());
        if !child.is_null() {
            self.set_parent(child, Some((r, ndx)));
        }
    }

    pub fn push_tagged(&mut self, r: Ref, value: i64) {
        self.refs_mut(r).push((value << 1) | 1);
    }

    pub fn push_null(&mut self, r: Ref) {
        self.refs_mut(r).push(0);
    }

    /// Inserts a child ref at `ndx`, shifting later slots and renumbering
    /// their children's back-links.
    pub fn insert_ref(&mut self, r: Ref, ndx: usize, child: Ref) {
        self.refs_mut(r).insert(ndx, child.encode());
        if !child.is_null() {
            self.set_parent(child, Some((r, ndx)));
        }
        self.fix_backlinks_from(r, ndx + 1);
    }

    pub fn insert_null(&mut self, r: Ref, ndx: usize) {
        self.refs_mut(r).insert(ndx, 0);
        self.fix_backlinks_from(r, ndx + 1);
    }

    pub fn insert_tagged(&mut self, r: Ref, ndx: usize, value: i64) {
        self.refs_mut(r).insert(ndx, (value << 1) | 1);
        self.fix_backlinks_from(r, ndx + 1);
    }

    /// Removes a slot without freeing the child it may hold, then renumbers
    /// later children. Returns the raw slot value.
    pub fn remove_slot(&mut self, r: Ref, ndx: usize) -> i64 {
        let slot = self.refs_mut(r).remove(ndx);
        self.fix_backlinks_from(r, ndx);
        slot
    }

    pub fn clear_refs(&mut self, r: Ref) {
        self.refs_mut(r).clear();
    }

    fn fix_backlinks_from(&mut self, r: Ref, start: usize) {
        let children: Vec<(Ref, usize)> = self.refs(r)[start..]
            .iter()
            .enumerate()
            .filter(|&(_, &s)| s != 0 && s & 1 == 0)
            .map(|(i, &s)| (Ref::decode(s), start + i))
            .collect();
        for (child, slot) in children {
            self.set_parent(child, Some((r, slot)));
        }
    }

    // ---- string leaves --------------------------------------------------

    pub fn strings_len(&self, r: Ref) -> usize {
        match &self.node(r).payload {
            Payload::Strings { len, .. } => *len,
            other => panic!("expected string leaf, found {other:?}"),
        }
    }

    pub fn string_width(&self, r: Ref) -> usize {
        match &self.node(r).payload {
            Payload::Strings { width, .. } => *width,
            other => panic!("expected string leaf, found {other:?}"),
        }
    }

    pub fn get_str(&self, r: Ref, ndx: usize) -> &str {
        match &self.node(r).payload {
            Payload::Strings { width, len, data } => {
                assert!(ndx < *len, "string index {ndx} out of bounds ({len})");
                if *width == 0 {
                    return "";
                }
                let cell = &data[ndx * width..(ndx + 1) * width];
                let end = cell.iter().position(|&b| b == 0).unwrap_or(*width);
                std::str::from_utf8(&cell[..end]).expect("string leaf holds valid utf-8")
            }
            other => panic!("expected string leaf, found {other:?}"),
        }
    }

    pub fn set_str(&mut self, r: Ref, ndx: usize, value: &str) {
        self.ensure_width(r, value.len());
        match &mut self.node_mut(r).payload {
            Payload::Strings { width, len, data } => {
                assert!(ndx < *len);
                let cell = &mut data[ndx * *width..(ndx + 1) * *width];
                cell.fill(0);
                cell[..value.len()].copy_from_slice(value.as_bytes());
            }
            _ => unreachable!(),
        }
    }

    pub fn insert_str(&mut self, r: Ref, ndx: usize, value: &str) {
        self.ensure_width(r, value.len());
        match &mut self.node_mut(r).payload {
            Payload::Strings { width, len, data } => {
                assert!(ndx <= *len);
                if *width == 0 {
                    *len += 1;
                    return;
                }
                let at = ndx * *width;
                data.splice(at..at, std::iter::repeat(0u8).take(*width));
                data[at..at + value.len()].copy_from_slice(value.as_bytes());
                *len += 1;
            }
            _ => unreachable!(),
        }
    }

    pub fn push_str(&mut self, r: Ref, value: &str) {
        let len = self.strings_len(r);
        self.insert_str(r, len, value);
    }

    pub fn remove_str(&mut self, r: Ref, ndx: usize) {
        match &mut self.node_mut(r).payload {
            Payload::Strings { width, len, data } => {
                assert!(ndx < *len);
                if *width > 0 {
                    let at = ndx * *width;
                    data.drain(at..at + *width);
                }
                *len -= 1;
            }
            other => panic!("expected string leaf, found {other:?}"),
        }
    }

    pub fn clear_strings(&mut self, r: Ref) {
        match &mut self.node_mut(r).payload {
            Payload::Strings { width, len, data } => {
                *width = 0;
                *len = 0;
                data.clear();
            }
            other => panic!("expected string leaf, found {other:?}"),
        }
    }

    pub fn find_str(&self, r: Ref, value: &str, start: usize, end: usize) -> Option<usize> {
        let end = end.min(self.strings_len(r));
        (start..end).find(|&i| self.get_str(r, i) == value)
    }

    /// First position in a sorted string leaf not ordered before `value`.
    pub fn lower_bound_str(&self, r: Ref, value: &str) -> usize {
        let len = self.strings_len(r);
        let mut lo = 0;
        let mut hi = len;
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.get_str(r, mid) < value {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Storage footprint of the leaf in bytes, the unit the enumeration
    /// heuristic compares against.
    pub fn strings_byte_size(&self, r: Ref) -> usize {
        self.string_width(r) * self.strings_len(r)
    }

    fn ensure_width(&mut self, r: Ref, byte_len: usize) {
        let (cur_width, cur_len) = match &self.node(r).payload {
            Payload::Strings { width, len, .. } => (*width, *len),
            other => panic!("expected string leaf, found {other:?}"),
        };
        if byte_len == 0 || byte_len < cur_width {
            return;
        }
        let new_width = width_for(byte_len);
        match &mut self.node_mut(r).payload {
            Payload::Strings { width, data, .. } => {
                let mut widened = vec![0u8; new_width * cur_len];
                if *width > 0 {
                    for i in 0..cur_len {
                        widened[i * new_width..i * new_width + *width]
                            .copy_from_slice(&data[i * *width..(i + 1) * *width]);
                    }
                }
                *data = widened;
                *width = new_width;
            }
            _ => unreachable!(),
        }
    }

    // ---- blob leaves ----------------------------------------------------

    pub fn blob_len(&self, r: Ref) -> usize {
        match &self.node(r).payload {
            Payload::Blob(v) => v.len(),
            other => panic!("expected blob leaf, found {other:?}"),
        }
    }

    pub fn blob_slice(&self, r: Ref, start: usize, end: usize) -> &[u8] {
        match &self.node(r).payload {
            Payload::Blob(v) => &v[start..end],
            other => panic!("expected blob leaf, found {other:?}"),
        }
    }

    /// Replaces `start..end` of the blob with `replacement`.
    pub fn blob_splice(&mut self, r: Ref, start: usize, end: usize, replacement: &[u8]) {
        match &mut self.node_mut(r).payload {
            Payload::Blob(v) => {
                v.splice(start..end, replacement.iter().copied());
            }
            other => panic!("expected blob leaf, found {other:?}"),
        }
    }

    pub fn clear_blob(&mut self, r: Ref) {
        match &mut self.node_mut(r).payload {
            Payload::Blob(v) => v.clear(),
            other => panic!("expected blob leaf, found {other:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn width_buckets() {
        assert_eq!(width_for(0), 4);
        assert_eq!(width_for(3), 4);
        assert_eq!(width_for(4), 8);
        assert_eq!(width_for(63), 64);
        assert_eq!(width_for(255), 256);
        assert_eq!(width_for(256), 512);
    }

    #[test]
    fn int_array_ops() {
        let mut a = Arena::new();
        let r = a.new_ints();
        a.push_int(r, 5);
        a.push_int(r, 7);
        a.insert_int(r, 1, 6);
        assert_eq!(a.ints_len(r), 3);
        assert_eq!(
            (0..3).map(|i| a.get_int(r, i)).collect::<Vec<_>>(),
            vec![5, 6, 7]
        );
        assert_eq!(a.find_int(r, 7, 0, 3), Some(2));
        assert_eq!(a.find_int(r, 7, 0, 2), None);
        a.remove_int(r, 0);
        a.set_int(r, 0, -1);
        assert_eq!(a.get_int(r, 0), -1);
    }

    #[test]
    fn ref_array_backlinks_follow_inserts() {
        let mut a = Arena::new();
        let root = a.new_refs();
        let c0 = a.new_ints();
        let c1 = a.new_ints();
        a.push_ref(root, c0);
        a.push_ref(root, c1);
        assert_eq!(a.parent(c1), Some((root, 1)));

        let c_new = a.new_ints();
        a.insert_ref(root, 0, c_new);
        assert_eq!(a.parent(c_new), Some((root, 0)));
        assert_eq!(a.parent(c0), Some((root, 1)));
        assert_eq!(a.parent(c1), Some((root, 2)));

        a.remove_slot(root, 1);
        assert_eq!(a.parent(c1), Some((root, 1)));
        assert_eq!(a.get_ref(root, 1), c1);
    }

    #[test]
    fn tagged_slots_round_trip() {
        let mut a = Arena::new();
        let r = a.new_refs();
        a.push_tagged(r, -9);
        a.push_null(r);
        assert_eq!(a.get_tagged(r, 0), Some(-9));
        assert_eq!(a.get_tagged(r, 1), None);
        assert!(a.get_ref(r, 1).is_null());
        a.set_tagged(r, 1, 1 << 40);
        assert_eq!(a.get_tagged(r, 1), Some(1 << 40));
    }

    #[test]
    fn string_leaf_widens_in_place() {
        let mut a = Arena::new();
        let r = a.new_strings();
        a.push_str(r, "");
        a.push_str(r, "ab");
        assert_eq!(a.string_width(r), 4);
        assert_eq!(a.get_str(r, 0), "");
        assert_eq!(a.get_str(r, 1), "ab");

        a.push_str(r, "a longer string than before");
        assert_eq!(a.string_width(r), 32);
        assert_eq!(a.get_str(r, 1), "ab", "existing strings survive widening");
        assert_eq!(a.get_str(r, 2), "a longer string than before");

        a.set_str(r, 0, "xyz");
        assert_eq!(a.get_str(r, 0), "xyz");
        a.remove_str(r, 1);
        assert_eq!(a.strings_len(r), 2);
        assert_eq!(a.get_str(r, 1), "a longer string than before");
    }

    #[test]
    fn string_leaf_sorted_lookup() {
        let mut a = Arena::new();
        let r = a.new_strings();
        for s in ["ada", "bob", "eve"] {
            a.push_str(r, s);
        }
        assert_eq!(a.lower_bound_str(r, "ada"), 0);
        assert_eq!(a.lower_bound_str(r, "bob"), 1);
        assert_eq!(a.lower_bound_str(r, "carl"), 2);
        assert_eq!(a.lower_bound_str(r, "zoe"), 3);
        assert_eq!(a.find_str(r, "eve", 0, 3), Some(2));
    }

    #[test]
    fn blob_splice() {
        let mut a = Arena::new();
        let r = a.new_blob();
        a.blob_splice(r, 0, 0, b"hello world");
        assert_eq!(a.blob_len(r), 11);
        a.blob_splice(r, 5, 11, b"!");
        assert_eq!(a.blob_slice(r, 0, a.blob_len(r)), b"hello!");
    }

    #[test]
    fn pair_lower_bound() {
        let mut a = Arena::new();
        let values = a.new_ints();
        let rows = a.new_ints();
        for (v, row) in [(3, 0), (3, 4), (5, 1), (9, 2)] {
            a.push_int(values, v);
            a.push_int(rows, row);
        }
        assert_eq!(a.lower_bound_pair(values, rows, 3, 0), 0);
        assert_eq!(a.lower_bound_pair(values, rows, 3, 2), 1);
        assert_eq!(a.lower_bound_pair(values, rows, 4, 0), 2);
        assert_eq!(a.lower_bound_pair(values, rows, 10, 0), 4);
    }
}
