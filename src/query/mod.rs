//! # Query Engine
//!
//! A query is an owned tree of predicate nodes evaluated against one table.
//! Conjuncts form a chain: each node holds the next condition as its child,
//! and a row matches the chain when every node accepts it.
//!
//! ## Evaluation
//!
//! `find_in(start, end)` returns the smallest matching row in `[start, end)`
//! or `end` when there is none. The conjunction uses short-circuit descent:
//! a node scans for its own next hit at `s`, asks its child to search from
//! `s`, and either confirms the row (child also matched at `s`) or restarts
//! from the child's hit. Children are only probed at rows the node itself
//! already accepted.
//!
//! Exact integer equality delegates to the column's `find`, which takes the
//! sorted index fast path when one exists. String nodes dispatch on the
//! column's runtime representation, so a query built before `optimize()`
//! keeps working after the column becomes an enum dictionary.
//!
//! ## Building
//!
//! ```ignore
//! let q = Query::new().greater(0, 10).less(0, 100);
//! let rows = q.find_all(&table)?;
//!
//! let either = Query::either(
//!     Query::new().equal_string(1, "ada"),
//!     Query::new().equal_string(1, "eve"),
//! );
//! ```

use eyre::{bail, ensure, Result};

use crate::columns::ColumnData;
use crate::schema::ColumnKind;
use crate::table::Table;

/// Integer comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntOp {
    Equal,
    NotEqual,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
}

impl IntOp {
    fn matches(self, value: i64, target: i64) -> bool {
        match self {
            IntOp::Equal => value == target,
            IntOp::NotEqual => value != target,
            IntOp::Greater => value > target,
            IntOp::GreaterEqual => value >= target,
            IntOp::Less => value < target,
            IntOp::LessEqual => value <= target,
        }
    }
}

/// String matching operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrOp {
    Equal,
    NotEqual,
    Contains,
    BeginsWith,
    EndsWith,
}

impl StrOp {
    fn matches(self, value: &str, target: &str) -> bool {
        match self {
            StrOp::Equal => value == target,
            StrOp::NotEqual => value != target,
            StrOp::Contains => value.contains(target),
            StrOp::BeginsWith => value.starts_with(target),
            StrOp::EndsWith => value.ends_with(target),
        }
    }
}

#[derive(Debug)]
enum NodeKind {
    Int {
        col: usize,
        op: IntOp,
        value: i64,
    },
    Str {
        col: usize,
        op: StrOp,
        value: String,
    },
    Or {
        lhs: Box<Node>,
        rhs: Box<Node>,
    },
}

#[derive(Debug)]
struct Node {
    kind: NodeKind,
    /// Next conjunct in the chain.
    child: Option<Box<Node>>,
}

impl Node {
    /// Smallest row in `[start, end)` satisfying this node and its child
    /// chain; `end` when none does.
    fn find_in(&self, table: &Table, start: usize, end: usize) -> Result<usize> {
        let mut s = start;
        while s < end {
            let hit = self.find_local(table, s, end)?;
            if hit == end {
                return Ok(end);
            }
            let Some(child) = &self.child else {
                return Ok(hit);
            };
            let a = child.find_in(table, hit, end)?;
            if a == hit {
                return Ok(hit);
            }
            // The child skipped ahead; restart this node from its hit.
            s = a;
        }
        Ok(end)
    }

    /// This node's own next hit, ignoring the child chain.
    fn find_local(&self, table: &Table, start: usize, end: usize) -> Result<usize> {
        match &self.kind {
            NodeKind::Int { col, op, value } => {
                let column = match table.column_data(*col)? {
                    ColumnData::Int(c) => c,
                    other => bail!(
                        "query compares integers against a {:?} column",
                        other.kind()
                    ),
                };
                if *op == IntOp::Equal {
                    // Exact match takes the column fast path (index-aware).
                    return Ok(column.find(*value, start, end).unwrap_or(end));
                }
                for s in start..end {
                    if op.matches(column.get(s)?, *value) {
                        return Ok(s);
                    }
                }
                Ok(end)
            }
            NodeKind::Str { col, op, value } => {
                match table.column_data(*col)? {
                    ColumnData::String(c) => {
                        if *op == StrOp::Equal {
                            return Ok(c.find(value, start, end).unwrap_or(end));
                        }
                        for s in start..end {
                            if op.matches(&c.get(s)?, value) {
                                return Ok(s);
                            }
                        }
                    }
                    ColumnData::StringEnum(c) => {
                        if *op == StrOp::Equal {
                            return Ok(c.find(value, start, end).unwrap_or(end));
                        }
                        for s in start..end {
                            if op.matches(&c.get(s)?, value) {
                                return Ok(s);
                            }
                        }
                    }
                    other => bail!(
                        "query compares strings against a {:?} column",
                        other.kind()
                    ),
                }
                Ok(end)
            }
            NodeKind::Or { lhs, rhs } => {
                let f1 = lhs.find_in(table, start, end)?;
                let f2 = rhs.find_in(table, start, end)?;
                Ok(f1.min(f2))
            }
        }
    }
}

/// An owned predicate tree over one table shape.
#[derive(Debug, Default)]
pub struct Query {
    root: Option<Box<Node>>,
}

impl Query {
    pub fn new() -> Self {
        Query { root: None }
    }

    fn push(mut self, kind: NodeKind) -> Self {
        let node = Box::new(Node { kind, child: None });
        let mut anchor = &mut self.root;
        while let Some(n) = anchor {
            anchor = &mut n.child;
        }
        *anchor = Some(node);
        self
    }

    // Integer conjuncts. `equal` also serves bool and date columns, which
    // share the integer representation.

    pub fn equal(self, col: usize, value: i64) -> Self {
        self.push(NodeKind::Int {
            col,
            op: IntOp::Equal,
            value,
        })
    }

    pub fn not_equal(self, col: usize, value: i64) -> Self {
        self.push(NodeKind::Int {
            col,
            op: IntOp::NotEqual,
            value,
        })
    }

    pub fn greater(self, col: usize, value: i64) -> Self {
        self.push(NodeKind::Int {
            col,
            op: IntOp::Greater,
            value,
        })
    }

    pub fn greater_equal(self, col: usize, value: i64) -> Self {
        self.push(NodeKind::Int {
            col,
            op: IntOp::GreaterEqual,
            value,
        })
    }

    pub fn less(self, col: usize, value: i64) -> Self {
        self.push(NodeKind::Int {
            col,
            op: IntOp::Less,
            value,
        })
    }

    pub fn less_equal(self, col: usize, value: i64) -> Self {
        self.push(NodeKind::Int {
            col,
            op: IntOp::LessEqual,
            value,
        })
    }

    // String conjuncts.

    pub fn equal_string(self, col: usize, value: &str) -> Self {
        self.push(NodeKind::Str {
            col,
            op: StrOp::Equal,
            value: value.to_owned(),
        })
    }

    pub fn not_equal_string(self, col: usize, value: &str) -> Self {
        self.push(NodeKind::Str {
            col,
            op: StrOp::NotEqual,
            value: value.to_owned(),
        })
    }

    pub fn contains(self, col: usize, value: &str) -> Self {
        self.push(NodeKind::Str {
            col,
            op: StrOp::Contains,
            value: value.to_owned(),
        })
    }

    pub fn begins_with(self, col: usize, value: &str) -> Self {
        self.push(NodeKind::Str {
            col,
            op: StrOp::BeginsWith,
            value: value.to_owned(),
        })
    }

    pub fn ends_with(self, col: usize, value: &str) -> Self {
        self.push(NodeKind::Str {
            col,
            op: StrOp::EndsWith,
            value: value.to_owned(),
        })
    }

    /// Disjunction of two sub-queries; further conjuncts chained onto the
    /// result apply to the whole disjunction. Both sides must be non-empty.
    pub fn either(a: Query, b: Query) -> Result<Query> {
        let (Some(lhs), Some(rhs)) = (a.root, b.root) else {
            bail!("both sides of a disjunction need at least one condition");
        };
        Ok(Query {
            root: Some(Box::new(Node {
                kind: NodeKind::Or { lhs, rhs },
                child: None,
            })),
        })
    }

    /// Smallest matching row at or after `start`, or None.
    pub fn find_from(&self, table: &Table, start: usize) -> Result<Option<usize>> {
        let end = table.size();
        ensure!(start <= end, "start {start} beyond table size {end}");
        let Some(root) = &self.root else {
            return Ok((start < end).then_some(start));
        };
        let hit = root.find_in(table, start, end)?;
        Ok((hit < end).then_some(hit))
    }

    pub fn find(&self, table: &Table) -> Result<Option<usize>> {
        self.find_from(table, 0)
    }

    /// Every matching row, ascending.
    pub fn find_all(&self, table: &Table) -> Result<Vec<usize>> {
        let mut hits = Vec::new();
        let mut start = 0;
        while let Some(hit) = self.find_from(table, start)? {
            hits.push(hit);
            start = hit + 1;
        }
        Ok(hits)
    }

    /// Number of matching rows.
    pub fn count(&self, table: &Table) -> Result<usize> {
        Ok(self.find_all(table)?.len())
    }
}

/// Queries touching bool or date columns go through the int operators; the
/// helpers below just make call sites read naturally.
impl Query {
    pub fn equal_bool(self, col: usize, value: bool) -> Self {
        self.equal(col, value as i64)
    }

    pub fn equal_date(self, col: usize, value: i64) -> Self {
        self.equal(col, value)
    }
}

// Type checks happen lazily during evaluation, but a malformed query should
// fail loudly even on an empty table; validate() exists for callers that
// want the check up front.
impl Query {
    /// Checks every node against the table's schema without scanning rows.
    pub fn validate(&self, table: &Table) -> Result<()> {
        fn walk(node: &Node, table: &Table) -> Result<()> {
            match &node.kind {
                NodeKind::Int { col, .. } => {
                    let kind = table.real_column_type(*col)?;
                    ensure!(
                        matches!(kind, ColumnKind::Int | ColumnKind::Bool | ColumnKind::Date),
                        "integer condition on {kind:?} column {col}"
                    );
                }
                NodeKind::Str { col, .. } => {
                    let kind = table.real_column_type(*col)?;
                    ensure!(
                        matches!(kind, ColumnKind::String | ColumnKind::StringEnum),
                        "string condition on {kind:?} column {col}"
                    );
                }
                NodeKind::Or { lhs, rhs } => {
                    walk(lhs, table)?;
                    walk(rhs, table)?;
                }
            }
            if let Some(child) = &node.child {
                walk(child, table)?;
            }
            Ok(())
        }
        if let Some(root) = &self.root {
            walk(root, table)?;
        }
        Ok(())
    }
}
