//! Parse-tree types for the query language.
//!
//! The string parser itself is an external collaborator consumed through
//! [`QueryParser`](crate::query::QueryParser); the evaluator takes these
//! tagged variants as input. All times are nanoseconds.

use crate::models::WhereClause;

/// One parsed query.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedQuery {
    /// `SELECT tags [WHERE ...]`
    Select {
        tags: Vec<String>,
        where_clause: WhereClause,
    },
    /// `SELECT DISTINCT tag [WHERE ...]`
    Distinct {
        tag: String,
        where_clause: WhereClause,
    },
    /// `... DATA ...` against the streams selected by the where clause.
    Data(DataParams),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataParams {
    pub where_clause: WhereClause,
    pub selector: DataSelector,
    pub shape: DataShape,
}

/// Which points are addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSelector {
    /// `DATA IN [start, end)`.
    In { start: i64, end: i64 },
    /// Nearest point before `t`.
    Before(i64),
    /// Nearest point at/after `t`.
    After(i64),
}

/// How the addressed points are shaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataShape {
    Raw,
    /// Power-of-two aligned windows of `2^pointwidth` ns.
    Statistical { pointwidth: u8 },
    /// Arbitrary windows of `width` ns.
    Window { width: u64 },
    /// Ranges changed between two generations.
    Changed {
        from_gen: u64,
        to_gen: u64,
        resolution: u8,
    },
}
