pub mod dnf;
pub mod error;
pub mod keyed;
pub mod merge;
pub mod planner;
pub mod utils;

use crate::entity::Value;
use serde::{Deserialize, Serialize};

/// Caller-facing filter operator set. `In` and `Range` exist only before
/// normalization; the normalizer expands them away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOp {
    Eq,
    Gt,
    Gte,
    Lt,
    Lte,
    IsNull,
    In,
    Range,
}

/// A boolean filter tree over entity properties. The identity column is
/// addressed as `__key__`, or as the model's primary-key column which the
/// planner rewrites.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FilterNode {
    Leaf {
        column: String,
        op: FilterOp,
        value: Value,
    },
    And(Vec<FilterNode>),
    Or(Vec<FilterNode>),
    Not(Box<FilterNode>),
}

impl FilterNode {
    fn leaf(column: &str, op: FilterOp, value: impl Into<Value>) -> Self {
        FilterNode::Leaf {
            column: column.to_string(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(column: &str, value: impl Into<Value>) -> Self {
        Self::leaf(column, FilterOp::Eq, value)
    }

    pub fn gt(column: &str, value: impl Into<Value>) -> Self {
        Self::leaf(column, FilterOp::Gt, value)
    }

    pub fn gte(column: &str, value: impl Into<Value>) -> Self {
        Self::leaf(column, FilterOp::Gte, value)
    }

    pub fn lt(column: &str, value: impl Into<Value>) -> Self {
        Self::leaf(column, FilterOp::Lt, value)
    }

    pub fn lte(column: &str, value: impl Into<Value>) -> Self {
        Self::leaf(column, FilterOp::Lte, value)
    }

    pub fn isnull(column: &str, null: bool) -> Self {
        Self::leaf(column, FilterOp::IsNull, Value::Boolean(null))
    }

    pub fn in_list(column: &str, values: Vec<Value>) -> Self {
        Self::leaf(column, FilterOp::In, Value::List(values))
    }

    /// Inclusive range over both bounds; compose `gt`/`lt` leaves directly
    /// for exclusive bounds.
    pub fn range(column: &str, low: impl Into<Value>, high: impl Into<Value>) -> Self {
        Self::leaf(
            column,
            FilterOp::Range,
            Value::List(vec![low.into(), high.into()]),
        )
    }

    pub fn and(children: Vec<FilterNode>) -> Self {
        FilterNode::And(children)
    }

    pub fn or(children: Vec<FilterNode>) -> Self {
        FilterNode::Or(children)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        FilterNode::Not(Box::new(self))
    }
}

/// Operator set the backing engine executes natively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NativeOp {
    Eq,
    Gt,
    Gte,
    Lt,
    Lte,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NativeFilter {
    pub column: String,
    pub op: NativeOp,
    pub value: Value,
}

/// One ordering column; a leading `-` in the parsed form means descending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderColumn {
    pub column: String,
    pub descending: bool,
}

impl OrderColumn {
    pub fn asc(column: &str) -> Self {
        Self {
            column: column.to_string(),
            descending: false,
        }
    }

    pub fn desc(column: &str) -> Self {
        Self {
            column: column.to_string(),
            descending: true,
        }
    }

    pub fn parse(spec: &str) -> Self {
        match spec.strip_prefix('-') {
            Some(column) => Self::desc(column),
            None => Self::asc(spec),
        }
    }
}

/// A single native query: the unit of work the backing engine can run.
/// One is built per AND-branch of a normalized filter tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuerySpec {
    pub kind: String,
    pub namespace: String,
    pub filters: Vec<NativeFilter>,
    pub ordering: Vec<OrderColumn>,
    pub projection: Vec<String>,
    pub distinct_on: Vec<String>,
    pub keys_only: bool,
    pub ancestor: Option<crate::key::Key>,
}

impl QuerySpec {
    pub fn new(kind: &str, namespace: &str) -> Self {
        Self {
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            filters: Vec::new(),
            ordering: Vec::new(),
            projection: Vec::new(),
            distinct_on: Vec::new(),
            keys_only: false,
            ancestor: None,
        }
    }

    pub fn add_filter(&mut self, column: &str, op: NativeOp, value: Value) {
        self.filters.push(NativeFilter {
            column: column.to_string(),
            op,
            value,
        });
    }

    pub fn replace_filter(&mut self, column: &str, op: NativeOp, value: Value) {
        for filter in &mut self.filters {
            if filter.column == column && filter.op == op {
                filter.value = value;
                return;
            }
        }
        self.add_filter(column, op, value);
    }
}
