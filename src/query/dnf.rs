use crate::entity::Value;
use crate::error::TrellisError;
use crate::query::error::QueryError;
use crate::query::{FilterNode, FilterOp};

/// A leaf filter surviving normalization: only `Eq/Gt/Gte/Lt/Lte/IsNull`
/// remain once `In` and `Range` have been expanded.
#[derive(Debug, Clone, PartialEq)]
pub struct BranchFilter {
    pub column: String,
    pub op: FilterOp,
    pub value: Value,
}

/// One AND-conjunction of leaf filters.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Branch {
    pub filters: Vec<BranchFilter>,
}

/// Disjunctive normal form: an OR of AND-branches. Zero branches means a
/// provably empty result set (an `IN ()` somewhere in the tree).
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedQuery {
    pub branches: Vec<Branch>,
}

impl NormalizedQuery {
    /// Round-trips the DNF back into a filter tree. Normalizing the
    /// produced tree yields the same branches again.
    pub fn to_tree(&self) -> FilterNode {
        FilterNode::Or(
            self.branches
                .iter()
                .map(|branch| {
                    FilterNode::And(
                        branch
                            .filters
                            .iter()
                            .map(|f| FilterNode::Leaf {
                                column: f.column.clone(),
                                op: f.op,
                                value: f.value.clone(),
                            })
                            .collect(),
                    )
                })
                .collect(),
        )
    }
}

/// Converts an arbitrary filter tree into DNF. `In` leaves expand into one
/// OR-branch per value, `Range` into a bound conjunction, and negation is
/// pushed down to the leaves. Expansion beyond `max_branches` is rejected.
pub fn normalize(tree: &FilterNode, max_branches: usize) -> Result<NormalizedQuery, TrellisError> {
    let expanded = expand(tree, false)?;
    let branches = cross_product(&expanded, max_branches)?;
    Ok(NormalizedQuery { branches })
}

/// Expands `In`/`Range` and pushes `Not` down. The result contains only
/// `And`, `Or` and restricted leaves.
fn expand(node: &FilterNode, negated: bool) -> Result<FilterNode, QueryError> {
    match node {
        FilterNode::Not(inner) => expand(inner, !negated),
        FilterNode::And(children) => {
            if negated {
                // NOT(a AND b) introduces an OR of negations, which the
                // engine cannot run as independent branches.
                return Err(QueryError::UnsupportedNegation {
                    reason: "negating a conjunction requires OR branches".into(),
                });
            }
            let expanded = children
                .iter()
                .map(|c| expand(c, false))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(FilterNode::And(expanded))
        }
        FilterNode::Or(children) => {
            let expanded = children
                .iter()
                .map(|c| expand(c, negated))
                .collect::<Result<Vec<_>, _>>()?;
            if negated {
                // De Morgan: NOT(a OR b) == NOT a AND NOT b.
                Ok(FilterNode::And(expanded))
            } else {
                Ok(FilterNode::Or(expanded))
            }
        }
        FilterNode::Leaf { column, op, value } => expand_leaf(column, *op, value, negated),
    }
}

fn expand_leaf(
    column: &str,
    op: FilterOp,
    value: &Value,
    negated: bool,
) -> Result<FilterNode, QueryError> {
    if negated {
        let flipped = match op {
            FilterOp::Gt => FilterOp::Lte,
            FilterOp::Gte => FilterOp::Lt,
            FilterOp::Lt => FilterOp::Gte,
            FilterOp::Lte => FilterOp::Gt,
            FilterOp::IsNull => {
                let Value::Boolean(null) = value else {
                    return Err(QueryError::MalformedFilter {
                        reason: format!("isnull on '{column}' requires a boolean value"),
                    });
                };
                return Ok(FilterNode::isnull(column, !null));
            }
            FilterOp::Eq | FilterOp::In | FilterOp::Range => {
                return Err(QueryError::UnsupportedNegation {
                    reason: format!(
                        "cannot negate equality-shaped filter on '{column}' without OR branches"
                    ),
                });
            }
        };
        return Ok(FilterNode::Leaf {
            column: column.to_string(),
            op: flipped,
            value: value.clone(),
        });
    }

    match op {
        FilterOp::In => {
            let Value::List(values) = value else {
                return Err(QueryError::MalformedFilter {
                    reason: format!("IN on '{column}' requires a list value"),
                });
            };
            let mut seen = Vec::new();
            for v in values {
                if !seen.contains(v) {
                    seen.push(v.clone());
                }
            }
            Ok(FilterNode::Or(
                seen.into_iter()
                    .map(|v| FilterNode::Leaf {
                        column: column.to_string(),
                        op: FilterOp::Eq,
                        value: v,
                    })
                    .collect(),
            ))
        }
        FilterOp::Range => {
            let Value::List(bounds) = value else {
                return Err(QueryError::MalformedFilter {
                    reason: format!("range on '{column}' requires a two-element list"),
                });
            };
            let [low, high] = bounds.as_slice() else {
                return Err(QueryError::MalformedFilter {
                    reason: format!("range on '{column}' requires a two-element list"),
                });
            };
            Ok(FilterNode::And(vec![
                FilterNode::Leaf {
                    column: column.to_string(),
                    op: FilterOp::Gte,
                    value: low.clone(),
                },
                FilterNode::Leaf {
                    column: column.to_string(),
                    op: FilterOp::Lte,
                    value: high.clone(),
                },
            ]))
        }
        FilterOp::IsNull => {
            let Value::Boolean(_) = value else {
                return Err(QueryError::MalformedFilter {
                    reason: format!("isnull on '{column}' requires a boolean value"),
                });
            };
            Ok(FilterNode::Leaf {
                column: column.to_string(),
                op,
                value: value.clone(),
            })
        }
        _ => Ok(FilterNode::Leaf {
            column: column.to_string(),
            op,
            value: value.clone(),
        }),
    }
}

/// Distributes AND over OR, producing the branch list. An OR with no
/// children contributes zero branches and annihilates any conjunction it
/// participates in.
fn cross_product(node: &FilterNode, max_branches: usize) -> Result<Vec<Branch>, TrellisError> {
    let branches = match node {
        FilterNode::Leaf { column, op, value } => vec![Branch {
            filters: vec![BranchFilter {
                column: column.clone(),
                op: *op,
                value: value.clone(),
            }],
        }],
        FilterNode::Or(children) => {
            let mut branches = Vec::new();
            for child in children {
                branches.extend(cross_product(child, max_branches)?);
                check_ceiling(branches.len(), max_branches)?;
            }
            branches
        }
        FilterNode::And(children) => {
            let mut branches = vec![Branch::default()];
            for child in children {
                let child_branches = cross_product(child, max_branches)?;
                let mut combined = Vec::with_capacity(branches.len() * child_branches.len().max(1));
                for existing in &branches {
                    for addition in &child_branches {
                        let mut merged = existing.clone();
                        merged.filters.extend(addition.filters.iter().cloned());
                        combined.push(merged);
                    }
                }
                check_ceiling(combined.len(), max_branches)?;
                branches = combined;
            }
            branches
        }
        FilterNode::Not(_) => {
            return Err(QueryError::UnsupportedNegation {
                reason: "negation survived expansion".into(),
            }
            .into());
        }
    };
    Ok(branches)
}

fn check_ceiling(count: usize, max_branches: usize) -> Result<(), TrellisError> {
    if count > max_branches {
        return Err(TrellisError::NotSupported(format!(
            "query expands to {count} OR branches, more than the {max_branches} allowed"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::normalize;
    use crate::entity::Value;
    use crate::error::TrellisError;
    use crate::query::{FilterNode, FilterOp};

    #[test]
    fn in_expands_to_one_branch_per_value() {
        let tree = FilterNode::in_list(
            "field1",
            vec![Value::Integer(1), Value::Integer(2), Value::Integer(2)],
        );
        let normalized = normalize(&tree, 100).expect("normalize");
        // Duplicate values collapse.
        assert_eq!(normalized.branches.len(), 2);
        for branch in &normalized.branches {
            assert_eq!(branch.filters.len(), 1);
            assert_eq!(branch.filters[0].op, FilterOp::Eq);
        }
    }

    #[test]
    fn range_expands_to_a_bound_conjunction() {
        let tree = FilterNode::range("age", 18i64, 65i64);
        let normalized = normalize(&tree, 100).expect("normalize");
        assert_eq!(normalized.branches.len(), 1);
        let ops: Vec<_> = normalized.branches[0].filters.iter().map(|f| f.op).collect();
        assert_eq!(ops, vec![FilterOp::Gte, FilterOp::Lte]);
    }

    #[test]
    fn and_distributes_over_or() {
        let tree = FilterNode::and(vec![
            FilterNode::eq("a", 1i64),
            FilterNode::or(vec![FilterNode::eq("b", 2i64), FilterNode::eq("b", 3i64)]),
        ]);
        let normalized = normalize(&tree, 100).expect("normalize");
        assert_eq!(normalized.branches.len(), 2);
        for branch in &normalized.branches {
            assert_eq!(branch.filters.len(), 2);
            assert_eq!(branch.filters[0].column, "a");
        }
    }

    #[test]
    fn negated_or_applies_de_morgan() {
        let tree = FilterNode::or(vec![
            FilterNode::gt("a", 5i64),
            FilterNode::lt("a", 1i64),
        ])
        .not();
        let normalized = normalize(&tree, 100).expect("normalize");
        assert_eq!(normalized.branches.len(), 1);
        let ops: Vec<_> = normalized.branches[0].filters.iter().map(|f| f.op).collect();
        assert_eq!(ops, vec![FilterOp::Lte, FilterOp::Gte]);
    }

    #[test]
    fn negated_equality_is_rejected() {
        let tree = FilterNode::eq("a", 1i64).not();
        let err = normalize(&tree, 100).expect_err("must fail");
        assert!(matches!(err, TrellisError::Query(_)));
    }

    #[test]
    fn negated_isnull_flips() {
        let tree = FilterNode::isnull("a", true).not();
        let normalized = normalize(&tree, 100).expect("normalize");
        assert_eq!(
            normalized.branches[0].filters[0].value,
            Value::Boolean(false)
        );
    }

    #[test]
    fn empty_in_produces_zero_branches() {
        let tree = FilterNode::and(vec![
            FilterNode::eq("a", 1i64),
            FilterNode::in_list("b", vec![]),
        ]);
        let normalized = normalize(&tree, 100).expect("normalize");
        assert!(normalized.branches.is_empty());
    }

    #[test]
    fn branch_ceiling_is_enforced() {
        let values: Vec<Value> = (0..11).map(Value::Integer).collect();
        let tree = FilterNode::in_list("field1", values);
        let err = normalize(&tree, 10).expect_err("must fail");
        assert!(matches!(err, TrellisError::NotSupported(_)));
    }

    #[test]
    fn normalization_is_idempotent() {
        let tree = FilterNode::and(vec![
            FilterNode::in_list("a", vec![Value::Integer(1), Value::Integer(2)]),
            FilterNode::gte("b", 10i64),
        ]);
        let first = normalize(&tree, 100).expect("normalize");
        let second = normalize(&first.to_tree(), 100).expect("renormalize");
        assert_eq!(first, second);
    }
}
