use crate::entity::{Entity, KEY_PROPERTY, Value};
use crate::query::{NativeFilter, NativeOp, QuerySpec};
use std::cmp::Ordering;

/// Returns the value of the first filter matching `(column, op)`, if any.
pub fn get_filter<'a>(spec: &'a QuerySpec, column: &str, op: NativeOp) -> Option<&'a Value> {
    spec.filters
        .iter()
        .find(|f| f.column == column && f.op == op)
        .map(|f| &f.value)
}

pub fn has_filter(spec: &QuerySpec, column: &str, op: NativeOp) -> bool {
    get_filter(spec, column, op).is_some()
}

/// Re-checks an entity against every filter of a native query. Used to
/// drop results that drifted out of their originating branch between plan
/// and execution under eventual consistency.
pub fn entity_matches_spec(entity: &Entity, spec: &QuerySpec) -> bool {
    spec.filters.iter().all(|f| filter_matches(entity, f))
}

fn filter_matches(entity: &Entity, filter: &NativeFilter) -> bool {
    let property = if filter.column == KEY_PROPERTY {
        Some(Value::Key(entity.key.clone()))
    } else {
        entity.get(&filter.column).cloned()
    };
    // An entity without the property never matches; NULL is stored
    // explicitly, not implied by absence.
    let Some(property) = property else {
        return false;
    };
    match &property {
        Value::List(elements) => elements
            .iter()
            .any(|element| scalar_matches(element, filter.op, &filter.value)),
        _ => scalar_matches(&property, filter.op, &filter.value),
    }
}

fn scalar_matches(property: &Value, op: NativeOp, target: &Value) -> bool {
    // A list-valued target is an IN-style multi-value equality filter.
    // Any other operator against a list matches nothing.
    if let Value::List(options) = target {
        return op == NativeOp::Eq
            && options
                .iter()
                .any(|option| compare_property_values(property, option) == Some(Ordering::Equal));
    }
    let Some(ordering) = compare_property_values(property, target) else {
        return false;
    };
    match op {
        NativeOp::Eq => ordering == Ordering::Equal,
        NativeOp::Gt => ordering == Ordering::Greater,
        NativeOp::Gte => ordering != Ordering::Less,
        NativeOp::Lt => ordering == Ordering::Less,
        NativeOp::Lte => ordering != Ordering::Greater,
    }
}

/// Value comparison with numeric coercion between integers and floats.
/// Falls back to the canonical cross-type ranking, which places `Null`
/// below everything so `> NULL` selects all non-null values.
pub fn compare_property_values(lhs: &Value, rhs: &Value) -> Option<Ordering> {
    match (lhs, rhs) {
        (Value::Integer(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
        (Value::Float(a), Value::Integer(b)) => a.partial_cmp(&(*b as f64)),
        _ => Some(lhs.cmp(rhs)),
    }
}
