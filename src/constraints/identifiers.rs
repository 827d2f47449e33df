use crate::entity::{Entity, KEY_PROPERTY, Value};
use crate::key::KeyId;
use crate::model::Model;
use crate::query::utils::get_filter;
use crate::query::{NativeOp, QuerySpec};
use sha2::{Digest, Sha256};

/// Formats one value for inclusion in a marker identifier. String content
/// is hashed to bound the resulting key-name length; other scalars are
/// stringified directly.
pub fn format_value_for_identifier(value: &Value) -> String {
    match value {
        Value::Text(text) => hex_string(Sha256::digest(text.as_bytes()).as_slice()),
        Value::Blob(bytes) => hex_string(Sha256::digest(bytes).as_slice()),
        Value::Boolean(flag) => flag.to_string(),
        Value::Integer(integer) => integer.to_string(),
        Value::Float(float) => float.to_string(),
        Value::Timestamp(stamp) => stamp.timestamp_micros().to_string(),
        Value::Key(key) => match key.id_or_name() {
            Some(KeyId::Id(id)) => id.to_string(),
            Some(KeyId::Name(name)) => hex_string(Sha256::digest(name.as_bytes()).as_slice()),
            None => String::new(),
        },
        Value::Null => String::new(),
        Value::List(_) => String::new(),
    }
}

fn hex_string(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

fn pk_value(entity: &Entity) -> Value {
    match entity.key.id_or_name() {
        Some(KeyId::Id(id)) => Value::Integer(*id),
        Some(KeyId::Name(name)) => Value::Text(name.clone()),
        None => Value::Null,
    }
}

/// Computes every unique marker identifier the entity's current property
/// values produce: one per unique field and per unique-together group,
/// shaped `{top_concrete_table}|{field}:{encoded}|{field2}:{encoded2}`.
///
/// A combination contributing a null value (or an empty list) is skipped
/// entirely; null values never participate in uniqueness. A list-valued
/// field fans the combination out into one identifier per element.
pub fn unique_identifiers_from_entity(
    model: &Model,
    entity: &Entity,
    ignore_pk: bool,
) -> Vec<String> {
    let mut identifiers = Vec::new();
    for combination in model.unique_combinations(ignore_pk) {
        let mut segment_sets: Vec<Vec<String>> = vec![Vec::new()];
        let mut include = true;

        for column in &combination {
            let is_pk = model
                .field_by_column(column)
                .is_some_and(|f| f.is_primary_key());
            let value = if is_pk {
                pk_value(entity)
            } else {
                entity.get(column).cloned().unwrap_or(Value::Null)
            };

            if value.is_null() {
                include = false;
                break;
            }
            let scalars = match value {
                Value::List(elements) if elements.is_empty() => {
                    include = false;
                    break;
                }
                Value::List(elements) => elements,
                scalar => vec![scalar],
            };

            let mut grown = Vec::with_capacity(segment_sets.len() * scalars.len());
            for existing in &segment_sets {
                for scalar in &scalars {
                    let mut segments = existing.clone();
                    segments.push(format!(
                        "{column}:{}",
                        format_value_for_identifier(scalar)
                    ));
                    grown.push(segments);
                }
            }
            segment_sets = grown;
        }

        if include {
            for segments in segment_sets {
                identifiers.push(format!(
                    "{}|{}",
                    model.top_concrete_table(),
                    segments.join("|")
                ));
            }
        }
    }
    identifiers
}

/// Kind prefix parsed back out of a marker identifier.
pub fn kind_from_identifier(identifier: &str) -> &str {
    identifier.split('|').next().unwrap_or(identifier)
}

/// Field names parsed back out of a marker identifier, in identifier
/// order.
pub fn fields_from_identifier(identifier: &str) -> Vec<String> {
    identifier
        .split('|')
        .skip(1)
        .map(|segment| segment.split(':').next().unwrap_or(segment).to_string())
        .collect()
}

/// If the query's single branch filters exactly on a declared unique
/// constraint combination (all equality, no nulls), returns the marker
/// identifier that combination produces; otherwise `None`. A multi-branch
/// query is by definition not unique.
pub fn query_is_unique(model: &Model, spec: &QuerySpec) -> Option<String> {
    for combination in model.unique_combinations(false) {
        let mut segments = Vec::with_capacity(combination.len());
        let mut matched = true;
        for column in &combination {
            let is_pk = model
                .field_by_column(column)
                .is_some_and(|f| f.is_primary_key());
            let filter_column = if is_pk { KEY_PROPERTY } else { column.as_str() };
            let Some(value) = get_filter(spec, filter_column, NativeOp::Eq) else {
                matched = false;
                break;
            };
            // Multiple NULL values are not unique, and a coalesced
            // multi-value filter is not a point lookup.
            if value.is_null() || matches!(value, Value::List(_)) {
                matched = false;
                break;
            }
            let encoded = if is_pk {
                match value.as_key().and_then(|k| k.id_or_name()) {
                    Some(KeyId::Id(id)) => id.to_string(),
                    Some(KeyId::Name(name)) => {
                        format_value_for_identifier(&Value::Text(name.clone()))
                    }
                    None => {
                        matched = false;
                        break;
                    }
                }
            } else {
                format_value_for_identifier(value)
            };
            segments.push(format!("{column}:{encoded}"));
        }
        if matched && !segments.is_empty() {
            return Some(format!(
                "{}|{}",
                model.top_concrete_table(),
                segments.join("|")
            ));
        }
    }
    None
}
