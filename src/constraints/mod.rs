//! Unique-constraint emulation.
//!
//! The backing store has no database-level uniqueness. Each existing
//! constraint value is represented by a marker entity under a reserved
//! kind, keyed by a deterministic identifier derived from the model's
//! constraint declarations and the entity's property values. Checking a
//! constraint before a write is then a cheap get by key.

pub mod identifiers;

use crate::entity::{Entity, Value};
use crate::error::TrellisError;
use crate::key::Key;
use crate::model::Model;
use crate::transaction::{TransactionOptions, TransactionStack};
use chrono::Utc;
use self::identifiers::{
    fields_from_identifier, kind_from_identifier, unique_identifiers_from_entity,
};
use std::collections::BTreeSet;

/// Reserved kind for marker entities. The key name is the constraint
/// identifier; the layout is load-bearing for interoperability with any
/// marker data already in the store.
pub const UNIQUE_MARKER_KIND: &str = "uniquemarker";

/// Marker property referencing the owning entity; null marks the marker
/// stale and claimable.
pub const INSTANCE_PROPERTY: &str = "instance";

pub const UPDATED_AT_PROPERTY: &str = "updated_at";

pub fn marker_key(identifier: &str, namespace: &str) -> Key {
    Key::with_name(UNIQUE_MARKER_KIND, identifier, namespace)
}

pub fn marker_keys_for_identifiers<'a>(
    identifiers: impl IntoIterator<Item = &'a String>,
    namespace: &str,
) -> Vec<Key> {
    identifiers
        .into_iter()
        .map(|identifier| marker_key(identifier, namespace))
        .collect()
}

fn violation_for_marker(marker_name: &str) -> TrellisError {
    TrellisError::UniqueViolation {
        table: kind_from_identifier(marker_name).to_string(),
        fields: fields_from_identifier(marker_name).join(", "),
    }
}

fn marker_name(key: &Key) -> String {
    match key.id_or_name() {
        Some(id) => id.to_string(),
        None => String::new(),
    }
}

/// Computes the marker keys for an entity's current property values,
/// optionally refetching the entity first. The refetch guards callers
/// holding a possibly-stale copy; an entity that vanished between plan
/// and execution surfaces as a data error.
pub fn marker_keys_for_entity(
    txns: &TransactionStack,
    model: &Model,
    entity: &Entity,
    namespace: &str,
    refetch: bool,
) -> Result<Vec<Key>, TrellisError> {
    let current;
    let entity = if refetch {
        match txns.get(&entity.key)? {
            Some(fresh) => {
                current = fresh;
                &current
            }
            None => return Err(TrellisError::Data("entity no longer exists".into())),
        }
    } else {
        entity
    };
    let identifiers = unique_identifiers_from_entity(model, entity, true);
    Ok(marker_keys_for_identifiers(identifiers.iter(), namespace))
}

/// Attempts to acquire every marker the entity's property values need.
///
/// Runs in an independent transaction so marker writes never count
/// against the enclosing transaction's mutation ceiling. A missing marker
/// is created live; a stale one (no instance, or an instance that no
/// longer exists) is claimed; a live marker owned by another entity fails
/// with a unique violation naming the kind and fields parsed back out of
/// the marker key.
///
/// Returns the keys of every marker touched, so a later failure in the
/// outer transaction can trigger a compensating release.
pub fn acquire_markers(
    txns: &TransactionStack,
    model: &Model,
    entity: &Entity,
    namespace: &str,
) -> Result<Vec<Key>, TrellisError> {
    let mut acquired: Vec<Key> = Vec::new();
    txns.atomic(TransactionOptions::independent(), || {
        let wanted = marker_keys_for_entity(txns, model, entity, namespace, false)?;
        let existing = txns.get_multi(&wanted)?;
        let found: BTreeSet<Key> = existing.iter().map(|m| m.key.clone()).collect();

        for key in wanted.iter().filter(|key| !found.contains(*key)) {
            let mut marker = Entity::new(key.clone());
            stamp_marker(&mut marker, entity);
            txns.put(marker)?;
            acquired.push(key.clone());
        }

        for mut marker in existing {
            let claim = match marker.get(INSTANCE_PROPERTY) {
                None | Some(Value::Null) => true,
                Some(Value::Key(owner)) if *owner == entity.key => false,
                Some(Value::Key(owner)) => {
                    // The marker points elsewhere; it is only a conflict
                    // while that entity still exists.
                    if txns.get(owner)?.is_some() {
                        return Err(violation_for_marker(&marker_name(&marker.key)));
                    }
                    true
                }
                Some(_) => true,
            };
            if claim {
                stamp_marker(&mut marker, entity);
                let key = marker.key.clone();
                txns.put(marker)?;
                acquired.push(key);
            }
        }
        Ok(())
    })?;
    Ok(acquired)
}

fn stamp_marker(marker: &mut Entity, owner: &Entity) {
    marker.set(INSTANCE_PROPERTY, Value::Key(owner.key.clone()));
    marker.set(UPDATED_AT_PROPERTY, Value::Timestamp(Utc::now()));
}

/// Deletes the given marker keys inside an independent transaction.
pub fn release_markers(txns: &TransactionStack, marker_keys: &[Key]) -> Result<(), TrellisError> {
    txns.atomic(TransactionOptions::independent(), || {
        txns.delete(marker_keys)
    })
}

/// Deletes every marker the entity's current property values produce.
/// Callers decide the propagation policy; a post-delete cleanup catches
/// and logs this instead of failing the owning operation.
pub fn release_markers_for_entity(
    txns: &TransactionStack,
    model: &Model,
    entity: &Entity,
    namespace: &str,
    refetch: bool,
) -> Result<(), TrellisError> {
    txns.atomic(TransactionOptions::default(), || {
        let keys = marker_keys_for_entity(txns, model, entity, namespace, refetch)?;
        txns.delete(&keys)
    })
}

/// Pre-flight pass over a batch of entities about to be inserted
/// together. Markers put in one transaction cannot see each other through
/// gets, so duplicates inside the same batch must be caught from the
/// in-memory property values before any marker RPC happens.
pub fn check_markers_in_memory(model: &Model, entities: &[Entity]) -> Result<(), TrellisError> {
    let mut seen: BTreeSet<String> = BTreeSet::new();
    for entity in entities {
        for identifier in unique_identifiers_from_entity(model, entity, true) {
            if !seen.insert(identifier.clone()) {
                return Err(violation_for_marker(&identifier));
            }
        }
    }
    Ok(())
}
