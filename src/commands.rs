use crate::Connection;
use crate::constraints::{
    acquire_markers, check_markers_in_memory, marker_keys_for_identifiers,
    release_markers, release_markers_for_entity,
};
use crate::constraints::identifiers::unique_identifiers_from_entity;
use crate::entity::{Entity, POLYMODEL_CLASS_PROPERTY, Value};
use crate::error::TrellisError;
use crate::key::{Key, KeyId};
use crate::model::{Model, has_active_unique_constraints};
use crate::query::planner::{ExecutionPlan, SelectQuery};
use crate::query::utils::entity_matches_spec;
use crate::query::{FilterNode, QuerySpec};
use crate::transaction::TransactionOptions;
use tracing::warn;

/// Inserts a batch of entities in one transaction: identity validation,
/// in-memory constraint pre-flight, id allocation for partial keys,
/// marker acquisition and the entity puts. A failure after markers were
/// acquired triggers a compensating release, since the independent marker
/// transactions have already committed.
pub struct InsertCommand<'a> {
    model: &'a Model,
    entities: Vec<Entity>,
}

impl<'a> InsertCommand<'a> {
    pub fn new(
        conn: &Connection,
        model: &'a Model,
        entities: Vec<Entity>,
    ) -> Result<Self, TrellisError> {
        let entities: Vec<Entity> = entities
            .into_iter()
            .map(|mut entity| {
                entity.key = entity.key.in_namespace(&conn.namespace);
                entity
            })
            .collect();
        for entity in &entities {
            match entity.key.id_or_name() {
                Some(KeyId::Id(0)) => {
                    return Err(TrellisError::Integrity(
                        "the datastore does not support 0 as a key value".into(),
                    ));
                }
                Some(KeyId::Name(name)) if name.starts_with("__") => {
                    return Err(TrellisError::NotSupported(format!(
                        "datastore ids cannot start with __, got '{name}'"
                    )));
                }
                _ => {}
            }
        }
        Ok(Self { model, entities })
    }

    pub fn execute(&self, conn: &Connection) -> Result<Vec<Key>, TrellisError> {
        let constraints_active = has_active_unique_constraints(&conn.config, self.model);
        if constraints_active {
            check_markers_in_memory(self.model, &self.entities)?;
        }

        let txns = conn.transactions();
        let mut acquired: Vec<Key> = Vec::new();
        let result = txns.atomic(TransactionOptions::default(), || {
            let mut inserted = Vec::with_capacity(self.entities.len());
            for entity in &self.entities {
                let mut entity = entity.clone();
                if entity.key.is_partial() {
                    entity.key = entity.key.completed(conn.store().allocate_id()?);
                } else if txns.get(&entity.key)?.is_some() {
                    return Err(TrellisError::DuplicateKey {
                        table: entity.key.kind.to_string(),
                        key: entity.key.to_string(),
                    });
                }
                if constraints_active {
                    acquired.extend(acquire_markers(
                        txns,
                        self.model,
                        &entity,
                        &conn.namespace,
                    )?);
                }
                txns.put(entity.clone())?;
                inserted.push(entity.key);
            }
            Ok(inserted)
        });

        if result.is_err() && !acquired.is_empty() {
            if let Err(release_error) = release_markers(txns, &acquired) {
                warn!(error = %release_error, "failed to release markers after aborted insert");
            }
        }
        result
    }
}

/// Applies a property update to every entity matched by the filter.
/// Work is chunked by the transaction entity ceiling; within a chunk the
/// update is all-or-nothing.
pub struct UpdateCommand<'a> {
    model: &'a Model,
    filter: Option<FilterNode>,
    values: Vec<(String, Value)>,
}

impl<'a> UpdateCommand<'a> {
    pub fn new(
        model: &'a Model,
        filter: Option<FilterNode>,
        values: Vec<(String, Value)>,
    ) -> Self {
        Self {
            model,
            filter,
            values,
        }
    }

    fn select(&self, conn: &Connection) -> SelectQuery<'a> {
        let mut select = SelectQuery::new(self.model, &conn.namespace).keys_only();
        if let Some(filter) = &self.filter {
            select = select.filter(filter.clone());
        }
        select
    }

    pub fn execute(&self, conn: &Connection) -> Result<usize, TrellisError> {
        let select = self.select(conn);
        let keys: Vec<Key> = select
            .fetch(conn)?
            .into_iter()
            .map(|entity| entity.key)
            .collect();

        // Eventual consistency may hand back keys whose entities no
        // longer match; single-query and unique plans re-validate each
        // row inside the transaction. Key lookups already did.
        let revalidate: Option<QuerySpec> = match select.plan(&conn.config)? {
            ExecutionPlan::Single(spec) => Some(spec),
            ExecutionPlan::Unique(lookup) => Some(lookup.spec().clone()),
            _ => None,
        };

        let constraints_active = has_active_unique_constraints(&conn.config, self.model);
        let txns = conn.transactions();
        let mut updated = 0usize;

        for chunk in keys.chunks(conn.config.transaction_entity_limit.max(1)) {
            let mut acquired: Vec<Key> = Vec::new();
            let mut stale: Vec<Key> = Vec::new();
            let mut touched: Vec<Key> = Vec::new();

            let result = txns.atomic(TransactionOptions::default(), || {
                let mut count = 0usize;
                for key in chunk {
                    let Some(existing) = txns.get(key)? else {
                        continue;
                    };
                    if let Some(spec) = &revalidate
                        && !entity_matches_spec(&existing, spec)
                    {
                        continue;
                    }

                    let mut next = existing.clone();
                    for (column, value) in &self.values {
                        next.set(column.clone(), value.clone());
                    }
                    merge_polymodel_classes(&existing, &mut next);

                    if constraints_active {
                        let old_identifiers =
                            unique_identifiers_from_entity(self.model, &existing, true);
                        let new_identifiers =
                            unique_identifiers_from_entity(self.model, &next, true);
                        if old_identifiers != new_identifiers {
                            acquired.extend(acquire_markers(
                                txns,
                                self.model,
                                &next,
                                &conn.namespace,
                            )?);
                            let dropped: Vec<&String> = old_identifiers
                                .iter()
                                .filter(|identifier| !new_identifiers.contains(identifier))
                                .collect();
                            stale.extend(marker_keys_for_identifiers(
                                dropped.into_iter(),
                                &conn.namespace,
                            ));
                        }
                    }

                    txns.put(next)?;
                    touched.push(key.clone());
                    count += 1;
                }
                Ok(count)
            });

            match result {
                Ok(count) => {
                    updated += count;
                    if !stale.is_empty()
                        && let Err(release_error) = release_markers(txns, &stale)
                    {
                        warn!(error = %release_error, "failed to release superseded markers after update");
                    }
                    conn.cache().invalidate(&touched, &conn.namespace);
                }
                Err(error) => {
                    if !acquired.is_empty()
                        && let Err(release_error) = release_markers(txns, &acquired)
                    {
                        warn!(error = %release_error, "failed to release markers after aborted update");
                    }
                    return Err(error);
                }
            }
        }
        Ok(updated)
    }
}

/// Strips the deleted table's membership from a polymodel entity. Returns
/// true when nothing remains and the entity itself should be deleted.
fn wipe_polymodel(entity: &mut Entity, table: &str, model: &Model) -> bool {
    let classes = entity.polymodel_classes();
    if classes.is_empty() {
        // Not a polymodel entity; always a full delete.
        return true;
    }
    if classes.iter().any(|c| c == table) {
        for field in model.fields() {
            entity.remove(field.column_name());
        }
        let remaining: Vec<Value> = classes
            .iter()
            .filter(|c| c.as_str() != table)
            .map(|c| Value::Text(c.clone()))
            .collect();
        if remaining.is_empty() {
            entity.remove(POLYMODEL_CLASS_PROPERTY);
        } else {
            entity.set(POLYMODEL_CLASS_PROPERTY, Value::List(remaining));
        }
    }
    entity.polymodel_classes().is_empty()
}

fn merge_polymodel_classes(original: &Entity, next: &mut Entity) {
    let mut classes = original.polymodel_classes();
    for class in next.polymodel_classes() {
        if !classes.contains(&class) {
            classes.push(class);
        }
    }
    if !classes.is_empty() {
        next.set(
            POLYMODEL_CLASS_PROPERTY,
            Value::List(classes.into_iter().map(Value::Text).collect()),
        );
    }
}

/// Deletes every entity matched by the filter.
///
/// The store only deletes by key, so this is a keys-only select followed
/// by transactional delete batches no larger than the mutation ceiling.
/// Polymodel entities shared with other tables are updated rather than
/// deleted. Marker release runs after each batch commits and must never
/// fail the delete: a deleted entity stays deleted, and a leftover marker
/// is harmlessly reclaimed by the next writer.
pub struct DeleteCommand<'a> {
    model: &'a Model,
    filter: Option<FilterNode>,
}

impl<'a> DeleteCommand<'a> {
    pub fn new(model: &'a Model, filter: Option<FilterNode>) -> Self {
        Self { model, filter }
    }

    pub fn execute(&self, conn: &Connection) -> Result<usize, TrellisError> {
        let mut select = SelectQuery::new(self.model, &conn.namespace).keys_only();
        if let Some(filter) = &self.filter {
            select = select.filter(filter.clone());
        }
        let keys: Vec<Key> = select
            .fetch(conn)?
            .into_iter()
            .map(|entity| entity.key)
            .collect();

        let constraints_active = has_active_unique_constraints(&conn.config, self.model);
        let table = self.model.table().to_string();
        let txns = conn.transactions();
        let mut deleted = 0usize;

        for chunk in keys.chunks(conn.config.transaction_entity_limit.max(1)) {
            let mut released: Vec<Entity> = Vec::new();
            let mut touched: Vec<Key> = Vec::new();

            txns.atomic(TransactionOptions::default(), || {
                released.clear();
                touched.clear();
                let entities = txns.get_multi(chunk)?;
                let mut to_delete: Vec<Key> = Vec::new();
                let mut to_update: Vec<Entity> = Vec::new();

                for entity in entities {
                    let original = entity.clone();
                    let key = entity.key.clone();
                    let mut entity = entity;
                    if wipe_polymodel(&mut entity, &table, self.model) {
                        to_delete.push(key.clone());
                        if constraints_active {
                            released.push(original);
                        }
                    } else {
                        to_update.push(entity);
                    }
                    touched.push(key);
                }

                txns.delete(&to_delete)?;
                for entity in to_update {
                    txns.put(entity)?;
                }
                Ok(())
            })?;

            for entity in &released {
                if let Err(release_error) =
                    release_markers_for_entity(txns, self.model, entity, &conn.namespace, false)
                {
                    warn!(error = %release_error, "failed to release markers after delete");
                }
            }
            conn.cache().invalidate(&touched, &conn.namespace);
            deleted += touched.len();
        }
        Ok(deleted)
    }
}

/// Wipes a whole table: keys-only scans looped with deletes until the
/// scan comes back empty. Tooling surface, not part of the query path.
pub struct FlushCommand {
    table: String,
}

impl FlushCommand {
    pub fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
        }
    }

    pub fn execute(&self, conn: &Connection) -> Result<(), TrellisError> {
        loop {
            let mut spec = QuerySpec::new(&self.table, &conn.namespace);
            spec.keys_only = true;
            let keys: Vec<Key> = conn
                .store()
                .run_query(&spec, None, 0)?
                .into_iter()
                .map(|entity| entity.key)
                .collect();
            if keys.is_empty() {
                return Ok(());
            }
            conn.store().delete(None, &keys)?;
        }
    }
}
