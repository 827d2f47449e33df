use crate::cache::{CachingSituation, EntityCache};
use crate::entity::{Entity, KEY_PROPERTY};
use crate::error::TrellisError;
use crate::key::Key;
use crate::model::Model;
use crate::query::error::QueryError;
use crate::query::merge::{EntityComparator, MultiQuery};
use crate::query::utils::{entity_matches_spec, get_filter};
use crate::query::{NativeOp, OrderColumn, QuerySpec};
use crate::store::Datastore;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Resolves a query whose every branch pins the identity column to a
/// literal key: a direct multi-get instead of a native query, or an
/// ancestor-scoped fan-out when a projection is wanted and the branch
/// count stays under the configured ceiling.
#[derive(Debug)]
pub struct KeyLookupQuery {
    queries_by_key: BTreeMap<Key, Vec<QuerySpec>>,
    ordering: Vec<OrderColumn>,
    can_fan_out: bool,
    keys_only_override: bool,
}

impl KeyLookupQuery {
    pub fn new(
        queries: Vec<QuerySpec>,
        ordering: Vec<OrderColumn>,
        max_query_branches: usize,
    ) -> Result<Self, TrellisError> {
        let mut queries_by_key: BTreeMap<Key, Vec<QuerySpec>> = BTreeMap::new();
        for query in queries {
            let Some(value) = get_filter(&query, KEY_PROPERTY, NativeOp::Eq) else {
                return Err(QueryError::MalformedFilter {
                    reason: "key lookup requires a key equality filter in every branch".into(),
                }
                .into());
            };
            let Some(key) = value.as_key() else {
                return Err(QueryError::MalformedFilter {
                    reason: "key equality filter value must be a key literal".into(),
                }
                .into());
            };
            queries_by_key.entry(key.clone()).or_default().push(query);
        }
        let can_fan_out = queries_by_key.len() < max_query_branches;
        Ok(Self {
            queries_by_key,
            ordering,
            can_fan_out,
            keys_only_override: false,
        })
    }

    pub fn keys_only(&mut self) {
        self.keys_only_override = true;
    }

    fn base_query(&self) -> Option<&QuerySpec> {
        self.queries_by_key.values().flatten().next()
    }

    pub fn fetch(
        &self,
        store: &Arc<dyn Datastore>,
        worker_budget: usize,
        offset: usize,
        limit: Option<usize>,
    ) -> Result<Vec<Entity>, TrellisError> {
        let Some(base) = self.base_query().cloned() else {
            return Ok(Vec::new());
        };

        let mut is_projection = false;
        let raw: Vec<Entity> = if !base.projection.is_empty() && self.can_fan_out {
            is_projection = true;
            // Per-key ancestor queries keep the read consistent under the
            // store's ancestor-query guarantees. Ordering columns outside
            // the projection are folded in so the in-memory sort can see
            // them.
            let to_fetch = limit.map(|l| l.saturating_add(offset));
            let additional: Vec<String> = self
                .ordering
                .iter()
                .filter(|o| o.column != KEY_PROPERTY && !base.projection.contains(&o.column))
                .map(|o| o.column.clone())
                .collect();

            let mut fan_out = Vec::new();
            for (key, queries) in &self.queries_by_key {
                for query in queries {
                    let mut scoped = query.clone();
                    if !additional.is_empty() {
                        scoped.projection.extend(additional.iter().cloned());
                    }
                    scoped.ancestor = Some(key.clone());
                    fan_out.push(scoped);
                }
            }

            if fan_out.len() == 1 {
                store.run_query(&fan_out[0], to_fetch, 0)?
            } else {
                MultiQuery::new(fan_out, base.ordering.clone())
                    .fetch(store, worker_budget, 0, to_fetch)?
                    .collect()
            }
        } else {
            let keys: Vec<Key> = self.queries_by_key.keys().cloned().collect();
            store.get_multi(None, &keys)?
        };

        let comparator = EntityComparator::new(self.ordering.clone());
        let mut results = raw;
        results.sort_by(|a, b| comparator.compare(a, b));

        let keys_only = self.keys_only_override || base.keys_only;
        let mut out = Vec::new();
        let mut returned = 0usize;
        for entity in results {
            // A key-equality hit may have drifted from the other
            // predicates in its branch since the query was planned; stale
            // rows are dropped, not surfaced. The fan-out path applied the
            // filters natively.
            let matches = is_projection
                || self
                    .queries_by_key
                    .get(&entity.key)
                    .is_some_and(|queries| queries.iter().any(|q| entity_matches_spec(&entity, q)));
            if !matches {
                continue;
            }
            if returned < offset {
                returned += 1;
                continue;
            }
            out.push(convert_entity(entity, keys_only, &base.projection));
            returned += 1;
            if let Some(limit) = limit
                && out.len() >= limit
            {
                break;
            }
        }
        Ok(out)
    }
}

fn convert_entity(entity: Entity, keys_only: bool, projection: &[String]) -> Entity {
    if keys_only {
        return Entity::new(entity.key);
    }
    if !projection.is_empty() {
        let mut projected = entity;
        projected.retain_properties(projection);
        return projected;
    }
    entity
}

/// Point lookup for a query whose single branch exactly matches a
/// declared unique constraint. Consults the entity cache by constraint
/// identifier first; a hit is re-validated against the filters since the
/// cache may be stale.
#[derive(Debug)]
pub struct UniqueLookup {
    identifier: String,
    query: QuerySpec,
}

impl UniqueLookup {
    pub fn new(identifier: String, query: QuerySpec) -> Self {
        Self { identifier, query }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn spec(&self) -> &QuerySpec {
        &self.query
    }

    pub fn keys_only(&mut self) {
        self.query.keys_only = true;
    }

    pub fn fetch(
        &self,
        store: &Arc<dyn Datastore>,
        cache: &EntityCache,
        model: &Model,
        offset: usize,
        limit: Option<usize>,
    ) -> Result<Vec<Entity>, TrellisError> {
        // Keys-only and projection requests bypass the cache: the cached
        // form is the full entity and converting it here would duplicate
        // the planner's post-processing.
        if self.query.keys_only || !self.query.projection.is_empty() {
            return store.run_query(&self.query, limit, offset);
        }

        let namespace = self.query.namespace.clone();
        let mut cached = cache.get(&self.identifier, &namespace);
        if let Some(entity) = &cached
            && !entity_matches_spec(entity, &self.query)
        {
            cached = None;
        }
        if let Some(entity) = cached {
            return Ok(vec![entity]);
        }

        // Fast keys-only query for the candidates, then a strongly
        // consistent get so stale data never lands in the cache.
        let mut keys_query = self.query.clone();
        keys_query.keys_only = true;
        let candidates = store.run_query(&keys_query, limit, offset)?;
        let keys: Vec<Key> = candidates.into_iter().map(|e| e.key).collect();
        let fetched = store.get_multi(None, &keys)?;
        let results: Vec<Entity> = fetched
            .into_iter()
            .filter(|entity| entity_matches_spec(entity, &self.query))
            .collect();
        if results.len() == 1 {
            cache.put(model, &results, CachingSituation::DatastoreGet, &namespace);
        }
        Ok(results)
    }
}
