use crate::entity::Entity;
use crate::error::TrellisError;
use crate::key::Key;
use crate::query::merge::EntityComparator;
use crate::query::{QuerySpec, utils};
use crate::store::{Datastore, TxId};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// One native query observed by the store, kept for assertions on how
/// work was fanned out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedQuery {
    pub kind: String,
    pub limit: Option<usize>,
    pub offset: usize,
}

#[derive(Debug, Clone)]
enum Mutation {
    Put(Entity),
    Delete(Key),
}

#[derive(Default)]
struct TxState {
    staged: Vec<Mutation>,
}

#[derive(Default)]
struct Inner {
    entities: BTreeMap<Key, Entity>,
    transactions: HashMap<TxId, TxState>,
    next_tx: TxId,
    next_id: i64,
    query_log: Vec<RecordedQuery>,
    fail_next_commit: bool,
    fail_puts_of_kind: HashSet<String>,
    fail_deletes_of_kind: HashSet<String>,
}

/// In-memory stand-in for the backing entity store, used by tests and
/// local development. Mutations inside a transaction are staged and only
/// become visible at commit; commits enforce a per-transaction mutation
/// ceiling the way the real store does.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    entity_limit: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_entity_limit(500)
    }

    pub fn with_entity_limit(entity_limit: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 1,
                ..Inner::default()
            }),
            entity_limit,
        }
    }

    /// Fails the next commit, whatever it stages. Fault-injection hook.
    pub fn fail_next_commit(&self) {
        self.inner.lock().fail_next_commit = true;
    }

    /// Any put of an entity of this kind fails, staged or direct.
    pub fn fail_puts_of_kind(&self, kind: &str) {
        self.inner.lock().fail_puts_of_kind.insert(kind.to_string());
    }

    /// Any delete of a key of this kind fails, staged or direct.
    pub fn fail_deletes_of_kind(&self, kind: &str) {
        self.inner
            .lock()
            .fail_deletes_of_kind
            .insert(kind.to_string());
    }

    pub fn clear_fault_injection(&self) {
        let mut inner = self.inner.lock();
        inner.fail_next_commit = false;
        inner.fail_puts_of_kind.clear();
        inner.fail_deletes_of_kind.clear();
    }

    pub fn recorded_queries(&self) -> Vec<RecordedQuery> {
        self.inner.lock().query_log.clone()
    }

    pub fn clear_recorded_queries(&self) {
        self.inner.lock().query_log.clear();
    }

    /// Number of stored entities of a kind in a namespace; test helper.
    pub fn count_kind(&self, kind: &str, namespace: &str) -> usize {
        self.inner
            .lock()
            .entities
            .values()
            .filter(|e| e.key.kind == kind && e.key.namespace == namespace)
            .count()
    }

    pub fn entities_of_kind(&self, kind: &str, namespace: &str) -> Vec<Entity> {
        self.inner
            .lock()
            .entities
            .values()
            .filter(|e| e.key.kind == kind && e.key.namespace == namespace)
            .cloned()
            .collect()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn apply(&mut self, mutation: Mutation) {
        match mutation {
            Mutation::Put(entity) => {
                self.entities.insert(entity.key.clone(), entity);
            }
            Mutation::Delete(key) => {
                self.entities.remove(&key);
            }
        }
    }

    fn tx_state(&mut self, txn: TxId) -> Result<&mut TxState, TrellisError> {
        self.transactions
            .get_mut(&txn)
            .ok_or_else(|| TrellisError::TransactionFailed(format!("unknown transaction {txn}")))
    }
}

impl Datastore for MemoryStore {
    fn get(&self, _txn: Option<TxId>, key: &Key) -> Result<Option<Entity>, TrellisError> {
        Ok(self.inner.lock().entities.get(key).cloned())
    }

    fn get_multi(&self, _txn: Option<TxId>, keys: &[Key]) -> Result<Vec<Entity>, TrellisError> {
        let inner = self.inner.lock();
        Ok(keys
            .iter()
            .filter_map(|key| inner.entities.get(key).cloned())
            .collect())
    }

    fn put(&self, txn: Option<TxId>, entity: Entity) -> Result<Key, TrellisError> {
        if entity.key.is_partial() {
            return Err(TrellisError::Store(
                "cannot put an entity with a partial key".into(),
            ));
        }
        let mut inner = self.inner.lock();
        if inner.fail_puts_of_kind.contains(entity.key.kind.as_str()) {
            return Err(TrellisError::TransactionFailed(format!(
                "injected put failure for kind '{}'",
                entity.key.kind
            )));
        }
        let key = entity.key.clone();
        match txn {
            Some(txn) => inner.tx_state(txn)?.staged.push(Mutation::Put(entity)),
            None => inner.apply(Mutation::Put(entity)),
        }
        Ok(key)
    }

    fn delete(&self, txn: Option<TxId>, keys: &[Key]) -> Result<(), TrellisError> {
        let mut inner = self.inner.lock();
        for key in keys {
            if inner.fail_deletes_of_kind.contains(key.kind.as_str()) {
                return Err(TrellisError::TransactionFailed(format!(
                    "injected delete failure for kind '{}'",
                    key.kind
                )));
            }
        }
        match txn {
            Some(txn) => {
                let state = inner.tx_state(txn)?;
                state
                    .staged
                    .extend(keys.iter().cloned().map(Mutation::Delete));
            }
            None => {
                for key in keys {
                    inner.apply(Mutation::Delete(key.clone()));
                }
            }
        }
        Ok(())
    }

    fn run_query(
        &self,
        spec: &QuerySpec,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Vec<Entity>, TrellisError> {
        let mut results: Vec<Entity> = {
            let mut inner = self.inner.lock();
            inner.query_log.push(RecordedQuery {
                kind: spec.kind.clone(),
                limit,
                offset,
            });
            inner
                .entities
                .values()
                .filter(|e| e.key.kind == spec.kind && e.key.namespace == spec.namespace)
                .filter(|e| match &spec.ancestor {
                    Some(ancestor) => e.key.has_ancestor(ancestor),
                    None => true,
                })
                .filter(|e| utils::entity_matches_spec(e, spec))
                .cloned()
                .collect()
        };

        let comparator = EntityComparator::new(spec.ordering.clone());
        results.sort_by(|a, b| comparator.compare(a, b));

        if !spec.distinct_on.is_empty() {
            let mut seen: BTreeSet<Vec<crate::entity::Value>> = BTreeSet::new();
            results.retain(|entity| {
                let tuple: Vec<_> = spec
                    .distinct_on
                    .iter()
                    .map(|col| {
                        entity
                            .get(col)
                            .cloned()
                            .unwrap_or(crate::entity::Value::Null)
                    })
                    .collect();
                seen.insert(tuple)
            });
        }

        let sliced: Vec<Entity> = results
            .into_iter()
            .skip(offset)
            .take(limit.unwrap_or(usize::MAX))
            .collect();

        let converted = sliced
            .into_iter()
            .map(|mut entity| {
                if spec.keys_only {
                    Entity::new(entity.key)
                } else if !spec.projection.is_empty() {
                    entity.retain_properties(&spec.projection);
                    entity
                } else {
                    entity
                }
            })
            .collect();
        Ok(converted)
    }

    fn allocate_id(&self) -> Result<i64, TrellisError> {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        Ok(id)
    }

    fn begin(&self) -> Result<TxId, TrellisError> {
        let mut inner = self.inner.lock();
        inner.next_tx += 1;
        let txn = inner.next_tx;
        inner.transactions.insert(txn, TxState::default());
        Ok(txn)
    }

    fn commit(&self, txn: TxId) -> Result<(), TrellisError> {
        let mut inner = self.inner.lock();
        let state = inner.transactions.remove(&txn).ok_or_else(|| {
            TrellisError::TransactionFailed(format!("unknown transaction {txn}"))
        })?;
        if inner.fail_next_commit {
            inner.fail_next_commit = false;
            return Err(TrellisError::TransactionFailed(
                "injected commit failure".into(),
            ));
        }
        if state.staged.len() > self.entity_limit {
            return Err(TrellisError::TransactionFailed(format!(
                "transaction touches {} entities, more than the {} allowed",
                state.staged.len(),
                self.entity_limit
            )));
        }
        for mutation in &state.staged {
            let kind = match mutation {
                Mutation::Put(entity) => &entity.key.kind,
                Mutation::Delete(key) => &key.kind,
            };
            let failing = match mutation {
                Mutation::Put(_) => inner.fail_puts_of_kind.contains(kind.as_str()),
                Mutation::Delete(_) => inner.fail_deletes_of_kind.contains(kind.as_str()),
            };
            if failing {
                return Err(TrellisError::TransactionFailed(format!(
                    "injected commit failure for kind '{kind}'"
                )));
            }
        }
        for mutation in state.staged {
            inner.apply(mutation);
        }
        Ok(())
    }

    fn rollback(&self, txn: TxId) -> Result<(), TrellisError> {
        self.inner.lock().transactions.remove(&txn);
        Ok(())
    }
}
