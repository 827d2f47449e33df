use crate::entity::{Entity, KEY_PROPERTY, Value};
use crate::error::TrellisError;
use crate::key::{Key, compare_keys};
use crate::query::{OrderColumn, QuerySpec};
use crate::store::Datastore;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::mpsc;

/// Ordering comparator shared by the merge engine, the key fast path and
/// the in-memory store: ordering columns in turn, then the canonical key
/// order as an unconditional tie-break, so the comparison is total.
///
/// A multi-valued property is compared through its component-wise extreme:
/// the minimum for ascending columns, the maximum for descending ones.
/// Extremes are cached per `(entity key, column)` since the merge revisits
/// head elements repeatedly.
pub struct EntityComparator {
    orderings: Vec<OrderColumn>,
    extremes: Mutex<HashMap<(Key, String), Value>>,
}

impl EntityComparator {
    pub fn new(orderings: Vec<OrderColumn>) -> Self {
        Self {
            orderings,
            extremes: Mutex::new(HashMap::new()),
        }
    }

    pub fn compare(&self, lhs: &Entity, rhs: &Entity) -> Ordering {
        for column in &self.orderings {
            let left = self.ordering_value(lhs, column);
            let right = self.ordering_value(rhs, column);
            let mut result = left.cmp(&right);
            if column.descending {
                result = result.reverse();
            }
            if result != Ordering::Equal {
                return result;
            }
        }
        compare_keys(&lhs.key, &rhs.key)
    }

    fn ordering_value(&self, entity: &Entity, column: &OrderColumn) -> Value {
        if column.column == KEY_PROPERTY {
            return Value::Key(entity.key.clone());
        }
        let value = entity
            .get(&column.column)
            .cloned()
            .unwrap_or(Value::Null);
        let elements = match value {
            Value::List(elements) => elements,
            scalar => return scalar,
        };

        let cache_key = (entity.key.clone(), column.column.clone());
        if let Some(cached) = self.extremes.lock().get(&cache_key) {
            return cached.clone();
        }
        let extreme = if column.descending {
            elements.iter().max().cloned()
        } else {
            elements.iter().min().cloned()
        }
        .unwrap_or(Value::Null);
        self.extremes.lock().insert(cache_key, extreme.clone());
        extreme
    }
}

/// Runs multiple single-branch queries concurrently and merges the result
/// sets under the shared ordering, de-duplicated by key.
#[derive(Debug)]
pub struct MultiQuery {
    queries: Vec<QuerySpec>,
    orderings: Vec<OrderColumn>,
}

impl MultiQuery {
    pub fn new(queries: Vec<QuerySpec>, orderings: Vec<OrderColumn>) -> Self {
        Self { queries, orderings }
    }

    pub fn query_count(&self) -> usize {
        self.queries.len()
    }

    pub fn keys_only(&mut self) {
        for query in &mut self.queries {
            query.keys_only = true;
        }
    }

    /// Executes every branch and returns the lazy merged sequence.
    ///
    /// Each branch materializes its entire result set inside its worker.
    /// That trades the store's native result batching for a simple
    /// concurrent merge; acceptable because OR-branch result sets are
    /// typically small. Offsetting works by skipping, so every branch is
    /// fetched with `offset + limit`.
    pub fn fetch(
        &self,
        store: &Arc<dyn Datastore>,
        worker_budget: usize,
        offset: usize,
        limit: Option<usize>,
    ) -> Result<MergeIterator, TrellisError> {
        let branch_limit = limit.map(|l| l.saturating_add(offset));
        let result_sets = fetch_branches(store, &self.queries, worker_budget, branch_limit)?;
        Ok(MergeIterator::new(
            result_sets,
            EntityComparator::new(self.orderings.clone()),
            offset,
            limit,
        ))
    }
}

/// Executes the branch queries on a fixed pool of worker threads. The
/// worker budget is a constant, not proportional to the branch count: a
/// branch whose result set is exhausted frees its worker for the next
/// pending branch. Any branch error fails the whole fetch.
fn fetch_branches(
    store: &Arc<dyn Datastore>,
    queries: &[QuerySpec],
    worker_budget: usize,
    branch_limit: Option<usize>,
) -> Result<Vec<Vec<Entity>>, TrellisError> {
    if queries.is_empty() {
        return Ok(Vec::new());
    }

    let worker_count = worker_budget.max(1).min(queries.len());
    let (task_tx, task_rx) = mpsc::channel::<(usize, QuerySpec)>();
    let task_rx = Arc::new(Mutex::new(task_rx));
    let (done_tx, done_rx) = mpsc::channel();

    for _ in 0..worker_count {
        let store = Arc::clone(store);
        let task_rx = Arc::clone(&task_rx);
        let done_tx = done_tx.clone();
        std::thread::spawn(move || {
            loop {
                let task = { task_rx.lock().recv() };
                let Ok((index, spec)) = task else {
                    break;
                };
                let outcome = store.run_query(&spec, branch_limit, 0);
                if done_tx.send((index, outcome)).is_err() {
                    break;
                }
            }
        });
    }
    drop(done_tx);

    for (index, query) in queries.iter().enumerate() {
        let _ = task_tx.send((index, query.clone()));
    }
    drop(task_tx);

    let mut result_sets: Vec<Option<Vec<Entity>>> = vec![None; queries.len()];
    let mut first_error: Option<TrellisError> = None;
    while let Ok((index, outcome)) = done_rx.recv() {
        match outcome {
            Ok(rows) => result_sets[index] = Some(rows),
            Err(error) => {
                first_error.get_or_insert(error);
            }
        }
    }
    if let Some(error) = first_error {
        return Err(error);
    }
    Ok(result_sets
        .into_iter()
        .map(|set| set.unwrap_or_default())
        .collect())
}

/// Order-preserving k-way merge over the branch result sets: repeatedly
/// yields the minimum head element under the comparator, advancing only
/// that branch. A key already yielded is never yielded again.
pub struct MergeIterator {
    branches: Vec<std::vec::IntoIter<Entity>>,
    heads: Vec<Option<Entity>>,
    comparator: EntityComparator,
    seen: HashSet<Key>,
    offset: usize,
    limit: Option<usize>,
    returned: usize,
    yielded: usize,
    done: bool,
}

impl MergeIterator {
    fn new(
        sets: Vec<Vec<Entity>>,
        comparator: EntityComparator,
        offset: usize,
        limit: Option<usize>,
    ) -> Self {
        let mut branches: Vec<_> = sets.into_iter().map(|set| set.into_iter()).collect();
        let heads = branches.iter_mut().map(|branch| branch.next()).collect();
        Self {
            branches,
            heads,
            comparator,
            seen: HashSet::new(),
            offset,
            limit,
            returned: 0,
            yielded: 0,
            done: false,
        }
    }

    fn take_lowest(&mut self) -> Option<Entity> {
        let mut lowest: Option<usize> = None;
        for index in 0..self.heads.len() {
            let Some(candidate) = self.heads[index].as_ref() else {
                continue;
            };
            let better = match lowest.and_then(|current| self.heads[current].as_ref()) {
                Some(current) => self.comparator.compare(candidate, current) == Ordering::Less,
                None => true,
            };
            if better {
                lowest = Some(index);
            }
        }
        let index = lowest?;
        let entity = self.heads[index].take();
        self.heads[index] = self.branches[index].next();
        entity
    }
}

impl Iterator for MergeIterator {
    type Item = Entity;

    fn next(&mut self) -> Option<Entity> {
        if self.done {
            return None;
        }
        loop {
            let entity = self.take_lowest()?;
            if !self.seen.insert(entity.key.clone()) {
                continue;
            }
            self.returned += 1;
            if self.returned <= self.offset {
                continue;
            }
            self.yielded += 1;
            if let Some(limit) = self.limit
                && self.yielded >= limit
            {
                self.done = true;
            }
            return Some(entity);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{EntityComparator, MultiQuery};
    use crate::entity::{Entity, Value};
    use crate::key::Key;
    use crate::query::{NativeOp, OrderColumn, QuerySpec};
    use crate::store::Datastore;
    use crate::store::memory::MemoryStore;
    use std::cmp::Ordering;
    use std::sync::Arc;

    fn entity(id: i64, score: i64) -> Entity {
        let mut e = Entity::new(Key::with_id("t", id, ""));
        e.set("score", score);
        e
    }

    #[test]
    fn comparator_orders_by_column_then_key() {
        let comparator = EntityComparator::new(vec![OrderColumn::asc("score")]);
        assert_eq!(
            comparator.compare(&entity(1, 5), &entity(2, 10)),
            Ordering::Less
        );
        // Equal column values break the tie on the canonical key order.
        assert_eq!(
            comparator.compare(&entity(1, 5), &entity(2, 5)),
            Ordering::Less
        );
    }

    #[test]
    fn empty_ordering_compares_by_key_alone() {
        let comparator = EntityComparator::new(Vec::new());
        assert_eq!(
            comparator.compare(&entity(3, 0), &entity(2, 99)),
            Ordering::Greater
        );
    }

    #[test]
    fn list_values_compare_through_their_extremes() {
        let mut lhs = Entity::new(Key::with_id("t", 1, ""));
        lhs.set(
            "score",
            Value::List(vec![Value::Integer(1), Value::Integer(50)]),
        );
        let rhs = entity(2, 10);

        let ascending = EntityComparator::new(vec![OrderColumn::asc("score")]);
        // min(1, 50) = 1 < 10
        assert_eq!(ascending.compare(&lhs, &rhs), Ordering::Less);

        let descending = EntityComparator::new(vec![OrderColumn::desc("score")]);
        // max(1, 50) = 50 > 10, reversed for descending
        assert_eq!(descending.compare(&lhs, &rhs), Ordering::Less);
    }

    fn branch_query(low: i64, high: i64) -> QuerySpec {
        let mut spec = QuerySpec::new("t", "");
        spec.add_filter("score", NativeOp::Gte, Value::Integer(low));
        spec.add_filter("score", NativeOp::Lte, Value::Integer(high));
        spec.ordering = vec![OrderColumn::asc("score")];
        spec
    }

    fn seeded_store() -> Arc<dyn Datastore> {
        let store = MemoryStore::new();
        for id in 1..=10 {
            store.put(None, entity(id, id * 10)).expect("seed");
        }
        Arc::new(store)
    }

    #[test]
    fn merge_is_ordered_and_deduplicated() {
        let store = seeded_store();
        // Overlapping branches: entities 3..=6 are reachable twice.
        let multi = MultiQuery::new(
            vec![branch_query(10, 60), branch_query(30, 100)],
            vec![OrderColumn::asc("score")],
        );
        let results: Vec<_> = multi.fetch(&store, 4, 0, None).expect("fetch").collect();
        assert_eq!(results.len(), 10);
        let scores: Vec<_> = results
            .iter()
            .map(|e| e.get("score").cloned().expect("score"))
            .collect();
        let mut sorted = scores.clone();
        sorted.sort();
        assert_eq!(scores, sorted);
    }

    #[test]
    fn offset_and_limit_apply_to_distinct_results() {
        let store = seeded_store();
        let multi = MultiQuery::new(
            vec![branch_query(10, 60), branch_query(30, 100)],
            vec![OrderColumn::asc("score")],
        );
        let results: Vec<_> = multi
            .fetch(&store, 4, 3, Some(4))
            .expect("fetch")
            .collect();
        assert_eq!(
            results
                .iter()
                .map(|e| e.get("score").cloned())
                .collect::<Vec<_>>(),
            vec![
                Some(Value::Integer(40)),
                Some(Value::Integer(50)),
                Some(Value::Integer(60)),
                Some(Value::Integer(70)),
            ]
        );
    }

    #[test]
    fn worker_budget_below_branch_count_still_completes() {
        let store = seeded_store();
        let queries: Vec<_> = (1..=10).map(|i| branch_query(i * 10, i * 10)).collect();
        let multi = MultiQuery::new(queries, vec![OrderColumn::asc("score")]);
        let results: Vec<_> = multi.fetch(&store, 2, 0, None).expect("fetch").collect();
        assert_eq!(results.len(), 10);
    }
}
