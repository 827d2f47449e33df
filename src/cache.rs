use crate::constraints::identifiers::unique_identifiers_from_entity;
use crate::entity::Entity;
use crate::key::Key;
use crate::model::Model;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;

/// How a cached entity was obtained; kept so cache policy can diverge per
/// situation without changing call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachingSituation {
    DatastoreGet,
    DatastorePut,
}

/// Entity cache keyed by unique-constraint identifier, consulted only by
/// the unique point lookup path. Injected per connection; there is no
/// process-global instance.
pub struct EntityCache {
    inner: Mutex<LruCache<(String, String), Entity>>,
    max_batch: usize,
}

impl EntityCache {
    pub fn new(capacity: usize, max_batch: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            max_batch,
        }
    }

    pub fn get(&self, identifier: &str, namespace: &str) -> Option<Entity> {
        self.inner
            .lock()
            .get(&(namespace.to_string(), identifier.to_string()))
            .cloned()
    }

    /// Caches each entity under every unique identifier its current
    /// property values produce. Result sets beyond `max_batch` are left
    /// uncached; a huge result set churns the cache for little hit-rate.
    pub fn put(
        &self,
        model: &Model,
        entities: &[Entity],
        _situation: CachingSituation,
        namespace: &str,
    ) {
        if entities.len() > self.max_batch {
            return;
        }
        let mut inner = self.inner.lock();
        for entity in entities {
            for identifier in unique_identifiers_from_entity(model, entity, true) {
                inner.put((namespace.to_string(), identifier), entity.clone());
            }
        }
    }

    /// Drops every cached entry referencing one of `keys`. Failures are
    /// impossible here; at the boundary this operation is advisory-only.
    pub fn invalidate(&self, keys: &[Key], namespace: &str) {
        let mut inner = self.inner.lock();
        let stale: Vec<(String, String)> = inner
            .iter()
            .filter(|((ns, _), entity)| ns == namespace && keys.contains(&entity.key))
            .map(|(cache_key, _)| cache_key.clone())
            .collect();
        for cache_key in stale {
            inner.pop(&cache_key);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::{CachingSituation, EntityCache};
    use crate::constraints::identifiers::unique_identifiers_from_entity;
    use crate::entity::Entity;
    use crate::key::Key;
    use crate::model::{Field, FieldType, Model};

    fn model() -> Model {
        Model::new("test_user")
            .field(Field::new("id", FieldType::Integer).primary_key())
            .field(Field::new("username", FieldType::Char).unique())
    }

    fn user(id: i64, username: &str) -> Entity {
        let mut e = Entity::new(Key::with_id("test_user", id, ""));
        e.set("username", username);
        e
    }

    #[test]
    fn put_then_get_by_identifier() {
        let cache = EntityCache::new(16, 8);
        let model = model();
        let entity = user(1, "mattyh");
        let identifier = unique_identifiers_from_entity(&model, &entity, true)
            .pop()
            .expect("identifier");

        cache.put(&model, &[entity.clone()], CachingSituation::DatastoreGet, "");
        assert_eq!(cache.get(&identifier, ""), Some(entity));
        assert_eq!(cache.get(&identifier, "other"), None);
    }

    #[test]
    fn invalidate_removes_entries_by_key() {
        let cache = EntityCache::new(16, 8);
        let model = model();
        let entity = user(1, "mattyh");
        cache.put(&model, &[entity.clone()], CachingSituation::DatastoreGet, "");
        cache.invalidate(&[entity.key.clone()], "");
        assert!(cache.is_empty());
    }

    #[test]
    fn oversized_result_sets_are_not_cached() {
        let cache = EntityCache::new(16, 1);
        let model = model();
        cache.put(
            &model,
            &[user(1, "a"), user(2, "b")],
            CachingSituation::DatastoreGet,
            "",
        );
        assert!(cache.is_empty());
    }
}
