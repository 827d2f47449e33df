/// Runtime configuration for a trellis connection.
///
/// The defaults mirror the operational limits of the backing store: a
/// transaction may touch roughly 500 entities, and a disjunctive query is
/// only fanned out while the branch count stays below `max_query_branches`.
#[derive(Debug, Clone)]
pub struct TrellisConfig {
    /// Ceiling on OR-branches a single logical query may expand into.
    /// Queries normalizing to more branches than this are rejected.
    pub max_query_branches: usize,
    /// Fixed worker budget for multi-branch query execution. Branches
    /// beyond the budget queue behind it rather than spawning more workers.
    pub merge_worker_threads: usize,
    /// Mutation ceiling per transaction in the backing store. Bulk
    /// update/delete work is chunked into batches no larger than this.
    pub transaction_entity_limit: usize,
    /// Global switch for unique-constraint enforcement. A model-level
    /// opt-in overrides this when set.
    pub enforce_constraint_checks: bool,
    /// Capacity of the unique-lookup entity cache.
    pub entity_cache_capacity: usize,
    /// Result sets larger than this are never written to the cache.
    pub max_cached_result_entities: usize,
}

impl Default for TrellisConfig {
    fn default() -> Self {
        Self {
            max_query_branches: 100,
            merge_worker_threads: 8,
            transaction_entity_limit: 500,
            enforce_constraint_checks: true,
            entity_cache_capacity: 256,
            max_cached_result_entities: 8,
        }
    }
}

impl TrellisConfig {
    pub fn with_constraint_checks(mut self, enabled: bool) -> Self {
        self.enforce_constraint_checks = enabled;
        self
    }

    pub fn with_max_query_branches(mut self, ceiling: usize) -> Self {
        self.max_query_branches = ceiling;
        self
    }
}
