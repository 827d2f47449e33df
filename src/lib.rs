//! Relational semantics over a schema-less, eventually-consistent entity
//! store: DNF query planning and execution, merge-based multi-query
//! fan-out, marker-emulated unique constraints and bounded-batch
//! transactional mutation.
//!
//! The underlying storage engine, the object mapping and the wire client
//! are collaborators behind the [`store::Datastore`] trait; this crate is
//! the adaptation layer between them.

pub mod cache;
pub mod commands;
pub mod config;
pub mod constraints;
pub mod entity;
pub mod error;
pub mod key;
pub mod model;
pub mod query;
pub mod store;
pub mod transaction;

pub use crate::cache::EntityCache;
pub use crate::config::TrellisConfig;
pub use crate::entity::{Entity, KEY_PROPERTY, POLYMODEL_CLASS_PROPERTY, Value};
pub use crate::error::{TrellisError, TrellisErrorCode};
pub use crate::key::{Key, KeyId, compare_keys};
pub use crate::model::{Field, FieldMeta, FieldType, Model, has_active_unique_constraints};
pub use crate::query::planner::{ExecutionPlan, ExtraOp, ExtraSelect, SelectQuery};
pub use crate::query::{FilterNode, FilterOp, OrderColumn, QuerySpec};
pub use crate::transaction::{TransactionOptions, TransactionStack};

use crate::store::Datastore;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// De-duplicates repeated diagnostics. Scoped to its owning connection;
/// deliberately not a process-global set.
pub struct OnceReporter {
    seen: Mutex<HashSet<String>>,
}

impl OnceReporter {
    pub fn new() -> Self {
        Self {
            seen: Mutex::new(HashSet::new()),
        }
    }

    pub fn warn_once(&self, message: &str) {
        if self.seen.lock().insert(message.to_string()) {
            tracing::warn!("{message}");
        }
    }
}

impl Default for OnceReporter {
    fn default() -> Self {
        Self::new()
    }
}

/// One logical execution context over a datastore: configuration, the
/// namespace, the transaction stack and the unique-lookup cache. Queries
/// and commands borrow a connection; the transaction stack inside it is
/// confined to this context and never shared across concurrent logical
/// operations.
pub struct Connection {
    store: Arc<dyn Datastore>,
    pub config: TrellisConfig,
    pub namespace: String,
    cache: EntityCache,
    reporter: OnceReporter,
    transactions: TransactionStack,
}

impl Connection {
    pub fn new(store: Arc<dyn Datastore>, config: TrellisConfig) -> Self {
        Self::with_namespace(store, config, "")
    }

    pub fn with_namespace(
        store: Arc<dyn Datastore>,
        config: TrellisConfig,
        namespace: &str,
    ) -> Self {
        let cache = EntityCache::new(
            config.entity_cache_capacity,
            config.max_cached_result_entities,
        );
        let transactions = TransactionStack::new(store.clone());
        Self {
            store,
            config,
            namespace: namespace.to_string(),
            cache,
            reporter: OnceReporter::new(),
            transactions,
        }
    }

    pub fn store(&self) -> &Arc<dyn Datastore> {
        &self.store
    }

    pub fn cache(&self) -> &EntityCache {
        &self.cache
    }

    pub fn reporter(&self) -> &OnceReporter {
        &self.reporter
    }

    pub fn transactions(&self) -> &TransactionStack {
        &self.transactions
    }

    /// Shorthand for running a closure inside a transaction frame on this
    /// connection's stack.
    pub fn atomic<T>(
        &self,
        options: TransactionOptions,
        body: impl FnOnce() -> Result<T, TrellisError>,
    ) -> Result<T, TrellisError> {
        self.transactions.atomic(options, body)
    }
}
