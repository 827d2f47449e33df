pub mod memory;

use crate::entity::Entity;
use crate::error::TrellisError;
use crate::key::Key;
use crate::query::QuerySpec;

/// Handle to an open transaction in the backing store.
pub type TxId = u64;

/// The raw get/put/delete/query surface of the backing entity store.
///
/// Transactional reads observe the committed snapshot: writes staged in an
/// open transaction are invisible to reads in the same transaction. The
/// constraint engine's in-memory pre-flight exists to compensate for that.
pub trait Datastore: Send + Sync {
    fn get(&self, txn: Option<TxId>, key: &Key) -> Result<Option<Entity>, TrellisError>;

    /// Multi-get; missing keys are elided from the result, found entities
    /// keep the input order.
    fn get_multi(&self, txn: Option<TxId>, keys: &[Key]) -> Result<Vec<Entity>, TrellisError>;

    fn put(&self, txn: Option<TxId>, entity: Entity) -> Result<Key, TrellisError>;

    fn delete(&self, txn: Option<TxId>, keys: &[Key]) -> Result<(), TrellisError>;

    /// Runs one native query. `limit`/`offset` are applied after ordering.
    fn run_query(
        &self,
        spec: &QuerySpec,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Vec<Entity>, TrellisError>;

    fn allocate_id(&self) -> Result<i64, TrellisError>;

    fn begin(&self) -> Result<TxId, TrellisError>;

    fn commit(&self, txn: TxId) -> Result<(), TrellisError>;

    fn rollback(&self, txn: TxId) -> Result<(), TrellisError>;
}
