use crate::entity::Entity;
use crate::error::TrellisError;
use crate::key::Key;
use crate::store::{Datastore, TxId};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default)]
pub struct TransactionOptions {
    /// Fork a genuinely new underlying transaction, causally separate
    /// from any enclosing one.
    pub independent: bool,
    /// Fail immediately unless an enclosing transaction exists.
    pub mandatory: bool,
}

impl TransactionOptions {
    pub fn independent() -> Self {
        Self {
            independent: true,
            mandatory: false,
        }
    }

    pub fn mandatory() -> Self {
        Self {
            independent: false,
            mandatory: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    Normal,
    Nested,
    Independent,
    /// Pushed by `non_atomic`; masks any enclosing transaction.
    Masked,
}

struct Frame {
    kind: FrameKind,
    txn: Option<TxId>,
    seen: HashSet<Key>,
}

/// Stack of transaction contexts for one logical thread of execution.
///
/// A Normal frame begins a new underlying transaction; beginning again
/// inside one pushes a Nested no-op shell that attaches to the same
/// transaction. An Independent frame always forks its own transaction and
/// restores the previous frame on exit. The stack is an explicit context
/// object owned by the connection, not ambient thread-local state.
pub struct TransactionStack {
    store: Arc<dyn Datastore>,
    frames: Mutex<Vec<Frame>>,
}

impl TransactionStack {
    pub fn new(store: Arc<dyn Datastore>) -> Self {
        Self {
            store,
            frames: Mutex::new(Vec::new()),
        }
    }

    /// Index of the frame holding the active underlying transaction:
    /// topmost Normal or Independent frame not masked by a `non_atomic`
    /// block. Nested frames delegate downward.
    fn active_index(&self) -> Option<usize> {
        let frames = self.frames.lock();
        for (index, frame) in frames.iter().enumerate().rev() {
            match frame.kind {
                FrameKind::Masked => return None,
                FrameKind::Nested => continue,
                FrameKind::Normal | FrameKind::Independent => return Some(index),
            }
        }
        None
    }

    pub fn in_transaction(&self) -> bool {
        self.active_index().is_some()
    }

    pub fn current_txn(&self) -> Option<TxId> {
        let index = self.active_index()?;
        self.frames.lock().get(index).and_then(|f| f.txn)
    }

    /// Runs `body` inside a transaction frame chosen by `options`. On a
    /// clean exit the frame's transaction is committed (commit failure
    /// surfaces as `TransactionFailed`); on an error exit it is rolled
    /// back and the error propagates.
    pub fn atomic<T>(
        &self,
        options: TransactionOptions,
        body: impl FnOnce() -> Result<T, TrellisError>,
    ) -> Result<T, TrellisError> {
        let frame = if options.independent {
            Frame {
                kind: FrameKind::Independent,
                txn: Some(self.store.begin()?),
                seen: HashSet::new(),
            }
        } else if self.in_transaction() {
            Frame {
                kind: FrameKind::Nested,
                txn: None,
                seen: HashSet::new(),
            }
        } else if options.mandatory {
            return Err(TrellisError::TransactionFailed(
                "an outer transaction is mandatory, but none exists".into(),
            ));
        } else {
            Frame {
                kind: FrameKind::Normal,
                txn: Some(self.store.begin()?),
                seen: HashSet::new(),
            }
        };

        self.frames.lock().push(frame);
        let result = body();
        let frame = self
            .frames
            .lock()
            .pop()
            .ok_or_else(|| TrellisError::TransactionFailed("transaction stack underflow".into()))?;

        match result {
            Ok(value) => {
                if let Some(txn) = frame.txn {
                    self.store.commit(txn).map_err(|e| match e {
                        TrellisError::TransactionFailed(_) => e,
                        other => TrellisError::TransactionFailed(other.to_string()),
                    })?;
                }
                Ok(value)
            }
            Err(error) => {
                if let Some(txn) = frame.txn {
                    let _ = self.store.rollback(txn);
                }
                Err(error)
            }
        }
    }

    /// Runs `body` outside any transaction, masking an enclosing one.
    pub fn non_atomic<T>(
        &self,
        body: impl FnOnce() -> Result<T, TrellisError>,
    ) -> Result<T, TrellisError> {
        self.frames.lock().push(Frame {
            kind: FrameKind::Masked,
            txn: None,
            seen: HashSet::new(),
        });
        let result = body();
        self.frames.lock().pop();
        result
    }

    fn record_seen(&self, keys: &[Key]) {
        let Some(index) = self.active_index() else {
            return;
        };
        let mut frames = self.frames.lock();
        if let Some(frame) = frames.get_mut(index) {
            frame.seen.extend(keys.iter().cloned());
        }
    }

    /// Read through the active transaction, recording the key in its
    /// seen-set.
    pub fn get(&self, key: &Key) -> Result<Option<Entity>, TrellisError> {
        let txn = self.current_txn();
        let result = self.store.get(txn, key)?;
        if txn.is_some() {
            self.record_seen(std::slice::from_ref(key));
        }
        Ok(result)
    }

    pub fn get_multi(&self, keys: &[Key]) -> Result<Vec<Entity>, TrellisError> {
        let txn = self.current_txn();
        let result = self.store.get_multi(txn, keys)?;
        if txn.is_some() {
            self.record_seen(keys);
        }
        Ok(result)
    }

    pub fn put(&self, entity: Entity) -> Result<Key, TrellisError> {
        self.store.put(self.current_txn(), entity)
    }

    pub fn delete(&self, keys: &[Key]) -> Result<(), TrellisError> {
        self.store.delete(self.current_txn(), keys)
    }

    /// Whether this identity was already read inside the active
    /// transaction.
    pub fn has_been_read(&self, key: &Key) -> bool {
        let Some(index) = self.active_index() else {
            return false;
        };
        self.frames
            .lock()
            .get(index)
            .is_some_and(|frame| frame.seen.contains(key))
    }

    /// Fetches the entity only if it has not been read in the active
    /// transaction yet. `Ok(None)` on an already-read identity means the
    /// caller's in-memory state is already transaction-consistent and a
    /// refetch would clobber in-transaction mutations from nested call
    /// chains.
    pub fn get_if_unread(&self, key: &Key) -> Result<Option<Entity>, TrellisError> {
        if self.has_been_read(key) {
            return Ok(None);
        }
        self.get(key)
    }
}
