use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// The identity half of a key: either a store-allocated integer id or a
/// caller-chosen name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyId {
    Id(i64),
    Name(CompactString),
}

impl KeyId {
    fn rank(&self) -> u8 {
        match self {
            KeyId::Id(_) => 0,
            KeyId::Name(_) => 1,
        }
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyId::Id(id) => write!(f, "{id}"),
            KeyId::Name(name) => write!(f, "{name}"),
        }
    }
}

/// Opaque entity address: kind, identity, optional parent and namespace.
/// Two keys are equal iff all four fields match. A key with no identity is
/// "partial" and is pending id allocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Key {
    pub kind: CompactString,
    pub id: Option<KeyId>,
    pub parent: Option<Box<Key>>,
    pub namespace: CompactString,
}

impl Key {
    pub fn new(kind: &str, id: KeyId, namespace: &str) -> Self {
        Self {
            kind: kind.into(),
            id: Some(id),
            parent: None,
            namespace: namespace.into(),
        }
    }

    pub fn with_id(kind: &str, id: i64, namespace: &str) -> Self {
        Self::new(kind, KeyId::Id(id), namespace)
    }

    pub fn with_name(kind: &str, name: &str, namespace: &str) -> Self {
        Self::new(kind, KeyId::Name(name.into()), namespace)
    }

    /// A key awaiting id allocation.
    pub fn partial(kind: &str, namespace: &str) -> Self {
        Self {
            kind: kind.into(),
            id: None,
            parent: None,
            namespace: namespace.into(),
        }
    }

    pub fn with_parent(mut self, parent: Key) -> Self {
        self.parent = Some(Box::new(parent));
        self
    }

    pub fn is_partial(&self) -> bool {
        self.id.is_none()
    }

    pub fn completed(mut self, id: i64) -> Self {
        self.id = Some(KeyId::Id(id));
        self
    }

    pub fn id_or_name(&self) -> Option<&KeyId> {
        self.id.as_ref()
    }

    /// Rewrites the namespace on this key and its whole ancestor chain.
    pub fn in_namespace(&self, namespace: &str) -> Key {
        Key {
            kind: self.kind.clone(),
            id: self.id.clone(),
            parent: self
                .parent
                .as_ref()
                .map(|p| Box::new(p.in_namespace(namespace))),
            namespace: namespace.into(),
        }
    }

    /// An ancestor query rooted at `ancestor` matches the ancestor itself
    /// and every key below it.
    pub fn has_ancestor(&self, ancestor: &Key) -> bool {
        let mut current = Some(self);
        while let Some(key) = current {
            if key == ancestor {
                return true;
            }
            current = key.parent.as_deref();
        }
        false
    }
}

impl fmt::Display for Key {
    /// `kind:id` segments chained from root ancestor to leaf.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(parent) = &self.parent {
            write!(f, "{parent}/")?;
        }
        match &self.id {
            Some(id) => write!(f, "{}:{}", self.kind, id),
            None => write!(f, "{}:?", self.kind),
        }
    }
}

fn compare_ids(lhs: Option<&KeyId>, rhs: Option<&KeyId>) -> Ordering {
    match (lhs, rhs) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(KeyId::Id(a)), Some(KeyId::Id(b))) => a.cmp(b),
        (Some(KeyId::Name(a)), Some(KeyId::Name(b))) => a.cmp(b),
        (Some(a), Some(b)) => a.rank().cmp(&b.rank()),
    }
}

fn compare_parents(lhs: Option<&Key>, rhs: Option<&Key>) -> Ordering {
    match (lhs, rhs) {
        (None, None) => Ordering::Equal,
        // An ancestor sorts before its descendants.
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => compare_keys(a, b),
    }
}

/// Canonical key ordering: kind, then identity, then ancestor path, then
/// namespace. Total order; `Equal` implies field-for-field equality.
pub fn compare_keys(lhs: &Key, rhs: &Key) -> Ordering {
    lhs.kind
        .cmp(&rhs.kind)
        .then_with(|| compare_ids(lhs.id.as_ref(), rhs.id.as_ref()))
        .then_with(|| compare_parents(lhs.parent.as_deref(), rhs.parent.as_deref()))
        .then_with(|| lhs.namespace.cmp(&rhs.namespace))
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_keys(self, other)
    }
}
