//! Job-scoped translation from source ids to duplicate ids, per kind

use std::collections::HashMap;

use crate::error::StorageError;

#[derive(Debug, Default, Clone)]
pub struct IdentifierMap {
    by_kind: HashMap<String, HashMap<i64, i64>>,
}

impl IdentifierMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a mapping. A source id seen twice for the same kind means the
    /// source data loops back on itself.
    pub fn insert(&mut self, kind: &str, original: i64, duplicate: i64) -> Result<(), StorageError> {
        let ids = self.by_kind.entry(kind.to_string()).or_default();
        if let Some(existing) = ids.insert(original, duplicate) {
            ids.insert(original, existing);
            return Err(StorageError::Integrity(format!(
                "{} {} reached twice while copying; source hierarchy is cyclic",
                kind, original
            )));
        }
        Ok(())
    }

    pub fn get(&self, kind: &str, original: i64) -> Option<i64> {
        self.by_kind.get(kind).and_then(|ids| ids.get(&original).copied())
    }

    pub fn contains(&self, kind: &str, original: i64) -> bool {
        self.get(kind, original).is_some()
    }

    /// Number of mapped entities of one kind
    pub fn count(&self, kind: &str) -> usize {
        self.by_kind.get(kind).map(HashMap::len).unwrap_or(0)
    }

    /// Total mapped entities across kinds
    pub fn len(&self) -> usize {
        self.by_kind.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All `(original, duplicate)` pairs of one kind
    pub fn pairs(&self, kind: &str) -> Vec<(i64, i64)> {
        let mut pairs: Vec<(i64, i64)> = self
            .by_kind
            .get(kind)
            .map(|ids| ids.iter().map(|(o, d)| (*o, *d)).collect())
            .unwrap_or_default();
        pairs.sort_unstable();
        pairs
    }
}
