/// Graph Store Module
///
/// Subject-predicate-object(-label) relationship store. The in-memory implementation keeps
/// a single collection partitioned by subject with a secondary predicate index, so adding
/// accounts never grows the schema. Nothing here survives a restart.
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use crate::error::WriteError;

/// A single relationship fact
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Quad {
    pub subject: String,
    pub predicate: String,
    pub object: String,
    pub label: Option<String>,
}

impl Quad {
    pub fn new(subject: impl Into<String>, predicate: impl Into<String>, object: impl Into<String>) -> Self {
        Self { subject: subject.into(), predicate: predicate.into(), object: object.into(), label: None }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// Relationship sink used by the vote writer
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Insert quads with set semantics. Returns how many were new.
    async fn add_quads(&self, quads: &[Quad]) -> Result<usize, WriteError>;
}

#[derive(Debug, Default)]
struct GraphIndex {
    by_subject: HashMap<String, BTreeSet<Quad>>,
    subjects_by_predicate: HashMap<String, BTreeSet<String>>,
    len: usize,
}

/// In-memory quad store
#[derive(Debug, Default)]
pub struct MemoryGraph {
    index: RwLock<GraphIndex>,
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, GraphIndex> {
        self.index.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert quads synchronously; see [`GraphStore::add_quads`]
    pub fn insert(&self, quads: &[Quad]) -> usize {
        let mut index = self.index.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut added = 0;

        for quad in quads {
            let partition = index.by_subject.entry(quad.subject.clone()).or_default();
            if partition.insert(quad.clone()) {
                added += 1;
                index
                    .subjects_by_predicate
                    .entry(quad.predicate.clone())
                    .or_default()
                    .insert(quad.subject.clone());
            }
        }

        index.len += added;
        added
    }

    /// Number of stored quads
    pub fn len(&self) -> usize {
        self.read().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All quads whose subject is `subject`
    #[cfg(test)]
    pub fn quads_for_subject(&self, subject: &str) -> Vec<Quad> {
        self.read().by_subject.get(subject).map(|p| p.iter().cloned().collect()).unwrap_or_default()
    }

    /// Objects linked from `subject` through `predicate`
    #[cfg(test)]
    pub fn objects(&self, subject: &str, predicate: &str) -> Vec<String> {
        self.read()
            .by_subject
            .get(subject)
            .map(|p| p.iter().filter(|q| q.predicate == predicate).map(|q| q.object.clone()).collect())
            .unwrap_or_default()
    }

    /// Subjects having at least one quad with `predicate`
    pub fn subjects_with_predicate(&self, predicate: &str) -> Vec<String> {
        self.read()
            .subjects_by_predicate
            .get(predicate)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl GraphStore for MemoryGraph {
    async fn add_quads(&self, quads: &[Quad]) -> Result<usize, WriteError> {
        Ok(self.insert(quads))
    }
}
