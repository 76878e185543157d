//! Generated file bundles.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A generated website: relative file path → file content.
///
/// Ordered by path so that serialized bundles are deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileBundle(BTreeMap<String, String>);

impl FileBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: impl Into<String>, content: impl Into<String>) -> Self {
        self.insert(path, content);
        self
    }

    pub fn insert(&mut self, path: impl Into<String>, content: impl Into<String>) {
        self.0.insert(path.into(), content.into());
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.0.get(path).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(p, c)| (p.as_str(), c.as_str()))
    }

    /// Overlay `incoming` on top of `self`.
    ///
    /// Paths present in `incoming` replace the existing content; paths it does
    /// not mention are kept as they are.
    pub fn merge(&self, incoming: &FileBundle) -> FileBundle {
        let mut merged = self.0.clone();
        for (path, content) in &incoming.0 {
            merged.insert(path.clone(), content.clone());
        }
        FileBundle(merged)
    }

    pub fn into_inner(self) -> BTreeMap<String, String> {
        self.0
    }
}

impl From<BTreeMap<String, String>> for FileBundle {
    fn from(value: BTreeMap<String, String>) -> Self {
        Self(value)
    }
}

impl<P: Into<String>, C: Into<String>> FromIterator<(P, C)> for FileBundle {
    fn from_iter<I: IntoIterator<Item = (P, C)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(p, c)| (p.into(), c.into())).collect())
    }
}
