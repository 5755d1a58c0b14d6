//! Parsed container index
//!
//! [`ContainerIndex`] is the name-addressable view both readers share: the
//! entries in insertion order plus a name lookup table. Building one from a
//! decoded entry list also enforces the uniqueness invariant — a container
//! whose index repeats a name is corrupt.

use std::collections::HashMap;

use crate::error::{CoreError, Result};
use crate::format::IndexEntry;

/// Immutable, name-addressable container index.
#[derive(Debug, Clone)]
pub struct ContainerIndex {
    entries: Vec<IndexEntry>,
    by_name: HashMap<String, usize>,
}

impl ContainerIndex {
    /// Build from decoded entries, rejecting duplicate names.
    pub fn from_entries(entries: Vec<IndexEntry>) -> Result<Self> {
        let mut by_name = HashMap::with_capacity(entries.len());
        for (i, entry) in entries.iter().enumerate() {
            if by_name.insert(entry.name.clone(), i).is_some() {
                return Err(CoreError::CorruptContainer(format!(
                    "duplicate name in index: {:?}",
                    entry.name
                )));
            }
        }
        Ok(Self { entries, by_name })
    }

    pub fn get(&self, name: &str) -> Option<&IndexEntry> {
        self.by_name.get(name).map(|&i| &self.entries[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Entries in insertion order.
    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// Names in insertion order.
    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Consume into the raw entry list (for caching).
    pub fn into_entries(self) -> Vec<IndexEntry> {
        self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, offset: u64) -> IndexEntry {
        IndexEntry {
            name: name.to_string(),
            data_offset: offset,
            data_length: 10,
            meta_offset: 1000,
            meta_length: 2,
            flags: 0,
        }
    }

    #[test]
    fn test_lookup_and_order() {
        let idx = ContainerIndex::from_entries(vec![
            entry("b", 16),
            entry("a", 26),
            entry("c", 36),
        ])
        .unwrap();

        assert_eq!(idx.len(), 3);
        assert_eq!(idx.names(), vec!["b", "a", "c"]);
        assert_eq!(idx.get("a").unwrap().data_offset, 26);
        assert!(idx.contains("c"));
        assert!(!idx.contains("d"));
    }

    #[test]
    fn test_duplicate_name_is_corrupt() {
        let result = ContainerIndex::from_entries(vec![entry("x", 16), entry("x", 26)]);
        assert!(matches!(result, Err(CoreError::CorruptContainer(_))));
    }

    #[test]
    fn test_names_are_case_sensitive() {
        let idx = ContainerIndex::from_entries(vec![entry("File", 16), entry("file", 26)]).unwrap();
        assert_eq!(idx.len(), 2);
        assert_eq!(idx.get("File").unwrap().data_offset, 16);
        assert_eq!(idx.get("file").unwrap().data_offset, 26);
    }

    #[test]
    fn test_empty_index() {
        let idx = ContainerIndex::from_entries(Vec::new()).unwrap();
        assert!(idx.is_empty());
        assert_eq!(idx.names(), Vec::<String>::new());
    }
}
