use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

use crate::cache::Fingerprint;

#[derive(Debug, Clone, Default)]
pub struct PlaceholderMap {
    pairs: Vec<(String, String)>,
    index: HashMap<String, usize>,
}

impl PlaceholderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a pair. Re-inserting a key replaces its value in place and returns the old one.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        let key = key.into();
        let value = value.into();
        if let Some(&idx) = self.index.get(&key) {
            return Some(std::mem::replace(&mut self.pairs[idx].1, value));
        }
        self.index.insert(key.clone(), self.pairs.len());
        self.pairs.push((key, value));
        None
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.index.get(key).map(|&idx| self.pairs[idx].1.as_str())
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Pairs in processing order: descending key length, ties in insertion order.
    /// Empty keys are never applied.
    pub fn ordered(&self) -> Vec<(&str, &str)> {
        let mut ordered: Vec<(&str, &str)> = self.iter().filter(|(k, _)| !k.is_empty()).collect();
        ordered.sort_by(|a, b| b.0.chars().count().cmp(&a.0.chars().count()));
        ordered
    }

    /// Content hash of the map in processing order, used as part of every cache key.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = Sha256::new();
        for (key, value) in self.ordered() {
            hasher.update((key.len() as u64).to_le_bytes());
            hasher.update(key.as_bytes());
            hasher.update((value.len() as u64).to_le_bytes());
            hasher.update(value.as_bytes());
        }
        Fingerprint::from_digest(hasher.finalize().into())
    }

    pub fn validate(&self) -> ValidationReport {
        let mut report = ValidationReport::default();
        for (key, value) in self.iter() {
            if key.trim().is_empty() {
                report.errors.push("empty placeholder key".to_string());
                continue;
            }
            if value.is_empty() {
                report
                    .warnings
                    .push(format!("empty value for placeholder: {key}"));
            }
            if value.contains(key) {
                report
                    .warnings
                    .push(format!("potential circular reference in placeholder: {key}"));
            }
        }
        report
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for PlaceholderMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = Self::new();
        map.extend(iter);
        map
    }
}

impl<K: Into<String>, V: Into<String>> Extend<(K, V)> for PlaceholderMap {
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        for (k, v) in iter {
            self.insert(k, v);
        }
    }
}

impl PartialEq for PlaceholderMap {
    fn eq(&self, other: &Self) -> bool {
        self.pairs == other.pairs
    }
}

impl Eq for PlaceholderMap {}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordered_puts_longer_keys_first_and_keeps_insertion_ties() {
        let map: PlaceholderMap = [("${A}", "1"), ("${AB}", "2"), ("${C}", "3")]
            .into_iter()
            .collect();
        let keys: Vec<&str> = map.ordered().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["${AB}", "${A}", "${C}"]);
    }

    #[test]
    fn reinsert_replaces_value_in_place() {
        let mut map = PlaceholderMap::new();
        map.insert("${X}", "old");
        map.insert("${Y}", "y");
        assert_eq!(map.insert("${X}", "new").as_deref(), Some("old"));
        let pairs: Vec<_> = map.iter().collect();
        assert_eq!(pairs, vec![("${X}", "new"), ("${Y}", "y")]);
    }

    #[test]
    fn fingerprint_ignores_insertion_order_of_distinct_lengths() {
        let a: PlaceholderMap = [("${LONG}", "1"), ("${S}", "2")].into_iter().collect();
        let b: PlaceholderMap = [("${S}", "2"), ("${LONG}", "1")].into_iter().collect();
        let c: PlaceholderMap = [("${S}", "3"), ("${LONG}", "1")].into_iter().collect();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn validate_reports_empty_keys_and_circular_values() {
        let map: PlaceholderMap = [(" ", "x"), ("${V}", "v${V}"), ("${E}", "")]
            .into_iter()
            .collect();
        let report = map.validate();
        assert!(!report.is_valid());
        assert_eq!(report.errors.len(), 1);
        assert!(report.warnings.iter().any(|w| w.contains("circular")));
        assert!(report.warnings.iter().any(|w| w.contains("${E}")));
    }
}
