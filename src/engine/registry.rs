//! Ordered key registry.
//!
//! Keys are partitioned into priority and secondary classes. The selector
//! walks them in canonical order (priority keys in config order, then
//! secondary keys in config order), so the first available key stays
//! sticky across requests and the upstream can keep its prompt cache warm.

use serde::Serialize;

/// Class of an API key within the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyClass {
    Priority,
    Secondary,
}

/// A pool key with its stable identity.
#[derive(Debug, Clone)]
pub struct KeyInfo {
    pub key: String,
    pub class: KeyClass,
    /// Position in canonical order across both classes
    pub index: usize,
}

/// Stable ordered list of all pool keys.
#[derive(Debug, Clone, Default)]
pub struct KeyRegistry {
    keys: Vec<KeyInfo>,
}

impl KeyRegistry {
    /// Build the registry from the configured key lists.
    pub fn new(priority_keys: &[String], secondary_keys: &[String]) -> Self {
        let mut keys = Vec::with_capacity(priority_keys.len() + secondary_keys.len());
        for key in priority_keys {
            keys.push(KeyInfo {
                key: key.clone(),
                class: KeyClass::Priority,
                index: keys.len(),
            });
        }
        for key in secondary_keys {
            keys.push(KeyInfo {
                key: key.clone(),
                class: KeyClass::Secondary,
                index: keys.len(),
            });
        }
        Self { keys }
    }

    /// Iterate keys in canonical order.
    pub fn iter(&self) -> impl Iterator<Item = &KeyInfo> {
        self.keys.iter()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Whether a key belongs to the current pool.
    pub fn contains(&self, key: &str) -> bool {
        self.keys.iter().any(|k| k.key == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_order_priority_first() {
        let registry = KeyRegistry::new(
            &["P1".to_string(), "P2".to_string()],
            &["S1".to_string(), "S2".to_string()],
        );

        let order: Vec<_> = registry.iter().map(|k| k.key.as_str()).collect();
        assert_eq!(order, vec!["P1", "P2", "S1", "S2"]);

        let classes: Vec<_> = registry.iter().map(|k| k.class).collect();
        assert_eq!(
            classes,
            vec![
                KeyClass::Priority,
                KeyClass::Priority,
                KeyClass::Secondary,
                KeyClass::Secondary
            ]
        );
    }

    #[test]
    fn test_indexes_are_stable_across_classes() {
        let registry = KeyRegistry::new(&["P1".to_string()], &["S1".to_string()]);
        let indexes: Vec<_> = registry.iter().map(|k| k.index).collect();
        assert_eq!(indexes, vec![0, 1]);
    }

    #[test]
    fn test_contains() {
        let registry = KeyRegistry::new(&["P1".to_string()], &[]);
        assert!(registry.contains("P1"));
        assert!(!registry.contains("S1"));
        assert_eq!(registry.len(), 1);
        assert!(!registry.is_empty());
    }
}
