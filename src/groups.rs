use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::InvariantViolation;
use crate::types::Properties;

/// Group types beyond this count are rejected.
pub const MAX_GROUP_TYPES: usize = 5;

/// A group as exposed to persistence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimGroup {
    pub group_type: String,
    pub group_type_index: usize,
    pub group_key: String,
    pub properties: Properties,
}

/// group type → group key → merged property bag.
///
/// Each cluster accumulates its own registry while it runs; the matrix merges
/// them in cluster-index order afterwards.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupRegistry {
    /// Group types in first-seen order; the position is the type index.
    types: Vec<String>,
    groups: BTreeMap<String, BTreeMap<String, Properties>>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the group (and its type, if new) and merge `set` into its properties.
    pub fn set(
        &mut self,
        group_type: &str,
        group_key: &str,
        set: &Properties,
    ) -> Result<(), InvariantViolation> {
        if !self.types.iter().any(|t| t == group_type) {
            if self.types.len() >= MAX_GROUP_TYPES {
                return Err(InvariantViolation::TooManyGroupTypes {
                    group_type: group_type.to_string(),
                    limit: MAX_GROUP_TYPES,
                });
            }
            self.types.push(group_type.to_string());
        }
        let properties = self
            .groups
            .entry(group_type.to_string())
            .or_default()
            .entry(group_key.to_string())
            .or_default();
        for (k, v) in set {
            properties.insert(k.clone(), v.clone());
        }
        Ok(())
    }

    /// Fold another registry into this one. Later writes win key by key.
    pub fn merge(&mut self, other: &GroupRegistry) -> Result<(), InvariantViolation> {
        for group_type in &other.types {
            if let Some(keys) = other.groups.get(group_type) {
                for (key, properties) in keys {
                    self.set(group_type, key, properties)?;
                }
            }
        }
        Ok(())
    }

    pub fn group_type_index(&self, group_type: &str) -> Option<usize> {
        self.types.iter().position(|t| t == group_type)
    }

    pub fn properties(&self, group_type: &str, group_key: &str) -> Option<&Properties> {
        self.groups.get(group_type)?.get(group_key)
    }

    /// Number of distinct groups across all types.
    pub fn len(&self) -> usize {
        self.groups.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flatten into `SimGroup`s ordered by type index, then key.
    pub fn to_groups(&self) -> Vec<SimGroup> {
        let mut out = Vec::with_capacity(self.len());
        for (index, group_type) in self.types.iter().enumerate() {
            let Some(keys) = self.groups.get(group_type) else { continue };
            for (key, properties) in keys {
                out.push(SimGroup {
                    group_type: group_type.clone(),
                    group_type_index: index,
                    group_key: key.clone(),
                    properties: properties.clone(),
                });
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn props(pairs: &[(&str, serde_json::Value)]) -> Properties {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn set_merges_properties_key_by_key() {
        let mut reg = GroupRegistry::new();
        reg.set("company", "acme.io", &props(&[("name", json!("Acme")), ("seats", json!(3))])).unwrap();
        reg.set("company", "acme.io", &props(&[("seats", json!(4))])).unwrap();
        let p = reg.properties("company", "acme.io").unwrap();
        assert_eq!(p["name"], "Acme");
        assert_eq!(p["seats"], 4);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn type_index_follows_first_seen_order() {
        let mut reg = GroupRegistry::new();
        reg.set("project", "p1", &Properties::new()).unwrap();
        reg.set("company", "c1", &Properties::new()).unwrap();
        assert_eq!(reg.group_type_index("project"), Some(0));
        assert_eq!(reg.group_type_index("company"), Some(1));
        let groups = reg.to_groups();
        assert_eq!(groups[0].group_type, "project");
        assert_eq!(groups[1].group_type_index, 1);
    }

    #[test]
    fn sixth_group_type_is_rejected() {
        let mut reg = GroupRegistry::new();
        for i in 0..MAX_GROUP_TYPES {
            reg.set(&format!("type{i}"), "k", &Properties::new()).unwrap();
        }
        let err = reg.set("one-too-many", "k", &Properties::new()).unwrap_err();
        assert_eq!(
            err,
            InvariantViolation::TooManyGroupTypes { group_type: "one-too-many".into(), limit: 5 }
        );
        // Existing types still accept new keys.
        reg.set("type0", "other", &Properties::new()).unwrap();
    }

    #[test]
    fn merge_applies_in_call_order() {
        let mut a = GroupRegistry::new();
        a.set("company", "acme.io", &props(&[("plan", json!("free"))])).unwrap();
        let mut b = GroupRegistry::new();
        b.set("company", "acme.io", &props(&[("plan", json!("pro"))])).unwrap();
        b.set("company", "zeta.dev", &Properties::new()).unwrap();

        let mut merged = GroupRegistry::new();
        merged.merge(&a).unwrap();
        merged.merge(&b).unwrap();
        assert_eq!(merged.properties("company", "acme.io").unwrap()["plan"], "pro");
        assert_eq!(merged.len(), 2);
    }
}
