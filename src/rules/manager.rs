//! Rule manager.
//!
//! Owns the keyed rule collection behind a single-writer lock and publishes
//! a copy-on-write snapshot of the enabled rules. The hot path clones the
//! snapshot `Arc` and never contends with admin writes.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{builtin, Rule, RuleFileEntry, RuleSnapshot, RuleSource, Severity};
use crate::error::{Error, Result};

/// Partial update applied to an existing rule. Unset fields keep their
/// current value; a changed pattern is recompiled into a replacement rule.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RuleUpdate {
    pub name: Option<String>,
    pub category: Option<String>,
    pub pattern: Option<String>,
    pub score: Option<f64>,
    pub severity: Option<Severity>,
    pub description: Option<String>,
    pub tags: Option<Vec<String>>,
    pub enabled: Option<bool>,
}

/// Summary counts over the rule collection.
#[derive(Debug, Clone, Serialize)]
pub struct RuleStats {
    pub total: usize,
    pub enabled: usize,
    pub by_category: HashMap<String, usize>,
    pub by_source: HashMap<String, usize>,
}

struct RuleStore {
    rules: HashMap<String, Arc<Rule>>,
    snapshot: RuleSnapshot,
}

impl RuleStore {
    fn rebuild_snapshot(&mut self) {
        let mut enabled: Vec<Arc<Rule>> = self
            .rules
            .values()
            .filter(|r| r.enabled)
            .cloned()
            .collect();
        enabled.sort_by(|a, b| a.id.cmp(&b.id));
        self.snapshot = Arc::new(enabled);
    }
}

/// Thread-safe owner of the rule collection.
pub struct RuleManager {
    store: RwLock<RuleStore>,
}

impl RuleManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self {
            store: RwLock::new(RuleStore {
                rules: HashMap::new(),
                snapshot: Arc::new(Vec::new()),
            }),
        }
    }

    /// Create a manager pre-loaded with the embedded catalog.
    pub fn with_builtin() -> Result<Self> {
        let manager = Self::new();
        let count = manager.load_builtin()?;
        info!(rules = count, "loaded builtin rule catalog");
        Ok(manager)
    }

    /// Load the embedded catalog; returns the number of rules added.
    pub fn load_builtin(&self) -> Result<usize> {
        let rules = builtin::rules()?;
        let mut store = self.store.write();
        let mut added = 0;
        for rule in rules {
            if store.rules.contains_key(&rule.id) {
                continue;
            }
            store.rules.insert(rule.id.clone(), Arc::new(rule));
            added += 1;
        }
        store.rebuild_snapshot();
        Ok(added)
    }

    /// Load rules from a JSON file. Invalid entries are skipped with a
    /// warning; the batch never fails on a bad pattern.
    pub fn load_file(&self, path: &Path) -> Result<usize> {
        let data = std::fs::read_to_string(path).map_err(|source| Error::FileLoad {
            path: path.to_path_buf(),
            source,
        })?;
        let entries: Vec<RuleFileEntry> =
            serde_json::from_str(&data).map_err(|source| Error::Json {
                context: format!("rule file {}", path.display()),
                source,
            })?;
        Ok(self.merge_entries(&entries, RuleSource::Custom))
    }

    /// Import rules from a JSON file with source `Imported`.
    pub fn import_file(&self, path: &Path) -> Result<usize> {
        let data = std::fs::read_to_string(path).map_err(|source| Error::FileLoad {
            path: path.to_path_buf(),
            source,
        })?;
        let entries: Vec<RuleFileEntry> =
            serde_json::from_str(&data).map_err(|source| Error::Json {
                context: format!("rule import {}", path.display()),
                source,
            })?;
        Ok(self.merge_entries(&entries, RuleSource::Imported))
    }

    /// Export rules as a JSON array, optionally filtered by category.
    /// Returns the number of rules written.
    pub fn export_file(&self, path: &Path, category: Option<&str>) -> Result<usize> {
        let entries: Vec<RuleFileEntry> = {
            let store = self.store.read();
            store
                .rules
                .values()
                .filter(|r| category.map_or(true, |c| r.category == c))
                .map(|r| RuleFileEntry::from_rule(r))
                .collect()
        };
        let json = serde_json::to_string_pretty(&entries).map_err(|source| Error::Json {
            context: "rule export".to_string(),
            source,
        })?;
        std::fs::write(path, json).map_err(|source| Error::FileLoad {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(entries.len())
    }

    /// Merge entries, skipping ids that already exist and entries that fail
    /// to compile. Returns the number added.
    pub fn merge_entries(&self, entries: &[RuleFileEntry], source: RuleSource) -> usize {
        let mut store = self.store.write();
        let mut added = 0;
        for entry in entries {
            if store.rules.contains_key(&entry.id) {
                continue;
            }
            match entry.compile(source) {
                Ok(rule) => {
                    store.rules.insert(rule.id.clone(), Arc::new(rule));
                    added += 1;
                }
                Err(e) => {
                    warn!(rule_id = %entry.id, error = %e, "skipping invalid rule");
                }
            }
        }
        store.rebuild_snapshot();
        added
    }

    /// Add a single rule; fails on a duplicate id.
    pub fn add(&self, rule: Rule) -> Result<()> {
        let mut store = self.store.write();
        if store.rules.contains_key(&rule.id) {
            return Err(Error::DuplicateRuleId { id: rule.id });
        }
        store.rules.insert(rule.id.clone(), Arc::new(rule));
        store.rebuild_snapshot();
        Ok(())
    }

    /// Apply a partial update; the stored rule is replaced wholesale.
    pub fn update(&self, id: &str, delta: RuleUpdate) -> Result<()> {
        let mut store = self.store.write();
        let current = store
            .rules
            .get(id)
            .ok_or_else(|| Error::UnknownRuleId { id: id.to_string() })?;

        let mut next = (**current).clone();
        if let Some(name) = delta.name {
            next.name = name;
        }
        if let Some(category) = delta.category {
            next.category = category;
        }
        if let Some(pattern) = delta.pattern {
            next.pattern =
                regex::Regex::new(&pattern).map_err(|source| Error::PatternCompile {
                    pattern: pattern.clone(),
                    source,
                })?;
            next.pattern_str = pattern;
        }
        if let Some(score) = delta.score {
            if !score.is_finite() || score < 0.0 {
                return Err(Error::config(format!(
                    "rule {id} update has invalid score {score}"
                )));
            }
            next.score = score;
        }
        if let Some(severity) = delta.severity {
            next.severity = severity;
        }
        if let Some(description) = delta.description {
            next.description = description;
        }
        if let Some(tags) = delta.tags {
            next.tags = tags;
        }
        if let Some(enabled) = delta.enabled {
            next.enabled = enabled;
        }

        store.rules.insert(id.to_string(), Arc::new(next));
        store.rebuild_snapshot();
        Ok(())
    }

    /// Delete a rule. Only custom rules may be deleted.
    pub fn delete(&self, id: &str) -> Result<()> {
        let mut store = self.store.write();
        let rule = store
            .rules
            .get(id)
            .ok_or_else(|| Error::UnknownRuleId { id: id.to_string() })?;
        if rule.source != RuleSource::Custom {
            return Err(Error::RuleNotDeletable {
                id: id.to_string(),
                source_kind: rule.source.to_string(),
            });
        }
        store.rules.remove(id);
        store.rebuild_snapshot();
        Ok(())
    }

    /// Enable or disable a rule.
    pub fn toggle(&self, id: &str, enabled: bool) -> Result<()> {
        self.update(
            id,
            RuleUpdate {
                enabled: Some(enabled),
                ..Default::default()
            },
        )
    }

    /// Look up a rule by id.
    pub fn get(&self, id: &str) -> Option<Arc<Rule>> {
        self.store.read().rules.get(id).cloned()
    }

    /// Current snapshot of enabled rules; cheap to clone and lock-free to
    /// read afterwards.
    pub fn enabled_rules(&self) -> RuleSnapshot {
        self.store.read().snapshot.clone()
    }

    /// Rules in a category, enabled or not.
    pub fn by_category(&self, category: &str) -> Vec<Arc<Rule>> {
        self.store
            .read()
            .rules
            .values()
            .filter(|r| r.category == category)
            .cloned()
            .collect()
    }

    /// Summary counts.
    pub fn stats(&self) -> RuleStats {
        let store = self.store.read();
        let mut by_category: HashMap<String, usize> = HashMap::new();
        let mut by_source: HashMap<String, usize> = HashMap::new();
        let mut enabled = 0;
        for rule in store.rules.values() {
            *by_category.entry(rule.category.clone()).or_insert(0) += 1;
            *by_source.entry(rule.source.to_string()).or_insert(0) += 1;
            if rule.enabled {
                enabled += 1;
            }
        }
        RuleStats {
            total: store.rules.len(),
            enabled,
            by_category,
            by_source,
        }
    }
}

impl Default for RuleManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::RuleBuilder;

    fn custom_rule(id: &str) -> Rule {
        RuleBuilder::new(id, "Test rule", "custom")
            .pattern("EVIL")
            .score(3.0)
            .build()
            .unwrap()
    }

    #[test]
    fn test_builtin_load_idempotent() {
        let manager = RuleManager::with_builtin().unwrap();
        let first = manager.stats().total;
        let added = manager.load_builtin().unwrap();
        assert_eq!(added, 0);
        assert_eq!(manager.stats().total, first);
    }

    #[test]
    fn test_add_get_delete_roundtrip() {
        let manager = RuleManager::new();
        manager.add(custom_rule("custom-1")).unwrap();
        assert!(manager.get("custom-1").is_some());

        manager.delete("custom-1").unwrap();
        assert!(manager.get("custom-1").is_none());
    }

    #[test]
    fn test_add_duplicate_fails() {
        let manager = RuleManager::new();
        manager.add(custom_rule("custom-1")).unwrap();
        assert!(matches!(
            manager.add(custom_rule("custom-1")),
            Err(Error::DuplicateRuleId { .. })
        ));
    }

    #[test]
    fn test_delete_builtin_refused() {
        let manager = RuleManager::with_builtin().unwrap();
        let err = manager.delete("scanner-001").unwrap_err();
        assert!(matches!(err, Error::RuleNotDeletable { .. }));
    }

    #[test]
    fn test_update_reflects_delta() {
        let manager = RuleManager::new();
        manager.add(custom_rule("custom-1")).unwrap();
        manager
            .update(
                "custom-1",
                RuleUpdate {
                    score: Some(9.0),
                    pattern: Some("WORSE".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();

        let rule = manager.get("custom-1").unwrap();
        assert_eq!(rule.score, 9.0);
        assert!(rule.pattern.is_match("WORSE"));
        assert!(!rule.pattern.is_match("EVIL"));
    }

    #[test]
    fn test_update_replaces_rather_than_mutates() {
        let manager = RuleManager::new();
        manager.add(custom_rule("custom-1")).unwrap();
        let before = manager.get("custom-1").unwrap();
        manager
            .update(
                "custom-1",
                RuleUpdate {
                    score: Some(7.0),
                    ..Default::default()
                },
            )
            .unwrap();
        // The old Arc still sees the old value; the store holds a new rule.
        assert_eq!(before.score, 3.0);
        assert_eq!(manager.get("custom-1").unwrap().score, 7.0);
    }

    #[test]
    fn test_toggle_removes_from_snapshot() {
        let manager = RuleManager::new();
        manager.add(custom_rule("custom-1")).unwrap();
        assert_eq!(manager.enabled_rules().len(), 1);

        manager.toggle("custom-1", false).unwrap();
        assert_eq!(manager.enabled_rules().len(), 0);
        // The rule still exists.
        assert!(manager.get("custom-1").is_some());
    }

    #[test]
    fn test_merge_skips_invalid_and_existing() {
        let manager = RuleManager::new();
        manager.add(custom_rule("keep")).unwrap();

        let entries = vec![
            RuleFileEntry {
                id: "keep".to_string(),
                name: "dup".to_string(),
                category: "c".to_string(),
                pattern: "x".to_string(),
                score: 1.0,
                flags: String::new(),
                description: String::new(),
                severity: Severity::Medium,
                tags: vec![],
                enabled: true,
            },
            RuleFileEntry {
                id: "bad".to_string(),
                name: "bad".to_string(),
                category: "c".to_string(),
                pattern: "(unclosed".to_string(),
                score: 1.0,
                flags: String::new(),
                description: String::new(),
                severity: Severity::Medium,
                tags: vec![],
                enabled: true,
            },
            RuleFileEntry {
                id: "good".to_string(),
                name: "good".to_string(),
                category: "c".to_string(),
                pattern: "ok".to_string(),
                score: 2.0,
                flags: String::new(),
                description: String::new(),
                severity: Severity::Medium,
                tags: vec![],
                enabled: true,
            },
        ];

        let added = manager.merge_entries(&entries, RuleSource::Community);
        assert_eq!(added, 1);
        // Existing rule untouched.
        assert_eq!(manager.get("keep").unwrap().name, "Test rule");
        assert_eq!(manager.get("good").unwrap().source, RuleSource::Community);
    }

    #[test]
    fn test_import_export_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");

        let manager = RuleManager::new();
        manager.add(custom_rule("custom-1")).unwrap();
        manager.add(custom_rule("custom-2")).unwrap();
        let written = manager.export_file(&path, None).unwrap();
        assert_eq!(written, 2);

        let fresh = RuleManager::new();
        let imported = fresh.import_file(&path).unwrap();
        assert_eq!(imported, 2);
        assert_eq!(fresh.get("custom-1").unwrap().source, RuleSource::Imported);
    }

    #[test]
    fn test_stats() {
        let manager = RuleManager::with_builtin().unwrap();
        manager.add(custom_rule("custom-1")).unwrap();
        let stats = manager.stats();
        assert_eq!(stats.total, stats.enabled);
        assert_eq!(stats.by_source.get("custom"), Some(&1));
        assert!(stats.by_category.get("scanner").copied().unwrap_or(0) >= 2);
    }
}
