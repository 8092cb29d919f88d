// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Named sync configurations persisted in the row store.
//!
//! A configuration says which rows move from a source table to a target
//! table, how their columns are renamed on the way, and which side wins
//! when both copies changed. Conflict handling is a closed set of
//! strategies; there is no way to plug in arbitrary code.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::storage::traits::{Filter, Row, RowStore};

/// Table holding one row per configuration
pub const SYNC_CONFIG_TABLE: &str = "sync_configurations";

/// How a row that changed on both sides is settled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum ConflictResolution {
    LocalWins,
    RemoteWins,
    /// Newer value of `field` wins (RFC 3339 strings or epoch numbers).
    /// A side without a readable timestamp loses; a tie goes to remote.
    LatestTimestamp { field: String },
    /// Union of both rows; on a shared column the preferred side wins.
    FieldMerge { prefer_local: bool },
}

impl Default for ConflictResolution {
    fn default() -> Self {
        Self::LatestTimestamp {
            field: "updated_at".into(),
        }
    }
}

impl ConflictResolution {
    #[must_use]
    pub fn resolve(&self, local: &Row, remote: &Row) -> Row {
        match self {
            Self::LocalWins => local.clone(),
            Self::RemoteWins => remote.clone(),
            Self::LatestTimestamp { field } => {
                match (timestamp_of(local, field), timestamp_of(remote, field)) {
                    (Some(l), Some(r)) if l > r => local.clone(),
                    (Some(_), None) => local.clone(),
                    _ => remote.clone(),
                }
            }
            Self::FieldMerge { prefer_local } => {
                let (base, preferred) = if *prefer_local { (remote, local) } else { (local, remote) };
                let mut merged = base.clone();
                for (k, v) in preferred {
                    merged.insert(k.clone(), v.clone());
                }
                merged
            }
        }
    }
}

/// Milliseconds since the epoch.
fn timestamp_of(row: &Row, field: &str) -> Option<f64> {
    match row.get(field)? {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.timestamp_millis() as f64),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

/// Source column → target column. Unmapped columns pass through unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldMapping(pub BTreeMap<String, String>);

impl FieldMapping {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn rename(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.0.insert(from.into(), to.into());
        self
    }

    #[must_use]
    pub fn apply(&self, row: &Row) -> Row {
        row.iter()
            .map(|(k, v)| (self.0.get(k).cloned().unwrap_or_else(|| k.clone()), v.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SyncSchedule {
    /// Only when triggered explicitly
    Manual,
    /// As changes arrive
    Realtime,
    Interval { every_secs: u64 },
}

impl Default for SyncSchedule {
    fn default() -> Self {
        Self::Manual
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfiguration {
    pub name: String,
    pub source_table: String,
    pub target_table: String,
    #[serde(default)]
    pub schedule: SyncSchedule,
    #[serde(default)]
    pub field_mapping: FieldMapping,
    /// Source rows outside this filter are not synced
    #[serde(default)]
    pub filter: Filter,
    #[serde(default)]
    pub conflict_resolution: ConflictResolution,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_enabled() -> bool {
    true
}

impl SyncConfiguration {
    pub fn new(name: impl Into<String>, source_table: impl Into<String>, target_table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source_table: source_table.into(),
            target_table: target_table.into(),
            schedule: SyncSchedule::default(),
            field_mapping: FieldMapping::default(),
            filter: Filter::all(),
            conflict_resolution: ConflictResolution::default(),
            enabled: default_enabled(),
            updated_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_mapping(mut self, mapping: FieldMapping) -> Self {
        self.field_mapping = mapping;
        self
    }

    #[must_use]
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    #[must_use]
    pub fn with_conflict_resolution(mut self, resolution: ConflictResolution) -> Self {
        self.conflict_resolution = resolution;
        self
    }

    #[must_use]
    pub fn with_schedule(mut self, schedule: SyncSchedule) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(SyncError::InvalidOperation("sync configuration has no name".into()));
        }
        if self.source_table.trim().is_empty() || self.target_table.trim().is_empty() {
            return Err(SyncError::InvalidOperation(format!(
                "sync configuration '{}' needs both a source and a target table",
                self.name
            )));
        }
        if let SyncSchedule::Interval { every_secs: 0 } = self.schedule {
            return Err(SyncError::InvalidOperation(format!(
                "sync configuration '{}' has a zero interval",
                self.name
            )));
        }
        Ok(())
    }

    /// Target-shaped copy of `row`, or `None` when the row is filtered out
    /// or the configuration is disabled.
    #[must_use]
    pub fn prepare(&self, row: &Row) -> Option<Row> {
        if !self.enabled || !self.filter.matches(row) {
            return None;
        }
        Some(self.field_mapping.apply(row))
    }

    fn to_row(&self) -> Result<Row> {
        match serde_json::to_value(self)? {
            Value::Object(row) => Ok(row),
            other => Err(SyncError::InvalidOperation(format!(
                "sync configuration serialized to a non-object: {}",
                other
            ))),
        }
    }
}

/// CRUD over [`SYNC_CONFIG_TABLE`], keyed by configuration name.
pub struct SyncConfigurationStore {
    store: Arc<dyn RowStore>,
}

impl SyncConfigurationStore {
    pub fn new(store: Arc<dyn RowStore>) -> Self {
        Self { store }
    }

    /// Insert or replace by name. Returns the configuration as stored.
    #[tracing::instrument(skip(self, config), fields(name = %config.name))]
    pub async fn save(&self, config: &SyncConfiguration) -> Result<SyncConfiguration> {
        config.validate()?;
        let mut saved = config.clone();
        saved.updated_at = Utc::now();
        let row = saved.to_row()?;
        let by_name = Filter::eq("name", saved.name.as_str());

        let existing = self.store.select(SYNC_CONFIG_TABLE, &by_name, Some(1)).await?;
        if existing.is_empty() {
            self.store.insert(SYNC_CONFIG_TABLE, vec![row]).await?;
            info!("Sync configuration created");
        } else {
            self.store.update(SYNC_CONFIG_TABLE, &by_name, row).await?;
            debug!("Sync configuration updated");
        }
        Ok(saved)
    }

    pub async fn load(&self, name: &str) -> Result<SyncConfiguration> {
        let rows = self
            .store
            .select(SYNC_CONFIG_TABLE, &Filter::eq("name", name), Some(1))
            .await?;
        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| SyncError::ConfigurationNotFound(name.to_string()))?;
        Ok(serde_json::from_value(Value::Object(row))?)
    }

    /// Every readable configuration, sorted by name. Unreadable rows are
    /// skipped with a warning.
    pub async fn list(&self) -> Result<Vec<SyncConfiguration>> {
        let rows = self.store.select(SYNC_CONFIG_TABLE, &Filter::all(), None).await?;
        let mut configs: Vec<SyncConfiguration> = rows
            .into_iter()
            .filter_map(|row| match serde_json::from_value(Value::Object(row)) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable sync configuration row");
                    None
                }
            })
            .collect();
        configs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(configs)
    }

    /// Returns whether a configuration was removed.
    pub async fn delete(&self, name: &str) -> Result<bool> {
        let removed = self
            .store
            .delete(SYNC_CONFIG_TABLE, &Filter::eq("name", name))
            .await?;
        if removed > 0 {
            info!(name, "Sync configuration deleted");
        }
        Ok(removed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::InMemoryRowStore;
    use serde_json::json;

    fn row(v: Value) -> Row {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_latest_timestamp_picks_newer_side() {
        let rule = ConflictResolution::default();
        let local = row(json!({"id": 1, "price": 5, "updated_at": "2026-03-01T10:00:00Z"}));
        let remote = row(json!({"id": 1, "price": 6, "updated_at": "2026-03-01T09:00:00Z"}));
        assert_eq!(rule.resolve(&local, &remote)["price"], 5);

        let newer_remote = row(json!({"id": 1, "price": 7, "updated_at": "2026-03-02T00:00:00+00:00"}));
        assert_eq!(rule.resolve(&local, &newer_remote)["price"], 7);
    }

    #[test]
    fn test_latest_timestamp_missing_and_ties() {
        let rule = ConflictResolution::LatestTimestamp { field: "ts".into() };
        let stamped = row(json!({"v": "local", "ts": 100}));
        let unstamped = row(json!({"v": "remote"}));
        assert_eq!(rule.resolve(&stamped, &unstamped)["v"], "local");
        assert_eq!(rule.resolve(&unstamped, &unstamped)["v"], "remote");

        let tie = row(json!({"v": "remote", "ts": 100}));
        assert_eq!(rule.resolve(&stamped, &tie)["v"], "remote");
    }

    #[test]
    fn test_field_merge_prefers_one_side() {
        let local = row(json!({"name": "Local", "stock": 3}));
        let remote = row(json!({"name": "Remote", "price": 9}));

        let merged = ConflictResolution::FieldMerge { prefer_local: true }.resolve(&local, &remote);
        assert_eq!(merged, row(json!({"name": "Local", "stock": 3, "price": 9})));

        let merged = ConflictResolution::FieldMerge { prefer_local: false }.resolve(&local, &remote);
        assert_eq!(merged["name"], "Remote");
        assert_eq!(merged["stock"], 3);
    }

    #[test]
    fn test_fixed_winners() {
        let local = row(json!({"v": 1}));
        let remote = row(json!({"v": 2}));
        assert_eq!(ConflictResolution::LocalWins.resolve(&local, &remote)["v"], 1);
        assert_eq!(ConflictResolution::RemoteWins.resolve(&local, &remote)["v"], 2);
    }

    #[test]
    fn test_mapping_and_filter() {
        let config = SyncConfiguration::new("catalog", "products", "pos_items")
            .with_mapping(FieldMapping::new().rename("name", "title"))
            .with_filter(Filter::eq("active", true));

        let prepared = config
            .prepare(&row(json!({"id": "p1", "name": "Tea", "active": true})))
            .unwrap();
        assert_eq!(prepared, row(json!({"id": "p1", "title": "Tea", "active": true})));
        assert!(config.prepare(&row(json!({"id": "p2", "active": false}))).is_none());

        let disabled = SyncConfiguration { enabled: false, ..config };
        assert!(disabled.prepare(&row(json!({"active": true}))).is_none());
    }

    #[test]
    fn test_validation() {
        assert!(SyncConfiguration::new("", "a", "b").validate().is_err());
        assert!(SyncConfiguration::new("x", "a", " ").validate().is_err());
        assert!(SyncConfiguration::new("x", "a", "b")
            .with_schedule(SyncSchedule::Interval { every_secs: 0 })
            .validate()
            .is_err());
        assert!(SyncConfiguration::new("x", "a", "b").validate().is_ok());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: SyncConfiguration =
            serde_json::from_str(r#"{"name": "n", "source_table": "a", "target_table": "b"}"#).unwrap();
        assert!(config.enabled);
        assert_eq!(config.schedule, SyncSchedule::Manual);
        assert_eq!(config.conflict_resolution, ConflictResolution::default());
        assert!(config.filter.is_empty());
    }

    #[tokio::test]
    async fn test_store_crud() {
        let rows = Arc::new(InMemoryRowStore::new());
        let configs = SyncConfigurationStore::new(rows.clone());

        let config = SyncConfiguration::new("inventory", "stock", "pos_stock")
            .with_schedule(SyncSchedule::Interval { every_secs: 300 })
            .with_conflict_resolution(ConflictResolution::FieldMerge { prefer_local: true });
        configs.save(&config).await.unwrap();
        configs.save(&SyncConfiguration::new("catalog", "products", "pos_items")).await.unwrap();

        let loaded = configs.load("inventory").await.unwrap();
        assert_eq!(loaded.schedule, SyncSchedule::Interval { every_secs: 300 });
        assert_eq!(loaded.conflict_resolution, ConflictResolution::FieldMerge { prefer_local: true });

        // Saving again replaces rather than duplicates
        configs
            .save(&SyncConfiguration { enabled: false, ..loaded })
            .await
            .unwrap();
        assert_eq!(rows.len(SYNC_CONFIG_TABLE), 2);
        assert!(!configs.load("inventory").await.unwrap().enabled);

        let names: Vec<_> = configs.list().await.unwrap().into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["catalog", "inventory"]);

        assert!(configs.delete("catalog").await.unwrap());
        assert!(!configs.delete("catalog").await.unwrap());
        assert!(matches!(
            configs.load("catalog").await,
            Err(SyncError::ConfigurationNotFound(name)) if name == "catalog"
        ));
    }

    #[tokio::test]
    async fn test_invalid_configuration_not_saved() {
        let rows = Arc::new(InMemoryRowStore::new());
        let configs = SyncConfigurationStore::new(rows.clone());
        assert!(configs.save(&SyncConfiguration::new("", "a", "b")).await.is_err());
        assert!(rows.is_empty(SYNC_CONFIG_TABLE));
    }
}
