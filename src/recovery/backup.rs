// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Checksummed backup points.
//!
//! A backup is taken before a recovery attempt touches data. The payload is
//! stored serialized with its SHA-256; restoring recomputes the digest and
//! refuses a payload that no longer matches.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Result, SyncError};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackupPoint {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub operation: String,
    /// Serialized JSON payload
    pub payload: String,
    /// Hex SHA-256 of `payload`
    pub checksum: String,
    pub size: usize,
}

fn checksum(payload: &str) -> String {
    hex::encode(Sha256::digest(payload.as_bytes()))
}

impl BackupPoint {
    fn new(operation: &str, payload: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            operation: operation.to_string(),
            checksum: checksum(&payload),
            size: payload.len(),
            payload,
        }
    }

    /// Check the stored checksum against the payload.
    pub fn verify(&self) -> Result<()> {
        let actual = checksum(&self.payload);
        if actual == self.checksum {
            Ok(())
        } else {
            Err(SyncError::BackupCorrupt {
                backup_id: self.id.clone(),
                expected: self.checksum.clone(),
                actual,
            })
        }
    }

    /// Verified payload.
    pub fn restore(&self) -> Result<Value> {
        self.verify()?;
        Ok(serde_json::from_str(&self.payload)?)
    }
}

/// Bounded store of backup points, evicted oldest first.
pub struct BackupManager {
    capacity: usize,
    points: Mutex<VecDeque<BackupPoint>>,
}

impl BackupManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            points: Mutex::new(VecDeque::new()),
        }
    }

    pub fn create(&self, operation: &str, payload: &Value) -> Result<BackupPoint> {
        let point = BackupPoint::new(operation, serde_json::to_string(payload)?);
        crate::metrics::record_backup("create", point.size);

        let mut points = self.points.lock();
        while points.len() >= self.capacity {
            if let Some(evicted) = points.pop_front() {
                debug!(backup_id = %evicted.id, "Evicted oldest backup point");
            }
        }
        points.push_back(point.clone());
        debug!(backup_id = %point.id, operation, size = point.size, "Backup point created");
        Ok(point)
    }

    /// Restore by id. Unknown ids are `ConfigurationNotFound`; a payload
    /// that fails its checksum is `BackupCorrupt`.
    pub fn restore(&self, backup_id: &str) -> Result<Value> {
        let point = self
            .get(backup_id)
            .ok_or_else(|| SyncError::ConfigurationNotFound(format!("backup '{}'", backup_id)))?;
        let restored = point.restore();
        match &restored {
            Ok(_) => crate::metrics::record_backup("restore", point.size),
            Err(e) => warn!(backup_id, error = %e, "Backup restore refused"),
        }
        restored
    }

    #[must_use]
    pub fn get(&self, backup_id: &str) -> Option<BackupPoint> {
        self.points.lock().iter().find(|p| p.id == backup_id).cloned()
    }

    /// Most recent backup taken for `operation`.
    #[must_use]
    pub fn latest_for(&self, operation: &str) -> Option<BackupPoint> {
        self.points.lock().iter().rev().find(|p| p.operation == operation).cloned()
    }

    /// All points, oldest first.
    #[must_use]
    pub fn list(&self) -> Vec<BackupPoint> {
        self.points.lock().iter().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.points.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.points.lock().clear();
    }

    #[cfg(test)]
    pub(crate) fn tamper(&self, backup_id: &str, payload: &str) {
        if let Some(p) = self.points.lock().iter_mut().find(|p| p.id == backup_id) {
            p.payload = payload.to_string();
        }
    }
}

impl Default for BackupManager {
    fn default() -> Self {
        Self::new(100)
    }
}
