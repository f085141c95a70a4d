use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::db;
use crate::ranking::RankMode;

pub const ENGINE_SETTINGS_KEY: &str = "reports.engine";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub rank_mode: RankMode,
    pub average_decimals: u32,
    /// 0 disables the deadline.
    pub batch_deadline_ms: u64,
    pub rank_batches: bool,
    pub lock_stale_after_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rank_mode: RankMode::Dense,
            average_decimals: 2,
            batch_deadline_ms: 120_000,
            rank_batches: true,
            lock_stale_after_ms: 600_000,
        }
    }
}

impl EngineConfig {
    pub fn deadline(&self) -> Option<Duration> {
        if self.batch_deadline_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.batch_deadline_ms))
        }
    }

    /// Overlay the keys present in `patch` onto this config.
    pub fn merged(&self, patch: &serde_json::Value) -> Result<EngineConfig, String> {
        let Some(patch) = patch.as_object() else {
            return Err("config must be an object".to_string());
        };
        let mut base = serde_json::to_value(self).map_err(|e| e.to_string())?;
        if let Some(obj) = base.as_object_mut() {
            for (k, v) in patch {
                obj.insert(k.clone(), v.clone());
            }
        }
        let merged: EngineConfig = serde_json::from_value(base).map_err(|e| e.to_string())?;
        if merged.average_decimals > 6 {
            return Err("averageDecimals must be between 0 and 6".to_string());
        }
        if merged.lock_stale_after_ms == 0 {
            return Err("lockStaleAfterMs must be greater than 0".to_string());
        }
        // A lock must outlive any run that still honours its deadline.
        if merged.batch_deadline_ms > 0 && merged.lock_stale_after_ms < merged.batch_deadline_ms {
            return Err("lockStaleAfterMs must not be below batchDeadlineMs".to_string());
        }
        Ok(merged)
    }
}

pub fn load(conn: &Connection) -> anyhow::Result<EngineConfig> {
    match db::settings_get_json(conn, ENGINE_SETTINGS_KEY)? {
        Some(v) => Ok(serde_json::from_value(v)?),
        None => Ok(EngineConfig::default()),
    }
}

pub fn save(conn: &Connection, config: &EngineConfig) -> anyhow::Result<()> {
    db::settings_set_json(conn, ENGINE_SETTINGS_KEY, &serde_json::to_value(config)?)
}
