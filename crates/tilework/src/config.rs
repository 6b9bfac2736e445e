use ops::DEFAULT_MASK_CACHE_ENTRIES;
use request_tracker::TrackerConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tile_scheduler::{SchedulerConfig, SchedulerConfigError};
use tiles::TileStoreConfig;

pub const DEFAULT_TILE_SIZE: u32 = 256;

/// Settings of one editing session; every field may be omitted in JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Edge length of a tile in pixels.
    pub tile_size: u32,
    pub mask_cache_entries: usize,
    pub store: TileStoreConfig,
    pub scheduler: SchedulerConfig,
    pub tracker: TrackerConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tile_size: DEFAULT_TILE_SIZE,
            mask_cache_entries: DEFAULT_MASK_CACHE_ENTRIES,
            store: TileStoreConfig::default(),
            scheduler: SchedulerConfig::default(),
            tracker: TrackerConfig::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("malformed session config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("tile_size must be at least 1")]
    ZeroTileSize,
    #[error("tile store needs at least one shard")]
    NoShards,
    #[error(transparent)]
    Scheduler(#[from] SchedulerConfigError),
}

impl SessionConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: SessionConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks what the components would otherwise assert on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tile_size == 0 {
            return Err(ConfigError::ZeroTileSize);
        }
        if self.store.shards == 0 {
            return Err(ConfigError::NoShards);
        }
        if self.scheduler.worker_count == 0 {
            return Err(SchedulerConfigError::NoWorkers.into());
        }
        if self.scheduler.max_attempts == 0 {
            return Err(SchedulerConfigError::NoAttempts.into());
        }
        Ok(())
    }
}
