// src/config.rs
// Two layers of configuration: `AppConfig` is the process bootstrap (file +
// environment, read once), `ConfigStore` is the persisted, live-mutable
// tuning the control surface edits while the miner runs.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use log::{info, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const MIN_WORKERS: u32 = 1;
pub const MAX_WORKERS: u32 = 1024;
pub const MIN_BATCH: u32 = 50;
pub const MAX_BATCH: u32 = 50_000;

/// Top-level bootstrap configuration.
///
/// Loaded from an optional `config.toml` plus `APP_`-prefixed environment
/// variables; environment wins.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    /// Base URL of the Scavenger Mine API
    pub base_url: String,

    /// Directory for wallet files, settings and receipts
    pub data_dir: String,

    /// Listen address of the control surface
    pub listen_addr: String,

    /// Endpoint returning the dev-fee destination address, if any
    pub devfee_url: Option<String>,

    /// Receipt/stats backend sink, if any
    pub backend_url: Option<String>,

    /// Bearer token for the backend sink
    pub backend_token: Option<String>,
}

impl AppConfig {
    /// Load configuration from file `config.toml` (optional) and ENV
    /// variables with prefix `APP_`.
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let builder = config::Config::builder()
            .set_default("base_url", "https://scavenger.prod.gd.midnighttge.io")?
            .set_default("data_dir", "./data")?
            .set_default("listen_addr", "127.0.0.1:9090")?
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP"));

        let cfg = builder.build()?;
        let settings: AppConfig = cfg.try_deserialize()?;
        Ok(settings)
    }

    pub fn data_path(&self, file: &str) -> PathBuf {
        Path::new(&self.data_dir).join(file)
    }
}

/// ------------------ Persisted tuning ------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MinerSettings {
    pub address_offset: u32,
    pub worker_threads: u32,
    pub batch_size: u32,
    pub dev_fee_enabled: bool,
    pub auto_resume: bool,
    pub was_mining_active: bool,
    pub last_updated: String,
}

impl Default for MinerSettings {
    fn default() -> Self {
        Self {
            address_offset: 0,
            worker_threads: 11,
            batch_size: 300,
            dev_fee_enabled: true,
            auto_resume: false,
            was_mining_active: false,
            last_updated: Utc::now().to_rfc3339(),
        }
    }
}

/// Partial update coming from the control surface.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsPatch {
    pub address_offset: Option<u32>,
    pub worker_threads: Option<u32>,
    pub batch_size: Option<u32>,
    pub dev_fee_enabled: Option<bool>,
    pub auto_resume: Option<bool>,
}

/// Persisted settings with atomic write-then-rename updates. Reads are
/// cheap snapshots; writers hold the lock across the disk write so a crash
/// never leaves a partial file visible.
pub struct ConfigStore {
    path: PathBuf,
    current: RwLock<MinerSettings>,
}

impl ConfigStore {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let settings = match fs::read_to_string(&path) {
            Ok(text) => {
                let s: MinerSettings = serde_json::from_str(&text).map_err(ConfigError::Parse)?;
                validate(&s)?;
                s
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No settings file at {}, using defaults", path.display());
                let s = MinerSettings::default();
                persist(&path, &s)?;
                s
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };
        Ok(Self {
            path,
            current: RwLock::new(settings),
        })
    }

    pub fn get(&self) -> MinerSettings {
        self.current.read().clone()
    }

    /// Applies a patch atomically. `mining_active` guards the offset change,
    /// which only takes effect from a stopped miner.
    pub fn update(&self, patch: &SettingsPatch, mining_active: bool) -> Result<MinerSettings, ConfigError> {
        let mut guard = self.current.write();
        let mut next = guard.clone();

        if let Some(offset) = patch.address_offset {
            if mining_active && offset != next.address_offset {
                return Err(ConfigError::OffsetWhileActive);
            }
            next.address_offset = offset;
        }
        if let Some(workers) = patch.worker_threads {
            next.worker_threads = workers;
        }
        if let Some(batch) = patch.batch_size {
            next.batch_size = batch;
        }
        if let Some(enabled) = patch.dev_fee_enabled {
            next.dev_fee_enabled = enabled;
        }
        if let Some(resume) = patch.auto_resume {
            next.auto_resume = resume;
        }
        validate(&next)?;
        next.last_updated = Utc::now().to_rfc3339();
        persist(&self.path, &next)?;
        *guard = next.clone();
        Ok(next)
    }

    /// Set at mining start, cleared at graceful stop; read by auto-resume.
    pub fn set_was_mining(&self, active: bool) {
        let mut guard = self.current.write();
        if guard.was_mining_active == active {
            return;
        }
        guard.was_mining_active = active;
        guard.last_updated = Utc::now().to_rfc3339();
        if let Err(e) = persist(&self.path, &guard) {
            warn!("Could not persist wasMiningActive={}: {}", active, e);
        }
    }
}

fn validate(s: &MinerSettings) -> Result<(), ConfigError> {
    if !(MIN_WORKERS..=MAX_WORKERS).contains(&s.worker_threads) {
        return Err(ConfigError::InvalidWorkerThreads(s.worker_threads));
    }
    if !(MIN_BATCH..=MAX_BATCH).contains(&s.batch_size) {
        return Err(ConfigError::InvalidBatchSize(s.batch_size));
    }
    Ok(())
}

/// Write to a sibling temp file, restrict permissions, then rename over the
/// target so readers never observe a torn file.
fn persist(path: &Path, settings: &MinerSettings) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    let text = serde_json::to_string_pretty(settings).map_err(ConfigError::Parse)?;
    fs::write(&tmp, text)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(&tmp)?.permissions();
        perms.set_mode(0o600);
        fs::set_permissions(&tmp, perms)?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}
