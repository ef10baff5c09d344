use std::env;
use std::path::{Path, PathBuf};

pub const PAGE_SIZE_ENV: &str = "PERSONNEL_MIGRATE_PAGE_SIZE";
pub const MIN_FREE_BYTES_ENV: &str = "PERSONNEL_MIGRATE_MIN_FREE_BYTES";
pub const SNAPSHOT_DIR_ENV: &str = "PERSONNEL_MIGRATE_SNAPSHOT_DIR";
pub const LOG_DIR_ENV: &str = "PERSONNEL_MIGRATE_LOG_DIR";

const DEFAULT_PAGE_SIZE: u32 = 200;
const MAX_PAGE_SIZE: u32 = 5_000;
const DEFAULT_MIN_FREE_BYTES: u64 = 50_000_000;
const HARD_MAX_MIN_FREE_BYTES: u64 = 20_000_000_000;

const APP_DIR_NAME: &str = "personnel-migrate";
const DB_FILE_NAME: &str = "personnel.sqlite3";
const SNAPSHOT_DIR_NAME: &str = "snapshots";
const LOG_DIR_NAME: &str = "logs";

/// Engine settings resolved from the environment. CLI flags override these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationConfig {
    pub page_size: u32,
    pub min_free_bytes: u64,
    pub snapshot_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            min_free_bytes: DEFAULT_MIN_FREE_BYTES,
            snapshot_dir: None,
            log_dir: None,
        }
    }
}

impl MigrationConfig {
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let page_size = lookup(PAGE_SIZE_ENV)
            .and_then(|value| value.trim().parse::<u32>().ok())
            .map(clamp_page_size)
            .unwrap_or(DEFAULT_PAGE_SIZE);

        let min_free_bytes = lookup(MIN_FREE_BYTES_ENV)
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(|value| value.min(HARD_MAX_MIN_FREE_BYTES))
            .unwrap_or(DEFAULT_MIN_FREE_BYTES);

        let snapshot_dir = lookup(SNAPSHOT_DIR_ENV)
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from);
        let log_dir = lookup(LOG_DIR_ENV)
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from);

        Self {
            page_size,
            min_free_bytes,
            snapshot_dir,
            log_dir,
        }
    }

    pub fn with_page_size(mut self, page_size: Option<u32>) -> Self {
        if let Some(size) = page_size {
            self.page_size = clamp_page_size(size);
        }
        self
    }

    /// Snapshots live next to the database unless configured elsewhere.
    pub fn snapshot_dir_for(&self, db_path: &Path) -> PathBuf {
        self.snapshot_dir
            .clone()
            .unwrap_or_else(|| sibling_dir(db_path, SNAPSHOT_DIR_NAME))
    }

    pub fn log_dir_for(&self, db_path: &Path) -> PathBuf {
        self.log_dir
            .clone()
            .unwrap_or_else(|| sibling_dir(db_path, LOG_DIR_NAME))
    }
}

pub fn clamp_page_size(size: u32) -> u32 {
    size.clamp(1, MAX_PAGE_SIZE)
}

pub fn default_db_path() -> std::io::Result<PathBuf> {
    let base = match dirs::data_dir() {
        Some(dir) => dir,
        None => env::current_dir()?,
    };
    Ok(base.join(APP_DIR_NAME).join(DB_FILE_NAME))
}

fn sibling_dir(db_path: &Path, name: &str) -> PathBuf {
    db_path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map(|parent| parent.join(name))
        .unwrap_or_else(|| PathBuf::from(name))
}
