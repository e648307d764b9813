//! Persisted records.
//!
//! - `ConfigStore`: `config.yaml` (sites, weekly schedules, current status)
//! - `SiteStore`: `blocked-sites.yaml` (per-site blocks)
//! - `schedule`: edits applied to a loaded `Config`
//!
//! Records are read and written whole. A failed save leaves the previous
//! file content in place.

pub mod error;
pub mod schedule;

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, FixedOffset};
use serde::de::DeserializeOwned;
use serde::Serialize;

pub use error::{Result, StoreError};

use crate::timeutil::format_timestamp;
use crate::types::{validation, BlockEntry, Config, SiteList, ValidationError};

fn load_yaml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            StoreError::Missing(path.to_path_buf())
        } else {
            StoreError::Read {
                path: path.to_path_buf(),
                source,
            }
        }
    })?;
    if content.trim().is_empty() {
        return serde_yaml::from_str("{}").map_err(|source| StoreError::Parse {
            path: path.to_path_buf(),
            source,
        });
    }
    serde_yaml::from_str(&content).map_err(|source| StoreError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn save_yaml<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    let yaml = serde_yaml::to_string(record).map_err(StoreError::Serialize)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| StoreError::Write {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    // Write beside the target and rename so a failed write never truncates it.
    let tmp = path.with_extension("yaml.tmp");
    fs::write(&tmp, yaml).map_err(|source| StoreError::Write {
        path: tmp.clone(),
        source,
    })?;
    fs::rename(&tmp, path).map_err(|source| StoreError::Write {
        path: path.to_path_buf(),
        source,
    })
}

// ============================================================================
// ConfigStore
// ============================================================================

/// Reads and writes `config.yaml`.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    /// Creates a store for the file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the record.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the configuration.
    ///
    /// # Errors
    ///
    /// `Missing` when the file does not exist, `Parse` when it is malformed.
    pub fn load(&self) -> Result<Config> {
        load_yaml(&self.path)
    }

    /// Saves the configuration.
    pub fn save(&self, config: &Config) -> Result<()> {
        save_yaml(&self.path, config)?;
        tracing::debug!("saved configuration to {:?}", self.path);
        Ok(())
    }

    /// Writes a default configuration if none exists yet.
    pub fn ensure_exists(&self) -> Result<()> {
        if self.path.exists() {
            return Ok(());
        }
        tracing::info!("creating default configuration at {:?}", self.path);
        self.save(&Config::default())
    }

    /// Loads, applies `edit` and saves. Nothing is written if `edit` fails.
    pub fn update<T, F>(&self, edit: F) -> Result<T>
    where
        F: FnOnce(&mut Config) -> Result<T>,
    {
        let mut config = self.load()?;
        let value = edit(&mut config)?;
        self.save(&config)?;
        Ok(value)
    }
}

// ============================================================================
// SiteStore
// ============================================================================

/// Reads and writes `blocked-sites.yaml`.
///
/// A missing file reads as an empty list.
#[derive(Debug, Clone)]
pub struct SiteStore {
    path: PathBuf,
}

impl SiteStore {
    /// Creates a store for the file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the record.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the site list.
    pub fn load(&self) -> Result<SiteList> {
        match load_yaml(&self.path) {
            Err(StoreError::Missing(_)) => Ok(SiteList::default()),
            other => other,
        }
    }

    /// Saves the site list.
    pub fn save(&self, list: &SiteList) -> Result<()> {
        save_yaml(&self.path, list)
    }

    fn update<T, F>(&self, edit: F) -> Result<T>
    where
        F: FnOnce(&mut SiteList) -> Result<T>,
    {
        let mut list = self.load()?;
        let value = edit(&mut list)?;
        self.save(&list)?;
        Ok(value)
    }

    /// Adds an unblocked entry for `url`, returning the stored entry.
    pub fn add(&self, url: &str) -> Result<BlockEntry> {
        let url = validation::normalize_url(url)?;
        self.update(|list| {
            if list.get(&url).is_some() {
                return Err(ValidationError::DuplicateSite(url.clone()).into());
            }
            let entry = BlockEntry::new(url.clone());
            list.sites.push(entry.clone());
            Ok(entry)
        })
    }

    /// Removes the entry for `url`.
    pub fn remove(&self, url: &str) -> Result<BlockEntry> {
        let url = validation::normalize_url(url)?;
        self.update(|list| {
            let index = list
                .sites
                .iter()
                .position(|s| s.url == url)
                .ok_or_else(|| ValidationError::SiteNotFound(url.clone()))?;
            Ok(list.sites.remove(index))
        })
    }

    /// Sets the `currentlyBlocked` flag of `url`.
    pub fn set_blocked(&self, url: &str, blocked: bool) -> Result<()> {
        self.update(|list| {
            let entry = list
                .get_mut(url)
                .ok_or_else(|| ValidationError::SiteNotFound(url.to_string()))?;
            entry.currently_blocked = blocked;
            Ok(())
        })
    }

    /// Sets the expiry of `url`, or clears it with `None`.
    pub fn set_expiry(&self, url: &str, expiry: Option<&DateTime<FixedOffset>>) -> Result<()> {
        self.update(|list| {
            let entry = list
                .get_mut(url)
                .ok_or_else(|| ValidationError::SiteNotFound(url.to_string()))?;
            entry.duration = expiry.map(format_timestamp).unwrap_or_default();
            Ok(())
        })
    }

    /// Clears `currentlyBlocked` on every entry.
    pub fn clear_all_blocked(&self) -> Result<()> {
        self.update(|list| {
            for entry in &mut list.sites {
                entry.currently_blocked = false;
            }
            Ok(())
        })
    }
}
