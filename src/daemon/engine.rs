//! Block engine.
//!
//! Decides what to block and until when, and keeps three pieces of state in
//! step: the timer registry, the persisted records and the hosts file.
//!
//! - Schedule-driven and custom-time blocks cover every configured site
//!   under the `combined` key.
//! - Per-site blocks use the site URL as key.
//! - Strict mode refuses to lift or shorten a running block.
//!
//! Any failure after a timer has started rolls the timer back, so the
//! registry never holds a block the records do not know about.

use std::sync::Arc;

use chrono::{DateTime, FixedOffset};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Duration;

use super::error::BlockError;
use super::registry::{BlockRegistry, BlockTeardown, TimerEvent};
use crate::hosts::HostsFile;
use crate::settings::Settings;
use crate::store::{ConfigStore, SiteStore, StoreError};
use crate::timeutil::{at_time_today, format_timestamp, Clock};
use crate::types::{
    validation, BlockEntry, Config, CurrentStatus, Mode, ValidationError, COMBINED_KEY,
};

type Result<T> = std::result::Result<T, BlockError>;

// ============================================================================
// Enforcer
// ============================================================================

/// Collaborators shared by the engine and its timer tasks.
///
/// Timer tasks tear blocks down through this type, so it holds no reference
/// back to the registry.
pub struct Enforcer {
    config: ConfigStore,
    sites: SiteStore,
    hosts: HostsFile,
    clock: Arc<dyn Clock>,
}

impl Enforcer {
    fn now(&self) -> DateTime<FixedOffset> {
        self.clock.now()
    }

    /// Removes the hosts entries of every configured site that no per-site
    /// timer still covers.
    fn lift_combined(&self, remaining: &[String]) -> Result<Config> {
        let config = self.config.load()?;
        let urls: Vec<String> = config
            .sites
            .iter()
            .filter(|url| !remaining.contains(url))
            .cloned()
            .collect();
        self.hosts.remove_entries(&urls, false)?;
        Ok(config)
    }

    fn lift_site(&self, url: &str, remaining: &[String]) -> Result<()> {
        let config = self.config.load()?;
        let covered = remaining.iter().any(|key| key == COMBINED_KEY) && config.has_site(url);
        if !covered {
            self.hosts.remove_entries(&[url.to_string()], false)?;
        }
        match self.sites.set_blocked(url, false) {
            Ok(()) | Err(StoreError::Validation(ValidationError::SiteNotFound(_))) => {}
            Err(e) => return Err(e.into()),
        }
        if remaining.is_empty() {
            self.set_mode(Mode::Normal)?;
        }
        Ok(())
    }

    fn set_mode(&self, mode: Mode) -> Result<()> {
        self.config.update(|config| {
            config.current_status.mode = mode;
            Ok(())
        })?;
        Ok(())
    }
}

impl BlockTeardown for Enforcer {
    fn on_expired(&self, key: &str, remaining: &[String]) -> Result<()> {
        if key != COMBINED_KEY {
            return self.lift_site(key, remaining);
        }
        self.lift_combined(remaining)?;
        self.config.update(|config| {
            let status = &mut config.current_status;
            status.block_custom_time = false;
            status.started_at.clear();
            status.ended_at.clear();
            if remaining.is_empty() {
                status.mode = Mode::Normal;
            }
            Ok(())
        })?;
        Ok(())
    }

    fn on_cancelled(&self, key: &str, remaining: &[String]) -> Result<()> {
        if key != COMBINED_KEY {
            return self.lift_site(key, remaining);
        }
        let config = self.lift_combined(remaining)?;
        let schedule_active = config.active_range(&self.now()).is_some();
        self.config.update(|config| {
            let status = &mut config.current_status;
            status.block_custom_time = false;
            status.started_at.clear();
            status.ended_at.clear();
            if remaining.is_empty() && !schedule_active {
                status.mode = Mode::Normal;
            }
            Ok(())
        })?;
        Ok(())
    }
}

// ============================================================================
// Status reporting
// ============================================================================

/// One running block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveBlock {
    /// Timer key
    pub key: String,
    /// Formatted expiry
    pub expires_at: String,
}

/// Snapshot reported by `status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockStatus {
    /// Operating mode
    pub mode: Mode,
    /// Running blocks, sorted by key
    pub blocks: Vec<ActiveBlock>,
    /// Whether the combined block is custom-time
    pub custom_time: bool,
    /// When blocking ends, if anything is blocked
    pub blocked_until: Option<String>,
    /// Whether the next start resumes blocking
    pub block_on_restart: bool,
    /// Configured sites
    pub sites: Vec<String>,
}

impl BlockStatus {
    /// Returns true if any block is running.
    pub fn is_blocking(&self) -> bool {
        !self.blocks.is_empty()
    }
}

/// Which combined block recovery resumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ResumedBlock {
    /// A custom-time block resumed from its saved end time
    Custom {
        /// Formatted expiry
        expires_at: String,
    },
    /// A schedule-driven block for the range active now
    Schedule {
        /// Formatted expiry
        expires_at: String,
    },
}

/// Result of restart recovery.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryOutcome {
    /// Resumed combined block
    pub combined: Option<ResumedBlock>,
    /// Per-site blocks resumed
    pub sites: Vec<String>,
    /// Whether a stale marked block was stripped from the hosts file
    pub stripped_stale: bool,
}

impl RecoveryOutcome {
    /// Returns true if any block was resumed.
    pub fn resumed_anything(&self) -> bool {
        self.combined.is_some() || !self.sites.is_empty()
    }
}

// ============================================================================
// BlockEngine
// ============================================================================

/// Strict/normal mode state machine and block lifecycle.
pub struct BlockEngine {
    core: Arc<Enforcer>,
    registry: BlockRegistry,
}

impl BlockEngine {
    /// Creates an engine for the given settings.
    pub fn new(settings: &Settings, clock: Arc<dyn Clock>) -> Self {
        let registry = BlockRegistry::new(Arc::clone(&clock), settings.poll_interval);
        Self::assemble(settings, clock, registry)
    }

    /// Creates an engine that reports timer events to `event_tx`.
    pub fn with_events(
        settings: &Settings,
        clock: Arc<dyn Clock>,
        event_tx: mpsc::UnboundedSender<TimerEvent>,
    ) -> Self {
        let registry =
            BlockRegistry::with_events(Arc::clone(&clock), settings.poll_interval, event_tx);
        Self::assemble(settings, clock, registry)
    }

    fn assemble(settings: &Settings, clock: Arc<dyn Clock>, registry: BlockRegistry) -> Self {
        Self {
            core: Arc::new(Enforcer {
                config: ConfigStore::new(settings.config_path()),
                sites: SiteStore::new(settings.sites_path()),
                hosts: HostsFile::new(&settings.hosts_path),
                clock,
            }),
            registry,
        }
    }

    /// Creates the configuration file if it does not exist.
    pub fn ensure_config(&self) -> Result<()> {
        self.core.config.ensure_exists()?;
        Ok(())
    }

    /// The timer registry.
    pub fn registry(&self) -> &BlockRegistry {
        &self.registry
    }

    /// The hosts file mutator.
    pub fn hosts(&self) -> &HostsFile {
        &self.core.hosts
    }

    /// Current wall-clock time.
    pub fn now(&self) -> DateTime<FixedOffset> {
        self.core.now()
    }

    /// Loads the configuration.
    pub fn config(&self) -> Result<Config> {
        Ok(self.core.config.load()?)
    }

    /// Loads the per-site block list.
    pub fn block_entries(&self) -> Result<Vec<BlockEntry>> {
        Ok(self.core.sites.load()?.sites)
    }

    fn teardown(&self) -> Arc<dyn BlockTeardown> {
        self.core.clone()
    }

    fn update_status<F>(&self, edit: F) -> Result<()>
    where
        F: FnOnce(&mut CurrentStatus),
    {
        self.core.config.update(|config| {
            edit(&mut config.current_status);
            Ok(())
        })?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Mode
    // ------------------------------------------------------------------------

    /// Current operating mode.
    pub fn mode(&self) -> Result<Mode> {
        Ok(self.config()?.current_status.mode)
    }

    /// Switches to strict mode. The caller is responsible for confirming.
    pub fn enter_strict(&self) -> Result<()> {
        self.core.set_mode(Mode::Strict)?;
        tracing::info!("strict mode enabled");
        Ok(())
    }

    /// Switches to normal mode.
    ///
    /// # Errors
    ///
    /// `StrictModeActive` while any timer is running.
    pub fn leave_strict(&self) -> Result<()> {
        let config = self.config()?;
        if config.current_status.mode.is_strict() && !self.registry.is_idle() {
            return Err(BlockError::StrictModeActive {
                expires_at: self.describe_expiry(&config),
            });
        }
        self.core.set_mode(Mode::Normal)?;
        tracing::info!("strict mode disabled");
        Ok(())
    }

    /// Gate in front of the editing menus.
    ///
    /// Strict mode with a running block refuses and names the block's
    /// expiry. Strict mode with nothing running falls back to normal.
    pub fn check_menu_access(&self) -> Result<()> {
        let config = self.config()?;
        if !config.current_status.mode.is_strict() {
            return Ok(());
        }
        if self.registry.is_idle() {
            tracing::info!("no block running; leaving strict mode");
            return self.core.set_mode(Mode::Normal);
        }
        Err(BlockError::StrictModeActive {
            expires_at: self.describe_expiry(&config),
        })
    }

    fn ensure_unlocked(&self, config: &Config) -> Result<()> {
        if config.current_status.mode.is_strict() && !self.registry.is_idle() {
            return Err(BlockError::StrictModeActive {
                expires_at: self.describe_expiry(config),
            });
        }
        Ok(())
    }

    fn ensure_not_shortened(
        &self,
        config: &Config,
        key: &str,
        expiry: &DateTime<FixedOffset>,
    ) -> Result<()> {
        if !config.current_status.mode.is_strict() {
            return Ok(());
        }
        match self.registry.expiry_of(key) {
            Some(current) if *expiry < current => Err(BlockError::WouldShortenBlock {
                current: format_timestamp(&current),
                requested: format_timestamp(expiry),
            }),
            _ => Ok(()),
        }
    }

    /// Describes when the running block ends.
    pub fn expiry_description(&self) -> Result<String> {
        Ok(self.describe_expiry(&self.config()?))
    }

    fn describe_expiry(&self, config: &Config) -> String {
        let status = &config.current_status;
        if status.block_custom_time && !status.ended_at.is_empty() {
            return status.ended_at.clone();
        }
        if let Some(range) = config.active_range(&self.core.now()) {
            return range.end.clone();
        }
        self.registry
            .latest_expiry()
            .map(|expiry| format_timestamp(&expiry))
            .unwrap_or_else(|| "unknown".to_string())
    }

    // ------------------------------------------------------------------------
    // Combined blocks
    // ------------------------------------------------------------------------

    /// Blocks every configured site until the end of the schedule range
    /// active now.
    pub async fn block_by_schedule(&self, background: bool) -> Result<DateTime<FixedOffset>> {
        let config = self.config()?;
        if config.sites.is_empty() {
            return Err(BlockError::NoSitesConfigured);
        }
        let now = self.core.now();
        let range = config
            .active_range(&now)
            .ok_or(BlockError::NoActiveSchedule)?;
        let expiry = at_time_today(&now, &range.end)?;
        self.ensure_not_shortened(&config, COMBINED_KEY, &expiry)?;
        self.start_combined(&config, expiry, false, background)
            .await?;
        Ok(expiry)
    }

    /// Blocks every configured site for `duration` from now.
    pub async fn block_for_duration(
        &self,
        duration: Duration,
        background: bool,
    ) -> Result<DateTime<FixedOffset>> {
        let span = chrono::Duration::from_std(duration)
            .map_err(|_| ValidationError::InvalidDuration(format!("{duration:?}")))?;
        let expiry = self.core.now() + span;
        self.block_until(expiry, background).await?;
        Ok(expiry)
    }

    /// Blocks every configured site until `expiry`.
    pub async fn block_until(&self, expiry: DateTime<FixedOffset>, background: bool) -> Result<()> {
        if expiry <= self.core.now() {
            return Err(BlockError::ExpiryInPast(format_timestamp(&expiry)));
        }
        let config = self.config()?;
        if config.sites.is_empty() {
            return Err(BlockError::NoSitesConfigured);
        }
        self.ensure_not_shortened(&config, COMBINED_KEY, &expiry)?;
        self.start_combined(&config, expiry, true, background).await
    }

    async fn start_combined(
        &self,
        config: &Config,
        expiry: DateTime<FixedOffset>,
        custom: bool,
        background: bool,
    ) -> Result<()> {
        let previous_expiry = self.registry.expiry_of(COMBINED_KEY);
        let previous_status = config.current_status.clone();

        self.registry
            .start_timer(COMBINED_KEY, expiry, background, self.teardown())
            .await?;

        let now = self.core.now();
        let enforced = self
            .update_status(|status| {
                status.block_custom_time = custom;
                status.started_at = format_timestamp(&now);
                status.ended_at = format_timestamp(&expiry);
            })
            .and_then(|()| Ok(self.core.hosts.add_entries(&config.sites)?));

        if let Err(e) = enforced {
            tracing::error!("failed to enforce block, rolling back: {e}");
            self.rollback_combined(previous_expiry, previous_status, background)
                .await;
            return Err(e);
        }

        tracing::info!(
            custom,
            sites = config.sites.len(),
            "blocking until {}",
            format_timestamp(&expiry)
        );
        Ok(())
    }

    async fn rollback_combined(
        &self,
        previous_expiry: Option<DateTime<FixedOffset>>,
        previous_status: CurrentStatus,
        background: bool,
    ) {
        if let Err(e) = self.registry.discard_timer(COMBINED_KEY).await {
            tracing::warn!("failed to stop timer during rollback: {e}");
        }
        if let Some(expiry) = previous_expiry {
            if let Err(e) = self
                .registry
                .start_timer(COMBINED_KEY, expiry, background, self.teardown())
                .await
            {
                tracing::warn!("failed to restore previous timer: {e}");
            }
        }
        if let Err(e) = self.update_status(|status| *status = previous_status) {
            tracing::warn!("failed to restore block status: {e}");
        }
    }

    /// Lifts every block.
    ///
    /// # Errors
    ///
    /// `StrictModeActive` in strict mode while a block is running.
    pub async fn unblock_all(&self) -> Result<()> {
        let config = self.config()?;
        self.ensure_unlocked(&config)?;

        let cancelled = self.registry.cancel_all().await?;
        self.core.hosts.remove_entries(&config.sites, true)?;
        self.update_status(|status| {
            status.block_custom_time = false;
            status.started_at.clear();
            status.ended_at.clear();
            status.mode = Mode::Normal;
        })?;
        self.core.sites.clear_all_blocked()?;

        tracing::info!(cancelled, "all blocks lifted");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Site list
    // ------------------------------------------------------------------------

    /// Adds a site to the combined list, blocking it at once if a combined
    /// block is running.
    pub fn add_site(&self, url: &str) -> Result<String> {
        let url = self
            .core
            .config
            .update(|config| Ok(config.add_site(url)?))?;
        if self.registry.contains(COMBINED_KEY) {
            self.core.hosts.add_entries(std::slice::from_ref(&url))?;
        }
        Ok(url)
    }

    /// Removes a site from the combined list and lifts its hosts entry.
    pub fn remove_site(&self, url: &str) -> Result<String> {
        self.check_menu_access()?;
        let url = self
            .core
            .config
            .update(|config| Ok(config.remove_site(url)?))?;
        if !self.registry.contains(&url) {
            self.core
                .hosts
                .remove_entries(std::slice::from_ref(&url), false)?;
        }
        Ok(url)
    }

    /// Applies a schedule edit.
    pub fn update_schedules<T, F>(&self, edit: F) -> Result<T>
    where
        F: FnOnce(&mut Config) -> std::result::Result<T, ValidationError>,
    {
        self.check_menu_access()?;
        Ok(self.core.config.update(|config| Ok(edit(config)?))?)
    }

    // ------------------------------------------------------------------------
    // Per-site blocks
    // ------------------------------------------------------------------------

    /// Adds a per-site entry, optionally with a preset expiry.
    pub fn add_block_entry(
        &self,
        url: &str,
        expiry: Option<DateTime<FixedOffset>>,
    ) -> Result<BlockEntry> {
        let mut entry = self.core.sites.add(url)?;
        if let Some(expiry) = expiry {
            self.core.sites.set_expiry(&entry.url, Some(&expiry))?;
            entry.duration = format_timestamp(&expiry);
        }
        Ok(entry)
    }

    /// Deletes a per-site entry, lifting its block first.
    pub async fn delete_block_entry(&self, url: &str) -> Result<BlockEntry> {
        let url = validation::normalize_url(url)?;
        if self.registry.contains(&url) {
            self.ensure_unlocked(&self.config()?)?;
            self.registry.cancel_timer(&url).await?;
        }
        Ok(self.core.sites.remove(&url)?)
    }

    /// Blocks one site until `expiry`.
    pub async fn block_site(
        &self,
        url: &str,
        expiry: DateTime<FixedOffset>,
        background: bool,
    ) -> Result<()> {
        let url = validation::normalize_url(url)?;
        if self.core.sites.load()?.get(&url).is_none() {
            return Err(BlockError::SiteNotFound(url));
        }
        if expiry <= self.core.now() {
            return Err(BlockError::ExpiryInPast(format_timestamp(&expiry)));
        }
        self.ensure_not_shortened(&self.config()?, &url, &expiry)?;

        self.registry
            .start_timer(&url, expiry, background, self.teardown())
            .await?;

        let enforced = self
            .core
            .sites
            .set_expiry(&url, Some(&expiry))
            .and_then(|()| self.core.sites.set_blocked(&url, true))
            .map_err(BlockError::from)
            .and_then(|()| Ok(self.core.hosts.add_entries(std::slice::from_ref(&url))?));

        if let Err(e) = enforced {
            tracing::error!(url = %url, "failed to enforce site block, rolling back: {e}");
            if let Err(e) = self.registry.discard_timer(&url).await {
                tracing::warn!("failed to stop timer during rollback: {e}");
            }
            if let Err(e) = self.core.sites.set_blocked(&url, false) {
                tracing::warn!("failed to reset site flag: {e}");
            }
            return Err(e);
        }

        tracing::info!(url = %url, "site blocked until {}", format_timestamp(&expiry));
        Ok(())
    }

    /// Lifts one site's block. Returns false if it was not blocked.
    pub async fn unblock_site(&self, url: &str) -> Result<bool> {
        let url = validation::normalize_url(url)?;
        self.ensure_unlocked(&self.config()?)?;
        self.registry.cancel_timer(&url).await
    }

    /// Changes a site's expiry, restarting its timer if one is running.
    pub async fn update_site_expiry(
        &self,
        url: &str,
        expiry: DateTime<FixedOffset>,
        background: bool,
    ) -> Result<()> {
        let url = validation::normalize_url(url)?;
        if self.core.sites.load()?.get(&url).is_none() {
            return Err(BlockError::SiteNotFound(url));
        }
        if expiry <= self.core.now() {
            return Err(BlockError::ExpiryInPast(format_timestamp(&expiry)));
        }
        self.ensure_not_shortened(&self.config()?, &url, &expiry)?;

        self.core.sites.set_expiry(&url, Some(&expiry))?;
        if self.registry.contains(&url) {
            self.registry
                .start_timer(&url, expiry, background, self.teardown())
                .await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Status and recovery
    // ------------------------------------------------------------------------

    /// Reports what is blocked and until when.
    pub fn status(&self) -> Result<BlockStatus> {
        let config = self.config()?;
        let blocks: Vec<ActiveBlock> = self
            .registry
            .keys()
            .into_iter()
            .filter_map(|key| {
                let expiry = self.registry.expiry_of(&key)?;
                Some(ActiveBlock {
                    key,
                    expires_at: format_timestamp(&expiry),
                })
            })
            .collect();
        let blocked_until = (!blocks.is_empty()).then(|| self.describe_expiry(&config));

        Ok(BlockStatus {
            mode: config.current_status.mode,
            blocks,
            custom_time: config.current_status.block_custom_time,
            blocked_until,
            block_on_restart: config.current_status.block_on_restart,
            sites: config.sites,
        })
    }

    /// Reports blocks from the persisted records alone.
    ///
    /// Used by a process that does not own the timers, such as a one-shot
    /// `status` while a background instance enforces the blocks.
    pub fn recorded_status(&self) -> Result<BlockStatus> {
        let config = self.config()?;
        let now = self.core.now();
        let mut running: Vec<(String, DateTime<FixedOffset>)> = Vec::new();

        if let Ok(Some(end)) = config.current_status.ended_at() {
            if end > now {
                running.push((COMBINED_KEY.to_string(), end));
            }
        }
        for entry in self.core.sites.load()?.sites {
            if !entry.currently_blocked {
                continue;
            }
            if let Ok(Some(expiry)) = entry.expiry() {
                if expiry > now {
                    running.push((entry.url, expiry));
                }
            }
        }
        running.sort_by(|a, b| a.0.cmp(&b.0));

        let blocked_until = running
            .iter()
            .map(|(_, expiry)| *expiry)
            .max()
            .map(|expiry| format_timestamp(&expiry));
        let blocks = running
            .into_iter()
            .map(|(key, expiry)| ActiveBlock {
                key,
                expires_at: format_timestamp(&expiry),
            })
            .collect();

        Ok(BlockStatus {
            mode: config.current_status.mode,
            blocks,
            custom_time: config.current_status.block_custom_time,
            blocked_until,
            block_on_restart: config.current_status.block_on_restart,
            sites: config.sites,
        })
    }

    /// Marks the next start as one that must resume blocking.
    pub fn arm_restart(&self) -> Result<()> {
        self.update_status(|status| status.block_on_restart = true)
    }

    /// Clears the resume-on-start flag.
    pub fn disarm_restart(&self) -> Result<()> {
        self.update_status(|status| status.block_on_restart = false)
    }

    /// Restores blocks after a restart.
    ///
    /// With `block_on_restart` set, stale marked entries are stripped and the
    /// combined block is resumed: from `ended_at` for a custom-time block, or
    /// from the schedule active now. Per-site blocks with a future expiry are
    /// resumed regardless. `block_on_restart` is always cleared.
    pub async fn recover(&self, background: bool) -> Result<RecoveryOutcome> {
        self.ensure_config()?;
        let config = self.config()?;
        let status = config.current_status.clone();
        let now = self.core.now();
        let mut outcome = RecoveryOutcome::default();

        if status.block_on_restart {
            self.core.hosts.remove_entries(&config.sites, true)?;
            outcome.stripped_stale = true;

            if status.block_custom_time {
                let ended_at = status.ended_at().unwrap_or_else(|e| {
                    tracing::warn!("ignoring saved end time: {e}");
                    None
                });
                match ended_at {
                    Some(end) if end > now => match self.block_until(end, background).await {
                        Ok(()) => {
                            outcome.combined = Some(ResumedBlock::Custom {
                                expires_at: format_timestamp(&end),
                            });
                        }
                        Err(BlockError::NoSitesConfigured) => {
                            tracing::warn!("nothing to resume: no sites configured");
                        }
                        Err(e) => return Err(e),
                    },
                    _ => {
                        tracing::info!("saved custom block already ended");
                        self.update_status(|status| {
                            status.block_custom_time = false;
                            status.started_at.clear();
                            status.ended_at.clear();
                        })?;
                    }
                }
            } else {
                match self.block_by_schedule(background).await {
                    Ok(expiry) => {
                        outcome.combined = Some(ResumedBlock::Schedule {
                            expires_at: format_timestamp(&expiry),
                        });
                    }
                    Err(BlockError::NoActiveSchedule | BlockError::NoSitesConfigured) => {
                        tracing::info!("no scheduled block to resume");
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        outcome.sites = self.recover_sites(background).await?;

        let idle = self.registry.is_idle();
        self.update_status(|status| {
            status.block_on_restart = false;
            if idle {
                status.mode = Mode::Normal;
            }
        })?;

        tracing::info!(?outcome, "recovery finished");
        Ok(outcome)
    }

    async fn recover_sites(&self, background: bool) -> Result<Vec<String>> {
        let now = self.core.now();
        let mut resumed = Vec::new();
        for entry in self.core.sites.load()?.sites {
            if !entry.currently_blocked || self.registry.contains(&entry.url) {
                continue;
            }
            match entry.expiry() {
                Ok(Some(expiry)) if expiry > now => {
                    self.block_site(&entry.url, expiry, background).await?;
                    resumed.push(entry.url);
                }
                _ => {
                    tracing::info!(url = %entry.url, "clearing stale site block");
                    self.core
                        .hosts
                        .remove_entries(std::slice::from_ref(&entry.url), false)?;
                    self.core.sites.set_blocked(&entry.url, false)?;
                }
            }
        }
        Ok(resumed)
    }
}

// ============================================================================
// Tests
// ============================================================================
