//! Display utilities for the selfcontrol CLI.
//!
//! `format_*` functions build the text, `show_*` functions print it.

use crate::daemon::{BlockStatus, RecoveryOutcome, ResumedBlock, TimerEvent};
use crate::types::validation::WEEKDAY_KEYS;
use crate::types::{BlockEntry, Config, Mode, COMBINED_KEY};

// ============================================================================
// Display
// ============================================================================

/// Display utilities for CLI output.
pub struct Display;

impl Display {
    /// Shows the main menu.
    pub fn show_menu(mode: Mode) {
        println!();
        println!("selfcontrol ({mode} mode)");
        println!("─────────────────────────────");
        for (index, label) in MAIN_MENU.iter().enumerate() {
            println!("{}: {label}", index + 1);
        }
    }

    /// Shows a numbered submenu.
    pub fn show_submenu(title: &str, items: &[&str]) {
        println!();
        println!("{title}");
        for (index, label) in items.iter().enumerate() {
            println!("  {}: {label}", index + 1);
        }
        println!("  0: Back");
    }

    /// Shows the result of starting a block.
    pub fn show_block_started(until: &str) {
        println!("* Blocking until {until}");
    }

    /// Shows the result of lifting blocks.
    pub fn show_unblocked() {
        println!("* All blocks lifted");
    }

    /// Shows the current block status.
    pub fn show_status(status: &BlockStatus) {
        print!("{}", Self::format_status(status));
    }

    /// Prints the status as JSON.
    pub fn show_status_json(status: &BlockStatus) -> serde_json::Result<()> {
        println!("{}", serde_json::to_string_pretty(status)?);
        Ok(())
    }

    /// Shows the configured sites.
    pub fn show_sites(sites: &[String]) {
        if sites.is_empty() {
            println!("No sites configured");
            return;
        }
        for (index, url) in sites.iter().enumerate() {
            println!("{}: {url}", index + 1);
        }
    }

    /// Shows per-site block entries.
    pub fn show_block_entries(entries: &[BlockEntry]) {
        print!("{}", Self::format_block_entries(entries));
    }

    /// Shows the weekly schedule.
    pub fn show_schedules(config: &Config) {
        print!("{}", Self::format_schedules(config));
    }

    /// Shows a timer notification.
    pub fn show_timer_event(event: &TimerEvent) {
        if let Some(line) = Self::format_timer_event(event) {
            println!("\n{line}");
        }
    }

    /// Shows what recovery resumed.
    pub fn show_recovery(outcome: &RecoveryOutcome) {
        match &outcome.combined {
            Some(ResumedBlock::Custom { expires_at }) => {
                println!("* Resumed block until {expires_at}");
            }
            Some(ResumedBlock::Schedule { expires_at }) => {
                println!("* Resumed scheduled block until {expires_at}");
            }
            None => {}
        }
        for url in &outcome.sites {
            println!("* Resumed block of {url}");
        }
    }

    /// Shows that blocks were handed off.
    pub fn show_background_started(pid: u32) {
        println!("* Blocks continue in the background (pid {pid})");
    }

    /// Shows a success message for startup registration.
    pub fn show_install_success(path: &std::path::Path) {
        println!("* Startup service installed at {}", path.display());
        println!("  Running blocks will resume after a reboot");
    }

    /// Shows a success message for startup deregistration.
    pub fn show_uninstall_success() {
        println!("* Startup service uninstalled");
    }

    /// Shows a success message.
    pub fn show_success(message: &str) {
        println!("* {message}");
    }

    /// Shows an error message.
    pub fn show_error(message: &str) {
        eprintln!("Error: {}", message);
    }

    // ------------------------------------------------------------------------
    // Formatting
    // ------------------------------------------------------------------------

    /// Formats the block status.
    pub fn format_status(status: &BlockStatus) -> String {
        let mut out = String::new();
        out.push_str("selfcontrol status\n");
        out.push_str("─────────────────────────────\n");
        out.push_str(&format!("Mode: {}\n", status.mode));
        if status.is_blocking() {
            if let Some(until) = &status.blocked_until {
                out.push_str(&format!("Blocked until: {until}\n"));
            }
            for block in &status.blocks {
                let label = if block.key == COMBINED_KEY {
                    "all sites"
                } else {
                    block.key.as_str()
                };
                out.push_str(&format!("  {label} until {}\n", block.expires_at));
            }
        } else {
            out.push_str("Nothing is blocked\n");
        }
        if status.sites.is_empty() {
            out.push_str("Sites: none\n");
        } else {
            out.push_str(&format!("Sites: {}\n", status.sites.join(", ")));
        }
        out
    }

    /// Formats per-site block entries.
    pub fn format_block_entries(entries: &[BlockEntry]) -> String {
        if entries.is_empty() {
            return "No sites in the block list\n".to_string();
        }
        entries
            .iter()
            .enumerate()
            .map(|(index, entry)| {
                let state = if entry.currently_blocked {
                    format!("blocked until {}", entry.duration)
                } else {
                    "not blocked".to_string()
                };
                format!("{}: {} ({}) {state}\n", index + 1, entry.name, entry.url)
            })
            .collect()
    }

    /// Formats the weekly schedule in weekday order.
    pub fn format_schedules(config: &Config) -> String {
        if config.schedules.is_empty() {
            return "No schedules configured\n".to_string();
        }
        let mut out = String::new();
        for day in WEEKDAY_KEYS {
            let Some(ranges) = config.schedules.get(day) else {
                continue;
            };
            out.push_str(&format!("{day}:\n"));
            for (index, range) in ranges.iter().enumerate() {
                let name = range
                    .name
                    .as_deref()
                    .map(|n| format!(" [{n}]"))
                    .unwrap_or_default();
                out.push_str(&format!(
                    "  {}: {} - {}{name}\n",
                    index + 1,
                    range.start,
                    range.end
                ));
            }
        }
        out
    }

    /// Formats a timer notification. Start events are not shown.
    pub fn format_timer_event(event: &TimerEvent) -> Option<String> {
        let describe = |key: &str| {
            if key == COMBINED_KEY {
                "Block of all sites".to_string()
            } else {
                format!("Block of {key}")
            }
        };
        match event {
            TimerEvent::Started { .. } => None,
            TimerEvent::Expired { key } => Some(format!("* {} ended", describe(key))),
            TimerEvent::Cancelled { key } => Some(format!("* {} lifted", describe(key))),
            TimerEvent::TeardownFailed { key, message } => Some(format!(
                "Error: failed to lift {}: {message}",
                describe(key).to_lowercase()
            )),
        }
    }
}

/// Main menu entries, numbered from 1.
pub const MAIN_MENU: [&str; 9] = [
    "Block now",
    "Block by schedule",
    "Show status",
    "Toggle strict mode",
    "Sites",
    "Schedules",
    "Change password",
    "Run in background",
    "Exit",
];

// ============================================================================
// Tests
// ============================================================================
