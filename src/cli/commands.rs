//! Command definitions for the selfcontrol CLI.
//!
//! Uses clap derive macro for argument parsing.

use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::timeutil::parse_duration;

// ============================================================================
// CLI Structure
// ============================================================================

/// selfcontrol - block distracting websites through the hosts file
#[derive(Parser, Debug)]
#[command(
    name = "selfcontrol",
    version,
    about = "Block distracting websites through the hosts file",
    long_about = "Blocks websites by redirecting them in the hosts file, either for a fixed\n\
                  duration or following a weekly schedule. Strict mode prevents lifting a\n\
                  block early. Running without a subcommand opens the interactive menu.",
    propagate_version = true
)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Enable verbose output for debugging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

// ============================================================================
// Subcommands
// ============================================================================

/// Available subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Open the interactive menu
    Menu,

    /// Block every configured site for a fixed duration
    Block(BlockArgs),

    /// Block every configured site until the active schedule range ends
    Schedule,

    /// Lift every block (refused in strict mode)
    Unblock,

    /// Show what is blocked and until when
    Status {
        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },

    /// Turn strict mode on or off
    Strict {
        /// Desired state
        #[arg(value_enum)]
        state: Toggle,

        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// Manage the site list
    #[command(subcommand)]
    Site(SiteCommand),

    /// Hand running blocks off to a background process and exit
    Background,

    /// Register selfcontrol to resume blocks at system startup
    Install,

    /// Remove the startup registration
    Uninstall,

    /// Generate shell completion scripts
    Completions {
        /// Shell type for completion script
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

/// On/off switch.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toggle {
    /// Enable
    On,
    /// Disable
    Off,
}

/// Site list subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum SiteCommand {
    /// Add a site to the block list
    Add {
        /// Host name, e.g. example.com
        url: String,
    },

    /// Remove a site from the block list
    Remove {
        /// Host name, e.g. example.com
        url: String,
    },
}

// ============================================================================
// Block Command Arguments
// ============================================================================

/// Arguments for the block command
#[derive(Args, Debug, Clone)]
pub struct BlockArgs {
    /// How long to block, e.g. 90m or 1h30m
    #[arg(short, long, value_parser = parse_block_duration)]
    pub duration: Duration,

    /// Switch to strict mode once the block starts
    #[arg(short, long)]
    pub strict: bool,
}

// ============================================================================
// Validation Functions
// ============================================================================

/// Parses a block duration. Must be positive.
fn parse_block_duration(s: &str) -> Result<Duration, String> {
    match parse_duration(s) {
        Ok(d) if d.is_zero() => Err("duration must be positive".to_string()),
        Ok(d) => Ok(d),
        Err(e) => Err(e.to_string()),
    }
}

// ============================================================================
// Tests
// ============================================================================
