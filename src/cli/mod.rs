//! CLI module for selfcontrol.
//!
//! This module provides the command-line interface:
//! - `commands`: Command definitions using clap derive
//! - `menu`: Interactive numbered menu
//! - `display`: Output formatting and display logic

pub mod commands;
pub mod display;
pub mod menu;

pub use commands::{BlockArgs, Cli, Commands, SiteCommand, Toggle};
pub use display::Display;
pub use menu::{Menu, MenuExit};
