//! selfcontrol library
//!
//! A website blocker that redirects sites to the loopback address through
//! the hosts file. It includes:
//! - Hosts-file mutation with a marked, reversible block
//! - Persisted configuration, weekly schedules and per-site records
//! - A timer registry that lifts each block exactly once
//! - A strict/normal mode state machine
//! - Hand-off to a background process and recovery after a restart
//! - A password gate and startup service registration
//! - CLI command parsing, the interactive menu and display utilities

pub mod cli;
pub mod daemon;
pub mod hosts;
pub mod password;
pub mod service;
pub mod settings;
pub mod store;
pub mod timeutil;
pub mod types;

// Re-export commonly used types for convenience
pub use daemon::{
    BlockEngine, BlockError, BlockRegistry, BlockStatus, LaunchRole, ProcessError, TimerEvent,
};
pub use hosts::{HostsError, HostsFile};
pub use password::{PasswordError, PasswordFile};
pub use service::ServiceError;
pub use settings::{Settings, SettingsError};
pub use store::{ConfigStore, SiteStore, StoreError};
pub use timeutil::{Clock, FixedClock, SystemClock};
pub use types::{BlockEntry, Config, CurrentStatus, Mode, Schedule, TimeRange, ValidationError};
