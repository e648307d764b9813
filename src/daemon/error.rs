//! Error types for the block engine and background orchestration.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::hosts::HostsError;
use crate::store::StoreError;
use crate::types::ValidationError;

/// Block lifecycle error type.
#[derive(Debug, Error)]
pub enum BlockError {
    /// Reading or writing a persisted record failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Rewriting the hosts file failed.
    #[error(transparent)]
    Hosts(#[from] HostsError),

    /// User input was rejected.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// No schedule range covers the current time.
    #[error("no schedule is active right now")]
    NoActiveSchedule,

    /// There is nothing to block.
    #[error("no sites configured; add a site first")]
    NoSitesConfigured,

    /// The requested expiry is not in the future.
    #[error("expiry {0} is not in the future")]
    ExpiryInPast(String),

    /// Strict mode refuses the operation until the block ends.
    #[error("strict mode is active until {expires_at}")]
    StrictModeActive {
        /// When the running block ends
        expires_at: String,
    },

    /// Strict mode refuses to replace a block with one that ends sooner.
    #[error("strict mode: the current block runs until {current}; cannot end it at {requested}")]
    WouldShortenBlock {
        /// Expiry of the running block
        current: String,
        /// Expiry that was requested
        requested: String,
    },

    /// Unknown site.
    #[error("site '{0}' not found")]
    SiteNotFound(String),

    /// A timer task panicked or was aborted.
    #[error("timer task for '{key}' failed: {message}")]
    TimerTask {
        /// Timer key
        key: String,
        /// Join error description
        message: String,
    },

    /// Background process control failed.
    #[error(transparent)]
    Process(#[from] ProcessError),
}

/// Background process control error type.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The lock file could not be read.
    #[error("failed to read lock file {}: {source}", path.display())]
    LockRead {
        /// Lock file path
        path: PathBuf,
        /// Underlying OS error
        #[source]
        source: io::Error,
    },

    /// The lock file could not be written.
    #[error("failed to write lock file {}: {source}", path.display())]
    LockWrite {
        /// Lock file path
        path: PathBuf,
        /// Underlying OS error
        #[source]
        source: io::Error,
    },

    /// The lock file could not be removed.
    #[error("failed to remove lock file {}: {source}", path.display())]
    LockRemove {
        /// Lock file path
        path: PathBuf,
        /// Underlying OS error
        #[source]
        source: io::Error,
    },

    /// The lock file does not hold a decimal PID.
    #[error("lock file {} holds an invalid PID: '{content}'", path.display())]
    InvalidPid {
        /// Lock file path
        path: PathBuf,
        /// Raw content
        content: String,
    },

    /// Sending a signal failed.
    #[error("failed to signal process {pid}: {source}")]
    Signal {
        /// Target process
        pid: u32,
        /// errno reported by the kernel
        #[source]
        source: nix::errno::Errno,
    },

    /// The previous instance outlived the kill timeout.
    #[error("background process {pid} did not exit within {timeout:?}")]
    Unkillable {
        /// Target process
        pid: u32,
        /// How long we waited
        timeout: Duration,
    },

    /// Launching the headless worker failed.
    #[error("failed to start background process: {0}")]
    Spawn(#[source] io::Error),

    /// The path of the running executable is unknown.
    #[error("failed to resolve executable path: {0}")]
    ExecutablePath(#[source] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strict_mode_message_includes_expiry() {
        let err = BlockError::StrictModeActive {
            expires_at: "17:00".to_string(),
        };
        assert!(err.to_string().contains("17:00"));
    }

    #[test]
    fn test_unkillable_message() {
        let err = ProcessError::Unkillable {
            pid: 42,
            timeout: Duration::from_secs(10),
        };
        assert!(err.to_string().contains("42"));
        assert!(err.to_string().contains("10s"));
    }

    #[test]
    fn test_validation_is_transparent() {
        let err = BlockError::from(ValidationError::Empty("site URL"));
        assert_eq!(err.to_string(), "site URL must not be empty");
    }
}
