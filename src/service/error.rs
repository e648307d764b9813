//! Error types for startup service registration.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Startup service registration error type.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The running executable's path is unknown.
    #[error("failed to resolve selfcontrol binary path: {0}")]
    BinaryPathResolution(#[source] io::Error),

    /// Home directory not found.
    #[error("failed to get home directory")]
    HomeDirectoryNotFound,

    /// Failed to create directory.
    #[error("failed to create directory {}: {source}", path.display())]
    DirectoryCreation {
        /// Directory path
        path: PathBuf,
        /// Underlying OS error
        #[source]
        source: io::Error,
    },

    /// Failed to write the service file.
    #[error("failed to write service file {}: {source}", path.display())]
    FileWrite {
        /// Service file path
        path: PathBuf,
        /// Underlying OS error
        #[source]
        source: io::Error,
    },

    /// Failed to remove the service file.
    #[error("failed to remove service file {}: {source}", path.display())]
    FileRemove {
        /// Service file path
        path: PathBuf,
        /// Underlying OS error
        #[source]
        source: io::Error,
    },

    /// Failed to serialize plist.
    #[error("failed to serialize plist: {0}")]
    PlistSerialize(#[source] plist::Error),

    /// Failed to convert plist to UTF-8 string.
    #[error("failed to convert plist to UTF-8: {0}")]
    PlistUtf8(#[source] std::string::FromUtf8Error),

    /// The service manager could not be executed.
    #[error("failed to execute {program}: {source}")]
    CommandExecution {
        /// Program name
        program: &'static str,
        /// Underlying OS error
        #[source]
        source: io::Error,
    },

    /// The service manager reported a failure.
    #[error("{program} {action} failed: {stderr}")]
    CommandFailed {
        /// Program name
        program: &'static str,
        /// Subcommand
        action: String,
        /// Captured standard error
        stderr: String,
    },

    /// No service manager is supported on this platform.
    #[error("startup registration is not supported on this platform")]
    Unsupported,
}

/// Result type for service registration.
pub type Result<T> = std::result::Result<T, ServiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_home_directory_not_found() {
        let err = ServiceError::HomeDirectoryNotFound;
        assert!(err.to_string().contains("home directory"));
    }

    #[test]
    fn test_error_display_command_failed() {
        let err = ServiceError::CommandFailed {
            program: "systemctl",
            action: "enable".to_string(),
            stderr: "access denied".to_string(),
        };
        assert_eq!(err.to_string(), "systemctl enable failed: access denied");
    }

    #[test]
    fn test_error_display_file_write_includes_path() {
        let err = ServiceError::FileWrite {
            path: PathBuf::from("/etc/systemd/system/selfcontrol.service"),
            source: io::Error::from(io::ErrorKind::PermissionDenied),
        };
        assert!(err.to_string().contains("selfcontrol.service"));
    }
}
