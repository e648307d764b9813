//! Password gate.
//!
//! The password file holds a single bcrypt hash. It is created with mode
//! 0600 and never exists with wider permissions.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::types::validation::validate_password;
use crate::types::ValidationError;

/// Password gate error type.
#[derive(Debug, Error)]
pub enum PasswordError {
    /// No password has been set yet.
    #[error("no password set")]
    NotSet,

    /// The password did not match.
    #[error("incorrect password")]
    Incorrect,

    /// The two entries of a new password differ.
    #[error("passwords do not match")]
    Mismatch,

    /// The new password fails the strength rules.
    #[error(transparent)]
    Weak(#[from] ValidationError),

    /// The password file does not hold a bcrypt hash.
    #[error("password file {} is corrupt", path.display())]
    Corrupt {
        /// Password file path
        path: PathBuf,
    },

    /// Hashing the new password failed.
    #[error("failed to hash password: {0}")]
    Hash(#[source] bcrypt::BcryptError),

    /// Reading or writing the password file failed.
    #[error("password file {}: {source}", path.display())]
    Io {
        /// Password file path
        path: PathBuf,
        /// Underlying OS error
        #[source]
        source: io::Error,
    },
}

/// bcrypt work factor for stored passwords.
pub const HASH_COST: u32 = 14;

/// bcrypt password hash stored on disk.
#[derive(Debug, Clone)]
pub struct PasswordFile {
    path: PathBuf,
    cost: u32,
}

impl PasswordFile {
    /// Creates a handle for the password file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cost: HASH_COST,
        }
    }

    /// Sets the bcrypt cost used when storing a new password.
    pub fn with_cost(mut self, cost: u32) -> Self {
        self.cost = cost;
        self
    }

    /// Path of the password file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns true if a password has been set.
    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    fn io_err(&self, source: io::Error) -> PasswordError {
        PasswordError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// Stores a new password after checking strength and confirmation.
    pub fn set(&self, password: &str, confirm: &str) -> Result<(), PasswordError> {
        validate_password(password)?;
        if password != confirm {
            return Err(PasswordError::Mismatch);
        }

        let hash = bcrypt::hash(password, self.cost).map_err(PasswordError::Hash)?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| self.io_err(e))?;
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&self.path)
            .map_err(|e| self.io_err(e))?;
        // `mode` only applies on creation; narrow an older file too.
        file.set_permissions(fs::Permissions::from_mode(0o600))
            .map_err(|e| self.io_err(e))?;
        file.write_all(hash.as_bytes())
            .map_err(|e| self.io_err(e))?;

        tracing::info!(path = %self.path.display(), "password updated");
        Ok(())
    }

    /// Checks `password` against the stored hash.
    pub fn verify(&self, password: &str) -> Result<(), PasswordError> {
        let record = match fs::read_to_string(&self.path) {
            Ok(record) => record,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(PasswordError::NotSet),
            Err(e) => return Err(self.io_err(e)),
        };
        match bcrypt::verify(password, record.trim()) {
            Ok(true) => Ok(()),
            Ok(false) => Err(PasswordError::Incorrect),
            Err(_) => Err(PasswordError::Corrupt {
                path: self.path.clone(),
            }),
        }
    }

    /// Replaces the password once the current one is verified.
    pub fn change(&self, current: &str, new: &str, confirm: &str) -> Result<(), PasswordError> {
        self.verify(current)?;
        self.set(new, confirm)
    }
}
