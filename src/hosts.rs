//! Hosts-file mutator.
//!
//! Blocked sites are redirected to the loopback address through a marked
//! block at the end of the hosts file:
//!
//! ```text
//! 127.0.0.1 localhost
//!
//! # Added by selfcontrol
//! 127.0.0.1 youtube.com
//! 127.0.0.1 reddit.com
//! ```
//!
//! The blank line before the marker is introduced by the marker itself and
//! is removed with it, so adding and then removing entries restores the
//! file byte for byte. Every operation rewrites the whole file while holding
//! the mutator's own lock.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;

/// Marker line opening this tool's block.
pub const MARKER: &str = "# Added by selfcontrol";

/// Address blocked hosts resolve to.
pub const REDIRECT_ADDR: &str = "127.0.0.1";

/// Errors raised while reading or writing the hosts file.
#[derive(Debug, Error)]
pub enum HostsError {
    /// The hosts file could not be read.
    #[error("failed to read hosts file {}: {source}", path.display())]
    Read {
        /// Hosts file path
        path: PathBuf,
        /// Underlying OS error
        #[source]
        source: io::Error,
    },

    /// The hosts file could not be written.
    #[error("failed to write hosts file {}: {source}", path.display())]
    Write {
        /// Hosts file path
        path: PathBuf,
        /// Underlying OS error
        #[source]
        source: io::Error,
    },
}

/// Returns the host of a `127.0.0.1 <host>` line.
fn redirect_host(line: &str) -> Option<&str> {
    let mut fields = line.split_whitespace();
    match (fields.next(), fields.next()) {
        (Some(REDIRECT_ADDR), Some(host)) => Some(host),
        _ => None,
    }
}

fn is_marker(line: &str) -> bool {
    line.trim() == MARKER
}

/// Returns true if `url` appears as a hostname on any non-comment line.
fn mentions_host(lines: &[String], url: &str) -> bool {
    lines.iter().any(|line| {
        let line = line.trim_start();
        !line.starts_with('#')
            && line
                .split_whitespace()
                .skip(1)
                .any(|host| host.eq_ignore_ascii_case(url))
    })
}

/// Position of the marked block within the file's lines.
struct Block {
    /// Index of the marker line
    marker: usize,
    /// One past the last redirect line following the marker
    end: usize,
}

impl Block {
    fn find(lines: &[String]) -> Option<Self> {
        let marker = lines.iter().position(|line| is_marker(line))?;
        let end = lines[marker + 1..]
            .iter()
            .position(|line| redirect_host(line).is_none())
            .map_or(lines.len(), |offset| marker + 1 + offset);
        Some(Self { marker, end })
    }

    fn entries(&self) -> std::ops::Range<usize> {
        self.marker + 1..self.end
    }
}

/// Serialised access to one hosts file.
#[derive(Debug)]
pub struct HostsFile {
    path: PathBuf,
    lock: Mutex<()>,
}

impl HostsFile {
    /// Creates a mutator for the file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Path of the managed file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_lines(&self) -> Result<Vec<String>, HostsError> {
        let content = fs::read_to_string(&self.path).map_err(|source| HostsError::Read {
            path: self.path.clone(),
            source,
        })?;
        Ok(content.split_inclusive('\n').map(str::to_string).collect())
    }

    fn write_lines(&self, lines: &[String]) -> Result<(), HostsError> {
        fs::write(&self.path, lines.concat()).map_err(|source| HostsError::Write {
            path: self.path.clone(),
            source,
        })
    }

    /// Redirects every URL in `urls` that the file does not already mention.
    ///
    /// The marker is written once; new lines go to the end of the marked
    /// block. Nothing is written when there is nothing new to add.
    pub fn add_entries(&self, urls: &[String]) -> Result<(), HostsError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut lines = self.read_lines()?;

        let mut fresh: Vec<&str> = Vec::new();
        for url in urls {
            let url = url.trim();
            if url.is_empty()
                || mentions_host(&lines, url)
                || fresh.iter().any(|f| f.eq_ignore_ascii_case(url))
            {
                continue;
            }
            fresh.push(url);
        }
        if fresh.is_empty() {
            tracing::debug!("hosts file already covers every requested site");
            return Ok(());
        }

        let new_lines = fresh
            .iter()
            .map(|url| format!("{REDIRECT_ADDR} {url}\n"));

        match Block::find(&lines) {
            Some(block) => {
                if let Some(last) = lines.get_mut(block.end - 1) {
                    if !last.ends_with('\n') {
                        last.push('\n');
                    }
                }
                let at = block.end;
                lines.splice(at..at, new_lines);
            }
            None => {
                lines.push("\n".to_string());
                lines.push(format!("{MARKER}\n"));
                lines.extend(new_lines);
            }
        }

        self.write_lines(&lines)?;
        tracing::info!(count = fresh.len(), path = %self.path.display(), "added hosts entries");
        Ok(())
    }

    /// Removes marked entries.
    ///
    /// With `all` set the whole marked block goes, marker included. Otherwise
    /// only lines whose host equals one of `urls` are removed, each URL
    /// consuming at most one line, and the marker goes once the block is
    /// empty. Lines outside the block are never touched.
    pub fn remove_entries(&self, urls: &[String], all: bool) -> Result<(), HostsError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut lines = self.read_lines()?;

        let Some(block) = Block::find(&lines) else {
            tracing::debug!("no marked block in hosts file");
            return Ok(());
        };

        let mut removed = vec![false; lines.len()];
        if all {
            for index in block.entries() {
                removed[index] = true;
            }
        } else {
            for url in urls {
                let url = url.trim();
                let hit = block.entries().find(|&index| {
                    !removed[index]
                        && redirect_host(&lines[index])
                            .is_some_and(|host| host.eq_ignore_ascii_case(url))
                });
                if let Some(index) = hit {
                    removed[index] = true;
                }
            }
        }

        let remaining = block.entries().filter(|&index| !removed[index]).count();
        let drop_marker = all || remaining == 0;
        if block.entries().all(|index| !removed[index]) && !drop_marker {
            return Ok(());
        }

        if drop_marker {
            removed[block.marker] = true;
            if block.marker > 0 {
                if let Some(stripped) = lines[block.marker - 1].strip_suffix('\n') {
                    lines[block.marker - 1] = stripped.to_string();
                }
            }
        }

        let kept: Vec<String> = lines
            .into_iter()
            .zip(removed)
            .filter_map(|(line, gone)| (!gone).then_some(line))
            .collect();
        self.write_lines(&kept)?;
        tracing::info!(all, path = %self.path.display(), "removed hosts entries");
        Ok(())
    }

    /// Returns the hosts currently redirected by the marked block.
    pub fn blocked_hosts(&self) -> Result<Vec<String>, HostsError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let lines = self.read_lines()?;
        Ok(Block::find(&lines)
            .map(|block| {
                block
                    .entries()
                    .filter_map(|index| redirect_host(&lines[index]).map(str::to_string))
                    .collect()
            })
            .unwrap_or_default())
    }
}
