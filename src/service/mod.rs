//! Startup service registration.
//!
//! Registers the binary with the OS service manager so that a reboot in the
//! middle of a block resumes it. The service runs the binary with
//! `SELFCONTROL_STARTUP=1`; it resumes blocking only when the previous run
//! left `block_on_restart` set.
//!
//! - Linux: a system unit in `/etc/systemd/system`, managed with `systemctl`
//! - macOS: a LaunchAgent in `~/Library/LaunchAgents`, managed with `launchctl`

pub mod error;
pub mod plist;
pub mod systemd;

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;

pub use error::{Result, ServiceError};
pub use plist::SelfControlLaunchAgent;
pub use systemd::SystemdUnit;

use crate::daemon::background::ENV_STARTUP;
use crate::settings::{Settings, ENV_HOME, ENV_HOSTS_FILE};

/// Where and how the startup service is registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceTarget {
    /// systemd system unit
    Systemd {
        /// Directory holding unit files
        unit_dir: PathBuf,
    },
    /// launchd LaunchAgent
    LaunchAgent {
        /// Directory holding agent plists
        agents_dir: PathBuf,
    },
}

impl ServiceTarget {
    /// Target for the current platform.
    pub fn for_platform() -> Result<Self> {
        if cfg!(target_os = "macos") {
            let home = dirs::home_dir().ok_or(ServiceError::HomeDirectoryNotFound)?;
            Ok(ServiceTarget::LaunchAgent {
                agents_dir: home.join("Library/LaunchAgents"),
            })
        } else if cfg!(target_os = "linux") {
            Ok(ServiceTarget::Systemd {
                unit_dir: PathBuf::from("/etc/systemd/system"),
            })
        } else {
            Err(ServiceError::Unsupported)
        }
    }

    /// Path of the service file.
    pub fn file_path(&self) -> PathBuf {
        match self {
            ServiceTarget::Systemd { unit_dir } => unit_dir.join(SystemdUnit::NAME),
            ServiceTarget::LaunchAgent { agents_dir } => {
                agents_dir.join(format!("{}.plist", SelfControlLaunchAgent::LABEL))
            }
        }
    }

    /// Renders the service file for `binary`.
    ///
    /// The data directory and hosts path are pinned, since the service
    /// manager may run the binary with a different home directory.
    pub fn render(&self, binary: &Path, settings: &Settings) -> Result<String> {
        let binary = binary.to_string_lossy().into_owned();
        let home = settings.data_dir().to_string_lossy().into_owned();
        let hosts = settings.hosts_path.to_string_lossy().into_owned();
        match self {
            ServiceTarget::Systemd { .. } => Ok(SystemdUnit::new(binary)
                .with_env(ENV_STARTUP, "1")
                .with_env(ENV_HOME, home)
                .with_env(ENV_HOSTS_FILE, hosts)
                .render()),
            ServiceTarget::LaunchAgent { .. } => {
                SelfControlLaunchAgent::new(binary, settings.log_path().to_string_lossy())
                    .with_env(ENV_STARTUP, "1")
                    .with_env(ENV_HOME, home)
                    .with_env(ENV_HOSTS_FILE, hosts)
                    .to_xml()
            }
        }
    }

    /// Writes the service file with mode 0644 and returns its path.
    pub fn write(&self, binary: &Path, settings: &Settings) -> Result<PathBuf> {
        let contents = self.render(binary, settings)?;
        let path = self.file_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| ServiceError::DirectoryCreation {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let write_err = |source| ServiceError::FileWrite {
            path: path.clone(),
            source,
        };
        fs::write(&path, contents).map_err(write_err)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).map_err(write_err)?;
        Ok(path)
    }

    /// Removes the service file. Returns false if it did not exist.
    pub fn remove(&self) -> Result<bool> {
        let path = self.file_path();
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(ServiceError::FileRemove { path, source }),
        }
    }

    /// Returns true if the service file exists.
    pub fn is_installed(&self) -> bool {
        self.file_path().exists()
    }

    fn activate(&self, path: &Path) -> Result<()> {
        match self {
            ServiceTarget::Systemd { .. } => {
                run("systemctl", &["daemon-reload"])?;
                run("systemctl", &["enable", SystemdUnit::NAME])
            }
            ServiceTarget::LaunchAgent { .. } => {
                // A stale registration makes `load` fail.
                let _ = run_path("launchctl", "unload", path);
                run_path("launchctl", "load", path)
            }
        }
    }

    fn deactivate(&self, path: &Path) -> Result<()> {
        match self {
            ServiceTarget::Systemd { .. } => run("systemctl", &["disable", SystemdUnit::NAME]),
            ServiceTarget::LaunchAgent { .. } => run_path("launchctl", "unload", path),
        }
    }
}

fn run(program: &'static str, args: &[&str]) -> Result<()> {
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|source| ServiceError::CommandExecution { program, source })?;

    if !output.status.success() {
        return Err(ServiceError::CommandFailed {
            program,
            action: args.join(" "),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    tracing::debug!(program, ?args, "service manager command succeeded");
    Ok(())
}

fn run_path(program: &'static str, action: &str, path: &Path) -> Result<()> {
    let path = path.to_string_lossy();
    run(program, &[action, path.as_ref()])
}

/// Registers the running binary as a startup service.
///
/// Rewrites the service file and re-registers it, so it can be run again
/// after the binary moves.
pub fn install(settings: &Settings) -> Result<PathBuf> {
    let binary = std::env::current_exe().map_err(ServiceError::BinaryPathResolution)?;
    let target = ServiceTarget::for_platform()?;
    let path = target.write(&binary, settings)?;
    target.activate(&path)?;
    tracing::info!(path = %path.display(), "startup service installed");
    Ok(path)
}

/// Unregisters the startup service. Not being installed is fine.
pub fn uninstall() -> Result<()> {
    let target = ServiceTarget::for_platform()?;
    let path = target.file_path();
    if !path.exists() {
        tracing::info!("startup service not installed, nothing to uninstall");
        return Ok(());
    }
    if let Err(e) = target.deactivate(&path) {
        tracing::warn!("failed to deactivate startup service: {e}");
    }
    target.remove()?;
    tracing::info!("startup service uninstalled");
    Ok(())
}

/// Returns true if the startup service file exists.
pub fn is_installed() -> bool {
    ServiceTarget::for_platform().is_ok_and(|target| target.is_installed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn settings() -> Settings {
        Settings::new("/home/me/.selfcontrol").with_hosts_path("/etc/hosts")
    }

    // ------------------------------------------------------------------------
    // Systemd Tests
    // ------------------------------------------------------------------------

    mod systemd_target_tests {
        use super::*;

        #[test]
        fn test_write_and_remove_unit() {
            let dir = TempDir::new().unwrap();
            let target = ServiceTarget::Systemd {
                unit_dir: dir.path().to_path_buf(),
            };
            assert!(!target.is_installed());

            let path = target
                .write(Path::new("/usr/local/bin/selfcontrol"), &settings())
                .unwrap();
            assert_eq!(path, dir.path().join("selfcontrol.service"));
            assert!(target.is_installed());

            let unit = fs::read_to_string(&path).unwrap();
            assert!(unit.contains("ExecStart=\"/usr/local/bin/selfcontrol\""));
            assert!(unit.contains("Environment=\"SELFCONTROL_STARTUP=1\""));
            assert!(unit.contains("Environment=\"SELFCONTROL_HOME=/home/me/.selfcontrol\""));
            assert!(unit.contains("Environment=\"SELFCONTROL_HOSTS_FILE=/etc/hosts\""));

            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o644);

            assert!(target.remove().unwrap());
            assert!(!target.remove().unwrap());
        }
    }

    // ------------------------------------------------------------------------
    // LaunchAgent Tests
    // ------------------------------------------------------------------------

    mod launch_agent_target_tests {
        use super::*;

        #[test]
        fn test_write_plist() {
            let dir = TempDir::new().unwrap();
            let target = ServiceTarget::LaunchAgent {
                agents_dir: dir.path().join("LaunchAgents"),
            };
            let path = target
                .write(Path::new("/usr/local/bin/selfcontrol"), &settings())
                .unwrap();
            assert_eq!(
                path,
                dir.path().join("LaunchAgents/com.selfcontrol.startup.plist")
            );

            let agent: SelfControlLaunchAgent = ::plist::from_file(&path).unwrap();
            assert_eq!(agent.program_arguments, vec!["/usr/local/bin/selfcontrol"]);
            assert_eq!(
                agent.environment_variables.get("SELFCONTROL_STARTUP"),
                Some(&"1".to_string())
            );
            assert_eq!(
                agent.standard_out_path,
                "/home/me/.selfcontrol/background.log"
            );
        }
    }
}
