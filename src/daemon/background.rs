//! Background and startup orchestration.
//!
//! A running block must outlive the interactive session that started it.
//! On exit the session hands enforcement off to a headless copy of the
//! binary, which resumes the blocks from the persisted records and exits
//! once they have all ended. The lock file records the headless instance's
//! PID so that the next session can stop it before taking over.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};

use super::engine::{BlockEngine, RecoveryOutcome};
use super::error::{BlockError, ProcessError};
use crate::settings::{Settings, ENV_HOME, ENV_HOSTS_FILE, ENV_POLL_MS};

/// Set to `1` in the headless worker's environment.
pub const ENV_BACKGROUND: &str = "SELFCONTROL_BACKGROUND";

/// Set to `1` when the OS starts the binary at boot or login.
pub const ENV_STARTUP: &str = "SELFCONTROL_STARTUP";

/// Interval at which a terminated instance is checked for exit.
pub const REAP_POLL_INTERVAL: Duration = Duration::from_millis(100);

// ============================================================================
// LaunchRole
// ============================================================================

/// Why this process was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchRole {
    /// Started by the user
    Interactive,
    /// Started by a session handing off its blocks
    Background,
    /// Started by the OS service manager
    Startup,
}

impl LaunchRole {
    /// Reads the role from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the role through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let set = |key: &str| lookup(key).is_some_and(|v| v.trim() == "1");
        if set(ENV_BACKGROUND) {
            LaunchRole::Background
        } else if set(ENV_STARTUP) {
            LaunchRole::Startup
        } else {
            LaunchRole::Interactive
        }
    }

    /// Returns true for roles that run without a terminal.
    pub fn is_headless(&self) -> bool {
        !matches!(self, LaunchRole::Interactive)
    }
}

// ============================================================================
// LockFile
// ============================================================================

/// File holding the background instance's PID.
#[derive(Debug, Clone)]
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    /// Creates a handle for the lock file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the recorded PID. A missing or empty file means none.
    pub fn read_pid(&self) -> Result<Option<u32>, ProcessError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(ProcessError::LockRead {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        trimmed
            .parse()
            .map(Some)
            .map_err(|_| ProcessError::InvalidPid {
                path: self.path.clone(),
                content: trimmed.to_string(),
            })
    }

    /// Records `pid`.
    pub fn write_pid(&self, pid: u32) -> Result<(), ProcessError> {
        let write_err = |source| ProcessError::LockWrite {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
        fs::write(&self.path, pid.to_string()).map_err(write_err)
    }

    /// Deletes the lock file. A missing file is fine.
    pub fn remove(&self) -> Result<(), ProcessError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ProcessError::LockRemove {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

// ============================================================================
// ProcessControl
// ============================================================================

/// Operating-system process operations used by the orchestration.
pub trait ProcessControl: Send + Sync {
    /// Returns true if a process with `pid` exists.
    fn is_alive(&self, pid: u32) -> Result<bool, ProcessError>;

    /// Asks the process to exit.
    fn terminate(&self, pid: u32) -> Result<(), ProcessError>;

    /// Launches the headless worker, returning its PID.
    fn spawn_headless(&self, settings: &Settings) -> Result<u32, ProcessError>;
}

fn to_pid(pid: u32) -> Result<Pid, ProcessError> {
    i32::try_from(pid)
        .map(Pid::from_raw)
        .map_err(|_| ProcessError::Signal {
            pid,
            source: Errno::EINVAL,
        })
}

/// Process control through signals and `std::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessControl;

impl ProcessControl for SystemProcessControl {
    fn is_alive(&self, pid: u32) -> Result<bool, ProcessError> {
        match kill(to_pid(pid)?, None) {
            Ok(()) => Ok(true),
            Err(Errno::ESRCH) => Ok(false),
            // The process exists but belongs to someone else.
            Err(Errno::EPERM) => Ok(true),
            Err(source) => Err(ProcessError::Signal { pid, source }),
        }
    }

    fn terminate(&self, pid: u32) -> Result<(), ProcessError> {
        match kill(to_pid(pid)?, Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(source) => Err(ProcessError::Signal { pid, source }),
        }
    }

    fn spawn_headless(&self, settings: &Settings) -> Result<u32, ProcessError> {
        let exe = std::env::current_exe().map_err(ProcessError::ExecutablePath)?;

        fs::create_dir_all(settings.data_dir()).map_err(ProcessError::Spawn)?;
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(settings.log_path())
            .map_err(ProcessError::Spawn)?;
        let log_err = log.try_clone().map_err(ProcessError::Spawn)?;

        let child = Command::new(exe)
            .env(ENV_BACKGROUND, "1")
            .env_remove(ENV_STARTUP)
            .env(ENV_HOME, settings.data_dir())
            .env(ENV_HOSTS_FILE, &settings.hosts_path)
            .env(ENV_POLL_MS, settings.poll_interval.as_millis().to_string())
            .stdin(Stdio::null())
            .stdout(log)
            .stderr(log_err)
            // Leave the terminal's process group so Ctrl-C does not reach it.
            .process_group(0)
            .spawn()
            .map_err(ProcessError::Spawn)?;

        Ok(child.id())
    }
}

/// In-memory process table for tests.
#[derive(Debug, Default)]
pub struct MockProcessControl {
    alive: Mutex<HashSet<u32>>,
    terminated: Mutex<Vec<u32>>,
    spawned: Mutex<Vec<u32>>,
    next_pid: AtomicU32,
    ignore_terminate: AtomicBool,
    fail_spawn: AtomicBool,
    restart_flag_at_spawn: Mutex<Vec<Option<bool>>>,
}

impl MockProcessControl {
    /// Creates an empty process table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_pid: AtomicU32::new(40_000),
            ..Self::default()
        }
    }

    /// Marks `pid` as running.
    pub fn add_process(&self, pid: u32) {
        self.alive.lock().unwrap().insert(pid);
    }

    /// Makes `terminate` a no-op, as for a hung process.
    pub fn set_ignore_terminate(&self, ignore: bool) {
        self.ignore_terminate.store(ignore, Ordering::SeqCst);
    }

    /// Makes `spawn_headless` fail.
    pub fn set_fail_spawn(&self, fail: bool) {
        self.fail_spawn.store(fail, Ordering::SeqCst);
    }

    /// PIDs passed to `terminate`.
    #[must_use]
    pub fn terminated(&self) -> Vec<u32> {
        self.terminated.lock().unwrap().clone()
    }

    /// PIDs handed out by `spawn_headless`.
    #[must_use]
    pub fn spawned(&self) -> Vec<u32> {
        self.spawned.lock().unwrap().clone()
    }

    /// The persisted `block_on_restart` flag observed at each spawn.
    #[must_use]
    pub fn restart_flag_at_spawn(&self) -> Vec<Option<bool>> {
        self.restart_flag_at_spawn.lock().unwrap().clone()
    }
}

impl ProcessControl for MockProcessControl {
    fn is_alive(&self, pid: u32) -> Result<bool, ProcessError> {
        Ok(self.alive.lock().unwrap().contains(&pid))
    }

    fn terminate(&self, pid: u32) -> Result<(), ProcessError> {
        self.terminated.lock().unwrap().push(pid);
        if !self.ignore_terminate.load(Ordering::SeqCst) {
            self.alive.lock().unwrap().remove(&pid);
        }
        Ok(())
    }

    fn spawn_headless(&self, settings: &Settings) -> Result<u32, ProcessError> {
        if self.fail_spawn.load(Ordering::SeqCst) {
            return Err(ProcessError::Spawn(std::io::Error::other("spawn refused")));
        }
        let flag = crate::store::ConfigStore::new(settings.config_path())
            .load()
            .ok()
            .map(|config| config.current_status.block_on_restart);
        self.restart_flag_at_spawn.lock().unwrap().push(flag);

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.alive.lock().unwrap().insert(pid);
        self.spawned.lock().unwrap().push(pid);
        Ok(pid)
    }
}

// ============================================================================
// Orchestration
// ============================================================================

/// What `reap_existing_instance` found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapOutcome {
    /// No lock file, or an empty one
    None,
    /// The recorded process was already gone
    Stale {
        /// Recorded PID
        pid: u32,
    },
    /// The recorded process was stopped
    Terminated {
        /// Recorded PID
        pid: u32,
    },
}

/// Stops the background instance recorded in `lock`, if any.
///
/// Waits at most `timeout` for the process to exit, checking every `poll`.
/// The lock file is removed once no instance is running.
///
/// # Errors
///
/// `Unkillable` if the process is still alive when the timeout runs out.
pub async fn reap_existing_instance(
    lock: &LockFile,
    ctl: &dyn ProcessControl,
    timeout: Duration,
    poll: Duration,
) -> Result<ReapOutcome, ProcessError> {
    let Some(pid) = lock.read_pid()? else {
        return Ok(ReapOutcome::None);
    };
    if pid == std::process::id() {
        lock.remove()?;
        return Ok(ReapOutcome::Stale { pid });
    }
    if !ctl.is_alive(pid)? {
        tracing::info!(pid, "removing stale lock file");
        lock.remove()?;
        return Ok(ReapOutcome::Stale { pid });
    }

    tracing::info!(pid, "stopping background instance");
    ctl.terminate(pid)?;

    let deadline = Instant::now() + timeout;
    let mut ticker = interval(poll);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        if !ctl.is_alive(pid)? {
            lock.remove()?;
            return Ok(ReapOutcome::Terminated { pid });
        }
        if Instant::now() >= deadline {
            tracing::warn!(pid, "background instance did not exit");
            return Err(ProcessError::Unkillable { pid, timeout });
        }
    }
}

/// Stops any previous instance and launches a new headless one.
///
/// Returns the new instance's PID without waiting for it.
pub async fn start_background(
    settings: &Settings,
    ctl: &dyn ProcessControl,
) -> Result<u32, ProcessError> {
    let lock = LockFile::new(settings.lock_path());
    reap_existing_instance(&lock, ctl, settings.kill_timeout, REAP_POLL_INTERVAL).await?;
    let pid = ctl.spawn_headless(settings)?;
    lock.write_pid(pid)?;
    tracing::info!(pid, "background instance started");
    Ok(pid)
}

/// Hands running blocks off to a headless instance.
///
/// The resume flag is armed before the instance is launched, so the new
/// instance always sees it.
pub async fn hand_off(
    engine: &BlockEngine,
    settings: &Settings,
    ctl: &dyn ProcessControl,
) -> Result<u32, BlockError> {
    engine.arm_restart()?;
    Ok(start_background(settings, ctl).await?)
}

/// Body of the headless instance.
///
/// Records its own PID, resumes blocks, and returns once every block has
/// ended. While a resumed block runs the resume flag stays armed, so a
/// reboot in the middle of a block resumes it again.
pub async fn run_background_loop(
    engine: &BlockEngine,
    lock: &LockFile,
) -> Result<RecoveryOutcome, BlockError> {
    lock.write_pid(std::process::id())?;

    let outcome = engine.recover(true).await?;
    if outcome.resumed_anything() {
        engine.arm_restart()?;
        tracing::info!("waiting for resumed blocks to end");
        engine.registry().wait_background_drained().await;
    }

    engine.disarm_restart()?;
    lock.remove()?;
    tracing::info!("background instance finished");
    Ok(outcome)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    // ------------------------------------------------------------------------
    // LaunchRole Tests
    // ------------------------------------------------------------------------

    mod launch_role_tests {
        use super::*;

        fn role(vars: &[(&str, &str)]) -> LaunchRole {
            let map: HashMap<&str, &str> = vars.iter().copied().collect();
            LaunchRole::from_lookup(|key| map.get(key).map(|v| v.to_string()))
        }

        #[test]
        fn test_default_is_interactive() {
            assert_eq!(role(&[]), LaunchRole::Interactive);
            assert!(!role(&[]).is_headless());
        }

        #[test]
        fn test_background_wins_over_startup() {
            assert_eq!(
                role(&[(ENV_BACKGROUND, "1"), (ENV_STARTUP, "1")]),
                LaunchRole::Background
            );
            assert_eq!(role(&[(ENV_STARTUP, "1")]), LaunchRole::Startup);
        }

        #[test]
        fn test_other_values_ignored() {
            assert_eq!(role(&[(ENV_BACKGROUND, "yes")]), LaunchRole::Interactive);
        }
    }

    // ------------------------------------------------------------------------
    // LockFile Tests
    // ------------------------------------------------------------------------

    mod lock_file_tests {
        use super::*;

        #[test]
        fn test_missing_and_empty_mean_none() {
            let dir = TempDir::new().unwrap();
            let lock = LockFile::new(dir.path().join("selfcontrol.lock"));
            assert_eq!(lock.read_pid().unwrap(), None);

            fs::write(lock.path(), "  \n").unwrap();
            assert_eq!(lock.read_pid().unwrap(), None);
        }

        #[test]
        fn test_write_read_remove() {
            let dir = TempDir::new().unwrap();
            let lock = LockFile::new(dir.path().join("nested/selfcontrol.lock"));
            lock.write_pid(1234).unwrap();
            assert_eq!(fs::read_to_string(lock.path()).unwrap(), "1234");
            assert_eq!(lock.read_pid().unwrap(), Some(1234));

            lock.remove().unwrap();
            lock.remove().unwrap();
            assert!(!lock.path().exists());
        }

        #[test]
        fn test_garbage_is_invalid_pid() {
            let dir = TempDir::new().unwrap();
            let lock = LockFile::new(dir.path().join("selfcontrol.lock"));
            fs::write(lock.path(), "abc").unwrap();
            assert!(matches!(
                lock.read_pid(),
                Err(ProcessError::InvalidPid { .. })
            ));
        }
    }

    // ------------------------------------------------------------------------
    // Reap Tests
    // ------------------------------------------------------------------------

    mod reap_tests {
        use super::*;

        const POLL: Duration = Duration::from_millis(5);

        fn lock_with(pid: Option<u32>) -> (TempDir, LockFile) {
            let dir = TempDir::new().unwrap();
            let lock = LockFile::new(dir.path().join("selfcontrol.lock"));
            if let Some(pid) = pid {
                lock.write_pid(pid).unwrap();
            }
            (dir, lock)
        }

        #[tokio::test]
        async fn test_no_lock() {
            let (_dir, lock) = lock_with(None);
            let ctl = MockProcessControl::new();
            let outcome = reap_existing_instance(&lock, &ctl, Duration::from_secs(1), POLL)
                .await
                .unwrap();
            assert_eq!(outcome, ReapOutcome::None);
        }

        #[tokio::test]
        async fn test_stale_lock_removed() {
            let (_dir, lock) = lock_with(Some(777));
            let ctl = MockProcessControl::new();
            let outcome = reap_existing_instance(&lock, &ctl, Duration::from_secs(1), POLL)
                .await
                .unwrap();
            assert_eq!(outcome, ReapOutcome::Stale { pid: 777 });
            assert!(!lock.path().exists());
            assert!(ctl.terminated().is_empty());
        }

        #[tokio::test]
        async fn test_live_instance_terminated() {
            let (_dir, lock) = lock_with(Some(777));
            let ctl = MockProcessControl::new();
            ctl.add_process(777);
            let outcome = reap_existing_instance(&lock, &ctl, Duration::from_secs(1), POLL)
                .await
                .unwrap();
            assert_eq!(outcome, ReapOutcome::Terminated { pid: 777 });
            assert_eq!(ctl.terminated(), vec![777]);
            assert!(!lock.path().exists());
        }

        #[tokio::test]
        async fn test_unkillable_instance_times_out() {
            let (_dir, lock) = lock_with(Some(777));
            let ctl = MockProcessControl::new();
            ctl.add_process(777);
            ctl.set_ignore_terminate(true);

            let err = reap_existing_instance(&lock, &ctl, Duration::from_millis(30), POLL)
                .await
                .unwrap_err();
            assert!(matches!(err, ProcessError::Unkillable { pid: 777, .. }));
            assert!(lock.path().exists());
        }
    }

    // ------------------------------------------------------------------------
    // Hand-off Tests
    // ------------------------------------------------------------------------

    mod hand_off_tests {
        use super::*;
        use crate::timeutil::FixedClock;
        use std::sync::Arc;

        fn setup() -> (TempDir, Settings, BlockEngine) {
            let dir = TempDir::new().unwrap();
            let hosts = dir.path().join("hosts");
            fs::write(&hosts, "127.0.0.1 localhost\n").unwrap();
            let settings = Settings::new(dir.path().join("data"))
                .with_hosts_path(hosts)
                .with_poll_interval(Duration::from_millis(10));
            let clock = Arc::new(FixedClock::at("2024-05-06 10:00:00 +0200"));
            let engine = BlockEngine::new(&settings, clock);
            engine.ensure_config().unwrap();
            (dir, settings, engine)
        }

        #[tokio::test]
        async fn test_start_background_records_pid() {
            let (_dir, settings, _engine) = setup();
            let ctl = MockProcessControl::new();
            let pid = start_background(&settings, &ctl).await.unwrap();
            assert_eq!(LockFile::new(settings.lock_path()).read_pid().unwrap(), Some(pid));
        }

        #[tokio::test]
        async fn test_start_background_replaces_previous_instance() {
            let (_dir, settings, _engine) = setup();
            let ctl = MockProcessControl::new();
            let first = start_background(&settings, &ctl).await.unwrap();
            let second = start_background(&settings, &ctl).await.unwrap();
            assert_eq!(ctl.terminated(), vec![first]);
            assert_eq!(LockFile::new(settings.lock_path()).read_pid().unwrap(), Some(second));
        }

        #[tokio::test]
        async fn test_hand_off_arms_flag_before_spawn() {
            let (_dir, settings, engine) = setup();
            let ctl = MockProcessControl::new();
            hand_off(&engine, &settings, &ctl).await.unwrap();
            assert_eq!(ctl.restart_flag_at_spawn(), vec![Some(true)]);
        }

        #[tokio::test]
        async fn test_failed_spawn_keeps_flag_armed() {
            let (_dir, settings, engine) = setup();
            let ctl = MockProcessControl::new();
            ctl.set_fail_spawn(true);
            assert!(hand_off(&engine, &settings, &ctl).await.is_err());
            assert!(engine.config().unwrap().current_status.block_on_restart);
        }

        #[tokio::test]
        async fn test_background_loop_runs_resumed_block_to_the_end() {
            let (_dir, settings, engine) = setup();
            engine.add_site("a.com").unwrap();
            engine.arm_restart().unwrap();
            {
                let store = crate::store::ConfigStore::new(settings.config_path());
                store
                    .update(|config| {
                        config.current_status.block_custom_time = true;
                        config.current_status.ended_at = "2024-05-06 10:00:00 +0200".to_string();
                        Ok(())
                    })
                    .unwrap();
            }
            let lock = LockFile::new(settings.lock_path());

            // The saved block already ended, so nothing resumes.
            let outcome = run_background_loop(&engine, &lock).await.unwrap();
            assert!(!outcome.resumed_anything());
            assert!(!lock.path().exists());
            assert!(!engine.config().unwrap().current_status.block_on_restart);
        }
    }
}
