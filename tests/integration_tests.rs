//! Integration tests for the block engine, timer registry and hosts file.
//!
//! These tests drive the public library API against a temporary data
//! directory and hosts file:
//! - Hosts-file round trip
//! - Timer idempotence and at-most-one timer per key
//! - Strict-mode lock
//! - Schedule and custom-time blocks
//! - Restart recovery and background hand-off

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Weekday;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

use selfcontrol::daemon::{
    hand_off, run_background_loop, BlockEngine, BlockError, LockFile, MockProcessControl,
    TimerEvent,
};
use selfcontrol::hosts::HostsFile;
use selfcontrol::store::ConfigStore;
use selfcontrol::timeutil::{parse_timestamp, Clock, FixedClock, SystemClock};
use selfcontrol::types::{Mode, Schedule};
use selfcontrol::Settings;

// ============================================================================
// Test Helpers
// ============================================================================

const HOSTS: &str = "127.0.0.1 localhost\n::1 localhost\n";

// 2024-05-06 is a Monday.
const MONDAY_10AM: &str = "2024-05-06 10:00:00 +0200";

/// A data directory and hosts file in a temporary directory.
struct Sandbox {
    dir: TempDir,
    settings: Settings,
}

impl Sandbox {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let hosts = dir.path().join("hosts");
        fs::write(&hosts, HOSTS).unwrap();
        let settings = Settings::new(dir.path().join("data"))
            .with_hosts_path(hosts)
            .with_poll_interval(Duration::from_millis(10));
        Self { dir, settings }
    }

    fn engine(&self, clock: Arc<dyn Clock>) -> BlockEngine {
        let engine = BlockEngine::new(&self.settings, clock);
        engine.ensure_config().unwrap();
        engine
    }

    fn engine_with_events(
        &self,
        clock: Arc<dyn Clock>,
    ) -> (BlockEngine, mpsc::UnboundedReceiver<TimerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = BlockEngine::with_events(&self.settings, clock, tx);
        engine.ensure_config().unwrap();
        (engine, rx)
    }

    fn hosts_path(&self) -> PathBuf {
        self.dir.path().join("hosts")
    }

    fn hosts(&self) -> String {
        fs::read_to_string(self.hosts_path()).unwrap()
    }

    fn config_store(&self) -> ConfigStore {
        ConfigStore::new(self.settings.config_path())
    }
}

fn monday_clock() -> Arc<FixedClock> {
    Arc::new(FixedClock::at(MONDAY_10AM))
}

// ============================================================================
// Hosts File
// ============================================================================

#[test]
fn test_hosts_round_trip_restores_original_bytes() {
    let sandbox = Sandbox::new();
    let hosts = HostsFile::new(sandbox.hosts_path());

    hosts.add_entries(&["a.com".to_string()]).unwrap();
    assert!(sandbox.hosts().contains("# Added by selfcontrol"));
    assert!(sandbox.hosts().contains("127.0.0.1 a.com"));

    hosts.remove_entries(&["a.com".to_string()], false).unwrap();
    assert_eq!(sandbox.hosts(), HOSTS);
}

#[test]
fn test_hosts_remove_all_strips_whole_block() {
    let sandbox = Sandbox::new();
    let hosts = HostsFile::new(sandbox.hosts_path());
    hosts
        .add_entries(&["a.com".to_string(), "b.com".to_string()])
        .unwrap();

    hosts.remove_entries(&[], true).unwrap();
    assert_eq!(sandbox.hosts(), HOSTS);
}

// ============================================================================
// Timer Registry
// ============================================================================

#[tokio::test]
async fn test_second_cancel_is_noop() {
    let sandbox = Sandbox::new();
    let engine = sandbox.engine(monday_clock());
    engine.add_site("a.com").unwrap();
    engine
        .block_for_duration(Duration::from_secs(1800), false)
        .await
        .unwrap();

    assert!(engine.registry().cancel_timer("combined").await.unwrap());
    assert!(!engine.registry().cancel_timer("combined").await.unwrap());
    assert!(engine.registry().is_idle());
    assert_eq!(sandbox.hosts(), HOSTS);
}

#[tokio::test]
async fn test_restarting_a_block_keeps_one_timer() {
    let sandbox = Sandbox::new();
    let engine = sandbox.engine(monday_clock());
    engine.add_site("a.com").unwrap();

    engine
        .block_for_duration(Duration::from_secs(600), false)
        .await
        .unwrap();
    engine
        .block_for_duration(Duration::from_secs(1200), false)
        .await
        .unwrap();

    assert_eq!(engine.registry().count(), 1);
    assert_eq!(
        engine.registry().expiry_of("combined"),
        Some(parse_timestamp("2024-05-06 10:20:00 +0200").unwrap())
    );
    // The replaced timer did not lift the block.
    assert!(sandbox.hosts().contains("127.0.0.1 a.com"));

    engine.unblock_all().await.unwrap();
}

// ============================================================================
// Strict Mode
// ============================================================================

#[tokio::test]
async fn test_strict_mode_refuses_menus_with_expiry() {
    let sandbox = Sandbox::new();
    let engine = sandbox.engine(monday_clock());
    engine.add_site("a.com").unwrap();
    engine
        .block_for_duration(Duration::from_secs(3600), false)
        .await
        .unwrap();
    engine.enter_strict().unwrap();

    match engine.check_menu_access() {
        Err(BlockError::StrictModeActive { expires_at }) => {
            assert_eq!(expires_at, "2024-05-06 11:00:00 +0200");
        }
        other => panic!("expected strict-mode refusal, got {other:?}"),
    }
    assert!(matches!(
        engine.unblock_all().await,
        Err(BlockError::StrictModeActive { .. })
    ));
    assert!(matches!(
        engine.update_schedules(|_| Ok(())),
        Err(BlockError::StrictModeActive { .. })
    ));

    // Tear down through the registry, as expiry would.
    engine.registry().cancel_all().await.unwrap();
    assert_eq!(engine.mode().unwrap(), Mode::Normal);
}

// ============================================================================
// Schedule and Custom-Time Blocks
// ============================================================================

#[tokio::test]
async fn test_schedule_block_runs_until_range_end() {
    let sandbox = Sandbox::new();
    let engine = sandbox.engine(monday_clock());
    engine.add_site("a.com").unwrap();
    engine.add_site("b.com").unwrap();
    engine
        .update_schedules(|config| {
            config.add_schedule(&Schedule::new("work", vec![Weekday::Mon], "09:00", "17:00")?)
        })
        .unwrap();

    let expiry = engine.block_by_schedule(false).await.unwrap();

    assert_eq!(expiry, parse_timestamp("2024-05-06 17:00:00 +0200").unwrap());
    assert_eq!(engine.registry().keys(), vec!["combined"]);
    let blocked = HostsFile::new(sandbox.hosts_path()).blocked_hosts().unwrap();
    assert_eq!(blocked, vec!["a.com", "b.com"]);

    engine.unblock_all().await.unwrap();
    assert_eq!(sandbox.hosts(), HOSTS);
}

#[tokio::test]
async fn test_no_active_schedule() {
    let sandbox = Sandbox::new();
    let engine = sandbox.engine(monday_clock());
    engine.add_site("a.com").unwrap();
    assert!(matches!(
        engine.block_by_schedule(false).await,
        Err(BlockError::NoActiveSchedule)
    ));
    assert!(engine.registry().is_idle());
}

#[tokio::test]
async fn test_custom_block_records_end_and_self_expires() {
    let sandbox = Sandbox::new();
    let (engine, mut events) = sandbox.engine_with_events(Arc::new(SystemClock));
    engine.add_site("a.com").unwrap();

    let expiry = engine
        .block_for_duration(Duration::from_millis(300), false)
        .await
        .unwrap();

    let status = sandbox.config_store().load().unwrap().current_status;
    assert!(status.block_custom_time);
    assert_eq!(status.ended_at, selfcontrol::timeutil::format_timestamp(&expiry));
    assert!(sandbox.hosts().contains("127.0.0.1 a.com"));

    timeout(Duration::from_secs(5), engine.registry().wait_idle())
        .await
        .expect("block should expire");

    assert_eq!(sandbox.hosts(), HOSTS);
    let status = sandbox.config_store().load().unwrap().current_status;
    assert!(!status.block_custom_time);
    assert!(status.ended_at.is_empty());

    let mut saw_expired = false;
    while let Ok(event) = events.try_recv() {
        if event == (TimerEvent::Expired { key: "combined".to_string() }) {
            saw_expired = true;
        }
    }
    assert!(saw_expired);
}

// ============================================================================
// Restart Recovery
// ============================================================================

#[tokio::test]
async fn test_recovery_skips_ended_custom_block() {
    let sandbox = Sandbox::new();
    let engine = sandbox.engine(monday_clock());
    engine.add_site("a.com").unwrap();
    sandbox
        .config_store()
        .update(|config| {
            let status = &mut config.current_status;
            status.block_on_restart = true;
            status.block_custom_time = true;
            status.ended_at = "2024-05-06 09:00:00 +0200".to_string();
            Ok(())
        })
        .unwrap();

    let outcome = engine.recover(false).await.unwrap();

    assert!(!outcome.resumed_anything());
    assert!(engine.registry().is_idle());
    let status = sandbox.config_store().load().unwrap().current_status;
    assert!(!status.block_on_restart);
    assert!(!status.block_custom_time);
}

#[tokio::test]
async fn test_hand_off_and_background_resume() {
    let sandbox = Sandbox::new();
    let clock = Arc::new(SystemClock);

    // Foreground session starts a block and hands it off.
    let foreground = sandbox.engine(clock.clone());
    foreground.add_site("a.com").unwrap();
    foreground
        .block_for_duration(Duration::from_millis(400), false)
        .await
        .unwrap();
    let ctl = MockProcessControl::new();
    let pid = hand_off(&foreground, &sandbox.settings, &ctl).await.unwrap();
    assert_eq!(ctl.spawned(), vec![pid]);
    assert_eq!(ctl.restart_flag_at_spawn(), vec![Some(true)]);
    drop(foreground);

    // The headless instance resumes and runs the block to its end.
    let background = sandbox.engine(clock);
    let lock = LockFile::new(sandbox.settings.lock_path());
    let outcome = timeout(
        Duration::from_secs(5),
        run_background_loop(&background, &lock),
    )
    .await
    .expect("background loop should finish")
    .unwrap();

    assert!(outcome.combined.is_some());
    assert!(outcome.stripped_stale);
    assert_eq!(sandbox.hosts(), HOSTS);
    assert!(!lock.path().exists());
    let status = sandbox.config_store().load().unwrap().current_status;
    assert!(!status.block_on_restart);
}
