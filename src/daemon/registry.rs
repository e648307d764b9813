//! Block registry and timer supervisor.
//!
//! Every active block is a tokio task registered under a key (a site URL,
//! or [`COMBINED_KEY`](crate::types::COMBINED_KEY) for the batch block).
//! The task ticks at the poll interval against a monotonic deadline and
//! tears its block down when the deadline passes. Cancellation is
//! cooperative through a `CancellationToken`; `cancel_timer` joins the task
//! so the caller never observes a half-torn-down block.
//!
//! Ownership of a key's teardown is decided by removing the map entry:
//! whoever removes it (the expiring task, or `cancel_timer`) decides which
//! teardown path runs, and it runs exactly once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, FixedOffset};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::error::BlockError;
use crate::timeutil::{format_timestamp, until, Clock};

// ============================================================================
// TimerEvent
// ============================================================================

/// Timer lifecycle events for the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerEvent {
    /// A block timer started
    Started {
        /// Timer key
        key: String,
        /// Formatted expiry
        expires_at: String,
    },
    /// A block ran out and was lifted
    Expired {
        /// Timer key
        key: String,
    },
    /// A block was cancelled and lifted
    Cancelled {
        /// Timer key
        key: String,
    },
    /// Lifting a block failed
    TeardownFailed {
        /// Timer key
        key: String,
        /// Error description
        message: String,
    },
}

// ============================================================================
// BlockTeardown
// ============================================================================

/// Lifts a block when its timer ends.
///
/// `remaining` lists the keys still registered after this one was removed.
pub trait BlockTeardown: Send + Sync {
    /// Called once when the timer for `key` reaches its deadline.
    fn on_expired(&self, key: &str, remaining: &[String]) -> Result<(), BlockError>;

    /// Called once when the timer for `key` is cancelled.
    fn on_cancelled(&self, key: &str, remaining: &[String]) -> Result<(), BlockError>;
}

// ============================================================================
// Gauge
// ============================================================================

/// Counter whose zero crossing can be awaited.
#[derive(Debug, Clone)]
struct Gauge {
    tx: Arc<watch::Sender<usize>>,
}

impl Gauge {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }

    fn enter(&self) -> GaugeGuard {
        self.tx.send_modify(|count| *count += 1);
        GaugeGuard {
            tx: Arc::clone(&self.tx),
        }
    }

    fn value(&self) -> usize {
        *self.tx.borrow()
    }

    async fn wait_zero(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|count| *count == 0).await;
    }
}

/// Leaves the gauge on drop, on every exit path of a task.
#[derive(Debug)]
struct GaugeGuard {
    tx: Arc<watch::Sender<usize>>,
}

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.tx.send_modify(|count| *count = count.saturating_sub(1));
    }
}

// ============================================================================
// BlockRegistry
// ============================================================================

struct TimerSlot {
    generation: u64,
    expiry: DateTime<FixedOffset>,
    token: CancellationToken,
    /// Set when the timer is replaced rather than cancelled.
    quiet: Arc<AtomicBool>,
    handle: TaskHandle,
    background: bool,
}

type TaskHandle = JoinHandle<Result<(), BlockError>>;

struct Inner {
    timers: Mutex<HashMap<String, TimerSlot>>,
    /// Handles of expired tasks whose teardown may still be running.
    finishing: Mutex<HashMap<String, TaskHandle>>,
    next_generation: AtomicU64,
    running: Gauge,
    background: Gauge,
    poll_interval: Duration,
    clock: Arc<dyn Clock>,
    events: Option<mpsc::UnboundedSender<TimerEvent>>,
}

impl Inner {
    fn timers(&self) -> MutexGuard<'_, HashMap<String, TimerSlot>> {
        self.timers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn finishing(&self) -> MutexGuard<'_, HashMap<String, TaskHandle>> {
        self.finishing.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: TimerEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// Removes the entry for `key` if it still belongs to `generation`.
    ///
    /// The task handle moves to `finishing` so a later cancel can wait for
    /// the expiry teardown.
    fn claim(&self, key: &str, generation: u64) -> bool {
        let mut timers = self.timers();
        let owned = timers
            .get(key)
            .is_some_and(|slot| slot.generation == generation);
        if owned {
            if let Some(slot) = timers.remove(key) {
                self.finishing().insert(key.to_string(), slot.handle);
            }
        }
        owned
    }

    fn sorted_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.timers().keys().cloned().collect();
        keys.sort();
        keys
    }
}

/// Registry of active block timers.
pub struct BlockRegistry {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for BlockRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockRegistry")
            .field("keys", &self.keys())
            .field("poll_interval", &self.inner.poll_interval)
            .finish()
    }
}

/// Dropping the registry stops its timers without lifting any block.
impl Drop for BlockRegistry {
    fn drop(&mut self) {
        for slot in self.inner.timers().values() {
            slot.quiet.store(true, Ordering::SeqCst);
            slot.token.cancel();
        }
    }
}

impl BlockRegistry {
    /// Creates an empty registry.
    pub fn new(clock: Arc<dyn Clock>, poll_interval: Duration) -> Self {
        Self::build(clock, poll_interval, None)
    }

    /// Creates an empty registry that reports to `event_tx`.
    pub fn with_events(
        clock: Arc<dyn Clock>,
        poll_interval: Duration,
        event_tx: mpsc::UnboundedSender<TimerEvent>,
    ) -> Self {
        Self::build(clock, poll_interval, Some(event_tx))
    }

    fn build(
        clock: Arc<dyn Clock>,
        poll_interval: Duration,
        events: Option<mpsc::UnboundedSender<TimerEvent>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                timers: Mutex::new(HashMap::new()),
                finishing: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
                running: Gauge::new(),
                background: Gauge::new(),
                poll_interval,
                clock,
                events,
            }),
        }
    }

    /// Starts a timer for `key` that ends at `expiry`.
    ///
    /// A timer already running for `key` is stopped and joined first without
    /// running its teardown, since the block continues under the new timer.
    /// With `background` set the timer joins the background wait group.
    pub async fn start_timer(
        &self,
        key: &str,
        expiry: DateTime<FixedOffset>,
        background: bool,
        teardown: Arc<dyn BlockTeardown>,
    ) -> Result<(), BlockError> {
        self.discard_timer(key).await?;

        let remaining = until(&self.inner.clock.now(), &expiry);
        let deadline = Instant::now() + remaining;
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let quiet = Arc::new(AtomicBool::new(false));

        let task = TimerTask {
            inner: Arc::clone(&self.inner),
            key: key.to_string(),
            generation,
            deadline,
            token: token.clone(),
            quiet: Arc::clone(&quiet),
            teardown,
            _running: self.inner.running.enter(),
            _background: background.then(|| self.inner.background.enter()),
        };

        let displaced = {
            // Insert under the same lock the task claims through, so the task
            // can never look for its entry before it exists.
            let mut timers = self.inner.timers();
            let handle = tokio::spawn(task.run());
            timers.insert(
                key.to_string(),
                TimerSlot {
                    generation,
                    expiry,
                    token,
                    quiet,
                    handle,
                    background,
                },
            )
        };
        // A concurrent start installed its timer after our discard.
        if let Some(old) = displaced {
            tracing::debug!(key, "replacing concurrently started timer");
            old.quiet.store(true, Ordering::SeqCst);
            old.token.cancel();
            if let Err(e) = join(key, old.handle).await {
                tracing::warn!(key, "replaced timer task failed: {e}");
            }
        }

        tracing::info!(
            key,
            expires_at = %format_timestamp(&expiry),
            background,
            "block timer started"
        );
        self.inner.emit(TimerEvent::Started {
            key: key.to_string(),
            expires_at: format_timestamp(&expiry),
        });
        Ok(())
    }

    /// Stops the timer for `key` without running its teardown.
    ///
    /// Used when a block continues under a new timer, or when a timer start
    /// is rolled back. Returns `Ok(false)` when nothing was registered.
    pub async fn discard_timer(&self, key: &str) -> Result<bool, BlockError> {
        let slot = self.inner.timers().remove(key);
        let Some(slot) = slot else {
            self.join_finishing(key).await;
            return Ok(false);
        };
        tracing::debug!(key, "discarding timer");
        slot.quiet.store(true, Ordering::SeqCst);
        slot.token.cancel();
        join(key, slot.handle).await?;
        Ok(true)
    }

    /// Cancels the timer for `key` and waits for its teardown.
    ///
    /// Returns `Ok(false)` when no timer is registered under `key`, after
    /// waiting for an expiry teardown of `key` that is still running. The
    /// teardown's result is returned to the caller.
    pub async fn cancel_timer(&self, key: &str) -> Result<bool, BlockError> {
        let slot = self.inner.timers().remove(key);
        let Some(slot) = slot else {
            tracing::debug!(key, "no timer to cancel");
            self.join_finishing(key).await;
            return Ok(false);
        };
        slot.token.cancel();
        join(key, slot.handle).await?;
        Ok(true)
    }

    /// Cancels every timer. The first teardown error is returned after all
    /// timers have been cancelled.
    pub async fn cancel_all(&self) -> Result<usize, BlockError> {
        let mut cancelled = 0;
        let mut first_error = None;
        for key in self.keys() {
            match self.cancel_timer(&key).await {
                Ok(true) => cancelled += 1,
                Ok(false) => {}
                Err(e) => {
                    cancelled += 1;
                    first_error.get_or_insert(e);
                }
            }
        }
        let finishing: Vec<String> = self.inner.finishing().keys().cloned().collect();
        for key in finishing {
            self.join_finishing(&key).await;
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(cancelled),
        }
    }

    /// Waits for an expiry teardown of `key` claimed before this call.
    async fn join_finishing(&self, key: &str) {
        let handle = self.inner.finishing().remove(key);
        if let Some(handle) = handle {
            // Expiry reports its own failures as events.
            if let Err(e) = join(key, handle).await {
                tracing::warn!(key, "expired timer task failed: {e}");
            }
        }
    }

    /// Number of registered timers.
    pub fn count(&self) -> usize {
        self.inner.timers().len()
    }

    /// Returns true when nothing is being blocked.
    pub fn is_idle(&self) -> bool {
        self.count() == 0
    }

    /// Returns true if a timer is registered under `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.inner.timers().contains_key(key)
    }

    /// Registered keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        self.inner.sorted_keys()
    }

    /// Expiry of the timer registered under `key`.
    pub fn expiry_of(&self, key: &str) -> Option<DateTime<FixedOffset>> {
        self.inner.timers().get(key).map(|slot| slot.expiry)
    }

    /// Latest expiry over all registered timers.
    pub fn latest_expiry(&self) -> Option<DateTime<FixedOffset>> {
        self.inner.timers().values().map(|slot| slot.expiry).max()
    }

    /// Number of registered timers in the background wait group.
    pub fn background_count(&self) -> usize {
        self.inner
            .timers()
            .values()
            .filter(|slot| slot.background)
            .count()
    }

    /// Resolves once every timer task has finished, teardown included.
    pub async fn wait_idle(&self) {
        self.inner.running.wait_zero().await;
    }

    /// Resolves once every background timer task has finished.
    pub async fn wait_background_drained(&self) {
        self.inner.background.wait_zero().await;
    }

    /// Number of background timer tasks that have not finished yet.
    pub fn background_pending(&self) -> usize {
        self.inner.background.value()
    }
}

async fn join(key: &str, handle: TaskHandle) -> Result<(), BlockError> {
    match handle.await {
        Ok(result) => result,
        Err(e) => Err(BlockError::TimerTask {
            key: key.to_string(),
            message: e.to_string(),
        }),
    }
}

// ============================================================================
// TimerTask
// ============================================================================

struct TimerTask {
    inner: Arc<Inner>,
    key: String,
    generation: u64,
    deadline: Instant,
    token: CancellationToken,
    quiet: Arc<AtomicBool>,
    teardown: Arc<dyn BlockTeardown>,
    _running: GaugeGuard,
    _background: Option<GaugeGuard>,
}

impl TimerTask {
    async fn run(self) -> Result<(), BlockError> {
        let mut ticker = interval(self.inner.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => return self.cancelled(),
                _ = ticker.tick() => {
                    if Instant::now() < self.deadline {
                        continue;
                    }
                    if self.inner.claim(&self.key, self.generation) {
                        self.expired();
                        return Ok(());
                    }
                    // A concurrent cancel removed the entry first; it owns
                    // the teardown and is about to signal.
                    self.token.cancelled().await;
                    return self.cancelled();
                }
            }
        }
    }

    fn expired(&self) {
        let remaining = self.inner.sorted_keys();
        match self.teardown.on_expired(&self.key, &remaining) {
            Ok(()) => {
                tracing::info!(key = %self.key, "block expired");
                self.inner.emit(TimerEvent::Expired {
                    key: self.key.clone(),
                });
            }
            Err(e) => {
                tracing::error!(key = %self.key, "failed to lift expired block: {e}");
                self.inner.emit(TimerEvent::TeardownFailed {
                    key: self.key.clone(),
                    message: e.to_string(),
                });
            }
        }
    }

    fn cancelled(&self) -> Result<(), BlockError> {
        if self.quiet.load(Ordering::SeqCst) {
            return Ok(());
        }
        let remaining = self.inner.sorted_keys();
        self.teardown.on_cancelled(&self.key, &remaining)?;
        tracing::info!(key = %self.key, "block cancelled");
        self.inner.emit(TimerEvent::Cancelled {
            key: self.key.clone(),
        });
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeutil::FixedClock;
    use crate::types::ValidationError;

    /// Teardown that records every call.
    #[derive(Debug, Default)]
    struct MockTeardown {
        pub calls: Mutex<Vec<(String, &'static str)>>,
        pub fail: AtomicBool,
    }

    impl MockTeardown {
        pub fn calls(&self) -> Vec<(String, &'static str)> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, key: &str, kind: &'static str) -> Result<(), BlockError> {
            self.calls.lock().unwrap().push((key.to_string(), kind));
            if self.fail.load(Ordering::SeqCst) {
                return Err(ValidationError::Empty("teardown").into());
            }
            Ok(())
        }
    }

    impl BlockTeardown for MockTeardown {
        fn on_expired(&self, key: &str, _remaining: &[String]) -> Result<(), BlockError> {
            self.record(key, "expired")
        }

        fn on_cancelled(&self, key: &str, _remaining: &[String]) -> Result<(), BlockError> {
            self.record(key, "cancelled")
        }
    }

    const POLL: Duration = Duration::from_millis(10);

    fn setup() -> (Arc<FixedClock>, BlockRegistry, Arc<MockTeardown>) {
        let clock = Arc::new(FixedClock::at("2024-05-06 10:00:00 +0200"));
        let registry = BlockRegistry::new(clock.clone(), POLL);
        (clock, registry, Arc::new(MockTeardown::default()))
    }

    fn in_ms(clock: &FixedClock, millis: i64) -> DateTime<FixedOffset> {
        clock.now() + chrono::Duration::milliseconds(millis)
    }

    // ------------------------------------------------------------------------
    // Cancel Tests
    // ------------------------------------------------------------------------

    mod cancel_tests {
        use super::*;

        #[tokio::test]
        async fn test_cancel_absent_key_is_noop() {
            let (_clock, registry, _teardown) = setup();
            assert!(!registry.cancel_timer("combined").await.unwrap());
            assert!(!registry.cancel_timer("combined").await.unwrap());
        }

        #[tokio::test]
        async fn test_cancel_runs_teardown_before_returning() {
            let (clock, registry, teardown) = setup();
            registry
                .start_timer("combined", in_ms(&clock, 60_000), false, teardown.clone())
                .await
                .unwrap();
            assert_eq!(registry.count(), 1);

            assert!(registry.cancel_timer("combined").await.unwrap());
            assert_eq!(teardown.calls(), vec![("combined".to_string(), "cancelled")]);
            assert!(registry.is_idle());

            assert!(!registry.cancel_timer("combined").await.unwrap());
            assert_eq!(teardown.calls().len(), 1);
        }

        #[tokio::test]
        async fn test_cancel_propagates_teardown_error() {
            let (clock, registry, teardown) = setup();
            teardown.fail.store(true, Ordering::SeqCst);
            registry
                .start_timer("a.com", in_ms(&clock, 60_000), false, teardown.clone())
                .await
                .unwrap();

            assert!(registry.cancel_timer("a.com").await.is_err());
            assert!(registry.is_idle());
        }

        #[tokio::test]
        async fn test_cancel_all() {
            let (clock, registry, teardown) = setup();
            for key in ["a.com", "b.com", "combined"] {
                registry
                    .start_timer(key, in_ms(&clock, 60_000), false, teardown.clone())
                    .await
                    .unwrap();
            }
            assert_eq!(registry.keys(), vec!["a.com", "b.com", "combined"]);

            assert_eq!(registry.cancel_all().await.unwrap(), 3);
            assert!(registry.is_idle());
            assert_eq!(teardown.calls().len(), 3);
        }
    }

    // ------------------------------------------------------------------------
    // Expiry Tests
    // ------------------------------------------------------------------------

    mod expiry_tests {
        use super::*;

        #[tokio::test]
        async fn test_timer_self_expires() {
            let (clock, registry, teardown) = setup();
            registry
                .start_timer("combined", in_ms(&clock, 50), false, teardown.clone())
                .await
                .unwrap();

            tokio::time::timeout(Duration::from_secs(5), registry.wait_idle())
                .await
                .unwrap();
            assert!(registry.is_idle());
            assert_eq!(teardown.calls(), vec![("combined".to_string(), "expired")]);
        }

        #[tokio::test]
        async fn test_past_expiry_fires_on_first_tick() {
            let (clock, registry, teardown) = setup();
            registry
                .start_timer("a.com", in_ms(&clock, -1_000), false, teardown.clone())
                .await
                .unwrap();
            registry.wait_idle().await;
            assert_eq!(teardown.calls(), vec![("a.com".to_string(), "expired")]);
        }

        #[tokio::test]
        async fn test_expiry_reports_event() {
            let clock = Arc::new(FixedClock::at("2024-05-06 10:00:00 +0200"));
            let (tx, mut rx) = mpsc::unbounded_channel();
            let registry = BlockRegistry::with_events(clock.clone(), POLL, tx);
            let teardown = Arc::new(MockTeardown::default());

            registry
                .start_timer("combined", in_ms(&clock, 20), false, teardown)
                .await
                .unwrap();
            registry.wait_idle().await;

            assert!(matches!(rx.recv().await, Some(TimerEvent::Started { .. })));
            assert_eq!(
                rx.recv().await,
                Some(TimerEvent::Expired {
                    key: "combined".to_string()
                })
            );
        }

        #[tokio::test]
        async fn test_expiry_teardown_failure_reports_event() {
            let clock = Arc::new(FixedClock::at("2024-05-06 10:00:00 +0200"));
            let (tx, mut rx) = mpsc::unbounded_channel();
            let registry = BlockRegistry::with_events(clock.clone(), POLL, tx);
            let teardown = Arc::new(MockTeardown::default());
            teardown.fail.store(true, Ordering::SeqCst);

            registry
                .start_timer("combined", in_ms(&clock, 0), false, teardown)
                .await
                .unwrap();
            registry.wait_idle().await;

            let _started = rx.recv().await;
            assert!(matches!(
                rx.recv().await,
                Some(TimerEvent::TeardownFailed { .. })
            ));
        }
    }

    // ------------------------------------------------------------------------
    // Replacement Tests
    // ------------------------------------------------------------------------

    mod replacement_tests {
        use super::*;

        #[tokio::test]
        async fn test_restart_keeps_one_timer_per_key() {
            let (clock, registry, teardown) = setup();
            registry
                .start_timer("combined", in_ms(&clock, 60_000), false, teardown.clone())
                .await
                .unwrap();
            registry
                .start_timer("combined", in_ms(&clock, 30), false, teardown.clone())
                .await
                .unwrap();
            assert_eq!(registry.count(), 1);
            assert_eq!(registry.expiry_of("combined"), Some(in_ms(&clock, 30)));

            registry.wait_idle().await;
            assert_eq!(teardown.calls(), vec![("combined".to_string(), "expired")]);
        }

        #[tokio::test]
        async fn test_latest_expiry() {
            let (clock, registry, teardown) = setup();
            registry
                .start_timer("a.com", in_ms(&clock, 60_000), false, teardown.clone())
                .await
                .unwrap();
            registry
                .start_timer("b.com", in_ms(&clock, 120_000), false, teardown.clone())
                .await
                .unwrap();
            assert_eq!(registry.latest_expiry(), Some(in_ms(&clock, 120_000)));
            registry.cancel_all().await.unwrap();
            assert_eq!(registry.latest_expiry(), None);
        }

        #[tokio::test]
        async fn test_drop_stops_timers_without_teardown() {
            let (clock, registry, teardown) = setup();
            registry
                .start_timer("combined", in_ms(&clock, 30), false, teardown.clone())
                .await
                .unwrap();
            drop(registry);

            tokio::time::sleep(Duration::from_millis(100)).await;
            assert!(teardown.calls().is_empty());
        }
    }

    // ------------------------------------------------------------------------
    // Wait group Tests
    // ------------------------------------------------------------------------

    mod wait_group_tests {
        use super::*;

        #[tokio::test]
        async fn test_background_group_drains_on_expiry() {
            let (clock, registry, teardown) = setup();
            registry
                .start_timer("combined", in_ms(&clock, 20), true, teardown)
                .await
                .unwrap();
            assert_eq!(registry.background_pending(), 1);
            assert_eq!(registry.background_count(), 1);

            tokio::time::timeout(Duration::from_secs(5), registry.wait_background_drained())
                .await
                .unwrap();
            assert_eq!(registry.background_pending(), 0);
        }

        #[tokio::test]
        async fn test_background_group_drains_on_cancel() {
            let (clock, registry, teardown) = setup();
            registry
                .start_timer("combined", in_ms(&clock, 60_000), true, teardown)
                .await
                .unwrap();
            registry.cancel_timer("combined").await.unwrap();

            tokio::time::timeout(Duration::from_secs(1), registry.wait_background_drained())
                .await
                .unwrap();
            assert_eq!(registry.background_pending(), 0);
        }

        #[tokio::test]
        async fn test_foreground_timer_does_not_join_group() {
            let (clock, registry, teardown) = setup();
            registry
                .start_timer("combined", in_ms(&clock, 60_000), false, teardown)
                .await
                .unwrap();
            assert_eq!(registry.background_pending(), 0);
            registry.cancel_all().await.unwrap();
        }
    }

    // ------------------------------------------------------------------------
    // Race Tests
    // ------------------------------------------------------------------------

    mod race_tests {
        use super::*;

        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn test_cancel_racing_expiry_tears_down_once() {
            const ROUNDS: usize = 50;
            let (clock, registry, teardown) = setup();

            for round in 0..ROUNDS {
                let key = format!("site{round}.com");
                registry
                    .start_timer(&key, in_ms(&clock, 0), false, teardown.clone())
                    .await
                    .unwrap();
                if round % 2 == 0 {
                    tokio::task::yield_now().await;
                }
                registry.cancel_timer(&key).await.unwrap();
            }
            registry.wait_idle().await;

            let calls = teardown.calls();
            assert_eq!(calls.len(), ROUNDS);
            for round in 0..ROUNDS {
                let key = format!("site{round}.com");
                assert_eq!(calls.iter().filter(|(k, _)| *k == key).count(), 1);
            }
        }

        #[tokio::test]
        async fn test_concurrent_starts_leave_one_live_task() {
            let (clock, registry, teardown) = setup();
            registry
                .start_timer("combined", in_ms(&clock, 60_000), true, teardown.clone())
                .await
                .unwrap();

            let (first, second) = tokio::join!(
                registry.start_timer("combined", in_ms(&clock, 60_000), true, teardown.clone()),
                registry.start_timer("combined", in_ms(&clock, 90_000), true, teardown.clone()),
            );
            first.unwrap();
            second.unwrap();
            assert_eq!(registry.count(), 1);
            assert_eq!(registry.background_pending(), 1);

            assert!(registry.cancel_timer("combined").await.unwrap());
            tokio::time::timeout(Duration::from_millis(500), registry.wait_background_drained())
                .await
                .expect("background group should drain");
            assert_eq!(registry.background_pending(), 0);
            assert_eq!(teardown.calls(), vec![("combined".to_string(), "cancelled")]);
        }

        /// Teardown that blocks its thread for a while before recording.
        #[derive(Debug, Default)]
        struct SlowTeardown {
            finished: AtomicBool,
        }

        impl BlockTeardown for SlowTeardown {
            fn on_expired(&self, _key: &str, _remaining: &[String]) -> Result<(), BlockError> {
                std::thread::sleep(std::time::Duration::from_millis(200));
                self.finished.store(true, Ordering::SeqCst);
                Ok(())
            }

            fn on_cancelled(&self, _key: &str, _remaining: &[String]) -> Result<(), BlockError> {
                Ok(())
            }
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn test_cancel_waits_for_running_expiry() {
            let (clock, registry, _) = setup();
            let teardown = Arc::new(SlowTeardown::default());
            registry
                .start_timer("combined", in_ms(&clock, 0), false, teardown.clone())
                .await
                .unwrap();

            // The entry disappears once the expiring task has claimed it.
            while registry.contains("combined") {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            assert!(!registry.cancel_timer("combined").await.unwrap());
            assert!(teardown.finished.load(Ordering::SeqCst));
        }
    }
}
