//! Reconnection engine with capped exponential backoff
//!
//! At most one retry is pending at any time. The pending delay runs on a
//! Tokio task; cancellation is cooperative through a [`CancellationToken`]
//! and the task re-checks its ticket under the engine lock before firing, so
//! once [`ReconnectionManager::cancel`] returns the cancelled retry can no
//! longer invoke `on_retry`.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{BridgeError, Result};

/// Invoked once per fired retry
pub type RetryCallback = Arc<dyn Fn() + Send + Sync>;
/// Invoked with `(reconnecting, retry_count)`
pub type ReconnectStateCallback = Arc<dyn Fn(bool, u32) + Send + Sync>;

/// Backoff parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Retry budget (0 disables reconnection)
    pub max_retries: u32,
    /// Delay before the first retry (ms)
    pub initial_delay_ms: u64,
    /// Upper bound for any delay (ms)
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
        }
    }
}

impl ReconnectConfig {
    pub fn validate(&self) -> Result<()> {
        if self.initial_delay_ms == 0 {
            return Err(BridgeError::InvalidArgument(
                "initial_delay_ms must be greater than 0".to_string(),
            ));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(BridgeError::InvalidArgument(format!(
                "max_delay_ms ({}) must be >= initial_delay_ms ({})",
                self.max_delay_ms, self.initial_delay_ms
            )));
        }
        Ok(())
    }

    /// Delay before retry number `attempt` (1-based)
    ///
    /// `min(initial_delay_ms * 2^(attempt - 1), max_delay_ms)`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63);
        let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        let ms = self
            .initial_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

struct PendingRetry {
    ticket: u64,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct ReconnectState {
    retry_count: u32,
    next_ticket: u64,
    pending: Option<PendingRetry>,
}

impl ReconnectState {
    fn cancel_pending(&mut self) -> bool {
        match self.pending.take() {
            Some(pending) => {
                pending.token.cancel();
                // The task is only sleeping at this point; firing tasks have
                // already removed themselves from `pending`.
                pending.handle.abort();
                true
            }
            None => false,
        }
    }
}

/// Reconnection engine
pub struct ReconnectionManager {
    config: ReconnectConfig,
    on_retry: RetryCallback,
    on_state: Option<ReconnectStateCallback>,
    state: Arc<Mutex<ReconnectState>>,
    runtime: Handle,
}

impl ReconnectionManager {
    /// Create a new engine bound to the current Tokio runtime
    ///
    /// Fails when called outside a runtime. Once created, the engine may be
    /// driven from any thread.
    pub fn new(
        config: ReconnectConfig,
        on_retry: RetryCallback,
        on_state: Option<ReconnectStateCallback>,
    ) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| {
            BridgeError::Internal(format!("Reconnection engine needs a Tokio runtime: {}", e))
        })?;
        Self::with_runtime(config, on_retry, on_state, runtime)
    }

    /// Create a new engine whose retry timers run on `runtime`
    pub fn with_runtime(
        config: ReconnectConfig,
        on_retry: RetryCallback,
        on_state: Option<ReconnectStateCallback>,
        runtime: Handle,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            on_retry,
            on_state,
            state: Arc::new(Mutex::new(ReconnectState::default())),
            runtime,
        })
    }

    pub fn config(&self) -> &ReconnectConfig {
        &self.config
    }

    /// Schedule the next retry
    ///
    /// Returns `false` once the retry budget is exhausted.
    pub fn schedule_reconnect(&self) -> bool {
        let attempt = {
            let mut state = self.state.lock();
            if state.retry_count >= self.config.max_retries {
                warn!(
                    "Reconnect budget exhausted ({} retries)",
                    self.config.max_retries
                );
                return false;
            }

            state.cancel_pending();
            state.retry_count += 1;
            let attempt = state.retry_count;
            let delay = self.config.delay_for(attempt);

            state.next_ticket += 1;
            let ticket = state.next_ticket;
            let token = CancellationToken::new();
            let handle = self.runtime.spawn(run_pending_retry(
                self.state.clone(),
                self.on_retry.clone(),
                ticket,
                token.clone(),
                delay,
            ));
            state.pending = Some(PendingRetry {
                ticket,
                token,
                handle,
            });

            info!(
                "Reconnect attempt {}/{} scheduled in {:?}",
                attempt, self.config.max_retries, delay
            );
            attempt
        };

        if let Some(ref on_state) = self.on_state {
            on_state(true, attempt);
        }
        true
    }

    /// Reset the retry counter after a successful connection
    pub fn on_connection_success(&self) {
        self.state.lock().retry_count = 0;
        debug!("Connection established, reconnect counter reset");

        if let Some(ref on_state) = self.on_state {
            on_state(false, 0);
        }
    }

    /// Cancel the pending retry, keeping the retry counter
    pub fn cancel(&self) {
        if self.state.lock().cancel_pending() {
            debug!("Pending reconnect cancelled");
        }
    }

    /// Cancel the pending retry and reset the retry counter
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.cancel_pending();
        state.retry_count = 0;
    }

    pub fn retry_count(&self) -> u32 {
        self.state.lock().retry_count
    }

    pub fn is_pending(&self) -> bool {
        self.state.lock().pending.is_some()
    }
}

impl Drop for ReconnectionManager {
    fn drop(&mut self) {
        self.state.lock().cancel_pending();
    }
}

async fn run_pending_retry(
    state: Arc<Mutex<ReconnectState>>,
    on_retry: RetryCallback,
    ticket: u64,
    token: CancellationToken,
    delay: Duration,
) {
    tokio::select! {
        _ = token.cancelled() => return,
        _ = tokio::time::sleep(delay) => {}
    }

    {
        let mut state = state.lock();
        if token.is_cancelled() {
            return;
        }
        match state.pending {
            Some(ref pending) if pending.ticket == ticket => {
                state.pending = None;
            }
            _ => return,
        }
    }

    debug!("Reconnect retry {} firing", ticket);
    on_retry();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;
    use tokio_test::{assert_err, assert_ok};

    fn config(max_retries: u32, initial: u64, max: u64) -> ReconnectConfig {
        ReconnectConfig {
            max_retries,
            initial_delay_ms: initial,
            max_delay_ms: max,
        }
    }

    fn counting_manager(config: ReconnectConfig) -> (ReconnectionManager, Arc<AtomicU32>) {
        let fired = Arc::new(AtomicU32::new(0));
        let fired_clone = fired.clone();
        let manager = ReconnectionManager::new(
            config,
            Arc::new(move || {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            }),
            None,
        )
        .unwrap();
        (manager, fired)
    }

    #[test]
    fn test_delay_law() {
        let config = config(10, 50, 1000);
        let expected = [50, 100, 200, 400, 800, 1000, 1000, 1000, 1000, 1000];
        for (i, ms) in expected.iter().enumerate() {
            assert_eq!(config.delay_for(i as u32 + 1), Duration::from_millis(*ms));
        }
        for n in 1..40 {
            assert!(config.delay_for(n) <= config.delay_for(n + 1));
        }
        // No overflow for huge attempt numbers
        assert_eq!(config.delay_for(u32::MAX), Duration::from_millis(1000));
    }

    #[test]
    fn test_config_validation() {
        assert_err!(config(3, 0, 100).validate());
        assert_err!(config(3, 200, 100).validate());
        assert_ok!(config(0, 100, 100).validate());
    }

    #[test]
    fn test_new_requires_runtime() {
        let err = ReconnectionManager::new(config(3, 10, 100), Arc::new(|| {}), None)
            .err()
            .unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::Internal);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        assert_ok!(ReconnectionManager::with_runtime(
            config(3, 10, 100),
            Arc::new(|| {}),
            None,
            runtime.handle().clone(),
        ));
    }

    #[tokio::test]
    async fn test_schedule_from_plain_thread() {
        let (manager, fired) = counting_manager(config(3, 10, 100));
        let manager = Arc::new(manager);

        let worker = manager.clone();
        let scheduled = std::thread::spawn(move || worker.schedule_reconnect())
            .join()
            .unwrap();
        assert!(scheduled);
        assert_eq!(manager.retry_count(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        let worker = manager.clone();
        std::thread::spawn(move || {
            assert!(worker.schedule_reconnect());
            worker.cancel();
            worker.reset();
        })
        .join()
        .unwrap();
        assert_eq!(manager.retry_count(), 0);
        assert!(!manager.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhaustion() {
        let (manager, _fired) = counting_manager(config(3, 10, 100));

        let results: Vec<bool> = (0..5).map(|_| manager.schedule_reconnect()).collect();
        assert_eq!(results, vec![true, true, true, false, false]);
        assert_eq!(manager.retry_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_timing() {
        let times = Arc::new(Mutex::new(Vec::new()));
        let times_clone = times.clone();
        let manager = Arc::new(
            ReconnectionManager::new(
                config(10, 50, 1000),
                Arc::new(move || times_clone.lock().push(Instant::now())),
                None,
            )
            .unwrap(),
        );

        let mut expected = Vec::new();
        for attempt in 1..=7u32 {
            let start = Instant::now();
            assert!(manager.schedule_reconnect());
            tokio::time::sleep(manager.config().delay_for(attempt) + Duration::from_millis(1))
                .await;
            let fired_at = *times.lock().last().unwrap();
            expected.push(manager.config().delay_for(attempt));
            assert_eq!(fired_at - start, manager.config().delay_for(attempt));
        }

        assert_eq!(times.lock().len(), 7);
        assert_eq!(
            expected,
            [50, 100, 200, 400, 800, 1000, 1000]
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect::<Vec<_>>()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_replaces_pending() {
        let (manager, fired) = counting_manager(config(5, 100, 1000));

        assert!(manager.schedule_reconnect());
        assert!(manager.schedule_reconnect());
        tokio::time::sleep(Duration::from_millis(500)).await;

        // Only the second schedule fires
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!manager.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_suppresses_retry_and_keeps_count() {
        let (manager, fired) = counting_manager(config(5, 100, 1000));

        assert!(manager.schedule_reconnect());
        manager.cancel();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(manager.retry_count(), 1);
        assert!(!manager.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset() {
        let (manager, fired) = counting_manager(config(2, 100, 1000));

        assert!(manager.schedule_reconnect());
        assert!(manager.schedule_reconnect());
        assert!(!manager.schedule_reconnect());

        manager.reset();
        assert_eq!(manager.retry_count(), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        // Budget is available again
        assert!(manager.schedule_reconnect());
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_notifications() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let events_clone = events.clone();
        let manager = ReconnectionManager::new(
            config(3, 10, 100),
            Arc::new(|| {}),
            Some(Arc::new(move |active, count| {
                events_clone.lock().push((active, count))
            })),
        )
        .unwrap();

        manager.schedule_reconnect();
        manager.schedule_reconnect();
        manager.on_connection_success();

        assert_eq!(*events.lock(), vec![(true, 1), (true, 2), (false, 0)]);
        assert_eq!(manager.retry_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels_pending() {
        let (manager, fired) = counting_manager(config(5, 100, 1000));
        assert!(manager.schedule_reconnect());
        drop(manager);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_may_reschedule_from_callback() {
        let slot: Arc<Mutex<Option<Arc<ReconnectionManager>>>> = Arc::new(Mutex::new(None));
        let fired = Arc::new(AtomicU32::new(0));

        let slot_clone = slot.clone();
        let fired_clone = fired.clone();
        let manager = Arc::new(
            ReconnectionManager::new(
                config(3, 10, 100),
                Arc::new(move || {
                    fired_clone.fetch_add(1, Ordering::SeqCst);
                    let manager = slot_clone.lock().clone();
                    if let Some(manager) = manager {
                        manager.schedule_reconnect();
                    }
                }),
                None,
            )
            .unwrap(),
        );
        *slot.lock() = Some(manager.clone());

        assert!(manager.schedule_reconnect());
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(fired.load(Ordering::SeqCst), 3);
        assert_eq!(manager.retry_count(), 3);
        slot.lock().take();
    }
}
