use super::TargetGenerator;
use crate::telemetry::MetricsRegistry;
use crate::util::RetryPolicy;
use log::{info, warn};
use parking_lot::{Condvar, Mutex};
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct SignalState {
    requested: u64,
    completed: u64,
    consecutive_failures: u64,
    last_error: Option<String>,
    shutdown: bool,
}

#[derive(Debug, Default)]
struct SignalShared {
    state: Mutex<SignalState>,
    condvar: Condvar,
}

/// "Registry changed" notification consumed by the refresh worker.
///
/// Notifications coalesce: any number of `notify` calls made before the worker
/// wakes are served by one refresh, and a notification that lands while a
/// refresh is running schedules another one.
#[derive(Debug, Clone, Default)]
pub struct RefreshSignal {
    shared: Arc<SignalShared>,
}

impl RefreshSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a refresh and returns the generation that will satisfy it.
    pub fn notify(&self) -> u64 {
        let mut state = self.shared.state.lock();
        state.requested = state.requested.saturating_add(1);
        self.shared.condvar.notify_all();
        state.requested
    }

    pub fn requested(&self) -> u64 {
        self.shared.state.lock().requested
    }

    pub fn completed(&self) -> u64 {
        self.shared.state.lock().completed
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared.state.lock().last_error.clone()
    }

    pub fn consecutive_failures(&self) -> u64 {
        self.shared.state.lock().consecutive_failures
    }

    /// Blocks until every requested refresh has been published, or `timeout`
    /// elapses. Returns whether the worker caught up.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        while state.completed < state.requested && !state.shutdown {
            if self
                .shared
                .condvar
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                break;
            }
        }
        state.completed >= state.requested
    }

    fn wait_for_work(&self) -> Option<u64> {
        let mut state = self.shared.state.lock();
        loop {
            if state.shutdown {
                return None;
            }
            if state.requested > state.completed {
                return Some(state.requested);
            }
            self.shared.condvar.wait(&mut state);
        }
    }

    fn mark_completed(&self, generation: u64) {
        let mut state = self.shared.state.lock();
        state.completed = state.completed.max(generation);
        state.consecutive_failures = 0;
        state.last_error = None;
        self.shared.condvar.notify_all();
    }

    fn mark_failed(&self, error: String) {
        let mut state = self.shared.state.lock();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.last_error = Some(error);
    }

    /// Sleeps for `delay` unless shutdown is requested. Returns `true` on shutdown.
    fn wait_backoff(&self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        let mut state = self.shared.state.lock();
        while !state.shutdown {
            if self
                .shared
                .condvar
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                break;
            }
        }
        state.shutdown
    }

    fn shutdown(&self) {
        let mut state = self.shared.state.lock();
        state.shutdown = true;
        self.shared.condvar.notify_all();
    }
}

pub struct RefreshWorker;

impl RefreshWorker {
    /// Spawns the background refresh loop. Failed refreshes are logged and
    /// retried with `retry` backoff until they succeed or the handle shuts down;
    /// they never reach the caller that triggered them.
    pub fn spawn(
        generator: Arc<TargetGenerator>,
        signal: RefreshSignal,
        retry: RetryPolicy,
        metrics: MetricsRegistry,
    ) -> io::Result<RefreshHandle> {
        let worker_signal = signal.clone();
        let join = thread::Builder::new()
            .name("bloomnet-refresh".into())
            .spawn(move || run_loop(&generator, &worker_signal, &retry, &metrics))?;
        Ok(RefreshHandle {
            signal,
            join: Some(join),
        })
    }
}

fn run_loop(
    generator: &TargetGenerator,
    signal: &RefreshSignal,
    retry: &RetryPolicy,
    metrics: &MetricsRegistry,
) {
    let mut backoff = retry.handle();
    while let Some(generation) = signal.wait_for_work() {
        match generator.refresh() {
            Ok(report) => {
                if backoff.failures() > 0 {
                    info!(
                        "event=targets_refresh_recovered generation={} failures={}",
                        generation,
                        backoff.failures()
                    );
                }
                backoff.reset();
                signal.mark_completed(generation);
                metrics.set_gauge("targets.published_revision", report.revision);
            }
            Err(err) => {
                metrics.inc_counter("targets.refresh_failures", 1);
                signal.mark_failed(err.to_string());
                let delay = backoff
                    .next_delay()
                    .unwrap_or_else(|| retry.delay_for_retry(backoff.failures()));
                warn!(
                    "event=targets_refresh_failed generation={} attempt={} retry_in_ms={} error={}",
                    generation,
                    backoff.failures(),
                    delay.as_millis(),
                    err
                );
                if signal.wait_backoff(delay) {
                    break;
                }
            }
        }
    }
}

pub struct RefreshHandle {
    signal: RefreshSignal,
    join: Option<thread::JoinHandle<()>>,
}

impl RefreshHandle {
    pub fn signal(&self) -> &RefreshSignal {
        &self.signal
    }

    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.signal.wait_idle(timeout)
    }

    pub fn shutdown(&mut self) {
        self.signal.shutdown();
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                warn!("event=targets_refresh_worker_panic");
            }
        }
    }
}

impl Drop for RefreshHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notifications_coalesce_into_latest_generation() {
        let signal = RefreshSignal::new();
        signal.notify();
        signal.notify();
        assert_eq!(signal.wait_for_work(), Some(2));
        signal.mark_completed(2);
        assert!(signal.wait_idle(Duration::from_millis(1)));
    }

    #[test]
    fn wait_idle_times_out_without_worker() {
        let signal = RefreshSignal::new();
        signal.notify();
        assert!(!signal.wait_idle(Duration::from_millis(5)));
    }

    #[test]
    fn shutdown_releases_waiters() {
        let signal = RefreshSignal::new();
        signal.shutdown();
        assert_eq!(signal.wait_for_work(), None);
        assert!(signal.wait_backoff(Duration::from_secs(60)));
    }
}
