//! Per-device online/offline bookkeeping.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

/// Default time an offline device is left alone before it is retried.
pub const DEFAULT_RETRY_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
struct State {
    initialized: bool,
    online: bool,
    requests: u64,
    errors: u64,
    last_failure: Option<Instant>,
}

/// Point-in-time copy of a device's runtime state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RuntimeSnapshot {
    pub initialized: bool,
    pub online: bool,
    pub requests: u64,
    pub errors: u64,
}

/// Online state, counters and retry eligibility of one device.
///
/// A device starts uninitialized and offline. Going offline records the
/// failure time; an offline device becomes queryable again once
/// `retry_timeout` has elapsed.
#[derive(Debug)]
pub struct RuntimeInfo {
    retry_timeout: Duration,
    state: Mutex<State>,
}

impl RuntimeInfo {
    /// Creates state for a device that has not been initialized.
    #[must_use]
    pub fn new(retry_timeout: Duration) -> Self {
        Self {
            retry_timeout,
            state: Mutex::new(State::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks the device as initialized.
    pub fn set_initialized(&self) {
        self.lock().initialized = true;
    }

    /// Sets the online state. Going offline records the failure time.
    pub fn set_online(&self, online: bool) {
        let mut state = self.lock();
        state.online = online;
        if !online {
            state.last_failure = Some(Instant::now());
        }
    }

    /// Counts one query attempt.
    pub fn inc_requests(&self) {
        self.lock().requests += 1;
    }

    /// Counts one failed query attempt.
    pub fn inc_errors(&self) {
        self.lock().errors += 1;
    }

    /// Returns `(queryable, reactivating)`.
    ///
    /// An online device is always queryable. An offline device is queryable
    /// once the retry timeout has elapsed since its last failure, and such
    /// a query is a reactivation attempt.
    #[must_use]
    pub fn is_queryable(&self) -> (bool, bool) {
        let state = self.lock();
        let retry_elapsed = state
            .last_failure
            .is_none_or(|at| at.elapsed() >= self.retry_timeout);
        (state.online || retry_elapsed, !state.online && retry_elapsed)
    }

    /// Copies the current state.
    #[must_use]
    pub fn snapshot(&self) -> RuntimeSnapshot {
        let state = self.lock();
        RuntimeSnapshot {
            initialized: state.initialized,
            online: state.online,
            requests: state.requests,
            errors: state.errors,
        }
    }
}

impl Default for RuntimeInfo {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let info = RuntimeInfo::default();
        info.inc_requests();
        info.inc_requests();
        info.inc_errors();
        info.set_initialized();

        let snapshot = info.snapshot();
        assert!(snapshot.initialized);
        assert!(!snapshot.online);
        assert_eq!(snapshot.requests, 2);
        assert_eq!(snapshot.errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_until_retry_timeout() {
        let info = RuntimeInfo::new(Duration::from_secs(1));
        info.set_online(true);
        assert_eq!(info.is_queryable(), (true, false));

        info.set_online(false);
        assert_eq!(info.is_queryable(), (false, false));

        tokio::time::advance(Duration::from_millis(999)).await;
        assert_eq!(info.is_queryable(), (false, false));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(info.is_queryable(), (true, true));

        info.set_online(true);
        assert_eq!(info.is_queryable(), (true, false));
    }

    #[test]
    fn test_snapshot_json() {
        let info = RuntimeInfo::default();
        info.set_online(true);
        let json = serde_json::to_value(info.snapshot()).unwrap();
        assert_eq!(json["Online"], true);
        assert_eq!(json["Requests"], 0);
    }
}
