use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};

use crate::config::SettingsStore;

/// Wake-up flag shared by the admission path (sets it) and the broadcast
/// server's update loop (clears it).
#[derive(Debug, Default)]
pub struct RefreshSignal {
    flag: AtomicBool,
    notify: Notify,
}

impl RefreshSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Waits for a trigger or until `timeout` elapses. Returns whether the
    /// flag was set, clearing it either way.
    pub async fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.flag.swap(false, Ordering::AcqRel) {
                return true;
            }
            // a permit left over from an already consumed trigger wakes us
            // with the flag clear; keep waiting until the deadline
            if timeout_at(deadline, self.notify.notified()).await.is_err() {
                return self.flag.swap(false, Ordering::AcqRel);
            }
        }
    }
}

/// State owned by one running instance and handed to each component.
#[derive(Debug, Clone)]
pub struct Context {
    settings: Arc<SettingsStore>,
    refresh: Arc<RefreshSignal>,
}

impl Context {
    pub fn new(settings: SettingsStore) -> Self {
        Self {
            settings: Arc::new(settings),
            refresh: Arc::new(RefreshSignal::new()),
        }
    }

    pub fn settings(&self) -> &Arc<SettingsStore> {
        &self.settings
    }

    pub fn refresh(&self) -> &Arc<RefreshSignal> {
        &self.refresh
    }

    pub fn trigger_refresh(&self) {
        self.refresh.trigger();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_without_trigger() {
        let signal = RefreshSignal::new();
        let started = Instant::now();
        assert!(!signal.wait(Duration::from_secs(60)).await);
        assert!(started.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn triggers_collapse_and_clear() {
        let signal = Arc::new(RefreshSignal::new());
        signal.trigger();
        signal.trigger();
        assert!(signal.is_set());
        assert!(signal.wait(Duration::from_secs(60)).await);
        assert!(!signal.is_set());
        // the second trigger left a permit behind but no pending refresh
        assert!(!signal.wait(Duration::from_secs(5)).await);

        let waiter = {
            let signal = Arc::clone(&signal);
            tokio::spawn(async move { signal.wait(Duration::from_secs(60)).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        signal.trigger();
        assert!(waiter.await.unwrap());
    }
}
