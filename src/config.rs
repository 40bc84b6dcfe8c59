use std::{sync::Arc, time::Duration};

use crate::EventHistory;

/// Configuration for [`EventHub`](crate::EventHub) and [`EventBus`](crate::EventBus).
// Not implementing `Copy` as it holds an optional event history handle.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Execution time budget of a single listener invocation. A listener running longer is
    /// reported and detached; delivery to other listeners is not delayed.
    ///
    /// Defaults to [`HubConfig::DEFAULT_LISTENER_TIMEOUT`].
    pub listener_timeout: Duration,
    /// Maximum number of worker threads running listeners concurrently.
    ///
    /// Defaults to [`HubConfig::DEFAULT_MAX_LISTENER_THREADS`].
    pub max_listener_threads: usize,
    /// How long an idle worker thread is kept around before exiting.
    ///
    /// Defaults to [`HubConfig::DEFAULT_WORKER_KEEP_ALIVE`].
    pub worker_keep_alive: Duration,
    /// Event history used to record masked events and evaluate historical rule conditions.
    pub event_history: Option<Arc<EventHistory>>,
    /// Whether dispatched events are evaluated against the active rule set.
    pub rules_engine_enabled: bool,
}

impl HubConfig {
    /// Default value for [`HubConfig::listener_timeout`].
    pub const DEFAULT_LISTENER_TIMEOUT: Duration = Duration::from_millis(1000);
    /// Default value for [`HubConfig::max_listener_threads`].
    pub const DEFAULT_MAX_LISTENER_THREADS: usize = 32;
    /// Default value for [`HubConfig::worker_keep_alive`].
    pub const DEFAULT_WORKER_KEEP_ALIVE: Duration = Duration::from_secs(60);

    /// Create a new `HubConfig` using default configuration.
    pub fn new() -> HubConfig {
        HubConfig::default()
    }

    /// Update the listener time budget with `timeout`.
    pub fn with_listener_timeout(mut self, timeout: Duration) -> HubConfig {
        self.listener_timeout = timeout;
        self
    }

    /// Update the maximum number of listener threads with `threads`.
    pub fn with_max_listener_threads(mut self, threads: usize) -> HubConfig {
        self.max_listener_threads = threads;
        self
    }

    /// Update how long idle listener threads are kept with `keep_alive`.
    pub fn with_worker_keep_alive(mut self, keep_alive: Duration) -> HubConfig {
        self.worker_keep_alive = keep_alive;
        self
    }

    /// Enable or disable rule evaluation.
    pub fn with_rules_engine_enabled(mut self, enabled: bool) -> HubConfig {
        self.rules_engine_enabled = enabled;
        self
    }

    /// Attach an event history.
    ///
    /// ```
    /// # use std::sync::Arc;
    /// # use eventhub::{EventHistory, HubConfig};
    /// let history = EventHistory::in_memory().unwrap();
    /// let config = HubConfig::new().with_event_history(Arc::new(history));
    /// ```
    pub fn with_event_history(mut self, history: Arc<EventHistory>) -> HubConfig {
        self.event_history = Some(history);
        self
    }
}

impl Default for HubConfig {
    fn default() -> HubConfig {
        HubConfig {
            listener_timeout: HubConfig::DEFAULT_LISTENER_TIMEOUT,
            max_listener_threads: HubConfig::DEFAULT_MAX_LISTENER_THREADS,
            worker_keep_alive: HubConfig::DEFAULT_WORKER_KEEP_ALIVE,
            event_history: None,
            rules_engine_enabled: true,
        }
    }
}
