//! In-order fan-out of events to registered listeners.
//!
//! Every listener invocation runs as its own blocking task on the bus's tokio runtime, so a slow
//! listener cannot stall delivery to the others. [`EventBus::dispatch`] waits (bounded by the
//! listener timeout) for every task of an event before returning, so dispatch is settled per event
//! from the caller's point of view.
use std::{
    collections::HashMap,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, RwLock,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use tokio::{
    runtime::{Handle, Runtime},
    sync::oneshot,
    task::JoinHandle,
};

use crate::{
    listener::{ListenerId, ListenerKey, OneTimeHandle},
    Error, Event, HubConfig, Listener, Result,
};

struct Registration {
    id: ListenerId,
    key: ListenerKey,
    listener: Arc<dyn Listener>,
    once: Option<OneTimeHandle>,
    unregistered: AtomicBool,
}

#[derive(Default)]
struct Registry {
    /// Listeners keyed by their exact mask, including pairing id.
    exact: HashMap<ListenerKey, Vec<Arc<Registration>>>,
    /// Listeners with a wildcard type or source, in registration order.
    wildcard: Vec<Arc<Registration>>,
    index: HashMap<ListenerId, ListenerKey>,
}

impl Registry {
    fn insert(&mut self, registration: Arc<Registration>) {
        self.index
            .insert(registration.id, registration.key.clone());
        if registration.key.is_wildcard() {
            self.wildcard.push(registration);
        } else {
            self.exact
                .entry(registration.key.clone())
                .or_default()
                .push(registration);
        }
    }

    fn remove(&mut self, id: ListenerId) -> Option<Arc<Registration>> {
        let key = self.index.remove(&id)?;
        let bucket = if key.is_wildcard() {
            &mut self.wildcard
        } else {
            self.exact.get_mut(&key)?
        };
        let position = bucket.iter().position(|r| r.id == id)?;
        let registration = bucket.remove(position);
        if bucket.is_empty() && !key.is_wildcard() {
            self.exact.remove(&key);
        }
        Some(registration)
    }

    /// Listeners for `event`: pairing id listeners, then `(type, source)`, then wildcards.
    fn targets(&self, event: &Event) -> Vec<Arc<Registration>> {
        let key = ListenerKey::of(event);
        let paired = event
            .pair_id()
            .and_then(|pair_id| self.exact.get(&key.clone().with_pair_id(pair_id)));
        paired
            .into_iter()
            .flatten()
            .chain(self.exact.get(&key).into_iter().flatten())
            .chain(self.wildcard.iter().filter(|r| r.key.matches(event)))
            .cloned()
            .collect()
    }
}

/// Outcome of dispatching one event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Number of listener invocations that completed within the time budget.
    pub delivered: usize,
    /// Listeners that exceeded the time budget. They keep running detached.
    pub timed_out: Vec<ListenerId>,
    /// Listeners that panicked or could not be scheduled.
    pub failed: Vec<ListenerId>,
}

/// How a single listener invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListenerOutcome {
    Completed,
    TimedOut,
    Panicked,
    /// The runtime went away before a listener thread picked the invocation up.
    NotStarted,
}

/// Dispatcher holding listeners keyed by `(type, source, pairing id)` masks.
///
/// ```
/// # use std::sync::{Arc, mpsc};
/// # use eventhub::{Event, EventBuilder, EventBus, ListenerKey};
/// let bus = EventBus::new().unwrap();
/// let (sender, receiver) = mpsc::channel();
/// let sender = std::sync::Mutex::new(sender);
/// bus.add_listener(ListenerKey::new("t", "s"), move |event: &Event| {
///     sender.lock().unwrap().send(event.name().to_owned()).unwrap();
/// });
/// let report = bus.dispatch(&Arc::new(EventBuilder::new("hello", "t", "s").build()));
/// assert_eq!(report.delivered, 1);
/// assert_eq!(receiver.recv().unwrap(), "hello");
/// ```
pub struct EventBus {
    registry: RwLock<Registry>,
    /// Runs listeners on its blocking pool and timers on its worker. `None` once shut down.
    runtime: Mutex<Option<Runtime>>,
    listener_timeout: Duration,
    next_id: AtomicU64,
    last_timestamp: Mutex<Option<DateTime<Utc>>>,
}

impl EventBus {
    /// Create an event bus using default configuration.
    pub fn new() -> Result<EventBus> {
        EventBus::with_config(&HubConfig::default())
    }

    /// Create an event bus with listener threads and time budget taken from `config`.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Io`] if the listener runtime cannot be started.
    pub fn with_config(config: &HubConfig) -> Result<EventBus> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(config.max_listener_threads.max(1))
            .thread_keep_alive(config.worker_keep_alive)
            .thread_name("eventhub-listener")
            .enable_time()
            .build()?;
        Ok(EventBus {
            registry: RwLock::new(Registry::default()),
            runtime: Mutex::new(Some(runtime)),
            listener_timeout: config.listener_timeout,
            next_id: AtomicU64::new(1),
            last_timestamp: Mutex::new(None),
        })
    }

    /// Register `listener` under `key`.
    ///
    /// Returns `None` (and registers nothing) if the key has an empty type, source, or pairing id.
    pub fn add_listener(
        &self,
        key: ListenerKey,
        listener: impl Listener + 'static,
    ) -> Option<ListenerId> {
        self.add_shared_listener(key, Arc::new(listener))
    }

    /// Register an already shared listener under `key`.
    pub fn add_shared_listener(
        &self,
        key: ListenerKey,
        listener: Arc<dyn Listener>,
    ) -> Option<ListenerId> {
        self.register(key, listener, false)
            .map(|registration| registration.id)
    }

    /// Register a listener that receives at most one event and then removes itself.
    pub fn add_one_time_listener(
        &self,
        key: ListenerKey,
        listener: impl Listener + 'static,
    ) -> Option<OneTimeHandle> {
        self.register(key, Arc::new(listener), true)
            .and_then(|registration| registration.once.clone())
    }

    fn register(
        &self,
        key: ListenerKey,
        listener: Arc<dyn Listener>,
        once: bool,
    ) -> Option<Arc<Registration>> {
        if !key.is_valid() {
            log::warn!(target: "eventhub",
                       event_type = key.event_type(),
                       source = key.source();
                       "ignoring listener registration with an empty mask component");
            return None;
        }

        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let registration = Arc::new(Registration {
            id,
            key,
            listener,
            once: once.then(|| OneTimeHandle::new(id)),
            unregistered: AtomicBool::new(false),
        });
        log::trace!(target: "eventhub",
                    listener = id,
                    event_type = registration.key.event_type(),
                    source = registration.key.source();
                    "registered listener");
        self.write_registry().insert(Arc::clone(&registration));
        Some(registration)
    }

    /// Remove a listener and run its unregistration hook. Returns `false` if no listener is
    /// registered under `id`.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let removed = self.write_registry().remove(id);
        match removed {
            Some(registration) => {
                run_unregistration_hook(&registration);
                true
            }
            None => false,
        }
    }

    /// Remove every listener, running each unregistration hook.
    pub fn remove_all_listeners(&self) {
        let registry = std::mem::take(&mut *self.write_registry());
        for registration in registry
            .exact
            .into_values()
            .flatten()
            .chain(registry.wildcard)
        {
            run_unregistration_hook(&registration);
        }
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.read_registry().index.len()
    }

    /// Deliver `event` to every matching listener and wait for them to settle.
    ///
    /// Listeners are scheduled in order: those registered for the event's pairing id, those
    /// registered for its `(type, source)`, then wildcard listeners. Each invocation runs
    /// concurrently and gets its own time budget, counted from the moment a listener thread picks
    /// it up; a listener exceeding it is reported in [`DispatchReport::timed_out`] and left
    /// running.
    ///
    /// Must not be called from within an async task.
    pub fn dispatch(&self, event: &Arc<Event>) -> DispatchReport {
        self.check_timestamp(event);

        let targets = self.read_registry().targets(event);
        let mut report = DispatchReport::default();

        let Some(runtime) = self.runtime_handle() else {
            // Nothing is claimed, so one-time listeners stay armed.
            log::warn!(target: "eventhub",
                       sequence = event.sequence(),
                       listeners = targets.len();
                       "event bus is shut down, not delivering event");
            report.failed = targets.iter().map(|registration| registration.id).collect();
            return report;
        };

        let mut calls = Vec::with_capacity(targets.len());
        for registration in targets {
            if let Some(once) = &registration.once {
                if !once.claim() {
                    continue;
                }
                // Deregister right away so a concurrent dispatch cannot see it.
                self.write_registry().remove(registration.id);
            }
            let call = self.spawn_listener(&runtime, &registration, event);
            calls.push((registration, call));
        }

        let outcomes = runtime.block_on(async move {
            let mut outcomes = Vec::with_capacity(calls.len());
            for (registration, call) in calls {
                let outcome = call.await.unwrap_or(ListenerOutcome::NotStarted);
                outcomes.push((registration, outcome));
            }
            outcomes
        });

        for (registration, outcome) in outcomes {
            let id = registration.id;
            match outcome {
                ListenerOutcome::Completed => report.delivered += 1,
                ListenerOutcome::TimedOut => {
                    log::warn!(target: "eventhub",
                               listener = id,
                               event_type = event.event_type(),
                               source = event.source(),
                               sequence = event.sequence();
                               "listener exceeded time budget of {:?}", self.listener_timeout);
                    report.timed_out.push(id);
                }
                ListenerOutcome::Panicked => {
                    log::warn!(target: "eventhub",
                               listener = id,
                               event_type = event.event_type(),
                               source = event.source();
                               "listener panicked while handling event");
                    report.failed.push(id);
                }
                ListenerOutcome::NotStarted => {
                    log::warn!(target: "eventhub", listener = id; "unable to schedule listener");
                    report.failed.push(id);
                    if let Some(once) = &registration.once {
                        if once.release() {
                            self.write_registry().insert(registration);
                            continue;
                        }
                    }
                }
            }
            if registration.once.is_some() {
                run_unregistration_hook(&registration);
            }
        }

        log::trace!(target: "eventhub",
                    sequence = event.sequence(),
                    event_type = event.event_type(),
                    source = event.source(),
                    delivered = report.delivered;
                    "dispatched event");
        report
    }

    fn spawn_listener(
        &self,
        runtime: &Handle,
        registration: &Arc<Registration>,
        event: &Arc<Event>,
    ) -> JoinHandle<ListenerOutcome> {
        let (started, on_start) = oneshot::channel();
        let call = {
            let registration = Arc::clone(registration);
            let event = Arc::clone(event);
            runtime.spawn_blocking(move || {
                let _ = started.send(());
                if let Some(once) = &registration.once {
                    if !once.begin_delivery() {
                        return;
                    }
                }
                registration.listener.hear(&event);
            })
        };

        let budget = self.listener_timeout;
        runtime.spawn(async move {
            // Dropped unsent when the invocation is discarded before it runs.
            if on_start.await.is_err() {
                return ListenerOutcome::NotStarted;
            }
            match tokio::time::timeout(budget, call).await {
                Ok(Ok(())) => ListenerOutcome::Completed,
                Ok(Err(err)) if err.is_panic() => ListenerOutcome::Panicked,
                Ok(Err(_)) => ListenerOutcome::NotStarted,
                Err(_) => ListenerOutcome::TimedOut,
            }
        })
    }

    /// Run `task` on the bus runtime. Fails with [`Error::HubShutdown`] once the bus is shut down.
    pub(crate) fn spawn<F>(&self, task: F) -> Result<JoinHandle<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let runtime = self.runtime_handle().ok_or(Error::HubShutdown)?;
        Ok(runtime.spawn(task))
    }

    fn runtime_handle(&self) -> Option<Handle> {
        self.runtime
            .lock()
            .expect("thread holding runtime lock should not panic")
            .as_ref()
            .map(|runtime| runtime.handle().clone())
    }

    /// Wall-clock time is advisory. Regressions are logged, never rejected.
    fn check_timestamp(&self, event: &Event) {
        let mut last = self
            .last_timestamp
            .lock()
            .expect("thread holding timestamp lock should not panic");
        if let Some(previous) = *last {
            if event.timestamp() < previous {
                log::warn!(target: "eventhub",
                           sequence = event.sequence(),
                           event_type = event.event_type();
                           "event timestamp {} is older than previous event timestamp {}",
                           event.timestamp(), previous);
            }
        }
        *last = Some(event.timestamp());
    }

    /// Stop the runtime without waiting for running listeners. Listener invocations and timers
    /// that have not started are discarded.
    pub(crate) fn shutdown(&self) {
        let runtime = self
            .runtime
            .lock()
            .expect("thread holding runtime lock should not panic")
            .take();
        if let Some(runtime) = runtime {
            runtime.shutdown_background();
            log::debug!(target: "eventhub", "event bus runtime shut down");
        }
    }

    fn read_registry(&self) -> std::sync::RwLockReadGuard<'_, Registry> {
        self.registry
            .read()
            .expect("thread holding listener registry lock should not panic")
    }

    fn write_registry(&self) -> std::sync::RwLockWriteGuard<'_, Registry> {
        self.registry
            .write()
            .expect("thread holding listener registry lock should not panic")
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        // Dropping a runtime blocks on its blocking pool, which may hold hung listeners.
        self.shutdown();
    }
}

fn run_unregistration_hook(registration: &Registration) {
    if registration.unregistered.swap(true, Ordering::AcqRel) {
        return;
    }
    let hook = std::panic::catch_unwind(AssertUnwindSafe(|| {
        registration.listener.on_unregistered();
    }));
    if hook.is_err() {
        log::warn!(target: "eventhub", listener = registration.id; "listener unregistration hook panicked");
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            mpsc, Arc, Barrier, Mutex,
        },
        time::Duration,
    };

    use chrono::{TimeZone, Utc};

    use super::EventBus;
    use crate::{Event, EventBuilder, HubConfig, Listener, ListenerKey};

    fn event(event_type: &str, source: &str) -> Arc<Event> {
        Arc::new(EventBuilder::new("test", event_type, source).build())
    }

    fn recorder() -> (impl Listener, mpsc::Receiver<String>) {
        let (sender, receiver) = mpsc::channel();
        let sender = Mutex::new(sender);
        let listener = move |event: &Event| {
            let _ = sender.lock().unwrap().send(event.name().to_owned());
        };
        (listener, receiver)
    }

    struct CountingHook {
        unregistered: Arc<AtomicUsize>,
        panic_on_unregister: bool,
    }

    impl Listener for CountingHook {
        fn hear(&self, _event: &Event) {}

        fn on_unregistered(&self) {
            self.unregistered.fetch_add(1, Ordering::SeqCst);
            if self.panic_on_unregister {
                panic!("hook failure");
            }
        }
    }

    #[test]
    fn delivers_to_matching_listeners_only() {
        let bus = EventBus::new().unwrap();
        let (listener, received) = recorder();
        bus.add_listener(ListenerKey::new("t", "s"), listener).unwrap();

        assert_eq!(bus.dispatch(&event("t", "other")).delivered, 0);
        assert_eq!(bus.dispatch(&event("t", "s")).delivered, 1);
        assert_eq!(received.try_recv().unwrap(), "test");
        assert!(received.try_recv().is_err());
    }

    #[test]
    fn wildcard_listeners_receive_everything() {
        let bus = EventBus::new().unwrap();
        let (listener, received) = recorder();
        bus.add_listener(ListenerKey::wildcard(), listener).unwrap();
        bus.dispatch(&event("a", "b"));
        bus.dispatch(&event("c", "d"));
        assert_eq!(received.try_iter().count(), 2);
    }

    #[test]
    fn exact_listeners_are_scheduled_before_wildcards() {
        let config = HubConfig::new().with_max_listener_threads(1);
        let bus = EventBus::with_config(&config).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (name, key) in [
            ("wildcard", ListenerKey::wildcard()),
            ("exact", ListenerKey::new("t", "s")),
        ] {
            let order = Arc::clone(&order);
            bus.add_listener(key, move |_: &Event| order.lock().unwrap().push(name));
        }
        bus.dispatch(&event("t", "s"));
        assert_eq!(*order.lock().unwrap(), ["exact", "wildcard"]);
    }

    #[test]
    fn invalid_registration_is_a_no_op() {
        let bus = EventBus::new().unwrap();
        assert!(bus.add_listener(ListenerKey::new("", "s"), |_: &Event| {}).is_none());
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn slow_listener_is_reported_without_blocking_others() {
        let config = HubConfig::new().with_listener_timeout(Duration::from_millis(50));
        let bus = EventBus::with_config(&config).unwrap();
        let slow = bus
            .add_listener(ListenerKey::new("t", "s"), |_: &Event| {
                std::thread::sleep(Duration::from_millis(400))
            })
            .unwrap();
        let (listener, received) = recorder();
        bus.add_listener(ListenerKey::new("t", "s"), listener).unwrap();

        let report = bus.dispatch(&event("t", "s"));
        assert_eq!(report.timed_out, vec![slow]);
        assert_eq!(report.delivered, 1);
        assert_eq!(received.try_recv().unwrap(), "test");
    }

    #[test]
    fn panicking_listener_does_not_affect_others() {
        let bus = EventBus::new().unwrap();
        let failing = bus
            .add_listener(ListenerKey::new("t", "s"), |_: &Event| panic!("boom"))
            .unwrap();
        let (listener, received) = recorder();
        bus.add_listener(ListenerKey::new("t", "s"), listener).unwrap();
        let report = bus.dispatch(&event("t", "s"));
        assert_eq!(report.failed, vec![failing]);
        assert_eq!(received.try_recv().unwrap(), "test");
    }

    #[test]
    fn remove_runs_hook_exactly_once_and_swallows_panics() {
        let bus = EventBus::new().unwrap();
        let unregistered = Arc::new(AtomicUsize::new(0));
        let id = bus
            .add_listener(
                ListenerKey::new("t", "s"),
                CountingHook {
                    unregistered: Arc::clone(&unregistered),
                    panic_on_unregister: true,
                },
            )
            .unwrap();

        assert!(bus.remove_listener(id));
        assert!(!bus.remove_listener(id));
        assert_eq!(unregistered.load(Ordering::SeqCst), 1);
        assert_eq!(bus.dispatch(&event("t", "s")).delivered, 0);
    }

    #[test]
    fn remove_all_listeners_runs_every_hook() {
        let bus = EventBus::new().unwrap();
        let unregistered = Arc::new(AtomicUsize::new(0));
        for key in [ListenerKey::new("t", "s"), ListenerKey::wildcard()] {
            bus.add_listener(
                key,
                CountingHook {
                    unregistered: Arc::clone(&unregistered),
                    panic_on_unregister: false,
                },
            );
        }
        bus.remove_all_listeners();
        assert_eq!(bus.listener_count(), 0);
        assert_eq!(unregistered.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn one_time_listener_fires_once_under_concurrent_dispatch() {
        let bus = Arc::new(EventBus::new().unwrap());
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let calls = Arc::clone(&calls);
            bus.add_one_time_listener(ListenerKey::new("t", "s"), move |_: &Event| {
                calls.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        let barrier = Arc::new(Barrier::new(8));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let bus = Arc::clone(&bus);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    bus.dispatch(&event("t", "s"));
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn cancelled_one_time_listener_is_not_called() {
        let bus = EventBus::new().unwrap();
        let (listener, received) = recorder();
        let handle = bus
            .add_one_time_listener(ListenerKey::new("t", "s"), listener)
            .unwrap();
        assert!(handle.cancel());
        bus.dispatch(&event("t", "s"));
        assert!(received.try_recv().is_err());
        assert!(!handle.is_delivered());
    }

    #[test]
    fn paired_listener_receives_only_its_response() {
        let bus = EventBus::new().unwrap();
        let (listener, received) = recorder();
        bus.add_one_time_listener(ListenerKey::new("t", "s").with_pair_id("p1"), listener)
            .unwrap();

        let other = Arc::new(EventBuilder::new("other", "t", "s").pair_id("p2").build());
        let response = Arc::new(EventBuilder::new("response", "t", "s").pair_id("p1").build());
        bus.dispatch(&other);
        bus.dispatch(&response);
        assert_eq!(received.try_recv().unwrap(), "response");
        assert!(received.try_recv().is_err());
    }

    #[test]
    fn out_of_order_timestamps_are_not_rejected() {
        let bus = EventBus::new().unwrap();
        let (listener, received) = recorder();
        bus.add_listener(ListenerKey::new("t", "s"), listener).unwrap();
        let late = Arc::new(
            EventBuilder::new("late", "t", "s")
                .timestamp(Utc.timestamp_opt(2_000, 0).unwrap())
                .build(),
        );
        let early = Arc::new(
            EventBuilder::new("early", "t", "s")
                .timestamp(Utc.timestamp_opt(1_000, 0).unwrap())
                .build(),
        );
        bus.dispatch(&late);
        assert_eq!(bus.dispatch(&early).delivered, 1);
        assert_eq!(received.try_iter().collect::<Vec<_>>(), ["late", "early"]);
    }

    #[test]
    fn queued_listener_budget_starts_when_it_runs() {
        let config = HubConfig::new()
            .with_max_listener_threads(1)
            .with_listener_timeout(Duration::from_millis(300));
        let bus = EventBus::with_config(&config).unwrap();
        for _ in 0..2 {
            bus.add_listener(ListenerKey::new("t", "s"), |_: &Event| {
                std::thread::sleep(Duration::from_millis(200))
            })
            .unwrap();
        }

        // The second listener waits for the only thread, finishing 400ms after dispatch.
        let report = bus.dispatch(&event("t", "s"));
        assert_eq!(report.delivered, 2);
        assert!(report.timed_out.is_empty());
    }

    #[test]
    fn undeliverable_one_time_listener_stays_registered() {
        let bus = EventBus::new().unwrap();
        let unregistered = Arc::new(AtomicUsize::new(0));
        let handle = bus
            .add_one_time_listener(
                ListenerKey::new("t", "s"),
                CountingHook {
                    unregistered: Arc::clone(&unregistered),
                    panic_on_unregister: false,
                },
            )
            .unwrap();

        bus.shutdown();
        let report = bus.dispatch(&event("t", "s"));

        assert_eq!(report.delivered, 0);
        assert_eq!(report.failed, vec![handle.id()]);
        assert_eq!(bus.listener_count(), 1);
        assert_eq!(unregistered.load(Ordering::SeqCst), 0);
        assert!(!handle.is_delivered());
        // Still armed: cancelling it prevents a delivery.
        assert!(handle.cancel());
    }

    #[test]
    fn one_time_listener_hook_runs_after_delivery() {
        let bus = EventBus::new().unwrap();
        let unregistered = Arc::new(AtomicUsize::new(0));
        let handle = bus
            .add_one_time_listener(
                ListenerKey::new("t", "s"),
                CountingHook {
                    unregistered: Arc::clone(&unregistered),
                    panic_on_unregister: false,
                },
            )
            .unwrap();

        assert_eq!(bus.dispatch(&event("t", "s")).delivered, 1);
        assert_eq!(bus.dispatch(&event("t", "s")).delivered, 0);
        assert!(handle.is_delivered());
        assert_eq!(unregistered.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count(), 0);
    }
}
