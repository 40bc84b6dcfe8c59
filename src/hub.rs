//! The event hub: sequencing, rules, history, and delivery of events.
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        mpsc, Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
    thread::JoinHandle,
    time::Duration,
};

use semver::Version;
use tokio::task::AbortHandle;
use uuid::Uuid;

use crate::{
    event::{event_source, event_type},
    rules::{EvaluationContext, RulesEngine},
    Error, Event, EventBuilder, EventBus, EventData, EventHistory, Extension, ExtensionApi,
    HubConfig, Listener, ListenerId, ListenerKey, OneTimeHandle, PendingToken, Result,
    SharedStateResult, SharedStateStore, SharedStateType,
};

/// Owner name of the shared state the hub publishes about itself.
pub const HUB_STATE_OWNER: &str = "eventhub.module";
/// Data key of shared state change events naming the module whose state changed.
pub const STATE_OWNER: &str = "stateowner";

const STATE_CHANGE_NAME: &str = "Shared state change";
const XDM_STATE_CHANGE_NAME: &str = "Shared state change (XDM)";

struct RegisteredExtension {
    extension: Arc<dyn Extension>,
    version: String,
    api: ExtensionApi,
}

pub(crate) struct HubInner {
    pub(crate) bus: EventBus,
    rules: RulesEngine,
    standard_state: SharedStateStore,
    xdm_state: SharedStateStore,
    history: Option<Arc<EventHistory>>,
    rules_engine_enabled: bool,
    /// `None` once the hub is shut down.
    queue: Mutex<Option<mpsc::Sender<Event>>>,
    last_sequence: AtomicU64,
    extensions: Mutex<BTreeMap<String, RegisteredExtension>>,
    /// Response timers still sleeping.
    response_timers: Arc<AtomicUsize>,
}

impl HubInner {
    /// Stamp the next sequence number on `event` and enqueue it for the dispatcher.
    pub(crate) fn submit(&self, event: Event) -> Result<u64> {
        // Sequence assignment and enqueueing happen under one lock so queue order is sequence
        // order.
        let queue = self
            .queue
            .lock()
            .expect("thread holding event queue lock should not panic");
        let Some(sender) = queue.as_ref() else {
            return Err(Error::HubShutdown);
        };
        let sequence = self.last_sequence.fetch_add(1, Ordering::SeqCst) + 1;
        sender
            .send(event.with_sequence(sequence))
            .map_err(|_| Error::HubShutdown)?;
        Ok(sequence)
    }

    /// Runs on the dispatcher thread for every event, in sequence order.
    fn process(&self, event: Event) {
        let (event, created) = if self.rules_engine_enabled {
            let ctx =
                EvaluationContext::new(&event, &self.standard_state, self.history.as_deref());
            let outcome = self.rules.process(ctx);
            (outcome.event, outcome.dispatched)
        } else {
            (event, Vec::new())
        };

        if let Some(history) = &self.history {
            if let Err(err) = history.record(&event) {
                log::warn!(target: "eventhub", sequence = event.sequence(); "failed to record event into history: {err}");
            }
        }

        let event = Arc::new(event);
        self.bus.dispatch(&event);

        for created in created {
            if let Err(err) = self.submit(created) {
                log::debug!(target: "eventhub", sequence = event.sequence(); "dropping consequence event: {err}");
            }
        }
    }

    fn state(&self, kind: SharedStateType) -> &SharedStateStore {
        match kind {
            SharedStateType::Standard => &self.standard_state,
            SharedStateType::Xdm => &self.xdm_state,
        }
    }

    /// Version for state published at `event`, or at the latest submitted event.
    fn version_for(&self, event: Option<&Event>) -> u64 {
        event.map_or_else(|| self.last_sequence.load(Ordering::SeqCst), Event::sequence)
    }

    pub(crate) fn set_shared_state(
        &self,
        kind: SharedStateType,
        module: &str,
        data: EventData,
        event: Option<&Event>,
    ) -> Result<()> {
        self.state(kind)
            .set_state(module, self.version_for(event), data)?;
        self.announce_state_change(kind, module);
        Ok(())
    }

    pub(crate) fn create_pending_shared_state(
        &self,
        kind: SharedStateType,
        module: &str,
        event: Option<&Event>,
    ) -> Result<PendingToken> {
        self.state(kind)
            .set_pending(module, self.version_for(event))
    }

    pub(crate) fn resolve_pending_shared_state(
        &self,
        kind: SharedStateType,
        token: &PendingToken,
        data: EventData,
    ) -> Result<()> {
        self.state(kind).resolve_pending(token, data)?;
        self.announce_state_change(kind, token.module());
        Ok(())
    }

    pub(crate) fn get_shared_state(
        &self,
        kind: SharedStateType,
        module: &str,
        event: Option<&Event>,
    ) -> SharedStateResult {
        match event {
            Some(event) => self.state(kind).get_state(module, event.sequence()),
            None => self.state(kind).latest(module),
        }
    }

    fn announce_state_change(&self, kind: SharedStateType, module: &str) {
        let name = match kind {
            SharedStateType::Standard => STATE_CHANGE_NAME,
            SharedStateType::Xdm => XDM_STATE_CHANGE_NAME,
        };
        let event = EventBuilder::new(name, event_type::HUB, event_source::SHARED_STATE)
            .data(EventData::new().with(STATE_OWNER, module))
            .build();
        if let Err(err) = self.submit(event) {
            log::debug!(target: "eventhub", module; "not announcing shared state change: {err}");
        }
    }

    fn publish_hub_state(&self) {
        let extensions: EventData = self
            .lock_extensions()
            .iter()
            .map(|(name, registered)| {
                (
                    name.clone(),
                    EventData::new().with("version", registered.version.as_str()),
                )
            })
            .collect();
        let data = EventData::new()
            .with("version", env!("CARGO_PKG_VERSION"))
            .with("extensions", extensions);
        if let Err(err) =
            self.set_shared_state(SharedStateType::Standard, HUB_STATE_OWNER, data, None)
        {
            log::warn!(target: "eventhub", "failed to publish hub shared state: {err}");
        }
    }

    fn lock_extensions(&self) -> MutexGuard<'_, BTreeMap<String, RegisteredExtension>> {
        self.extensions
            .lock()
            .expect("thread holding extensions lock should not panic")
    }
}

/// An in-process event hub.
///
/// Events submitted with [`EventHub::dispatch`] are stamped with a strictly increasing sequence
/// number and processed one at a time by a dedicated dispatcher thread: the active rules are
/// applied, masked events are recorded into the event history, the event is delivered through the
/// [`EventBus`], and finally events created by rule consequences are submitted.
///
/// ```
/// # use std::{sync::mpsc, time::Duration};
/// # use eventhub::{Event, EventBuilder, EventHub, HubConfig, ListenerKey};
/// let hub = EventHub::start(HubConfig::default()).unwrap();
/// let (sender, receiver) = mpsc::channel();
/// hub.register_listener(ListenerKey::new("t", "s"), move |event: &Event| {
///     sender.send(event.sequence()).unwrap();
/// });
/// let sequence = hub.dispatch(EventBuilder::new("hello", "t", "s").build()).unwrap();
/// assert_eq!(receiver.recv_timeout(Duration::from_secs(5)).unwrap(), sequence);
/// hub.shutdown().unwrap();
/// ```
pub struct EventHub {
    inner: Arc<HubInner>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl EventHub {
    /// Create a hub and start its dispatcher thread.
    pub fn start(config: HubConfig) -> Result<EventHub> {
        let (sender, receiver) = mpsc::channel::<Event>();

        let inner = Arc::new(HubInner {
            bus: EventBus::with_config(&config)?,
            rules: RulesEngine::new(),
            standard_state: SharedStateStore::new(),
            xdm_state: SharedStateStore::new(),
            history: config.event_history.clone(),
            rules_engine_enabled: config.rules_engine_enabled,
            queue: Mutex::new(Some(sender)),
            last_sequence: AtomicU64::new(0),
            extensions: Mutex::new(BTreeMap::new()),
            response_timers: Arc::new(AtomicUsize::new(0)),
        });

        let join_handle = {
            let inner = Arc::clone(&inner);
            std::thread::Builder::new()
                .name("eventhub-dispatcher".to_owned())
                .spawn(move || {
                    log::debug!(target: "eventhub", "dispatcher thread started");
                    // Ends once the queue is closed and drained.
                    while let Ok(event) = receiver.recv() {
                        inner.process(event);
                    }
                    log::debug!(target: "eventhub", "dispatcher thread stopped");
                })?
        };

        inner.publish_hub_state();

        Ok(EventHub {
            inner,
            dispatcher: Mutex::new(Some(join_handle)),
        })
    }

    /// Submit `event`, returning the sequence number assigned to it.
    pub fn dispatch(&self, event: Event) -> Result<u64> {
        self.inner.submit(event)
    }

    /// Submit `request` and call `callback` with the first event matching `response` that
    /// carries the request's pairing id, or with [`Error::ResponseTimeout`] after `timeout`.
    ///
    /// The request gets a fresh pairing id if it has none. `response` must not match the request
    /// itself. The callback runs exactly once; it gets [`Error::HubShutdown`] if the hub shuts down
    /// first.
    pub fn dispatch_with_response<F>(
        &self,
        request: Event,
        response: ListenerKey,
        timeout: Duration,
        callback: F,
    ) -> Result<u64>
    where
        F: FnOnce(Result<Event>) + Send + 'static,
    {
        let pair_id = request
            .pair_id()
            .map_or_else(|| Uuid::new_v4().to_string(), str::to_owned);
        let request = request.with_pair_id(pair_id.clone());
        let response = response.with_pair_id(pair_id);
        if response.matches(&request) {
            return Err(Error::MalformedDefinition(
                "response listener would match the request".to_owned(),
            ));
        }

        let pending = Arc::new(PendingResponse::new(callback));
        let handle = self
            .inner
            .bus
            .add_one_time_listener(response, ResponseListener(Arc::clone(&pending)))
            .ok_or_else(|| Error::MalformedDefinition("invalid response listener key".to_owned()))?;

        let scheduled = self.inner.submit(request).and_then(|sequence| {
            let timer = self.spawn_response_timer(&handle, &pending, timeout, sequence)?;
            pending.set_timer(timer);
            Ok(sequence)
        });
        if scheduled.is_err() {
            pending.discard();
            handle.cancel();
            self.inner.bus.remove_listener(handle.id());
        }
        scheduled
    }

    fn spawn_response_timer<F>(
        &self,
        handle: &OneTimeHandle,
        pending: &Arc<PendingResponse<F>>,
        timeout: Duration,
        sequence: u64,
    ) -> Result<AbortHandle>
    where
        F: FnOnce(Result<Event>) + Send + 'static,
    {
        let hub = Arc::downgrade(&self.inner);
        let handle = handle.clone();
        let pending = Arc::clone(pending);
        let timers = TimerGuard::new(&self.inner.response_timers);
        log::trace!(target: "eventhub", sequence, timers = timers.count(); "awaiting response");

        let timer = self.inner.bus.spawn(async move {
            // Aborting the task drops the guard.
            let _timers = timers;
            tokio::time::sleep(timeout).await;
            expire_response(&hub, &handle, &pending, sequence);
        })?;
        Ok(timer.abort_handle())
    }

    /// Register `listener` for events matching `key`.
    pub fn register_listener(
        &self,
        key: ListenerKey,
        listener: impl Listener + 'static,
    ) -> Option<ListenerId> {
        self.inner.bus.add_listener(key, listener)
    }

    /// Register a listener that hears at most one event.
    pub fn register_one_time_listener(
        &self,
        key: ListenerKey,
        listener: impl Listener + 'static,
    ) -> Option<OneTimeHandle> {
        self.inner.bus.add_one_time_listener(key, listener)
    }

    /// Remove a listener and run its unregistration hook. Returns `false` for an unknown id.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.bus.remove_listener(id)
    }

    /// Publish shared state for `module`, versioned at `event` or at the latest submitted event.
    ///
    /// Announces the change with a shared state change event.
    pub fn set_shared_state(
        &self,
        kind: SharedStateType,
        module: &str,
        data: EventData,
        event: Option<&Event>,
    ) -> Result<()> {
        self.inner.set_shared_state(kind, module, data, event)
    }

    /// Announce shared state of `module` that will be resolved later.
    pub fn create_pending_shared_state(
        &self,
        kind: SharedStateType,
        module: &str,
        event: Option<&Event>,
    ) -> Result<PendingToken> {
        self.inner.create_pending_shared_state(kind, module, event)
    }

    /// Resolve pending shared state and announce the change.
    pub fn resolve_pending_shared_state(
        &self,
        kind: SharedStateType,
        token: &PendingToken,
        data: EventData,
    ) -> Result<()> {
        self.inner.resolve_pending_shared_state(kind, token, data)
    }

    /// Shared state of `module` as of `event`, or its latest version without an event.
    pub fn get_shared_state(
        &self,
        kind: SharedStateType,
        module: &str,
        event: Option<&Event>,
    ) -> SharedStateResult {
        self.inner.get_shared_state(kind, module, event)
    }

    /// Drop every version of `module`'s shared state.
    pub fn clear_shared_state(&self, kind: SharedStateType, module: &str) -> bool {
        self.inner.state(kind).clear_state(module)
    }

    /// Register an extension and call its [`Extension::on_registered`].
    pub fn register_extension(&self, extension: impl Extension + 'static) -> Result<()> {
        let extension: Arc<dyn Extension> = Arc::new(extension);
        let name = extension.name().to_owned();
        if name.is_empty() {
            return Err(Error::MalformedDefinition(
                "extension name is empty".to_owned(),
            ));
        }
        let version = extension.version().to_owned();
        if let Err(err) = Version::parse(&version) {
            log::warn!(target: "eventhub",
                       extension:display = name,
                       version:display = version;
                       "extension version is not valid semver, keeping it verbatim: {err}");
        }

        let api = ExtensionApi::new(Arc::downgrade(&self.inner), name.clone());
        {
            let mut extensions = self.inner.lock_extensions();
            if extensions.contains_key(&name) {
                return Err(Error::DuplicateExtension(name));
            }
            extensions.insert(
                name.clone(),
                RegisteredExtension {
                    extension: Arc::clone(&extension),
                    version: version.clone(),
                    api: api.clone(),
                },
            );
        }

        log::debug!(target: "eventhub",
                    extension:display = name,
                    version:display = version;
                    "registered extension");
        extension.on_registered(&api);
        self.inner.publish_hub_state();
        Ok(())
    }

    /// Remove an extension, its listeners, and call its [`Extension::on_unregistered`].
    pub fn unregister_extension(&self, name: &str) -> Result<()> {
        let registered = self
            .inner
            .lock_extensions()
            .remove(name)
            .ok_or_else(|| Error::ExtensionNotFound(name.to_owned()))?;
        self.finish_unregistration(registered);
        self.inner.publish_hub_state();
        Ok(())
    }

    fn finish_unregistration(&self, registered: RegisteredExtension) {
        for id in registered.api.take_listeners() {
            self.inner.bus.remove_listener(id);
        }
        registered.extension.on_unregistered();
        log::debug!(target: "eventhub", extension = registered.api.owner(); "unregistered extension");
    }

    /// Names of registered extensions, sorted.
    pub fn extensions(&self) -> Vec<String> {
        self.inner.lock_extensions().keys().cloned().collect()
    }

    /// The rules engine applied to every dispatched event.
    pub fn rules_engine(&self) -> &RulesEngine {
        &self.inner.rules
    }

    /// Event history the hub records masked events into, if configured.
    pub fn event_history(&self) -> Option<&Arc<EventHistory>> {
        self.inner.history.as_ref()
    }

    /// Sequence number of the most recently submitted event.
    pub fn last_sequence(&self) -> u64 {
        self.inner.last_sequence.load(Ordering::SeqCst)
    }

    /// Number of response timeouts still pending.
    pub(crate) fn response_timers(&self) -> usize {
        self.inner.response_timers.load(Ordering::SeqCst)
    }

    /// Stop accepting events, wait for queued events to be processed, then unregister every
    /// extension and listener.
    ///
    /// Calling it again is a no-op.
    pub fn shutdown(&self) -> Result<()> {
        // Closing the queue lets the dispatcher drain it and exit.
        self.inner
            .queue
            .lock()
            .expect("thread holding event queue lock should not panic")
            .take();

        let join_handle = self
            .dispatcher
            .lock()
            .expect("thread holding dispatcher lock should not panic")
            .take();
        let Some(join_handle) = join_handle else {
            return Ok(());
        };
        join_handle.join().map_err(|_| Error::DispatcherPanicked)?;

        let extensions = std::mem::take(&mut *self.inner.lock_extensions());
        for registered in extensions.into_values() {
            self.finish_unregistration(registered);
        }
        self.inner.bus.remove_all_listeners();
        self.inner.bus.shutdown();

        log::debug!(target: "eventhub", last_sequence = self.last_sequence(); "event hub shut down");
        Ok(())
    }
}

impl Drop for EventHub {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            log::warn!(target: "eventhub", "failed to shut down event hub: {err}");
        }
    }
}

/// Callback of a [`EventHub::dispatch_with_response`] call, shared by its response listener and
/// its timer. Whichever completes it first wins.
struct PendingResponse<F> {
    callback: Mutex<Option<F>>,
    timer: Mutex<Option<AbortHandle>>,
}

impl<F: FnOnce(Result<Event>)> PendingResponse<F> {
    fn new(callback: F) -> PendingResponse<F> {
        PendingResponse {
            callback: Mutex::new(Some(callback)),
            timer: Mutex::new(None),
        }
    }

    /// Call the callback with `result` unless it already ran, and stop the timer.
    fn complete(&self, result: Result<Event>) {
        let callback = self.take_callback();
        if let Some(timer) = self.lock_timer().take() {
            timer.abort();
        }
        if let Some(callback) = callback {
            callback(result);
        }
    }

    /// Drop the callback without calling it.
    fn discard(&self) {
        drop(self.take_callback());
        if let Some(timer) = self.lock_timer().take() {
            timer.abort();
        }
    }

    fn set_timer(&self, timer: AbortHandle) {
        // Checked under the timer lock: `complete` takes the callback before the timer.
        let mut slot = self.lock_timer();
        let settled = self
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none();
        if settled {
            timer.abort();
        } else {
            *slot = Some(timer);
        }
    }

    fn take_callback(&self) -> Option<F> {
        self.callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn lock_timer(&self) -> MutexGuard<'_, Option<AbortHandle>> {
        self.timer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct ResponseListener<F>(Arc<PendingResponse<F>>);

impl<F: FnOnce(Result<Event>) + Send + 'static> Listener for ResponseListener<F> {
    fn hear(&self, event: &Event) {
        self.0.complete(Ok(event.clone()));
    }

    fn on_unregistered(&self) {
        // No-op if the response or the timeout came first.
        self.0.complete(Err(Error::HubShutdown));
    }
}

/// Counts a live response timer until dropped.
struct TimerGuard(Arc<AtomicUsize>);

impl TimerGuard {
    fn new(timers: &Arc<AtomicUsize>) -> TimerGuard {
        timers.fetch_add(1, Ordering::SeqCst);
        TimerGuard(Arc::clone(timers))
    }

    fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

impl Drop for TimerGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn expire_response<F: FnOnce(Result<Event>)>(
    hub: &Weak<HubInner>,
    handle: &OneTimeHandle,
    pending: &PendingResponse<F>,
    sequence: u64,
) {
    if !handle.cancel() {
        return;
    }
    log::debug!(target: "eventhub", sequence; "timed out waiting for response");
    // Completed before removal so the unregistration hook finds nothing left to report.
    pending.complete(Err(Error::ResponseTimeout));
    if let Some(hub) = hub.upgrade() {
        hub.bus.remove_listener(handle.id());
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{mpsc, Arc, Mutex},
        time::{Duration, Instant},
    };

    use super::{EventHub, HUB_STATE_OWNER, STATE_OWNER};
    use crate::{
        event::{event_source, event_type},
        Error, Event, EventBuilder, EventData, EventHistory, Extension, ExtensionApi, HubConfig,
        ListenerKey, SharedStateStatus, SharedStateType,
    };

    const WAIT: Duration = Duration::from_secs(5);

    fn hub() -> EventHub {
        EventHub::start(HubConfig::default()).unwrap()
    }

    #[test]
    fn events_are_delivered_in_sequence_order() {
        let hub = hub();
        let (sender, receiver) = mpsc::channel();
        hub.register_listener(ListenerKey::new("t", "s"), move |event: &Event| {
            sender.send(event.sequence()).unwrap();
        })
        .unwrap();

        let sequences: Vec<u64> = (0..20)
            .map(|i| {
                hub.dispatch(EventBuilder::new(format!("e{i}"), "t", "s").build())
                    .unwrap()
            })
            .collect();
        assert!(sequences.windows(2).all(|pair| pair[0] < pair[1]));

        let received: Vec<u64> = (0..20).map(|_| receiver.recv_timeout(WAIT).unwrap()).collect();
        assert_eq!(received, sequences);
        hub.shutdown().unwrap();
    }

    #[test]
    fn dispatch_after_shutdown_fails() {
        let hub = hub();
        hub.shutdown().unwrap();
        hub.shutdown().unwrap();
        assert!(matches!(
            hub.dispatch(EventBuilder::new("e", "t", "s").build()),
            Err(Error::HubShutdown)
        ));
    }

    /// Answers every identity request on `hub` with a paired response.
    fn answer_requests(hub: &Arc<EventHub>) {
        let responder = Arc::downgrade(hub);
        hub.register_listener(
            ListenerKey::new("identity", event_source::REQUEST_CONTENT),
            move |request: &Event| {
                let response = EventBuilder::response_to(
                    request,
                    "response",
                    "identity",
                    event_source::RESPONSE_CONTENT,
                )
                .data(EventData::new().with("id", "abc"))
                .build();
                if let Some(hub) = responder.upgrade() {
                    hub.dispatch(response).unwrap();
                }
            },
        )
        .unwrap();
    }

    fn request() -> Event {
        EventBuilder::new("request", "identity", event_source::REQUEST_CONTENT).build()
    }

    fn response_key() -> ListenerKey {
        ListenerKey::new("identity", event_source::RESPONSE_CONTENT)
    }

    #[test]
    fn response_callback_receives_paired_response() {
        let hub = Arc::new(hub());
        answer_requests(&hub);

        let (sender, receiver) = mpsc::channel();
        hub.dispatch_with_response(request(), response_key(), WAIT, move |result| {
            sender.send(result).unwrap()
        })
        .unwrap();

        let response = receiver.recv_timeout(WAIT).unwrap().unwrap();
        assert_eq!(response.data().get_string("id"), Ok("abc"));
        hub.shutdown().unwrap();
    }

    #[test]
    fn answered_requests_stop_their_timers() {
        let hub = Arc::new(hub());
        answer_requests(&hub);

        let (sender, receiver) = mpsc::channel();
        for _ in 0..50 {
            let sender = sender.clone();
            hub.dispatch_with_response(
                request(),
                response_key(),
                Duration::from_secs(60),
                move |result| sender.send(result.is_ok()).unwrap(),
            )
            .unwrap();
        }
        for _ in 0..50 {
            assert!(receiver.recv_timeout(WAIT).unwrap());
        }

        // Aborted timers are dropped by the runtime shortly after their response.
        let deadline = Instant::now() + WAIT;
        while hub.response_timers() > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(hub.response_timers(), 0);
        hub.shutdown().unwrap();
    }

    #[test]
    fn pending_response_fails_on_shutdown() {
        let hub = hub();
        let (sender, receiver) = mpsc::channel();
        hub.dispatch_with_response(
            request(),
            response_key(),
            Duration::from_secs(60),
            move |result| sender.send(result).unwrap(),
        )
        .unwrap();

        hub.shutdown().unwrap();
        assert!(matches!(
            receiver.recv_timeout(WAIT).unwrap(),
            Err(Error::HubShutdown)
        ));
        assert!(receiver.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn response_callback_times_out() {
        let hub = hub();
        let (sender, receiver) = mpsc::channel();
        hub.dispatch_with_response(
            request(),
            response_key(),
            Duration::from_millis(50),
            move |result| sender.send(result).unwrap(),
        )
        .unwrap();

        assert!(matches!(
            receiver.recv_timeout(WAIT).unwrap(),
            Err(Error::ResponseTimeout)
        ));
        // Exactly one callback.
        assert!(receiver.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(hub.response_timers(), 0);
        hub.shutdown().unwrap();
    }

    #[test]
    fn response_key_matching_request_is_rejected() {
        let hub = hub();
        let result = hub.dispatch_with_response(
            EventBuilder::new("request", "t", "s").build(),
            ListenerKey::wildcard(),
            WAIT,
            |_| {},
        );
        assert!(matches!(result, Err(Error::MalformedDefinition(_))));
        hub.shutdown().unwrap();
    }

    #[test]
    fn shared_state_changes_are_announced_and_versioned() {
        let hub = hub();
        let (sender, receiver) = mpsc::channel();
        hub.register_listener(
            ListenerKey::new(event_type::HUB, event_source::SHARED_STATE),
            move |event: &Event| {
                let owner = event.data().get_string(STATE_OWNER).unwrap();
                if owner != HUB_STATE_OWNER {
                    sender.send(owner.to_owned()).unwrap();
                }
            },
        )
        .unwrap();

        let first_sequence = hub.dispatch(EventBuilder::new("e", "t", "s").build()).unwrap();
        hub.set_shared_state(
            SharedStateType::Standard,
            "com.example.x",
            EventData::new().with("a", 1),
            None,
        )
        .unwrap();
        assert_eq!(receiver.recv_timeout(WAIT).unwrap(), "com.example.x");

        let before = EventBuilder::new("e", "t", "s").build().with_sequence(first_sequence - 1);
        assert_eq!(
            hub.get_shared_state(SharedStateType::Standard, "com.example.x", Some(&before))
                .status,
            SharedStateStatus::None
        );
        let latest = hub.get_shared_state(SharedStateType::Standard, "com.example.x", None);
        assert_eq!(latest.status, SharedStateStatus::Resolved);
        assert_eq!(latest.data.unwrap().get_integer("a"), Ok(1));

        assert_eq!(
            hub.get_shared_state(SharedStateType::Xdm, "com.example.x", None)
                .status,
            SharedStateStatus::None
        );
        hub.shutdown().unwrap();
    }

    #[test]
    fn pending_state_resolves_through_hub() {
        let hub = hub();
        let token = hub
            .create_pending_shared_state(SharedStateType::Xdm, "com.example.y", None)
            .unwrap();
        assert_eq!(
            hub.get_shared_state(SharedStateType::Xdm, "com.example.y", None)
                .status,
            SharedStateStatus::Pending
        );
        hub.resolve_pending_shared_state(SharedStateType::Xdm, &token, EventData::new().with("b", 2))
            .unwrap();
        assert!(matches!(
            hub.resolve_pending_shared_state(SharedStateType::Xdm, &token, EventData::new()),
            Err(Error::DuplicateResolution { .. })
        ));
        assert!(hub.clear_shared_state(SharedStateType::Xdm, "com.example.y"));
        hub.shutdown().unwrap();
    }

    struct Recorder {
        name: &'static str,
        version: &'static str,
        heard: mpsc::Sender<String>,
    }

    impl Extension for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        fn version(&self) -> &str {
            self.version
        }

        fn on_registered(&self, api: &ExtensionApi) {
            let heard = self.heard.clone();
            api.register_listener(ListenerKey::new("t", "s"), move |event: &Event| {
                heard.send(event.name().to_owned()).unwrap();
            })
            .unwrap();
        }

        fn on_unregistered(&self) {
            self.heard.send("unregistered".to_owned()).unwrap();
        }
    }

    #[test]
    fn extensions_register_and_unregister() {
        let hub = hub();
        let (sender, receiver) = mpsc::channel();
        let recorder = |version| Recorder {
            name: "com.example.recorder",
            version,
            heard: sender.clone(),
        };

        hub.register_extension(recorder("1.2.3")).unwrap();
        assert!(matches!(
            hub.register_extension(recorder("not-semver")),
            Err(Error::DuplicateExtension(_))
        ));
        assert_eq!(hub.extensions(), vec!["com.example.recorder".to_owned()]);

        let hub_state = hub
            .get_shared_state(SharedStateType::Standard, HUB_STATE_OWNER, None)
            .data
            .unwrap();
        assert_eq!(
            hub_state
                .get_map("extensions")
                .unwrap()
                .get_map("com.example.recorder")
                .unwrap()
                .get_string("version"),
            Ok("1.2.3")
        );

        hub.dispatch(EventBuilder::new("first", "t", "s").build()).unwrap();
        assert_eq!(receiver.recv_timeout(WAIT).unwrap(), "first");

        hub.unregister_extension("com.example.recorder").unwrap();
        assert_eq!(receiver.recv_timeout(WAIT).unwrap(), "unregistered");
        assert!(matches!(
            hub.unregister_extension("com.example.recorder"),
            Err(Error::ExtensionNotFound(_))
        ));

        hub.dispatch(EventBuilder::new("second", "t", "s").build()).unwrap();
        assert!(receiver.recv_timeout(Duration::from_millis(200)).is_err());
        hub.shutdown().unwrap();
    }

    #[test]
    fn extension_api_fails_after_hub_is_dropped() {
        let api_slot = Arc::new(Mutex::new(None));
        {
            let hub = hub();
            hub.register_extension(Capture(Arc::clone(&api_slot))).unwrap();
        }
        let api: ExtensionApi = api_slot.lock().unwrap().take().unwrap();
        assert_eq!(api.owner(), "com.example.capture");
        assert!(matches!(
            api.dispatch(EventBuilder::new("e", "t", "s").build()),
            Err(Error::HubShutdown)
        ));
    }

    struct Capture(Arc<Mutex<Option<ExtensionApi>>>);

    impl Extension for Capture {
        fn name(&self) -> &str {
            "com.example.capture"
        }

        fn version(&self) -> &str {
            "0.1.0"
        }

        fn on_registered(&self, api: &ExtensionApi) {
            *self.0.lock().unwrap() = Some(api.clone());
        }
    }

    #[test]
    fn masked_events_are_recorded_into_history() {
        let history = Arc::new(EventHistory::in_memory().unwrap());
        let hub = EventHub::start(HubConfig::default().with_event_history(Arc::clone(&history)))
            .unwrap();
        let (sender, receiver) = mpsc::channel();
        hub.register_listener(ListenerKey::new("t", "s"), move |_: &Event| {
            sender.send(()).unwrap();
        })
        .unwrap();

        let data = EventData::new().with("action", "purchase").with("price", 3);
        hub.dispatch(
            EventBuilder::new("e", "t", "s")
                .data(data.clone())
                .mask(["action"])
                .build(),
        )
        .unwrap();
        receiver.recv_timeout(WAIT).unwrap();

        let mask = EventData::new().with("action", "purchase");
        let hash = crate::hash_mask(&mask, None);
        assert_eq!(history.select(hash, 0, 0).unwrap().count, 1);
        hub.shutdown().unwrap();
    }

    #[test]
    fn rules_can_be_disabled() {
        let hub = EventHub::start(HubConfig::default().with_rules_engine_enabled(false)).unwrap();
        hub.rules_engine().replace_rules(
            crate::rules::RuleSet::from_json(
                br#"{"rules": [{"condition": {"type": "matcher", "definition": {"key": "a", "matcher": "ex"}},
                    "consequences": [{"id": "1", "type": "mod", "detail": {"eventdata": {"a": "rewritten"}}}]}]}"#,
            )
            .unwrap(),
        );
        let (sender, receiver) = mpsc::channel();
        hub.register_listener(ListenerKey::new("t", "s"), move |event: &Event| {
            sender
                .send(event.data().get_string("a").unwrap().to_owned())
                .unwrap();
        })
        .unwrap();
        hub.dispatch(
            EventBuilder::new("e", "t", "s")
                .data(EventData::new().with("a", "original"))
                .build(),
        )
        .unwrap();
        assert_eq!(receiver.recv_timeout(WAIT).unwrap(), "original");
        hub.shutdown().unwrap();
    }
}
