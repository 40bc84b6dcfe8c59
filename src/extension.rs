use std::sync::{Arc, Mutex, PoisonError, Weak};

use crate::{
    hub::HubInner, Error, Event, EventData, Listener, ListenerId, ListenerKey, PendingToken,
    Result, SharedStateResult, SharedStateType,
};

/// A module plugged into the [`EventHub`](crate::EventHub).
///
/// Extensions do not share compile-time types with each other; they communicate through events
/// and shared state only.
///
/// ```
/// # use eventhub::{Extension, ExtensionApi, EventData, EventHub, HubConfig, SharedStateType};
/// struct Greeter;
///
/// impl Extension for Greeter {
///     fn name(&self) -> &str {
///         "com.example.greeter"
///     }
///
///     fn version(&self) -> &str {
///         "1.0.0"
///     }
///
///     fn on_registered(&self, api: &ExtensionApi) {
///         api.set_shared_state(SharedStateType::Standard, EventData::new().with("greeting", "hi"), None)
///             .unwrap();
///     }
/// }
///
/// let hub = EventHub::start(HubConfig::default()).unwrap();
/// hub.register_extension(Greeter).unwrap();
/// let state = hub.get_shared_state(SharedStateType::Standard, "com.example.greeter", None);
/// assert_eq!(state.data.unwrap().get_string("greeting"), Ok("hi"));
/// hub.shutdown().unwrap();
/// ```
pub trait Extension: Send + Sync {
    /// Unique name. Also the owner name of the extension's shared state.
    fn name(&self) -> &str;

    /// Version, preferably semver.
    fn version(&self) -> &str;

    /// Called once after registration. Register listeners and publish initial state here.
    fn on_registered(&self, _api: &ExtensionApi) {}

    /// Called once after the extension has been removed from the hub.
    fn on_unregistered(&self) {}
}

/// Handle given to an [`Extension`] to talk to the hub it is registered with.
///
/// Listeners registered through the handle are removed when the extension is unregistered. Once
/// the hub is shut down, every call fails with [`Error::HubShutdown`].
#[derive(Clone)]
pub struct ExtensionApi {
    hub: Weak<HubInner>,
    owner: String,
    listeners: Arc<Mutex<Vec<ListenerId>>>,
}

impl ExtensionApi {
    pub(crate) fn new(hub: Weak<HubInner>, owner: String) -> ExtensionApi {
        ExtensionApi {
            hub,
            owner,
            listeners: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Name of the extension this handle belongs to.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    fn hub(&self) -> Result<Arc<HubInner>> {
        self.hub.upgrade().ok_or(Error::HubShutdown)
    }

    /// Submit an event to the hub, returning its sequence number.
    pub fn dispatch(&self, event: Event) -> Result<u64> {
        self.hub()?.submit(event)
    }

    /// Register a listener on behalf of the extension.
    ///
    /// Returns `Ok(None)` if the key is not usable.
    pub fn register_listener(
        &self,
        key: ListenerKey,
        listener: impl Listener + 'static,
    ) -> Result<Option<ListenerId>> {
        let id = self.hub()?.bus.add_listener(key, listener);
        if let Some(id) = id {
            self.lock_listeners().push(id);
        }
        Ok(id)
    }

    /// Publish the extension's shared state, versioned at `event` or at the latest submitted
    /// event.
    pub fn set_shared_state(
        &self,
        kind: SharedStateType,
        data: EventData,
        event: Option<&Event>,
    ) -> Result<()> {
        self.hub()?.set_shared_state(kind, &self.owner, data, event)
    }

    /// Announce shared state that will be resolved later.
    pub fn create_pending_shared_state(
        &self,
        kind: SharedStateType,
        event: Option<&Event>,
    ) -> Result<PendingToken> {
        self.hub()?
            .create_pending_shared_state(kind, &self.owner, event)
    }

    /// Resolve a pending shared state version created by this extension.
    pub fn resolve_pending_shared_state(
        &self,
        kind: SharedStateType,
        token: &PendingToken,
        data: EventData,
    ) -> Result<()> {
        if token.module() != self.owner {
            return Err(Error::UnknownPendingToken {
                module: self.owner.clone(),
            });
        }
        self.hub()?.resolve_pending_shared_state(kind, token, data)
    }

    /// Read any module's shared state as of `event`, or the latest version without an event.
    pub fn get_shared_state(
        &self,
        kind: SharedStateType,
        module: &str,
        event: Option<&Event>,
    ) -> Result<SharedStateResult> {
        Ok(self.hub()?.get_shared_state(kind, module, event))
    }

    pub(crate) fn take_listeners(&self) -> Vec<ListenerId> {
        std::mem::take(&mut *self.lock_listeners())
    }

    fn lock_listeners(&self) -> std::sync::MutexGuard<'_, Vec<ListenerId>> {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ExtensionApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionApi")
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}
