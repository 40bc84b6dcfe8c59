//! Versioned per-module shared state.
//!
//! Each module owns a list of versions ordered by the hub sequence number at which they became
//! authoritative. Readers ask for state "as of" a sequence number and never observe versions
//! published later.
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock, RwLockReadGuard, RwLockWriteGuard,
    },
};

use serde::Serialize;

use crate::{Error, EventData, Result};

/// Which of the hub's two shared state stores an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SharedStateType {
    /// Regular key-value shared state.
    #[default]
    Standard,
    /// Experience-data-model shared state.
    Xdm,
}

/// Status of a shared state read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SharedStateStatus {
    /// A version is available and carries data.
    Resolved,
    /// A version was announced but its data is not computed yet.
    Pending,
    /// The module has no state at the requested point.
    None,
}

/// Result of [`SharedStateStore::get_state`].
#[derive(Debug, Clone, PartialEq)]
pub struct SharedStateResult {
    /// Whether a version is visible and resolved.
    pub status: SharedStateStatus,
    /// Present only when `status` is [`SharedStateStatus::Resolved`].
    pub data: Option<Arc<EventData>>,
}

impl SharedStateResult {
    fn none() -> SharedStateResult {
        SharedStateResult {
            status: SharedStateStatus::None,
            data: None,
        }
    }

    fn pending() -> SharedStateResult {
        SharedStateResult {
            status: SharedStateStatus::Pending,
            data: None,
        }
    }
}

/// Token returned by [`SharedStateStore::set_pending`], redeemable once with
/// [`SharedStateStore::resolve_pending`].
///
/// A token names exactly one pending version, even when other versions share its sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingToken {
    module: String,
    sequence: u64,
    version: u64,
}

impl PendingToken {
    /// Module owning the pending version.
    pub fn module(&self) -> &str {
        &self.module
    }

    /// Sequence number at which the pending version becomes authoritative.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

#[derive(Debug, Clone)]
enum VersionState {
    Pending,
    Resolved(Arc<EventData>),
}

#[derive(Debug, Clone)]
struct StateVersion {
    /// Store-wide unique id, matched against [`PendingToken::version`].
    id: u64,
    sequence: u64,
    state: VersionState,
}

type Versions = Arc<RwLock<Vec<StateVersion>>>;

/// `SharedStateStore` holds versioned shared state for any number of modules.
///
/// Modules are locked independently so updates to one module never wait on another.
///
/// ```
/// # use eventhub::{EventData, SharedStateStore, SharedStateStatus};
/// let store = SharedStateStore::new();
/// store.set_state("config", 3, EventData::new().with("key", "value")).unwrap();
/// assert_eq!(store.get_state("config", 2).status, SharedStateStatus::None);
/// assert_eq!(store.get_state("config", 3).status, SharedStateStatus::Resolved);
/// ```
#[derive(Debug, Default)]
pub struct SharedStateStore {
    /// Appends hold the read lock while pushing, so `clear_state` never races an append.
    modules: RwLock<HashMap<String, Versions>>,
    next_version: AtomicU64,
}

impl SharedStateStore {
    /// Create an empty store.
    pub fn new() -> SharedStateStore {
        SharedStateStore::default()
    }

    /// Publish a resolved version of `module`'s state at `sequence`.
    ///
    /// Fails with [`Error::OutOfOrderUpdate`] if `sequence` is below the module's last version;
    /// the existing versions are kept.
    pub fn set_state(&self, module: &str, sequence: u64, data: EventData) -> Result<()> {
        let data = Arc::new(data);
        self.append(module, sequence, VersionState::Resolved(data))
            .map(|_| ())
    }

    /// Announce that a version of `module`'s state will be available at `sequence`.
    ///
    /// Readers at or after `sequence` get [`SharedStateStatus::Pending`] until the returned token
    /// is resolved.
    pub fn set_pending(&self, module: &str, sequence: u64) -> Result<PendingToken> {
        let version = self.append(module, sequence, VersionState::Pending)?;
        Ok(PendingToken {
            module: module.to_owned(),
            sequence,
            version,
        })
    }

    /// Provide the data of a pending version. Each token resolves exactly once.
    pub fn resolve_pending(&self, token: &PendingToken, data: EventData) -> Result<()> {
        let unknown = || Error::UnknownPendingToken {
            module: token.module.clone(),
        };

        let modules = self.read_modules();
        let versions = modules.get(&token.module).ok_or_else(unknown)?;
        let mut versions = versions
            .write()
            .expect("thread holding shared state lock should not panic");

        let version = versions
            .iter_mut()
            .find(|version| version.id == token.version)
            .ok_or_else(unknown)?;
        match version.state {
            VersionState::Pending => {
                version.state = VersionState::Resolved(Arc::new(data));
                log::debug!(target: "eventhub", module:display = token.module, sequence = token.sequence; "resolved pending shared state");
                Ok(())
            }
            VersionState::Resolved(_) => {
                log::warn!(target: "eventhub", module:display = token.module, sequence = token.sequence; "rejecting second resolution of pending shared state");
                Err(Error::DuplicateResolution {
                    module: token.module.clone(),
                    sequence: token.sequence,
                })
            }
        }
    }

    /// Read `module`'s state as of sequence number `at`: the latest version with a sequence
    /// number less than or equal to `at`.
    pub fn get_state(&self, module: &str, at: u64) -> SharedStateResult {
        let Some(versions) = self.versions(module) else {
            return SharedStateResult::none();
        };
        let versions = versions
            .read()
            .expect("thread holding shared state lock should not panic");

        let visible = versions.partition_point(|version| version.sequence <= at);
        match visible.checked_sub(1).map(|index| &versions[index]) {
            None => SharedStateResult::none(),
            Some(version) => result_of(version),
        }
    }

    /// Newest version of `module`'s state regardless of sequence number.
    pub fn latest(&self, module: &str) -> SharedStateResult {
        let Some(versions) = self.versions(module) else {
            return SharedStateResult::none();
        };
        let versions = versions
            .read()
            .expect("thread holding shared state lock should not panic");
        versions
            .last()
            .map(result_of)
            .unwrap_or_else(SharedStateResult::none)
    }

    /// Drop every version of `module`. Subsequent reads report [`SharedStateStatus::None`].
    ///
    /// Readers still holding data of a removed version keep it; the store only forgets it.
    pub fn clear_state(&self, module: &str) -> bool {
        self.write_modules().remove(module).is_some()
    }

    /// Names of modules with at least one version.
    pub fn modules(&self) -> Vec<String> {
        let mut modules: Vec<_> = self
            .read_modules()
            .keys()
            .cloned()
            .collect();
        modules.sort();
        modules
    }

    fn versions(&self, module: &str) -> Option<Versions> {
        self.read_modules().get(module).cloned()
    }

    fn read_modules(&self) -> RwLockReadGuard<'_, HashMap<String, Versions>> {
        self.modules
            .read()
            .expect("thread holding shared state lock should not panic")
    }

    fn write_modules(&self) -> RwLockWriteGuard<'_, HashMap<String, Versions>> {
        self.modules
            .write()
            .expect("thread holding shared state lock should not panic")
    }

    /// Push a new version and return its id.
    fn append(&self, module: &str, sequence: u64, state: VersionState) -> Result<u64> {
        {
            let modules = self.read_modules();
            if let Some(versions) = modules.get(module) {
                return self.push(module, versions, sequence, state);
            }
        }
        let mut modules = self.write_modules();
        let versions = modules.entry(module.to_owned()).or_default();
        self.push(module, versions, sequence, state)
    }

    fn push(
        &self,
        module: &str,
        versions: &Versions,
        sequence: u64,
        state: VersionState,
    ) -> Result<u64> {
        let mut versions = versions
            .write()
            .expect("thread holding shared state lock should not panic");

        if let Some(last) = versions.last() {
            if sequence < last.sequence {
                log::warn!(target: "eventhub",
                           module,
                           last = last.sequence,
                           attempted = sequence;
                           "rejecting out-of-order shared state update");
                return Err(Error::OutOfOrderUpdate {
                    module: module.to_owned(),
                    last: last.sequence,
                    attempted: sequence,
                });
            }
        }

        let id = self.next_version.fetch_add(1, Ordering::Relaxed);
        versions.push(StateVersion { id, sequence, state });
        Ok(id)
    }
}

fn result_of(version: &StateVersion) -> SharedStateResult {
    match &version.state {
        VersionState::Pending => SharedStateResult::pending(),
        VersionState::Resolved(data) => SharedStateResult {
            status: SharedStateStatus::Resolved,
            data: Some(Arc::clone(data)),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Barrier,
    };

    use super::{SharedStateStatus, SharedStateStore};
    use crate::{Error, EventData};

    fn data(value: i32) -> EventData {
        EventData::new().with("a", value)
    }

    #[test]
    fn reads_never_see_future_versions() {
        let store = SharedStateStore::new();
        store.set_state("m", 1, data(1)).unwrap();
        store.set_state("m", 5, data(5)).unwrap();
        store.set_state("m", 9, data(9)).unwrap();

        let read = |at| store.get_state("m", at).data.map(|d| d.get_integer("a").unwrap());
        assert_eq!(read(0), None);
        assert_eq!(read(1), Some(1));
        assert_eq!(read(4), Some(1));
        assert_eq!(read(5), Some(5));
        assert_eq!(read(100), Some(9));
    }

    #[test]
    fn pending_then_resolved() {
        let store = SharedStateStore::new();
        let token = store.set_pending("X", 10).unwrap();
        assert_eq!(store.get_state("X", 15).status, SharedStateStatus::Pending);
        assert_eq!(store.get_state("X", 15).data, None);

        store.resolve_pending(&token, data(1)).unwrap();

        let resolved = store.get_state("X", 15);
        assert_eq!(resolved.status, SharedStateStatus::Resolved);
        assert_eq!(resolved.data.unwrap().get_integer("a"), Ok(1));
        assert_eq!(store.get_state("X", 5).status, SharedStateStatus::None);
    }

    #[test]
    fn pending_does_not_hide_earlier_versions_from_earlier_readers() {
        let store = SharedStateStore::new();
        store.set_state("m", 2, data(2)).unwrap();
        store.set_pending("m", 6).unwrap();
        assert_eq!(store.get_state("m", 4).data.unwrap().get_integer("a"), Ok(2));
        assert_eq!(store.get_state("m", 6).status, SharedStateStatus::Pending);
    }

    #[test]
    fn second_resolution_is_rejected() {
        let store = SharedStateStore::new();
        let token = store.set_pending("m", 1).unwrap();
        store.resolve_pending(&token, data(1)).unwrap();
        assert!(matches!(
            store.resolve_pending(&token, data(2)),
            Err(Error::DuplicateResolution { sequence: 1, .. })
        ));
        assert_eq!(store.get_state("m", 1).data.unwrap().get_integer("a"), Ok(1));
    }

    #[test]
    fn unknown_token_is_rejected() {
        let store = SharedStateStore::new();
        let token = store.set_pending("m", 1).unwrap();
        store.clear_state("m");
        assert!(matches!(
            store.resolve_pending(&token, data(1)),
            Err(Error::UnknownPendingToken { .. })
        ));
    }

    #[test]
    fn out_of_order_update_keeps_last_version() {
        let store = SharedStateStore::new();
        store.set_state("m", 5, data(5)).unwrap();
        assert!(matches!(
            store.set_state("m", 3, data(3)),
            Err(Error::OutOfOrderUpdate { last: 5, attempted: 3, .. })
        ));
        assert_eq!(store.latest("m").data.unwrap().get_integer("a"), Ok(5));
        // Equal sequence numbers are allowed; the later publication wins.
        store.set_state("m", 5, data(6)).unwrap();
        assert_eq!(store.get_state("m", 5).data.unwrap().get_integer("a"), Ok(6));
    }

    #[test]
    fn clear_state_removes_module() {
        let store = SharedStateStore::new();
        store.set_state("m", 1, data(1)).unwrap();
        assert_eq!(store.modules(), vec!["m".to_owned()]);
        assert!(store.clear_state("m"));
        assert_eq!(store.get_state("m", 1).status, SharedStateStatus::None);
        assert!(!store.clear_state("m"));
    }

    #[test]
    fn pending_token_survives_resolved_version_at_same_sequence() {
        let store = SharedStateStore::new();
        let token = store.set_pending("m", 5).unwrap();
        store.set_state("m", 5, data(1)).unwrap();

        store.resolve_pending(&token, data(2)).unwrap();
        assert!(matches!(
            store.resolve_pending(&token, data(3)),
            Err(Error::DuplicateResolution { sequence: 5, .. })
        ));
        // The later publication at the same sequence still wins.
        assert_eq!(store.get_state("m", 5).data.unwrap().get_integer("a"), Ok(1));
    }

    #[test]
    fn pending_tokens_at_same_sequence_resolve_independently() {
        let store = SharedStateStore::new();
        let first = store.set_pending("m", 5).unwrap();
        let second = store.set_pending("m", 5).unwrap();
        assert_ne!(first, second);

        store.resolve_pending(&first, data(1)).unwrap();
        assert_eq!(store.latest("m").status, SharedStateStatus::Pending);

        store.resolve_pending(&second, data(2)).unwrap();
        assert_eq!(store.latest("m").data.unwrap().get_integer("a"), Ok(2));
        assert!(matches!(
            store.resolve_pending(&first, data(3)),
            Err(Error::DuplicateResolution { .. })
        ));
    }

    #[test]
    fn token_from_cleared_module_stays_unknown() {
        let store = SharedStateStore::new();
        let token = store.set_pending("m", 1).unwrap();
        store.clear_state("m");
        store.set_pending("m", 1).unwrap();
        assert!(matches!(
            store.resolve_pending(&token, data(1)),
            Err(Error::UnknownPendingToken { .. })
        ));
        assert_eq!(store.latest("m").status, SharedStateStatus::Pending);
    }

    #[test]
    fn cleared_data_stays_readable_through_held_arc() {
        let store = SharedStateStore::new();
        store.set_state("m", 1, data(1)).unwrap();
        let held = store.get_state("m", 1).data.unwrap();

        assert!(store.clear_state("m"));
        store.set_state("m", 2, data(2)).unwrap();

        assert_eq!(held.get_integer("a"), Ok(1));
        assert_eq!(store.get_state("m", 1).status, SharedStateStatus::None);
        assert_eq!(store.get_state("m", 2).data.unwrap().get_integer("a"), Ok(2));
    }

    #[test]
    fn clear_state_never_loses_a_racing_update() {
        for _ in 0..200 {
            let store = Arc::new(SharedStateStore::new());
            let barrier = Arc::new(Barrier::new(2));

            let writer = {
                let store = Arc::clone(&store);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    store.set_state("m", 1, data(1)).unwrap();
                })
            };
            barrier.wait();
            let cleared = store.clear_state("m");
            writer.join().unwrap();

            // Either the update landed before the clear and was removed by it, or it landed
            // after and is visible.
            let expected = if cleared {
                SharedStateStatus::None
            } else {
                SharedStateStatus::Resolved
            };
            assert_eq!(store.get_state("m", 1).status, expected);
        }
    }

    #[test]
    fn readers_race_updates_and_clears() {
        let store = Arc::new(SharedStateStore::new());
        let done = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                let done = Arc::clone(&done);
                std::thread::spawn(move || {
                    while !done.load(Ordering::Acquire) {
                        for at in [0, 50, 500] {
                            let result = store.get_state("m", at);
                            match result.status {
                                SharedStateStatus::Resolved => {
                                    let value = result.data.unwrap().get_integer("a").unwrap();
                                    assert!(value as u64 <= at);
                                }
                                SharedStateStatus::None => assert!(result.data.is_none()),
                                SharedStateStatus::Pending => unreachable!(),
                            }
                        }
                    }
                })
            })
            .collect();

        for _ in 0..20 {
            for sequence in 0..100 {
                store.set_state("m", sequence, data(sequence as i32)).unwrap();
            }
            store.clear_state("m");
        }
        done.store(true, Ordering::Release);
        for reader in readers {
            reader.join().unwrap();
        }
    }

    #[test]
    fn modules_update_concurrently() {
        let store = Arc::new(SharedStateStore::new());
        let threads: Vec<_> = (0..4)
            .map(|m| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for sequence in 0..100 {
                        store
                            .set_state(&format!("module-{m}"), sequence, data(sequence as i32))
                            .unwrap();
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        for m in 0..4 {
            let latest = store.latest(&format!("module-{m}"));
            assert_eq!(latest.data.unwrap().get_integer("a"), Ok(99));
        }
    }
}
