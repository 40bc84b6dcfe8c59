//! Sandboxed file access and persistent key-value storage.
use std::{
    collections::BTreeMap,
    fs,
    path::{Component, Path, PathBuf},
    sync::Mutex,
};

use crate::{EventHistory, Error, Result, Variant};

/// A directory that relative paths are resolved under. Paths that would leave the directory are
/// rejected with [`Error::PathEscape`].
#[derive(Debug, Clone)]
pub struct Sandbox {
    root: PathBuf,
}

impl Sandbox {
    /// Use `root` as sandbox root, creating it if needed.
    pub fn new(root: impl AsRef<Path>) -> Result<Sandbox> {
        let root = root.as_ref();
        fs::create_dir_all(root)?;
        Ok(Sandbox {
            root: root.canonicalize()?,
        })
    }

    /// Canonical path of the sandbox root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `relative` under the sandbox root.
    ///
    /// The path does not need to exist. Absolute paths, `..` components and symlinks pointing
    /// outside of the root are rejected.
    pub fn resolve(&self, relative: impl AsRef<Path>) -> Result<PathBuf> {
        let relative = relative.as_ref();
        let escape = || Error::PathEscape {
            path: relative.to_owned(),
        };

        if relative.is_absolute() {
            return Err(escape());
        }
        if relative.components().any(|component| {
            matches!(
                component,
                Component::ParentDir | Component::Prefix(_) | Component::RootDir
            )
        }) {
            return Err(escape());
        }

        let target = self.root.join(relative);

        // The deepest existing ancestor decides where symlinks actually lead.
        let existing = target
            .ancestors()
            .find(|ancestor| ancestor.exists())
            .unwrap_or(&self.root);
        let canonical = existing.canonicalize()?;
        if !canonical.starts_with(&self.root) {
            log::warn!(target: "eventhub", path:debug = relative; "rejected path escaping sandbox");
            return Err(escape());
        }

        Ok(target)
    }

    /// Resolve `relative` and create it as a directory.
    pub fn create_dir(&self, relative: impl AsRef<Path>) -> Result<PathBuf> {
        let path = self.resolve(relative)?;
        fs::create_dir_all(&path)?;
        Ok(path)
    }

    /// Open the key-value store file `name` inside the sandbox. A missing file is an empty store.
    ///
    /// ```
    /// # use eventhub::storage::{KeyValueStore, Sandbox};
    /// # let dir = tempfile::tempdir().unwrap();
    /// let sandbox = Sandbox::new(dir.path()).unwrap();
    /// let store = sandbox.key_value_store("settings.json").unwrap();
    /// assert_eq!(store.get("missing").unwrap(), None);
    /// assert!(sandbox.key_value_store("../settings.json").is_err());
    /// ```
    pub fn key_value_store(&self, name: impl AsRef<Path>) -> Result<FileKeyValueStore> {
        FileKeyValueStore::open(self.resolve(name)?)
    }

    /// Open (creating if needed) the event history database `name` inside the sandbox.
    pub fn event_history(&self, name: impl AsRef<Path>) -> Result<EventHistory> {
        EventHistory::open(self.resolve(name)?)
    }
}

/// Persistent string-keyed storage of [`Variant`] values.
pub trait KeyValueStore: Send + Sync {
    /// Value stored under `key`, if any.
    fn get(&self, key: &str) -> Result<Option<Variant>>;

    /// Store `value` under `key`, replacing a previous value.
    fn put(&self, key: &str, value: Variant) -> Result<()>;

    /// Remove `key`, returning whether it was present.
    fn delete(&self, key: &str) -> Result<bool>;

    /// All keys, sorted.
    fn keys(&self) -> Result<Vec<String>>;
}

/// [`KeyValueStore`] kept in memory and persisted to a JSON file on every change.
///
/// Opened through [`Sandbox::key_value_store`].
///
/// Writes go to a temporary file that is then renamed over the previous one, so the file on disk
/// always holds a complete snapshot.
#[derive(Debug)]
pub struct FileKeyValueStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, Variant>>,
}

impl FileKeyValueStore {
    /// Open the store at an already sandboxed `path`. A missing file is an empty store.
    pub(crate) fn open(path: impl Into<PathBuf>) -> Result<FileKeyValueStore> {
        let path = path.into();
        let entries = match fs::read(&path) {
            Ok(contents) => serde_json::from_slice(&contents)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(FileKeyValueStore {
            path,
            entries: Mutex::new(entries),
        })
    }

    fn persist(&self, entries: &BTreeMap<String, Variant>) -> Result<()> {
        let contents = serde_json::to_vec(entries)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, contents)?;
        fs::rename(&tmp, &self.path).inspect_err(|err| {
            log::error!(target: "eventhub", path:debug = self.path; "failed to persist key-value store: {err}");
        })?;
        Ok(())
    }
}

impl KeyValueStore for FileKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<Variant>> {
        let entries = self
            .entries
            .lock()
            .expect("thread holding key-value store lock should not panic");
        Ok(entries.get(key).cloned())
    }

    fn put(&self, key: &str, value: Variant) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .expect("thread holding key-value store lock should not panic");
        entries.insert(key.to_owned(), value);
        self.persist(&entries)
    }

    fn delete(&self, key: &str) -> Result<bool> {
        let mut entries = self
            .entries
            .lock()
            .expect("thread holding key-value store lock should not panic");
        if entries.remove(key).is_none() {
            return Ok(false);
        }
        self.persist(&entries)?;
        Ok(true)
    }

    fn keys(&self) -> Result<Vec<String>> {
        let entries = self
            .entries
            .lock()
            .expect("thread holding key-value store lock should not panic");
        Ok(entries.keys().cloned().collect())
    }
}
