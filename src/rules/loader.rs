use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::{
    archive,
    network::{HttpClient, HttpRequest, RetryPolicy},
    storage::{KeyValueStore, Sandbox},
    Error, EventData, Result,
};

use super::RuleSet;

/// Name of the rules document, either downloaded directly or inside a bundle.
pub const RULES_FILE_NAME: &str = "rules.json";

const CACHE_DIR: &str = "rules";
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ETAG: &str = "etag";
const LAST_MODIFIED: &str = "lastmodified";

/// Downloads rule sets and keeps the last downloaded copy of each URL in a sandboxed cache.
///
/// A download is either a plain rules document or a gzip tarball with [`RULES_FILE_NAME`] at its
/// root. Validators (`ETag`, `Last-Modified`) are kept in a [`KeyValueStore`] so unchanged rules
/// are not downloaded again.
pub struct RulesLoader {
    client: Arc<dyn HttpClient>,
    retry: RetryPolicy,
    store: Arc<dyn KeyValueStore>,
    sandbox: Sandbox,
}

impl RulesLoader {
    /// Create a loader caching downloads in `store` and extracting archives into `sandbox`.
    pub fn new(
        client: Arc<dyn HttpClient>,
        store: Arc<dyn KeyValueStore>,
        sandbox: Sandbox,
    ) -> RulesLoader {
        RulesLoader {
            client,
            retry: RetryPolicy::default(),
            store,
            sandbox,
        }
    }

    /// Update the retry policy of downloads.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> RulesLoader {
        self.retry = retry;
        self
    }

    /// Download rules from `url`.
    ///
    /// When the server reports the rules unchanged (`304`), the cached copy is returned.
    pub fn load(&self, url: &str) -> Result<RuleSet> {
        let key = cache_key(url);
        let cached = self.cached_rules_path(&key)?;

        let mut request = HttpRequest::get(url);
        if cached.is_some() {
            if let Some(validators) = self.validators(&key)? {
                if let Ok(etag) = validators.get_string(ETAG) {
                    request = request.with_header("If-None-Match", etag);
                }
                if let Ok(last_modified) = validators.get_string(LAST_MODIFIED) {
                    request = request.with_header("If-Modified-Since", last_modified);
                }
            }
        }

        log::debug!(target: "eventhub", url; "fetching rules");
        let response = self.retry.fetch(self.client.as_ref(), &request)?;

        if response.status == 304 {
            if let Some(path) = cached {
                log::debug!(target: "eventhub", url; "rules not modified, using cached copy");
                return read_rules(&path);
            }
        }
        if !response.is_success() {
            log::warn!(target: "eventhub", url, status = response.status; "failed to fetch rules");
            return Err(Error::HttpStatus(response.status));
        }

        let rules = if response.body.starts_with(&GZIP_MAGIC) {
            read_rules(&self.store_bundle(&key, &response.body)?)?
        } else {
            // Parsed before caching so a malformed document does not replace a good copy.
            let rules = RuleSet::from_json(&response.body)?;
            self.store_document(&key, &response.body)?;
            rules
        };

        let mut validators = EventData::new();
        if let Some(etag) = response.header("ETag") {
            validators.insert(ETAG, etag);
        }
        if let Some(last_modified) = response.header("Last-Modified") {
            validators.insert(LAST_MODIFIED, last_modified);
        }
        self.store.put(&key, validators.into_variant())?;

        log::debug!(target: "eventhub", url, rules = rules.len(); "loaded rules");
        Ok(rules)
    }

    /// Rules last downloaded from `url`, if any.
    pub fn load_cached(&self, url: &str) -> Result<Option<RuleSet>> {
        match self.cached_rules_path(&cache_key(url))? {
            Some(path) => read_rules(&path).map(Some),
            None => Ok(None),
        }
    }

    fn cached_rules_path(&self, key: &str) -> Result<Option<PathBuf>> {
        let path = self
            .sandbox
            .resolve(Path::new(CACHE_DIR).join(key).join(RULES_FILE_NAME))?;
        Ok(path.is_file().then_some(path))
    }

    fn validators(&self, key: &str) -> Result<Option<EventData>> {
        Ok(self
            .store
            .get(key)?
            .and_then(|value| EventData::try_from(value).ok()))
    }

    fn store_document(&self, key: &str, body: &[u8]) -> Result<()> {
        let dir = self.sandbox.create_dir(Path::new(CACHE_DIR).join(key))?;
        let tmp = dir.join(format!("{RULES_FILE_NAME}.tmp"));
        fs::write(&tmp, body)?;
        fs::rename(&tmp, dir.join(RULES_FILE_NAME))?;
        Ok(())
    }

    /// Extract into a staging directory and swap it in, so a bad bundle leaves the previous
    /// cached copy in place.
    fn store_bundle(&self, key: &str, body: &[u8]) -> Result<PathBuf> {
        let cache = self.sandbox.create_dir(CACHE_DIR)?;
        let archive_path = self.sandbox.resolve(Path::new(CACHE_DIR).join(format!("{key}.tar.gz")))?;
        let staging = self.sandbox.resolve(Path::new(CACHE_DIR).join(format!("{key}.staging")))?;
        let target = cache.join(key);

        fs::write(&archive_path, body)?;
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        let extracted = archive::extract(&archive_path, &staging);
        fs::remove_file(&archive_path)?;
        extracted?;

        if !staging.join(RULES_FILE_NAME).is_file() {
            fs::remove_dir_all(&staging)?;
            return Err(Error::MalformedDefinition(format!(
                "rules bundle has no {RULES_FILE_NAME}"
            )));
        }

        if target.exists() {
            fs::remove_dir_all(&target)?;
        }
        fs::rename(&staging, &target)?;
        Ok(target.join(RULES_FILE_NAME))
    }
}

/// Cache entries are named after the MD5 of the URL.
fn cache_key(url: &str) -> String {
    format!("{:x}", md5::compute(url))
}

fn read_rules(path: &Path) -> Result<RuleSet> {
    RuleSet::from_json(&fs::read(path)?)
}
