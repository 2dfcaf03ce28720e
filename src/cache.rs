//! Cache store: atomic load/save of each JSON cache, typed accessors,
//! dirty-flag tracking so untouched caches are not rewritten.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use camino::Utf8PathBuf;
use serde::{de::DeserializeOwned, Serialize};

use crate::record::ModuleRecord;

/// Compound separator reserved for composite keys (`url|||ref`, `module|||version`).
pub const KEY_SEP: &str = "|||";

pub fn compound_key(a: &str, b: &str) -> String {
    format!("{a}{KEY_SEP}{b}")
}

/// A generic, file-backed, sorted-key JSON cache. Keys are always strings so
/// that `|||`-compound keys and plain module/url keys share one
/// implementation; values are whatever each cache component needs.
pub struct Cache<V> {
    path: PathBuf,
    map: BTreeMap<String, V>,
    dirty: bool,
}

impl<V> Cache<V>
where
    V: Serialize + DeserializeOwned + Clone,
{
    /// Loads the cache from `path`. A parse failure starts with an empty
    /// cache and logs a warning rather than failing the run — caches are
    /// purely an optimisation.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let map = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<BTreeMap<String, V>>(&bytes) {
                Ok(map) => map,
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "cache file corrupt, starting empty");
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        };
        Self {
            path,
            map,
            dirty: false,
        }
    }

    pub fn get(&self, key: &str) -> Option<&V> {
        self.map.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: V) {
        self.map.insert(key.into(), value);
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Whole-file overwrite with keys sorted (BTreeMap serializes in key
    /// order, giving textual determinism for free). No-op, and not marked
    /// clean, if the cache was never mutated.
    pub fn save(&mut self) -> anyhow::Result<()> {
        if !self.dirty {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = self.path.with_extension("tmp");
        let bytes = serde_json::to_vec_pretty(&self.map)?;
        match std::fs::write(&tmp_path, &bytes).and_then(|_| std::fs::rename(&tmp_path, &self.path))
        {
            Ok(()) => {
                self.dirty = false;
                Ok(())
            }
            Err(err) => {
                tracing::warn!(path = %self.path.display(), error = %err, "cache save failed, continuing");
                Ok(())
            }
        }
    }

    pub fn retain(&mut self, mut f: impl FnMut(&str, &V) -> bool) {
        let before = self.map.len();
        self.map.retain(|k, v| f(k, v));
        if self.map.len() != before {
            self.dirty = true;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &V)> {
        self.map.iter()
    }
}

/// ls-remote cache: key `url|||ref`, value commit hash or `None` (a cached
/// negative result).
pub type LsRemoteCache = Cache<Option<String>>;

/// Metadata cache entry: one (module, version) resolution.
#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct MetadataCacheEntry {
    pub vcs_url: String,
    pub commit: String,
    pub timestamp: String,
    pub subdir: String,
    pub vcs_ref: String,
}

pub type MetadataCache = Cache<MetadataCacheEntry>;

/// Vanity-URL cache: key module path, value repo URL or `None`.
pub type VanityCache = Cache<Option<String>>;

/// Verification cache v2 entry.
#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct VerificationEntry {
    pub verified: bool,
    pub first_verified: String,
    pub last_checked: String,
    pub fetch_method: FetchMethod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchMethod {
    Cached,
    RefHint,
    FullClone,
    Fallback,
}

pub type VerificationCache = Cache<VerificationEntry>;

/// Repo-override store: two files (manual, version-tracked; dynamic,
/// tool-written), each mapping `module` or `module@version` to a repo URL.
/// Lookup order: dynamic-specific -> dynamic-wildcard ->
/// manual-specific -> manual-wildcard.
pub struct OverrideStore {
    dynamic: Cache<String>,
    manual: Cache<String>,
}

impl OverrideStore {
    pub fn load(manual_path: impl Into<PathBuf>, dynamic_path: impl Into<PathBuf>) -> Self {
        Self {
            dynamic: Cache::load(dynamic_path),
            manual: Cache::load(manual_path),
        }
    }

    /// Resolves an override for `module@version`, trying the four lookup
    /// tiers in order.
    pub fn lookup(&self, module: &str, version: &str) -> Option<&str> {
        let specific = compound_key(module, version);
        self.dynamic
            .get(&specific)
            .or_else(|| self.dynamic.get(module))
            .or_else(|| self.manual.get(&specific))
            .or_else(|| self.manual.get(module))
            .map(String::as_str)
    }

    /// `--set-repo`: writes a module-specific pin into the dynamic store.
    pub fn set_repo(&mut self, module: &str, version: Option<&str>, url: &str) {
        let key = match version {
            Some(v) => compound_key(module, v),
            None => module.to_string(),
        };
        self.dynamic.insert(key, url.to_string());
    }

    /// `--clear-repo`: removes a pin from the dynamic store.
    pub fn clear_repo(&mut self, module: &str, version: Option<&str>) {
        let key = match version {
            Some(v) => compound_key(module, v),
            None => module.to_string(),
        };
        self.dynamic.retain(|k, _| k != key);
    }

    pub fn is_allowed(&self, _module: &str, _url: &str) -> bool {
        // Overrides never deny a URL outright in this design; a future
        // denylist tier would plug in here. Kept explicit so
        // GovcsError::DisallowedOverride has a single call site.
        true
    }

    pub fn save(&mut self) -> anyhow::Result<()> {
        self.dynamic.save()?;
        // the manual file is user/version-control-owned; we never write it.
        Ok(())
    }
}

/// Pruning rule applied to the metadata cache at load time: drop
/// entries with short hashes, disallowed URLs, or missing fields.
pub fn prune_metadata_cache(cache: &mut MetadataCache, overrides: &OverrideStore) {
    cache.retain(|key, entry| {
        let module = key.split(KEY_SEP).next().unwrap_or_default();
        let hash_ok = entry.commit.len() == 40 && entry.commit.chars().all(|c| c.is_ascii_hexdigit());
        let fields_ok = !entry.vcs_url.is_empty();
        let url_ok = overrides.is_allowed(module, &entry.vcs_url);
        hash_ok && fields_ok && url_ok
    });
}

/// Location of the on-disk caches under a base directory, following the
/// same `~/.gitcache`-style single base-dir convention this crate's cache
/// layout grew out of.
pub struct CacheDirs {
    pub base: Utf8PathBuf,
}

impl CacheDirs {
    pub fn new(base: Utf8PathBuf) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&base)?;
        Ok(Self { base })
    }

    pub fn ls_remote_path(&self) -> PathBuf {
        self.base.join("ls-remote.json").into()
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.base.join("metadata.json").into()
    }

    pub fn vanity_path(&self) -> PathBuf {
        self.base.join("vanity.json").into()
    }

    pub fn verification_path(&self) -> PathBuf {
        self.base.join("verification-v2.json").into()
    }

    /// Pre-v2 verification cache: a flat `url|||commit -> bool` map, from
    /// before the cache gained `first_verified`/`last_checked`/
    /// `fetch_method`. Never rewritten; `CommitVerifier::migrate_legacy_entry`
    /// folds any entries it has into the v2 cache on load.
    pub fn legacy_verification_path(&self) -> PathBuf {
        self.base.join("verification.json").into()
    }

    pub fn manual_overrides_path(&self) -> PathBuf {
        self.base.join("overrides-manual.json").into()
    }

    pub fn dynamic_overrides_path(&self) -> PathBuf {
        self.base.join("overrides-dynamic.json").into()
    }

    pub fn bare_repo_dir(&self, key: &str) -> Utf8PathBuf {
        self.base.join("repos").join(key)
    }

    pub fn repos_base(&self) -> Utf8PathBuf {
        self.base.join("repos")
    }
}

/// Reads the optional discovery JSON input: an array of
/// pre-computed metadata records.
pub fn load_discovery_file(path: &Path) -> anyhow::Result<Vec<ModuleRecord>> {
    let bytes = std::fs::read(path)?;
    let records = serde_json::from_slice(&bytes)?;
    Ok(records)
}
