//! Metadata resolver: `resolve(module_path, version) -> Record | null`.

use std::process::Command;

use anyhow::Result;
use chrono::Utc;

use crate::cache::{compound_key, MetadataCache, MetadataCacheEntry, OverrideStore};
use crate::gitcmd::{self, TIMEOUT_GO_LIST};
use crate::pseudo::PseudoVersionResolver;
use crate::record::{Derivation, ModuleRecord};
use crate::remote::RefResolver;
use crate::vanity::{Candidate, VanityDeriver, VanityHttpProbe};

/// One-shot VCS metadata as reported by the canonical Go tool
/// (`go list -m -json`'s `Origin` field), queried only as a last resort
/// when every derived/vanity candidate has failed to resolve a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoOrigin {
    pub vcs_url: String,
    pub hash: Option<String>,
    pub vcs_ref: Option<String>,
    pub subdir: String,
}

/// Abstracts "ask the Go tool what it knows about this module" behind a
/// trait for the same reason `VanityHttpProbe` is one: so the last-resort
/// fallback is testable without actually invoking `go`.
pub trait GoToolProbe {
    fn origin(&self, module_path: &str, version: &str) -> Result<Option<GoOrigin>>;
}

/// Shells out to `go list -m -json <module>@<version>` and reads its
/// `Origin` field (present on module-proxy-backed Go toolchains since 1.21).
pub struct GoListProbe {
    goproxy: String,
    gomodcache: Option<camino::Utf8PathBuf>,
}

impl GoListProbe {
    pub fn new(goproxy: String, gomodcache: Option<camino::Utf8PathBuf>) -> Self {
        Self { goproxy, gomodcache }
    }
}

impl GoToolProbe for GoListProbe {
    fn origin(&self, module_path: &str, version: &str) -> Result<Option<GoOrigin>> {
        let mut cmd: Command = gitcmd::go_cmd(&self.goproxy, self.gomodcache.as_deref());
        cmd.args(["list", "-m", "-json", &format!("{module_path}@{version}")]);
        let output = match gitcmd::run_captured(cmd, TIMEOUT_GO_LIST)? {
            Some(output) if output.status.success() => output,
            _ => return Ok(None),
        };
        Ok(parse_go_list_origin(&output.stdout))
    }
}

/// Parses the `Origin` object out of `go list -m -json`'s module record.
fn parse_go_list_origin(stdout: &[u8]) -> Option<GoOrigin> {
    let value: serde_json::Value = serde_json::from_slice(stdout).ok()?;
    let origin = value.get("Origin")?;
    let vcs_url = origin.get("URL")?.as_str()?.to_string();
    let hash = origin.get("Hash").and_then(|v| v.as_str()).map(str::to_string);
    let vcs_ref = origin.get("Ref").and_then(|v| v.as_str()).map(str::to_string);
    let subdir = origin
        .get("Subdir")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_default();
    Some(GoOrigin {
        vcs_url,
        hash,
        vcs_ref,
        subdir,
    })
}

/// A parsed Go pseudo-version: `vX.Y.Z-YYYYMMDDHHMMSS-<12hex>` (possibly
/// with a `0.` infix and/or a `+incompatible` suffix).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PseudoVersion {
    pub timestamp: String,
    pub short_hash: String,
}

/// Parses a version string as a pseudo-version, if it is one.
pub fn parse_pseudo_version(version: &str) -> Option<PseudoVersion> {
    let clean = version.trim_end_matches("+incompatible");
    let (_, rest) = clean.rsplit_once('-')?;
    if rest.len() != 12 || !rest.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let short_hash = rest.to_string();
    let before_hash = &clean[..clean.len() - rest.len() - 1];
    let (_, ts_part) = before_hash.rsplit_once('-')?;
    let ts_part = ts_part.strip_prefix("0.").unwrap_or(ts_part);
    if ts_part.len() != 14 || !ts_part.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(PseudoVersion {
        timestamp: ts_part.to_string(),
        short_hash,
    })
}

/// Reason a module resolution failed outright.
#[derive(Debug, Clone)]
pub struct SkippedModule {
    pub module_path: String,
    pub version: String,
    pub reason: String,
}

pub struct MetadataResolver<'a> {
    cache: &'a mut MetadataCache,
    overrides: &'a OverrideStore,
    vanity_cache: &'a mut crate::cache::VanityCache,
    pseudo: &'a PseudoVersionResolver,
    probe: &'a dyn VanityHttpProbe,
    go_probe: Option<&'a dyn GoToolProbe>,
}

impl<'a> MetadataResolver<'a> {
    pub fn new(
        cache: &'a mut MetadataCache,
        overrides: &'a OverrideStore,
        vanity_cache: &'a mut crate::cache::VanityCache,
        pseudo: &'a PseudoVersionResolver,
        probe: &'a dyn VanityHttpProbe,
    ) -> Self {
        Self {
            cache,
            overrides,
            vanity_cache,
            pseudo,
            probe,
            go_probe: None,
        }
    }

    /// If every derived/vanity candidate fails, ask the canonical Go tool
    /// directly for the module's VCS metadata and, if it answers, add that
    /// URL to the candidate list and resolve once more.
    pub fn with_go_probe(mut self, go_probe: &'a dyn GoToolProbe) -> Self {
        self.go_probe = Some(go_probe);
        self
    }

    /// Trusts a cached metadata entry only if: the commit is a full hex-40
    /// hash, it's consistent with any pseudo-version short-hash suffix, its
    /// URL is still allowed by the override store, and — for tagged
    /// versions with a ref hint — the ref still resolves to that commit.
    fn cached_entry_is_trusted(
        &self,
        entry: &MetadataCacheEntry,
        resolver: &mut dyn RefResolver,
        pseudo_version: Option<&PseudoVersion>,
    ) -> bool {
        if entry.commit.len() != 40 || !entry.commit.chars().all(|c| c.is_ascii_hexdigit()) {
            return false;
        }
        if let Some(pv) = pseudo_version {
            if !entry.commit.starts_with(&pv.short_hash) {
                return false;
            }
        }
        if !self.overrides.is_allowed("", &entry.vcs_url) {
            return false;
        }
        if pseudo_version.is_none() && !entry.vcs_ref.is_empty() {
            match resolver.lookup(&entry.vcs_url, &entry.vcs_ref) {
                Ok(Some(resolved)) => resolved == entry.commit,
                _ => false,
            }
        } else {
            true
        }
    }

    fn try_candidate(
        &self,
        candidate: &Candidate,
        module_path: &str,
        version: &str,
        pseudo_version: Option<&PseudoVersion>,
        resolver: &mut dyn RefResolver,
    ) -> Result<Option<(String, String)>> {
        if let Some(pv) = pseudo_version {
            if let Some(hash) = resolver.lookup(&candidate.url, &pv.short_hash)? {
                return Ok(Some((hash, String::new())));
            }
            if let Some(full) =
                self.pseudo
                    .expand(&candidate.url, module_path, &pv.timestamp, &pv.short_hash)?
            {
                return Ok(Some((full, String::new())));
            }
            return Ok(None);
        }

        let tag_ref = format!("refs/tags/{version}");
        if let Some(hash) = resolver.lookup(&candidate.url, &tag_ref)? {
            return Ok(Some((hash, tag_ref)));
        }
        if let Some(hash) = resolver.lookup(&candidate.url, version)? {
            return Ok(Some((hash, tag_ref)));
        }
        Ok(None)
    }

    /// `resolve(module_path, version) -> Record | null`.
    pub fn resolve(
        &mut self,
        module_path: &str,
        version: &str,
        resolver: &mut dyn RefResolver,
    ) -> Result<std::result::Result<ModuleRecord, SkippedModule>> {
        let pseudo_version = parse_pseudo_version(version);
        let cache_key = compound_key(module_path, version);

        if let Some(entry) = self.cache.get(&cache_key).cloned() {
            if self.cached_entry_is_trusted(&entry, resolver, pseudo_version.as_ref()) {
                return Ok(Ok(ModuleRecord {
                    module_path: module_path.to_string(),
                    version: version.to_string(),
                    vcs_url: entry.vcs_url,
                    vcs_hash: entry.commit,
                    vcs_ref: entry.vcs_ref,
                    subdir: entry.subdir,
                    timestamp: entry.timestamp,
                    branch: None,
                    derivation: Derivation::Proxy,
                }));
            }
        }

        let mut candidates = {
            let mut deriver = VanityDeriver::new(self.vanity_cache, self.overrides, self.probe);
            deriver.derive(module_path, version)
        };

        // Pre-seed with the straightforward mapping for three-segment paths.
        let parts: Vec<&str> = module_path.split('/').collect();
        if parts.len() == 3 {
            let straightforward = format!("https://{}", parts.join("/"));
            if !candidates.iter().any(|c| c.url == straightforward) {
                candidates.insert(
                    0,
                    Candidate {
                        url: straightforward,
                        subdir: String::new(),
                    },
                );
            }
        }

        if let Some(found) = self.try_candidates(
            &candidates,
            module_path,
            version,
            pseudo_version.as_ref(),
            resolver,
            &cache_key,
            Derivation::Derived,
        ) {
            return Ok(Ok(found));
        }

        // Step 4: every derived/vanity candidate failed outright. Ask the
        // canonical Go tool for this module's VCS metadata one time; if it
        // answers, fold that single candidate in and try once more.
        if let Some(go_probe) = self.go_probe {
            match go_probe.origin(module_path, version) {
                Ok(Some(origin)) => {
                    let go_candidate = Candidate {
                        url: origin.vcs_url.clone(),
                        subdir: origin.subdir.clone(),
                    };
                    if let Some(hash) = origin.hash {
                        // The Go tool already resolved the commit; trust it
                        // directly rather than re-deriving a ref/tag guess.
                        let vcs_ref = origin.vcs_ref.unwrap_or_default();
                        let timestamp = pseudo_version
                            .as_ref()
                            .map(|pv| pseudo_timestamp_to_rfc3339(&pv.timestamp))
                            .unwrap_or_else(|| "1970-01-01T00:00:00Z".to_string());
                        let entry = MetadataCacheEntry {
                            vcs_url: go_candidate.url.clone(),
                            commit: hash.clone(),
                            timestamp: timestamp.clone(),
                            subdir: go_candidate.subdir.clone(),
                            vcs_ref: vcs_ref.clone(),
                        };
                        self.cache.insert(cache_key.clone(), entry);
                        return Ok(Ok(ModuleRecord {
                            module_path: module_path.to_string(),
                            version: version.to_string(),
                            vcs_url: go_candidate.url,
                            vcs_hash: hash,
                            vcs_ref,
                            subdir: go_candidate.subdir,
                            timestamp,
                            branch: None,
                            derivation: Derivation::Proxy,
                        }));
                    }
                    if let Some(found) = self.try_candidates(
                        &[go_candidate],
                        module_path,
                        version,
                        pseudo_version.as_ref(),
                        resolver,
                        &cache_key,
                        Derivation::Proxy,
                    ) {
                        return Ok(Ok(found));
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(module = module_path, error = %err, "go tool metadata query failed");
                }
            }
        }

        Ok(Err(SkippedModule {
            module_path: module_path.to_string(),
            version: version.to_string(),
            reason: "no candidate repository resolved a commit".to_string(),
        }))
    }

    /// Tries each candidate in order, caching and returning the first one
    /// that resolves a commit.
    #[allow(clippy::too_many_arguments)]
    fn try_candidates(
        &mut self,
        candidates: &[Candidate],
        module_path: &str,
        version: &str,
        pseudo_version: Option<&PseudoVersion>,
        resolver: &mut dyn RefResolver,
        cache_key: &str,
        derivation: Derivation,
    ) -> Option<ModuleRecord> {
        for candidate in candidates {
            match self.try_candidate(candidate, module_path, version, pseudo_version, resolver) {
                Ok(Some((hash, vcs_ref))) => {
                    let timestamp = pseudo_version
                        .map(|pv| pseudo_timestamp_to_rfc3339(&pv.timestamp))
                        .unwrap_or_else(|| "1970-01-01T00:00:00Z".to_string());

                    let entry = MetadataCacheEntry {
                        vcs_url: candidate.url.clone(),
                        commit: hash.clone(),
                        timestamp: timestamp.clone(),
                        subdir: candidate.subdir.clone(),
                        vcs_ref: vcs_ref.clone(),
                    };
                    self.cache.insert(cache_key.to_string(), entry);

                    return Some(ModuleRecord {
                        module_path: module_path.to_string(),
                        version: version.to_string(),
                        vcs_url: candidate.url.clone(),
                        vcs_hash: hash,
                        vcs_ref,
                        subdir: candidate.subdir.clone(),
                        timestamp,
                        branch: None,
                        derivation,
                    });
                }
                Ok(None) => continue,
                Err(err) => {
                    tracing::warn!(module = module_path, url = %candidate.url, error = %err, "candidate resolution failed");
                    continue;
                }
            }
        }
        None
    }
}

fn pseudo_timestamp_to_rfc3339(ts: &str) -> String {
    crate::pseudo::parse_pseudo_timestamp(ts)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|_| Utc::now().to_rfc3339())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_pseudo_version() {
        let pv = parse_pseudo_version("v0.0.0-20200815063812-42c35b437635").unwrap();
        assert_eq!(pv.timestamp, "20200815063812");
        assert_eq!(pv.short_hash, "42c35b437635");
    }

    #[test]
    fn parses_pseudo_version_with_zero_prefix() {
        let pv = parse_pseudo_version("v1.2.4-0.20200815063812-42c35b437635").unwrap();
        assert_eq!(pv.timestamp, "20200815063812");
        assert_eq!(pv.short_hash, "42c35b437635");
    }

    #[test]
    fn parses_incompatible_pseudo_version() {
        let pv = parse_pseudo_version("v2.0.0-20200815063812-42c35b437635+incompatible").unwrap();
        assert_eq!(pv.short_hash, "42c35b437635");
    }

    #[test]
    fn tagged_version_is_not_a_pseudo_version() {
        assert!(parse_pseudo_version("v1.8.0").is_none());
    }

    #[test]
    fn parses_go_list_origin_with_hash_and_ref() {
        let stdout = br#"{
            "Path": "github.com/example/mod",
            "Version": "v1.2.3",
            "Origin": {
                "VCS": "git",
                "URL": "https://github.com/example/mod",
                "Ref": "refs/tags/v1.2.3",
                "Hash": "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"
            }
        }"#;
        let origin = parse_go_list_origin(stdout).unwrap();
        assert_eq!(origin.vcs_url, "https://github.com/example/mod");
        assert_eq!(origin.hash.as_deref(), Some("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"));
        assert_eq!(origin.vcs_ref.as_deref(), Some("refs/tags/v1.2.3"));
        assert_eq!(origin.subdir, "");
    }

    #[test]
    fn parses_go_list_origin_with_subdir_and_no_hash() {
        let stdout = br#"{
            "Origin": {
                "VCS": "git",
                "URL": "https://github.com/example/monorepo",
                "Subdir": "server/v3"
            }
        }"#;
        let origin = parse_go_list_origin(stdout).unwrap();
        assert_eq!(origin.subdir, "server/v3");
        assert!(origin.hash.is_none());
    }

    #[test]
    fn missing_origin_field_yields_none() {
        let stdout = br#"{"Path": "github.com/example/mod", "Version": "v1.2.3"}"#;
        assert!(parse_go_list_origin(stdout).is_none());
    }

    struct FixedGoProbe(Option<GoOrigin>);

    impl GoToolProbe for FixedGoProbe {
        fn origin(&self, _module_path: &str, _version: &str) -> Result<Option<GoOrigin>> {
            Ok(self.0.clone())
        }
    }

    struct NeverResolves;

    impl RefResolver for NeverResolves {
        fn lookup(&mut self, _url: &str, _ref_spec: &str) -> Result<Option<String>> {
            Ok(None)
        }
    }

    struct NoHttpProbe;

    impl VanityHttpProbe for NoHttpProbe {
        fn fetch_go_import(&self, _module_path: &str) -> Result<Option<String>> {
            Ok(None)
        }
    }

    #[test]
    fn falls_back_to_go_tool_when_all_candidates_fail() {
        let mut cache = MetadataCache::load("/nonexistent/metadata.json");
        let mut vanity_cache = crate::cache::VanityCache::load("/nonexistent/vanity.json");
        let overrides = OverrideStore::load("/nonexistent/manual.json", "/nonexistent/dynamic.json");
        let pseudo = PseudoVersionResolver::new(camino::Utf8PathBuf::from("/nonexistent/repos"));
        let http_probe = NoHttpProbe;
        let go_probe = FixedGoProbe(Some(GoOrigin {
            vcs_url: "https://github.com/example/mod".to_string(),
            hash: Some("b".repeat(40)),
            vcs_ref: Some("refs/tags/v1.0.0".to_string()),
            subdir: String::new(),
        }));

        let mut resolver = NeverResolves;
        let mut meta = MetadataResolver::new(&mut cache, &overrides, &mut vanity_cache, &pseudo, &http_probe)
            .with_go_probe(&go_probe);

        let record = meta
            .resolve("an.unknown.module/path/x", "v1.0.0", &mut resolver)
            .unwrap()
            .unwrap();
        assert_eq!(record.vcs_url, "https://github.com/example/mod");
        assert_eq!(record.vcs_hash, "b".repeat(40));
        assert_eq!(record.derivation, Derivation::Proxy);
    }
}
