//! Commit verifier: the densest subsystem. Verifies a commit exists
//! and is reachable from a named ref, detects dangling/orphaned/moved-tag
//! cases, and auto-corrects where possible.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use camino::Utf8PathBuf;
use chrono::Utc;

use crate::cache::{compound_key, FetchMethod, VerificationCache, VerificationEntry};
use crate::gitcmd::{self, TIMEOUT_FETCH, TIMEOUT_LOG, TIMEOUT_UNSHALLOW};
use crate::pseudo::stable_repo_key;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Correction {
    pub url: String,
    pub ref_spec: String,
    pub old_hash: String,
    pub new_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fallback {
    pub url: String,
    pub original_hash: String,
    pub fallback_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyOutcome {
    pub verified: bool,
    pub branch: Option<String>,
    pub correction: Option<Correction>,
    pub fallback: Option<Fallback>,
}

#[derive(Default)]
struct RepoState {
    has_full_history: bool,
}

/// §5: "the verification cache is force-flushed every 50 modules as an
/// extra durability hedge" — independent of whatever periodic save cadence
/// the driver uses for the other caches.
const FLUSH_INTERVAL: usize = 50;

/// Per-repository state guarded by a per-URL mutex, so git operations on a
/// given bare repo never race, while distinct URLs proceed fully in
/// parallel.
pub struct CommitVerifier {
    bare_clone_base: Utf8PathBuf,
    repo_mutexes: Mutex<HashMap<String, Arc<Mutex<RepoState>>>>,
    cache: Mutex<VerificationCache>,
    max_age: chrono::Duration,
    verified_since_flush: AtomicUsize,
}

impl CommitVerifier {
    pub fn new(bare_clone_base: Utf8PathBuf, cache: VerificationCache, max_age_days: i64) -> Self {
        Self {
            bare_clone_base,
            repo_mutexes: Mutex::new(HashMap::new()),
            cache: Mutex::new(cache),
            max_age: chrono::Duration::days(max_age_days),
            verified_since_flush: AtomicUsize::new(0),
        }
    }

    pub fn into_cache(self) -> VerificationCache {
        self.cache.into_inner().unwrap()
    }

    /// Writes the verification cache to disk without consuming `self`, so a
    /// long parallel run can be flushed mid-flight (§5) and still be saved
    /// again (via `into_cache`) once it's done.
    pub fn flush_cache(&self) -> Result<()> {
        self.cache.lock().unwrap().save()
    }

    fn bare_path(&self, url: &str) -> PathBuf {
        self.bare_clone_base.join(stable_repo_key(url)).into()
    }

    /// Creates the per-URL mutex on first sight; the create-if-absent step
    /// runs fully inside the registry lock, replacing the reentrant outer
    /// lock the original design used.
    fn repo_lock(&self, url: &str) -> Arc<Mutex<RepoState>> {
        let mut registry = self.repo_mutexes.lock().unwrap();
        registry
            .entry(url.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(RepoState::default())))
            .clone()
    }

    fn cache_lookup(&self, url: &str, commit: &str) -> Option<VerificationEntry> {
        self.cache.lock().unwrap().get(&compound_key(url, commit)).cloned()
    }

    fn cache_store(&self, url: &str, commit: &str, entry: VerificationEntry) {
        self.cache.lock().unwrap().insert(compound_key(url, commit), entry);
        let count = self.verified_since_flush.fetch_add(1, Ordering::SeqCst) + 1;
        if count % FLUSH_INTERVAL == 0 {
            if let Err(err) = self.flush_cache() {
                tracing::warn!(error = %err, "periodic verification-cache flush failed");
            }
        }
    }

    fn init_or_update_remote(&self, bare_repo: &Path, url: &str) -> Result<()> {
        if !bare_repo.join("HEAD").exists() {
            std::fs::create_dir_all(bare_repo)?;
            let mut cmd = gitcmd::git_in(bare_repo);
            cmd.args(["init", "--bare", "--quiet"]);
            gitcmd::run_captured(cmd, Duration::from_secs(10))?;
            let mut cmd = gitcmd::git_in(bare_repo);
            cmd.args(["remote", "add", "origin", url]);
            gitcmd::run_captured(cmd, Duration::from_secs(10))?;
        } else {
            let mut cmd = gitcmd::git_in(bare_repo);
            cmd.args(["remote", "set-url", "origin", url]);
            gitcmd::run_captured(cmd, Duration::from_secs(10))?;
        }
        Ok(())
    }

    fn shallow_fetch(&self, bare_repo: &Path, spec: &str) -> Result<bool> {
        let mut cmd = gitcmd::git_in(bare_repo);
        cmd.args(["fetch", "--depth", "1", "--quiet", "origin", spec]);
        match gitcmd::run_captured(cmd, TIMEOUT_FETCH)? {
            Some(output) if output.status.success() => Ok(true),
            Some(_) => {
                gitcmd::clear_stale_locks(bare_repo);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    fn resolve_fetch_head(&self, bare_repo: &Path) -> Result<Option<String>> {
        let mut cmd = gitcmd::git_in(bare_repo);
        cmd.args(["rev-parse", "FETCH_HEAD"]);
        let output = gitcmd::run_captured(cmd, Duration::from_secs(10))?;
        Ok(output
            .filter(|o| o.status.success())
            .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
            .filter(|s| s.len() == 40))
    }

    fn unshallow_or_fetch(&self, bare_repo: &Path, state: &mut RepoState) -> Result<bool> {
        let mut cmd = gitcmd::git_in(bare_repo);
        if state.has_full_history {
            cmd.args(["fetch", "--quiet", "origin", "+refs/heads/*:refs/remotes/origin/*"]);
            let ok = gitcmd::run_captured(cmd, TIMEOUT_FETCH)?
                .map(|o| o.status.success())
                .unwrap_or(false);
            Ok(ok)
        } else {
            cmd.args(["fetch", "--unshallow", "--quiet", "origin", "+refs/heads/*:refs/remotes/origin/*"]);
            let ok = gitcmd::run_captured(cmd, TIMEOUT_UNSHALLOW)?
                .map(|o| o.status.success())
                .unwrap_or(false);
            if ok {
                state.has_full_history = true;
            }
            Ok(ok)
        }
    }

    fn branches_containing(&self, bare_repo: &Path, commit: &str) -> Result<Vec<String>> {
        let mut cmd = gitcmd::git_in(bare_repo);
        cmd.args(["for-each-ref", "--contains", commit, "refs/remotes/origin/", "--format=%(refname)"]);
        let output = gitcmd::run_captured(cmd, TIMEOUT_LOG)?;
        let stdout = output
            .filter(|o| o.status.success())
            .map(|o| String::from_utf8_lossy(&o.stdout).into_owned())
            .unwrap_or_default();
        Ok(parse_for_each_ref_output(&stdout))
    }

    fn default_branch(&self, url: &str) -> Result<Option<String>> {
        let mut cmd = gitcmd::git();
        cmd.args(["ls-remote", "--symref", url, "HEAD"]);
        let output = gitcmd::run_captured(cmd, crate::gitcmd::TIMEOUT_LS_REMOTE)?;
        Ok(output
            .filter(|o| o.status.success())
            .and_then(|o| parse_symref_head(&String::from_utf8_lossy(&o.stdout))))
    }

    fn fallback_commit(
        &self,
        bare_repo: &Path,
        branch: &str,
        until_ts: Option<&str>,
    ) -> Result<Option<String>> {
        let mut cmd = gitcmd::git_in(bare_repo);
        cmd.args(["log", "-1", "--format=%H"]);
        if let Some(ts) = until_ts {
            cmd.arg("--until").arg(ts);
        }
        cmd.arg(format!("refs/remotes/origin/{branch}"));
        let output = gitcmd::run_captured(cmd, TIMEOUT_LOG)?;
        Ok(output
            .filter(|o| o.status.success())
            .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
            .filter(|s| s.len() == 40))
    }

    fn is_ancestor(&self, bare_repo: &Path, commit: &str) -> Result<bool> {
        let mut cmd = gitcmd::git_in(bare_repo);
        cmd.args(["merge-base", "--is-ancestor", commit, "FETCH_HEAD"]);
        let output = gitcmd::run_captured(cmd, Duration::from_secs(10))?;
        Ok(output.map(|o| o.status.success()).unwrap_or(false))
    }

    /// `verify(url, commit, ref_hint?, version?, timestamp?) -> bool`. May
    /// emit a `Correction` (moved tag) or a `Fallback` (commit missing
    /// entirely) as a side effect of `VerifyOutcome`.
    pub fn verify(
        &self,
        url: &str,
        commit: &str,
        ref_hint: Option<&str>,
        version: Option<&str>,
        timestamp: Option<&str>,
    ) -> Result<VerifyOutcome> {
        let now = Utc::now();

        if let Some(entry) = self.cache_lookup(url, commit) {
            if entry.verified {
                let last_checked = chrono::DateTime::parse_from_rfc3339(&entry.last_checked)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or(now);
                if now - last_checked < self.max_age {
                    let branch = if ref_hint.is_none() {
                        self.detect_branch(url, commit)?
                    } else {
                        None
                    };
                    return Ok(VerifyOutcome {
                        verified: true,
                        branch,
                        correction: None,
                        fallback: None,
                    });
                }
            }
        }

        let lock = self.repo_lock(url);
        let mut state = lock.lock().unwrap();

        let bare_repo = self.bare_path(url);
        self.init_or_update_remote(&bare_repo, url)?;

        let mut outcome = VerifyOutcome {
            verified: false,
            branch: None,
            correction: None,
            fallback: None,
        };

        if let Some(ref_spec) = ref_hint {
            self.shallow_fetch(&bare_repo, ref_spec)?;
            let commit_fetched = self.shallow_fetch(&bare_repo, commit)?;

            if !commit_fetched {
                // Ref resolves but the requested commit doesn't fetch: the
                // tag may have moved (force-push).
                self.shallow_fetch(&bare_repo, ref_spec)?;
                if let Some(resolved) = self.resolve_fetch_head(&bare_repo)? {
                    if resolved != commit {
                        outcome.correction = Some(Correction {
                            url: url.to_string(),
                            ref_spec: ref_spec.to_string(),
                            old_hash: commit.to_string(),
                            new_hash: resolved.clone(),
                        });
                        outcome.verified = true;
                        self.cache_store(
                            url,
                            &resolved,
                            VerificationEntry {
                                verified: true,
                                first_verified: now.to_rfc3339(),
                                last_checked: now.to_rfc3339(),
                                fetch_method: FetchMethod::RefHint,
                            },
                        );
                        return Ok(outcome);
                    }
                }
            } else {
                outcome.verified = true;
                let _ = self.is_ancestor(&bare_repo, commit);
                self.cache_store(
                    url,
                    commit,
                    VerificationEntry {
                        verified: true,
                        first_verified: now.to_rfc3339(),
                        last_checked: now.to_rfc3339(),
                        fetch_method: FetchMethod::RefHint,
                    },
                );
                return Ok(outcome);
            }
        } else {
            let fetched = self.unshallow_or_fetch(&bare_repo, &mut state)?;
            if fetched {
                let branches = self.branches_containing(&bare_repo, commit)?;
                let chosen = choose_preferred_branch(&branches);
                if let Some(branch) = chosen {
                    outcome.verified = true;
                    outcome.branch = Some(branch);
                    self.cache_store(
                        url,
                        commit,
                        VerificationEntry {
                            verified: true,
                            first_verified: now.to_rfc3339(),
                            last_checked: now.to_rfc3339(),
                            fetch_method: FetchMethod::FullClone,
                        },
                    );
                    return Ok(outcome);
                }
            }
        }

        // Commit absent: look for a fallback.
        let until_ts = version
            .and_then(crate::metadata::parse_pseudo_version)
            .map(|pv| pv.timestamp)
            .or_else(|| timestamp.map(str::to_string));

        if let Some(default_branch) = self.default_branch(url)? {
            if let Some(fallback_hash) =
                self.fallback_commit(&bare_repo, &default_branch, until_ts.as_deref())?
            {
                outcome.verified = true;
                outcome.branch = Some(default_branch);
                outcome.fallback = Some(Fallback {
                    url: url.to_string(),
                    original_hash: commit.to_string(),
                    fallback_hash: fallback_hash.clone(),
                });
                self.cache_store(
                    url,
                    &fallback_hash,
                    VerificationEntry {
                        verified: true,
                        first_verified: now.to_rfc3339(),
                        last_checked: now.to_rfc3339(),
                        fetch_method: FetchMethod::Fallback,
                    },
                );
                return Ok(outcome);
            }
        }

        gitcmd::clear_stale_locks(&bare_repo);
        Ok(outcome)
    }

    fn detect_branch(&self, url: &str, commit: &str) -> Result<Option<String>> {
        let bare_repo = self.bare_path(url);
        if !bare_repo.join("HEAD").exists() {
            return Ok(None);
        }
        let branches = self.branches_containing(&bare_repo, commit)?;
        Ok(choose_preferred_branch(&branches))
    }

    /// Cheap pre-check using only `ls-remote`: does *any* ref currently
    /// point at this commit?
    pub fn is_bitbake_fetchable(&self, url: &str, commit: &str) -> Result<bool> {
        let mut cmd = gitcmd::git();
        cmd.args(["ls-remote", url]);
        let output = gitcmd::run_captured(cmd, crate::gitcmd::TIMEOUT_LS_REMOTE)?;
        let stdout = output
            .filter(|o| o.status.success())
            .map(|o| String::from_utf8_lossy(&o.stdout).into_owned())
            .unwrap_or_default();
        Ok(stdout.lines().any(|line| line.starts_with(commit)))
    }

    /// Migrates a legacy boolean verification-cache entry to v2 on first
    /// sight, with `fetch_method = "cached"`. A no-op once the v2 cache
    /// already has an entry for `(url, commit)`, so a legacy file left lying
    /// around never clobbers a fresher v2 result.
    pub fn migrate_legacy_entry(&self, url: &str, commit: &str, verified: bool) {
        if self.cache_lookup(url, commit).is_some() {
            return;
        }
        let now = Utc::now().to_rfc3339();
        self.cache_store(
            url,
            commit,
            VerificationEntry {
                verified,
                first_verified: now.clone(),
                last_checked: now,
                fetch_method: FetchMethod::Cached,
            },
        );
    }
}

/// Parses `for-each-ref --format=%(refname)` output into bare branch names.
pub fn parse_for_each_ref_output(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| line.trim().strip_prefix("refs/remotes/origin/"))
        .map(str::to_string)
        .collect()
}

/// Chooses the preferred branch: `main`, then `master`, then the first
/// result.
pub fn choose_preferred_branch(branches: &[String]) -> Option<String> {
    if branches.iter().any(|b| b == "main") {
        return Some("main".to_string());
    }
    if branches.iter().any(|b| b == "master") {
        return Some("master".to_string());
    }
    branches.first().cloned()
}

/// Parses `git ls-remote --symref <url> HEAD` output to find the default
/// branch name, e.g. `ref: refs/heads/main\tHEAD`.
pub fn parse_symref_head(stdout: &str) -> Option<String> {
    for line in stdout.lines() {
        if let Some(rest) = line.strip_prefix("ref: ") {
            let ref_name = rest.split('\t').next()?;
            return ref_name.strip_prefix("refs/heads/").map(str::to_string);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn choose_prefers_main_over_master() {
        let branches = vec!["develop".to_string(), "master".to_string(), "main".to_string()];
        assert_eq!(choose_preferred_branch(&branches), Some("main".to_string()));
    }

    #[test]
    fn choose_falls_back_to_master() {
        let branches = vec!["develop".to_string(), "master".to_string()];
        assert_eq!(choose_preferred_branch(&branches), Some("master".to_string()));
    }

    #[test]
    fn choose_falls_back_to_first_result() {
        let branches = vec!["develop".to_string(), "feature-x".to_string()];
        assert_eq!(choose_preferred_branch(&branches), Some("develop".to_string()));
    }

    #[test]
    fn choose_none_when_empty() {
        let branches: Vec<String> = vec![];
        assert_eq!(choose_preferred_branch(&branches), None);
    }

    #[test]
    fn parse_for_each_ref_strips_remote_prefix() {
        let stdout = "refs/remotes/origin/main\nrefs/remotes/origin/release-1.0\n";
        let branches = parse_for_each_ref_output(stdout);
        assert_eq!(branches, vec!["main".to_string(), "release-1.0".to_string()]);
    }

    #[test]
    fn parse_symref_head_extracts_default_branch() {
        let stdout = "ref: refs/heads/main\tHEAD\naaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa\tHEAD\n";
        assert_eq!(parse_symref_head(stdout), Some("main".to_string()));
    }

    #[test]
    fn parse_symref_head_none_when_absent() {
        let stdout = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa\tHEAD\n";
        assert_eq!(parse_symref_head(stdout), None);
    }

    fn entry(now: &str) -> VerificationEntry {
        VerificationEntry {
            verified: true,
            first_verified: now.to_string(),
            last_checked: now.to_string(),
            fetch_method: FetchMethod::RefHint,
        }
    }

    #[test]
    fn cache_store_flushes_to_disk_every_fifty_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("verification-v2.json");
        let cache = VerificationCache::load(&path);
        let verifier = CommitVerifier::new(Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap(), cache, 30);

        for i in 0..49 {
            verifier.cache_store(&format!("https://example.com/{i}"), &"a".repeat(40), entry("2024-01-01T00:00:00Z"));
        }
        assert!(!path.exists(), "flush should not fire before the 50th entry");

        verifier.cache_store("https://example.com/49", &"a".repeat(40), entry("2024-01-01T00:00:00Z"));
        assert!(path.exists(), "flush should fire on the 50th entry");
    }

    #[test]
    fn migrate_legacy_entry_is_readable_back_from_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = VerificationCache::load(dir.path().join("verification-v2.json"));
        let verifier = CommitVerifier::new(Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap(), cache, 30);
        verifier.migrate_legacy_entry("https://example.com/repo", &"a".repeat(40), true);

        let stored = verifier
            .cache_lookup("https://example.com/repo", &"a".repeat(40))
            .unwrap();
        assert!(stored.verified);
        assert_eq!(stored.fetch_method, FetchMethod::Cached);
    }

    #[test]
    fn migrate_legacy_entry_does_not_clobber_existing_v2_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = VerificationCache::load(dir.path().join("verification-v2.json"));
        let verifier = CommitVerifier::new(Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap(), cache, 30);
        verifier.cache_store("https://example.com/repo", &"a".repeat(40), entry("2024-06-01T00:00:00Z"));

        verifier.migrate_legacy_entry("https://example.com/repo", &"a".repeat(40), false);

        let stored = verifier
            .cache_lookup("https://example.com/repo", &"a".repeat(40))
            .unwrap();
        assert!(stored.verified, "legacy migration must not overwrite an existing v2 entry");
        assert_eq!(stored.fetch_method, FetchMethod::RefHint);
    }
}
