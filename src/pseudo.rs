//! Pseudo-version resolver: expands a 12-char short hash against a
//! real clone's history inside a ±1 day window around the pseudo-version's
//! timestamp.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use camino::Utf8PathBuf;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};
use sha2::{Digest, Sha256};

use crate::gitcmd::{self, TIMEOUT_CLONE, TIMEOUT_FETCH, TIMEOUT_LOG};

/// Parses a Go pseudo-version timestamp (`YYYYMMDDHHMMSS`) and validates
/// it: a real date between 1970 and 9999 inclusive, and the ±1-day window
/// must not overflow.
pub fn parse_pseudo_timestamp(ts: &str) -> Result<DateTime<Utc>> {
    if ts.len() != 14 || !ts.chars().all(|c| c.is_ascii_digit()) {
        return Err(anyhow!("pseudo-version timestamp {ts:?} is not 14 digits"));
    }
    let naive = NaiveDateTime::parse_from_str(ts, "%Y%m%d%H%M%S")
        .map_err(|e| anyhow!("pseudo-version timestamp {ts:?} is not a valid date: {e}"))?;
    let year = naive.format("%Y").to_string().parse::<i32>().unwrap_or(0);
    if !(1970..=9999).contains(&year) {
        return Err(anyhow!("pseudo-version timestamp {ts:?} year out of range"));
    }
    let dt = DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc);
    // Reject if the ±1 day window would overflow the representable range.
    dt.checked_sub_signed(ChronoDuration::days(1))
        .ok_or_else(|| anyhow!("pseudo-version timestamp {ts:?} underflows with a 1-day window"))?;
    dt.checked_add_signed(ChronoDuration::days(1))
        .ok_or_else(|| anyhow!("pseudo-version timestamp {ts:?} overflows with a 1-day window"))?;
    Ok(dt)
}

/// Stable directory name for a repo's bare clone, keyed by a hash of its URL
/// rather than host/path (needed because vanity redirects and mirrors can
/// normalise to clashing paths, and scp-style URLs don't parse as `url::Url`
/// at all).
pub fn stable_repo_key(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    let digest = hasher.finalize();
    digest.iter().take(20).map(|b| format!("{b:02x}")).collect()
}

/// Builds the candidate clone URL list for pseudo-version expansion: the
/// primary URL, plus a GitHub mirror when the primary is on
/// `go.googlesource.com`.
pub fn candidate_clone_urls(url: &str, module_path: &str) -> Vec<String> {
    let mut candidates = vec![url.to_string()];
    if url.starts_with("https://go.googlesource.com/") {
        if let Some(pkg) = module_path.strip_prefix("golang.org/x/") {
            let pkg = pkg.split('/').next().unwrap_or(pkg);
            candidates.push(format!("https://github.com/golang/{pkg}"));
        }
    }
    candidates
}

pub struct PseudoVersionResolver {
    pub bare_clone_base: Utf8PathBuf,
}

impl PseudoVersionResolver {
    pub fn new(bare_clone_base: Utf8PathBuf) -> Self {
        Self { bare_clone_base }
    }

    fn bare_path(&self, url: &str) -> PathBuf {
        self.bare_clone_base.join(stable_repo_key(url)).into()
    }

    fn ensure_bare_clone(&self, url: &str) -> Result<PathBuf> {
        let path = self.bare_path(url);
        if path.join("HEAD").exists() {
            let mut cmd = gitcmd::git_in(&path);
            cmd.args(["fetch", "--all", "--quiet"]);
            let output = gitcmd::run_captured(cmd, TIMEOUT_FETCH)?;
            if let Some(output) = &output {
                if !output.status.success() {
                    gitcmd::clear_stale_locks(&path);
                }
            }
        } else {
            std::fs::create_dir_all(path.parent().unwrap_or(Path::new(".")))?;
            let mut cmd = gitcmd::git();
            cmd.args(["clone", "--bare", "--quiet", url]).arg(&path);
            let output = gitcmd::run_captured(cmd, TIMEOUT_CLONE)?;
            match output {
                Some(o) if o.status.success() => {}
                _ => return Err(anyhow!("cloning {url} failed or timed out")),
            }
        }
        Ok(path)
    }

    /// Searches `git log --all` in a ±1-day window around `ts` for a commit
    /// whose hash starts with `short`.
    fn search_window(&self, bare_repo: &Path, ts: DateTime<Utc>, short: &str) -> Result<Option<String>> {
        let since = (ts - ChronoDuration::days(1)).to_rfc3339();
        let until = (ts + ChronoDuration::days(1)).to_rfc3339();

        let mut cmd = gitcmd::git_in(bare_repo);
        cmd.args(["log", "--all", "--format=%H %ct", "--since", &since, "--until", &until]);
        let output = match gitcmd::run_captured(cmd, TIMEOUT_LOG)? {
            Some(o) if o.status.success() => o,
            _ => return Ok(None),
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        for line in stdout.lines() {
            if let Some((hash, _)) = line.split_once(' ') {
                if hash.starts_with(short) {
                    return Ok(Some(hash.to_string()));
                }
            }
        }
        Ok(None)
    }

    /// `expand(url, ts, short) -> full_hash | null`.
    pub fn expand(&self, url: &str, module_path: &str, ts: &str, short: &str) -> Result<Option<String>> {
        let parsed_ts = parse_pseudo_timestamp(ts)?;
        if short.len() != 12 || !short.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(anyhow!("short hash {short:?} is not 12 hex characters"));
        }

        for candidate in candidate_clone_urls(url, module_path) {
            let bare_repo = match self.ensure_bare_clone(&candidate) {
                Ok(path) => path,
                Err(err) => {
                    tracing::warn!(url = %candidate, error = %err, "candidate clone failed, trying next");
                    continue;
                }
            };
            if let Some(full) = self.search_window(&bare_repo, parsed_ts, short)? {
                return Ok(Some(full));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_pseudo_timestamp() {
        let dt = parse_pseudo_timestamp("20200815063812").unwrap();
        assert_eq!(dt.format("%Y-%m-%d").to_string(), "2020-08-15");
    }

    #[test]
    fn rejects_malformed_timestamp() {
        assert!(parse_pseudo_timestamp("not-a-date").is_err());
        assert!(parse_pseudo_timestamp("2020081506381").is_err());
    }

    #[test]
    fn rejects_year_out_of_window_range() {
        // Year 0001 cannot have a valid ±1-day window in chrono's supported range
        // in the same way; this also exercises the explicit year-range check.
        assert!(parse_pseudo_timestamp("00010101000000").is_err());
    }

    #[test]
    fn candidate_urls_adds_github_mirror_for_golang_x() {
        let candidates = candidate_clone_urls("https://go.googlesource.com/tools", "golang.org/x/tools");
        assert_eq!(
            candidates,
            vec![
                "https://go.googlesource.com/tools".to_string(),
                "https://github.com/golang/tools".to_string(),
            ]
        );
    }

    #[test]
    fn candidate_urls_is_just_primary_for_other_hosts() {
        let candidates = candidate_clone_urls("https://github.com/example/proj", "github.com/example/proj");
        assert_eq!(candidates, vec!["https://github.com/example/proj".to_string()]);
    }

    #[test]
    fn stable_repo_key_is_deterministic_and_hex() {
        let a = stable_repo_key("https://github.com/example/proj");
        let b = stable_repo_key("https://github.com/example/proj");
        assert_eq!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
