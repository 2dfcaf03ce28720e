//! Remote ref resolver: `lookup(url, ref) -> commit | null`.

use std::path::Path;

use anyhow::Result;

use crate::cache::{compound_key, LsRemoteCache};
use crate::gitcmd::{self, TIMEOUT_LS_REMOTE};

/// Something that can answer "what does `ref` on `url` resolve to?" —
/// abstracted behind a trait so metadata-resolution's end-to-end scenarios
/// can be tested without shelling out to real git/network. The production
/// implementation is `RemoteRefResolver`.
pub trait RefResolver {
    fn lookup(&mut self, url: &str, ref_spec: &str) -> Result<Option<String>>;
}

/// In-memory/disk cache, then a local bare-clone lookup if one exists,
/// then network `ls-remote`.
pub struct RemoteRefResolver<'a> {
    cache: &'a mut LsRemoteCache,
    bare_repo_lookup: Box<dyn Fn(&str) -> Option<std::path::PathBuf> + 'a>,
}

impl<'a> RemoteRefResolver<'a> {
    pub fn new(cache: &'a mut LsRemoteCache) -> Self {
        Self {
            cache,
            bare_repo_lookup: Box::new(|_| None),
        }
    }

    /// Supplies a callback that maps a URL to an already-initialised bare
    /// repository path, if one exists (used by the commit verifier so this
    /// resolver can answer from its own bare cache instead of the network).
    pub fn with_bare_repo_lookup(
        mut self,
        f: impl Fn(&str) -> Option<std::path::PathBuf> + 'a,
    ) -> Self {
        self.bare_repo_lookup = Box::new(f);
        self
    }

    fn from_bare_repo(&self, dir: &Path, ref_spec: &str) -> Option<String> {
        let output = gitcmd::run_captured(
            {
                let mut cmd = gitcmd::git_in(dir);
                cmd.args(["show-ref", "--hash", ref_spec]);
                cmd
            },
            TIMEOUT_LS_REMOTE,
        )
        .ok()??;
        if !output.status.success() {
            return None;
        }
        let hash = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if hash.len() == 40 {
            Some(hash)
        } else {
            None
        }
    }

    /// Runs `git ls-remote url ref [ref^{}]`, preferring the peeled hash
    /// for tag refs.
    fn from_network(&self, url: &str, ref_spec: &str) -> Option<String> {
        let mut cmd = gitcmd::git();
        cmd.arg("ls-remote").arg(url).arg(ref_spec);
        if ref_spec.starts_with("refs/tags/") {
            cmd.arg(format!("{ref_spec}^{{}}"));
        }
        let output = gitcmd::run_captured(cmd, TIMEOUT_LS_REMOTE).ok()??;
        if !output.status.success() {
            return None;
        }
        parse_ls_remote(&String::from_utf8_lossy(&output.stdout), ref_spec)
    }
}

/// Parses `ls-remote` output, preferring the peeled (`^{}`) hash over the
/// tag-object hash when both are present.
pub fn parse_ls_remote(stdout: &str, ref_spec: &str) -> Option<String> {
    let peeled_ref = format!("{ref_spec}^{{}}");
    let mut plain_hash = None;
    for line in stdout.lines() {
        let mut parts = line.split('\t');
        let hash = parts.next()?.trim();
        let name = parts.next()?.trim();
        if hash.len() != 40 {
            continue;
        }
        if name == peeled_ref {
            return Some(hash.to_string());
        }
        if name == ref_spec && plain_hash.is_none() {
            plain_hash = Some(hash.to_string());
        }
    }
    plain_hash
}

impl<'a> RefResolver for RemoteRefResolver<'a> {
    fn lookup(&mut self, url: &str, ref_spec: &str) -> Result<Option<String>> {
        let key = compound_key(url, ref_spec);
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached.clone());
        }

        let result = if let Some(bare_dir) = (self.bare_repo_lookup)(url) {
            self.from_bare_repo(&bare_dir, ref_spec)
        } else {
            None
        }
        .or_else(|| self.from_network(url, ref_spec));

        self.cache.insert(key, result.clone());
        Ok(result)
    }
}

/// `correct_from_ref` helper exposed to the driver/verifier: returns the
/// current commit `ref` resolves to, if it differs from `commit`.
pub fn correct_from_ref(
    resolver: &mut dyn RefResolver,
    url: &str,
    commit: &str,
    ref_spec: &str,
) -> Result<Option<String>> {
    let current = resolver.lookup(url, ref_spec)?;
    Ok(current.filter(|c| c != commit))
}

/// `ref_points_to_commit`: the driver's dedupe phase (§4.7 step 6) only
/// caches a ref hint for a commit when this agrees, i.e. when
/// `correct_from_ref` finds no divergence. A ref that has moved is not
/// dropped silently — the caller still learns the corrected commit via
/// `correct_from_ref`'s return value.
pub fn ref_points_to_commit(
    resolver: &mut dyn RefResolver,
    url: &str,
    commit: &str,
    ref_spec: &str,
) -> Result<bool> {
    Ok(correct_from_ref(resolver, url, commit, ref_spec)?.is_none())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ls_remote_prefers_peeled_hash() {
        let stdout = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb\trefs/tags/v1.2.3\n\
                       cccccccccccccccccccccccccccccccccccccccc\trefs/tags/v1.2.3^{}\n";
        let hash = parse_ls_remote(stdout, "refs/tags/v1.2.3");
        assert_eq!(hash.as_deref(), Some("cccccccccccccccccccccccccccccccccccccccc"));
    }

    #[test]
    fn parse_ls_remote_falls_back_to_plain_hash_for_lightweight_tags() {
        let stdout = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa\trefs/tags/v1.0.0\n";
        let hash = parse_ls_remote(stdout, "refs/tags/v1.0.0");
        assert_eq!(hash.as_deref(), Some("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"));
    }

    #[test]
    fn parse_ls_remote_returns_none_for_no_match() {
        let stdout = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa\trefs/heads/main\n";
        assert!(parse_ls_remote(stdout, "refs/tags/v1.0.0").is_none());
    }

    struct FakeResolver(std::collections::HashMap<(String, String), Option<String>>);

    impl RefResolver for FakeResolver {
        fn lookup(&mut self, url: &str, ref_spec: &str) -> Result<Option<String>> {
            Ok(self
                .0
                .get(&(url.to_string(), ref_spec.to_string()))
                .cloned()
                .flatten())
        }
    }

    #[test]
    fn correct_from_ref_detects_moved_tag() {
        let mut map = std::collections::HashMap::new();
        map.insert(
            ("https://example.com/repo".to_string(), "refs/tags/v1.2.3".to_string()),
            Some("b".repeat(40)),
        );
        let mut resolver = FakeResolver(map);
        let correction =
            correct_from_ref(&mut resolver, "https://example.com/repo", &"a".repeat(40), "refs/tags/v1.2.3")
                .unwrap();
        assert_eq!(correction, Some("b".repeat(40)));
    }

    #[test]
    fn correct_from_ref_none_when_unchanged() {
        let mut map = std::collections::HashMap::new();
        map.insert(
            ("https://example.com/repo".to_string(), "refs/tags/v1.2.3".to_string()),
            Some("a".repeat(40)),
        );
        let mut resolver = FakeResolver(map);
        let correction =
            correct_from_ref(&mut resolver, "https://example.com/repo", &"a".repeat(40), "refs/tags/v1.2.3")
                .unwrap();
        assert_eq!(correction, None);
    }

    #[test]
    fn ref_points_to_commit_false_when_tag_moved() {
        let mut map = std::collections::HashMap::new();
        map.insert(
            ("https://example.com/repo".to_string(), "refs/tags/v1.2.3".to_string()),
            Some("b".repeat(40)),
        );
        let mut resolver = FakeResolver(map);
        let agrees =
            ref_points_to_commit(&mut resolver, "https://example.com/repo", &"a".repeat(40), "refs/tags/v1.2.3")
                .unwrap();
        assert!(!agrees);
    }

    #[test]
    fn ref_points_to_commit_true_when_unchanged() {
        let mut map = std::collections::HashMap::new();
        map.insert(
            ("https://example.com/repo".to_string(), "refs/tags/v1.2.3".to_string()),
            Some("a".repeat(40)),
        );
        let mut resolver = FakeResolver(map);
        let agrees =
            ref_points_to_commit(&mut resolver, "https://example.com/repo", &"a".repeat(40), "refs/tags/v1.2.3")
                .unwrap();
        assert!(agrees);
    }
}
