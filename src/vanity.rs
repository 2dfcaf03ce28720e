//! Vanity / repo deriver: `derive(module_path, version) -> [candidate URL, ...]`.

use std::time::Duration;

use anyhow::Result;

use crate::cache::{OverrideStore, VanityCache};

/// `google.golang.org/<pkg>` mirror table.
const GOOGLE_GOLANG_ORG_MIRRORS: &[(&str, &str)] = &[
    ("protobuf", "https://github.com/protocolbuffers/protobuf-go"),
    ("grpc", "https://github.com/grpc/grpc-go"),
    ("genproto", "https://github.com/googleapis/go-genproto"),
    ("api", "https://github.com/googleapis/google-api-go-client"),
];

/// `gopkg.in/<pkg>.vN` -> canonical repo, with known exceptions to the
/// `go-<pkg>/<pkg>` convention.
const GOPKG_IN_MAPPINGS: &[(&str, &str)] = &[
    ("yaml", "https://github.com/go-yaml/yaml"),
    ("check", "https://github.com/go-check/check"),
    ("inf", "https://github.com/go-inf/inf"),
    ("tomb", "https://github.com/go-tomb/tomb"),
    ("fsnotify", "https://github.com/fsnotify/fsnotify"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub url: String,
    /// Module-path components beyond the repository boundary (a monorepo
    /// sub-directory candidate), before the trailing-`/vN` normalisation.
    pub subdir: String,
}

/// Fetches `https://<module_path>?go-get=1` and parses `<meta name="go-import">`.
/// Kept as a trait so it can be faked in tests.
pub trait VanityHttpProbe {
    fn fetch_go_import(&self, module_path: &str) -> Result<Option<String>>;
}

pub struct ReqwestVanityProbe {
    client: reqwest::blocking::Client,
}

impl ReqwestVanityProbe {
    pub fn new() -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("govcs-gen/0.1")
            .build()?;
        Ok(Self { client })
    }
}

impl VanityHttpProbe for ReqwestVanityProbe {
    fn fetch_go_import(&self, module_path: &str) -> Result<Option<String>> {
        let url = format!("https://{module_path}?go-get=1");
        let response = self.client.get(&url).send()?;
        if !response.status().is_success() {
            return Ok(None);
        }
        let body = response.text()?;
        Ok(parse_go_import(&body, module_path))
    }
}

/// Parses `<meta name="go-import" content="prefix vcs url">` tags out of an
/// HTML body, choosing the entry with the longest prefix that equals or
/// prefixes `module_path`. A hand-rolled scanner is used
/// rather than a full HTML parser since the only structure that matters is
/// one attribute on one tag per line.
pub fn parse_go_import(body: &str, module_path: &str) -> Option<String> {
    let mut best: Option<(usize, String)> = None;
    for line in body.lines() {
        let Some(meta_start) = line.find("<meta") else {
            continue;
        };
        let tag = &line[meta_start..];
        if !tag.contains("name=\"go-import\"") && !tag.contains("name='go-import'") {
            continue;
        }
        let Some(content) = extract_attr(tag, "content") else {
            continue;
        };
        let mut parts = content.split_whitespace();
        let prefix = parts.next()?;
        let _vcs_kind = parts.next()?;
        let repo_url = parts.next()?;

        let is_prefix_match = module_path == prefix
            || (module_path.starts_with(prefix)
                && module_path.as_bytes().get(prefix.len()) == Some(&b'/'));
        if !is_prefix_match {
            continue;
        }
        if best.as_ref().map(|(len, _)| prefix.len() > *len).unwrap_or(true) {
            best = Some((prefix.len(), repo_url.to_string()));
        }
    }
    best.map(|(_, url)| url)
}

fn extract_attr<'a>(tag: &'a str, attr: &str) -> Option<&'a str> {
    for quote in ['"', '\''] {
        let needle = format!("{attr}={quote}");
        if let Some(start) = tag.find(&needle) {
            let rest = &tag[start + needle.len()..];
            if let Some(end) = rest.find(quote) {
                return Some(&rest[..end]);
            }
        }
    }
    None
}

pub struct VanityDeriver<'a> {
    cache: &'a mut VanityCache,
    overrides: &'a OverrideStore,
    probe: &'a dyn VanityHttpProbe,
}

impl<'a> VanityDeriver<'a> {
    pub fn new(
        cache: &'a mut VanityCache,
        overrides: &'a OverrideStore,
        probe: &'a dyn VanityHttpProbe,
    ) -> Self {
        Self {
            cache,
            overrides,
            probe,
        }
    }

    /// `derive(module_path, version) -> [candidate URL, ...]`.
    /// Steps are merged rather than short-circuited: every applicable rule
    /// contributes candidates, in the documented order.
    pub fn derive(&mut self, module_path: &str, version: &str) -> Vec<Candidate> {
        let mut candidates = Vec::new();

        if let Some(url) = self.overrides.lookup(module_path, version) {
            candidates.push(Candidate {
                url: url.to_string(),
                subdir: String::new(),
            });
        }

        if let Some(candidate) = known_host_candidate(module_path) {
            candidates.push(candidate);
        } else if let Some(mut gopkg) = gopkg_in_candidates(module_path) {
            candidates.append(&mut gopkg);
        } else if let Some(candidate) = golang_org_x_candidate(module_path) {
            candidates.push(candidate);
        } else if let Some(candidate) = google_golang_org_candidate(module_path) {
            candidates.push(candidate);
        }

        if let Some(candidate) = self.vanity_probe_candidate(module_path) {
            candidates.push(candidate);
        }

        candidates
    }

    fn vanity_probe_candidate(&mut self, module_path: &str) -> Option<Candidate> {
        if let Some(cached) = self.cache.get(module_path) {
            return cached.clone().map(|url| recompute_subdir(module_path, &url));
        }
        let result = self.probe.fetch_go_import(module_path).unwrap_or_else(|err| {
            tracing::warn!(module = module_path, error = %err, "vanity probe failed");
            None
        });
        self.cache.insert(module_path.to_string(), result.clone());
        result.map(|url| recompute_subdir(module_path, &url))
    }
}

/// Known hosts: github.com/O/R, gitlab.com/O/R, bitbucket.org/O/R. Anything
/// beyond the repo is the sub-directory, normalised to drop a trailing
/// `/vN` component (the module's own major-version suffix, e.g.
/// `github.com/cenkalti/backoff/v4`, is not a real on-disk directory).
fn known_host_candidate(module_path: &str) -> Option<Candidate> {
    for host in ["github.com", "gitlab.com", "bitbucket.org"] {
        if let Some(rest) = module_path.strip_prefix(&format!("{host}/")) {
            let mut parts = rest.splitn(3, '/');
            let owner = parts.next()?;
            let repo = parts.next()?;
            let subdir = crate::record::ModuleRecord::normalize_subdir(parts.next().unwrap_or(""));
            return Some(Candidate {
                url: format!("https://{host}/{owner}/{repo}"),
                subdir,
            });
        }
    }
    None
}

fn gopkg_in_candidates(module_path: &str) -> Option<Vec<Candidate>> {
    let rest = module_path.strip_prefix("gopkg.in/")?;
    let (head, _version_suffix) = rest.split_once(".v")?;
    // `gopkg.in/pkg.v3` or `gopkg.in/owner/pkg.v3`
    let (owner_hint, pkg_name) = match head.split_once('/') {
        Some((owner, pkg)) => (Some(owner), pkg),
        None => (None, head),
    };

    let mut candidates = Vec::new();
    if let Some((_, mapped)) = GOPKG_IN_MAPPINGS.iter().find(|(name, _)| *name == pkg_name) {
        candidates.push(Candidate {
            url: mapped.to_string(),
            subdir: String::new(),
        });
    }
    if let Some(owner) = owner_hint {
        candidates.push(Candidate {
            url: format!("https://github.com/{owner}/{pkg_name}"),
            subdir: String::new(),
        });
    }
    candidates.push(Candidate {
        url: format!("https://github.com/go-{pkg_name}/{pkg_name}"),
        subdir: String::new(),
    });
    candidates.push(Candidate {
        url: format!("https://github.com/{pkg_name}/{pkg_name}"),
        subdir: String::new(),
    });
    Some(candidates)
}

fn golang_org_x_candidate(module_path: &str) -> Option<Candidate> {
    let pkg = module_path.strip_prefix("golang.org/x/")?;
    let pkg = pkg.split('/').next()?;
    Some(Candidate {
        url: format!("https://go.googlesource.com/{pkg}"),
        subdir: String::new(),
    })
}

fn google_golang_org_candidate(module_path: &str) -> Option<Candidate> {
    let rest = module_path.strip_prefix("google.golang.org/")?;
    let mut parts = rest.splitn(2, '/');
    let pkg = parts.next()?;
    let subdir = crate::record::ModuleRecord::normalize_subdir(parts.next().unwrap_or(""));
    let url = GOOGLE_GOLANG_ORG_MIRRORS
        .iter()
        .find(|(name, _)| *name == pkg)
        .map(|(_, url)| url.to_string())
        .unwrap_or_else(|| format!("https://github.com/golang/{pkg}"));
    Some(Candidate { url, subdir })
}

/// After any vanity redirect, recomputes the sub-directory by walking the
/// module-path components and finding the first that matches the redirect
/// URL's final path component; the remainder (minus a trailing `/vN`) is
/// the sub-directory.
pub fn recompute_subdir(module_path: &str, redirect_url: &str) -> Candidate {
    let repo_last_component = redirect_url.rsplit('/').next().unwrap_or("");
    let components: Vec<&str> = module_path.split('/').collect();
    let boundary = components
        .iter()
        .position(|c| *c == repo_last_component || c.contains(repo_last_component));

    let subdir = match boundary {
        Some(idx) if idx + 1 < components.len() => {
            crate::record::ModuleRecord::normalize_subdir(&components[idx + 1..].join("/"))
        }
        _ => String::new(),
    };

    Candidate {
        url: redirect_url.to_string(),
        subdir,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_go_import_meta_tag() {
        let body = r#"<html><head>
<meta name="go-import" content="go.uber.org/zap git https://github.com/uber-go/zap">
</head></html>"#;
        let url = parse_go_import(body, "go.uber.org/zap");
        assert_eq!(url.as_deref(), Some("https://github.com/uber-go/zap"));
    }

    #[test]
    fn picks_longest_matching_prefix() {
        let body = r#"
<meta name="go-import" content="example.com git https://github.com/example/root">
<meta name="go-import" content="example.com/sub git https://github.com/example/sub">
"#;
        let url = parse_go_import(body, "example.com/sub/pkg");
        assert_eq!(url.as_deref(), Some("https://github.com/example/sub"));
    }

    #[test]
    fn known_host_github_with_subdir() {
        let candidate = known_host_candidate("github.com/owner/repo/cmd/tool").unwrap();
        assert_eq!(candidate.url, "https://github.com/owner/repo");
        assert_eq!(candidate.subdir, "cmd/tool");
    }

    #[test]
    fn known_host_drops_own_major_version_suffix() {
        let candidate = known_host_candidate("github.com/cenkalti/backoff/v4").unwrap();
        assert_eq!(candidate.url, "https://github.com/cenkalti/backoff");
        assert_eq!(candidate.subdir, "");
    }

    #[test]
    fn google_golang_org_drops_own_major_version_suffix() {
        let candidate = google_golang_org_candidate("google.golang.org/genproto/v2").unwrap();
        assert_eq!(candidate.subdir, "");
    }

    #[test]
    fn gopkg_in_yaml_known_mapping() {
        let candidates = gopkg_in_candidates("gopkg.in/yaml.v2").unwrap();
        assert!(candidates.iter().any(|c| c.url == "https://github.com/go-yaml/yaml"));
    }

    #[test]
    fn gopkg_in_fsnotify_has_no_go_prefix() {
        let candidates = gopkg_in_candidates("gopkg.in/fsnotify.v1").unwrap();
        assert!(candidates.iter().any(|c| c.url == "https://github.com/fsnotify/fsnotify"));
    }

    #[test]
    fn golang_org_x_maps_to_googlesource() {
        let candidate = golang_org_x_candidate("golang.org/x/tools").unwrap();
        assert_eq!(candidate.url, "https://go.googlesource.com/tools");
    }

    #[test]
    fn google_golang_org_grpc_uses_fixed_mirror() {
        let candidate = google_golang_org_candidate("google.golang.org/grpc/cmd/protoc-gen-go-grpc").unwrap();
        assert_eq!(candidate.url, "https://github.com/grpc/grpc-go");
        assert_eq!(candidate.subdir, "cmd/protoc-gen-go-grpc");
    }

    #[test]
    fn google_golang_org_default_mirror_for_unknown_pkg() {
        let candidate = google_golang_org_candidate("google.golang.org/something-else").unwrap();
        assert_eq!(candidate.url, "https://github.com/golang/something-else");
    }

    #[test]
    fn recompute_subdir_consumes_repo_name() {
        let candidate = recompute_subdir("go.uber.org/zap", "https://github.com/uber-go/zap");
        assert_eq!(candidate.subdir, "");
    }

    #[test]
    fn recompute_subdir_keeps_remainder_for_monorepo() {
        let candidate = recompute_subdir(
            "go.etcd.io/etcd/server/v3",
            "https://github.com/etcd-io/etcd",
        );
        assert_eq!(candidate.subdir, "server");
    }
}
