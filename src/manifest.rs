//! Parsing for `go.mod` (require/replace directives) and `go.sum`
//! (checksum triples). Deliberately line-oriented rather than a full Go
//! module-file grammar — the generator only needs the module path, version,
//! and replace graph.

use std::collections::BTreeMap;

/// One `require module version` line to resolve. `original` carries the
/// pre-replace `(module_path, version)` when a `replace` directive rewrote
/// this requirement's identity, so the driver can restore it on the
/// resulting record — the manifest's `require` entry is what gets looked
/// up, but the emitted record names the module as the build actually
/// depends on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub module_path: String,
    pub version: String,
    pub original: Option<(String, String)>,
}

impl Requirement {
    pub fn new(module_path: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            module_path: module_path.into(),
            version: version.into(),
            original: None,
        }
    }
}

/// One `replace old [old_version] => new [new_version]` directive. A
/// replacement whose target has no version is a local filesystem
/// replacement and is never VCS-resolvable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplaceDirective {
    pub old_path: String,
    pub old_version: Option<String>,
    pub new_path: String,
    pub new_version: Option<String>,
}

impl ReplaceDirective {
    pub fn is_local(&self) -> bool {
        self.new_version.is_none()
    }
}

fn strip_comment(line: &str) -> &str {
    match line.find("//") {
        Some(idx) => line[..idx].trim(),
        None => line.trim(),
    }
}

/// Parses `go.mod` contents into its require and replace directives.
/// Handles both single-line (`require foo/bar v1.2.3`) and block
/// (`require (\n foo/bar v1.2.3\n)`) forms for both directive kinds.
pub fn parse_go_mod(contents: &str) -> (Vec<Requirement>, Vec<ReplaceDirective>) {
    let mut requirements = Vec::new();
    let mut replaces = Vec::new();

    let mut in_require_block = false;
    let mut in_replace_block = false;

    for raw_line in contents.lines() {
        let line = strip_comment(raw_line);
        if line.is_empty() {
            continue;
        }

        if in_require_block {
            if line == ")" {
                in_require_block = false;
                continue;
            }
            if let Some(req) = parse_requirement_fields(line) {
                requirements.push(req);
            }
            continue;
        }

        if in_replace_block {
            if line == ")" {
                in_replace_block = false;
                continue;
            }
            if let Some(rep) = parse_replace_fields(line) {
                replaces.push(rep);
            }
            continue;
        }

        if let Some(rest) = line.strip_prefix("require ") {
            let rest = rest.trim();
            if rest == "(" {
                in_require_block = true;
            } else if let Some(req) = parse_requirement_fields(rest) {
                requirements.push(req);
            }
            continue;
        }
        if line == "require (" {
            in_require_block = true;
            continue;
        }

        if let Some(rest) = line.strip_prefix("replace ") {
            let rest = rest.trim();
            if rest == "(" {
                in_replace_block = true;
            } else if let Some(rep) = parse_replace_fields(rest) {
                replaces.push(rep);
            }
            continue;
        }
        if line == "replace (" {
            in_replace_block = true;
            continue;
        }
    }

    (requirements, replaces)
}

fn parse_requirement_fields(line: &str) -> Option<Requirement> {
    let line = line.trim_end_matches("// indirect").trim();
    let mut parts = line.split_whitespace();
    let module_path = parts.next()?.to_string();
    let version = parts.next()?.to_string();
    Some(Requirement::new(module_path, version))
}

fn parse_replace_fields(line: &str) -> Option<ReplaceDirective> {
    let (lhs, rhs) = line.split_once("=>")?;
    let lhs = lhs.trim();
    let rhs = rhs.trim();

    let mut lhs_parts = lhs.split_whitespace();
    let old_path = lhs_parts.next()?.to_string();
    let old_version = lhs_parts.next().map(str::to_string);

    let mut rhs_parts = rhs.split_whitespace();
    let new_path = rhs_parts.next()?.to_string();
    let new_version = rhs_parts.next().map(str::to_string);

    Some(ReplaceDirective {
        old_path,
        old_version,
        new_path,
        new_version,
    })
}

/// Applies replace directives over the requirement list:
/// an unversioned replace matches the module regardless of version; a
/// versioned replace matches only that exact version. Local replacements
/// (no target version) drop the requirement outright since there is
/// nothing to resolve against a VCS. The rewritten requirement keeps the
/// pre-replace identity in `original` so the resolved record can be
/// reported under the name the build actually asked for, not the fork it
/// was redirected to.
pub fn apply_replaces(
    requirements: Vec<Requirement>,
    replaces: &[ReplaceDirective],
) -> Vec<Requirement> {
    requirements
        .into_iter()
        .filter_map(|req| {
            let matching = replaces.iter().find(|r| {
                r.old_path == req.module_path
                    && r.old_version.as_deref().map_or(true, |v| v == req.version)
            });
            match matching {
                Some(rep) if rep.is_local() => None,
                Some(rep) => Some(Requirement {
                    module_path: rep.new_path.clone(),
                    version: rep.new_version.clone().unwrap_or_default(),
                    original: Some((req.module_path, req.version)),
                }),
                None => Some(req),
            }
        })
        .collect()
}

/// One `go.sum` line: `module version hash`. The `/go.mod` suffix on the
/// version marks a hash of the module file itself rather than the module
/// tree, and carries no VCS information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumEntry {
    pub module_path: String,
    pub version: String,
    pub is_go_mod_hash: bool,
    pub hash: String,
}

/// Parses `go.sum` contents into checksum entries.
pub fn parse_go_sum(contents: &str) -> Vec<ChecksumEntry> {
    contents
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let module_path = parts.next()?.to_string();
            let version_field = parts.next()?;
            let hash = parts.next()?.to_string();
            let (version, is_go_mod_hash) = match version_field.strip_suffix("/go.mod") {
                Some(v) => (v.to_string(), true),
                None => (version_field.to_string(), false),
            };
            Some(ChecksumEntry {
                module_path,
                version,
                is_go_mod_hash,
                hash,
            })
        })
        .collect()
}

/// Partitions a checksum file into module-tree entries (one real VCS
/// module/version pair each) keyed by `(module, version)`, deduplicated
/// against the `/go.mod`-only entries, which add no resolvable
/// information for commit verification.
pub fn partition_checksums(entries: &[ChecksumEntry]) -> BTreeMap<(String, String), String> {
    let mut modules = BTreeMap::new();
    for entry in entries {
        if entry.is_go_mod_hash {
            continue;
        }
        modules.insert(
            (entry.module_path.clone(), entry.version.clone()),
            entry.hash.clone(),
        );
    }
    modules
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_line_require() {
        let (reqs, _) = parse_go_mod("module example.com/foo\n\nrequire github.com/pkg/errors v0.9.1\n");
        assert_eq!(
            reqs,
            vec![Requirement::new("github.com/pkg/errors", "v0.9.1")]
        );
    }

    #[test]
    fn parses_require_block_with_indirect_comment() {
        let contents = "require (\n\tgithub.com/a/b v1.0.0\n\tgithub.com/c/d v2.0.0 // indirect\n)\n";
        let (reqs, _) = parse_go_mod(contents);
        assert_eq!(reqs.len(), 2);
        assert_eq!(reqs[1].module_path, "github.com/c/d");
        assert_eq!(reqs[1].version, "v2.0.0");
    }

    #[test]
    fn parses_single_line_replace_with_version() {
        let (_, reps) = parse_go_mod("replace github.com/a/b v1.0.0 => github.com/fork/b v1.0.1\n");
        assert_eq!(reps.len(), 1);
        assert_eq!(reps[0].old_path, "github.com/a/b");
        assert_eq!(reps[0].new_path, "github.com/fork/b");
        assert_eq!(reps[0].new_version.as_deref(), Some("v1.0.1"));
    }

    #[test]
    fn parses_replace_block_with_local_path_target() {
        let contents = "replace (\n\tgithub.com/a/b => ../local/b\n)\n";
        let (_, reps) = parse_go_mod(contents);
        assert_eq!(reps.len(), 1);
        assert!(reps[0].is_local());
    }

    #[test]
    fn apply_replaces_drops_local_replacement() {
        let reqs = vec![Requirement::new("github.com/a/b", "v1.0.0")];
        let reps = vec![ReplaceDirective {
            old_path: "github.com/a/b".to_string(),
            old_version: None,
            new_path: "../local".to_string(),
            new_version: None,
        }];
        assert!(apply_replaces(reqs, &reps).is_empty());
    }

    #[test]
    fn apply_replaces_substitutes_versioned_target() {
        let reqs = vec![Requirement::new("github.com/a/b", "v1.0.0")];
        let reps = vec![ReplaceDirective {
            old_path: "github.com/a/b".to_string(),
            old_version: None,
            new_path: "github.com/fork/b".to_string(),
            new_version: Some("v1.0.1".to_string()),
        }];
        let applied = apply_replaces(reqs, &reps);
        assert_eq!(applied[0].module_path, "github.com/fork/b");
        assert_eq!(applied[0].version, "v1.0.1");
        assert_eq!(
            applied[0].original,
            Some(("github.com/a/b".to_string(), "v1.0.0".to_string()))
        );
    }

    #[test]
    fn parse_go_sum_splits_go_mod_suffix() {
        let contents = "github.com/a/b v1.0.0 h1:abc=\ngithub.com/a/b v1.0.0/go.mod h1:def=\n";
        let entries = parse_go_sum(contents);
        assert_eq!(entries.len(), 2);
        assert!(!entries[0].is_go_mod_hash);
        assert!(entries[1].is_go_mod_hash);
        assert_eq!(entries[1].version, "v1.0.0");
    }

    #[test]
    fn partition_checksums_drops_go_mod_only_entries() {
        let entries = parse_go_sum("github.com/a/b v1.0.0/go.mod h1:def=\n");
        let modules = partition_checksums(&entries);
        assert!(modules.is_empty());
    }
}
