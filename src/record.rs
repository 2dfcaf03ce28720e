//! The module record data model and its invariants.

use std::sync::LazyLock;

use anyhow::{bail, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

static HEX40: LazyLock<Regex> = LazyLock::new(|| Regex::new("^[0-9a-f]{40}$").unwrap());
static MAJOR_VERSION_COMPONENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^v\d+$").unwrap());

/// Which code path produced a given record, kept for auditability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Derivation {
    /// Metadata came straight from the module proxy / Go tool.
    Proxy,
    /// Metadata was derived from the module path (vanity/known-host rules).
    Derived,
    /// Metadata came from a repo-override entry.
    Override,
    /// Reused a resolved prefix's repository as a monorepo sub-module.
    MonorepoReuse,
    /// Reused a sibling version's repository.
    SiblingReuse,
    /// Seeded directly from an external discovery input, bypassing the
    /// module proxy / Go tool walk entirely.
    Discovery,
}

/// One resolved module dependency. Immutable once the driver has finished
/// with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleRecord {
    pub module_path: String,
    pub version: String,
    pub vcs_url: String,
    pub vcs_hash: String,
    pub vcs_ref: String,
    pub subdir: String,
    pub timestamp: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default = "default_derivation")]
    pub derivation: Derivation,
}

fn default_derivation() -> Derivation {
    Derivation::Proxy
}

impl ModuleRecord {
    /// Invariant 1: hash shape.
    pub fn has_valid_hash(&self) -> bool {
        HEX40.is_match(&self.vcs_hash)
    }

    /// Invariant 4: no subdir component may be a bare major-version suffix.
    /// Exempts `MonorepoReuse` records: there the subdir is the literal
    /// on-disk path inside a reused repository (shortened from the
    /// module path), and an upstream monorepo can genuinely nest a
    /// version-named directory such as etcd's `server/v3` — the rule
    /// targets artifacts of blindly slicing a module's own `/vN` suffix,
    /// not real repository structure.
    pub fn has_valid_subdir(&self) -> bool {
        if self.subdir.is_empty() || self.derivation == Derivation::MonorepoReuse {
            return true;
        }
        !self
            .subdir
            .split('/')
            .any(|part| MAJOR_VERSION_COMPONENT.is_match(part))
    }

    /// Invariant 3: when there's no explicit ref, a branch name must be on
    /// record for the downstream fetcher.
    pub fn has_valid_branch_requirement(&self) -> bool {
        !self.vcs_ref.is_empty() || self.branch.is_some()
    }

    /// Runs every structural invariant that can be checked without network
    /// access (hash shape, subdir shape, ref/branch presence). Reachability
    /// of the ref/branch against the live repository is checked elsewhere
    /// (verify::CommitVerifier) since it requires a network or bare-repo
    /// round trip.
    pub fn validate_structural(&self) -> Result<()> {
        if !self.has_valid_hash() {
            bail!(
                "module {}@{}: vcs_hash {:?} is not 40 lowercase hex characters",
                self.module_path,
                self.version,
                self.vcs_hash
            );
        }
        if !self.has_valid_subdir() {
            bail!(
                "module {}@{}: subdir {:?} contains a major-version component",
                self.module_path,
                self.version,
                self.subdir
            );
        }
        if !self.has_valid_branch_requirement() {
            bail!(
                "module {}@{}: no vcs_ref and no branch recorded",
                self.module_path,
                self.version
            );
        }
        if !self.vcs_ref.is_empty()
            && !(self.vcs_ref.starts_with("refs/tags/") || self.vcs_ref.starts_with("refs/heads/"))
        {
            bail!(
                "module {}@{}: vcs_ref {:?} is neither a tag nor a branch ref",
                self.module_path,
                self.version,
                self.vcs_ref
            );
        }
        Ok(())
    }

    /// Deterministic opaque identifier used as the vcs-cache directory name
    /// by the downstream fetcher: `sha256("git3:" + url + commit)`.
    pub fn destsuffix_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(b"git3:");
        hasher.update(self.vcs_url.as_bytes());
        hasher.update(self.vcs_hash.as_bytes());
        let digest = hasher.finalize();
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Drops a trailing major-version path component (`v2`, `v3`, …) from a
    /// sub-directory candidate: if the last sub-directory component matches
    /// `v\d+`, it is dropped from `subdir` but preserved in `module_path`.
    pub fn normalize_subdir(subdir: &str) -> String {
        let parts: Vec<&str> = subdir.split('/').filter(|p| !p.is_empty()).collect();
        match parts.last() {
            Some(last) if MAJOR_VERSION_COMPONENT.is_match(last) => {
                parts[..parts.len() - 1].join("/")
            }
            _ => parts.join("/"),
        }
    }
}

/// Checks invariant 5 across a whole resolved set: any two records sharing
/// `(module_path, version)` must be byte-identical in every field.
pub fn check_consistent_duplicates(records: &[ModuleRecord]) -> Result<()> {
    use std::collections::HashMap;

    let mut seen: HashMap<(&str, &str), &ModuleRecord> = HashMap::new();
    for record in records {
        let key = (record.module_path.as_str(), record.version.as_str());
        if let Some(existing) = seen.get(&key) {
            if *existing != record {
                bail!(
                    "conflicting records for {}@{}: {:?} vs {:?}",
                    record.module_path,
                    record.version,
                    existing,
                    record
                );
            }
        } else {
            seen.insert(key, record);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_record() -> ModuleRecord {
        ModuleRecord {
            module_path: "github.com/spf13/cobra".into(),
            version: "v1.8.0".into(),
            vcs_url: "https://github.com/spf13/cobra".into(),
            vcs_hash: "a".repeat(40),
            vcs_ref: "refs/tags/v1.8.0".into(),
            subdir: String::new(),
            timestamp: "2024-01-01T00:00:00Z".into(),
            branch: None,
            derivation: Derivation::Proxy,
        }
    }

    #[test]
    fn valid_record_passes() {
        assert!(base_record().validate_structural().is_ok());
    }

    #[test]
    fn short_hash_fails() {
        let mut record = base_record();
        record.vcs_hash = "deadbeef".into();
        assert!(record.validate_structural().is_err());
    }

    #[test]
    fn uppercase_hash_fails() {
        let mut record = base_record();
        record.vcs_hash = "A".repeat(40);
        assert!(record.validate_structural().is_err());
    }

    #[test]
    fn subdir_with_major_version_fails() {
        let mut record = base_record();
        record.subdir = "server/v3".into();
        assert!(!record.has_valid_subdir());
    }

    #[test]
    fn monorepo_reuse_exempts_major_version_subdir() {
        let mut record = base_record();
        record.subdir = "server/v3".into();
        record.derivation = Derivation::MonorepoReuse;
        assert!(record.has_valid_subdir());
        assert!(record.validate_structural().is_ok());
    }

    #[test]
    fn empty_ref_requires_branch() {
        let mut record = base_record();
        record.vcs_ref = String::new();
        assert!(record.validate_structural().is_err());
        record.branch = Some("main".into());
        assert!(record.validate_structural().is_ok());
    }

    #[test]
    fn normalize_subdir_drops_major_version_suffix() {
        assert_eq!(ModuleRecord::normalize_subdir("server/v3"), "server");
        assert_eq!(ModuleRecord::normalize_subdir("server"), "server");
        assert_eq!(ModuleRecord::normalize_subdir("v2"), "");
    }

    #[test]
    fn destsuffix_hash_is_stable_and_64_hex_chars() {
        let record = base_record();
        let hash1 = record.destsuffix_hash();
        let hash2 = record.destsuffix_hash();
        assert_eq!(hash1, hash2);
        assert_eq!(hash1.len(), 64);
        assert!(hash1.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn consistent_duplicates_ok_when_equal() {
        let a = base_record();
        let b = base_record();
        assert!(check_consistent_duplicates(&[a, b]).is_ok());
    }

    #[test]
    fn conflicting_duplicates_rejected() {
        let a = base_record();
        let mut b = base_record();
        b.vcs_hash = "b".repeat(40);
        assert!(check_consistent_duplicates(&[a, b]).is_err());
    }
}
