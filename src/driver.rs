//! Resolution driver: orchestrates the full run from parsed manifests down
//! to a verified, deduplicated module list.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use rayon::{prelude::*, ThreadPoolBuilder};

use crate::cache::{
    prune_metadata_cache, CacheDirs, LsRemoteCache, MetadataCache, OverrideStore, VanityCache,
    VerificationCache,
};
use crate::config::GeneratorConfig;
use crate::error::GovcsError;
use crate::manifest::{apply_replaces, ChecksumEntry, Requirement};
use crate::metadata::{GoListProbe, MetadataResolver, SkippedModule};
use crate::pseudo::PseudoVersionResolver;
use crate::record::{check_consistent_duplicates, Derivation, ModuleRecord};
use crate::remote::{correct_from_ref, ref_points_to_commit, RefResolver, RemoteRefResolver};
use crate::vanity::VanityHttpProbe;
use crate::verify::CommitVerifier;

pub struct ResolutionDriver {
    config: GeneratorConfig,
    dirs: CacheDirs,
}

/// The full result of one run: resolved modules plus everything that
/// couldn't be resolved, so callers can decide how loud to be about it.
#[derive(Debug, Default)]
pub struct ResolutionOutcome {
    pub records: Vec<ModuleRecord>,
    pub skipped: Vec<SkippedModule>,
}

impl ResolutionDriver {
    pub fn new(config: GeneratorConfig) -> Result<Self> {
        let dirs = CacheDirs::new(config.cache_base.clone())?;
        Ok(Self { config, dirs })
    }

    /// Builds the canonical (module, version) list from parsed manifests:
    /// prefer the `go.sum` checksum partition when present since it
    /// enumerates the full resolved build list, replace directives applied
    /// on top of whichever source was used, then fall back to `go.mod`
    /// requires alone.
    pub fn build_module_list(
        go_mod: &str,
        go_sum: Option<&str>,
    ) -> Vec<Requirement> {
        let (mod_requirements, replaces) = crate::manifest::parse_go_mod(go_mod);

        let base = match go_sum {
            Some(sum) => {
                let entries: Vec<ChecksumEntry> = crate::manifest::parse_go_sum(sum);
                let modules = crate::manifest::partition_checksums(&entries);
                if modules.is_empty() {
                    mod_requirements
                } else {
                    modules
                        .into_iter()
                        .map(|((module_path, version), _hash)| Requirement::new(module_path, version))
                        .collect()
                }
            }
            None => mod_requirements,
        };

        apply_replaces(base, &replaces)
    }

    /// Runs the full metadata-resolution -> commit-verification pipeline,
    /// with monorepo and sibling-reuse fallbacks for modules that resolve
    /// to nothing on their own. `discovery` is the optional pre-computed
    /// metadata list (§6): any requirement it covers is seeded straight
    /// into the resolved set, short-circuiting C4/C5 entirely for that
    /// module, while everything else still goes through the normal
    /// resolution pipeline. Every record — discovered or resolved — still
    /// passes through C6 verification.
    pub fn run(
        &self,
        requirements: Vec<Requirement>,
        probe: &dyn VanityHttpProbe,
        discovery: &[ModuleRecord],
    ) -> Result<ResolutionOutcome> {
        let mut metadata_cache: MetadataCache = MetadataCache::load(self.dirs.metadata_path());
        let mut vanity_cache: VanityCache = VanityCache::load(self.dirs.vanity_path());
        let mut ls_remote_cache = crate::cache::LsRemoteCache::load(self.dirs.ls_remote_path());
        let overrides = OverrideStore::load(
            self.dirs.manual_overrides_path(),
            self.dirs.dynamic_overrides_path(),
        );
        prune_metadata_cache(&mut metadata_cache, &overrides);

        let bare_clone_base = self.dirs.repos_base();
        let pseudo = PseudoVersionResolver::new(bare_clone_base.clone());
        let go_probe =
            GoListProbe::new(self.config.goproxy.clone(), Some(self.config.gomodcache.clone()));

        let mut resolved: Vec<ModuleRecord> = Vec::new();
        let mut skipped: Vec<SkippedModule> = Vec::new();

        // Tracks successfully-resolved repos by the module-path prefix that
        // owns them, so sibling/monorepo fallbacks have something to reuse.
        let mut repo_by_prefix: HashMap<String, (String, String)> = HashMap::new();

        let discovered: HashMap<(&str, &str), &ModuleRecord> = discovery
            .iter()
            .map(|r| ((r.module_path.as_str(), r.version.as_str()), r))
            .collect();

        {
            let mut resolver = RemoteRefResolver::new(&mut ls_remote_cache);
            let mut meta = MetadataResolver::new(
                &mut metadata_cache,
                &overrides,
                &mut vanity_cache,
                &pseudo,
                probe,
            )
            .with_go_probe(&go_probe);

            for req in &requirements {
                if let Some(discovered_record) = discovered.get(&(req.module_path.as_str(), req.version.as_str())) {
                    let mut record = (*discovered_record).clone();
                    record.derivation = Derivation::Discovery;
                    repo_by_prefix.insert(
                        repo_prefix(&record.module_path),
                        (record.vcs_url.clone(), record.vcs_hash.clone()),
                    );
                    resolved.push(record);
                    continue;
                }

                match meta.resolve(&req.module_path, &req.version, &mut resolver)? {
                    Ok(mut record) => {
                        restore_original_identity(&mut record, &req.original);
                        repo_by_prefix.insert(
                            repo_prefix(&record.module_path),
                            (record.vcs_url.clone(), record.vcs_hash.clone()),
                        );
                        resolved.push(record);
                    }
                    Err(skip) => {
                        let reused = try_monorepo_reuse(
                            &mut meta,
                            &mut resolver,
                            &req.module_path,
                            &req.version,
                        )?
                        .or_else(|| {
                            try_sibling_reuse(&mut resolver, &repo_by_prefix, &req.module_path, &req.version)
                        });
                        match reused {
                            Some(mut record) => {
                                restore_original_identity(&mut record, &req.original);
                                resolved.push(record);
                            }
                            None => skipped.push(skip),
                        }
                    }
                }
            }
        }

        check_consistent_duplicates(&resolved)?;

        self.verify_all(&mut resolved, &mut ls_remote_cache)?;

        if let Err(err) = validate_all_structural(&resolved) {
            // Caches reflect everything learned this run even when the
            // final invariant check fails, so a corrected re-run (after
            // `--set-repo` / `--inject-commit`) doesn't redo the same
            // network round trips.
            metadata_cache.save()?;
            vanity_cache.save()?;
            ls_remote_cache.save()?;
            return Err(err);
        }

        metadata_cache.save()?;
        vanity_cache.save()?;
        ls_remote_cache.save()?;

        for skip in &skipped {
            tracing::warn!(
                module = skip.module_path,
                version = skip.version,
                reason = skip.reason,
                "module skipped"
            );
        }

        Ok(ResolutionOutcome {
            records: resolved,
            skipped,
        })
    }

    /// Runs commit verification across the deduplicated set of
    /// `(url, commit)` pairs using a bounded thread pool (`jobs == 0` means
    /// sequential), then writes any corrections/fallbacks back into the
    /// matching records. The verification cache is persisted before
    /// returning on every path, including the hard-failure bail-out, so a
    /// corrected re-run doesn't redo the same clones.
    fn verify_all(&self, records: &mut [ModuleRecord], ls_remote_cache: &mut LsRemoteCache) -> Result<()> {
        let verification_cache = VerificationCache::load(self.dirs.verification_path());
        let bare_clone_base = self.dirs.repos_base();
        let verifier = CommitVerifier::new(
            bare_clone_base,
            verification_cache,
            self.config.verification_max_age_days,
        );

        self.migrate_legacy_verification_cache(&verifier);
        self.precorrect_moved_tags(records, ls_remote_cache);

        let mut seen = HashSet::new();
        let mut jobs: Vec<(usize, String, String, Option<String>, Option<String>, Option<String>)> =
            Vec::new();
        for (idx, record) in records.iter().enumerate() {
            let key = (record.vcs_url.clone(), record.vcs_hash.clone());
            if !seen.insert(key) {
                continue;
            }
            let ref_hint = if record.vcs_ref.is_empty() {
                None
            } else {
                Some(record.vcs_ref.clone())
            };
            jobs.push((
                idx,
                record.vcs_url.clone(),
                record.vcs_hash.clone(),
                ref_hint,
                Some(record.version.clone()),
                Some(record.timestamp.clone()),
            ));
        }

        let run_job = |job: &(usize, String, String, Option<String>, Option<String>, Option<String>)| {
            let (idx, url, commit, ref_hint, version, timestamp) = job;
            let outcome = verifier.verify(
                url,
                commit,
                ref_hint.as_deref(),
                version.as_deref(),
                timestamp.as_deref(),
            );
            (*idx, url.clone(), commit.clone(), outcome)
        };

        let results: Vec<_> = if self.config.jobs == 0 {
            jobs.iter().map(run_job).collect()
        } else {
            let pool = ThreadPoolBuilder::new()
                .num_threads(self.config.jobs)
                .build()?;
            pool.install(|| jobs.par_iter().map(run_job).collect())
        };

        let mut hard_failures = Vec::new();
        let mut corrections: Vec<(String, String, String)> = Vec::new();
        let mut per_idx_updates: Vec<(usize, Option<String>, Option<String>)> = Vec::new();

        for (idx, url, commit, outcome) in results {
            let outcome = outcome?;

            if let Some(correction) = &outcome.correction {
                tracing::warn!(
                    "{}",
                    GovcsError::TagMoved {
                        url: url.clone(),
                        ref_spec: correction.ref_spec.clone(),
                        old_hash: correction.old_hash.clone(),
                        new_hash: correction.new_hash.clone(),
                    }
                );
                corrections.push((url.clone(), commit.clone(), correction.new_hash.clone()));
                continue;
            }

            if let Some(fallback) = &outcome.fallback {
                tracing::warn!(
                    "{} substituted with fallback commit {}",
                    GovcsError::OrphanedCommit {
                        url: url.clone(),
                        commit: fallback.original_hash.clone(),
                    },
                    fallback.fallback_hash
                );
                per_idx_updates.push((idx, Some(fallback.fallback_hash.clone()), outcome.branch.clone()));
                continue;
            }

            if !outcome.verified {
                let record = &records[idx];
                if record.vcs_ref.is_empty() {
                    tracing::warn!(
                        "{}",
                        GovcsError::ShortHashUnresolved {
                            url: url.clone(),
                            short: commit.clone(),
                        }
                    );
                    hard_failures.push(format!(
                        "{}@{} ({} {})",
                        record.module_path, record.version, url, commit
                    ));
                }
                continue;
            }

            if outcome.branch.is_some() {
                per_idx_updates.push((idx, None, outcome.branch.clone()));
            }
        }

        for (url, old_hash, new_hash) in &corrections {
            for record in records.iter_mut() {
                if &record.vcs_url == url && &record.vcs_hash == old_hash {
                    record.vcs_hash = new_hash.clone();
                }
            }
        }

        for (idx, new_hash, branch) in per_idx_updates {
            let record = &mut records[idx];
            if let Some(hash) = new_hash {
                record.vcs_hash = hash;
            }
            if branch.is_some() {
                record.branch = branch;
            }
        }

        let mut verification_cache = verifier.into_cache();
        verification_cache.save()?;

        if !hard_failures.is_empty() {
            anyhow::bail!(
                "commit unverifiable and no ref hint available for: {}",
                hard_failures.join(", ")
            );
        }

        Ok(())
    }

    /// §4.6: "Legacy (boolean) entries are transparently migrated to v2 ...
    /// on first sight." Folds a pre-v2 `url|||commit -> bool` cache file
    /// into the v2 cache once, via `CommitVerifier::migrate_legacy_entry`;
    /// the legacy file itself is left untouched on disk.
    fn migrate_legacy_verification_cache(&self, verifier: &CommitVerifier) {
        let legacy_path = self.dirs.legacy_verification_path();
        let Ok(bytes) = std::fs::read(&legacy_path) else {
            return;
        };
        let entries: std::collections::BTreeMap<String, bool> = match serde_json::from_slice(&bytes) {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(path = %legacy_path.display(), error = %err, "legacy verification cache unreadable, skipping migration");
                return;
            }
        };
        for (key, verified) in entries {
            if let Some((url, commit)) = key.split_once(crate::cache::KEY_SEP) {
                verifier.migrate_legacy_entry(url, commit, verified);
            }
        }
    }

    /// §4.7 step 6: before the (expensive) C6 thread pool runs, a cheap
    /// `ls-remote`-only pass checks every ref-hinted `(url, commit)` pair
    /// against `ref_points_to_commit`. A tag that has already moved is
    /// rewritten to the commit it now resolves to here, so the dedupe key
    /// C6 builds its job list from reflects the correction up front instead
    /// of discovering it mid-verification.
    fn precorrect_moved_tags(&self, records: &mut [ModuleRecord], ls_remote_cache: &mut LsRemoteCache) {
        let mut repo_commits: HashMap<(String, String), String> = HashMap::new();
        for record in records.iter() {
            if record.vcs_ref.is_empty() {
                continue;
            }
            repo_commits
                .entry((record.vcs_url.clone(), record.vcs_hash.clone()))
                .or_insert_with(|| record.vcs_ref.clone());
        }

        let mut resolver = RemoteRefResolver::new(ls_remote_cache);
        let mut rewrites: Vec<(String, String, String)> = Vec::new();
        for ((url, commit), ref_spec) in &repo_commits {
            match ref_points_to_commit(&mut resolver, url, commit, ref_spec) {
                Ok(true) => {}
                Ok(false) => match correct_from_ref(&mut resolver, url, commit, ref_spec) {
                    Ok(Some(new_commit)) => {
                        tracing::warn!(
                            "{}",
                            GovcsError::TagMoved {
                                url: url.clone(),
                                ref_spec: ref_spec.clone(),
                                old_hash: commit.clone(),
                                new_hash: new_commit.clone(),
                            }
                        );
                        rewrites.push((url.clone(), commit.clone(), new_commit));
                    }
                    Ok(None) => {}
                    Err(err) => {
                        tracing::warn!(url = %url, error = %err, "ref correction check failed, deferring to full verification");
                    }
                },
                Err(err) => {
                    tracing::warn!(url = %url, error = %err, "ref_points_to_commit check failed, deferring to full verification");
                }
            }
        }

        for (url, old_hash, new_hash) in &rewrites {
            for record in records.iter_mut() {
                if &record.vcs_url == url && &record.vcs_hash == old_hash {
                    record.vcs_hash = new_hash.clone();
                }
            }
        }
    }
}

/// After a replace directive redirects resolution to a different module
/// path/version, the emitted record still names the module the build
/// actually required — only `vcs_url`/`vcs_hash`/`vcs_ref`/`subdir` came
/// from the replacement target.
fn restore_original_identity(record: &mut ModuleRecord, original: &Option<(String, String)>) {
    if let Some((module_path, version)) = original {
        record.module_path = module_path.clone();
        record.version = version.clone();
    }
}

/// Final invariant gate: every emitted record must pass its structural
/// checks (hash shape, subdir shape, ref/branch presence) before anything
/// is handed to the emitter. Failures are collected so the run reports
/// every offender at once, with the manual-override commands that can fix
/// each one, rather than aborting on the first.
fn validate_all_structural(records: &[ModuleRecord]) -> Result<()> {
    let offenders: Vec<String> = records
        .iter()
        .filter_map(|record| record.validate_structural().err())
        .map(|err| format!("{err} (try `govcs-gen set-repo` to pin a repository)"))
        .collect();

    if offenders.is_empty() {
        return Ok(());
    }

    anyhow::bail!("invariant violation(s) before emitting:\n  {}", offenders.join("\n  "));
}

fn repo_prefix(module_path: &str) -> String {
    module_path
        .split('/')
        .take(3)
        .collect::<Vec<_>>()
        .join("/")
}

/// Monorepo/sibling reuse: if a module
/// path fails to resolve on its own, try successively shorter path
/// prefixes (down to the 3-segment host/org/repo boundary) and reuse
/// whichever one *does* resolve, recalculating the sub-directory for the
/// original, longer module path.
fn try_monorepo_reuse(
    meta: &mut MetadataResolver,
    resolver: &mut RemoteRefResolver,
    module_path: &str,
    version: &str,
) -> Result<Option<ModuleRecord>> {
    let parts: Vec<&str> = module_path.split('/').collect();
    if parts.len() <= 3 {
        return Ok(None);
    }

    for cut in (3..parts.len()).rev() {
        let prefix = parts[..cut].join("/");
        if let Ok(record) = meta.resolve(&prefix, version, resolver) {
            if let Ok(base_record) = record {
                // Unlike the vanity-redirect subdir recalculation (C4), the
                // remainder here is the literal on-disk path inside the
                // reused repo, not a module-path artifact — a monorepo can
                // genuinely nest a `/vN` directory (e.g. etcd's
                // `server/v3`), so it is kept rather than stripped.
                let subdir = parts[cut..].join("/");
                return Ok(Some(ModuleRecord {
                    module_path: module_path.to_string(),
                    version: version.to_string(),
                    vcs_url: base_record.vcs_url,
                    vcs_hash: base_record.vcs_hash,
                    vcs_ref: base_record.vcs_ref,
                    subdir,
                    timestamp: base_record.timestamp,
                    branch: base_record.branch,
                    derivation: Derivation::MonorepoReuse,
                }));
            }
        }
    }
    Ok(None)
}

/// Reuses a repo already resolved this run for a sibling module under the
/// same host/org/repo prefix, trying the new module's own version tag
/// against that known repository before giving up entirely.
fn try_sibling_reuse(
    resolver: &mut RemoteRefResolver,
    repo_by_prefix: &HashMap<String, (String, String)>,
    module_path: &str,
    version: &str,
) -> Option<ModuleRecord> {
    let (url, _) = repo_by_prefix.get(&repo_prefix(module_path))?;
    let tag_ref = format!("refs/tags/{version}");
    let hash = resolver.lookup(url, &tag_ref).ok().flatten()?;
    Some(ModuleRecord {
        module_path: module_path.to_string(),
        version: version.to_string(),
        vcs_url: url.clone(),
        vcs_hash: hash,
        vcs_ref: tag_ref,
        subdir: String::new(),
        timestamp: "1970-01-01T00:00:00Z".to_string(),
        branch: None,
        derivation: Derivation::SiblingReuse,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_module_list_prefers_go_sum_when_present() {
        let go_mod = "module example.com/m\n\nrequire github.com/a/b v1.0.0\n";
        let go_sum = "github.com/a/b v1.0.0 h1:abc=\ngithub.com/c/d v2.0.0 h1:def=\n";
        let reqs = ResolutionDriver::build_module_list(go_mod, Some(go_sum));
        assert_eq!(reqs.len(), 2);
    }

    #[test]
    fn build_module_list_falls_back_to_go_mod_without_go_sum() {
        let go_mod = "module example.com/m\n\nrequire github.com/a/b v1.0.0\n";
        let reqs = ResolutionDriver::build_module_list(go_mod, None);
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].module_path, "github.com/a/b");
    }

    #[test]
    fn build_module_list_applies_replace_directives() {
        let go_mod = "module example.com/m\n\nrequire github.com/a/b v1.0.0\n\
                      replace github.com/a/b => github.com/fork/b v1.0.1\n";
        let reqs = ResolutionDriver::build_module_list(go_mod, None);
        assert_eq!(reqs[0].module_path, "github.com/fork/b");
        assert_eq!(reqs[0].version, "v1.0.1");
        assert_eq!(
            reqs[0].original,
            Some(("github.com/a/b".to_string(), "v1.0.0".to_string()))
        );
    }

    #[test]
    fn repo_prefix_truncates_to_three_segments() {
        assert_eq!(repo_prefix("go.etcd.io/etcd/server/v3"), "go.etcd.io/etcd/server");
        assert_eq!(repo_prefix("github.com/a/b"), "github.com/a/b");
    }

    fn base_record() -> ModuleRecord {
        ModuleRecord {
            module_path: "github.com/k3s-io/etcd/server/v3".into(),
            version: "v3.5.10-k3s1".into(),
            vcs_url: "https://github.com/k3s-io/etcd".into(),
            vcs_hash: "a".repeat(40),
            vcs_ref: String::new(),
            subdir: "server".into(),
            timestamp: "1970-01-01T00:00:00Z".into(),
            branch: Some("main".into()),
            derivation: Derivation::MonorepoReuse,
        }
    }

    #[test]
    fn restore_original_identity_replaces_module_path_and_version() {
        let mut record = base_record();
        let original = Some(("go.etcd.io/etcd/server/v3".to_string(), "v3.5.10".to_string()));
        restore_original_identity(&mut record, &original);
        assert_eq!(record.module_path, "go.etcd.io/etcd/server/v3");
        assert_eq!(record.version, "v3.5.10");
        // vcs fields stay pointed at the actual resolved fork.
        assert_eq!(record.vcs_url, "https://github.com/k3s-io/etcd");
    }

    #[test]
    fn restore_original_identity_is_noop_without_replace() {
        let mut record = base_record();
        restore_original_identity(&mut record, &None);
        assert_eq!(record.module_path, "github.com/k3s-io/etcd/server/v3");
    }

    #[test]
    fn validate_all_structural_passes_for_valid_records() {
        assert!(validate_all_structural(&[base_record()]).is_ok());
    }

    #[test]
    fn validate_all_structural_reports_bad_hash() {
        let mut record = base_record();
        record.vcs_hash = "deadbeef".into();
        let err = validate_all_structural(&[record]).unwrap_err();
        assert!(err.to_string().contains("set-repo"));
    }
}
