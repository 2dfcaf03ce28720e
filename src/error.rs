use thiserror::Error;

/// The distinct error kinds from the error-handling design: each is handled
/// differently by the driver (some abort the run, some only produce a
/// skipped-module entry).
#[derive(Debug, Error)]
pub enum GovcsError {
    #[error("network failure resolving {module}: {source}")]
    NetworkTransient {
        module: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("ls-remote returned nothing for {url} {ref_spec}")]
    LsRemoteEmpty { url: String, ref_spec: String },

    #[error("commit {commit} for {url} is orphaned (not reachable from any branch)")]
    OrphanedCommit { url: String, commit: String },

    #[error("tag {ref_spec} on {url} moved from {old_hash} to {new_hash}")]
    TagMoved {
        url: String,
        ref_spec: String,
        old_hash: String,
        new_hash: String,
    },

    #[error("short hash {short} for {url} could not be expanded to a full commit")]
    ShortHashUnresolved { url: String, short: String },

    #[error("override for {module} points at a disallowed url {url}")]
    DisallowedOverride { module: String, url: String },

    #[error("cache file {path} is corrupt: {source}")]
    CacheCorrupt {
        path: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("invariant violation for {module}@{version}: {reason}")]
    InvariantViolation {
        module: String,
        version: String,
        reason: String,
    },
}

pub type Result<T> = std::result::Result<T, anyhow::Error>;
