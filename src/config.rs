//! Runtime configuration: environment variables and defaults, in the same
//! env-backed style as the `GIT_CACHE_DIR` clap argument this crate grew
//! out of.

use camino::Utf8PathBuf;

/// `GOPROXY` defaults to the public Go module proxy chain, matching the
/// `go` toolchain's own default.
const DEFAULT_GOPROXY: &str = "https://proxy.golang.org,direct";

fn default_cache_base() -> Utf8PathBuf {
    shellexpand::tilde("~/.cache/govcs-gen").into_owned().into()
}

/// Resolved settings for one generator run.
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    /// Base directory for all JSON caches and bare-clone mirrors.
    pub cache_base: Utf8PathBuf,
    /// `GOPROXY`-style comma-separated proxy list; currently informational —
    /// this crate always talks to VCS origins directly rather than the
    /// module proxy, but the value is threaded through so future proxy
    /// support has a home.
    pub goproxy: String,
    /// `GOMODCACHE` this run's spawned `go` commands see. Per §6, this is
    /// always overridden to a private location under the cache base rather
    /// than inherited from the caller's environment, so the metadata
    /// fallback's `go list` invocation never pollutes (or is polluted by) a
    /// user's own module cache.
    pub gomodcache: Utf8PathBuf,
    /// Bounded worker count for commit-verification fan-out; `0` means run
    /// sequentially on the calling thread.
    pub jobs: usize,
    /// How long a successful verification stays trusted before it's
    /// re-checked against the origin.
    pub verification_max_age_days: i64,
}

impl GeneratorConfig {
    /// Builds configuration from environment variables, falling back to the
    /// documented defaults for anything unset.
    pub fn from_env() -> Self {
        let cache_base = std::env::var("GOVCS_GEN_CACHE_DIR")
            .ok()
            .filter(|v| !v.is_empty())
            .map(Utf8PathBuf::from)
            .unwrap_or_else(default_cache_base);

        let goproxy = std::env::var("GOPROXY")
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_GOPROXY.to_string());

        let jobs = std::env::var("GOVCS_GEN_JOBS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);

        let verification_max_age_days = std::env::var("GOVCS_GEN_VERIFY_MAX_AGE_DAYS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30);

        let gomodcache = cache_base.join("gomodcache");

        Self {
            cache_base,
            goproxy,
            gomodcache,
            jobs,
            verification_max_age_days,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_cache_base_expands_tilde() {
        let path = default_cache_base();
        assert!(!path.as_str().starts_with('~'));
        assert!(path.as_str().ends_with("govcs-gen"));
    }

    #[test]
    fn gomodcache_is_private_to_the_cache_base() {
        let config = GeneratorConfig::from_env();
        assert!(config.gomodcache.starts_with(&config.cache_base));
    }
}
