//! Shared plumbing for shelling out to `git` (and, for the discovery step,
//! `go`). Every spawned git process gets non-interactive credentials
//! (`GIT_TERMINAL_PROMPT=0`, `GIT_ASKPASS=true`) and a hard timeout — the
//! ground truth stays in git/go itself, this crate never reimplements
//! packfile parsing.

use std::path::Path;
use std::process::{Command, Output, Stdio};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

pub const TIMEOUT_LS_REMOTE: Duration = Duration::from_secs(90);
pub const TIMEOUT_FETCH: Duration = Duration::from_secs(90);
pub const TIMEOUT_UNSHALLOW: Duration = Duration::from_secs(450);
pub const TIMEOUT_CLONE: Duration = Duration::from_secs(300);
pub const TIMEOUT_DOWNLOAD: Duration = Duration::from_secs(180);
pub const TIMEOUT_LOG: Duration = Duration::from_secs(30);
pub const TIMEOUT_GO_LIST: Duration = Duration::from_secs(60);

/// Builds a `git` command with non-interactive credentials pre-set.
pub fn git() -> Command {
    let mut cmd = Command::new("git");
    cmd.env("GIT_TERMINAL_PROMPT", "0");
    cmd.env("GIT_ASKPASS", "true");
    cmd
}

/// `git -C <dir> ...`
pub fn git_in(dir: &Path) -> Command {
    let mut cmd = git();
    cmd.arg("-C").arg(dir);
    cmd
}

/// Builds a `go` command with `GOPROXY`/`GOMODCACHE` overridden to this
/// run's configured values and non-interactive credentials for whatever git
/// the Go tool shells out to internally.
pub fn go_cmd(goproxy: &str, gomodcache: Option<&camino::Utf8Path>) -> Command {
    let mut cmd = Command::new("go");
    cmd.env("GIT_TERMINAL_PROMPT", "0");
    cmd.env("GIT_ASKPASS", "true");
    cmd.env("GOPROXY", goproxy);
    if let Some(dir) = gomodcache {
        cmd.env("GOMODCACHE", dir.as_str());
    }
    cmd
}

/// Runs `cmd` with a hard wall-clock timeout. A command that exceeds the
/// timeout is treated as a soft failure: we return `Ok(None)`
/// rather than propagating an error, so call sites can cache a negative
/// result for this run without aborting.
///
/// Polls `try_wait` on the calling thread rather than blocking on `wait`,
/// so the timeout can be enforced without platform-specific signal
/// handling; if the deadline passes first, the child is killed.
pub fn run_with_timeout(mut cmd: Command, timeout: Duration) -> Result<Option<Output>> {
    cmd.stdin(Stdio::null());
    let mut child = cmd.spawn().context("spawning git/go subprocess")?;

    let deadline = std::time::Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait().context("polling subprocess status")? {
            let output = collect_output(child, status)?;
            return Ok(Some(output));
        }
        if std::time::Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(None);
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

fn collect_output(mut child: std::process::Child, status: std::process::ExitStatus) -> Result<Output> {
    use std::io::Read;
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    if let Some(mut out) = child.stdout.take() {
        out.read_to_end(&mut stdout).ok();
    }
    if let Some(mut err) = child.stderr.take() {
        err.read_to_end(&mut stderr).ok();
    }
    Ok(Output {
        status,
        stdout,
        stderr,
    })
}

/// Convenience: run with piped stdout/stderr and a timeout, returning the
/// output only on success and within the timeout; `None` on timeout;
/// an error if the process could not be spawned at all.
pub fn run_captured(mut cmd: Command, timeout: Duration) -> Result<Option<Output>> {
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    run_with_timeout(cmd, timeout)
}

pub fn ok_or_err(output: &Output, context: &str) -> Result<()> {
    if output.status.success() {
        Ok(())
    } else {
        Err(anyhow!(
            "{context}: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        ))
    }
}

/// Removes stale `*.lock` files in a bare repository after a failed
/// fetch/clone.
pub fn clear_stale_locks(bare_repo: &Path) {
    let candidates = [
        bare_repo.join("index.lock"),
        bare_repo.join("HEAD.lock"),
        bare_repo.join("config.lock"),
        bare_repo.join("packed-refs.lock"),
    ];
    for path in candidates {
        if path.exists() {
            let _ = std::fs::remove_file(&path);
        }
    }
    if let Ok(entries) = std::fs::read_dir(bare_repo.join("refs")) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().map(|e| e == "lock").unwrap_or(false) {
                let _ = std::fs::remove_file(path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn git_sets_non_interactive_env() {
        let cmd = git();
        let envs: Vec<_> = cmd.get_envs().collect();
        assert!(envs
            .iter()
            .any(|(k, v)| *k == "GIT_TERMINAL_PROMPT" && *v == Some("0".as_ref())));
        assert!(envs
            .iter()
            .any(|(k, v)| *k == "GIT_ASKPASS" && *v == Some("true".as_ref())));
    }

    #[test]
    fn run_with_timeout_returns_none_on_timeout() {
        let mut cmd = Command::new("sleep");
        cmd.arg("5");
        let result = run_with_timeout(cmd, Duration::from_millis(100)).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn run_with_timeout_returns_output_on_success() {
        let mut cmd = Command::new("true");
        let result = run_captured(cmd_stdio(&mut cmd), Duration::from_secs(5)).unwrap();
        assert!(result.is_some());
        assert!(result.unwrap().status.success());
    }

    fn cmd_stdio(cmd: &mut Command) -> Command {
        std::mem::replace(cmd, Command::new("true"))
    }

    #[test]
    fn clear_stale_locks_removes_known_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("HEAD.lock"), b"").unwrap();
        clear_stale_locks(dir.path());
        assert!(!dir.path().join("HEAD.lock").exists());
    }
}
