//! Output: serializes resolved module records to JSON. Deliberately thin —
//! full BitBake `.inc` recipe text generation is out of scope; downstream
//! tooling consumes this JSON and renders whatever build-system syntax it
//! needs.

use std::io::Write;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::metadata::SkippedModule;
use crate::record::ModuleRecord;

#[derive(Debug, Serialize)]
pub struct EmittedModule {
    #[serde(flatten)]
    pub record: ModuleRecord,
    pub destsuffix_hash: String,
}

#[derive(Debug, Serialize)]
pub struct EmittedSkip {
    pub module_path: String,
    pub version: String,
    pub reason: String,
}

#[derive(Debug, Serialize, Default)]
pub struct EmittedRun {
    pub modules: Vec<EmittedModule>,
    pub skipped: Vec<EmittedSkip>,
}

impl From<&SkippedModule> for EmittedSkip {
    fn from(skip: &SkippedModule) -> Self {
        Self {
            module_path: skip.module_path.clone(),
            version: skip.version.clone(),
            reason: skip.reason.clone(),
        }
    }
}

pub fn build_run(records: &[ModuleRecord], skipped: &[SkippedModule]) -> EmittedRun {
    EmittedRun {
        modules: records
            .iter()
            .map(|record| EmittedModule {
                record: record.clone(),
                destsuffix_hash: record.destsuffix_hash(),
            })
            .collect(),
        skipped: skipped.iter().map(EmittedSkip::from).collect(),
    }
}

/// Writes the run as pretty-printed JSON to `out`.
pub fn write_json(run: &EmittedRun, out: &mut dyn Write) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(run).context("serializing resolution output")?;
    out.write_all(&bytes).context("writing resolution output")?;
    out.write_all(b"\n")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Derivation;

    fn sample_record() -> ModuleRecord {
        ModuleRecord {
            module_path: "github.com/pkg/errors".to_string(),
            version: "v0.9.1".to_string(),
            vcs_url: "https://github.com/pkg/errors".to_string(),
            vcs_hash: "a".repeat(40),
            vcs_ref: "refs/tags/v0.9.1".to_string(),
            subdir: String::new(),
            timestamp: "2020-01-01T00:00:00Z".to_string(),
            branch: None,
            derivation: Derivation::Proxy,
        }
    }

    #[test]
    fn build_run_includes_destsuffix_hash() {
        let run = build_run(&[sample_record()], &[]);
        assert_eq!(run.modules.len(), 1);
        assert_eq!(run.modules[0].destsuffix_hash.len(), 64);
    }

    #[test]
    fn write_json_emits_valid_json() {
        let run = build_run(&[sample_record()], &[]);
        let mut buf = Vec::new();
        write_json(&run, &mut buf).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&buf).unwrap();
        assert!(parsed["modules"][0]["vcs_hash"].is_string());
    }
}
