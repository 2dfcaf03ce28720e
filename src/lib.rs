//! `govcs-gen`: resolves Go module (path, version) pairs to verified VCS
//! commits, producing the metadata a downstream build system needs to fetch
//! each dependency by git commit rather than through the Go module proxy.

pub mod cache;
pub mod config;
pub mod driver;
pub mod emit;
pub mod error;
pub mod gitcmd;
pub mod manifest;
pub mod metadata;
pub mod pseudo;
pub mod record;
pub mod remote;
pub mod vanity;
pub mod verify;

pub use config::GeneratorConfig;
pub use driver::{ResolutionDriver, ResolutionOutcome};
pub use error::GovcsError;
pub use record::{Derivation, ModuleRecord};
