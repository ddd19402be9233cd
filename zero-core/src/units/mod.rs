//! Built-in analyzer unit table.
//!
//! Analyzer internals are opaque: every default unit shells out to the
//! platform's analyzer entry point (`zero-analyzer <name> <worktree>`)
//! and expects an artifact envelope on stdout. Profiles:
//! `quick` ⊂ `standard` ⊂ `deep`.

pub mod subprocess;

use std::sync::Arc;
use std::time::Duration;

use crate::error::ConfigError;
use crate::registry::{Registry, UnitSpec};
use subprocess::SubprocessUnit;

pub const PROFILE_QUICK: &str = "quick";
pub const PROFILE_STANDARD: &str = "standard";
pub const PROFILE_DEEP: &str = "deep";

const ANALYZER_BIN: &str = "zero-analyzer";

fn subprocess_spec(name: &str) -> UnitSpec {
    UnitSpec::new(
        name,
        Arc::new(SubprocessUnit::new(name, ANALYZER_BIN, [name.to_string()])),
    )
}

/// The default declared unit set.
pub fn default_units() -> Vec<UnitSpec> {
    let mut sbom = subprocess_spec("sbom");
    sbom.description = "Software bill of materials".into();
    sbom.base_cost = Duration::from_secs(10);
    sbom.per_file_cost = Duration::from_millis(1);
    sbom.timeout = Some(Duration::from_secs(300));
    sbom.profiles = vec![
        PROFILE_QUICK.into(),
        PROFILE_STANDARD.into(),
        PROFILE_DEEP.into(),
    ];

    let mut secrets = subprocess_spec("secrets");
    secrets.description = "Leaked credential detection".into();
    secrets.base_cost = Duration::from_secs(15);
    secrets.per_file_cost = Duration::from_millis(3);
    secrets.timeout = Some(Duration::from_secs(600));
    secrets.profiles = vec![
        PROFILE_QUICK.into(),
        PROFILE_STANDARD.into(),
        PROFILE_DEEP.into(),
    ];

    let mut licenses = subprocess_spec("licenses");
    licenses.description = "License inventory from the SBOM".into();
    licenses.dependencies = vec!["sbom".into()];
    licenses.base_cost = Duration::from_secs(5);
    licenses.profiles = vec![PROFILE_STANDARD.into(), PROFILE_DEEP.into()];

    let mut vulnerabilities = subprocess_spec("vulnerabilities");
    vulnerabilities.description = "Known-vulnerability matching against the SBOM".into();
    vulnerabilities.dependencies = vec!["sbom".into()];
    vulnerabilities.base_cost = Duration::from_secs(30);
    vulnerabilities.timeout = Some(Duration::from_secs(600));
    vulnerabilities.profiles = vec![PROFILE_STANDARD.into(), PROFILE_DEEP.into()];

    let mut quality = subprocess_spec("quality");
    quality.description = "Code quality and hygiene checks".into();
    quality.base_cost = Duration::from_secs(20);
    quality.per_file_cost = Duration::from_millis(4);
    quality.profiles = vec![PROFILE_STANDARD.into(), PROFILE_DEEP.into()];

    let mut crypto = subprocess_spec("crypto");
    crypto.description = "Cryptographic usage audit".into();
    crypto.base_cost = Duration::from_secs(40);
    crypto.per_file_cost = Duration::from_millis(5);
    crypto.timeout = Some(Duration::from_secs(900));
    crypto.profiles = vec![PROFILE_DEEP.into()];

    vec![sbom, secrets, licenses, vulnerabilities, quality, crypto]
}

/// Registry over the default unit table.
pub fn default_registry() -> Result<Registry, ConfigError> {
    Registry::new(default_units())
}
