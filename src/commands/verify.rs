// The `verify` command: cosign verification of module schema artifacts.
// Takes `path@version` module references, resolves them through the
// registry mapping in the environment, and verifies their signatures
// against the public-good Sigstore trusted root.

use crate::libs::download::http_agent;
use crate::libs::signature::{
    ModuleDep, REGISTRY_MAPPING_ENV, VerifyOutcome, VerifyPolicy, parse_registry_mapping,
    verify_module_signatures,
};
use crate::{log_error, log_info, log_warn};
use anyhow::{Result, bail};
use colored::Colorize;
use regex::Regex;

/// The default SAN policy: a GitHub-Actions workflow of the publishing
/// organization.
const DEFAULT_SAN_PATTERN: &str = r"^https://github\.com/.+/\.github/workflows/.+@.+$";

pub struct VerifyArgs {
    pub modules: Vec<String>,
    pub prefix: Option<String>,
    pub san_pattern: Option<String>,
}

pub fn run(args: VerifyArgs) -> Result<()> {
    let deps = args
        .modules
        .iter()
        .map(|raw| ModuleDep::parse(raw))
        .collect::<Result<Vec<_>, _>>()?;

    let mapping_raw = std::env::var(REGISTRY_MAPPING_ENV).unwrap_or_default();
    if mapping_raw.is_empty() {
        log_warn!(
            "[Verify] {} is not set; module references cannot be resolved",
            REGISTRY_MAPPING_ENV.yellow()
        );
    }
    let mappings = parse_registry_mapping(&mapping_raw)?;

    let san_pattern = Regex::new(
        args.san_pattern.as_deref().unwrap_or(DEFAULT_SAN_PATTERN),
    )
    .map_err(|err| anyhow::anyhow!("invalid SAN pattern: {err}"))?;
    let policy = VerifyPolicy::new(args.prefix.as_deref().unwrap_or(""), san_pattern);

    let agent = http_agent();
    let outcomes = verify_module_signatures(&agent, &deps, &policy, &mappings);

    let mut verified = 0usize;
    let mut skipped = 0usize;
    let mut failed = 0usize;
    for (_, outcome) in &outcomes {
        match outcome {
            VerifyOutcome::Verified { .. } => verified += 1,
            VerifyOutcome::Skipped { .. } => skipped += 1,
            VerifyOutcome::Failed { .. } => failed += 1,
        }
    }
    log_info!(
        "[Verify] {} verified, {} skipped, {} failed",
        verified.to_string().green(),
        skipped,
        failed
    );

    if failed > 0 {
        log_error!("[Verify] At least one artifact failed binding verification.");
        bail!("signature verification failed for {failed} module(s)");
    }
    Ok(())
}
