// Module schema signature verification.
// Manifests may depend on module schemas published as OCI artifacts.
// For every module dependency matching the first-party prefix policy,
// the verifier resolves the module to an OCI tag via the registry
// mapping, reads the artifact digest, fetches the cosign signature image
// stored under the `sha256-<hex>.sig` sibling tag, reconstructs the
// signature bundles and verifies them against the public-good Sigstore
// trusted root.
//
// Failure policy for the initial release: everything short of a bound,
// failed verification is a skip with a reason (unsigned artifacts,
// unreachable registries, unresolvable references). A signature that
// verifies but binds to a different digest is a hard failure.

pub mod bundle;
pub mod oci;
pub mod verify;

use crate::libs::errors::EnvboxError;
use crate::libs::signature::oci::{OciClient, OciRef};
use crate::libs::signature::verify::{IdentityPolicy, TrustedRoot, verify_signature};
use crate::{log_debug, log_info, log_warn};
use colored::Colorize;
use regex::Regex;

/// Environment variable naming the module registry mapping, using the
/// same `prefix=registry/repository` comma-separated syntax CUE uses.
pub const REGISTRY_MAPPING_ENV: &str = "CUE_REGISTRY";

/// A module dependency: import path plus version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleDep {
    pub path: String,
    pub version: String,
}

impl ModuleDep {
    /// Parses `path@version`.
    pub fn parse(raw: &str) -> Result<ModuleDep, EnvboxError> {
        let (path, version) = raw.split_once('@').ok_or_else(|| {
            EnvboxError::Configuration(format!(
                "invalid module dependency '{raw}': expected path@version"
            ))
        })?;
        if path.is_empty() || version.is_empty() {
            return Err(EnvboxError::Configuration(format!(
                "invalid module dependency '{raw}'"
            )));
        }
        Ok(ModuleDep { path: path.to_string(), version: version.to_string() })
    }
}

/// One `prefix=registry/repository` mapping entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryMapping {
    pub prefix: String,
    pub registry: String,
}

/// Parses a comma-separated mapping list (`host=repo,host2=repo2`).
pub fn parse_registry_mapping(raw: &str) -> Result<Vec<RegistryMapping>, EnvboxError> {
    let mut mappings = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (prefix, registry) = entry.split_once('=').ok_or_else(|| {
            EnvboxError::Configuration(format!(
                "invalid registry mapping entry '{entry}': expected prefix=registry"
            ))
        })?;
        if prefix.is_empty() || registry.is_empty() {
            return Err(EnvboxError::Configuration(format!(
                "invalid registry mapping entry '{entry}'"
            )));
        }
        mappings.push(RegistryMapping {
            prefix: prefix.to_string(),
            registry: registry.trim_end_matches('/').to_string(),
        });
    }
    Ok(mappings)
}

/// Resolves a module dependency to its OCI tag reference: the longest
/// matching prefix wins, the module path lands under the mapped
/// repository (lowercased, as OCI repositories require), the version is
/// the tag.
pub fn resolve_module_ref(
    mappings: &[RegistryMapping],
    dep: &ModuleDep,
) -> Result<OciRef, EnvboxError> {
    let matching = mappings
        .iter()
        .filter(|m| dep.path == m.prefix || dep.path.starts_with(&format!("{}/", m.prefix)))
        .max_by_key(|m| m.prefix.len())
        .ok_or_else(|| {
            EnvboxError::Resolution(format!(
                "no registry mapping covers module '{}'",
                dep.path
            ))
        })?;
    let reference = format!(
        "{}/{}:{}",
        matching.registry,
        dep.path.to_lowercase(),
        dep.version
    );
    OciRef::parse(&reference)
}

/// What verification concluded for one module dependency.
#[derive(Debug, Clone)]
pub enum VerifyOutcome {
    /// At least one signature verified and binds the artifact digest.
    Verified { reference: String, digest: String },
    /// Verification could not be attempted or produced nothing usable.
    Skipped { reason: String },
    /// A signature verified but binds a different artifact.
    Failed { reason: String },
}

/// Verification policy: which modules are in scope and what identity the
/// signing certificate must present.
pub struct VerifyPolicy {
    /// Only module paths starting with this prefix are verified; an empty
    /// prefix verifies everything.
    pub first_party_prefix: String,
    pub identity: IdentityPolicy,
}

impl VerifyPolicy {
    pub fn new(first_party_prefix: &str, san_pattern: Regex) -> VerifyPolicy {
        VerifyPolicy {
            first_party_prefix: first_party_prefix.to_string(),
            identity: IdentityPolicy::github_actions(san_pattern),
        }
    }

    fn in_scope(&self, dep: &ModuleDep) -> bool {
        self.first_party_prefix.is_empty() || dep.path.starts_with(&self.first_party_prefix)
    }
}

/// Verifies every in-scope module dependency, returning one outcome per
/// dependency (out-of-scope modules are skipped with a reason).
pub fn verify_module_signatures(
    agent: &ureq::Agent,
    deps: &[ModuleDep],
    policy: &VerifyPolicy,
    mappings: &[RegistryMapping],
) -> Vec<(ModuleDep, VerifyOutcome)> {
    let client = OciClient::new(agent.clone());
    deps.iter()
        .map(|dep| {
            let outcome = if policy.in_scope(dep) {
                verify_one(agent, &client, dep, policy, mappings)
            } else {
                VerifyOutcome::Skipped {
                    reason: "outside the first-party prefix policy".to_string(),
                }
            };
            report(dep, &outcome);
            (dep.clone(), outcome)
        })
        .collect()
}

fn verify_one(
    agent: &ureq::Agent,
    client: &OciClient,
    dep: &ModuleDep,
    policy: &VerifyPolicy,
    mappings: &[RegistryMapping],
) -> VerifyOutcome {
    // Reference resolution failures are soft.
    let reference = match resolve_module_ref(mappings, dep) {
        Ok(reference) => reference,
        Err(err) => {
            return VerifyOutcome::Skipped { reason: format!("reference resolution failed: {err}") };
        }
    };

    let digest = match client.head_manifest_digest(&reference) {
        Ok(digest) => digest,
        Err(err) => {
            return VerifyOutcome::Skipped { reason: format!("artifact unavailable: {err}") };
        }
    };

    // A missing signature tag means the artifact is unsigned.
    let signature_ref = reference.signature_sibling(&digest);
    let signatures = match bundle::fetch_signatures(client, &signature_ref) {
        Ok(signatures) => signatures,
        Err(err) => {
            return VerifyOutcome::Skipped {
                reason: format!("signature fetch failed ({signature_ref}): {err}"),
            };
        }
    };
    if signatures.is_empty() {
        return VerifyOutcome::Skipped { reason: "artifact is unsigned".to_string() };
    }

    let root = match TrustedRoot::public_good(agent) {
        Ok(root) => root,
        Err(err) => {
            return VerifyOutcome::Skipped { reason: err.to_string() };
        }
    };

    let mut failures = Vec::new();
    for signature in &signatures {
        match verify_signature(signature, &digest, &policy.identity, root) {
            Ok(()) => {
                return VerifyOutcome::Verified { reference: reference.to_string(), digest };
            }
            Err(err) => {
                let message = err.to_string();
                // A digest-binding mismatch is the one hard failure: the
                // signature itself is sound but covers something else.
                if message.contains("artifact binding verification failed") {
                    return VerifyOutcome::Failed { reason: message };
                }
                failures.push(message);
            }
        }
    }
    VerifyOutcome::Skipped {
        reason: format!("all signatures failed: {}", failures.join("; ")),
    }
}

fn report(dep: &ModuleDep, outcome: &VerifyOutcome) {
    match outcome {
        VerifyOutcome::Verified { reference, digest } => {
            log_info!(
                "[Cosign] Verified {}@{} ({} at {})",
                dep.path.bold(),
                dep.version,
                reference.cyan(),
                digest.dimmed()
            );
        }
        VerifyOutcome::Skipped { reason } => {
            log_warn!(
                "[Cosign] Skipping verification of {}@{}: {}",
                dep.path.yellow(),
                dep.version,
                reason
            );
        }
        VerifyOutcome::Failed { reason } => {
            log_warn!("[Cosign] {}@{}: {}", dep.path.red(), dep.version, reason);
        }
    }
    log_debug!("[Cosign] Outcome for {}@{} recorded", dep.path, dep.version);
}
