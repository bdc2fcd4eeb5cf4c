// Signature verification policies.
// A reconstructed signature passes when all of the following hold:
//   - the leaf certificate's ECDSA-P256 key verifies the signature over
//     the SimpleSigning payload,
//   - the leaf chains to a Fulcio certificate authority from the
//     public-good trusted root (or to the chain shipped with the
//     signature, which itself chains to the trusted root),
//   - the certificate carries the expected OIDC issuer extension and a
//     SAN matching the publishing-workflow policy,
//   - the certificate embeds at least one signed certificate timestamp,
//   - at least one transparency-log entry is present and its signed entry
//     timestamp verifies against the Rekor key from the trusted root,
//     with the integration time inside the certificate's validity window,
//   - the SimpleSigning payload's docker-manifest-digest equals the
//     artifact's digest (artifact binding).
//
// The trusted root is fetched lazily from the Sigstore TUF CDN and cached
// for the process lifetime.

use crate::libs::errors::EnvboxError;
use crate::libs::signature::bundle::{ReconstructedSignature, canonical_rekor_entry};
use crate::log_debug;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use colored::Colorize;
use p256::ecdsa::signature::Verifier as _;
use p256::ecdsa::{Signature, VerifyingKey};
use p256::pkcs8::DecodePublicKey as _;
use regex::Regex;
use std::sync::OnceLock;
use x509_parser::certificate::X509Certificate;
use x509_parser::pem::Pem;
use x509_parser::prelude::{FromDer, GeneralName};
use x509_parser::time::ASN1Time;

const TRUSTED_ROOT_URL: &str = "https://tuf-repo-cdn.sigstore.dev/targets/trusted_root.json";

/// Fulcio certificate extensions (see the Fulcio OID registry).
const OID_FULCIO_ISSUER_V1: &str = "1.3.6.1.4.1.57264.1.1";
const OID_FULCIO_ISSUER_V2: &str = "1.3.6.1.4.1.57264.1.8";
/// RFC 6962 embedded SCT list.
const OID_EMBEDDED_SCTS: &str = "1.3.6.1.4.1.11129.2.4.2";

/// The identity policy a certificate must satisfy.
#[derive(Debug, Clone)]
pub struct IdentityPolicy {
    /// Expected OIDC issuer, e.g. `https://token.actions.githubusercontent.com`.
    pub oidc_issuer: String,
    /// Regex the certificate SAN must match (the publishing workflow).
    pub san_pattern: Regex,
}

impl IdentityPolicy {
    pub fn github_actions(san_pattern: Regex) -> IdentityPolicy {
        IdentityPolicy {
            oidc_issuer: "https://token.actions.githubusercontent.com".to_string(),
            san_pattern,
        }
    }
}

/// Key material extracted from the Sigstore trusted root.
pub struct TrustedRoot {
    /// DER SubjectPublicKeyInfo of each transparency log key.
    pub rekor_keys: Vec<Vec<u8>>,
    /// DER certificates of the Fulcio certificate authorities (full
    /// chains, roots included).
    pub fulcio_certs: Vec<Vec<u8>>,
}

impl TrustedRoot {
    /// Parses the trusted_root.json document.
    pub fn from_json(body: &str) -> Result<TrustedRoot, EnvboxError> {
        let document: serde_json::Value = serde_json::from_str(body)
            .map_err(|err| EnvboxError::Integrity(format!("malformed trusted root: {err}")))?;

        let mut rekor_keys = Vec::new();
        for tlog in document.get("tlogs").and_then(|t| t.as_array()).unwrap_or(&Vec::new()) {
            if let Some(raw) = tlog
                .pointer("/publicKey/rawBytes")
                .and_then(|v| v.as_str())
            {
                let der = BASE64.decode(raw).map_err(|err| {
                    EnvboxError::Integrity(format!("trusted root tlog key is not base64: {err}"))
                })?;
                rekor_keys.push(der);
            }
        }

        let mut fulcio_certs = Vec::new();
        for authority in document
            .get("certificateAuthorities")
            .and_then(|c| c.as_array())
            .unwrap_or(&Vec::new())
        {
            for certificate in authority
                .pointer("/certChain/certificates")
                .and_then(|c| c.as_array())
                .unwrap_or(&Vec::new())
            {
                if let Some(raw) = certificate.get("rawBytes").and_then(|v| v.as_str()) {
                    let der = BASE64.decode(raw).map_err(|err| {
                        EnvboxError::Integrity(format!(
                            "trusted root certificate is not base64: {err}"
                        ))
                    })?;
                    fulcio_certs.push(der);
                }
            }
        }

        if rekor_keys.is_empty() || fulcio_certs.is_empty() {
            return Err(EnvboxError::Integrity(
                "trusted root carries no usable keys".to_string(),
            ));
        }
        Ok(TrustedRoot { rekor_keys, fulcio_certs })
    }

    /// Fetches (once per process) the public-good trusted root.
    pub fn public_good(agent: &ureq::Agent) -> Result<&'static TrustedRoot, EnvboxError> {
        static ROOT: OnceLock<Result<TrustedRoot, String>> = OnceLock::new();
        let cached = ROOT.get_or_init(|| {
            log_debug!("[Cosign] Fetching trusted root from {}", TRUSTED_ROOT_URL.dimmed());
            crate::libs::download::get_text(agent, TRUSTED_ROOT_URL, 8 * 1024 * 1024)
                .and_then(|body| TrustedRoot::from_json(&body))
                .map_err(|err| err.to_string())
        });
        match cached {
            Ok(root) => Ok(root),
            Err(message) => Err(EnvboxError::Transport(format!(
                "trusted root unavailable: {message}"
            ))),
        }
    }
}

/// Verifies one reconstructed signature against the artifact digest.
/// Every failed policy is an integrity error naming the policy.
pub fn verify_signature(
    signature: &ReconstructedSignature,
    artifact_digest: &str,
    policy: &IdentityPolicy,
    root: &TrustedRoot,
) -> Result<(), EnvboxError> {
    // Leaf certificate and message signature.
    let leaf_der = first_pem_block(&signature.certificate_pem)?;
    let (_, leaf) = X509Certificate::from_der(&leaf_der)
        .map_err(|err| EnvboxError::Integrity(format!("malformed leaf certificate: {err}")))?;

    let leaf_key = VerifyingKey::from_sec1_bytes(&leaf.public_key().subject_public_key.data)
        .map_err(|err| {
            EnvboxError::Integrity(format!("leaf certificate key is not ECDSA-P256: {err}"))
        })?;
    let parsed_signature = Signature::from_der(&signature.signature)
        .map_err(|err| EnvboxError::Integrity(format!("malformed signature: {err}")))?;
    leaf_key
        .verify(&signature.payload, &parsed_signature)
        .map_err(|_| EnvboxError::Integrity("signature does not verify over payload".to_string()))?;

    // Identity policy: issuer extension and SAN.
    let issuer = fulcio_issuer(&leaf).ok_or_else(|| {
        EnvboxError::Integrity("certificate carries no OIDC issuer extension".to_string())
    })?;
    if issuer != policy.oidc_issuer {
        return Err(EnvboxError::Integrity(format!(
            "unexpected OIDC issuer '{issuer}'"
        )));
    }
    let san = certificate_sans(&leaf);
    if !san.iter().any(|name| policy.san_pattern.is_match(name)) {
        return Err(EnvboxError::Integrity(format!(
            "no SAN matches the identity policy (saw: {})",
            san.join(", ")
        )));
    }

    // Signed certificate timestamps: at least one embedded SCT list.
    let has_sct = leaf
        .extensions()
        .iter()
        .any(|ext| ext.oid.to_id_string() == OID_EMBEDDED_SCTS);
    if !has_sct {
        return Err(EnvboxError::Integrity(
            "certificate embeds no signed certificate timestamps".to_string(),
        ));
    }

    // Chain to the trusted root: the leaf must be signed by a chain
    // certificate or directly by a trusted-root CA certificate.
    verify_chain(&leaf, signature.chain_pem.as_deref(), root)?;

    // Transparency log: at least one entry with a valid SET, integrated
    // inside the certificate's validity window.
    let rekor = signature.rekor.as_ref().ok_or_else(|| {
        EnvboxError::Integrity("no transparency log entry accompanies the signature".to_string())
    })?;
    let set = BASE64.decode(rekor.signed_entry_timestamp.trim()).map_err(|err| {
        EnvboxError::Integrity(format!("signed entry timestamp is not base64: {err}"))
    })?;
    let set_signature = Signature::from_der(&set).map_err(|err| {
        EnvboxError::Integrity(format!("malformed signed entry timestamp: {err}"))
    })?;
    let canonical = canonical_rekor_entry(&rekor.payload);
    let set_ok = root.rekor_keys.iter().any(|der| {
        VerifyingKey::from_public_key_der(der)
            .map(|key| key.verify(&canonical, &set_signature).is_ok())
            .unwrap_or(false)
    });
    if !set_ok {
        return Err(EnvboxError::Integrity(
            "signed entry timestamp does not verify against the transparency log key".to_string(),
        ));
    }
    let integrated = ASN1Time::from_timestamp(rekor.payload.integrated_time)
        .map_err(|_| EnvboxError::Integrity("invalid integrated time".to_string()))?;
    if !leaf.validity().is_valid_at(integrated) {
        return Err(EnvboxError::Integrity(
            "log integration time falls outside the certificate validity".to_string(),
        ));
    }

    // Artifact binding: the payload must name the digest we verified.
    let simple_signing = signature.simple_signing()?;
    if simple_signing.critical.image.docker_manifest_digest != artifact_digest {
        return Err(EnvboxError::Integrity(format!(
            "artifact binding verification failed: payload names {}, artifact is {artifact_digest}",
            simple_signing.critical.image.docker_manifest_digest
        )));
    }
    Ok(())
}

/// Checks that the leaf verifies under the provided chain or a
/// trusted-root CA, and that any provided chain reaches the trusted root.
fn verify_chain(
    leaf: &X509Certificate<'_>,
    chain_pem: Option<&str>,
    root: &TrustedRoot,
) -> Result<(), EnvboxError> {
    let chain_ders = match chain_pem {
        Some(pem) => all_pem_blocks(pem)?,
        None => Vec::new(),
    };

    // Candidate issuers for the leaf: chain certs first, then CA certs.
    let mut issuer_pool: Vec<Vec<u8>> = chain_ders.clone();
    issuer_pool.extend(root.fulcio_certs.iter().cloned());

    let leaf_verified = issuer_pool.iter().any(|der| {
        X509Certificate::from_der(der)
            .map(|(_, issuer)| leaf.verify_signature(Some(issuer.public_key())).is_ok())
            .unwrap_or(false)
    });
    if !leaf_verified {
        return Err(EnvboxError::Integrity(
            "certificate does not chain to a trusted authority".to_string(),
        ));
    }

    // When a chain is shipped, it must itself connect to the trusted
    // root: some chain certificate is either present in the root's CA
    // set or signed by one of its certificates.
    if !chain_ders.is_empty() {
        let connects = chain_ders.iter().any(|der| {
            if root.fulcio_certs.iter().any(|trusted| trusted == der) {
                return true;
            }
            let Ok((_, cert)) = X509Certificate::from_der(der) else {
                return false;
            };
            root.fulcio_certs.iter().any(|trusted_der| {
                X509Certificate::from_der(trusted_der)
                    .map(|(_, trusted)| cert.verify_signature(Some(trusted.public_key())).is_ok())
                    .unwrap_or(false)
            })
        });
        if !connects {
            return Err(EnvboxError::Integrity(
                "certificate chain does not reach the trusted root".to_string(),
            ));
        }
    }
    Ok(())
}

/// Extracts the Fulcio OIDC issuer from the leaf certificate. The v2
/// extension wraps the value in a DER UTF8String; the v1 extension is the
/// raw string.
fn fulcio_issuer(leaf: &X509Certificate<'_>) -> Option<String> {
    for ext in leaf.extensions() {
        let oid = ext.oid.to_id_string();
        if oid == OID_FULCIO_ISSUER_V2 {
            return decode_der_utf8(ext.value);
        }
        if oid == OID_FULCIO_ISSUER_V1 {
            return Some(String::from_utf8_lossy(ext.value).into_owned());
        }
    }
    None
}

/// Decodes a DER UTF8String (tag 0x0c) with a short-form length; the
/// issuer URL is well under 128 bytes.
fn decode_der_utf8(value: &[u8]) -> Option<String> {
    if value.len() >= 2 && value[0] == 0x0c {
        let length = value[1] as usize;
        if value.len() == 2 + length {
            return String::from_utf8(value[2..].to_vec()).ok();
        }
    }
    String::from_utf8(value.to_vec()).ok()
}

/// The URI and DNS subject alternative names of a certificate.
fn certificate_sans(leaf: &X509Certificate<'_>) -> Vec<String> {
    let Ok(Some(san)) = leaf.subject_alternative_name() else {
        return Vec::new();
    };
    san.value
        .general_names
        .iter()
        .filter_map(|name| match name {
            GeneralName::URI(uri) => Some(uri.to_string()),
            GeneralName::DNSName(dns) => Some(dns.to_string()),
            GeneralName::RFC822Name(email) => Some(email.to_string()),
            _ => None,
        })
        .collect()
}

fn first_pem_block(pem: &str) -> Result<Vec<u8>, EnvboxError> {
    let mut blocks = all_pem_blocks(pem)?;
    if blocks.is_empty() {
        return Err(EnvboxError::Integrity("no PEM block found".to_string()));
    }
    Ok(blocks.remove(0))
}

fn all_pem_blocks(pem: &str) -> Result<Vec<Vec<u8>>, EnvboxError> {
    let mut blocks = Vec::new();
    for parsed in Pem::iter_from_buffer(pem.as_bytes()) {
        let parsed =
            parsed.map_err(|err| EnvboxError::Integrity(format!("malformed PEM: {err}")))?;
        blocks.push(parsed.contents);
    }
    Ok(blocks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trusted_root_parsing_extracts_keys() {
        let body = r#"{
            "tlogs": [
                {"publicKey": {"rawBytes": "AAEC"}}
            ],
            "certificateAuthorities": [
                {"certChain": {"certificates": [{"rawBytes": "AwQF"}, {"rawBytes": "BgcI"}]}}
            ]
        }"#;
        let root = TrustedRoot::from_json(body).unwrap();
        assert_eq!(root.rekor_keys, vec![vec![0u8, 1, 2]]);
        assert_eq!(root.fulcio_certs.len(), 2);
    }

    #[test]
    fn empty_trusted_root_is_rejected() {
        assert!(TrustedRoot::from_json("{}").is_err());
        assert!(TrustedRoot::from_json(r#"{"tlogs": [], "certificateAuthorities": []}"#).is_err());
    }

    #[test]
    fn der_utf8_decoding() {
        let raw = b"\x0c\x05hello";
        assert_eq!(decode_der_utf8(raw).as_deref(), Some("hello"));
        // Raw (v1-style) values pass through.
        assert_eq!(decode_der_utf8(b"https://x").as_deref(), Some("https://x"));
    }
}
