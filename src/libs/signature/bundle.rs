// Cosign signature material reconstruction.
// On the registry, a cosign signature is an OCI image whose layers are
// SimpleSigning payloads; the signature, the Fulcio certificate, the
// certificate chain and the Rekor transparency-log entry ride along as
// layer annotations (the v2 annotation format). The verifier needs the
// pieces assembled the way a protobuf bundle would carry them: decoded
// signature bytes, parsed certificates, the Rekor entry with its signed
// timestamp, and the payload whose SHA-256 is the signed message digest.

use crate::libs::errors::EnvboxError;
use crate::libs::signature::oci::{OciClient, OciRef};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;

/// SimpleSigning payloads are small JSON documents; anything beyond this
/// cap is not a signature payload.
pub const MAX_PAYLOAD_BYTES: u64 = 1024 * 1024;

/// Annotation keys of the v2 on-registry signature format. The legacy
/// `dev.sigstore.cosign/bundle` protobuf annotation is accepted through
/// the same key; it carries the same Rekor entry fields but binds the
/// signature less tightly to the artifact.
const ANNOTATION_SIGNATURE: &str = "dev.cosignproject.cosign/signature";
const ANNOTATION_CERTIFICATE: &str = "dev.sigstore.cosign/certificate";
const ANNOTATION_CHAIN: &str = "dev.sigstore.cosign/chain";
const ANNOTATION_BUNDLE: &str = "dev.sigstore.cosign/bundle";

/// The Rekor entry cosign stores in the bundle annotation.
#[derive(Debug, Clone, Deserialize)]
pub struct RekorBundle {
    #[serde(rename = "SignedEntryTimestamp")]
    pub signed_entry_timestamp: String,
    #[serde(rename = "Payload")]
    pub payload: RekorPayload,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RekorPayload {
    pub body: String,
    #[serde(rename = "integratedTime")]
    pub integrated_time: i64,
    #[serde(rename = "logIndex")]
    pub log_index: i64,
    #[serde(rename = "logID")]
    pub log_id: String,
}

/// One signature reassembled from a manifest layer: everything the
/// verifier consumes, in decoded form.
#[derive(Debug, Clone)]
pub struct ReconstructedSignature {
    /// DER-encoded ECDSA signature over the SimpleSigning payload.
    pub signature: Vec<u8>,
    /// PEM leaf certificate issued by Fulcio.
    pub certificate_pem: String,
    /// Optional PEM chain up to the Fulcio root.
    pub chain_pem: Option<String>,
    /// The transparency-log entry, when one was uploaded.
    pub rekor: Option<RekorBundle>,
    /// The SimpleSigning payload (the layer body). Its SHA-256 is the
    /// message digest the signature covers.
    pub payload: Vec<u8>,
}

/// The subset of the SimpleSigning payload the binding check reads.
#[derive(Debug, Deserialize)]
pub struct SimpleSigning {
    pub critical: SimpleSigningCritical,
}

#[derive(Debug, Deserialize)]
pub struct SimpleSigningCritical {
    pub image: SimpleSigningImage,
    #[serde(rename = "type")]
    pub signature_type: String,
}

#[derive(Debug, Deserialize)]
pub struct SimpleSigningImage {
    #[serde(rename = "docker-manifest-digest")]
    pub docker_manifest_digest: String,
}

impl ReconstructedSignature {
    /// Parses the SimpleSigning payload.
    pub fn simple_signing(&self) -> Result<SimpleSigning, EnvboxError> {
        serde_json::from_slice(&self.payload).map_err(|err| {
            EnvboxError::Integrity(format!("malformed SimpleSigning payload: {err}"))
        })
    }
}

/// Fetches the signature image for `signature_ref` and reconstructs every
/// signature layer. An empty result means the artifact is signed with
/// nothing the verifier understands.
pub fn fetch_signatures(
    client: &OciClient,
    signature_ref: &OciRef,
) -> Result<Vec<ReconstructedSignature>, EnvboxError> {
    let manifest = client.get_manifest(signature_ref)?;
    let layers = manifest
        .get("layers")
        .and_then(|l| l.as_array())
        .cloned()
        .unwrap_or_default();

    let mut signatures = Vec::new();
    for layer in &layers {
        match reconstruct_layer(client, signature_ref, layer)? {
            Some(signature) => signatures.push(signature),
            None => continue,
        }
    }
    Ok(signatures)
}

/// Reassembles one manifest layer; layers without a signature annotation
/// are skipped, malformed annotation values are integrity errors.
fn reconstruct_layer(
    client: &OciClient,
    signature_ref: &OciRef,
    layer: &serde_json::Value,
) -> Result<Option<ReconstructedSignature>, EnvboxError> {
    let annotations = layer.get("annotations").and_then(|a| a.as_object());
    let Some(annotations) = annotations else {
        return Ok(None);
    };
    let Some(signature_b64) = annotations.get(ANNOTATION_SIGNATURE).and_then(|v| v.as_str())
    else {
        return Ok(None);
    };
    let signature = BASE64.decode(signature_b64.trim()).map_err(|err| {
        EnvboxError::Integrity(format!("signature annotation is not base64: {err}"))
    })?;

    let certificate_pem = annotations
        .get(ANNOTATION_CERTIFICATE)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| {
            EnvboxError::Integrity("signature layer carries no certificate".to_string())
        })?;
    let chain_pem = annotations
        .get(ANNOTATION_CHAIN)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string());

    let rekor = match annotations.get(ANNOTATION_BUNDLE).and_then(|v| v.as_str()) {
        Some(raw) => Some(serde_json::from_str::<RekorBundle>(raw).map_err(|err| {
            EnvboxError::Integrity(format!("malformed Rekor bundle annotation: {err}"))
        })?),
        None => None,
    };

    let digest = layer
        .get("digest")
        .and_then(|d| d.as_str())
        .ok_or_else(|| EnvboxError::Integrity("signature layer has no digest".to_string()))?;
    let payload = client.get_blob(signature_ref, digest, MAX_PAYLOAD_BYTES)?;

    Ok(Some(ReconstructedSignature {
        signature,
        certificate_pem,
        chain_pem,
        rekor,
        payload,
    }))
}

/// The canonical JSON Rekor signs for the SET: the four entry fields with
/// keys in lexicographic order. `serde_json`'s map is ordered, so
/// building the document through it yields canonical bytes.
pub fn canonical_rekor_entry(payload: &RekorPayload) -> Vec<u8> {
    let entry = serde_json::json!({
        "body": payload.body,
        "integratedTime": payload.integrated_time,
        "logID": payload.log_id,
        "logIndex": payload.log_index,
    });
    serde_json::to_vec(&entry).expect("canonical entry serializes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_entry_orders_keys() {
        let payload = RekorPayload {
            body: "Ym9keQ==".into(),
            integrated_time: 1700000000,
            log_index: 42,
            log_id: "c0ffee".into(),
        };
        let canonical = String::from_utf8(canonical_rekor_entry(&payload)).unwrap();
        assert_eq!(
            canonical,
            r#"{"body":"Ym9keQ==","integratedTime":1700000000,"logID":"c0ffee","logIndex":42}"#
        );
    }

    #[test]
    fn simple_signing_payload_parses() {
        let raw = br#"{
            "critical": {
                "identity": {"docker-reference": "ghcr.io/org/mod"},
                "image": {"docker-manifest-digest": "sha256:abc123"},
                "type": "cosign container image signature"
            },
            "optional": null
        }"#;
        let signature = ReconstructedSignature {
            signature: vec![],
            certificate_pem: String::new(),
            chain_pem: None,
            rekor: None,
            payload: raw.to_vec(),
        };
        let parsed = signature.simple_signing().unwrap();
        assert_eq!(parsed.critical.image.docker_manifest_digest, "sha256:abc123");
        assert_eq!(parsed.critical.signature_type, "cosign container image signature");
    }

    #[test]
    fn rekor_bundle_annotation_parses() {
        let raw = r#"{
            "SignedEntryTimestamp": "MEUCIQDx",
            "Payload": {
                "body": "eyJhcGlWZXJzaW9uIjoiMC4wLjEifQ==",
                "integratedTime": 1700000000,
                "logIndex": 12345,
                "logID": "c0d23d6ad406973f9559f3ba2d1ca01f84147d8ffc5b8445c224f98b9591801d"
            }
        }"#;
        let bundle: RekorBundle = serde_json::from_str(raw).unwrap();
        assert_eq!(bundle.payload.log_index, 12345);
        assert_eq!(bundle.payload.integrated_time, 1700000000);
    }
}
