// Checksum parsing and verification for downloaded artifacts.
// Three checksum sources are supported:
//   - a direct `algo:hex` value (`sha256:ab12...`),
//   - a GNU-style checksum file (`<hash>  <filename>` / `<hash> *<filename>`),
//   - a structured JSON document (array of versions, each listing files
//     with `filename` and `sha256`).
// When both a direct value and a URL are configured, the direct value wins.

use crate::libs::errors::EnvboxError;
use serde::Deserialize;
use sha2::{Digest, Sha256, Sha512};
use std::fs::File;
use std::io;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumAlgorithm {
    Sha256,
    Sha512,
}

impl ChecksumAlgorithm {
    pub fn parse(name: &str) -> Option<ChecksumAlgorithm> {
        match name.to_lowercase().as_str() {
            "sha256" => Some(ChecksumAlgorithm::Sha256),
            "sha512" => Some(ChecksumAlgorithm::Sha512),
            _ => None,
        }
    }

    /// Infers the algorithm from the hex digest length: 64 characters is
    /// sha256, 128 is sha512.
    pub fn infer_from_digest(hex: &str) -> Option<ChecksumAlgorithm> {
        match hex.len() {
            64 => Some(ChecksumAlgorithm::Sha256),
            128 => Some(ChecksumAlgorithm::Sha512),
            _ => None,
        }
    }
}

/// Parses a direct checksum value of the form `algo:hex`. Returns `None`
/// for anything else (notably URLs, which are fetched instead).
pub fn parse_direct(spec: &str) -> Option<(ChecksumAlgorithm, String)> {
    let (algo_part, hex_part) = spec.split_once(':')?;
    let algorithm = ChecksumAlgorithm::parse(algo_part)?;
    if hex_part.is_empty() || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some((algorithm, hex_part.to_lowercase()))
}

/// Computes the hex digest of a file with the given algorithm.
pub fn hash_file(path: &Path, algorithm: ChecksumAlgorithm) -> io::Result<String> {
    let mut file = File::open(path)?;
    match algorithm {
        ChecksumAlgorithm::Sha256 => {
            let mut hasher = Sha256::new();
            io::copy(&mut file, &mut hasher)?;
            Ok(hex_encode(&hasher.finalize()))
        }
        ChecksumAlgorithm::Sha512 => {
            let mut hasher = Sha512::new();
            io::copy(&mut file, &mut hasher)?;
            Ok(hex_encode(&hasher.finalize()))
        }
    }
}

/// Convenience: the SHA-256 hex digest of a file, recorded as the artifact
/// digest in state entries.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    hash_file(path, ChecksumAlgorithm::Sha256)
}

/// SHA-256 hex digest of an in-memory buffer.
pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex_encode(&hasher.finalize())
}

pub fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Verifies a file against an expected hex digest. A mismatch is an
/// integrity error carrying both digests; no state is mutated for the
/// resource in that case.
pub fn verify_file(
    path: &Path,
    algorithm: ChecksumAlgorithm,
    expected_hex: &str,
) -> Result<(), EnvboxError> {
    let actual = hash_file(path, algorithm).map_err(EnvboxError::from)?;
    let expected = expected_hex.to_lowercase();
    if actual != expected {
        return Err(EnvboxError::Integrity(format!(
            "checksum mismatch for {}: expected {expected}, got {actual}",
            path.display()
        )));
    }
    Ok(())
}

/// Scans a GNU-style checksum file body for the digest of `filename`.
/// Both the two-space text form and the ` *` binary form are accepted.
pub fn find_in_checksum_text(body: &str, filename: &str) -> Option<String> {
    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((digest, rest)) = line.split_once(char::is_whitespace) else {
            continue;
        };
        let entry_name = rest.trim_start().trim_start_matches('*');
        // Some checksum files carry paths; match on the final component too.
        if entry_name == filename
            || entry_name.rsplit('/').next() == Some(filename)
        {
            return Some(digest.to_lowercase());
        }
    }
    None
}

#[derive(Debug, Deserialize)]
struct JsonChecksumVersion {
    #[serde(default)]
    version: String,
    #[serde(default)]
    files: Vec<JsonChecksumFile>,
}

#[derive(Debug, Deserialize)]
struct JsonChecksumFile {
    filename: String,
    sha256: String,
}

/// Looks up `filename` in a structured JSON checksum document: an array of
/// versions, each carrying files with `filename` and `sha256`. When
/// `version` matches no entry, every version's files are searched.
pub fn find_in_checksum_json(body: &str, version: &str, filename: &str) -> Option<String> {
    let versions: Vec<JsonChecksumVersion> = serde_json::from_str(body).ok()?;
    let matching = versions
        .iter()
        .filter(|v| v.version == version || version.is_empty())
        .chain(versions.iter().filter(|v| v.version != version));
    for entry in matching {
        for file in &entry.files {
            if file.filename == filename {
                return Some(file.sha256.to_lowercase());
            }
        }
    }
    None
}

/// Reads a body that is either GNU checksum text or the structured JSON
/// format, returning the digest for `filename`.
pub fn find_digest(body: &str, version: &str, filename: &str) -> Option<String> {
    if body.trim_start().starts_with('[') {
        find_in_checksum_json(body, version, filename)
    } else {
        find_in_checksum_text(body, filename)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_values_parse_and_urls_do_not() {
        let digest = "a".repeat(64);
        let (algo, hex) = parse_direct(&format!("sha256:{digest}")).unwrap();
        assert_eq!(algo, ChecksumAlgorithm::Sha256);
        assert_eq!(hex, digest);

        assert!(parse_direct("https://example.com/checksums.txt").is_none());
        assert!(parse_direct("md5:abcd").is_none());
        assert!(parse_direct("sha256:not-hex!").is_none());
    }

    #[test]
    fn algorithm_inference_by_length() {
        assert_eq!(
            ChecksumAlgorithm::infer_from_digest(&"a".repeat(64)),
            Some(ChecksumAlgorithm::Sha256)
        );
        assert_eq!(
            ChecksumAlgorithm::infer_from_digest(&"a".repeat(128)),
            Some(ChecksumAlgorithm::Sha512)
        );
        assert_eq!(ChecksumAlgorithm::infer_from_digest("abcd"), None);
    }

    #[test]
    fn verify_detects_single_byte_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifact.tar.gz");
        std::fs::write(&path, b"release contents").unwrap();

        let good = sha256_file(&path).unwrap();
        verify_file(&path, ChecksumAlgorithm::Sha256, &good).unwrap();

        // Flip one hex character of the expected digest.
        let mut bad = good.clone().into_bytes();
        bad[0] = if bad[0] == b'0' { b'1' } else { b'0' };
        let bad = String::from_utf8(bad).unwrap();
        let err = verify_file(&path, ChecksumAlgorithm::Sha256, &bad).unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn gnu_checksum_file_lookup() {
        let body = "\
0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef  gh_2.86.0_linux_amd64.tar.gz
fedcba9876543210fedcba9876543210fedcba9876543210fedcba9876543210 *gh_2.86.0_macOS_arm64.zip
";
        assert_eq!(
            find_in_checksum_text(body, "gh_2.86.0_macOS_arm64.zip").as_deref(),
            Some("fedcba9876543210fedcba9876543210fedcba9876543210fedcba9876543210")
        );
        assert!(find_in_checksum_text(body, "missing.tar.gz").is_none());
    }

    #[test]
    fn json_checksum_lookup() {
        let body = r#"[
            {"version": "1.25.1", "files": [
                {"filename": "go1.25.1.linux-amd64.tar.gz", "sha256": "AABB"},
                {"filename": "go1.25.1.darwin-arm64.tar.gz", "sha256": "CCDD"}
            ]}
        ]"#;
        assert_eq!(
            find_in_checksum_json(body, "1.25.1", "go1.25.1.darwin-arm64.tar.gz").as_deref(),
            Some("ccdd")
        );
        assert_eq!(
            find_digest(body, "1.25.1", "go1.25.1.linux-amd64.tar.gz").as_deref(),
            Some("aabb")
        );
    }
}
