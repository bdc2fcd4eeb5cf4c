// Minimal OCI registry client for the signature verifier.
// Speaks just enough of the distribution protocol to verify cosign
// signatures: HEAD a manifest for its digest, GET a manifest, GET layer
// blobs. Anonymous bearer tokens are negotiated through the
// WWW-Authenticate challenge and cached per repository. All requests for
// one artifact stay on the artifact's registry host.

use crate::libs::errors::EnvboxError;
use crate::log_debug;
use colored::Colorize;
use std::collections::HashMap;
use std::io::Read;
use std::sync::Mutex;

const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.manifest.v1+json, \
     application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.oci.image.index.v1+json";

/// A parsed OCI reference: `host/repository:tag`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OciRef {
    pub host: String,
    pub repository: String,
    pub tag: String,
}

impl OciRef {
    pub fn parse(reference: &str) -> Result<OciRef, EnvboxError> {
        let (name, tag) = reference.rsplit_once(':').ok_or_else(|| {
            EnvboxError::Resolution(format!("invalid OCI reference '{reference}': missing tag"))
        })?;
        let (host, repository) = name.split_once('/').ok_or_else(|| {
            EnvboxError::Resolution(format!(
                "invalid OCI reference '{reference}': missing repository"
            ))
        })?;
        if host.is_empty() || repository.is_empty() || tag.is_empty() {
            return Err(EnvboxError::Resolution(format!(
                "invalid OCI reference '{reference}'"
            )));
        }
        Ok(OciRef {
            host: host.to_string(),
            repository: repository.to_string(),
            tag: tag.to_string(),
        })
    }

    /// The sibling tag cosign stores signatures under for a digest:
    /// `sha256-<hex>.sig`.
    pub fn signature_sibling(&self, digest: &str) -> OciRef {
        let tag = format!("{}.sig", digest.replace(':', "-"));
        OciRef { host: self.host.clone(), repository: self.repository.clone(), tag }
    }

}

impl std::fmt::Display for OciRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}:{}", self.host, self.repository, self.tag)
    }
}

pub struct OciClient {
    agent: ureq::Agent,
    /// URL scheme, https outside of tests.
    scheme: String,
    /// Anonymous pull tokens keyed by host/repository.
    tokens: Mutex<HashMap<String, String>>,
}

impl OciClient {
    pub fn new(agent: ureq::Agent) -> OciClient {
        OciClient {
            agent,
            scheme: "https".to_string(),
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Overrides the URL scheme; the tests run a plain-http registry stub.
    pub fn with_scheme(mut self, scheme: &str) -> OciClient {
        self.scheme = scheme.to_string();
        self
    }

    fn manifest_url(&self, reference: &OciRef) -> String {
        format!(
            "{}://{}/v2/{}/manifests/{}",
            self.scheme, reference.host, reference.repository, reference.tag
        )
    }

    fn blob_url(&self, reference: &OciRef, digest: &str) -> String {
        format!(
            "{}://{}/v2/{}/blobs/{}",
            self.scheme, reference.host, reference.repository, digest
        )
    }

    /// HEADs the manifest and returns its content digest.
    pub fn head_manifest_digest(&self, reference: &OciRef) -> Result<String, EnvboxError> {
        let response = self.request("HEAD", &self.manifest_url(reference), reference)?;
        match response.header("Docker-Content-Digest") {
            Some(digest) => Ok(digest.to_string()),
            // Some registries omit the digest header on HEAD; fall back to
            // hashing the manifest body.
            None => {
                let body = self.get_manifest_bytes(reference)?;
                Ok(format!(
                    "sha256:{}",
                    crate::libs::utilities::checksum::sha256_bytes(&body)
                ))
            }
        }
    }

    /// GETs the manifest as parsed JSON.
    pub fn get_manifest(&self, reference: &OciRef) -> Result<serde_json::Value, EnvboxError> {
        let body = self.get_manifest_bytes(reference)?;
        serde_json::from_slice(&body).map_err(|err| {
            EnvboxError::Resolution(format!("malformed manifest for {reference}: {err}"))
        })
    }

    fn get_manifest_bytes(&self, reference: &OciRef) -> Result<Vec<u8>, EnvboxError> {
        let response = self.request("GET", &self.manifest_url(reference), reference)?;
        read_capped(response, 4 * 1024 * 1024)
    }

    /// GETs a layer blob, capped at `max_bytes`.
    pub fn get_blob(
        &self,
        reference: &OciRef,
        digest: &str,
        max_bytes: u64,
    ) -> Result<Vec<u8>, EnvboxError> {
        let response = self.request("GET", &self.blob_url(reference, digest), reference)?;
        read_capped(response, max_bytes)
    }

    /// Performs one request, negotiating an anonymous bearer token on a
    /// 401 challenge and retrying once with it.
    fn request(
        &self,
        method: &str,
        url: &str,
        reference: &OciRef,
    ) -> Result<ureq::Response, EnvboxError> {
        let token_key = format!("{}/{}", reference.host, reference.repository);
        let cached = self.tokens.lock().unwrap().get(&token_key).cloned();

        match self.send(method, url, cached.as_deref()) {
            Ok(response) => Ok(response),
            Err(ureq::Error::Status(401, response)) => {
                let challenge = response
                    .header("WWW-Authenticate")
                    .map(|v| v.to_string())
                    .ok_or_else(|| {
                        EnvboxError::Transport(format!("{url}: 401 without a challenge"))
                    })?;
                let token = self.fetch_token(&challenge, reference)?;
                self.tokens.lock().unwrap().insert(token_key, token.clone());
                self.send(method, url, Some(&token)).map_err(|err| transport_error(url, err))
            }
            Err(err) => Err(transport_error(url, err)),
        }
    }

    fn send(
        &self,
        method: &str,
        url: &str,
        token: Option<&str>,
    ) -> Result<ureq::Response, ureq::Error> {
        let mut request = self.agent.request(method, url).set("Accept", MANIFEST_ACCEPT);
        if let Some(token) = token {
            request = request.set("Authorization", &format!("Bearer {token}"));
        }
        request.call()
    }

    /// Follows a `Bearer realm=...,service=...,scope=...` challenge to an
    /// anonymous pull token.
    fn fetch_token(&self, challenge: &str, reference: &OciRef) -> Result<String, EnvboxError> {
        let params = parse_challenge(challenge);
        let realm = params.get("realm").ok_or_else(|| {
            EnvboxError::Transport(format!("unsupported auth challenge '{challenge}'"))
        })?;
        let service = params
            .get("service")
            .cloned()
            .unwrap_or_else(|| reference.host.clone());
        let scope = params
            .get("scope")
            .cloned()
            .unwrap_or_else(|| format!("repository:{}:pull", reference.repository));

        let url = format!("{realm}?service={service}&scope={scope}");
        log_debug!("[Cosign] Fetching anonymous pull token from {}", url.dimmed());
        let response = self
            .agent
            .get(&url)
            .call()
            .map_err(|err| transport_error(&url, err))?;

        #[derive(serde::Deserialize)]
        struct TokenResponse {
            #[serde(default)]
            token: String,
            #[serde(default)]
            access_token: String,
        }
        let parsed: TokenResponse = response
            .into_json()
            .map_err(|err| EnvboxError::Transport(format!("parsing token response: {err}")))?;
        let token = if !parsed.token.is_empty() { parsed.token } else { parsed.access_token };
        if token.is_empty() {
            return Err(EnvboxError::Transport(format!(
                "token endpoint {url} returned no token"
            )));
        }
        Ok(token)
    }
}

fn transport_error(url: &str, err: ureq::Error) -> EnvboxError {
    match err {
        ureq::Error::Status(code, _) => {
            EnvboxError::Transport(format!("{url} returned HTTP {code}"))
        }
        other => EnvboxError::Transport(format!("{url}: {other}")),
    }
}

fn read_capped(response: ureq::Response, max_bytes: u64) -> Result<Vec<u8>, EnvboxError> {
    let mut body = Vec::new();
    response
        .into_reader()
        .take(max_bytes)
        .read_to_end(&mut body)
        .map_err(|err| EnvboxError::Transport(format!("reading response body: {err}")))?;
    Ok(body)
}

/// Parses the parameter list of a `Bearer k="v",k2="v2"` challenge.
fn parse_challenge(challenge: &str) -> HashMap<String, String> {
    let rest = challenge.strip_prefix("Bearer ").unwrap_or(challenge);
    rest.split(',')
        .filter_map(|pair| {
            let (key, value) = pair.trim().split_once('=')?;
            Some((key.trim().to_string(), value.trim().trim_matches('"').to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_parsing() {
        let parsed = OciRef::parse("ghcr.io/org/modules/example.com/env:v1.2.3").unwrap();
        assert_eq!(parsed.host, "ghcr.io");
        assert_eq!(parsed.repository, "org/modules/example.com/env");
        assert_eq!(parsed.tag, "v1.2.3");

        assert!(OciRef::parse("no-tag-here").is_err());
        assert!(OciRef::parse("host-only:v1").is_err());
    }

    #[test]
    fn signature_sibling_tag() {
        let parsed = OciRef::parse("ghcr.io/org/mod:v1.0.0").unwrap();
        let sibling = parsed.signature_sibling("sha256:abcd1234");
        assert_eq!(sibling.tag, "sha256-abcd1234.sig");
        assert_eq!(sibling.repository, parsed.repository);
    }

    #[test]
    fn challenge_parameter_parsing() {
        let params = parse_challenge(
            r#"Bearer realm="https://ghcr.io/token",service="ghcr.io",scope="repository:org/mod:pull""#,
        );
        assert_eq!(params["realm"], "https://ghcr.io/token");
        assert_eq!(params["service"], "ghcr.io");
        assert_eq!(params["scope"], "repository:org/mod:pull");
    }

    #[test]
    fn token_negotiation_and_manifest_fetch() {
        let mut server = mockito::Server::new();
        let url = server.url();
        let host = url.strip_prefix("http://").unwrap().to_string();

        // The client must follow the 401 challenge to the token endpoint
        // and retry with the bearer token.
        server
            .mock("GET", "/v2/org/mod/manifests/v1.0.0")
            .match_header("Authorization", mockito::Matcher::Missing)
            .with_status(401)
            .with_header(
                "WWW-Authenticate",
                &format!(r#"Bearer realm="{url}/token",service="test""#),
            )
            .create();
        server
            .mock("GET", mockito::Matcher::Regex("^/token".to_string()))
            .with_status(200)
            .with_body(r#"{"token": "anon-token"}"#)
            .create();
        server
            .mock("GET", "/v2/org/mod/manifests/v1.0.0")
            .match_header("Authorization", "Bearer anon-token")
            .with_status(200)
            .with_body(r#"{"schemaVersion": 2, "layers": []}"#)
            .create();

        let client = OciClient::new(crate::libs::download::http_agent()).with_scheme("http");
        let reference = OciRef::parse(&format!("{host}/org/mod:v1.0.0")).unwrap();
        let manifest = client.get_manifest(&reference).unwrap();
        assert_eq!(manifest["schemaVersion"], 2);
    }
}
