// HTTP download pipeline.
// Streams a URL to disk through a `.tmp` sibling with an atomic rename on
// success, reporting progress through an optional callback and honoring
// the engine's cancellation flag between chunks. GitHub-hosted URLs get a
// bearer token from the environment when one is available.

use crate::libs::errors::EnvboxError;
use crate::{log_debug, log_warn};
use colored::Colorize;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Progress callback: (bytes downloaded so far, total bytes when known).
pub type ProgressFn<'a> = &'a (dyn Fn(u64, Option<u64>) + Sync);

const USER_AGENT: &str = concat!("envbox/", env!("CARGO_PKG_VERSION"));
const CHUNK_SIZE: usize = 64 * 1024;
const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(250);

/// Builds the shared HTTP agent: 30 second timeouts, no per-host state.
pub fn http_agent() -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout_connect(Duration::from_secs(30))
        .timeout(Duration::from_secs(30))
        .user_agent(USER_AGENT)
        .build()
}

/// Whether `host` is a GitHub host that should receive a bearer token.
/// Matching is exact or by `.github.com` / `.githubusercontent.com`
/// suffix, case-insensitive; `evil.github.com.example.com` does not match.
pub fn is_github_host(host: &str) -> bool {
    let host = host.to_lowercase();
    host == "github.com"
        || host == "api.github.com"
        || host.ends_with(".github.com")
        || host.ends_with(".githubusercontent.com")
}

/// The GitHub token from the environment: `GITHUB_TOKEN` preferred,
/// `GH_TOKEN` as the fallback.
pub fn github_token() -> Option<String> {
    std::env::var("GITHUB_TOKEN")
        .ok()
        .filter(|t| !t.is_empty())
        .or_else(|| std::env::var("GH_TOKEN").ok().filter(|t| !t.is_empty()))
}

/// Extracts the host portion of a URL without parsing the whole thing.
fn url_host(url: &str) -> Option<&str> {
    let rest = url.split_once("://")?.1;
    let authority = rest.split(['/', '?', '#']).next()?;
    // Strip userinfo and port.
    let host = authority.rsplit('@').next()?;
    Some(host.split(':').next().unwrap_or(host))
}

/// Prepares a GET request for `url`, injecting the GitHub bearer token
/// when the host qualifies and a token is present.
pub fn get_request(agent: &ureq::Agent, url: &str) -> ureq::Request {
    let mut request = agent.get(url);
    if let Some(host) = url_host(url) {
        if is_github_host(host) {
            if let Some(token) = github_token() {
                request = request.set("Authorization", &format!("Bearer {token}"));
            }
        }
    }
    request
}

/// Performs an idempotent GET with 3 attempts and exponential backoff on
/// transport errors and 5xx statuses. 4xx statuses are returned
/// immediately: retrying them cannot succeed.
pub fn get_with_retries(agent: &ureq::Agent, url: &str) -> Result<ureq::Response, EnvboxError> {
    let mut delay = RETRY_BASE_DELAY;
    let mut last_error = String::new();

    for attempt in 1..=RETRY_ATTEMPTS {
        match get_request(agent, url).call() {
            Ok(response) => return Ok(response),
            Err(ureq::Error::Status(code, _)) if code < 500 => {
                return Err(EnvboxError::Transport(format!(
                    "GET {url} returned HTTP {code}"
                )));
            }
            Err(ureq::Error::Status(code, _)) => {
                last_error = format!("HTTP {code}");
            }
            Err(err) => {
                last_error = err.to_string();
            }
        }
        if attempt < RETRY_ATTEMPTS {
            log_warn!(
                "[Download] GET {} failed ({}); retrying in {:?} (attempt {}/{})",
                url.dimmed(),
                last_error,
                delay,
                attempt,
                RETRY_ATTEMPTS
            );
            std::thread::sleep(delay);
            delay *= 2;
        }
    }
    Err(EnvboxError::Transport(format!(
        "GET {url} failed after {RETRY_ATTEMPTS} attempts: {last_error}"
    )))
}

/// Fetches a URL body as text, capped at `max_bytes`.
pub fn get_text(agent: &ureq::Agent, url: &str, max_bytes: u64) -> Result<String, EnvboxError> {
    let response = get_with_retries(agent, url)?;
    let mut body = String::new();
    response
        .into_reader()
        .take(max_bytes)
        .read_to_string(&mut body)
        .map_err(|err| EnvboxError::Transport(format!("reading body of {url}: {err}")))?;
    Ok(body)
}

/// Downloads `url` into `dest`.
///
/// The body is streamed into `<dest>.tmp` and renamed over `dest` on
/// success; on any failure (including cancellation) the temp file is
/// removed. `progress` is invoked after every chunk with the cumulative
/// byte count and the Content-Length when the server sent one.
pub fn download_file(
    agent: &ureq::Agent,
    url: &str,
    dest: &Path,
    progress: Option<ProgressFn<'_>>,
    cancel: Option<&AtomicBool>,
) -> Result<(), EnvboxError> {
    log_debug!("[Download] Fetching {} -> {:?}", url.cyan(), dest.display());

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(EnvboxError::from)?;
    }

    let response = get_with_retries(agent, url)?;
    let total: Option<u64> = response
        .header("Content-Length")
        .and_then(|v| v.parse().ok());

    let tmp_path = crate::libs::utilities::file_operations::temp_sibling(dest);
    let result = (|| -> Result<(), EnvboxError> {
        let mut reader = response.into_reader();
        let mut writer = File::create(&tmp_path).map_err(EnvboxError::from)?;
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut downloaded: u64 = 0;

        loop {
            if let Some(flag) = cancel {
                if flag.load(Ordering::Relaxed) {
                    return Err(EnvboxError::Execution(format!("download of {url} cancelled")));
                }
            }
            let read = reader
                .read(&mut buffer)
                .map_err(|err| EnvboxError::Transport(format!("reading {url}: {err}")))?;
            if read == 0 {
                break;
            }
            writer.write_all(&buffer[..read]).map_err(EnvboxError::from)?;
            downloaded += read as u64;
            if let Some(report) = progress {
                report(downloaded, total);
            }
        }
        writer.flush().map_err(EnvboxError::from)?;
        Ok(())
    })();

    match result {
        Ok(()) => {
            fs::rename(&tmp_path, dest).map_err(EnvboxError::from)?;
            Ok(())
        }
        Err(err) => {
            let _ = fs::remove_file(&tmp_path);
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn github_host_matching_is_exact_or_suffix() {
        assert!(is_github_host("github.com"));
        assert!(is_github_host("api.github.com"));
        assert!(is_github_host("GitHub.com"));
        assert!(is_github_host("uploads.github.com"));
        assert!(is_github_host("objects.githubusercontent.com"));
        assert!(!is_github_host("evil.github.com.example.com"));
        assert!(!is_github_host("notgithub.com"));
        assert!(!is_github_host("githubusercontent.com.evil.org"));
    }

    #[test]
    fn url_host_extraction() {
        assert_eq!(url_host("https://github.com/cli/cli"), Some("github.com"));
        assert_eq!(url_host("https://example.com:8443/a?b=c"), Some("example.com"));
        assert_eq!(url_host("not a url"), None);
    }

    #[test]
    fn download_streams_body_and_cleans_tmp() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("GET", "/artifact.tar.gz")
            .with_status(200)
            .with_body("archive bytes")
            .create();

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("artifact.tar.gz");
        let agent = http_agent();
        download_file(&agent, &format!("{}/artifact.tar.gz", server.url()), &dest, None, None)
            .unwrap();

        mock.assert();
        assert_eq!(fs::read(&dest).unwrap(), b"archive bytes");
        assert!(!crate::libs::utilities::file_operations::temp_sibling(&dest).exists());
    }

    #[test]
    fn non_success_status_is_a_transport_error() {
        let mut server = mockito::Server::new();
        server
            .mock("GET", "/missing")
            .with_status(404)
            .create();

        let dir = tempfile::tempdir().unwrap();
        let agent = http_agent();
        let err = download_file(
            &agent,
            &format!("{}/missing", server.url()),
            &dir.path().join("missing"),
            None,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, EnvboxError::Transport(_)));
        assert!(err.to_string().contains("404"));
    }

    #[test]
    fn progress_reports_cumulative_bytes() {
        let mut server = mockito::Server::new();
        server
            .mock("GET", "/blob")
            .with_status(200)
            .with_body(vec![7u8; 1000])
            .create();

        let dir = tempfile::tempdir().unwrap();
        let agent = http_agent();
        let seen = std::sync::Mutex::new(Vec::new());
        let report = |done: u64, total: Option<u64>| {
            seen.lock().unwrap().push((done, total));
        };
        download_file(
            &agent,
            &format!("{}/blob", server.url()),
            &dir.path().join("blob"),
            Some(&report),
            None,
        )
        .unwrap();

        let seen = seen.into_inner().unwrap();
        assert!(!seen.is_empty());
        assert_eq!(seen.last().unwrap().0, 1000);
    }
}
