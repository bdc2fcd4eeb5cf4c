// Manifest loading.
// Manifests are YAML files in the config directory; each file may hold
// several documents separated by `---`. A document is
//
//   api_version: envbox/v1
//   kind: tool
//   metadata:
//     name: ripgrep
//   spec:
//     version: v14.0.0
//     installer_ref: download
//     package: BurntSushi/ripgrep
//
// Kinds parse case-insensitively; the spec block deserializes into the
// kind's typed spec. Tool sets are expanded (and name conflicts detected)
// before the resource list is handed to the planner.

use crate::libs::errors::EnvboxError;
use crate::schemas::resource::{Kind, Resource, expand_tool_sets};
use crate::{log_debug, log_info};
use colored::Colorize;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize)]
struct ManifestDocument {
    #[serde(alias = "apiVersion", default = "default_api_version")]
    api_version: String,
    kind: String,
    metadata: ManifestMetadata,
    #[serde(default)]
    spec: serde_yaml::Value,
}

#[derive(Debug, Deserialize)]
struct ManifestMetadata {
    name: String,
}

fn default_api_version() -> String {
    "envbox/v1".to_string()
}

/// Loads every resource from the YAML manifests under `config_dir`.
/// Files are read in name order so diagnostics are stable. A missing
/// directory is an empty manifest set, which reconciles everything away.
pub fn load_resources(config_dir: &Path) -> Result<Vec<Resource>, EnvboxError> {
    let mut manifest_files: Vec<_> = match std::fs::read_dir(config_dir) {
        Ok(entries) => entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| {
                matches!(
                    path.extension().and_then(|e| e.to_str()),
                    Some("yaml") | Some("yml")
                )
            })
            .collect(),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            log_info!(
                "[Config] No config directory at {}; treating the manifest set as empty",
                config_dir.display().to_string().yellow()
            );
            Vec::new()
        }
        Err(err) => return Err(EnvboxError::from(err)),
    };
    manifest_files.sort();

    let mut resources = Vec::new();
    for path in &manifest_files {
        let contents = std::fs::read_to_string(path).map_err(EnvboxError::from)?;
        let mut count = 0usize;
        for document in serde_yaml::Deserializer::from_str(&contents) {
            let value = serde_yaml::Value::deserialize(document).map_err(|err| {
                EnvboxError::Configuration(format!("{}: invalid YAML: {err}", path.display()))
            })?;
            if value.is_null() {
                continue;
            }
            resources.push(parse_document(path, value)?);
            count += 1;
        }
        log_debug!(
            "[Config] Loaded {} document(s) from {}",
            count,
            path.display().to_string().dimmed()
        );
    }

    expand_tool_sets(resources)
}

fn parse_document(path: &Path, value: serde_yaml::Value) -> Result<Resource, EnvboxError> {
    let document: ManifestDocument = serde_yaml::from_value(value).map_err(|err| {
        EnvboxError::Configuration(format!("{}: invalid manifest: {err}", path.display()))
    })?;
    let kind = Kind::parse(&document.kind).ok_or_else(|| {
        EnvboxError::Configuration(format!(
            "{}: unknown kind '{}'",
            path.display(),
            document.kind
        ))
    })?;
    let name = document.metadata.name;
    if name.is_empty() {
        return Err(EnvboxError::Configuration(format!(
            "{}: resource of kind '{kind}' has an empty name",
            path.display()
        )));
    }

    let spec_error = {
        let context = format!("{}: invalid {kind}/{name} spec", path.display());
        move |err: serde_yaml::Error| EnvboxError::Configuration(format!("{context}: {err}"))
    };
    let resource = match kind {
        Kind::Runtime => Resource::Runtime {
            api_version: document.api_version,
            name,
            spec: serde_yaml::from_value(document.spec).map_err(spec_error)?,
        },
        Kind::Tool => Resource::Tool {
            api_version: document.api_version,
            name,
            spec: serde_yaml::from_value(document.spec).map_err(spec_error)?,
        },
        Kind::Installer => Resource::Installer {
            api_version: document.api_version,
            name,
            spec: serde_yaml::from_value(document.spec).map_err(spec_error)?,
        },
        Kind::InstallerRepository => Resource::InstallerRepository {
            api_version: document.api_version,
            name,
            spec: serde_yaml::from_value(document.spec).map_err(spec_error)?,
        },
        Kind::ToolSet => Resource::ToolSet {
            api_version: document.api_version,
            name,
            spec: serde_yaml::from_value(document.spec).map_err(spec_error)?,
        },
    };
    Ok(resource)
}
