// Filesystem layout resolution.
// Everything envbox owns lives under one root (default `~/.envbox`):
//
//   configs/                      user manifests
//   data/state.json               persisted state
//   data/state.json.lock          advisory lock file
//   data/tools/<name>/<version>/  tool artifacts
//   data/runtimes/<name>/<version>/ runtime artifacts
//   data/installers/<name>/<version>/ manifest-defined installer artifacts
//   data/repositories/<name>/     cloned installer repositories
//   bin/<binary>                  symlinks into artifact directories
//   cache/registry/<registry>/    cached registry metadata
//   cache/logs/<session-id>/      per-resource install logs

use crate::libs::errors::EnvboxError;
use std::path::{Path, PathBuf};

/// Resolved locations of every directory envbox reads or writes.
#[derive(Debug, Clone)]
pub struct EnvPaths {
    pub root: PathBuf,
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
    pub tools_dir: PathBuf,
    pub runtimes_dir: PathBuf,
    pub installers_dir: PathBuf,
    pub repositories_dir: PathBuf,
    pub bin_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub registry_cache_dir: PathBuf,
    pub logs_dir: PathBuf,
}

impl EnvPaths {
    /// Resolves the layout for a given root directory.
    pub fn for_root(root: PathBuf) -> EnvPaths {
        let data_dir = root.join("data");
        let cache_dir = root.join("cache");
        EnvPaths {
            config_dir: root.join("configs"),
            tools_dir: data_dir.join("tools"),
            runtimes_dir: data_dir.join("runtimes"),
            installers_dir: data_dir.join("installers"),
            repositories_dir: data_dir.join("repositories"),
            bin_dir: root.join("bin"),
            registry_cache_dir: cache_dir.join("registry"),
            logs_dir: cache_dir.join("logs"),
            data_dir,
            cache_dir,
            root,
        }
    }

    /// Resolves the layout from an optional user-supplied root, defaulting
    /// to `~/.envbox`. Tilde expansion is applied to the override.
    pub fn resolve(root_override: Option<&str>) -> Result<EnvPaths, EnvboxError> {
        let root = match root_override {
            Some(custom) => expand_tilde(custom),
            None => dirs::home_dir()
                .ok_or_else(|| {
                    EnvboxError::Configuration(
                        "could not determine the home directory; set --root explicitly".to_string(),
                    )
                })?
                .join(".envbox"),
        };
        Ok(EnvPaths::for_root(root))
    }

    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join("state.json")
    }

    /// Artifact directory for one runtime version.
    pub fn runtime_install_path(&self, name: &str, version: &str) -> PathBuf {
        self.runtimes_dir.join(name).join(version)
    }

    /// Artifact directory for one tool version.
    pub fn tool_install_path(&self, name: &str, version: &str) -> PathBuf {
        self.tools_dir.join(name).join(version)
    }

    pub fn repository_path(&self, name: &str) -> PathBuf {
        self.repositories_dir.join(name)
    }
}

/// Expands a leading `~` in a user-supplied path.
pub fn expand_tilde(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).into_owned())
}

/// Resolves a manifest-supplied directory: tilde-expanded when given,
/// otherwise the provided default.
pub fn resolve_dir(configured: Option<&str>, default: &Path) -> PathBuf {
    match configured {
        Some(dir) if !dir.is_empty() => expand_tilde(dir),
        _ => default.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_hangs_off_the_root() {
        let paths = EnvPaths::for_root(PathBuf::from("/srv/envbox"));
        assert_eq!(paths.state_path(), PathBuf::from("/srv/envbox/data/state.json"));
        assert_eq!(
            paths.runtime_install_path("go", "1.25.1"),
            PathBuf::from("/srv/envbox/data/runtimes/go/1.25.1")
        );
        assert_eq!(
            paths.registry_cache_dir,
            PathBuf::from("/srv/envbox/cache/registry")
        );
    }

    #[test]
    fn resolve_dir_prefers_configured_value() {
        let default = PathBuf::from("/srv/envbox/bin");
        assert_eq!(resolve_dir(None, &default), default);
        assert_eq!(resolve_dir(Some(""), &default), default);
        assert_eq!(resolve_dir(Some("/opt/bin"), &default), PathBuf::from("/opt/bin"));
    }
}
