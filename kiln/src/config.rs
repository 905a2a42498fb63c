// SPDX-FileCopyrightText: Copyright © 2025 Kiln Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Service configuration, loaded from a single YAML document

use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use fs_err as fs;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Address the front server binds to
    pub listen: SocketAddr,
    pub catalog: CatalogSettings,
    pub store: StoreSettings,
    pub recipe: RecipeSettings,
    pub module: ModuleSettings,
    #[serde(default)]
    pub queue: QueueSettings,
    #[serde(default)]
    pub reindex: ReindexSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogSettings {
    /// Base URL of the artifact-catalog service
    pub url: Url,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreSettings {
    /// Root of the build bucket as mounted on this host
    pub root: PathBuf,
}

/// Parameters substituted into the container recipe
#[derive(Debug, Clone, Deserialize)]
pub struct RecipeSettings {
    /// Binary-cache mirror the build pulls from and pushes to
    pub binary_cache: String,
    /// Custom package repository cloned into the build stage
    pub repo_url: String,
    /// Resolved git reference of the custom repository
    pub repo_ref: String,
    /// Target microarchitecture, e.g. `x86_64_v3`
    pub processor_target: String,
    pub build_image: String,
    pub final_image: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModuleSettings {
    /// Root the module file is installed under
    pub module_root: PathBuf,
    /// Root the image + wrapper-script tree is installed under
    pub scripts_root: PathBuf,
    /// Wrapper script each exposed executable is symlinked to
    pub wrapper_script: PathBuf,
    /// Prefix users pass to `module load`
    pub load_path: String,
    /// Modules loaded as dependencies of every generated module
    #[serde(default)]
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Batch-scheduler binary driven by the adapter
    pub executable: String,
    pub deployment: String,
    pub poll_interval_secs: u64,
}

impl QueueSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            executable: "wr".to_owned(),
            deployment: "production".to_owned(),
            poll_interval_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReindexSettings {
    pub spack_executable: String,
    /// Hours between reindex ticks
    pub hours: u64,
}

impl ReindexSettings {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.hours * 60 * 60)
    }
}

impl Default for ReindexSettings {
    fn default() -> Self {
        Self {
            spack_executable: "spack".to_owned(),
            hours: 24,
        }
    }
}

impl Config {
    /// Load configuration from `path`, falling back to
    /// `$XDG_CONFIG_HOME/kiln/config.yaml`
    pub fn load(path: Option<&Path>) -> Result<Self, Error> {
        let path = match path {
            Some(path) => path.to_owned(),
            None => default_path()?,
        };

        let bytes = fs::read(&path).map_err(|io| Error::Read(path.clone(), io))?;

        serde_yaml::from_slice(&bytes).map_err(|parse| Error::Parse(path, parse))
    }
}

fn default_path() -> Result<PathBuf, Error> {
    dirs::config_dir()
        .map(|dir| dir.join("kiln").join("config.yaml"))
        .ok_or(Error::NoConfigDir)
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("$HOME or $XDG_CONFIG_HOME env not set")]
    NoConfigDir,
    #[error("read config file {0:?}")]
    Read(PathBuf, #[source] std::io::Error),
    #[error("parse config file {0:?}")]
    Parse(PathBuf, #[source] serde_yaml::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
listen: "0.0.0.0:2456"
catalog:
  url: "http://catalog.internal:8080/softpack"
store:
  root: /mnt/build-cache/builds
recipe:
  binary_cache: "https://binaries.internal/spack"
  repo_url: "https://git.internal/custom-repo"
  repo_ref: "9f2a1c0"
  processor_target: x86_64_v3
  build_image: "spack/ubuntu-jammy:latest"
  final_image: "ubuntu:22.04"
module:
  module_root: /software/modules
  scripts_root: /software/scripts
  wrapper_script: /software/bin/run-in-image
  load_path: HGI/common
  dependencies:
    - singularity/3.10
"#;

    #[test]
    fn parse_example() {
        let config: Config = serde_yaml::from_str(EXAMPLE).unwrap();

        assert_eq!(config.listen.port(), 2456);
        assert_eq!(config.module.dependencies, vec!["singularity/3.10".to_owned()]);

        // omitted sections fall back to defaults
        assert_eq!(config.queue.executable, "wr");
        assert_eq!(config.queue.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.reindex.hours, 24);
        assert_eq!(config.reindex.period(), Duration::from_secs(24 * 60 * 60));
    }

    #[test]
    fn missing_file_is_an_error() {
        let error = Config::load(Some(Path::new("/nonexistent/kiln.yaml"))).unwrap_err();

        assert!(matches!(error, Error::Read(..)));
    }
}
