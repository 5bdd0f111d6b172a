// Copyright (c) The igt-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The optional per-user configuration file.
//!
//! The file is TOML:
//!
//! ```toml
//! [Common]
//! FrameDumpPath = "/tmp/frames"
//! Device = "pci:vendor=intel"
//! DebugDomain = "kms"
//! ```
//!
//! Environment variables override the file, and command-line flags override both.

use camino::{Utf8Path, Utf8PathBuf};
use config::{Config, File, FileFormat};
use thiserror::Error;

/// Names the configuration file. Defaults to `$HOME/.igtrc`.
pub const CONFIG_PATH_ENV: &str = "IGT_CONFIG_PATH";

/// Overrides `Common.FrameDumpPath`.
pub const FRAME_DUMP_PATH_ENV: &str = "IGT_FRAME_DUMP_PATH";

/// Overrides `Common.Device`.
pub const DEVICE_ENV: &str = "IGT_DEVICE";

/// Forces a specific kernel driver.
pub const FORCE_DRIVER_ENV: &str = "IGT_FORCE_DRIVER";

/// An error reading the configuration file.
#[derive(Debug, Error)]
#[error("failed to read configuration file `{path}`")]
pub struct IgtConfigError {
    path: Utf8PathBuf,
    #[source]
    err: config::ConfigError,
}

/// Settings read from the configuration file and environment.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct IgtConfig {
    /// Where frame dumps are written.
    pub frame_dump_path: Option<Utf8PathBuf>,

    /// The device filter.
    pub device: Option<String>,

    /// The debug domain to enable, as if passed with `--debug`.
    pub debug_domain: Option<String>,

    /// The driver to force.
    pub force_driver: Option<String>,
}

impl IgtConfig {
    /// Reads the file named by `IGT_CONFIG_PATH` (or `$HOME/.igtrc`), then applies environment
    /// overrides. A missing file is not an error.
    pub fn from_env() -> Result<Self, IgtConfigError> {
        let path = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Some(Utf8PathBuf::from(path)),
            Err(_) => std::env::var("HOME")
                .ok()
                .map(|home| Utf8PathBuf::from(home).join(".igtrc")),
        };
        let mut config = match path {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Reads only the file at `path`. A missing file yields the defaults.
    pub fn from_file(path: &Utf8Path) -> Result<Self, IgtConfigError> {
        let map_err = |err| IgtConfigError {
            path: path.to_owned(),
            err,
        };
        let config = Config::builder()
            .add_source(File::new(path.as_str(), FileFormat::Toml).required(false))
            .build()
            .map_err(map_err)?;

        let get = |key: &str| match config.get_string(key) {
            Ok(value) => Ok(Some(value)),
            Err(config::ConfigError::NotFound(_)) => Ok(None),
            Err(err) => Err(map_err(err)),
        };
        Ok(Self {
            frame_dump_path: get("Common.FrameDumpPath")?.map(Utf8PathBuf::from),
            device: get("Common.Device")?,
            debug_domain: get("Common.DebugDomain")?,
            force_driver: None,
        })
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(path) = var(FRAME_DUMP_PATH_ENV) {
            self.frame_dump_path = Some(path.into());
        }
        if let Some(device) = var(DEVICE_ENV) {
            self.device = Some(device);
        }
        if let Some(driver) = var(FORCE_DRIVER_ENV) {
            self.force_driver = Some(driver);
        }
    }
}
