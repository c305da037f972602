// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Project manifest script lookup
//!
//! The supervisor only needs named script commands; parsing beyond the
//! `scripts` table is someone else's job.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Source of named script commands for `start_script`.
pub trait ScriptSource: Send + Sync {
    /// Command line for a named script, if declared.
    fn script(&self, name: &str) -> Option<String>;

    /// All declared scripts, sorted by name.
    fn scripts(&self) -> Vec<(String, String)>;

    /// Directory child processes run in.
    fn work_dir(&self) -> PathBuf;
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("no package.json in {0}")]
    NotFound(PathBuf),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid package.json: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Default, Deserialize)]
struct RawManifest {
    #[serde(default)]
    scripts: BTreeMap<String, String>,
}

/// Scripts table of a `package.json`.
#[derive(Debug, Clone)]
pub struct PackageManifest {
    work_dir: PathBuf,
    scripts: BTreeMap<String, String>,
}

impl PackageManifest {
    /// Load from `<dir>/package.json`.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let dir = dir.as_ref();
        let path = dir.join("package.json");
        if !path.exists() {
            return Err(ManifestError::NotFound(dir.to_path_buf()));
        }
        let raw = std::fs::read_to_string(&path)
            .map_err(|source| ManifestError::Io { path: path.clone(), source })?;
        let manifest: RawManifest = serde_json::from_str(&raw)?;
        Ok(Self { work_dir: dir.to_path_buf(), scripts: manifest.scripts })
    }

    /// Empty manifest rooted at a directory; `start_command` still works.
    pub fn empty(dir: impl AsRef<Path>) -> Self {
        Self { work_dir: dir.as_ref().to_path_buf(), scripts: BTreeMap::new() }
    }
}

impl ScriptSource for PackageManifest {
    fn script(&self, name: &str) -> Option<String> {
        self.scripts.get(name).cloned()
    }

    fn scripts(&self) -> Vec<(String, String)> {
        self.scripts.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    fn work_dir(&self) -> PathBuf {
        self.work_dir.clone()
    }
}

#[cfg(test)]
#[path = "manifest_tests.rs"]
mod tests;
