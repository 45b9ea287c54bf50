//! Clash for Windows profile catalog
//!
//! CFW keeps downloaded subscriptions under `~/.config/clash/profiles`, with
//! a `list.yml` mapping display names to file names.

use crate::error::{Error, Result};
use directories::BaseDirs;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

const LIST_FILE: &str = "list.yml";

#[derive(Debug, Clone, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    files: Vec<CatalogEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct CatalogEntry {
    name: String,
    time: String,
}

/// Named profiles available in a CFW profiles directory
#[derive(Debug, Clone)]
pub struct ProfileCatalog {
    dir: PathBuf,
    entries: Vec<CatalogEntry>,
}

impl ProfileCatalog {
    /// Default CFW profiles directory, if a home directory is known
    pub fn default_dir() -> Option<PathBuf> {
        BaseDirs::new().map(|dirs| dirs.home_dir().join(".config").join("clash").join("profiles"))
    }

    pub fn load<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(Error::Catalog(format!(
                "profiles directory {} not found",
                dir.display()
            )));
        }

        let list = dir.join(LIST_FILE);
        let content = fs::read_to_string(&list).map_err(|source| Error::ProfileRead {
            path: list.clone(),
            source,
        })?;
        let file: CatalogFile = serde_yaml::from_str(&content)
            .map_err(|source| Error::ProfileParse { path: list, source })?;

        Ok(Self {
            dir: dir.to_path_buf(),
            entries: file.files,
        })
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.name.as_str()).collect()
    }

    /// Path of the profile registered under `name`
    pub fn resolve(&self, name: &str) -> Result<PathBuf> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| self.dir.join(&e.time))
            .ok_or_else(|| {
                Error::Catalog(format!(
                    "no profile named `{}`; available: {}",
                    name,
                    self.names().join(", ")
                ))
            })
    }
}
