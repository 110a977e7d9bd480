// src/gate/whitelist.rs
//
// Allowed plates, loaded from JSON. Accepts either a bare list
// `["А123ВС77", ...]` or an object `{"plates": [...]}`. Entries are
// normalized with the same rules as OCR readings.

use crate::gate::plate::PlateRules;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::SystemTime;
use tracing::{info, warn};

#[derive(Deserialize)]
#[serde(untagged)]
enum WhitelistFile {
    List(Vec<String>),
    Object { plates: Vec<String> },
}

#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    plates: HashSet<String>,
}

impl Whitelist {
    pub fn from_entries<I, S>(entries: I, rules: &PlateRules) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let plates = entries
            .into_iter()
            .map(|e| rules.normalize(e.as_ref()))
            .filter(|p| !p.is_empty())
            .collect();
        Self { plates }
    }

    pub fn parse(json: &str, rules: &PlateRules) -> Result<Self> {
        let file: WhitelistFile =
            serde_json::from_str(json).context("Whitelist must be a JSON list or {\"plates\": [...]}")?;
        let entries = match file {
            WhitelistFile::List(v) => v,
            WhitelistFile::Object { plates } => plates,
        };
        Ok(Self::from_entries(entries, rules))
    }

    pub fn load(path: &Path, rules: &PlateRules) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read whitelist {}", path.display()))?;
        let wl = Self::parse(&contents, rules)
            .with_context(|| format!("Failed to parse whitelist {}", path.display()))?;
        if wl.is_empty() {
            warn!("Whitelist {} is empty, every confirmed plate will be denied", path.display());
        } else {
            info!("✓ Whitelist loaded: {} plate(s) from {}", wl.len(), path.display());
        }
        Ok(wl)
    }

    pub fn contains(&self, plate: &str) -> bool {
        self.plates.contains(plate)
    }

    pub fn len(&self) -> usize {
        self.plates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plates.is_empty()
    }
}

/// Tracks the file's mtime so reloads only happen after an edit.
pub struct WhitelistWatcher {
    path: std::path::PathBuf,
    last_modified: Option<SystemTime>,
}

impl WhitelistWatcher {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        let path = path.into();
        let last_modified = modified(&path);
        Self {
            path,
            last_modified,
        }
    }

    /// Some(new whitelist) when the file changed and parsed cleanly.
    /// A broken edit keeps the current list in force.
    pub async fn poll(&mut self, rules: &PlateRules) -> Option<Whitelist> {
        let current = tokio::fs::metadata(&self.path)
            .await
            .ok()
            .and_then(|m| m.modified().ok());
        if current.is_none() || current == self.last_modified {
            return None;
        }
        self.last_modified = current;

        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) => {
                warn!("Whitelist reload failed ({}): {}", self.path.display(), e);
                return None;
            }
        };
        match Whitelist::parse(&contents, rules) {
            Ok(wl) => {
                info!("🔄 Whitelist reloaded: {} plate(s)", wl.len());
                Some(wl)
            }
            Err(e) => {
                warn!("Whitelist reload rejected, keeping previous list: {:#}", e);
                None
            }
        }
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).ok().and_then(|m| m.modified().ok())
}
