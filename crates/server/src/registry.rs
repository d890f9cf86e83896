//! Binding registry
//!
//! Persists which devices the operator has bound for export. The file
//! lives under the user config directory
//! (`~/.config/usbipd/bindings.toml` on Linux) and is only ever written
//! by the CLI commands; the protocol engine reads it and nothing else.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// One bound device
///
/// Vendor and product ids are stored as four-digit hex strings so the
/// file stays human-editable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingEntry {
    pub bus_id: String,
    pub vendor_id: String,
    pub product_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct BindingFile {
    #[serde(default, rename = "device")]
    devices: Vec<BindingEntry>,
}

/// Persisted list of devices bound for export
#[derive(Debug)]
pub struct BindingRegistry {
    path: PathBuf,
    entries: Vec<BindingEntry>,
}

impl BindingRegistry {
    /// Default location of the binding file
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usbipd").join("bindings.toml")
        } else {
            PathBuf::from("/etc/usbipd/bindings.toml")
        }
    }

    /// Load the registry, treating a missing file as an empty one
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let path = path.unwrap_or_else(Self::default_path);

        let entries = if path.exists() {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let file: BindingFile = toml::from_str(&raw)
                .with_context(|| format!("Failed to parse {}", path.display()))?;
            file.devices
        } else {
            debug!("No binding file at {}, starting empty", path.display());
            Vec::new()
        };

        Ok(Self { path, entries })
    }

    /// Write the registry back to its file, creating parent directories
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let file = BindingFile {
            devices: self.entries.clone(),
        };
        let raw = toml::to_string_pretty(&file).context("Failed to serialize bindings")?;
        fs::write(&self.path, raw)
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Add a binding. Returns false when the bus id is already bound.
    pub fn add(&mut self, entry: BindingEntry) -> bool {
        if self.is_exported(&entry.bus_id) {
            return false;
        }
        self.entries.push(entry);
        true
    }

    /// Remove a binding. Returns false when the bus id was not bound.
    pub fn remove(&mut self, bus_id: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.bus_id != bus_id);
        self.entries.len() != before
    }

    /// Remove every binding, returning how many there were
    pub fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }

    pub fn is_exported(&self, bus_id: &str) -> bool {
        self.entries.iter().any(|e| e.bus_id == bus_id)
    }

    pub fn list_exported(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.bus_id.clone()).collect()
    }

    pub fn entries(&self) -> &[BindingEntry] {
        &self.entries
    }
}
