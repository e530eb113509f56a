//! Manifest directory scanner.
//!
//! Each `*.yaml` / `*.yml` file in the manifest directory is one module
//! descriptor. Unreadable or malformed files become per-candidate errors so
//! one broken manifest never hides the rest of the directory.

use std::path::PathBuf;

use anyhow::Context;
use modhost::{ModuleDescriptor, ModuleScanner, ScanError};

pub struct ManifestScanner {
    dir: PathBuf,
}

impl ManifestScanner {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn read_manifest(path: &std::path::Path) -> anyhow::Result<ModuleDescriptor> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let descriptor: ModuleDescriptor =
            serde_yaml::from_str(&raw).context("invalid manifest structure")?;
        Ok(descriptor)
    }
}

impl ModuleScanner for ManifestScanner {
    fn find_modules(&self) -> Vec<Result<ModuleDescriptor, ScanError>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(
                    dir = %self.dir.display(),
                    error = %e,
                    "Manifest directory not readable; no modules discovered"
                );
                return Vec::new();
            }
        };

        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                p.is_file()
                    && matches!(
                        p.extension().and_then(|s| s.to_str()),
                        Some("yaml") | Some("yml")
                    )
            })
            .collect();
        // Deterministic discovery order regardless of filesystem order.
        files.sort();

        files
            .into_iter()
            .map(|path| {
                Self::read_manifest(&path).map_err(|source| ScanError {
                    candidate: path.display().to_string(),
                    source,
                })
            })
            .collect()
    }
}
