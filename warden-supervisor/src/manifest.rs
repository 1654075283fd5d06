//! Persisted version manifest.
//!
//! `versions.json` in the instance workspace records which component
//! versions are currently materialized. The next start diffs it against the
//! configured versions to decide which bundled resources must be refreshed
//! before the processes launch.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const MANIFEST_FILE: &str = "versions.json";

/// Component name → materialized version string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionManifest {
    components: BTreeMap<String, String>,

    /// When the recorded state last changed; informational only.
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
}

impl VersionManifest {
    fn path(workspace: &Path) -> PathBuf {
        workspace.join(MANIFEST_FILE)
    }

    /// Load the manifest from `workspace`. A missing or unreadable manifest
    /// is an empty one: every component then counts as stale, which only
    /// costs a redundant refresh.
    pub async fn load(workspace: &Path) -> Self {
        match tokio::fs::read(Self::path(workspace)).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "corrupt version manifest, treating all components as stale");
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    /// Persist the manifest, via a temp file and rename so a crash cannot
    /// leave a torn manifest behind.
    ///
    /// # Errors
    /// Returns the underlying I/O error.
    pub async fn store(&self, workspace: &Path) -> io::Result<()> {
        let bytes = serde_json::to_vec_pretty(self).map_err(io::Error::other)?;
        let tmp = workspace.join(format!("{MANIFEST_FILE}.tmp"));
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, Self::path(workspace)).await
    }

    /// Components whose desired version differs from (or is absent in) the
    /// recorded state, in deterministic order.
    #[must_use]
    pub fn stale_components(&self, desired: &BTreeMap<String, String>) -> Vec<String> {
        desired
            .iter()
            .filter(|(name, version)| self.components.get(*name) != Some(version))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Record every desired version as materialized.
    pub fn record(&mut self, desired: &BTreeMap<String, String>) {
        for (name, version) in desired {
            self.components.insert(name.clone(), version.clone());
        }
        self.updated_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn versions(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[tokio::test]
    async fn missing_manifest_marks_everything_stale() {
        let dir = match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => panic!("tempdir failed: {e}"),
        };
        let manifest = VersionManifest::load(dir.path()).await;
        let stale = manifest.stale_components(&versions(&[("image", "v1"), ("data", "v2")]));
        assert_eq!(stale, vec!["data".to_owned(), "image".to_owned()]);
    }

    #[tokio::test]
    async fn recorded_versions_round_trip_through_disk() {
        let dir = match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => panic!("tempdir failed: {e}"),
        };
        let desired = versions(&[("image", "v1"), ("data", "v2")]);

        let mut manifest = VersionManifest::load(dir.path()).await;
        manifest.record(&desired);
        if let Err(e) = manifest.store(dir.path()).await {
            panic!("store failed: {e}");
        }

        let reloaded = VersionManifest::load(dir.path()).await;
        assert_eq!(reloaded, manifest);
        assert!(
            reloaded.stale_components(&desired).is_empty(),
            "recorded versions must not be stale"
        );
    }

    #[tokio::test]
    async fn version_bump_marks_only_that_component_stale() {
        let dir = match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => panic!("tempdir failed: {e}"),
        };
        let mut manifest = VersionManifest::load(dir.path()).await;
        manifest.record(&versions(&[("image", "v1"), ("data", "v2")]));

        let bumped = versions(&[("image", "v2"), ("data", "v2")]);
        assert_eq!(manifest.stale_components(&bumped), vec!["image".to_owned()]);
    }

    #[tokio::test]
    async fn corrupt_manifest_degrades_to_empty() {
        let dir = match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => panic!("tempdir failed: {e}"),
        };
        if let Err(e) = tokio::fs::write(dir.path().join(MANIFEST_FILE), b"{not json").await {
            panic!("seed failed: {e}");
        }
        let manifest = VersionManifest::load(dir.path()).await;
        assert_eq!(manifest, VersionManifest::default());
    }
}
