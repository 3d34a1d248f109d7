//! Offline cache manager configuration.

use std::path::Path;

use pwakit_common::{PwaKitError, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Configuration for one version of the offline cache manager.
///
/// Bumping either cache name is what makes a new version: on activation
/// every generation not named here is deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
    /// Name of the generation holding the essential manifest.
    pub static_cache_name: String,

    /// Name of the generation filled from network responses.
    pub dynamic_cache_name: String,

    /// Essential resources, relative to the registration scope.
    pub manifest: Vec<String>,

    /// Document served for navigations when the network is down.
    pub root_document: String,

    /// Request skip-waiting as soon as install succeeds.
    pub skip_waiting_on_install: bool,

    /// Content of the synthesized offline page.
    pub offline_page: OfflinePage,
}

/// Text of the synthesized offline page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OfflinePage {
    pub title: String,
    pub heading: String,
    pub message: String,
    pub detail: String,
    pub retry_label: String,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        let mut manifest: Vec<String> = [
            "/",
            "/index.html",
            "/manifest.json",
            "/splash-screen.png",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        manifest.extend(
            [72, 96, 128, 144, 152, 192, 384, 512]
                .iter()
                .map(|size| format!("/icons/icon-{size}x{size}.png")),
        );

        Self {
            static_cache_name: "pwakit-static-v1".to_string(),
            dynamic_cache_name: "pwakit-dynamic-v1".to_string(),
            manifest,
            root_document: "/index.html".to_string(),
            skip_waiting_on_install: true,
            offline_page: OfflinePage::default(),
        }
    }
}

impl Default for OfflinePage {
    fn default() -> Self {
        Self {
            title: "Offline".to_string(),
            heading: "You're offline".to_string(),
            message: "The app is loading offline...".to_string(),
            detail: "Please wait while we prepare your content.".to_string(),
            retry_label: "Retry".to_string(),
        }
    }
}

impl OfflineConfig {
    /// Parse and validate a JSON configuration.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| PwaKitError::config("invalid offline config").with_source(e))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Loading offline config");
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Check the invariants the manager relies on.
    pub fn validate(&self) -> Result<()> {
        if self.static_cache_name.trim().is_empty() || self.dynamic_cache_name.trim().is_empty() {
            return Err(PwaKitError::config("cache names must not be empty"));
        }
        if self.static_cache_name == self.dynamic_cache_name {
            return Err(PwaKitError::config(format!(
                "static and dynamic caches share the name '{}'",
                self.static_cache_name
            )));
        }
        if self.manifest.is_empty() {
            return Err(PwaKitError::config("manifest must list at least one resource"));
        }
        if !self.manifest.iter().any(|entry| *entry == self.root_document) {
            return Err(PwaKitError::config(format!(
                "root document '{}' is not in the manifest",
                self.root_document
            )));
        }
        Ok(())
    }

    /// Whether `name` is one of this version's generations.
    pub fn is_current_generation(&self, name: &str) -> bool {
        name == self.static_cache_name || name == self.dynamic_cache_name
    }
}
