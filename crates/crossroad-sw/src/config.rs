//! Gatekeeper configuration.
//!
//! [`GatekeeperConfig`] is the serializable form; [`CacheManifest`] is what
//! the gatekeeper runs on, resolved once at startup.

use std::path::Path;

use crossroad_common::{CrossroadError, ResultExt};
use serde::{Deserialize, Serialize};
use url::Url;

/// Prefix shared by every cache generation of the page.
pub const DEFAULT_CACHE_PREFIX: &str = "crossroad-navigator-cache";

/// Current cache generation.
pub const DEFAULT_CACHE_VERSION: &str = "v1";

const TAILWIND_CDN: &str = "https://cdn.tailwindcss.com";
const INTER_FONT_CSS: &str =
    "https://fonts.googleapis.com/css2?family=Inter:wght@400;500;700&display=swap";

/// Gatekeeper configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatekeeperConfig {
    /// Cache name prefix; the version is appended with a dash.
    pub cache_prefix: String,

    /// Cache version suffix.
    pub version: String,

    /// Worker scope relative asset URLs resolve against.
    pub scope: String,

    /// Assets pre-cached on install.
    pub assets: Vec<String>,

    /// Cross-origin assets fetched in no-cors mode on install. Failures are
    /// tolerated, and these are left out of the required batch.
    pub opaque_assets: Vec<String>,

    /// URL substrings whose non-basic responses are passed through uncached.
    pub passthrough_markers: Vec<String>,
}

impl Default for GatekeeperConfig {
    fn default() -> Self {
        Self {
            cache_prefix: DEFAULT_CACHE_PREFIX.to_string(),
            version: DEFAULT_CACHE_VERSION.to_string(),
            scope: "http://localhost:8080/".to_string(),
            assets: vec![
                "index.html".to_string(),
                TAILWIND_CDN.to_string(),
                INTER_FONT_CSS.to_string(),
            ],
            opaque_assets: vec![TAILWIND_CDN.to_string()],
            passthrough_markers: vec!["placehold.co".to_string()],
        }
    }
}

impl GatekeeperConfig {
    /// Full cache name, e.g. `crossroad-navigator-cache-v1`.
    pub fn cache_name(&self) -> String {
        format!("{}-{}", self.cache_prefix, self.version)
    }

    /// Parse a JSON config. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> crossroad_common::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a JSON config file.
    pub async fn from_file(path: &Path) -> crossroad_common::Result<Self> {
        let json = tokio::fs::read_to_string(path).await?;
        Self::from_json_str(&json)
    }

    /// Check the config without resolving it.
    pub fn validate(&self) -> crossroad_common::Result<()> {
        self.resolve().map(|_| ())
    }

    /// Resolve every URL against the scope and fix the cache name.
    pub fn resolve(&self) -> crossroad_common::Result<CacheManifest> {
        if self.cache_prefix.trim().is_empty() {
            return Err(CrossroadError::config("cache_prefix must not be empty"));
        }
        if self.version.trim().is_empty() {
            return Err(CrossroadError::config("version must not be empty"));
        }

        let scope = Url::parse(&self.scope)
            .config_context(format!("scope '{}' is not an absolute URL", self.scope))?;
        if !matches!(scope.scheme(), "http" | "https") {
            return Err(CrossroadError::config(format!(
                "scope '{scope}' must be http or https"
            )));
        }

        let join = |asset: &String| {
            scope
                .join(asset)
                .config_context(format!("asset '{asset}' does not resolve against {scope}"))
        };

        let best_effort = self
            .opaque_assets
            .iter()
            .map(join)
            .collect::<crossroad_common::Result<Vec<_>>>()?;

        // Compared after resolution: "./x" and "x" name the same asset.
        let mut required = Vec::new();
        for asset in &self.assets {
            let url = join(asset)?;
            if best_effort.contains(&url) {
                continue;
            }
            if required.contains(&url) {
                return Err(CrossroadError::config(format!("duplicate asset '{url}'")));
            }
            required.push(url);
        }

        Ok(CacheManifest {
            cache_name: self.cache_name(),
            scope,
            required,
            best_effort,
            passthrough_markers: self.passthrough_markers.clone(),
        })
    }
}

/// Resolved, immutable gatekeeper configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheManifest {
    /// Name of the current cache.
    pub cache_name: String,
    pub scope: Url,
    /// All-or-nothing install batch.
    pub required: Vec<Url>,
    /// Best-effort no-cors install fetches.
    pub best_effort: Vec<Url>,
    pub passthrough_markers: Vec<String>,
}

impl CacheManifest {
    /// Whether a URL's non-basic responses bypass the cache.
    pub fn is_passthrough(&self, url: &Url) -> bool {
        self.passthrough_markers
            .iter()
            .any(|marker| url.as_str().contains(marker.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_cache_name() {
        assert_eq!(
            GatekeeperConfig::default().cache_name(),
            "crossroad-navigator-cache-v1"
        );
    }

    #[test]
    fn test_resolve_splits_required_and_best_effort() {
        let manifest = GatekeeperConfig::default().resolve().unwrap();

        assert_eq!(manifest.cache_name, "crossroad-navigator-cache-v1");
        assert_eq!(
            manifest.required,
            vec![
                Url::parse("http://localhost:8080/index.html").unwrap(),
                Url::parse(INTER_FONT_CSS).unwrap(),
            ]
        );
        assert_eq!(manifest.best_effort, vec![Url::parse(TAILWIND_CDN).unwrap()]);
    }

    #[test]
    fn test_opaque_assets_match_after_resolution() {
        let config = GatekeeperConfig {
            assets: vec![
                "./index.html".to_string(),
                "https://cdn.tailwindcss.com/".to_string(),
                "vendor/icons.css".to_string(),
            ],
            opaque_assets: vec![
                "https://cdn.tailwindcss.com".to_string(),
                "./vendor/icons.css".to_string(),
            ],
            ..Default::default()
        };

        let manifest = config.resolve().unwrap();
        assert_eq!(
            manifest.required,
            vec![Url::parse("http://localhost:8080/index.html").unwrap()]
        );
        assert_eq!(
            manifest.best_effort,
            vec![
                Url::parse("https://cdn.tailwindcss.com/").unwrap(),
                Url::parse("http://localhost:8080/vendor/icons.css").unwrap(),
            ]
        );
    }

    #[test]
    fn test_passthrough_marker() {
        let manifest = GatekeeperConfig::default().resolve().unwrap();

        assert!(manifest.is_passthrough(&Url::parse("https://placehold.co/600x400").unwrap()));
        assert!(!manifest.is_passthrough(&Url::parse("https://example.com/a.png").unwrap()));
    }

    #[test]
    fn test_json_overrides_merge_with_defaults() {
        let config = GatekeeperConfig::from_json_str(
            r#"{ "version": "v2", "scope": "https://crossroad.example/app/" }"#,
        )
        .unwrap();

        assert_eq!(config.cache_name(), "crossroad-navigator-cache-v2");
        assert_eq!(config.assets.len(), 3);

        let manifest = config.resolve().unwrap();
        assert_eq!(
            manifest.required[0].as_str(),
            "https://crossroad.example/app/index.html"
        );
    }

    #[test]
    fn test_rejects_bad_scope() {
        let config = GatekeeperConfig {
            scope: "index.html".to_string(),
            ..Default::default()
        };
        assert_eq!(config.validate().unwrap_err().category(), "config");

        let config = GatekeeperConfig {
            scope: "file:///srv/page/".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_empty_version_and_duplicates() {
        let config = GatekeeperConfig {
            version: " ".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = GatekeeperConfig {
            assets: vec!["index.html".to_string(), "./index.html".to_string()],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_json() {
        let err = GatekeeperConfig::from_json_str("{ version: v2 }").unwrap_err();
        assert_eq!(err.category(), "json");
    }

    #[tokio::test]
    async fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gatekeeper.json");
        tokio::fs::write(&path, r#"{ "passthrough_markers": [] }"#)
            .await
            .unwrap();

        let config = GatekeeperConfig::from_file(&path).await.unwrap();
        assert!(config.passthrough_markers.is_empty());
        assert_eq!(config.version, DEFAULT_CACHE_VERSION);
    }
}
