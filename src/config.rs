//! Site configuration module.
//!
//! Handles loading, validating, and merging `config.toml`. Stock defaults are
//! overridden by a `config.toml` at the root of the source directory, the same
//! directory whose `site/` subtree becomes the website:
//!
//! ```text
//! mysite/
//! ├── config.toml              # Overrides stock defaults
//! └── site/
//!     ├── index.md
//!     ├── style.css
//!     └── img/
//! ```
//!
//! The config file is also a build-script source: editing it invalidates every
//! memoized unit of the next build.
//!
//! ## Configuration Options
//!
//! ```toml
//! # All options are optional - defaults shown below
//!
//! scheme_and_domain = "http://www.example.com"
//! resources_path = "/_resources/"
//! fake_resource_route = "http://fake-rr.invalid/"
//! # favicon = "/favicon.ico" # Linked from every page's AUTOHEAD line
//!
//! [rewriter]
//! marker = "?rr"             # Suffix that marks a resource reference
//! origins = []               # Hosts whose absolute refs point into the site
//! token_length = 15          # Characters of hash in rewritten names
//!
//! [secrets]
//! rr_hash_seed = ""          # Keeps names of unpublished resources unguessable
//! etag_seed = ""
//!
//! [robots]
//! index_from = ["/"]         # Crawling starts here
//! dont_index_from = []       # ...and stops here
//!
//! [files]
//! rewritable_extensions = ["html", "css", "js", "appcache"]
//! gzip_extensions = ["html", "css", "js", "svg", "appcache"]
//! direct_extensions = ["txt", "asc", "pdf", "zip", "ico", "xml"]
//! ```
//!
//! Unknown keys are rejected to catch typos early.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

use crate::rewrite::RewriterOptions;
use crate::urlsyntax;

pub const CONFIG_FILE: &str = "config.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Site configuration loaded from `config.toml`.
///
/// All fields have sensible defaults. User config files need only specify
/// the values they want to override. Unknown keys are rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SiteConfig {
    /// Canonical scheme and host of the site, without a trailing slash.
    pub scheme_and_domain: String,
    /// Server path prefix under which rewritten resources are served.
    pub resources_path: String,
    /// Route prefix that stands in for resources in the route table.
    /// Never served; it only has to be distinct from every real route.
    pub fake_resource_route: String,
    /// Site-root path of the icon linked from every page's AUTOHEAD line.
    pub favicon: Option<String>,
    pub rewriter: RewriterConfig,
    pub secrets: SecretsConfig,
    pub robots: RobotsConfig,
    pub files: FilesConfig,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            scheme_and_domain: "http://www.example.com".to_string(),
            resources_path: "/_resources/".to_string(),
            fake_resource_route: "http://fake-rr.invalid/".to_string(),
            favicon: None,
            rewriter: RewriterConfig::default(),
            secrets: SecretsConfig::default(),
            robots: RobotsConfig::default(),
            files: FilesConfig::default(),
        }
    }
}

impl SiteConfig {
    /// Validate config values are within acceptable ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let marker = &self.rewriter.marker;
        if marker.is_empty() || !marker.bytes().all(urlsyntax::is_url_byte) {
            return Err(ConfigError::Validation(
                "rewriter.marker must be non-empty and contain only URL characters".into(),
            ));
        }
        if self.rewriter.token_length == 0 || self.rewriter.token_length > 64 {
            return Err(ConfigError::Validation(
                "rewriter.token_length must be 1-64".into(),
            ));
        }
        if self.scheme_and_domain.ends_with('/') {
            return Err(ConfigError::Validation(
                "scheme_and_domain must not end with '/'".into(),
            ));
        }
        let parsed = Url::parse(&self.scheme_and_domain).map_err(|e| {
            ConfigError::Validation(format!("scheme_and_domain {:?}: {e}", self.scheme_and_domain))
        })?;
        if parsed.host_str().is_none() || parsed.path() != "/" {
            return Err(ConfigError::Validation(
                "scheme_and_domain must be a scheme and host only, e.g. \"https://example.com\"".into(),
            ));
        }
        if !self.resources_path.starts_with('/') || !self.resources_path.ends_with('/') {
            return Err(ConfigError::Validation(
                "resources_path must start and end with '/'".into(),
            ));
        }
        if !self.fake_resource_route.ends_with('/') {
            return Err(ConfigError::Validation(
                "fake_resource_route must end with '/'".into(),
            ));
        }
        if self.fake_resource_route.starts_with(&self.scheme_and_domain) {
            return Err(ConfigError::Validation(
                "fake_resource_route must not be under scheme_and_domain".into(),
            ));
        }
        if self.favicon.as_deref().is_some_and(|icon| !icon.starts_with('/')) {
            return Err(ConfigError::Validation(
                "favicon must be a site-root path starting with '/'".into(),
            ));
        }
        for route in self.robots.index_from.iter().chain(&self.robots.dont_index_from) {
            if !route.starts_with('/') {
                return Err(ConfigError::Validation(format!(
                    "robots routes must start with '/': {route:?}"
                )));
            }
        }
        Ok(())
    }

    /// Absolute route for a domain-relative path such as `/about`.
    pub fn route_for(&self, path: &str) -> String {
        format!("{}{}", self.scheme_and_domain, path)
    }

    /// Rewriter settings for a site rooted at `site_prefix` inside `building/`.
    pub fn rewriter_options(&self, site_prefix: impl Into<PathBuf>) -> RewriterOptions {
        RewriterOptions {
            site_prefix: site_prefix.into(),
            marker: self.rewriter.marker.clone(),
            hash_seed: self.secrets.rr_hash_seed.as_bytes().to_vec(),
            origins: self.rewriter.origins.iter().cloned().collect::<BTreeSet<_>>(),
            token_len: self.rewriter.token_length,
            ..RewriterOptions::default()
        }
    }
}

/// Resource rewriting settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RewriterConfig {
    pub marker: String,
    /// Hosts allowed in absolute resource references, e.g. for `og:image`.
    pub origins: Vec<String>,
    pub token_length: usize,
}

impl Default for RewriterConfig {
    fn default() -> Self {
        Self {
            marker: "?rr".to_string(),
            origins: Vec::new(),
            token_length: 15,
        }
    }
}

/// Seeds mixed into resource names and ETags.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SecretsConfig {
    pub rr_hash_seed: String,
    pub etag_seed: String,
}

/// Which routes search engines may index.
///
/// Indexable routes are those reachable by links from `index_from` without
/// passing through `dont_index_from`. Both lists hold domain-relative routes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RobotsConfig {
    pub index_from: Vec<String>,
    pub dont_index_from: Vec<String>,
}

impl Default for RobotsConfig {
    fn default() -> Self {
        Self {
            index_from: vec!["/".to_string()],
            dont_index_from: Vec::new(),
        }
    }
}

/// How source files are classified by extension (without the dot).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FilesConfig {
    /// Files scanned for resource references and rewritten.
    pub rewritable_extensions: Vec<String>,
    pub gzip_extensions: Vec<String>,
    /// Files that get a route of their own at their source path.
    pub direct_extensions: Vec<String>,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            rewritable_extensions: strings(&["html", "css", "js", "appcache"]),
            gzip_extensions: strings(&["html", "css", "js", "svg", "appcache"]),
            direct_extensions: strings(&["txt", "asc", "pdf", "zip", "ico", "xml"]),
        }
    }
}

impl FilesConfig {
    pub fn is_rewritable(&self, path: &str) -> bool {
        has_extension(path, &self.rewritable_extensions)
    }

    pub fn is_worth_gzipping(&self, path: &str) -> bool {
        has_extension(path, &self.gzip_extensions)
    }

    pub fn is_direct(&self, path: &str) -> bool {
        has_extension(path, &self.direct_extensions)
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn has_extension(path: &str, extensions: &[String]) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path);
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)),
        _ => false,
    }
}

// ============================================================================
// Loading
// ============================================================================

/// Returns the stock default config as a `toml::Value::Table`.
///
/// This is the canonical representation of all default values, used as the
/// base layer for merging user overrides on top.
pub fn stock_defaults_value() -> toml::Value {
    toml::Value::try_from(SiteConfig::default()).expect("default config must serialize")
}

/// Recursively merge `overlay` on top of `base`.
///
/// - Tables are merged key-by-key (overlay keys override base keys).
/// - Non-table values in overlay replace base values entirely.
/// - Keys in base that are not in overlay are preserved.
pub fn merge_toml(base: toml::Value, overlay: toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(mut base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                let merged = match base_table.remove(&key) {
                    Some(base_val) => merge_toml(base_val, overlay_val),
                    None => overlay_val,
                };
                base_table.insert(key, merged);
            }
            toml::Value::Table(base_table)
        }
        (_, overlay) => overlay,
    }
}

/// Load a `config.toml` from a directory as a raw TOML value.
///
/// Returns `Ok(None)` if no `config.toml` exists in the directory.
/// Returns `Err` if the file exists but contains invalid TOML.
pub fn load_raw_config(path: &Path) -> Result<Option<toml::Value>, ConfigError> {
    let config_path = path.join(CONFIG_FILE);
    if !config_path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(&config_path)?;
    let value: toml::Value = toml::from_str(&content)?;
    Ok(Some(value))
}

/// Merge an optional overlay onto a base value, then deserialize and validate.
pub fn resolve_config(
    base: toml::Value,
    overlay: Option<toml::Value>,
) -> Result<SiteConfig, ConfigError> {
    let merged = match overlay {
        Some(ov) => merge_toml(base, ov),
        None => base,
    };
    let config: SiteConfig = merged.try_into()?;
    config.validate()?;
    Ok(config)
}

/// Load config from `config.toml` in the given directory.
///
/// Merges user values on top of stock defaults, rejects unknown keys,
/// and validates the result.
pub fn load_config(root: &Path) -> Result<SiteConfig, ConfigError> {
    let base = stock_defaults_value();
    let overlay = load_raw_config(root)?;
    resolve_config(base, overlay)
}

/// Returns a fully-commented stock `config.toml` with all keys and explanations.
///
/// Used by the `gen-config` CLI command.
pub fn stock_config_toml() -> &'static str {
    r##"# rrsite Configuration
# ====================
# All settings are optional. Remove or comment out any you don't need.
# Values shown below are the defaults.
#
# Place this file next to the site/ directory. Editing it rebuilds everything.
# Unknown keys will cause an error.

# Canonical scheme and host, without a trailing slash.
scheme_and_domain = "http://www.example.com"

# Server path under which rewritten resources are served.
resources_path = "/_resources/"

# Placeholder route prefix for resources in the route table. It is never
# served and must not be under scheme_and_domain.
fake_resource_route = "http://fake-rr.invalid/"

# Icon linked from every page's <!--AUTOHEAD--> line as a resource reference.
# favicon = "/favicon.ico"

# ---------------------------------------------------------------------------
# Resource rewriting
# ---------------------------------------------------------------------------
[rewriter]
# A URL ending in this marker is a resource reference: src="img/a.png?rr"
marker = "?rr"

# Hosts whose absolute references ("https://www.example.com/a.png?rr") are
# treated as references into the site. Any other host is an error.
origins = []

# Characters of the content hash spliced into rewritten names.
token_length = 15

# ---------------------------------------------------------------------------
# Secrets
# ---------------------------------------------------------------------------
[secrets]
# Mixed into every resource hash so unpublished resource names can't be guessed.
rr_hash_seed = ""

# Mixed into every ETag.
etag_seed = ""

# ---------------------------------------------------------------------------
# Robots
# ---------------------------------------------------------------------------
[robots]
# Routes reachable by links from these are indexable...
index_from = ["/"]

# ...unless the only way there passes through one of these.
dont_index_from = []

# ---------------------------------------------------------------------------
# File classification (extensions without the dot)
# ---------------------------------------------------------------------------
[files]
# Scanned for resource references and rewritten.
rewritable_extensions = ["html", "css", "js", "appcache"]

# Marked as worth pre-compressing in the route table.
gzip_extensions = ["html", "css", "js", "svg", "appcache"]

# Served at their own path in addition to being usable as resources.
direct_extensions = ["txt", "asc", "pdf", "zip", "ico", "xml"]
"##
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_config_has_site_settings() {
        let config = SiteConfig::default();
        assert_eq!(config.scheme_and_domain, "http://www.example.com");
        assert_eq!(config.resources_path, "/_resources/");
        assert_eq!(config.rewriter.marker, "?rr");
        assert_eq!(config.rewriter.token_length, 15);
        assert_eq!(config.robots.index_from, vec!["/"]);
    }

    #[test]
    fn default_config_validates() {
        SiteConfig::default().validate().unwrap();
    }

    #[test]
    fn parse_partial_config() {
        let toml = r#"
scheme_and_domain = "https://idupree.example"

[rewriter]
origins = ["cdn.example"]
"#;
        let config: SiteConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.scheme_and_domain, "https://idupree.example");
        assert_eq!(config.rewriter.origins, vec!["cdn.example"]);
        // Defaults preserved
        assert_eq!(config.rewriter.marker, "?rr");
        assert_eq!(config.files.rewritable_extensions.len(), 4);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let result: Result<SiteConfig, _> = toml::from_str("[rewriter]\nmarkr = \"?x\"\n");
        assert!(result.is_err());
    }

    // =========================================================================
    // Validation
    // =========================================================================

    fn invalid(edit: impl FnOnce(&mut SiteConfig)) -> bool {
        let mut config = SiteConfig::default();
        edit(&mut config);
        matches!(config.validate(), Err(ConfigError::Validation(_)))
    }

    #[test]
    fn marker_must_be_url_bytes() {
        assert!(invalid(|c| c.rewriter.marker = String::new()));
        assert!(invalid(|c| c.rewriter.marker = "? rr".into()));
        assert!(!invalid(|c| c.rewriter.marker = "#v".into()));
    }

    #[test]
    fn token_length_is_bounded() {
        assert!(invalid(|c| c.rewriter.token_length = 0));
        assert!(invalid(|c| c.rewriter.token_length = 65));
        assert!(!invalid(|c| c.rewriter.token_length = 64));
    }

    #[test]
    fn scheme_and_domain_is_origin_only() {
        assert!(invalid(|c| c.scheme_and_domain = "http://www.example.com/".into()));
        assert!(invalid(|c| c.scheme_and_domain = "http://www.example.com/blog".into()));
        assert!(invalid(|c| c.scheme_and_domain = "www.example.com".into()));
    }

    #[test]
    fn resources_path_needs_both_slashes() {
        assert!(invalid(|c| c.resources_path = "_resources/".into()));
        assert!(invalid(|c| c.resources_path = "/_resources".into()));
    }

    #[test]
    fn fake_resource_route_must_not_shadow_site() {
        assert!(invalid(|c| c.fake_resource_route = "http://www.example.com/rr/".into()));
    }

    #[test]
    fn favicon_is_site_rooted() {
        assert!(invalid(|c| c.favicon = Some("favicon.ico".into())));
        assert!(!invalid(|c| c.favicon = Some("/favicon.ico".into())));
    }

    #[test]
    fn robots_routes_are_domain_relative() {
        assert!(invalid(|c| c.robots.dont_index_from = vec!["private/".into()]));
    }

    // =========================================================================
    // Derived settings
    // =========================================================================

    #[test]
    fn extension_matching() {
        let files = FilesConfig::default();
        assert!(files.is_rewritable("css/site.css"));
        assert!(files.is_rewritable("INDEX.HTML"));
        assert!(!files.is_rewritable("img/a.png"));
        assert!(files.is_worth_gzipping("logo.svg"));
        assert!(files.is_direct("robots.txt"));
        // A dotfile has no extension
        assert!(!files.is_direct(".txt"));
        assert!(!files.is_direct("dir.txt/readme"));
    }

    #[test]
    fn rewriter_options_carry_config() {
        let mut config = SiteConfig::default();
        config.secrets.rr_hash_seed = "pepper".into();
        config.rewriter.origins = vec!["www.example.com".into()];
        config.rewriter.token_length = 10;

        let options = config.rewriter_options("site");
        assert_eq!(options.site_prefix, PathBuf::from("site"));
        assert_eq!(options.hash_seed, b"pepper");
        assert!(options.origins.contains("www.example.com"));
        assert_eq!(options.token_len, 10);
        assert_eq!(options.cache_dir, PathBuf::from("rr"));
    }

    #[test]
    fn route_for_prefixes_domain() {
        assert_eq!(SiteConfig::default().route_for("/a"), "http://www.example.com/a");
    }

    // =========================================================================
    // load_config tests
    // =========================================================================

    #[test]
    fn load_config_returns_default_when_no_file() {
        let tmp = TempDir::new().unwrap();
        let config = load_config(tmp.path()).unwrap();
        assert_eq!(config, SiteConfig::default());
    }

    #[test]
    fn load_config_reads_file() {
        let tmp = TempDir::new().unwrap();
        fs::write(
            tmp.path().join(CONFIG_FILE),
            r#"
[secrets]
etag_seed = "abc"
"#,
        )
        .unwrap();

        let config = load_config(tmp.path()).unwrap();
        assert_eq!(config.secrets.etag_seed, "abc");
        assert_eq!(config.secrets.rr_hash_seed, "");
    }

    #[test]
    fn load_config_invalid_toml_is_error() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join(CONFIG_FILE), "this is not valid toml [[[").unwrap();

        let result = load_config(tmp.path());
        assert!(matches!(result, Err(ConfigError::Toml(_))));
    }

    #[test]
    fn load_config_validates_values() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join(CONFIG_FILE), "resources_path = \"res\"\n").unwrap();

        let result = load_config(tmp.path());
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    // =========================================================================
    // merge_toml tests
    // =========================================================================

    #[test]
    fn merge_toml_overlay_replaces_arrays() {
        let base = stock_defaults_value();
        let overlay: toml::Value = toml::from_str("[files]\ndirect_extensions = [\"pdf\"]\n").unwrap();
        let merged = merge_toml(base, overlay);
        let files = merged.get("files").unwrap();
        assert_eq!(
            files.get("direct_extensions").unwrap().as_array().unwrap().len(),
            1
        );
        // Sibling keys preserved
        assert!(files.get("gzip_extensions").is_some());
    }

    #[test]
    fn resolve_config_with_no_overlay() {
        let config = resolve_config(stock_defaults_value(), None).unwrap();
        assert_eq!(config, SiteConfig::default());
    }

    // =========================================================================
    // stock_config_toml tests
    // =========================================================================

    #[test]
    fn stock_config_toml_is_valid_toml() {
        let content = stock_config_toml();
        let _: toml::Value = toml::from_str(content).expect("stock config must be valid TOML");
    }

    #[test]
    fn stock_config_toml_roundtrips_to_defaults() {
        let config: SiteConfig = toml::from_str(stock_config_toml()).unwrap();
        assert_eq!(config, SiteConfig::default());
    }

    #[test]
    fn stock_config_toml_contains_all_sections() {
        let content = stock_config_toml();
        for section in ["[rewriter]", "[secrets]", "[robots]", "[files]"] {
            assert!(content.contains(section), "missing {section}");
        }
    }

    #[test]
    fn stock_defaults_value_has_all_sections() {
        let val = stock_defaults_value();
        assert!(val.is_table());
        for key in ["rewriter", "secrets", "robots", "files", "scheme_and_domain"] {
            assert!(val.get(key).is_some(), "missing {key}");
        }
    }
}
