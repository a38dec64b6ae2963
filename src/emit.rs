//! Server rules: the deployable form of an assembled site.
//!
//! Emission writes, inside `building/`:
//!
//! ```text
//! rewritten/               # The site with every ?rr reference rewritten
//! pagecontent-hash/<f>     # Hex SHA-384 of rewritten/<f>
//! pagecontent/ab/cdef...   # Response bodies, addressed by content hash
//! routes.json              # One rule per server path, plus the not-found rule
//! nocdn-resource-routes    # Absolute URLs of every rewritten resource
//! nonresource-routes       # Routes of pages, redirects and direct files
//! ```
//!
//! Resources are served at `resources_path + rewritten name`, so their URLs
//! change whenever their content (or anything they reference) does and they
//! can be cached for months. Everything else is served at its route's path.
//!
//! Each rule carries an ETag derived from its status, headers and body hash.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::buildsystem::{BuildError, BuildRun};
use crate::hash;
use crate::rewrite::{self, RewriteError};
use crate::routes::{self, RouteInfo};
use crate::site::Site;

pub const REWRITTEN_DIR: &str = "rewritten";
pub const PAGECONTENT_HASH_DIR: &str = "pagecontent-hash";
pub const PAGECONTENT_DIR: &str = "pagecontent";
pub const ROUTES_FILE: &str = "routes.json";
pub const NOCDN_RESOURCE_ROUTES_FILE: &str = "nocdn-resource-routes";
pub const NONRESOURCE_ROUTES_FILE: &str = "nonresource-routes";

/// Base64 characters of an ETag; more than 128 bits.
const ETAG_LEN: usize = 22;

#[derive(Error, Debug)]
pub enum EmitError {
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Rewrite(#[from] RewriteError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Server path {path} is claimed by both {first} and {second}")]
    ServerPathCollision {
        path: String,
        first: String,
        second: String,
    },
}

/// How the server answers one path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRule {
    pub route: String,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub redirect_to: Option<String>,
    /// Body, relative to `pagecontent/`.
    pub content: Option<String>,
    pub worth_gzipping: bool,
    pub etag: String,
}

/// Everything written to `routes.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRules {
    /// Keyed by server path, e.g. `/about` or `/_resources/a.<token>.css`.
    pub routes: BTreeMap<String, ServerRule>,
    pub not_found: Option<ServerRule>,
}

/// Result of [`emit`].
#[derive(Debug)]
pub struct Emitted {
    pub rules: ServerRules,
    /// Files placed in `rewritten/`.
    pub mirrored: usize,
    /// Distinct response bodies in `pagecontent/`.
    pub bodies: usize,
}

/// `ab/cdef...` for a hex content hash.
pub fn pagecontent_path(hex_hash: &str) -> String {
    let end = hex_hash.len().min(60);
    format!("{}/{}", &hex_hash[..2.min(end)], &hex_hash[2.min(end)..end])
}

/// ETag over a response's status, headers and body hash.
pub fn etag(seed: &[u8], status: u16, headers: &[(String, String)], content_hash: Option<&str>) -> String {
    let mut parts: Vec<Vec<u8>> = vec![seed.to_vec(), format!("{status}\n").into_bytes()];
    for (name, value) in headers {
        parts.push(format!("{name}: {value}\n").into_bytes());
    }
    if let Some(content_hash) = content_hash {
        parts.push(b"\n".to_vec());
        parts.push(content_hash.as_bytes().to_vec());
    }
    hash::url_token(&hash::hash_parts(&parts), ETAG_LEN)
}

/// Rewrite the site, store response bodies and write the rule files.
pub fn emit(run: &BuildRun, site: &Site) -> Result<Emitted, EmitError> {
    let config = &site.config;
    let rewritten_dir = Path::new(REWRITTEN_DIR);
    let resources_path = config.resources_path.clone();
    let mirrored = site.rewriter.rewrite(
        rewritten_dir,
        move |name, _| format!("{resources_path}{name}"),
        Some(rewrite::hard_link),
        Some(rewrite::hard_link),
    )?;

    let mut bodies: BTreeMap<String, String> = BTreeMap::new();
    let files: BTreeSet<&String> = site
        .routes
        .iter()
        .map(|(_, info)| info)
        .chain(site.routes.not_found())
        .filter_map(|info| info.file.as_ref())
        .collect();
    for f in files {
        let hash = store_body(run, rewritten_dir, f)?;
        bodies.insert(f.clone(), hash);
    }

    let mut rules = ServerRules::default();
    let mut nocdn_resource_routes = Vec::new();
    for (route, info) in site.routes.iter() {
        let path = match site.resource_file(route) {
            Some(f) => {
                let path = format!("{}{}", config.resources_path, site.rewriter.rewritten_name(f)?);
                nocdn_resource_routes.push(format!("{}{path}", config.scheme_and_domain));
                path
            }
            None => routes::domainless(route).to_string(),
        };
        let rule = server_rule(route, info, &bodies, config.secrets.etag_seed.as_bytes());
        if let Some(existing) = rules.routes.get(&path) {
            return Err(EmitError::ServerPathCollision {
                path,
                first: existing.route.clone(),
                second: route.clone(),
            });
        }
        rules.routes.insert(path, rule);
    }
    rules.not_found = site
        .routes
        .not_found()
        .map(|info| server_rule("", info, &bodies, config.secrets.etag_seed.as_bytes()));

    run.write_if_changed(Path::new(ROUTES_FILE), serde_json::to_string_pretty(&rules)?)?;
    nocdn_resource_routes.sort();
    run.write_if_changed(Path::new(NOCDN_RESOURCE_ROUTES_FILE), nocdn_resource_routes.join("\n"))?;
    let page_routes: Vec<&str> = site.page_routes.iter().map(String::as_str).collect();
    run.write_if_changed(Path::new(NONRESOURCE_ROUTES_FILE), page_routes.join("\n"))?;

    info!(
        rules = rules.routes.len(),
        bodies = bodies.len(),
        mirrored = mirrored.len(),
        "Emitted server rules"
    );
    Ok(Emitted {
        mirrored: mirrored.len(),
        bodies: bodies.len(),
        rules,
    })
}

/// Hash `rewritten/<f>` and link it into `pagecontent/`. Returns the hex hash.
fn store_body(run: &BuildRun, rewritten_dir: &Path, f: &str) -> Result<String, EmitError> {
    let source = rewritten_dir.join(f);
    let hash_record = Path::new(PAGECONTENT_HASH_DIR).join(f);
    run.memoize(&[source.clone()], &[hash_record.clone()], |sources, dests| {
        fs::write(&dests[0], hash::hash_file_hex(&sources[0])?)?;
        Ok::<_, EmitError>(())
    })?;
    let hash = fs::read_to_string(run.building_dir().join(&hash_record))?;

    let body: PathBuf = Path::new(PAGECONTENT_DIR).join(pagecontent_path(&hash));
    run.memoize(&[source], &[body], |sources, dests| {
        fs::hard_link(&sources[0], &dests[0])?;
        Ok::<_, EmitError>(())
    })?;
    debug!(file = %f, hash = %hash, "Stored body");
    Ok(hash)
}

fn server_rule(route: &str, info: &RouteInfo, bodies: &BTreeMap<String, String>, etag_seed: &[u8]) -> ServerRule {
    let content_hash = info.file.as_ref().and_then(|f| bodies.get(f));
    // Location is estimated from the redirect target; the server may make it absolute.
    let mut etag_headers = Vec::new();
    if let Some(to) = &info.redirect_to {
        etag_headers.push(("Location".to_string(), to.clone()));
    }
    etag_headers.extend(info.headers.iter().cloned());
    ServerRule {
        route: route.to_string(),
        status: info.status,
        headers: info.headers.clone(),
        redirect_to: info.redirect_to.clone(),
        content: content_hash.map(|h| pagecontent_path(h)),
        worth_gzipping: info.worth_gzipping,
        etag: etag(etag_seed, info.status, &etag_headers, content_hash.map(String::as_str)),
    }
}
