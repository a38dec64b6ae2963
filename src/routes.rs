//! The route table: what the server answers for each absolute URL.
//!
//! Routes are absolute (`http://www.example.com/about`). Resources live under
//! the configured fake resource route until the emitter maps them to their
//! rewritten, content-hashed server paths. The not-found response is kept
//! apart from the table since no URL names it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::config::SiteConfig;

static SCHEME_AND_DOMAIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z0-9+.\-]+:)?//[^/]*").expect("scheme and domain pattern is a valid regex")
});

/// Placeholder host used to resolve domain-relative redirect targets.
const RELATIVE_HOST: &str = "relative.invalid";
const RELATIVE_BASE: &str = "http://relative.invalid";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("route {0} is defined more than once")]
pub struct DuplicateRoute(pub String);

/// Everything the server needs to answer one route.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteInfo {
    pub status: u16,
    /// In the order they are sent.
    pub headers: Vec<(String, String)>,
    /// Body, relative to the site root.
    pub file: Option<String>,
    pub worth_gzipping: bool,
    /// Redirect target, possibly domain-relative. Only for 3xx statuses.
    pub redirect_to: Option<String>,
}

impl RouteInfo {
    /// A 200 response with `file` as its body.
    pub fn file(file: impl Into<String>) -> Self {
        let file = file.into();
        Self {
            status: 200,
            headers: vec![("Content-Type".to_string(), content_type(&file))],
            file: Some(file),
            ..Self::default()
        }
    }

    pub fn redirect(status: u16, to: impl Into<String>) -> Self {
        Self {
            status,
            redirect_to: Some(to.into()),
            ..Self::default()
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn push_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.push((name.to_string(), value.into()));
    }
}

/// `Content-Type` for a file, by extension, with a UTF-8 charset for text.
pub fn content_type(file: &str) -> String {
    let lower = file.to_ascii_lowercase();
    let mut mime = if lower.ends_with(".key.asc") || lower.ends_with(".pubkey.asc") {
        "application/pgp-keys".to_string()
    } else {
        mime_guess::from_path(file)
            .first()
            .map(|m| m.essence_str().to_string())
            .unwrap_or_else(|| "application/octet-stream".to_string())
    };
    let textual = mime.starts_with("text/")
        || mime.ends_with("+xml")
        || mime.ends_with("/xml")
        || mime.ends_with("+json")
        || mime.ends_with("/json")
        || mime == "application/javascript";
    if textual {
        mime.push_str("; charset=utf-8");
    }
    mime
}

/// `route` without its scheme and host: `http://a.com/x` becomes `/x`.
pub fn domainless(route: &str) -> &str {
    match SCHEME_AND_DOMAIN.find(route) {
        Some(m) => &route[m.end()..],
        None => route,
    }
}

/// Resolve `target` against the domain-relative `base`, staying
/// domain-relative unless `target` names its own host.
pub fn join_relative(base: &str, target: &str) -> String {
    let joined = Url::parse(RELATIVE_BASE)
        .and_then(|root| root.join(base))
        .and_then(|base| base.join(target));
    match joined {
        Ok(url) if url.scheme() == "http" && url.host_str() == Some(RELATIVE_HOST) => {
            let mut relative = url.path().to_string();
            if let Some(query) = url.query() {
                relative.push('?');
                relative.push_str(query);
            }
            if let Some(fragment) = url.fragment() {
                relative.push('#');
                relative.push_str(fragment);
            }
            relative
        }
        Ok(url) => url.to_string(),
        Err(_) => target.to_string(),
    }
}

/// All routes of a site.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteTable {
    routes: BTreeMap<String, RouteInfo>,
    not_found: Option<RouteInfo>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, route: impl Into<String>, info: RouteInfo) -> Result<(), DuplicateRoute> {
        let route = route.into();
        if self.routes.contains_key(&route) {
            return Err(DuplicateRoute(route));
        }
        self.routes.insert(route, info);
        Ok(())
    }

    pub fn add_redirect(&mut self, status: u16, from: impl Into<String>, to: impl Into<String>) -> Result<(), DuplicateRoute> {
        self.add(from, RouteInfo::redirect(status, to))
    }

    pub fn get(&self, route: &str) -> Option<&RouteInfo> {
        self.routes.get(route)
    }

    pub fn contains(&self, route: &str) -> bool {
        self.routes.contains_key(route)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &RouteInfo)> {
        self.routes.iter()
    }

    pub fn routes(&self) -> impl Iterator<Item = &String> {
        self.routes.keys()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn not_found(&self) -> Option<&RouteInfo> {
        self.not_found.as_ref()
    }

    /// Use `info` (typically the 404 page) for URLs with no route.
    pub fn set_not_found(&mut self, mut info: RouteInfo) {
        info.push_header("X-Frame-Options", "SAMEORIGIN");
        info.push_header("X-Robots-Tag", "noarchive, noindex, nosnippet");
        self.not_found = Some(info);
    }

    /// Make `/x` and `/x/` both answer: whichever of the pair is missing
    /// redirects to the one that exists. A 301 is copied instead, so clients
    /// follow a single redirect.
    pub fn add_trailing_slash_duals<'a>(&mut self, routes: impl IntoIterator<Item = &'a String>) {
        for route in routes {
            let path = domainless(route);
            if path.len() <= 1 {
                continue;
            }
            let dual = match route.strip_suffix('/') {
                Some(without) => without.to_string(),
                None => format!("{route}/"),
            };
            if self.routes.contains_key(&dual) {
                continue;
            }
            let Some(info) = self.routes.get(route) else {
                continue;
            };
            let dual_info = if info.status == 301 {
                let mut copy = info.clone();
                copy.redirect_to = info.redirect_to.as_deref().map(|to| join_relative(path, to));
                copy
            } else {
                RouteInfo::redirect(301, path)
            };
            self.routes.insert(dual, dual_info);
        }
    }

    /// Attach caching, robots and framing headers to every route.
    pub fn apply_headers(&mut self, config: &SiteConfig, indexable: &BTreeSet<String>) {
        for (route, info) in self.routes.iter_mut() {
            let is_resource = route.starts_with(&config.fake_resource_route);
            let path = Url::parse(route).map(|u| u.path().to_string()).unwrap_or_default();
            let cache_control = if path == "/robots.txt" {
                "max-age=15, must-revalidate"
            } else if is_resource || path == "/t.gif" {
                "max-age=8000000"
            } else if path == "/favicon.ico" {
                "max-age=400000"
            } else {
                "max-age=300"
            };
            info.push_header("Cache-Control", cache_control);
            let robots = if indexable.contains(route) {
                "noarchive"
            } else {
                "noarchive, noindex"
            };
            info.push_header("X-Robots-Tag", robots);
            info.push_header("X-Frame-Options", "SAMEORIGIN");
            if info.status == 200 && !is_resource {
                info.push_header("Link", format!("<{route}>; rel=\"canonical\""));
            }
        }
    }
}
