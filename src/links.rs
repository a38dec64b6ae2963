//! Internal link graph of a site: which routes each page links to.
//!
//! Two kinds of link are found in rewritable files:
//!
//! - **href links** in `<a>`, `<area>` and `<link>` tags, resolved against the
//!   linking route. Links to other hosts are ignored.
//! - **resource references** (`img/a.png?rr`), resolved the same way the
//!   rewriter resolves them and mapped to resource routes.
//!
//! Links that are neither are not found. That errs toward leaving odd pages
//! out of the index rather than exposing half-private ones.
//!
//! A link to this site that matches no route, or a reference to a resource
//! that does not exist, is a [`BrokenLink`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;

use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::closure;
use crate::config::SiteConfig;
use crate::rewrite::{ResourceRewriter, RewriteError};
use crate::routes::RouteTable;
use crate::urlsyntax::{self, RefScanner};

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Rewrite(#[from] RewriteError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LinkKind {
    Href,
    Resource,
}

/// A link from `route` to something that does not exist.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct BrokenLink {
    pub route: String,
    pub kind: LinkKind,
    /// The link as written.
    pub reference: String,
}

impl fmt::Display for BrokenLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self.kind {
            LinkKind::Href => "links to",
            LinkKind::Resource => "references",
        };
        write!(f, "{} {what} nonexistent {}", self.route, self.reference)
    }
}

/// Outgoing internal links per route.
#[derive(Debug, Default)]
pub struct LinkGraph {
    edges: BTreeMap<String, BTreeSet<String>>,
    broken: Vec<BrokenLink>,
}

impl LinkGraph {
    /// Scan every route whose body is a rewritable file.
    pub fn scan(table: &RouteTable, rewriter: &ResourceRewriter, config: &SiteConfig) -> Result<Self, LinkError> {
        let scanner = RefScanner::new(&config.rewriter.marker);
        let mut graph = LinkGraph::default();
        for (route, info) in table.iter() {
            let Some(file) = &info.file else { continue };
            if !rewriter.rewritable_files().contains(file) {
                continue;
            }
            let contents = fs::read(rewriter.site_path(file))?;
            let mut targets = BTreeSet::new();

            let base = Url::parse(route).ok();
            for href in urlsyntax::find_href_links(&contents, scanner.marker()) {
                let Some(base) = &base else { break };
                let text = String::from_utf8_lossy(href);
                let Ok(mut target) = base.join(&text) else { continue };
                target.set_fragment(None);
                let target = target.to_string();
                if table.contains(&target) {
                    targets.insert(target);
                } else if is_under(&target, &config.scheme_and_domain) {
                    graph.broken.push(BrokenLink {
                        route: route.clone(),
                        kind: LinkKind::Href,
                        reference: text.into_owned(),
                    });
                }
            }

            for found in scanner.find_refs(&contents) {
                let resolved = rewriter.resolve_reference(file, found.reference)?;
                let path = rewriter.site_path(&resolved.path);
                if !path.exists() {
                    graph.broken.push(BrokenLink {
                        route: route.clone(),
                        kind: LinkKind::Resource,
                        reference: String::from_utf8_lossy(found.reference).into_owned(),
                    });
                    continue;
                }
                let reached = if path.is_dir() {
                    rewriter.transitive_deps(&resolved.path)?
                } else {
                    vec![resolved.path]
                };
                for f in reached {
                    let target = format!("{}{f}", config.fake_resource_route);
                    if table.contains(&target) {
                        targets.insert(target);
                    }
                }
            }

            debug!(route = %route, links = targets.len(), "Scanned links");
            graph.edges.insert(route.clone(), targets);
        }
        Ok(graph)
    }

    pub fn links_from(&self, route: &str) -> impl Iterator<Item = &String> {
        self.edges.get(route).into_iter().flatten()
    }

    pub fn broken(&self) -> &[BrokenLink] {
        &self.broken
    }

    /// Routes reachable from `index_from` without passing through
    /// `dont_index_from`. The starting routes themselves are included.
    pub fn indexable(&self, index_from: &[String], dont_index_from: &BTreeSet<String>) -> BTreeSet<String> {
        closure::transitive_from_many(
            |route: &String| {
                self.links_from(route)
                    .filter(|next| !dont_index_from.contains(*next))
                    .cloned()
                    .collect::<Vec<_>>()
            },
            index_from.iter().cloned(),
            true,
        )
        .into_iter()
        .collect()
    }
}

/// Whether `url` is on the site rooted at `scheme_and_domain`.
fn is_under(url: &str, scheme_and_domain: &str) -> bool {
    match url.strip_prefix(scheme_and_domain) {
        Some(rest) => rest.is_empty() || rest.starts_with(['/', '?', '#']),
        None => false,
    }
}
