//! CLI output formatting for the build stages.
//!
//! # Information-First Display
//!
//! Output is **route-centric, not file-centric**. Every page is listed by the
//! path it is served at, with the file behind it as indented context. Resources
//! are listed by site path since their served names change with their content.
//!
//! # Output Format
//!
//! ## Site
//!
//! ```text
//! Pages
//! 001 /
//!     Source: index.html
//! 002 /about
//!     Source: about.html
//!     Not indexed
//!
//! Redirects
//! 001 /old → 301 /about
//!
//! Resources
//! 001 img/bg.png
//! 002 style.css
//!
//! 2 pages, 1 redirect, 2 resources
//! ```
//!
//! ## Emit
//!
//! ```text
//! Server rules: 9 paths, 5 bodies
//! Rewritten: 6 files
//! ```
//!
//! # Architecture
//!
//! Each stage has a `format_*` function (returns `Vec<String>`) for testability
//! and a `print_*` wrapper that writes to stdout. Format functions do no I/O.

use std::collections::BTreeSet;
use std::path::Path;

use crate::buildsystem::BuildStats;
use crate::config::SiteConfig;
use crate::emit::Emitted;
use crate::links::BrokenLink;
use crate::routes::{self, RouteTable};
use crate::site::Site;

// ============================================================================
// Shared display helpers
// ============================================================================

/// Format a 1-based positional index as 3-digit zero-padded.
fn format_index(pos: usize) -> String {
    format!("{:0>3}", pos)
}

/// Return indentation string: 4 spaces per depth level.
fn indent(depth: usize) -> String {
    "    ".repeat(depth)
}

/// `1 page`, `2 pages`
fn count(n: usize, singular: &str, plural: &str) -> String {
    format!("{n} {}", if n == 1 { singular } else { plural })
}

// ============================================================================
// Site
// ============================================================================

/// Format the assembled route table.
///
/// `page_routes` are the routes defined by source files; trailing-slash duals
/// added afterwards are not listed.
pub fn format_site_output(
    table: &RouteTable,
    page_routes: &BTreeSet<String>,
    config: &SiteConfig,
    indexable: &BTreeSet<String>,
) -> Vec<String> {
    let mut lines = Vec::new();
    let mut pages = Vec::new();
    let mut redirects = Vec::new();
    let mut resources = Vec::new();

    for (route, info) in table.iter() {
        if let Some(f) = route.strip_prefix(&config.fake_resource_route) {
            resources.push(f);
        } else if !page_routes.contains(route) {
            continue;
        } else if let Some(to) = &info.redirect_to {
            redirects.push((routes::domainless(route), info.status, to.as_str()));
        } else {
            pages.push((route, routes::domainless(route), info.file.as_deref()));
        }
    }

    if !pages.is_empty() {
        lines.push("Pages".to_string());
        for (i, (route, path, file)) in pages.iter().enumerate() {
            lines.push(format!("{} {}", format_index(i + 1), path));
            if let Some(file) = file {
                lines.push(format!("{}Source: {}", indent(1), file));
            }
            if !indexable.contains(*route) {
                lines.push(format!("{}Not indexed", indent(1)));
            }
        }
    }

    if !redirects.is_empty() {
        if !lines.is_empty() {
            lines.push(String::new());
        }
        lines.push("Redirects".to_string());
        for (i, (path, status, to)) in redirects.iter().enumerate() {
            lines.push(format!("{} {} → {} {}", format_index(i + 1), path, status, to));
        }
    }

    if !resources.is_empty() {
        if !lines.is_empty() {
            lines.push(String::new());
        }
        lines.push("Resources".to_string());
        for (i, f) in resources.iter().enumerate() {
            lines.push(format!("{} {}", format_index(i + 1), f));
        }
    }

    if !lines.is_empty() {
        lines.push(String::new());
    }
    lines.push(format!(
        "{}, {}, {}",
        count(pages.len(), "page", "pages"),
        count(redirects.len(), "redirect", "redirects"),
        count(resources.len(), "resource", "resources"),
    ));
    lines
}

/// Print the assembled site to stdout.
pub fn print_site_output(site: &Site) {
    for line in format_site_output(&site.routes, &site.page_routes, &site.config, &site.indexable) {
        println!("{}", line);
    }
}

// ============================================================================
// Broken links
// ============================================================================

pub fn format_broken_links(broken: &[BrokenLink]) -> Vec<String> {
    let mut lines = vec![format!("{} found", count(broken.len(), "broken link", "broken links"))];
    lines.extend(broken.iter().map(|b| format!("{}{}", indent(1), b)));
    lines
}

pub fn print_broken_links(broken: &[BrokenLink]) {
    for line in format_broken_links(broken) {
        eprintln!("{}", line);
    }
}

// ============================================================================
// Emit and build
// ============================================================================

pub fn format_emit_output(emitted: &Emitted) -> Vec<String> {
    vec![
        format!(
            "Server rules: {}, {}",
            count(emitted.rules.routes.len(), "path", "paths"),
            count(emitted.bodies, "body", "bodies"),
        ),
        format!("Rewritten: {}", count(emitted.mirrored, "file", "files")),
    ]
}

pub fn print_emit_output(emitted: &Emitted) {
    for line in format_emit_output(emitted) {
        println!("{}", line);
    }
}

pub fn format_build_summary(build_dir: &Path, stats: &BuildStats) -> Vec<String> {
    vec![
        format!("Units: {}", stats),
        format!("==> Build complete: {}", build_dir.display()),
    ]
}

pub fn print_build_summary(build_dir: &Path, stats: &BuildStats) {
    for line in format_build_summary(build_dir, stats) {
        println!("{}", line);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emit::ServerRules;
    use crate::links::LinkKind;
    use crate::routes::RouteInfo;

    fn route(path: &str) -> String {
        format!("http://www.example.com{path}")
    }

    fn sample_table() -> (RouteTable, BTreeSet<String>) {
        let mut table = RouteTable::new();
        table.add(route("/"), RouteInfo::file("index.html")).unwrap();
        table.add(route("/about"), RouteInfo::file("about.html")).unwrap();
        table.add_redirect(301, route("/old"), "/about").unwrap();
        table.add("http://fake-rr.invalid/style.css", RouteInfo::file("style.css")).unwrap();
        let pages: BTreeSet<String> = [route("/"), route("/about"), route("/old")].into();
        let duals: Vec<String> = pages.iter().cloned().collect();
        table.add_trailing_slash_duals(&duals);
        (table, pages)
    }

    // =========================================================================
    // Helper tests
    // =========================================================================

    #[test]
    fn format_index_pads() {
        assert_eq!(format_index(1), "001");
        assert_eq!(format_index(42), "042");
        assert_eq!(format_index(100), "100");
    }

    #[test]
    fn count_pluralizes() {
        assert_eq!(count(1, "page", "pages"), "1 page");
        assert_eq!(count(0, "page", "pages"), "0 pages");
    }

    // =========================================================================
    // Site output
    // =========================================================================

    #[test]
    fn site_output_lists_sections() {
        let (table, pages) = sample_table();
        let indexable = BTreeSet::from([route("/")]);
        let lines = format_site_output(&table, &pages, &SiteConfig::default(), &indexable);
        assert_eq!(
            lines,
            vec![
                "Pages",
                "001 /",
                "    Source: index.html",
                "002 /about",
                "    Source: about.html",
                "    Not indexed",
                "",
                "Redirects",
                "001 /old → 301 /about",
                "",
                "Resources",
                "001 style.css",
                "",
                "2 pages, 1 redirect, 1 resource",
            ]
        );
    }

    #[test]
    fn site_output_skips_duals() {
        let (table, pages) = sample_table();
        let lines = format_site_output(&table, &pages, &SiteConfig::default(), &BTreeSet::new());
        assert!(!lines.iter().any(|l| l.contains("/about/")));
    }

    #[test]
    fn empty_site_output_is_just_totals() {
        let lines = format_site_output(&RouteTable::new(), &BTreeSet::new(), &SiteConfig::default(), &BTreeSet::new());
        assert_eq!(lines, vec!["0 pages, 0 redirects, 0 resources"]);
    }

    // =========================================================================
    // Other stages
    // =========================================================================

    #[test]
    fn broken_links_output() {
        let broken = vec![BrokenLink {
            route: route("/"),
            kind: LinkKind::Href,
            reference: "/nowhere".into(),
        }];
        assert_eq!(
            format_broken_links(&broken),
            vec![
                "1 broken link found",
                "    http://www.example.com/ links to nonexistent /nowhere",
            ]
        );
    }

    #[test]
    fn emit_output_counts() {
        let emitted = Emitted {
            rules: ServerRules::default(),
            mirrored: 3,
            bodies: 1,
        };
        assert_eq!(
            format_emit_output(&emitted),
            vec!["Server rules: 0 paths, 1 body", "Rewritten: 3 files"]
        );
    }

    #[test]
    fn build_summary_shows_stats() {
        let stats = BuildStats {
            produced: 3,
            ..Default::default()
        };
        let lines = format_build_summary(Path::new("/tmp/+site-builds/build"), &stats);
        assert_eq!(lines[0], "Units: 3 built");
        assert_eq!(lines[1], "==> Build complete: /tmp/+site-builds/build");
    }
}
