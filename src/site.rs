//! Site assembly: turn `building/src/site/` into `building/site/` plus a
//! route table.
//!
//! ## Source Classification
//!
//! | Source | Output | Route |
//! |---|---|---|
//! | `a/b.html` | `a/b.html`, AUTOHEAD expanded | `/a/b` |
//! | `a/b.md` | `a/b.html`, rendered Markdown | `/a/b` |
//! | `a/index.html`, `a/index.md` | `a/index.html` | `/a/` |
//! | `old.301` | nothing; contents are the target | `/old` redirects |
//! | `robots.txt` (direct extensions) | hard link | `/robots.txt` |
//! | anything else | hard link | only as a resource, if referenced |
//!
//! Every output goes through the build engine, so an unchanged source costs a
//! hard link. A `404.html` is generated unless the site provides one.
//!
//! After classification the resource rewriter is constructed over the
//! rewritable outputs, every resource the pages need gets a route under the
//! fake resource route, links are checked, and headers are attached.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::buildsystem::{BuildError, BuildRun};
use crate::config::{ConfigError, FilesConfig, SiteConfig};
use crate::links::{BrokenLink, LinkError, LinkGraph};
use crate::pathset::{self, PathSetError};
use crate::render::{self, HttpError};
use crate::rewrite::{ResourceRewriter, RewriteError};
use crate::routes::{DuplicateRoute, RouteInfo, RouteTable};

/// Where the site sources are, relative to `building/`.
pub const SITE_SOURCE_DIR: &str = "src/site";
/// Where the assembled site goes, relative to `building/`.
pub const SITE_DIR: &str = "site";
pub const NOT_FOUND_FILE: &str = "404.html";

static PAGE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(.+)\.(html|md)$").expect("page pattern is a valid regex"));

static REDIRECT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.+)\.(3[0-9][0-9])$").expect("redirect pattern is a valid regex"));

#[derive(Error, Debug)]
pub enum SiteError {
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Rewrite(#[from] RewriteError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("{0}")]
    PathSet(#[from] PathSetError),
    #[error(transparent)]
    Links(#[from] LinkError),
    #[error("{} broken link(s):\n{}", .0.len(), list_broken(.0))]
    BrokenLinks(Vec<BrokenLink>),
    #[error(transparent)]
    DuplicateRoute(#[from] DuplicateRoute),
    #[error("{0} is produced by more than one source file")]
    DuplicateFile(String),
    #[error("No site directory at {}", .0.display())]
    MissingSiteDir(PathBuf),
}

fn list_broken(broken: &[BrokenLink]) -> String {
    broken.iter().map(|b| format!("  {b}")).collect::<Vec<_>>().join("\n")
}

/// What a site source file becomes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    /// An HTML page at `<extless>.html`.
    Page { extless: String, markdown: bool },
    Redirect { extless: String, status: u16 },
    /// Copied, with a route of its own.
    Direct,
    /// Copied, routed only when referenced.
    Resource,
}

pub fn classify(source: &str, files: &FilesConfig) -> SourceKind {
    if let Some(caps) = PAGE.captures(source) {
        return SourceKind::Page {
            extless: caps[1].to_string(),
            markdown: &caps[2] == "md",
        };
    }
    if let Some(caps) = REDIRECT.captures(source)
        && let Ok(status) = caps[2].parse()
    {
        return SourceKind::Redirect {
            extless: caps[1].to_string(),
            status,
        };
    }
    if files.is_direct(source) {
        SourceKind::Direct
    } else {
        SourceKind::Resource
    }
}

/// Route of the page at `<extless>.html`: `blog/index` is `/blog/`.
pub fn page_route(config: &SiteConfig, extless: &str) -> String {
    let route = config.route_for(&format!("/{extless}"));
    match route.strip_suffix("/index") {
        Some(dir) => format!("{dir}/"),
        None => route,
    }
}

/// An assembled site.
#[derive(Debug)]
pub struct Site<'run> {
    pub config: SiteConfig,
    pub routes: RouteTable,
    pub rewriter: ResourceRewriter<'run>,
    /// Routes of pages, redirects and direct files, before trailing-slash
    /// duals were added.
    pub page_routes: BTreeSet<String>,
    pub resource_routes: BTreeSet<String>,
    pub indexable: BTreeSet<String>,
}

impl Site<'_> {
    /// Site-relative file behind a resource route.
    pub fn resource_file<'r>(&self, route: &'r str) -> Option<&'r str> {
        route.strip_prefix(&self.config.fake_resource_route)
    }
}

/// Per-file route defaults and the rewritable subset.
#[derive(Debug, Default)]
struct Files {
    info: BTreeMap<String, RouteInfo>,
    rewritable: BTreeSet<String>,
}

impl Files {
    fn add(&mut self, f: &str, config: &FilesConfig) -> Result<(), SiteError> {
        if self.info.contains_key(f) {
            return Err(SiteError::DuplicateFile(f.to_string()));
        }
        let mut info = RouteInfo::file(f);
        info.worth_gzipping = config.is_worth_gzipping(f);
        if config.is_rewritable(f) {
            self.rewritable.insert(f.to_string());
        }
        self.info.insert(f.to_string(), info);
        Ok(())
    }

    fn route_info(&self, f: &str) -> RouteInfo {
        self.info.get(f).cloned().unwrap_or_else(|| RouteInfo::file(f))
    }
}

/// Assemble the site copied into `run`, failing on any broken link.
pub fn assemble<'run>(run: &'run BuildRun, config: &SiteConfig) -> Result<Site<'run>, SiteError> {
    let source_dir = run.building_dir().join(SITE_SOURCE_DIR);
    if !source_dir.is_dir() {
        return Err(SiteError::MissingSiteDir(run.source_dir().join(SITE_DIR)));
    }
    let sources = pathset::relative_files_under(&source_dir)?;
    let favicon_ref = config
        .favicon
        .as_ref()
        .map(|icon| format!("{icon}{}", config.rewriter.marker));

    let mut files = Files::default();
    let mut routes = RouteTable::new();

    for source in &sources {
        let src = Path::new(SITE_SOURCE_DIR).join(source);
        match classify(source, &config.files) {
            SourceKind::Page { extless, markdown } => {
                let f = format!("{extless}.html");
                files.add(&f, &config.files)?;
                let route = page_route(config, &extless);
                let canonical = route.clone();
                let fallback_title = pathset::basename(&extless).to_string();
                let icon = favicon_ref.as_deref();
                run.memoize(&[src], &[Path::new(SITE_DIR).join(&f)], |sources, dests| {
                    let page = if markdown {
                        let text = fs::read_to_string(&sources[0])?;
                        render::markdown_page(&text, &fallback_title).into_string().into_bytes()
                    } else {
                        fs::read(&sources[0])?
                    };
                    fs::write(&dests[0], render::autohead(&page, &canonical, icon))?;
                    Ok::<_, SiteError>(())
                })?;
                routes.add(route, files.route_info(&f))?;
            }
            SourceKind::Redirect { extless, status } => {
                let target = fs::read_to_string(run.building_dir().join(&src))?;
                routes.add_redirect(status, config.route_for(&format!("/{extless}")), target.trim())?;
            }
            kind @ (SourceKind::Direct | SourceKind::Resource) => {
                files.add(source, &config.files)?;
                link_into_site(run, &src, source)?;
                if kind == SourceKind::Direct {
                    routes.add(config.route_for(&format!("/{source}")), files.route_info(source))?;
                }
            }
        }
    }

    if !files.info.contains_key(NOT_FOUND_FILE) {
        run.memoize(&[], &[Path::new(SITE_DIR).join(NOT_FOUND_FILE)], |_, dests| {
            let error = HttpError::from_code(404).map(render::error_document);
            fs::write(&dests[0], error.map(|doc| doc.into_string()).unwrap_or_default())?;
            Ok::<_, SiteError>(())
        })?;
        files.add(NOT_FOUND_FILE, &config.files)?;
    }
    if let Some(info) = files.info.get_mut(NOT_FOUND_FILE) {
        info.status = 404;
    }

    let rewriter = ResourceRewriter::new(run, config.rewriter_options(SITE_DIR), &files.rewritable)?;

    let page_routes: BTreeSet<String> = routes.routes().cloned().collect();
    let required: Vec<String> = page_routes
        .iter()
        .filter_map(|route| routes.get(route).and_then(|info| info.file.clone()))
        .chain([NOT_FOUND_FILE.to_string()])
        .collect();
    for f in rewriter.all_needed_resources(&required, false)? {
        if rewriter.site_path(&f).is_file() {
            routes.add(format!("{}{f}", config.fake_resource_route), files.route_info(&f))?;
        }
    }
    let resource_routes: BTreeSet<String> = routes.routes().filter(|r| !page_routes.contains(*r)).cloned().collect();

    let graph = LinkGraph::scan(&routes, &rewriter, config)?;
    if !graph.broken().is_empty() {
        for broken in graph.broken() {
            warn!(route = %broken.route, reference = %broken.reference, "Broken link");
        }
        return Err(SiteError::BrokenLinks(graph.broken().to_vec()));
    }

    let index_from = robots_routes(config, &config.robots.index_from, &routes, "index_from")?;
    let dont_index_from: BTreeSet<String> =
        robots_routes(config, &config.robots.dont_index_from, &routes, "dont_index_from")?
            .into_iter()
            .collect();
    let indexable = graph.indexable(&index_from, &dont_index_from);

    routes.add_trailing_slash_duals(&page_routes);
    routes.apply_headers(config, &indexable);
    routes.set_not_found(files.route_info(NOT_FOUND_FILE));

    info!(
        pages = page_routes.len(),
        resources = resource_routes.len(),
        indexable = indexable.len(),
        "Assembled site"
    );
    Ok(Site {
        config: config.clone(),
        routes,
        rewriter,
        page_routes,
        resource_routes,
        indexable,
    })
}

fn link_into_site(run: &BuildRun, src: &Path, f: &str) -> Result<(), SiteError> {
    run.memoize(&[src.to_path_buf()], &[Path::new(SITE_DIR).join(f)], |sources, dests| {
        fs::hard_link(&sources[0], &dests[0])?;
        Ok::<_, SiteError>(())
    })?;
    Ok(())
}

/// Absolute routes for configured robots paths, all of which must exist.
fn robots_routes(config: &SiteConfig, paths: &[String], routes: &RouteTable, key: &str) -> Result<Vec<String>, SiteError> {
    paths
        .iter()
        .map(|path| {
            let route = config.route_for(path);
            if routes.contains(&route) {
                Ok(route)
            } else {
                debug!(route = %route, "Unknown robots route");
                Err(SiteError::Config(ConfigError::Validation(format!(
                    "robots.{key} names unknown route {path:?}"
                ))))
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{read_string, setup_fixtures, site_options};
    use tempfile::TempDir;

    fn route(path: &str) -> String {
        format!("http://www.example.com{path}")
    }

    fn assembled<T>(files: &[(&str, &str)], config: &SiteConfig, check: impl FnOnce(&BuildRun, Result<Site, SiteError>) -> T) -> T {
        let tmp = TempDir::new().unwrap();
        let (options, _) = site_options(&tmp, files);
        let run = BuildRun::start(&options).unwrap();
        let site = assemble(&run, config);
        check(&run, site)
    }

    // =========================================================================
    // Classification
    // =========================================================================

    #[test]
    fn classify_by_extension() {
        let files = FilesConfig::default();
        assert_eq!(
            classify("blog/index.md", &files),
            SourceKind::Page { extless: "blog/index".into(), markdown: true }
        );
        assert_eq!(
            classify("about.html", &files),
            SourceKind::Page { extless: "about".into(), markdown: false }
        );
        assert_eq!(
            classify("old.301", &files),
            SourceKind::Redirect { extless: "old".into(), status: 301 }
        );
        assert_eq!(classify("robots.txt", &files), SourceKind::Direct);
        assert_eq!(classify("style.css", &files), SourceKind::Resource);
        assert_eq!(classify("notes.400", &files), SourceKind::Resource);
        // A bare extension is not a page
        assert_eq!(classify(".html", &files), SourceKind::Resource);
    }

    #[test]
    fn page_routes_for_index_files() {
        let config = SiteConfig::default();
        assert_eq!(page_route(&config, "index"), route("/"));
        assert_eq!(page_route(&config, "blog/index"), route("/blog/"));
        assert_eq!(page_route(&config, "about"), route("/about"));
        assert_eq!(page_route(&config, "reindex"), route("/reindex"));
    }

    // =========================================================================
    // Assembly
    // =========================================================================

    #[test]
    fn pages_get_routes_and_autohead() {
        let files = [
            ("site/index.html", "<head>\n  <!--AUTOHEAD-->\n</head><a href=\"/about\">a</a>"),
            ("site/about.md", "# About\n\nHello."),
        ];
        assembled(&files, &SiteConfig::default(), |run, site| {
            let site = site.unwrap();
            assert_eq!(site.routes.get(&route("/")).unwrap().file.as_deref(), Some("index.html"));
            assert_eq!(site.routes.get(&route("/about")).unwrap().file.as_deref(), Some("about.html"));

            let index = read_string(&run.building_dir().join("site/index.html"));
            assert!(index.contains("  <link rel=\"canonical\" href=\"http://www.example.com/\">"));
            let about = read_string(&run.building_dir().join("site/about.html"));
            assert!(about.contains("<title>About</title>"));
            assert!(about.contains("href=\"http://www.example.com/about\""));
        });
    }

    #[test]
    fn resources_are_routed_only_when_referenced() {
        let files = [
            ("site/index.html", "<link rel=stylesheet href=\"style.css?rr\">"),
            ("site/style.css", "body { background: url(\"bg.png?rr\") }"),
            ("site/bg.png", "png"),
            ("site/unused.png", "png"),
            ("site/robots.txt", "User-agent: *"),
        ];
        assembled(&files, &SiteConfig::default(), |run, site| {
            let site = site.unwrap();
            let resources: Vec<&str> = site.resource_routes.iter().filter_map(|r| site.resource_file(r)).collect();
            assert_eq!(resources, vec!["bg.png", "style.css"]);
            assert!(site.page_routes.contains(&route("/robots.txt")));
            // Unreferenced files are still copied
            assert!(run.building_dir().join("site/unused.png").exists());
        });
    }

    #[test]
    fn redirects_and_duals() {
        let files = [("site/index.html", "home"), ("site/old.301", "/new\n"), ("site/new.html", "new")];
        assembled(&files, &SiteConfig::default(), |_, site| {
            let site = site.unwrap();
            let old = site.routes.get(&route("/old")).unwrap();
            assert_eq!(old.status, 301);
            assert_eq!(old.redirect_to.as_deref(), Some("/new"));
            assert!(old.file.is_none());

            let old_dual = site.routes.get(&route("/old/")).unwrap();
            assert_eq!(old_dual.redirect_to.as_deref(), Some("/new"));
            let new_dual = site.routes.get(&route("/new/")).unwrap();
            assert_eq!(new_dual.redirect_to.as_deref(), Some("/new"));
        });
    }

    #[test]
    fn generates_not_found_page() {
        assembled(&[("site/index.html", "home")], &SiteConfig::default(), |run, site| {
            let site = site.unwrap();
            let not_found = site.routes.not_found().unwrap();
            assert_eq!(not_found.status, 404);
            assert_eq!(not_found.file.as_deref(), Some(NOT_FOUND_FILE));
            let doc = read_string(&run.building_dir().join("site/404.html"));
            assert!(doc.contains("404 Not Found"));
        });
    }

    #[test]
    fn site_provided_not_found_page_wins() {
        let files = [("site/index.html", "home"), ("site/404.html", "custom")];
        assembled(&files, &SiteConfig::default(), |run, site| {
            assert_eq!(site.unwrap().routes.not_found().unwrap().status, 404);
            assert_eq!(read_string(&run.building_dir().join("site/404.html")), "custom");
        });
    }

    #[test]
    fn broken_links_abort_assembly() {
        let files = [("site/index.html", "<a href=\"/missing\">x</a> <img src=\"gone.png?rr\">")];
        assembled(&files, &SiteConfig::default(), |_, site| match site {
            Err(SiteError::BrokenLinks(broken)) => {
                assert_eq!(broken.len(), 2);
                assert!(broken.iter().all(|b| b.route == route("/")));
            }
            other => panic!("expected broken links, got {other:?}"),
        });
    }

    #[test]
    fn duplicate_page_sources_are_rejected() {
        let files = [("site/a.html", "html"), ("site/a.md", "# md")];
        assembled(&files, &SiteConfig::default(), |_, site| {
            assert!(matches!(site, Err(SiteError::DuplicateFile(f)) if f == "a.html"));
        });
    }

    #[test]
    fn missing_site_directory() {
        assembled(&[("other/x.txt", "x")], &SiteConfig::default(), |_, site| {
            assert!(matches!(site, Err(SiteError::MissingSiteDir(_))));
        });
    }

    #[test]
    fn favicon_is_linked_as_resource() {
        let mut config = SiteConfig::default();
        config.favicon = Some("/favicon.ico".into());
        let files = [("site/index.html", "<!--AUTOHEAD-->"), ("site/favicon.ico", "ico")];
        assembled(&files, &config, |_, site| {
            let site = site.unwrap();
            assert!(site.routes.contains("http://fake-rr.invalid/favicon.ico"));
            assert!(site.routes.contains(&route("/favicon.ico")));
        });
    }

    // =========================================================================
    // Robots and headers
    // =========================================================================

    #[test]
    fn robots_follow_links() {
        let mut config = SiteConfig::default();
        config.robots.dont_index_from = vec!["/drafts".into()];
        let files = [
            ("site/index.html", "<a href=\"/drafts\">d</a> <a href=\"/about\">a</a>"),
            ("site/about.html", "about"),
            ("site/drafts.html", "<a href=\"/secret\">s</a>"),
            ("site/secret.html", "secret"),
            ("site/orphan.html", "nobody links here"),
        ];
        assembled(&files, &config, |_, site| {
            let site = site.unwrap();
            let robots = |path: &str| site.routes.get(&route(path)).unwrap().header("X-Robots-Tag").unwrap().to_string();
            assert_eq!(robots("/"), "noarchive");
            assert_eq!(robots("/about"), "noarchive");
            assert_eq!(robots("/drafts"), "noarchive, noindex");
            assert_eq!(robots("/secret"), "noarchive, noindex");
            assert_eq!(robots("/orphan"), "noarchive, noindex");
        });
    }

    #[test]
    fn unknown_robots_route_is_config_error() {
        let mut config = SiteConfig::default();
        config.robots.dont_index_from = vec!["/typo".into()];
        assembled(&[("site/index.html", "home")], &config, |_, site| {
            assert!(matches!(site, Err(SiteError::Config(ConfigError::Validation(_)))));
        });
    }

    // =========================================================================
    // Fixture site
    // =========================================================================

    #[test]
    fn assembles_fixture_site() {
        let (_tmp, options) = setup_fixtures();
        let config = crate::config::load_config(&options.source_dir).unwrap();
        let run = BuildRun::start(&options).unwrap();
        let site = assemble(&run, &config).unwrap();

        let pages: Vec<&str> = site.page_routes.iter().map(|r| crate::routes::domainless(r)).collect();
        assert_eq!(pages, vec!["/", "/about", "/drafts", "/old", "/robots.txt", "/unfinished"]);
        let resources: Vec<&str> = site.resource_routes.iter().filter_map(|r| site.resource_file(r)).collect();
        assert_eq!(resources, vec!["css/site.css", "img/bg.png", "img/icon.png", "img/logo.svg", "js/app.js"]);
        assert!(!site.indexable.contains("https://www.example.org/unfinished"));
    }
}
