//! Resource rewriting: content-hashed, cache-busting URLs for `?rr` references.
//!
//! A rewritable file (HTML, CSS, JS, ...) marks the URLs it wants rewritten
//! with a suffix marker, e.g. `<img src="img/logo.png?rr">`. Construction of a
//! [`ResourceRewriter`] walks those references and records, per site path:
//!
//! | Record | Contents |
//! |---|---|
//! | `direct-deps/<p>.deps` | paths referenced by `p` (children for a directory) |
//! | `transitive-deps/<p>.deps` | closure of the above |
//! | `hash/<p>.hash` | SHA-384 of `p` (listing hash for a directory) |
//! | `hash-incl-deps/<p>.hash` | SHA-384 over seed, rewriter logic, and the hashes of `p` and its closure |
//! | `rewritten-resource-name/<p>.name` | `p` with a token from the above spliced into its name |
//!
//! All records live under the cache directory inside `building/` and go
//! through the build engine, so an unchanged site recomputes nothing.
//!
//! ## Names
//!
//! `css/site.css` becomes `css/site.<token>.css`, where the token is the first
//! characters of the URL-safe base64 hash-including-deps. When a directory is
//! referenced (`img/?rr`), everything under it is named relative to the
//! directory's own token (`img.<token>/logo.png`) so relative URLs between the
//! directory's files keep working.
//!
//! ## Missing references
//!
//! A reference to a path that does not exist gets an empty dependency record
//! and the sentinel hash, both written as volatile records. Its referrers are
//! therefore recomputed on every run until the reference is fixed; site
//! assembly reports it as a broken link.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;
use tracing::debug;

use crate::buildsystem::{BuildError, BuildRun};
use crate::closure;
use crate::hash;
use crate::pathset::{self, PathSetError};
use crate::urlsyntax::{self, RefScanner};

/// The rewriter's own source. Part of every hash-including-deps, so a change
/// to how names are computed yields new names.
const REWRITER_SOURCE: &str = include_str!("rewrite.rs");

const DIRECT_DEPS: Record = Record("direct-deps", ".deps");
const TRANSITIVE_DEPS: Record = Record("transitive-deps", ".deps");
const HASH: Record = Record("hash", ".hash");
const HASH_INCL_DEPS: Record = Record("hash-incl-deps", ".hash");
const REWRITTEN_NAME: Record = Record("rewritten-resource-name", ".name");

/// A cache record kind: its subdirectory and file suffix.
#[derive(Debug, Clone, Copy)]
struct Record(&'static str, &'static str);

static NAME_PARTS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^((?:.*/)?\.?[^/.]+)((?:\.[^/]*)?)$").expect("name pattern is a valid regex")
});

#[derive(Error, Debug)]
pub enum RewriteError {
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("{0}")]
    PathSet(#[from] PathSetError),
    #[error("{file}: origin {origin:?} in {reference:?} is not one of the origins known to serve this site's resources")]
    UnknownOrigin {
        file: String,
        origin: String,
        reference: String,
    },
    #[error("{file}: resource reference is not valid UTF-8: {reference:?}")]
    InvalidReference { file: String, reference: String },
    #[error("{file}: resource reference {reference:?} points outside the site")]
    OutsideSite { file: String, reference: String },
    #[error("Malformed cache record: {}", .0.display())]
    MalformedRecord(PathBuf),
}

/// Copies a resource into the rewritten mirror.
pub type CopyFn = fn(&Path, &Path) -> io::Result<()>;

pub fn hard_link(src: &Path, dest: &Path) -> io::Result<()> {
    fs::hard_link(src, dest)
}

pub fn copy_file(src: &Path, dest: &Path) -> io::Result<()> {
    fs::copy(src, dest).map(|_| ())
}

#[derive(Debug, Clone)]
pub struct RewriterOptions {
    /// Site root, relative to `building/`.
    pub site_prefix: PathBuf,
    /// Where records are kept, relative to `building/`.
    pub cache_dir: PathBuf,
    pub marker: String,
    /// Prepended to every hash-including-deps. A secret here keeps names of
    /// unpublished files unguessable.
    pub hash_seed: Vec<u8>,
    /// Hosts whose absolute references are treated as references into the
    /// site, e.g. `www.example.com` for an `og:image` that must be absolute.
    pub origins: BTreeSet<String>,
    pub token_len: usize,
}

impl Default for RewriterOptions {
    fn default() -> Self {
        Self {
            site_prefix: PathBuf::from("site"),
            cache_dir: PathBuf::from("rr"),
            marker: "?rr".to_string(),
            hash_seed: Vec::new(),
            origins: BTreeSet::new(),
            token_len: 15,
        }
    }
}

/// A marker reference resolved to a site path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRef {
    /// Scheme and host the reference was written with, or empty.
    pub origin: String,
    /// Normalized site-relative path; `.` is the site root.
    pub path: String,
    /// Whether the reference was written as a directory (`dir/?rr`).
    pub trailing_slash: bool,
}

/// Dependency and naming information for every referenced resource.
#[derive(Debug)]
pub struct ResourceRewriter<'run> {
    run: &'run BuildRun,
    options: RewriterOptions,
    scanner: RefScanner,
    rewritable: BTreeSet<String>,
    referenced: BTreeSet<String>,
}

impl<'run> ResourceRewriter<'run> {
    /// Scan `rewritable_files` (site-relative) and bring every record up to
    /// date.
    pub fn new<I, S>(run: &'run BuildRun, options: RewriterOptions, rewritable_files: I) -> Result<Self, RewriteError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let scanner = RefScanner::new(&options.marker);
        let rewritable = rewritable_files
            .into_iter()
            .map(|f| pathset::normalize(f.as_ref()))
            .collect();
        let mut rewriter = Self {
            run,
            options,
            scanner,
            rewritable,
            referenced: BTreeSet::new(),
        };
        rewriter.record_all()?;
        Ok(rewriter)
    }

    fn record_all(&mut self) -> Result<(), RewriteError> {
        let mut referenced = BTreeSet::new();
        for f in &self.rewritable {
            self.record_file_deps(f)?;
            referenced.extend(self.direct_deps(f)?);
        }
        let seeds: Vec<String> = referenced.iter().cloned().collect();
        let nested = closure::try_transitive_from_many(|f: &String| self.record_dir_deps(f), seeds, false)?;
        referenced.extend(nested);

        for f in &referenced {
            if !self.rewritable.contains(f) {
                self.record_leaf_deps(f)?;
            }
        }
        self.referenced = referenced;

        let all: BTreeSet<String> = self.referenced.union(&self.rewritable).cloned().collect();
        let logic_hash = hash::hash_parts(&[REWRITER_SOURCE]);
        for f in &all {
            self.record_hash(f)?;
        }
        for f in &all {
            let deps = self.record_transitive_deps(f)?;
            self.record_hash_including_deps(f, &deps, &logic_hash)?;
        }
        for f in &all {
            self.record_rewritten_name(f, &all)?;
        }
        debug!(
            rewritable = self.rewritable.len(),
            referenced = self.referenced.len(),
            "Resource records up to date"
        );
        Ok(())
    }

    // ========================================================================
    // Paths
    // ========================================================================

    fn record_path(&self, record: Record, f: &str) -> PathBuf {
        let Record(dir, suffix) = record;
        self.options.cache_dir.join(dir).join(format!("{f}{suffix}"))
    }

    /// `f` relative to `building/`.
    fn site_source(&self, f: &str) -> PathBuf {
        self.options.site_prefix.join(f)
    }

    /// Absolute path of site file `f`.
    pub fn site_path(&self, f: &str) -> PathBuf {
        self.run.building_dir().join(self.site_source(f))
    }

    fn read_record(&self, record: Record, f: &str) -> Result<Vec<u8>, RewriteError> {
        Ok(fs::read(self.run.building_dir().join(self.record_path(record, f)))?)
    }

    fn read_path_set(&self, record: Record, f: &str) -> Result<Vec<String>, RewriteError> {
        Ok(pathset::read(&self.run.building_dir().join(self.record_path(record, f)))?)
    }

    /// Resolve one reference found in `file`.
    pub fn resolve_reference(&self, file: &str, reference: &[u8]) -> Result<ResolvedRef, RewriteError> {
        let text = std::str::from_utf8(reference).map_err(|_| RewriteError::InvalidReference {
            file: file.to_string(),
            reference: String::from_utf8_lossy(reference).into_owned(),
        })?;

        let (origin, rel) = match urlsyntax::split_origin(text) {
            Some(split) => {
                if !self.options.origins.contains(split.host) {
                    return Err(RewriteError::UnknownOrigin {
                        file: file.to_string(),
                        origin: split.host.to_string(),
                        reference: text.to_string(),
                    });
                }
                (split.origin, split.path)
            }
            None => ("", text),
        };

        let path = match rel.strip_prefix('/') {
            Some(from_root) => pathset::normalize(from_root),
            None => pathset::normalize(&pathset::join(pathset::dirname(file), rel)),
        };
        if path == ".." || path.starts_with("../") {
            return Err(RewriteError::OutsideSite {
                file: file.to_string(),
                reference: text.to_string(),
            });
        }
        Ok(ResolvedRef {
            origin: origin.to_string(),
            path,
            trailing_slash: rel.is_empty() || rel.ends_with('/'),
        })
    }

    // ========================================================================
    // Records
    // ========================================================================

    fn record_file_deps(&self, f: &str) -> Result<(), RewriteError> {
        let dest = self.record_path(DIRECT_DEPS, f);
        self.run.memoize(&[self.site_source(f)], &[dest], |sources, dests| {
            let contents = fs::read(&sources[0])?;
            let deps = self
                .scanner
                .find_refs(&contents)
                .iter()
                .map(|found| self.resolve_reference(f, found.reference).map(|r| r.path))
                .collect::<Result<Vec<_>, _>>()?;
            fs::write(&dests[0], pathset::serialize(&deps)?)?;
            Ok::<_, RewriteError>(())
        })?;
        Ok(())
    }

    /// Children of a referenced directory; nothing for anything else.
    fn record_dir_deps(&self, f: &str) -> Result<Vec<String>, RewriteError> {
        let dir = self.site_path(f);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut children = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_str().ok_or_else(|| PathSetError::NotUtf8(entry.path()))?;
            children.push(if f == "." {
                name.to_string()
            } else {
                format!("{f}/{name}")
            });
        }
        self.run
            .write_if_changed(&self.record_path(DIRECT_DEPS, f), pathset::serialize(&children)?)?;
        self.direct_deps(f)
    }

    /// Non-rewritable resources reference nothing.
    fn record_leaf_deps(&self, f: &str) -> Result<(), RewriteError> {
        let path = self.site_path(f);
        let dest = self.record_path(DIRECT_DEPS, f);
        if path.is_dir() {
            // written by record_dir_deps
        } else if path.exists() {
            self.run.memoize(&[self.site_source(f)], &[dest], |_, dests| {
                fs::write(&dests[0], "")?;
                Ok::<_, RewriteError>(())
            })?;
        } else {
            self.run.write_volatile(&dest, "")?;
        }
        Ok(())
    }

    fn record_hash(&self, f: &str) -> Result<(), RewriteError> {
        let path = self.site_path(f);
        let dest = self.record_path(HASH, f);
        if path.is_dir() {
            self.run.write_if_changed(&dest, hash::hash_path(&path)?)?;
        } else if path.exists() {
            self.run.memoize(&[self.site_source(f)], &[dest], |sources, dests| {
                fs::write(&dests[0], hash::hash_path(&sources[0])?)?;
                Ok::<_, RewriteError>(())
            })?;
        } else {
            self.run.write_volatile(&dest, hash::MISSING_PATH_HASH)?;
        }
        Ok(())
    }

    /// Written by content: a directory listing keeps its old mtime when
    /// unchanged, so the closure cannot be keyed on record mtimes.
    fn record_transitive_deps(&self, f: &str) -> Result<Vec<String>, RewriteError> {
        let deps = closure::try_transitive(|g: &String| self.direct_deps(g), f.to_string(), false)?;
        self.run
            .write_if_changed(&self.record_path(TRANSITIVE_DEPS, f), pathset::serialize(&deps)?)?;
        Ok(deps)
    }

    fn record_hash_including_deps(&self, f: &str, deps: &[String], logic_hash: &[u8]) -> Result<(), RewriteError> {
        let mut inclusive: BTreeSet<&str> = deps.iter().map(String::as_str).collect();
        inclusive.insert(f);
        let mut parts = vec![self.options.hash_seed.clone(), logic_hash.to_vec()];
        for g in inclusive {
            parts.push(self.read_record(HASH, g)?);
        }
        self.run
            .write_if_changed(&self.record_path(HASH_INCL_DEPS, f), hash::hash_parts(&parts))?;
        Ok(())
    }

    fn record_rewritten_name(&self, f: &str, all: &BTreeSet<String>) -> Result<(), RewriteError> {
        let (base, rest) = naming_base(f, all);
        let digest = self.read_record(HASH_INCL_DEPS, &base)?;
        let mut name = cache_busting_name(&base, &digest, self.options.token_len);
        if let Some(rest) = rest {
            name = format!("{name}/{rest}");
        }
        self.run.write_if_changed(&self.record_path(REWRITTEN_NAME, f), name)?;
        Ok(())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn direct_deps(&self, f: &str) -> Result<Vec<String>, RewriteError> {
        self.read_path_set(DIRECT_DEPS, f)
    }

    pub fn transitive_deps(&self, f: &str) -> Result<Vec<String>, RewriteError> {
        self.read_path_set(TRANSITIVE_DEPS, f)
    }

    /// Sorted, with `f` itself included.
    pub fn transitive_deps_including_self(&self, f: &str) -> Result<Vec<String>, RewriteError> {
        let mut deps: BTreeSet<String> = self.transitive_deps(f)?.into_iter().collect();
        deps.insert(f.to_string());
        Ok(deps.into_iter().collect())
    }

    pub fn hash(&self, f: &str) -> Result<Vec<u8>, RewriteError> {
        self.read_record(HASH, f)
    }

    pub fn hash_including_deps(&self, f: &str) -> Result<Vec<u8>, RewriteError> {
        self.read_record(HASH_INCL_DEPS, f)
    }

    pub fn rewritten_name(&self, f: &str) -> Result<String, RewriteError> {
        let bytes = self.read_record(REWRITTEN_NAME, f)?;
        String::from_utf8(bytes)
            .map_err(|_| RewriteError::MalformedRecord(self.record_path(REWRITTEN_NAME, f)))
    }

    pub fn rewritable_files(&self) -> &BTreeSet<String> {
        &self.rewritable
    }

    pub fn referenced_resources(&self) -> &BTreeSet<String> {
        &self.referenced
    }

    pub fn options(&self) -> &RewriterOptions {
        &self.options
    }

    pub fn is_dir(&self, f: &str) -> bool {
        self.site_path(f).is_dir()
    }

    /// Rewritable files and directories reachable from the rewritable files in
    /// `required`, including those files themselves.
    pub fn all_files_and_dirs_that_can_have_deps<I, S>(&self, required: I) -> Result<BTreeSet<String>, RewriteError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut found = BTreeSet::new();
        for f in required {
            let f = f.as_ref();
            if !self.rewritable.contains(f) {
                continue;
            }
            for g in self.transitive_deps_including_self(f)? {
                if self.rewritable.contains(&g) || self.is_dir(&g) {
                    found.insert(g);
                }
            }
        }
        Ok(found)
    }

    /// Everything the rewritable files in `required` transitively reference.
    pub fn all_needed_resources<I, S>(&self, required: I, count_directories: bool) -> Result<BTreeSet<String>, RewriteError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut needed = BTreeSet::new();
        for f in required {
            let f = f.as_ref();
            if !self.rewritable.contains(f) {
                continue;
            }
            for g in self.transitive_deps(f)? {
                if count_directories || !self.is_dir(&g) {
                    needed.insert(g);
                }
            }
        }
        Ok(needed)
    }

    // ========================================================================
    // Rewriting
    // ========================================================================

    /// Mirror the site into `dest_dir` (relative to `building/`) with every
    /// reference in the rewritable files replaced by
    /// `origin + url_builder(rewritten_name, original_path)`.
    ///
    /// `copy_nonrewritable` places referenced non-rewritable files;
    /// `copy_remaining` places every other file under the site root. Each file
    /// is handled once. Returns the site paths placed in the mirror.
    pub fn rewrite<U>(
        &self,
        dest_dir: &Path,
        url_builder: U,
        copy_nonrewritable: Option<CopyFn>,
        copy_remaining: Option<CopyFn>,
    ) -> Result<BTreeSet<String>, RewriteError>
    where
        U: Fn(&str, &str) -> String,
    {
        let mut processed = BTreeSet::new();

        for f in &self.rewritable {
            let mut sources = vec![self.site_source(f)];
            for g in self.transitive_deps(f)? {
                sources.push(self.record_path(REWRITTEN_NAME, &g));
            }
            self.run.memoize(&sources, &[dest_dir.join(f)], |sources, dests| {
                let contents = fs::read(&sources[0])?;
                let rewritten = self.substitute(f, &contents, &url_builder)?;
                fs::write(&dests[0], rewritten)?;
                Ok::<_, RewriteError>(())
            })?;
            processed.insert(f.clone());
        }

        if let Some(copy) = copy_nonrewritable {
            for f in &self.referenced {
                if processed.contains(f) || self.is_dir(f) {
                    continue;
                }
                if self.site_path(f).exists() {
                    self.copy_into(f, dest_dir, copy)?;
                    processed.insert(f.clone());
                }
            }
        }

        if let Some(copy) = copy_remaining {
            let site_dir = self.run.building_dir().join(&self.options.site_prefix);
            for f in pathset::relative_files_under(&site_dir)? {
                if processed.contains(&f) {
                    continue;
                }
                self.copy_into(&f, dest_dir, copy)?;
                processed.insert(f);
            }
        }
        Ok(processed)
    }

    fn copy_into(&self, f: &str, dest_dir: &Path, copy: CopyFn) -> Result<(), RewriteError> {
        self.run
            .memoize(&[self.site_source(f)], &[dest_dir.join(f)], |sources, dests| {
                copy(&sources[0], &dests[0])?;
                Ok::<_, RewriteError>(())
            })?;
        Ok(())
    }

    fn substitute<U>(&self, file: &str, contents: &[u8], url_builder: &U) -> Result<Vec<u8>, RewriteError>
    where
        U: Fn(&str, &str) -> String,
    {
        self.scanner.replace_refs(contents, |reference| {
            let resolved = self.resolve_reference(file, reference)?;
            let name = self.rewritten_name(&resolved.path)?;
            let mut url = url_builder(&name, &resolved.path);
            if resolved.trailing_slash && !url.ends_with('/') {
                url.push('/');
            }
            Ok(format!("{}{}", resolved.origin, url).into_bytes())
        })
    }
}

/// The outermost self-or-ancestor of `f` that is itself referenced, and the
/// remainder of `f` below it.
fn naming_base(f: &str, referenced: &BTreeSet<String>) -> (String, Option<String>) {
    let mut base = f.to_string();
    let mut rest: Option<String> = None;
    loop {
        let parent = pathset::dirname(&base);
        if parent.is_empty() || parent == base || !referenced.contains(parent) {
            break;
        }
        let name = pathset::basename(&base).to_string();
        rest = Some(match rest {
            Some(rest) => format!("{name}/{rest}"),
            None => name,
        });
        base = parent.to_string();
    }
    (base, rest)
}

/// Splice a token derived from `digest` between a path's stem and its
/// extensions: `css/site.css` becomes `css/site.<token>.css`.
pub fn cache_busting_name(path: &str, digest: &[u8], token_len: usize) -> String {
    let token = hash::url_token(digest, token_len);
    match NAME_PARTS.captures(path) {
        Some(caps) => format!("{}.{}{}", &caps[1], token, &caps[2]),
        None => path.to_string(),
    }
}
