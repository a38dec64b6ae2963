//! Incremental build engine: memoized units of work over generation
//! directories.
//!
//! A build run owns a *builds directory* holding up to three generations:
//!
//! ```text
//! +site-builds/
//! ├── build/          # Last successful build (authoritative)
//! ├── building/       # The run in progress
//! └── building-old/   # An abandoned run, merged with whatever it replaced
//! ```
//!
//! ## Consistent mtimes
//!
//! Every unit of work declares its sources and destinations. Its *latest* time
//! is the newest mtime among its sources and the build-script sources (the
//! configuration and the builder binary itself). Every destination a unit
//! produces is stamped with exactly that time, and so is every directory the
//! unit had to create. A destination's parent directory ends up with
//! `max(previous mtime, latest)`. The upshot is that an unchanged input
//! produces an output whose mtime is identical across runs, which keeps
//! `rsync`-style deploys cheap.
//!
//! ## Reuse
//!
//! When a destination is missing from `building/`, the previous generations
//! are consulted in order (`build/`, then `building-old/`). A generation whose
//! copy of *every* destination has an mtime exactly equal to the unit's latest
//! time is hard-linked in instead of re-running the unit. Equality rather than
//! `>=` means reverting a source to an older version, or hand-editing a build
//! product, still triggers a rebuild.
//!
//! ## Promotion
//!
//! [`BuildRun::finish`] swaps `building/` into `build/` with renames, so a
//! complete generation is always present under one of the names. A run that
//! fails (or is dropped) leaves `building/` behind; the next run merges it into
//! `building-old/` and reuses whatever is still valid.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File, FileTimes};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;
use std::time::SystemTime;

use regex::Regex;
use thiserror::Error;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::pathset::{self, PathSetError};

pub const BUILD_DIR: &str = "build";
pub const BUILDING_DIR: &str = "building";
pub const BUILDING_OLD_DIR: &str = "building-old";
/// Where the copied-in source tree lives inside `building/`.
pub const SRC_DIR: &str = "src";

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Directory walk error: {0}")]
    WalkDir(#[from] walkdir::Error),
    #[error("{0}")]
    PathSet(#[from] PathSetError),
    #[error("Cannot build from {}: the builds directory would have to live inside it", .0.display())]
    InvalidRoot(PathBuf),
    #[error("Builds directory {} is inside the source directory {}", .builds.display(), .source_dir.display())]
    BuildsInsideSource { builds: PathBuf, source_dir: PathBuf },
    #[error("Source not found: {}", .0.display())]
    MissingSource(PathBuf),
    #[error("Destination must be a relative path inside the building directory: {}", .0.display())]
    DestinationOutsideBuild(PathBuf),
    #[error("Build step did not create its destination: {}", .0.display())]
    NotProduced(PathBuf),
}

static DEFAULT_EXCLUDE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"~$|\.(swp|new|kate-swp)$|(^|/)(\.git|__pycache__|_darcs|\.svn|\.hg)(/|$)")
        .expect("exclude pattern is a valid regex")
});

/// Editor temp files and version-control directories are not copied in.
pub fn default_exclude(rel_path: &str) -> bool {
    DEFAULT_EXCLUDE.is_match(rel_path)
}

/// How to start a [`BuildRun`].
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Tree copied into `building/src/`.
    pub source_dir: PathBuf,
    /// Files every unit implicitly depends on.
    pub build_script_sources: Vec<PathBuf>,
    /// Defaults to `<parent of source_dir>/+<name>-builds`.
    pub builds_dir: Option<PathBuf>,
    /// Source-relative paths for which this returns true are not copied in.
    pub exclude: fn(&str) -> bool,
}

impl BuildOptions {
    pub fn new(source_dir: impl Into<PathBuf>) -> Self {
        Self {
            source_dir: source_dir.into(),
            build_script_sources: Vec::new(),
            builds_dir: None,
            exclude: default_exclude,
        }
    }
}

/// What [`BuildRun::memoize`] did with a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    /// Every destination already existed in `building/`.
    Satisfied,
    /// Destinations were hard-linked from an earlier generation.
    Reused { generation: PathBuf },
    /// The production callback ran.
    Produced(T),
}

impl<T> Outcome<T> {
    pub fn is_produced(&self) -> bool {
        matches!(self, Outcome::Produced(_))
    }
}

/// Unit counts for a build run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BuildStats {
    pub satisfied: u32,
    pub reused: u32,
    pub produced: u32,
    pub volatile: u32,
}

impl BuildStats {
    pub fn total(&self) -> u32 {
        self.satisfied + self.reused + self.produced + self.volatile
    }
}

impl fmt::Display for BuildStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reused > 0 || self.satisfied > 0 {
            write!(
                f,
                "{} reused, {} up to date, {} built ({} total)",
                self.reused,
                self.satisfied,
                self.produced + self.volatile,
                self.total()
            )
        } else {
            write!(f, "{} built", self.total())
        }
    }
}

/// An in-progress build generation.
#[derive(Debug)]
pub struct BuildRun {
    source_dir: PathBuf,
    builds_dir: PathBuf,
    building_dir: PathBuf,
    reuse_generations: Vec<PathBuf>,
    script_latest: SystemTime,
    stats: Cell<BuildStats>,
}

impl BuildRun {
    /// Set up the generation directories and copy the source tree in.
    pub fn start(options: &BuildOptions) -> Result<Self, BuildError> {
        let source_dir = fs::canonicalize(&options.source_dir)
            .map_err(|e| missing_or_io(&options.source_dir, e))?;
        let (Some(parent), Some(name)) = (source_dir.parent(), source_dir.file_name()) else {
            return Err(BuildError::InvalidRoot(source_dir));
        };

        let builds_dir = match &options.builds_dir {
            Some(dir) => dir.clone(),
            None => parent.join(format!("+{}-builds", name.to_string_lossy())),
        };
        fs::create_dir_all(&builds_dir)?;
        let builds_dir = fs::canonicalize(&builds_dir)?;
        if builds_dir.starts_with(&source_dir) {
            return Err(BuildError::BuildsInsideSource {
                builds: builds_dir,
                source_dir,
            });
        }

        let script_sources = options
            .build_script_sources
            .iter()
            .map(|p| fs::canonicalize(p).map_err(|e| missing_or_io(p, e)))
            .collect::<Result<Vec<_>, _>>()?;
        let script_latest = latest_of(&script_sources, SystemTime::UNIX_EPOCH)?;

        let build_dir = builds_dir.join(BUILD_DIR);
        let building_dir = builds_dir.join(BUILDING_DIR);
        let building_old_dir = builds_dir.join(BUILDING_OLD_DIR);

        let mut reuse_generations = Vec::new();
        if build_dir.exists() {
            reuse_generations.push(build_dir);
        }
        if building_dir.exists() {
            info!(dir = %building_dir.display(), "Keeping unfinished generation for reuse");
            merge_older_into(&building_dir, &building_old_dir)?;
            fs::rename(&building_dir, &building_old_dir)?;
        }
        if building_old_dir.exists() {
            reuse_generations.push(building_old_dir);
        }

        fs::create_dir(&building_dir)?;
        set_mtime(&building_dir, script_latest)?;

        let run = Self {
            source_dir,
            builds_dir,
            building_dir,
            reuse_generations,
            script_latest,
            stats: Cell::new(BuildStats::default()),
        };
        run.copy_in(options.exclude)?;
        Ok(run)
    }

    fn copy_in(&self, exclude: fn(&str) -> bool) -> Result<(), BuildError> {
        let files = pathset::relative_files_under_except(&self.source_dir, exclude)?;
        let mut copied = 0;
        for rel in &files {
            let source = self.source_dir.join(rel);
            let dest = Path::new(SRC_DIR).join(rel);
            self.memoize(&[source], &[dest], |sources, dests| {
                fs::copy(&sources[0], &dests[0])?;
                Ok::<_, BuildError>(())
            })?;
            copied += 1;
        }
        debug!(files = copied, "Copied source tree into building/src");
        Ok(())
    }

    pub fn source_dir(&self) -> &Path {
        &self.source_dir
    }

    pub fn builds_dir(&self) -> &Path {
        &self.builds_dir
    }

    pub fn building_dir(&self) -> &Path {
        &self.building_dir
    }

    /// `building/src`, the copied-in source tree.
    pub fn src_dir(&self) -> PathBuf {
        self.building_dir.join(SRC_DIR)
    }

    /// Earlier generations consulted for reuse, in priority order.
    pub fn reuse_generations(&self) -> &[PathBuf] {
        &self.reuse_generations
    }

    pub fn stats(&self) -> BuildStats {
        self.stats.get()
    }

    /// Newest mtime among `sources` (resolved against `building/`) and the
    /// build-script sources.
    pub fn latest_mtime(&self, sources: &[PathBuf]) -> Result<SystemTime, BuildError> {
        let resolved: Vec<PathBuf> = sources.iter().map(|s| self.building_dir.join(s)).collect();
        latest_of(&resolved, self.script_latest)
    }

    /// Run `produce` unless its destinations are already present or can be
    /// reused from an earlier generation.
    ///
    /// Sources are absolute or relative to `building/`; destinations must be
    /// relative to `building/`. `produce` receives both resolved to absolute
    /// paths and must create every destination.
    pub fn memoize<T, E, F>(&self, sources: &[PathBuf], dests: &[PathBuf], produce: F) -> Result<Outcome<T>, E>
    where
        F: FnOnce(&[PathBuf], &[PathBuf]) -> Result<T, E>,
        E: From<BuildError>,
    {
        let abs_sources: Vec<PathBuf> = sources.iter().map(|s| self.building_dir.join(s)).collect();
        let latest = latest_of(&abs_sources, self.script_latest)?;
        let abs_dests = self.resolve_destinations(dests)?;

        if abs_dests.iter().all(|d| d.exists()) {
            self.bump(|s| s.satisfied += 1);
            return Ok(Outcome::Satisfied);
        }

        let parents = self.prepare_parents(&abs_dests, latest)?;
        let outcome = match self.find_reusable(dests, latest) {
            Some(generation) => {
                for (rel, dest) in dests.iter().zip(&abs_dests) {
                    link_from(&generation.join(rel), dest)?;
                }
                debug!(dests = ?dests, generation = %generation.display(), "Reused");
                self.bump(|s| s.reused += 1);
                Outcome::Reused {
                    generation: generation.clone(),
                }
            }
            None => {
                remove_existing(&abs_dests)?;
                let value = produce(&abs_sources, &abs_dests)?;
                stamp_all(&abs_dests, latest)?;
                debug!(dests = ?dests, "Built");
                self.bump(|s| s.produced += 1);
                Outcome::Produced(value)
            }
        };
        restore_parents(parents, latest)?;
        Ok(outcome)
    }

    /// Write `contents` to `dest` unconditionally, leaving its mtime at "now"
    /// so every unit depending on it is rebuilt next run.
    pub fn write_volatile(&self, dest: &Path, contents: impl AsRef<[u8]>) -> Result<(), BuildError> {
        let abs_dests = self.resolve_destinations(&[dest.to_path_buf()])?;
        let parents = self.prepare_parents(&abs_dests, self.script_latest)?;
        remove_existing(&abs_dests)?;
        fs::write(&abs_dests[0], contents)?;
        restore_parents(parents, self.script_latest)?;
        self.bump(|s| s.volatile += 1);
        Ok(())
    }

    /// Write a record whose inputs can only be discovered by computing it.
    ///
    /// If `dest` already holds `contents` nothing happens. An identical copy in
    /// an earlier generation is hard-linked, so its mtime carries over and
    /// dependents stay up to date. Anything else is written fresh with an mtime
    /// of "now". Returns whether the contents changed.
    pub fn write_if_changed(&self, dest: &Path, contents: impl AsRef<[u8]>) -> Result<bool, BuildError> {
        let contents = contents.as_ref();
        let abs_dests = self.resolve_destinations(&[dest.to_path_buf()])?;
        let abs_dest = &abs_dests[0];
        if fs::read(abs_dest).is_ok_and(|current| current == contents) {
            self.bump(|s| s.satisfied += 1);
            return Ok(false);
        }

        let parents = self.prepare_parents(&abs_dests, self.script_latest)?;
        let previous = self
            .reuse_generations
            .iter()
            .map(|generation| generation.join(dest))
            .find(|candidate| fs::read(candidate).is_ok_and(|old| old == contents));
        let changed = match previous {
            Some(previous) => {
                link_from(&previous, abs_dest)?;
                self.bump(|s| s.reused += 1);
                false
            }
            None => {
                remove_existing(&abs_dests)?;
                fs::write(abs_dest, contents)?;
                debug!(dest = %dest.display(), "Record changed");
                self.bump(|s| s.volatile += 1);
                true
            }
        };
        restore_parents(parents, self.script_latest)?;
        Ok(changed)
    }

    /// Promote `building/` to `build/` and drop the older generations.
    pub fn finish(self) -> Result<PathBuf, BuildError> {
        let build_dir = self.builds_dir.join(BUILD_DIR);
        let building_old_dir = self.builds_dir.join(BUILDING_OLD_DIR);

        if building_old_dir.exists() {
            fs::remove_dir_all(&building_old_dir)?;
        }
        if build_dir.exists() {
            fs::rename(&build_dir, &building_old_dir)?;
        }
        fs::rename(&self.building_dir, &build_dir)?;
        if building_old_dir.exists() {
            fs::remove_dir_all(&building_old_dir)?;
        }
        info!(build = %build_dir.display(), units = %self.stats(), "Promoted generation");
        Ok(build_dir)
    }

    fn bump(&self, update: impl FnOnce(&mut BuildStats)) {
        let mut stats = self.stats.get();
        update(&mut stats);
        self.stats.set(stats);
    }

    fn resolve_destinations(&self, dests: &[PathBuf]) -> Result<Vec<PathBuf>, BuildError> {
        dests
            .iter()
            .map(|dest| {
                let inside = !dest.as_os_str().is_empty()
                    && dest
                        .components()
                        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
                if inside {
                    Ok(self.building_dir.join(dest))
                } else {
                    Err(BuildError::DestinationOutsideBuild(dest.clone()))
                }
            })
            .collect()
    }

    fn find_reusable(&self, dests: &[PathBuf], latest: SystemTime) -> Option<&PathBuf> {
        self.reuse_generations
            .iter()
            .find(|generation| dests.iter().all(|d| mtime_opt(&generation.join(d)) == Some(latest)))
    }

    /// Create missing parent directories and remember each parent's mtime.
    fn prepare_parents(
        &self,
        abs_dests: &[PathBuf],
        latest: SystemTime,
    ) -> Result<BTreeMap<PathBuf, SystemTime>, BuildError> {
        let mut parents = BTreeMap::new();
        for dest in abs_dests {
            let parent = dest.parent().unwrap_or(&self.building_dir);
            create_dirs_stamped(parent, latest)?;
            parents.insert(parent.to_path_buf(), mtime(parent)?);
        }
        Ok(parents)
    }
}

/// Start a run, hand it to `body`, and promote the generation only if `body`
/// succeeds.
pub fn run<T, E, F>(options: &BuildOptions, body: F) -> Result<T, E>
where
    F: FnOnce(&BuildRun) -> Result<T, E>,
    E: From<BuildError>,
{
    let run = BuildRun::start(options)?;
    let value = body(&run)?;
    run.finish()?;
    Ok(value)
}

// ============================================================================
// Filesystem helpers
// ============================================================================

fn missing_or_io(path: &Path, err: io::Error) -> BuildError {
    if err.kind() == io::ErrorKind::NotFound {
        BuildError::MissingSource(path.to_path_buf())
    } else {
        BuildError::Io(err)
    }
}

pub fn mtime(path: &Path) -> Result<SystemTime, BuildError> {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .map_err(|e| missing_or_io(path, e))
}

fn mtime_opt(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Set both access and modification time. Works on directories too.
pub fn set_mtime(path: &Path, time: SystemTime) -> io::Result<()> {
    let file = File::open(path)?;
    file.set_times(FileTimes::new().set_accessed(time).set_modified(time))
}

fn latest_of(paths: &[PathBuf], floor: SystemTime) -> Result<SystemTime, BuildError> {
    paths
        .iter()
        .try_fold(floor, |latest, path| Ok(latest.max(mtime(path)?)))
}

fn stamp_all(dests: &[PathBuf], latest: SystemTime) -> Result<(), BuildError> {
    for dest in dests {
        if !dest.exists() {
            return Err(BuildError::NotProduced(dest.clone()));
        }
        set_mtime(dest, latest)?;
    }
    Ok(())
}

fn restore_parents(parents: BTreeMap<PathBuf, SystemTime>, latest: SystemTime) -> Result<(), BuildError> {
    for (dir, previous) in parents {
        set_mtime(&dir, previous.max(latest))?;
    }
    Ok(())
}

/// Destinations may be hard links into an earlier generation; unlink them
/// before writing so the earlier copy stays intact.
fn remove_existing(dests: &[PathBuf]) -> Result<(), BuildError> {
    for dest in dests {
        if fs::symlink_metadata(dest).is_ok() {
            fs::remove_file(dest)?;
        }
    }
    Ok(())
}

fn link_from(existing: &Path, dest: &Path) -> Result<(), BuildError> {
    if fs::symlink_metadata(dest).is_ok() {
        fs::remove_file(dest)?;
    }
    fs::hard_link(existing, dest)?;
    Ok(())
}

/// `mkdir -p` that stamps every directory it creates with `time` and leaves
/// the mtime of the nearest existing ancestor untouched.
fn create_dirs_stamped(dir: &Path, time: SystemTime) -> Result<(), BuildError> {
    let mut missing = Vec::new();
    let mut existing = dir;
    while !existing.exists() {
        missing.push(existing);
        match existing.parent() {
            Some(parent) => existing = parent,
            None => break,
        }
    }
    if missing.is_empty() {
        return Ok(());
    }

    let ancestor_mtime = mtime(existing)?;
    for created in missing.iter().rev() {
        fs::create_dir(created)?;
    }
    for created in missing.iter().rev() {
        set_mtime(created, time)?;
    }
    set_mtime(existing, ancestor_mtime)?;
    Ok(())
}

/// Move everything `older` has that `target` lacks into `target`, then
/// delete `older`.
fn merge_older_into(target: &Path, older: &Path) -> Result<(), BuildError> {
    if !older.exists() {
        return Ok(());
    }
    for entry in WalkDir::new(target).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let rel = entry.path().strip_prefix(target).unwrap_or(Path::new(""));
        let Ok(older_entries) = fs::read_dir(older.join(rel)) else {
            continue;
        };
        for older_entry in older_entries {
            let older_entry = older_entry?;
            let candidate = entry.path().join(older_entry.file_name());
            if fs::symlink_metadata(&candidate).is_err() {
                fs::rename(older_entry.path(), candidate)?;
            }
        }
    }
    fs::remove_dir_all(older)?;
    Ok(())
}
