//! Shared test utilities for the rrsite test suite.
//!
//! Builds throwaway source trees with deterministic mtimes so tests about
//! staleness never depend on the wall clock.
//!
//! # Usage
//!
//! ```rust
//! use crate::test_helpers::*;
//!
//! let tmp = TempDir::new().unwrap();
//! let (options, source) = site_options(&tmp, &[
//!     ("site/index.html", "<link href=\"style.css?rr\">"),
//!     ("site/style.css", "body {}"),
//! ]);
//! let run = BuildRun::start(&options).unwrap();
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};
use tempfile::TempDir;

use crate::buildsystem::{BuildOptions, set_mtime};

/// Default mtime of the build-script source. Older than anything a test
/// writes, so it never dominates a unit's latest time by accident.
pub const SCRIPT_MTIME_SECS: u64 = 1_000_000;

// =========================================================================
// Fixture setup
// =========================================================================

/// Write `contents` to `path`, creating parent directories.
pub fn write_file(path: &Path, contents: impl AsRef<[u8]>) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, contents).unwrap();
}

pub fn set_mtime_secs(path: &Path, secs: u64) {
    set_mtime(path, UNIX_EPOCH + Duration::from_secs(secs)).unwrap();
}

/// Build options for `<tmp>/source` with builds in `<tmp>/builds` and a
/// single build-script source `<tmp>/build.toml`.
pub fn build_options(tmp: &TempDir) -> (BuildOptions, PathBuf) {
    let source = tmp.path().join("source");
    fs::create_dir_all(&source).unwrap();
    let script = tmp.path().join("build.toml");
    write_file(&script, "# build script stand-in\n");
    set_mtime_secs(&script, SCRIPT_MTIME_SECS);

    let mut options = BuildOptions::new(&source);
    options.builds_dir = Some(tmp.path().join("builds"));
    options.build_script_sources = vec![script];
    (options, source)
}

/// [`build_options`] plus the given files under the source directory.
pub fn site_options(tmp: &TempDir, files: &[(&str, &str)]) -> (BuildOptions, PathBuf) {
    let (options, source) = build_options(tmp);
    for (rel, contents) in files {
        write_file(&source.join(rel), contents);
    }
    (options, source)
}

/// Copy `fixtures/site/` to a temp directory and return build options for it.
pub fn setup_fixtures() -> (TempDir, BuildOptions) {
    let tmp = TempDir::new().unwrap();
    let (options, source) = build_options(&tmp);
    let fixtures = Path::new(env!("CARGO_MANIFEST_DIR")).join("fixtures/site");
    copy_dir_recursive(&fixtures, &source).unwrap();
    (tmp, options)
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());

        if src_path.is_dir() {
            fs::create_dir_all(&dst_path)?;
            copy_dir_recursive(&src_path, &dst_path)?;
        } else {
            fs::copy(&src_path, &dst_path)?;
        }
    }
    Ok(())
}

// =========================================================================
// Inspection
// =========================================================================

pub fn read_string(path: &Path) -> String {
    fs::read_to_string(path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
}
