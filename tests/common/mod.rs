//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

use rrsite::buildsystem::{BuildOptions, set_mtime};
use tempfile::TempDir;
use walkdir::WalkDir;

pub fn write_file(path: &Path, contents: impl AsRef<[u8]>) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, contents).unwrap();
}

pub fn set_mtime_secs(path: &Path, secs: u64) {
    set_mtime(path, UNIX_EPOCH + Duration::from_secs(secs)).unwrap();
}

/// Options for `<tmp>/source`, building into `<tmp>/builds`, with an old
/// build-script stand-in so source mtimes decide staleness.
pub fn options_for(tmp: &TempDir) -> (BuildOptions, PathBuf) {
    let source = tmp.path().join("source");
    fs::create_dir_all(&source).unwrap();
    let script = tmp.path().join("build.toml");
    write_file(&script, "# build script stand-in\n");
    set_mtime_secs(&script, 1_000_000);

    let mut options = BuildOptions::new(&source);
    options.builds_dir = Some(tmp.path().join("builds"));
    options.build_script_sources = vec![script];
    (options, source)
}

/// [`options_for`] with `fixtures/site/` copied in as the source tree.
pub fn fixture_site(tmp: &TempDir) -> (BuildOptions, PathBuf) {
    let (options, source) = options_for(tmp);
    let fixtures = Path::new(env!("CARGO_MANIFEST_DIR")).join("fixtures/site");
    for entry in WalkDir::new(&fixtures).into_iter().map(|e| e.unwrap()) {
        if entry.file_type().is_file() {
            let rel = entry.path().strip_prefix(&fixtures).unwrap();
            write_file(&source.join(rel), fs::read(entry.path()).unwrap());
        }
    }
    (options, source)
}

pub fn build_dir(tmp: &TempDir) -> PathBuf {
    tmp.path().join("builds/build")
}

/// Every file under `root` with its contents, keyed by relative path.
pub fn read_tree(root: &Path) -> BTreeMap<String, Vec<u8>> {
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .map(|e| e.unwrap())
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            let rel = e.path().strip_prefix(root).unwrap().to_string_lossy().replace('\\', "/");
            (rel, fs::read(e.path()).unwrap())
        })
        .collect()
}

/// Every file under `root` with its mtime.
pub fn read_mtimes(root: &Path) -> BTreeMap<String, std::time::SystemTime> {
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .map(|e| e.unwrap())
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            let rel = e.path().strip_prefix(root).unwrap().to_string_lossy().replace('\\', "/");
            (rel, e.metadata().unwrap().modified().unwrap())
        })
        .collect()
}

pub fn read_string(path: &Path) -> String {
    fs::read_to_string(path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
}
