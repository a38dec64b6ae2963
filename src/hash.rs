//! Content addressing for the resource rewriter and the emitter.
//!
//! Every digest in the pipeline is SHA-384. Three shapes are hashed:
//!
//! - **Files**: the raw bytes.
//! - **Directories**: the sorted entry names, each followed by a NUL byte.
//!   Only the listing is hashed; a referenced directory's children carry their
//!   own hashes and reach the directory's hash-including-deps through the
//!   dependency graph.
//! - **Part lists**: an explicit, ordered list of byte strings digested in one
//!   shot. Hash-including-deps and ETags are both built this way.
//!
//! ## Missing paths
//!
//! A reference to a path that does not exist still needs a hash record so the
//! referencing file can be rewritten. [`MISSING_PATH_HASH`] stands in for it.
//! It is 96 ASCII bytes (hex text), so it can never collide with a real 48-byte
//! digest.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use sha2::{Digest, Sha384};
use std::fs::{self, File};
use std::io;
use std::path::Path;

/// Length of a raw SHA-384 digest.
pub const DIGEST_LEN: usize = 48;

/// Hash record written for a path that does not exist.
pub const MISSING_PATH_HASH: &[u8] =
    b"dc02289afc4d6329d8886f13d6c88786488c69c5886ad8ec3df9dc5546c34f1da64740b521e63804d457339c977d29aa";

/// SHA-384 of a file's bytes, or of a directory's sorted entry names.
pub fn hash_path(path: &Path) -> io::Result<Vec<u8>> {
    if path.is_dir() {
        hash_dir_listing(path)
    } else {
        hash_file(path)
    }
}

/// SHA-384 of a file's contents, streamed.
pub fn hash_file(path: &Path) -> io::Result<Vec<u8>> {
    let mut file = File::open(path)?;
    let mut hasher = Sha384::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hasher.finalize().to_vec())
}

/// Hex SHA-384 of a file's contents. Used as the page-content address.
pub fn hash_file_hex(path: &Path) -> io::Result<String> {
    let bytes = fs::read(path)?;
    Ok(format!("{:x}", Sha384::digest(&bytes)))
}

fn hash_dir_listing(path: &Path) -> io::Result<Vec<u8>> {
    let mut names = fs::read_dir(path)?
        .map(|entry| entry.map(|e| e.file_name()))
        .collect::<io::Result<Vec<_>>>()?;
    names.sort();

    let mut hasher = Sha384::new();
    for name in &names {
        hasher.update(name.as_encoded_bytes());
        hasher.update(b"\0");
    }
    Ok(hasher.finalize().to_vec())
}

/// Digest of an ordered list of byte strings.
///
/// The parts are concatenated without separators, so callers that need
/// unambiguous framing must supply fixed-size parts or their own delimiters.
pub fn hash_parts<P: AsRef<[u8]>>(parts: &[P]) -> Vec<u8> {
    let mut hasher = Sha384::new();
    for part in parts {
        hasher.update(part.as_ref());
    }
    hasher.finalize().to_vec()
}

/// URL-safe base64 of `digest`, cut to at most `len` characters.
pub fn url_token(digest: &[u8], len: usize) -> String {
    let mut encoded = URL_SAFE.encode(digest);
    encoded.truncate(len);
    encoded
}
