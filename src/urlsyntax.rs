//! Byte-level URL syntax used to find references in arbitrary file contents.
//!
//! Files are scanned as raw bytes: a stylesheet or script is not guaranteed to
//! be valid UTF-8 outside of its URLs, and the scanner must not care.
//!
//! A **URL byte** is any byte except the controls and space (`0x00..=0x20`),
//! DEL, and `" < > \ ^ ` { | }`. Bytes at or above `0x80` count as URL bytes so
//! percent-decoded or raw UTF-8 paths survive.
//!
//! A **resource reference** is a maximal run of URL bytes that ends with the
//! marker (`?rr` by default) and is longer than the marker. Finding maximal
//! runs and checking their suffix is equivalent to the usual
//! `(?<!U)(U+)\?rr(?!U)` formulation, which needs lookaround the `regex` crate
//! does not offer.

use regex::Regex;
use regex::bytes::Regex as BytesRegex;
use std::sync::LazyLock;

/// Bytes that never appear inside a URL, as a regex class body.
pub const NON_URL_BYTES: &str = r#"\x00-\x20"<>\\^`{|}\x7F"#;

static URL_RUN: LazyLock<BytesRegex> = LazyLock::new(|| {
    BytesRegex::new(&format!("(?-u)[^{NON_URL_BYTES}]+")).expect("URL byte class is a valid regex")
});

static ORIGIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^((?:https?:)?//([^/]+))(.*)$").expect("origin pattern is a valid regex")
});

static HREF_START: LazyLock<BytesRegex> = LazyLock::new(|| {
    BytesRegex::new(r"(?i-u)<(?:a|area|link)\s[^<>]*href=").expect("href pattern is a valid regex")
});

pub fn is_url_byte(byte: u8) -> bool {
    !matches!(byte, 0x00..=0x20 | b'"' | b'<' | b'>' | b'\\' | b'^' | b'`' | b'{' | b'|' | b'}' | 0x7F)
}

/// One marker reference found in a haystack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkedRef<'h> {
    /// Start of the run, i.e. of the reference.
    pub start: usize,
    /// End of the run, i.e. just past the marker.
    pub end: usize,
    /// The run without its marker.
    pub reference: &'h [u8],
}

/// Finds resource references ending in a fixed marker.
#[derive(Debug, Clone)]
pub struct RefScanner {
    marker: Vec<u8>,
}

impl RefScanner {
    /// The marker must itself consist of URL bytes, otherwise no run could end
    /// with it. Configuration validation enforces that.
    pub fn new(marker: &str) -> Self {
        Self {
            marker: marker.as_bytes().to_vec(),
        }
    }

    pub fn marker(&self) -> &[u8] {
        &self.marker
    }

    pub fn find_refs<'h>(&self, haystack: &'h [u8]) -> Vec<MarkedRef<'h>> {
        URL_RUN
            .find_iter(haystack)
            .filter_map(|run| {
                let bytes = run.as_bytes();
                let reference = bytes.strip_suffix(self.marker.as_slice())?;
                if reference.is_empty() {
                    return None;
                }
                Some(MarkedRef {
                    start: run.start(),
                    end: run.end(),
                    reference,
                })
            })
            .collect()
    }

    /// Rebuild `haystack` with every reference replaced by `replace(reference)`.
    pub fn replace_refs<E, F>(&self, haystack: &[u8], mut replace: F) -> Result<Vec<u8>, E>
    where
        F: FnMut(&[u8]) -> Result<Vec<u8>, E>,
    {
        let mut out = Vec::with_capacity(haystack.len());
        let mut last = 0;
        for found in self.find_refs(haystack) {
            out.extend_from_slice(&haystack[last..found.start]);
            out.extend_from_slice(&replace(found.reference)?);
            last = found.end;
        }
        out.extend_from_slice(&haystack[last..]);
        Ok(out)
    }
}

/// A reference that names its origin, e.g. `https://cdn.example.com/a.css`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginRef<'a> {
    /// Scheme (if any), `//` and host: everything before the path.
    pub origin: &'a str,
    /// Host without scheme or slashes.
    pub host: &'a str,
    /// The rest of the reference, starting at the path.
    pub path: &'a str,
}

/// Split an `http:`, `https:` or protocol-relative reference into its origin
/// and path. Anything else returns `None`.
pub fn split_origin(reference: &str) -> Option<OriginRef<'_>> {
    let caps = ORIGIN.captures(reference)?;
    Some(OriginRef {
        origin: caps.get(1)?.as_str(),
        host: caps.get(2)?.as_str(),
        path: caps.get(3)?.as_str(),
    })
}

/// Targets of `<a>`, `<area>` and `<link>` hrefs, skipping ones that end in
/// `marker` (those are resource references and are scanned separately).
///
/// The value may be double-quoted, single-quoted or bare; its extent is the
/// URL-byte run after `href=`, minus the closing quote.
pub fn find_href_links<'h>(haystack: &'h [u8], marker: &[u8]) -> Vec<&'h [u8]> {
    let mut links = Vec::new();
    for tag in HREF_START.find_iter(haystack) {
        let mut pos = tag.end();
        let quote = match haystack.get(pos) {
            Some(&q @ (b'"' | b'\'')) => {
                pos += 1;
                Some(q)
            }
            _ => None,
        };
        let run_len = haystack[pos..].iter().take_while(|b| is_url_byte(**b)).count();
        let mut value = &haystack[pos..pos + run_len];
        match quote {
            Some(b'\'') => match value.strip_suffix(b"'") {
                Some(inner) => value = inner,
                None => continue,
            },
            Some(q) => {
                if haystack.get(pos + run_len) != Some(&q) {
                    continue;
                }
            }
            None => {}
        }
        if value.is_empty() || value.ends_with(marker) {
            continue;
        }
        links.push(value);
    }
    links
}
