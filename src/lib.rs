//! # rrsite
//!
//! An incremental static site builder. A site is a directory of HTML,
//! markdown, redirect and resource files; the build turns it into a route
//! table plus content-addressed bodies a web server can serve with long cache
//! lifetimes.
//!
//! # Architecture: Generations and Units
//!
//! Every build works in a fresh generation directory and is promoted only when
//! it finishes:
//!
//! ```text
//! +site-builds/
//! ├── build/          last complete generation
//! ├── building/       generation in progress
//! │   ├── src/        copy of the source tree
//! │   ├── site/       assembled pages and linked resources
//! │   ├── rr/         rewriter records (deps, hashes, names)
//! │   ├── rewritten/  site with every ?rr reference rewritten
//! │   ├── pagecontent/  response bodies by content hash
//! │   └── routes.json   server rules
//! └── building-old/   an unfinished generation kept for reuse
//! ```
//!
//! All work is split into **units**: a closure with declared source files and
//! destination files. A unit whose destinations are still present is skipped;
//! one whose outputs in an older generation are newer than its sources has
//! them hard-linked in; anything else runs. Every output gets the mtime of its
//! newest input, so "newer than the sources" is exact. See [`buildsystem`].
//!
//! # Resource Rewriting
//!
//! References written as `img/logo.png?rr` are resolved, followed
//! transitively, and replaced with a URL whose name carries a hash of the
//! resource and everything it references. Changing one image renames every
//! stylesheet that (indirectly) uses it and nothing else. See [`rewrite`].
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`buildsystem`] | Generations, memoized units, mtime bookkeeping, promotion |
//! | [`rewrite`] | `?rr` references: dependency graph, hashes, renamed copies |
//! | [`site`] | Classifies source files and assembles the route table |
//! | [`routes`] | Route table, trailing-slash duals, response headers |
//! | [`links`] | Link graph, broken-link detection, indexable routes |
//! | [`render`] | Maud page shells, markdown pages, error pages, autohead |
//! | [`emit`] | Rewritten mirror, content-addressed bodies, `routes.json` |
//! | [`config`] | `config.toml` loading, stock defaults, validation |
//! | [`output`] | CLI output formatting |
//! | [`hash`] | SHA-384 file and path hashing, URL tokens |
//! | [`pathset`] | Sorted path-list records and path helpers |
//! | [`closure`] | Transitive closure over a successor function |
//! | [`urlsyntax`] | URL byte class, `?rr` and href scanning |
//!
//! # Design Decisions
//!
//! ## Mtimes Instead of a Database
//!
//! The filesystem is the only state. A unit's freshness is decided by
//! comparing mtimes, and records (dependency lists, hashes, names) are plain
//! files that are themselves unit outputs. Inspecting a build is `ls` and
//! `cat`.
//!
//! ## The Config File Is Part of the Build Script
//!
//! `config.toml` and the running executable count as inputs of every unit.
//! Editing either rebuilds everything, which is always correct and rarely
//! slow.

pub mod buildsystem;
pub mod closure;
pub mod config;
pub mod emit;
pub mod hash;
pub mod links;
pub mod output;
pub mod pathset;
pub mod render;
pub mod rewrite;
pub mod routes;
pub mod site;
pub mod urlsyntax;

#[cfg(test)]
pub(crate) mod test_helpers;
