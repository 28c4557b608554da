//! String-to-index maps for path components.
//!
//! Resolving one `#include` probes every directory on the search list, and a
//! build probes millions of `(currdir, searchdir, includepath)` combinations.
//! Interning each component once reduces the per-probe cost to integer
//! hashing. Three id spaces exist: includepaths (the operand of an
//! `#include`), directories (normalized to a trailing `/` so joining is plain
//! concatenation), and realpaths (canonicalized so that every spelling of one
//! real file shares an id). Index 0 is reserved in every space as a null
//! sentinel.

use std::collections::HashMap;
use std::fs;

use tracing::warn;

use crate::error::{Error, Result};

pub type IncludepathIdx = u32;
pub type DirectoryIdx = u32;
pub type RealpathIdx = u32;

/// A `(searchdir_idx, includepath_idx)` pair denoting a resolved file,
/// relative to an implicit current directory.
pub type FilepathPair = (DirectoryIdx, IncludepathIdx);

/// Bidirectional map from strings to dense indices starting at 1.
#[derive(Debug)]
pub struct PathMap {
    index: HashMap<String, u32>,
    // strings[0] is a placeholder; real indices satisfy
    // strings[index[s]] == s.
    strings: Vec<String>,
}

impl Default for PathMap {
    fn default() -> Self {
        Self::new()
    }
}

impl PathMap {
    pub fn new() -> Self {
        Self {
            index: HashMap::new(),
            strings: vec![String::new()],
        }
    }

    pub fn index(&mut self, path: &str) -> u32 {
        if let Some(&idx) = self.index.get(path) {
            return idx;
        }
        let idx = self.strings.len() as u32;
        self.index.insert(path.to_owned(), idx);
        self.strings.push(path.to_owned());
        idx
    }

    /// The string whose index is `idx`. Index 0 is not a real entry.
    pub fn string(&self, idx: u32) -> &str {
        debug_assert!(idx > 0, "index 0 is the null sentinel");
        &self.strings[idx as usize]
    }

    /// One more than the number of indexed strings.
    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.len() == 1
    }
}

/// Map for directory paths. Entries are stored with a trailing `/` (the
/// empty string excepted) so that `directory_string + relative_path` is a
/// valid join.
#[derive(Debug, Default)]
pub struct DirectoryMap {
    map: PathMap,
}

impl DirectoryMap {
    pub fn new() -> Self {
        Self { map: PathMap::new() }
    }

    /// Index `directory`, which must be `""` or a path without a trailing
    /// slash (`"/"` excepted).
    pub fn index(&mut self, directory: &str) -> DirectoryIdx {
        if directory.is_empty() || directory == "/" {
            return self.map.index(directory);
        }
        debug_assert!(!directory.ends_with('/'), "unnormalized directory: {directory}");
        self.map.index(&format!("{directory}/"))
    }

    pub fn string(&self, idx: DirectoryIdx) -> &str {
        self.map.string(idx)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Map for includepaths: the (relative) paths appearing after `#include`.
///
/// Rejecting absolute operands here is the sole safety net that keeps staged
/// paths inside the client-root sandbox. Under the unsafe-absolute-includes
/// option they are admitted with a warning; resolution skips them later.
#[derive(Debug)]
pub struct IncludePathMap {
    map: PathMap,
    allow_absolute: bool,
}

impl IncludePathMap {
    pub fn new(allow_absolute: bool) -> Self {
        Self {
            map: PathMap::new(),
            allow_absolute,
        }
    }

    pub fn index(&mut self, relpath: &str) -> Result<IncludepathIdx> {
        if crate::paths::is_absolute(relpath) {
            if self.allow_absolute {
                warn!(
                    "absolute filepath '{relpath}' was IGNORED \
                     (correctness of build may be affected)"
                );
            } else {
                return Err(Error::not_covered(format!(
                    "Filepath must be relative but isn't: '{relpath}'. \
                     Consider the --unsafe-absolute-includes option."
                )));
            }
        }
        Ok(self.map.index(strip_dot_slash(relpath)))
    }

    /// Index a filepath that is permitted to be absolute: the translation
    /// unit and `-include` files, whose locations the server rewrites.
    pub fn index_allowing_absolute(&mut self, path: &str) -> IncludepathIdx {
        self.map.index(strip_dot_slash(path))
    }

    pub fn string(&self, idx: IncludepathIdx) -> &str {
        self.map.string(idx)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Remove leading `./` sequences so `#include "./foo.c"` cannot seduce the
/// analyzer into the unbounded regression `foo.c`, `./foo.c`, `././foo.c`, ...
fn strip_dot_slash(mut path: &str) -> &str {
    while let Some(rest) = path.strip_prefix("./") {
        path = rest;
    }
    path
}

/// Map for absolute filepaths, canonicalized on insertion: two spellings
/// that resolve to the same real file share an index.
#[derive(Debug, Default)]
pub struct RealpathMap {
    map: PathMap,
}

impl RealpathMap {
    pub fn new() -> Self {
        Self { map: PathMap::new() }
    }

    pub fn index(&mut self, canonical: &mut CanonicalPath, filepath: &str) -> RealpathIdx {
        let real = canonical.canonicalize(filepath);
        self.map.index(&real)
    }

    pub fn string(&self, idx: RealpathIdx) -> &str {
        self.map.string(idx)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

// An upper bound on symlink hops while canonicalizing one path. Beyond it a
// link is treated as an ordinary component, matching the resolve-as-far-as-
// possible contract.
const MAX_SYMLINK_HOPS: usize = 40;

/// Memoized computation of realpaths. `canonicalize(x)` is `x` with every
/// symbolic link eliminated; the function is idempotent and total: components
/// that do not exist are carried over textually.
#[derive(Debug, Default)]
pub struct CanonicalPath {
    cache: HashMap<String, String>,
}

impl CanonicalPath {
    pub fn new() -> Self {
        Self { cache: HashMap::new() }
    }

    pub fn canonicalize(&mut self, filepath: &str) -> String {
        if let Some(cached) = self.cache.get(filepath) {
            return cached.clone();
        }
        let result = resolve_links(filepath);
        self.cache.insert(filepath.to_owned(), result.clone());
        result
    }
}

fn resolve_links(filepath: &str) -> String {
    // Relative inputs are resolved against the process working directory
    // first, so the cache key never depends on cwd.
    let abs;
    let filepath = if crate::paths::is_absolute(filepath) {
        filepath
    } else {
        abs = match std::env::current_dir() {
            Ok(cwd) => format!("{}/{}", cwd.display(), filepath),
            Err(_) => format!("/{filepath}"),
        };
        &abs
    };

    let mut pending: Vec<String> = filepath.split('/').rev().map(str::to_owned).collect();
    let mut resolved = String::new();
    let mut hops = 0;

    while let Some(part) = pending.pop() {
        match part.as_str() {
            "" | "." => continue,
            ".." => {
                // The prefix is fully resolved, so lexical parent removal
                // is sound here.
                if let Some(pos) = resolved.rfind('/') {
                    resolved.truncate(pos);
                }
                continue;
            }
            _ => {}
        }
        let candidate = format!("{resolved}/{part}");
        let is_link = fs::symlink_metadata(&candidate)
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false);
        if is_link && hops < MAX_SYMLINK_HOPS {
            hops += 1;
            if let Ok(target) = fs::read_link(&candidate) {
                let target = target.to_string_lossy().into_owned();
                if crate::paths::is_absolute(&target) {
                    resolved.clear();
                }
                for piece in target.split('/').rev() {
                    pending.push(piece.to_owned());
                }
                continue;
            }
        }
        resolved = candidate;
    }

    if resolved.is_empty() { "/".to_owned() } else { resolved }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_map_is_bijective() {
        let mut map = PathMap::new();
        let a = map.index("foo/bar.h");
        let b = map.index("baz.h");
        let a2 = map.index("foo/bar.h");
        assert_eq!(a, a2);
        assert_ne!(a, b);
        assert!(a >= 1 && b >= 1);
        assert_eq!(map.string(a), "foo/bar.h");
        assert_eq!(map.string(b), "baz.h");
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn directory_map_appends_slash() {
        let mut map = DirectoryMap::new();
        let root = map.index("/");
        let empty = map.index("");
        let usr = map.index("/usr/include");
        assert_eq!(map.string(root), "/");
        assert_eq!(map.string(empty), "");
        assert_eq!(map.string(usr), "/usr/include/");
        // Every stored entry is empty or ends in '/'.
        for idx in 1..map.len() as u32 {
            let s = map.string(idx);
            assert!(s.is_empty() || s.ends_with('/'), "bad entry {s:?}");
        }
    }

    #[test]
    fn includepath_map_strips_leading_dot_slash() {
        let mut map = IncludePathMap::new(false);
        let a = map.index("./a.h").unwrap();
        let b = map.index("././a.h").unwrap();
        let c = map.index("a.h").unwrap();
        assert_eq!(a, b);
        assert_eq!(b, c);
    }

    #[test]
    fn includepath_map_rejects_absolute() {
        let mut map = IncludePathMap::new(false);
        assert!(map.index("/etc/hosts").is_err());
        // The unsafe option admits them instead.
        let mut unsafe_map = IncludePathMap::new(true);
        assert!(unsafe_map.index("/etc/hosts").is_ok());
        // Explicitly sanctioned callers may always store absolute paths.
        let idx = map.index_allowing_absolute("/src/tu.c");
        assert_eq!(map.string(idx), "/src/tu.c");
    }

    #[test]
    fn canonicalize_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("real.h");
        std::fs::write(&file, "").unwrap();
        let mut canonical = CanonicalPath::new();
        let once = canonical.canonicalize(&file.display().to_string());
        let twice = canonical.canonicalize(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn canonicalize_resolves_symlinked_directories() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("real_d");
        std::fs::create_dir(&real).unwrap();
        std::fs::write(real.join("mem.h"), "").unwrap();
        let link = dir.path().join("d");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        let mut canonical = CanonicalPath::new();
        let via_link = canonical.canonicalize(&format!("{}/mem.h", link.display()));
        let direct = canonical.canonicalize(&format!("{}/mem.h", real.display()));
        assert_eq!(via_link, direct);
    }

    #[test]
    fn canonicalize_applies_dotdot_after_links() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("real_d");
        std::fs::create_dir(&real).unwrap();
        let link = dir.path().join("d");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        // d/../d/x resolves the first d before applying '..', so the result
        // lands back in real_d.
        let mut canonical = CanonicalPath::new();
        let resolved = canonical.canonicalize(&format!("{}/../d/x.h", link.display()));
        let real_canon = canonical.canonicalize(&real.display().to_string());
        assert_eq!(resolved, format!("{real_canon}/x.h"));
    }

    #[test]
    fn canonicalize_keeps_missing_suffix() {
        let mut canonical = CanonicalPath::new();
        let p = canonical.canonicalize("/nonexistent-root-entry/sub/file.h");
        assert_eq!(p, "/nonexistent-root-entry/sub/file.h");
    }

    #[test]
    fn realpath_map_unifies_spellings() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("x.h");
        std::fs::write(&file, "").unwrap();
        let link = dir.path().join("alias.h");
        std::os::unix::fs::symlink(&file, &link).unwrap();

        let mut canonical = CanonicalPath::new();
        let mut map = RealpathMap::new();
        let a = map.index(&mut canonical, &file.display().to_string());
        let b = map.index(&mut canonical, &link.display().to_string());
        assert_eq!(a, b);
    }
}
