//! Caches over filesystem exists-tests.
//!
//! The preprocessor's cost is dominated by does-this-file-exist probes: one
//! per search directory per `#include` per source file. [`BuildStatCache`]
//! memoizes those probes keyed by interned `(currdir, includepath, searchdir)`
//! triples; [`DirnameCache`] and [`SystemdirPrefixCache`] memoize the two
//! derived questions the graph engine asks about every resolved file.

use std::collections::HashMap;
use std::path::Path;

use regex::Regex;

use super::intern::{
    CanonicalPath, DirectoryIdx, DirectoryMap, FilepathPair, IncludePathMap, IncludepathIdx,
    RealpathIdx, RealpathMap,
};
use crate::paths::{dirname, join_paths};

// Initial size of the per-(currdir, includepath) searchdir cell array. Grown
// on demand when a searchdir index exceeds it.
const DIR_ARRAY_SIZE: usize = 500;

/// Stat cache keyed by plain path strings; used by the mirror builder where
/// the triple representation does not apply.
#[derive(Debug, Default)]
pub struct SimpleBuildStat {
    cache: HashMap<String, bool>,
}

impl SimpleBuildStat {
    pub fn new() -> Self {
        Self { cache: HashMap::new() }
    }

    /// True iff `filepath` exists, memoized.
    pub fn lookup(&mut self, filepath: &str) -> bool {
        if let Some(&known) = self.cache.get(filepath) {
            return known;
        }
        let exists = Path::new(filepath).exists();
        self.cache.insert(filepath.to_owned(), exists);
        exists
    }

    /// Record a result established by other means (e.g. after a mkdir).
    pub fn insert(&mut self, filepath: String, exists: bool) {
        self.cache.insert(filepath, exists);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cell {
    Unknown,
    Absent,
    Present(RealpathIdx),
}

/// A resolved path that matched the path-observation expression, kept for a
/// per-translation-unit warning.
#[derive(Debug, Clone)]
pub struct PathObservation {
    pub includepath: String,
    pub relpath: String,
    pub realpath: String,
}

/// The memoized `(currdir, includepath, searchdir)` exists-test, plus the
/// canonical path of every hit.
///
/// A cell is `Unknown` until first probed, then `Absent` or
/// `Present(realpath_idx)`. Every `Present` refers to a file that existed on
/// disk within the current cache generation.
#[derive(Debug, Default)]
pub struct BuildStatCache {
    cells: HashMap<DirectoryIdx, HashMap<IncludepathIdx, Vec<Cell>>>,
    path_observation_re: Option<Regex>,
    pub path_observations: Vec<PathObservation>,
    pub stat_count: u64,
    pub probe_count: u64,
}

impl BuildStatCache {
    pub fn new(path_observation_re: Option<Regex>) -> Self {
        Self {
            cells: HashMap::new(),
            path_observation_re,
            path_observations: Vec::new(),
            stat_count: 0,
            probe_count: 0,
        }
    }

    /// Resolve `includepath_idx` against `searchdir_idx` (when given)
    /// followed by `searchlist_idxs`, in order; the first hit wins.
    ///
    /// Requires the process working directory to equal the directory of
    /// `currdir_idx`: all probes are issued relative to it. Absolute
    /// includepaths resolve to nothing. Returns the winning
    /// `(searchdir, includepath)` pair and the realpath index of the file.
    #[allow(clippy::too_many_arguments)]
    pub fn resolve(
        &mut self,
        includepath_idx: IncludepathIdx,
        currdir_idx: DirectoryIdx,
        searchdir_idx: Option<DirectoryIdx>,
        searchlist_idxs: &[DirectoryIdx],
        includepath_map: &IncludePathMap,
        directory_map: &DirectoryMap,
        realpath_map: &mut RealpathMap,
        canonical: &mut CanonicalPath,
    ) -> Option<(FilepathPair, RealpathIdx)> {
        let includepath = includepath_map.string(includepath_idx);
        if includepath.starts_with('/') {
            // Exploring absolute includepaths would escape the sandbox; there
            // is no searchdir to report for them either.
            return None;
        }
        #[cfg(debug_assertions)]
        {
            let cwd = std::env::current_dir().expect("cwd");
            debug_assert_eq!(
                format!("{}/", cwd.display()),
                directory_map.string(currdir_idx),
                "resolve() requires cwd == currdir"
            );
        }

        let cells = self
            .cells
            .entry(currdir_idx)
            .or_default()
            .entry(includepath_idx)
            .or_insert_with(|| vec![Cell::Unknown; DIR_ARRAY_SIZE]);

        let head = searchdir_idx.as_slice();
        for &sl_idx in head.iter().chain(searchlist_idxs) {
            self.probe_count += 1;
            let i = sl_idx as usize;
            if i >= cells.len() {
                cells.resize(i + cells.len(), Cell::Unknown);
            }
            match cells[i] {
                Cell::Absent => {
                    #[cfg(debug_assertions)]
                    verify_cell(directory_map, includepath, currdir_idx, sl_idx, false);
                    continue;
                }
                Cell::Present(realpath_idx) => {
                    #[cfg(debug_assertions)]
                    verify_cell(directory_map, includepath, currdir_idx, sl_idx, true);
                    return Some(((sl_idx, includepath_idx), realpath_idx));
                }
                Cell::Unknown => {}
            }

            // The result is not cached yet: one real filesystem test.
            // currdir is implicit because cwd == currdir.
            self.stat_count += 1;
            let relpath = format!("{}{includepath}", directory_map.string(sl_idx));
            if Path::new(&relpath).is_file() {
                let rpath = join_paths(directory_map.string(currdir_idx), &relpath);
                let realpath_idx = realpath_map.index(canonical, &rpath);
                cells[i] = Cell::Present(realpath_idx);
                if let Some(re) = &self.path_observation_re {
                    let realpath = realpath_map.string(realpath_idx);
                    if re.is_match(realpath) {
                        self.path_observations.push(PathObservation {
                            includepath: includepath.to_owned(),
                            relpath,
                            realpath: realpath.to_owned(),
                        });
                    }
                }
                return Some(((sl_idx, includepath_idx), realpath_idx));
            }
            cells[i] = Cell::Absent;
        }
        None
    }
}

// Re-stat a cached answer and abort on divergence: a peer mutating the
// filesystem under us invalidates every guarantee the cache provides.
#[cfg(debug_assertions)]
fn verify_cell(
    directory_map: &DirectoryMap,
    includepath: &str,
    currdir_idx: DirectoryIdx,
    searchdir_idx: DirectoryIdx,
    cached_exists: bool,
) {
    let relpath = format!("{}{includepath}", directory_map.string(searchdir_idx));
    let really_exists = Path::new(&relpath).is_file();
    if cached_exists != really_exists {
        panic!(
            "cache inconsistency: '{}{relpath}' {}, but earlier this path {}",
            directory_map.string(currdir_idx),
            if really_exists { "exists" } else { "does not exist" },
            if cached_exists { "existed" } else { "did not exist" },
        );
    }
}

/// Memoized dirname computation for resolved files.
///
/// Maps `(currdir_idx, searchdir_idx, includepath_idx)` to
/// `(dir_idx, dir_realpath_idx)`: the (possibly relative) directory of
/// `searchdir/includepath`, and the canonical absolute location of that
/// directory. The latter participates in node identity; the former drives
/// quoted-include resolution.
#[derive(Debug, Default)]
pub struct DirnameCache {
    cache: HashMap<(DirectoryIdx, DirectoryIdx, IncludepathIdx), (DirectoryIdx, RealpathIdx)>,
}

impl DirnameCache {
    pub fn new() -> Self {
        Self { cache: HashMap::new() }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn lookup(
        &mut self,
        currdir_idx: DirectoryIdx,
        searchdir_idx: DirectoryIdx,
        includepath_idx: IncludepathIdx,
        includepath_map: &IncludePathMap,
        directory_map: &mut DirectoryMap,
        realpath_map: &mut RealpathMap,
        canonical: &mut CanonicalPath,
    ) -> (DirectoryIdx, RealpathIdx) {
        let key = (currdir_idx, searchdir_idx, includepath_idx);
        if let Some(&found) = self.cache.get(&key) {
            return found;
        }
        let joined = format!(
            "{}{}",
            directory_map.string(searchdir_idx),
            includepath_map.string(includepath_idx)
        );
        let directory = dirname(&joined).to_owned();
        let dir_idx = directory_map.index(&directory);
        let rp_idx = realpath_map.index(
            canonical,
            &join_paths(directory_map.string(currdir_idx), &directory),
        );
        self.cache.insert(key, (dir_idx, rp_idx));
        (dir_idx, rp_idx)
    }
}

/// A bit per realpath: does it start with one of the compiler's default
/// system directories? Filled lazily up to the current realpath map length.
#[derive(Debug)]
pub struct SystemdirPrefixCache {
    // cache[0] pairs with the realpath null sentinel.
    cache: Vec<bool>,
}

impl Default for SystemdirPrefixCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemdirPrefixCache {
    pub fn new() -> Self {
        Self { cache: vec![false] }
    }

    /// Ensure there is an entry for every index in `realpath_map`.
    pub fn fill<'a>(
        &mut self,
        realpath_map: &RealpathMap,
        systemdirs: impl IntoIterator<Item = &'a String> + Copy,
    ) {
        for idx in self.cache.len()..realpath_map.len() {
            let realpath = realpath_map.string(idx as RealpathIdx);
            let hit = systemdirs.into_iter().any(|dir| realpath.starts_with(dir));
            self.cache.push(hit);
        }
    }

    /// Direct access after [`fill`](Self::fill); avoids re-checking bounds in
    /// the closure walk.
    pub fn get(&self, idx: RealpathIdx) -> bool {
        self.cache[idx as usize]
    }

    pub fn starts_with_systemdir<'a>(
        &mut self,
        idx: RealpathIdx,
        realpath_map: &RealpathMap,
        systemdirs: impl IntoIterator<Item = &'a String> + Copy,
    ) -> bool {
        self.fill(realpath_map, systemdirs);
        self.cache[idx as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn maps() -> (IncludePathMap, DirectoryMap, RealpathMap, CanonicalPath) {
        (
            IncludePathMap::new(false),
            DirectoryMap::new(),
            RealpathMap::new(),
            CanonicalPath::new(),
        )
    }

    #[test]
    fn simple_build_stat_memoizes() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("x");
        std::fs::write(&file, "").unwrap();
        let mut stat = SimpleBuildStat::new();
        let path = file.display().to_string();
        assert!(stat.lookup(&path));
        std::fs::remove_file(&file).unwrap();
        // Still true: the cache answers, not the filesystem.
        assert!(stat.lookup(&path));
    }

    #[test]
    fn resolve_honors_search_order_and_absolute_ban() {
        let tmp = tempfile::tempdir().unwrap();
        let first = tmp.path().join("first");
        let second = tmp.path().join("second");
        std::fs::create_dir_all(&first).unwrap();
        std::fs::create_dir_all(&second).unwrap();
        std::fs::write(second.join("h.h"), "").unwrap();

        let (mut ips, mut dirs, mut reals, mut canonical) = maps();
        let cwd = std::env::current_dir().unwrap();
        let currdir = dirs.index(&cwd.display().to_string());
        let d1 = dirs.index(&first.display().to_string());
        let d2 = dirs.index(&second.display().to_string());
        let ip = ips.index("h.h").unwrap();

        let mut cache = BuildStatCache::new(None);
        let hit = cache
            .resolve(ip, currdir, None, &[d1, d2], &ips, &dirs, &mut reals, &mut canonical)
            .expect("should resolve in second dir");
        assert_eq!(hit.0, (d2, ip));
        // Second call comes from the cache; stat counter does not grow.
        let stats_before = cache.stat_count;
        let again = cache
            .resolve(ip, currdir, None, &[d1, d2], &ips, &dirs, &mut reals, &mut canonical)
            .unwrap();
        assert_eq!(again.0, (d2, ip));
        assert_eq!(cache.stat_count, stats_before);

        // First-match-wins: placing the file in `first` later must not change
        // the cached answer within this generation (debug builds would abort
        // on the inconsistency instead, so only exercise this in release).
        if cfg!(not(debug_assertions)) {
            std::fs::write(first.join("h.h"), "").unwrap();
            let still = cache
                .resolve(ip, currdir, None, &[d1, d2], &ips, &dirs, &mut reals, &mut canonical)
                .unwrap();
            assert_eq!(still.0, (d2, ip));
        }

        // Absolute includepaths resolve to nothing, even when stored under
        // the unsafe option.
        let mut unsafe_ips = IncludePathMap::new(true);
        let abs = unsafe_ips.index("/etc/hosts").unwrap();
        assert!(
            cache
                .resolve(abs, currdir, None, &[d1, d2], &unsafe_ips, &dirs, &mut reals, &mut canonical)
                .is_none()
        );
    }

    #[test]
    fn resolve_prefers_explicit_searchdir() {
        let tmp = tempfile::tempdir().unwrap();
        let quoted = tmp.path().join("quoted");
        let listed = tmp.path().join("listed");
        std::fs::create_dir_all(&quoted).unwrap();
        std::fs::create_dir_all(&listed).unwrap();
        std::fs::write(quoted.join("h.h"), "").unwrap();
        std::fs::write(listed.join("h.h"), "").unwrap();

        let (mut ips, mut dirs, mut reals, mut canonical) = maps();
        let cwd = std::env::current_dir().unwrap();
        let currdir = dirs.index(&cwd.display().to_string());
        let dq = dirs.index(&quoted.display().to_string());
        let dl = dirs.index(&listed.display().to_string());
        let ip = ips.index("h.h").unwrap();

        let mut cache = BuildStatCache::new(None);
        let hit = cache
            .resolve(ip, currdir, Some(dq), &[dl], &ips, &dirs, &mut reals, &mut canonical)
            .unwrap();
        assert_eq!(hit.0, (dq, ip));
    }

    #[test]
    fn resolved_realpath_opens() {
        // Stat-cache consistency: a `present` answer must denote an openable
        // file at dir_map[searchdir] + includepath.
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("ok.h"), "x").unwrap();

        let (mut ips, mut dirs, mut reals, mut canonical) = maps();
        let cwd = std::env::current_dir().unwrap();
        let currdir = dirs.index(&cwd.display().to_string());
        let d = dirs.index(&tmp.path().display().to_string());
        let ip = ips.index("ok.h").unwrap();

        let mut cache = BuildStatCache::new(None);
        let ((sd, found_ip), real) = cache
            .resolve(ip, currdir, None, &[d], &ips, &dirs, &mut reals, &mut canonical)
            .unwrap();
        let joined = format!("{}{}", dirs.string(sd), ips.string(found_ip));
        assert!(std::fs::read(&joined).is_ok());
        assert!(reals.string(real).starts_with('/'));
    }

    #[test]
    fn path_observation_records_matches() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("watched.h"), "").unwrap();

        let (mut ips, mut dirs, mut reals, mut canonical) = maps();
        let cwd = std::env::current_dir().unwrap();
        let currdir = dirs.index(&cwd.display().to_string());
        let d = dirs.index(&tmp.path().display().to_string());
        let ip = ips.index("watched.h").unwrap();

        let mut cache = BuildStatCache::new(Some(Regex::new("watched").unwrap()));
        cache
            .resolve(ip, currdir, None, &[d], &ips, &dirs, &mut reals, &mut canonical)
            .unwrap();
        assert_eq!(cache.path_observations.len(), 1);
        assert_eq!(cache.path_observations[0].includepath, "watched.h");
    }

    #[test]
    fn dirname_cache_splits_and_canonicalizes() {
        let tmp = tempfile::tempdir().unwrap();
        let sub = tmp.path().join("sub");
        std::fs::create_dir_all(&sub).unwrap();

        let (mut ips, mut dirs, mut reals, mut canonical) = maps();
        let currdir = dirs.index(&tmp.path().display().to_string());
        let searchdir = dirs.index("");
        let ip = ips.index("sub/foo.h").unwrap();

        let mut cache = DirnameCache::new();
        let (dir_idx, rp_idx) = cache.lookup(
            currdir, searchdir, ip, &ips, &mut dirs, &mut reals, &mut canonical,
        );
        assert_eq!(dirs.string(dir_idx), "sub/");
        let expected = canonical.canonicalize(&sub.display().to_string());
        assert_eq!(reals.string(rp_idx), expected);
        // Memoized.
        let again = cache.lookup(
            currdir, searchdir, ip, &ips, &mut dirs, &mut reals, &mut canonical,
        );
        assert_eq!(again, (dir_idx, rp_idx));
    }

    #[test]
    fn systemdir_prefix_cache_classifies() {
        let (_, _, mut reals, mut canonical) = maps();
        let tmp = tempfile::tempdir().unwrap();
        let sysdir = tmp.path().join("usr-include");
        std::fs::create_dir_all(&sysdir).unwrap();
        std::fs::write(sysdir.join("stdio.h"), "").unwrap();
        let other = tmp.path().join("project.h");
        std::fs::write(&other, "").unwrap();

        let sys_idx = reals.index(&mut canonical, &sysdir.join("stdio.h").display().to_string());
        let other_idx = reals.index(&mut canonical, &other.display().to_string());

        let systemdirs: BTreeSet<String> =
            [canonical.canonicalize(&sysdir.display().to_string())].into();
        let mut cache = SystemdirPrefixCache::new();
        assert!(cache.starts_with_systemdir(sys_idx, &reals, &systemdirs));
        assert!(!cache.starts_with_systemdir(other_idx, &reals, &systemdirs));
    }
}
