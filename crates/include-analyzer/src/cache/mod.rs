//! The interned-path cache edifice.
//!
//! Every path the analyzer touches flows through the maps in this module.
//! [`Caches`] owns the three id spaces and the derived stat caches for one
//! cache generation; the whole struct is dropped and rebuilt when the
//! generation changes.

pub(crate) mod intern;
pub(crate) mod stat;

pub use intern::{
    CanonicalPath, DirectoryIdx, DirectoryMap, FilepathPair, IncludePathMap, IncludepathIdx,
    PathMap, RealpathIdx, RealpathMap,
};
pub use stat::{
    BuildStatCache, DirnameCache, PathObservation, SimpleBuildStat, SystemdirPrefixCache,
};

use crate::config::Config;

/// One generation's worth of maps and stat caches.
#[derive(Debug)]
pub struct Caches {
    pub canonical_path: CanonicalPath,
    pub includepath_map: IncludePathMap,
    pub directory_map: DirectoryMap,
    pub realpath_map: RealpathMap,
    pub dirname_cache: DirnameCache,
    pub systemdir_prefix_cache: SystemdirPrefixCache,
    pub simple_build_stat: SimpleBuildStat,
    pub build_stat_cache: BuildStatCache,
}

impl Caches {
    pub fn new(config: &Config) -> Self {
        Self {
            canonical_path: CanonicalPath::new(),
            includepath_map: IncludePathMap::new(config.unsafe_absolute_includes),
            directory_map: DirectoryMap::new(),
            realpath_map: RealpathMap::new(),
            dirname_cache: DirnameCache::new(),
            systemdir_prefix_cache: SystemdirPrefixCache::new(),
            simple_build_stat: SimpleBuildStat::new(),
            build_stat_cache: BuildStatCache::new(config.path_observation_re.clone()),
        }
    }

    /// Resolve an includepath against `searchdir` (if any) followed by
    /// `searchlist`, in order. See [`BuildStatCache::resolve`].
    pub fn resolve(
        &mut self,
        includepath_idx: IncludepathIdx,
        currdir_idx: DirectoryIdx,
        searchdir_idx: Option<DirectoryIdx>,
        searchlist_idxs: &[DirectoryIdx],
    ) -> Option<(FilepathPair, RealpathIdx)> {
        self.build_stat_cache.resolve(
            includepath_idx,
            currdir_idx,
            searchdir_idx,
            searchlist_idxs,
            &self.includepath_map,
            &self.directory_map,
            &mut self.realpath_map,
            &mut self.canonical_path,
        )
    }

    /// The `(dir_idx, dir_realpath_idx)` of the directory containing the
    /// file denoted by the triple. See [`DirnameCache`].
    pub fn dirname(
        &mut self,
        currdir_idx: DirectoryIdx,
        searchdir_idx: DirectoryIdx,
        includepath_idx: IncludepathIdx,
    ) -> (DirectoryIdx, RealpathIdx) {
        self.dirname_cache.lookup(
            currdir_idx,
            searchdir_idx,
            includepath_idx,
            &self.includepath_map,
            &mut self.directory_map,
            &mut self.realpath_map,
            &mut self.canonical_path,
        )
    }

    /// Canonicalize `filepath` and intern the result.
    pub fn realpath_index(&mut self, filepath: &str) -> RealpathIdx {
        self.realpath_map.index(&mut self.canonical_path, filepath)
    }
}
