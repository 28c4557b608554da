//! Memoizing, piecemeal mirroring of directory and link structure.
//!
//! Whenever the graph engine resolves a file, the enclosing directory chain
//! is replicated under the client root, and any symlink along the chain is
//! replicated as a symlink. Replicated links always point at the
//! *canonicalized* target, whether the original was relative or absolute:
//! the staged tree must be interpretable without access to this machine's
//! filesystem.
//!
//! Directories the walk only passes through (an `..` excursion into a
//! directory no staged file lives in) are recorded as must-exist dirs; the
//! analyzer later drops a placeholder file into each so the consumer
//! creates them before preprocessing.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::cache::{Caches, DirectoryIdx};
use crate::error::{Error, Result};
use crate::paths::split_path;

#[derive(Debug, Default)]
pub struct MirrorPath {
    links: Vec<PathBuf>,
    // (filepath, currdir) pairs already processed.
    link_stat: HashSet<(String, DirectoryIdx)>,
    must_exist_dirs: Vec<PathBuf>,
}

impl MirrorPath {
    pub fn new() -> Self {
        Self::default()
    }

    /// The symbolic links created so far, in creation order.
    pub fn links(&self) -> &[PathBuf] {
        &self.links
    }

    pub fn must_exist_dirs(&self) -> &[PathBuf] {
        &self.must_exist_dirs
    }

    /// Mirror the parts of `filepath` not yet created under `root`.
    ///
    /// Works from the end of the path towards the root so a cache hit on a
    /// prefix cuts the walk short. Directories whose real location falls
    /// under a compiler default systemdir are not replicated; the consumer
    /// is assumed to have them natively.
    pub fn do_path<'a>(
        &mut self,
        filepath: &str,
        currdir_idx: DirectoryIdx,
        root: &str,
        caches: &mut Caches,
        systemdirs: impl IntoIterator<Item = &'a String> + Copy,
    ) -> Result<()> {
        debug_assert!(root.starts_with('/') && !root.ends_with('/'));

        let mut filepath = filepath.to_owned();
        while !filepath.is_empty() && filepath != "/" {
            if !self.link_stat.insert((filepath.clone(), currdir_idx)) {
                return Ok(()); // already mirrored
            }
            debug_assert!(!filepath.ends_with('/'), "{filepath}");

            // The suffix may be a symlink; the prefix tells us where its
            // mirrored parent lives.
            let (prefix_filepath, suffix) = {
                let (p, s) = split_path(&filepath);
                (p.to_owned(), s.to_owned())
            };
            let mut prefix_real = caches.canonical_path.canonicalize(&prefix_filepath);
            if prefix_real == "/" {
                prefix_real.clear();
            }
            let root_prefix_real = format!("{root}{prefix_real}");

            if !caches.simple_build_stat.lookup(&root_prefix_real) {
                // First visit of this real location.
                if !Path::new(&root_prefix_real).is_dir() {
                    let realpath_idx = caches.realpath_index(&prefix_real);
                    if caches.systemdir_prefix_cache.starts_with_systemdir(
                        realpath_idx,
                        &caches.realpath_map,
                        systemdirs,
                    ) {
                        // The parent, and hence the link, exists on the
                        // consumer natively.
                        break;
                    }
                    self.must_exist_dirs.push(PathBuf::from(&root_prefix_real));
                    std::fs::create_dir_all(&root_prefix_real).map_err(|e| {
                        Error::fatal(format!("Could not make directory '{root_prefix_real}': {e}"))
                    })?;
                }
                caches.simple_build_stat.insert(root_prefix_real.clone(), true);
            }

            let is_link = std::fs::symlink_metadata(&filepath)
                .map(|m| m.file_type().is_symlink())
                .unwrap_or(false);
            if is_link {
                let link_name = format!("{root_prefix_real}/{suffix}");
                if !Path::new(&link_name).exists() {
                    let target = caches.canonical_path.canonicalize(&filepath);
                    std::os::unix::fs::symlink(&target, &link_name).map_err(|e| {
                        Error::fatal(format!("Could not make symlink '{link_name}': {e}"))
                    })?;
                    self.links.push(PathBuf::from(link_name));
                }
            }
            filepath = prefix_filepath;
        }
        Ok(())
    }
}
