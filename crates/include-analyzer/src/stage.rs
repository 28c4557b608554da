//! Staging of the computed closure under the client root.
//!
//! Every closure file is copied to `<client_root><realpath>`. A file whose
//! winning resolution went through an absolute searchdir would lose its
//! original name when the consumer transplants the tree, so its copy gets a
//! leading `#line 1 "<searchdir/includepath>"` directive and an `.abs` name
//! suffix marking the fact.

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::cache::{Caches, DirectoryIdx};
use crate::error::{Error, Result};
use crate::graph::IncludeClosure;
use crate::mirror::MirrorPath;

#[derive(Debug, Default)]
pub struct StageFiles {
    staged: HashSet<String>,
}

impl StageFiles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write the closure files under `client_root` and return their staged
    /// paths, creating enclosing directories (and replicating symlinks)
    /// through the mirror builder on demand.
    #[allow(clippy::too_many_arguments)]
    pub fn stage<'a>(
        &mut self,
        include_closure: &IncludeClosure,
        client_root: &str,
        currdir_idx: DirectoryIdx,
        caches: &mut Caches,
        mirror: &mut MirrorPath,
        systemdirs: impl IntoIterator<Item = &'a String> + Copy,
    ) -> Result<Vec<PathBuf>> {
        let mut files = Vec::with_capacity(include_closure.len());
        // Deterministic staging order keeps reruns and logs comparable.
        let mut realpath_idxs: Vec<_> = include_closure.keys().copied().collect();
        realpath_idxs.sort_unstable_by(|&a, &b| {
            caches.realpath_map.string(a).cmp(caches.realpath_map.string(b))
        });

        for realpath_idx in realpath_idxs {
            // Many absolute filepaths may designate the same canonical
            // path; the first discovered spelling is the one staged.
            let realpath = caches.realpath_map.string(realpath_idx).to_owned();
            let pairs = &include_closure[&realpath_idx];
            let new_filepath = if pairs.is_empty() {
                format!("{client_root}{realpath}")
            } else {
                format!("{client_root}{realpath}.abs")
            };
            files.push(PathBuf::from(&new_filepath));
            if !self.staged.insert(new_filepath.clone()) {
                continue;
            }

            let dir = crate::paths::dirname(&new_filepath).to_owned();
            if !Path::new(&dir).is_dir() {
                mirror.do_path(&realpath, currdir_idx, client_root, caches, systemdirs)?;
            }

            let prefix = if let Some(&(searchdir_idx, includepath_idx)) = pairs.first() {
                // The file is found through an absolute -I dir that does not
                // exist on the consumer; the directive preserves the
                // original name in diagnostics.
                format!(
                    "#line 1 \"{}{}\"\n",
                    caches.directory_map.string(searchdir_idx),
                    caches.includepath_map.string(includepath_idx)
                )
            } else {
                String::new()
            };

            let contents = std::fs::read(&realpath).map_err(|e| {
                Error::fatal(format!("Could not open '{realpath}' for reading: {e}"))
            })?;
            let mut out = std::fs::File::create(&new_filepath).map_err(|e| {
                Error::fatal(format!("Could not open '{new_filepath}' for writing: {e}"))
            })?;
            out.write_all(prefix.as_bytes())
                .and_then(|()| out.write_all(&contents))
                .map_err(|e| Error::fatal(format!("Could not write to '{new_filepath}': {e}")))?;
        }
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::collections::BTreeSet;

    #[test]
    fn stages_plain_and_line_directive_copies() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("root");
        std::fs::create_dir(&root).unwrap();
        let src = tmp.path().join("src");
        std::fs::create_dir(&src).unwrap();
        std::fs::write(src.join("rel.h"), "int a;\n").unwrap();
        std::fs::write(src.join("abs.h"), "int b;\n").unwrap();

        let config = Config::default();
        let mut caches = Caches::new(&config);
        let rel_idx = caches.realpath_index(&src.join("rel.h").display().to_string());
        let abs_idx = caches.realpath_index(&src.join("abs.h").display().to_string());
        let searchdir = caches.directory_map.index(&src.display().to_string());
        let ip = caches.includepath_map.index("abs.h").unwrap();

        let mut closure = IncludeClosure::new();
        closure.insert(rel_idx, vec![]);
        closure.insert(abs_idx, vec![(searchdir, ip)]);

        let mut mirror = MirrorPath::new();
        let mut stage = StageFiles::new();
        let none: &BTreeSet<String> = &BTreeSet::new();
        let currdir = caches.directory_map.index("/");
        let root_str = root.display().to_string();
        let files = stage
            .stage(&closure, &root_str, currdir, &mut caches, &mut mirror, none)
            .unwrap();
        assert_eq!(files.len(), 2);

        let rel_staged = format!("{root_str}{}", src.join("rel.h").display());
        let abs_staged = format!("{root_str}{}.abs", src.join("abs.h").display());
        assert_eq!(std::fs::read_to_string(&rel_staged).unwrap(), "int a;\n");
        let abs_contents = std::fs::read_to_string(&abs_staged).unwrap();
        assert_eq!(
            abs_contents,
            format!("#line 1 \"{}/abs.h\"\nint b;\n", src.display())
        );
    }

    #[test]
    fn restaging_is_skipped_but_listed() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("root");
        std::fs::create_dir(&root).unwrap();
        let file = tmp.path().join("one.h");
        std::fs::write(&file, "x").unwrap();

        let config = Config::default();
        let mut caches = Caches::new(&config);
        let idx = caches.realpath_index(&file.display().to_string());
        let mut closure = IncludeClosure::new();
        closure.insert(idx, vec![]);

        let mut mirror = MirrorPath::new();
        let mut stage = StageFiles::new();
        let none: &BTreeSet<String> = &BTreeSet::new();
        let currdir = caches.directory_map.index("/");
        let root_str = root.display().to_string();
        let first = stage
            .stage(&closure, &root_str, currdir, &mut caches, &mut mirror, none)
            .unwrap();
        // Mutating the original does not change the staged copy.
        std::fs::write(&file, "mutated").unwrap();
        let second = stage
            .stage(&closure, &root_str, currdir, &mut caches, &mut mirror, none)
            .unwrap();
        assert_eq!(first, second);
        let staged = &first[0];
        assert_eq!(std::fs::read_to_string(staged).unwrap(), "x");
    }
}
