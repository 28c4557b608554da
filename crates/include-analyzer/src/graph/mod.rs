//! The summary graph: memoized include dependencies per include
//! configuration.
//!
//! Nodes live in an arena and refer to each other by index, so the freely
//! cyclic graphs that symlinked include chains produce need no reference
//! counting; the arena is dropped wholesale on generation change.
//!
//! Keying happens at two levels. The top level is the *include
//! configuration* `(currdir, quote list, angle list)`: search lists change
//! what every `#include` means, so nothing is shared across configurations.
//! Within a configuration, nodes are found under their textual spelling
//! `(filepath, resolution mode, including dir)`, and additionally, once
//! resolved, under `(realpath, realpath of containing dir)`. The second
//! key is what terminates analysis of symlink cycles: spellings like
//! `D/../D/foo.h` are unbounded, but the pairs they denote are finite.

pub mod support;

use std::collections::HashMap;

use crate::cache::{DirectoryIdx, FilepathPair, IncludepathIdx, RealpathIdx};
pub use support::{SetId, Support, SupportRecordId, UnionCache};

/// How a filepath key is to be resolved into a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResolutionMode {
    /// The caller supplies an already-resolved pair and its realpath.
    Resolved,
    /// Search the including file's directory, then the quote list.
    Quote,
    /// Search the angle list only.
    Angle,
    /// `#include_next`: fan out over every quote-list directory.
    Next,
}

/// A file reference before or after resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilepathKey {
    /// Not yet resolved: a raw includepath.
    Includepath(IncludepathIdx),
    /// Resolved: `(searchdir, includepath)`.
    Pair(DirectoryIdx, IncludepathIdx),
}

/// Second-level cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKey {
    Spelled {
        filepath: FilepathKey,
        mode: ResolutionMode,
        /// The directory of the including file; affects resolution only in
        /// quote mode.
        file_dir_idx: Option<DirectoryIdx>,
    },
    /// Post-resolution identity of a file together with the real location
    /// of its containing directory.
    Real {
        realpath_idx: RealpathIdx,
        dirname_realpath_idx: RealpathIdx,
    },
}

/// Top-level cache key: everything that changes the meaning of every
/// `#include` in a compilation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InclConfig {
    pub currdir_idx: DirectoryIdx,
    pub quote_dirs: Vec<DirectoryIdx>,
    pub angle_dirs: Vec<DirectoryIdx>,
}

pub type NodeId = usize;

/// One file (or `#include_next` fan-out dummy) in a summary graph.
#[derive(Debug)]
pub struct Node {
    /// Realpath of the resolved file; `None` when resolution failed or the
    /// node is a dummy.
    pub realpath_idx: Option<RealpathIdx>,
    pub resolved_pair: Option<FilepathPair>,
    pub children: Vec<NodeId>,
    pub support: SupportRecordId,
}

/// The arena of nodes plus the two-level node cache.
#[derive(Debug, Default)]
pub struct SummaryGraph {
    nodes: Vec<Node>,
    configs: HashMap<InclConfig, usize>,
    caches: Vec<HashMap<NodeKey, NodeId>>,
}

impl SummaryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// The node-cache handle for an include configuration, creating it on
    /// first sight.
    pub fn cache_for(&mut self, config: InclConfig) -> usize {
        if let Some(&id) = self.configs.get(&config) {
            return id;
        }
        let id = self.caches.len();
        self.configs.insert(config, id);
        self.caches.push(HashMap::new());
        id
    }

    pub fn lookup(&self, cache: usize, key: &NodeKey) -> Option<NodeId> {
        self.caches[cache].get(key).copied()
    }

    /// Bind `key` to `node`, replacing any previous binding.
    pub fn bind(&mut self, cache: usize, key: NodeKey, node: NodeId) {
        self.caches[cache].insert(key, node);
    }

    pub fn add_node(
        &mut self,
        realpath_idx: Option<RealpathIdx>,
        resolved_pair: Option<FilepathPair>,
        support: SupportRecordId,
    ) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(Node {
            realpath_idx,
            resolved_pair,
            children: Vec::new(),
            support,
        });
        id
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id]
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.configs.clear();
        self.caches.clear();
    }
}

/// The computed closure: for every reachable non-system realpath, the
/// `(searchdir, includepath)` spellings resolved through an absolute
/// searchdir (used to synthesize `#line` directives server-side).
pub type IncludeClosure = HashMap<RealpathIdx, Vec<FilepathPair>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_handles_are_per_configuration() {
        let mut graph = SummaryGraph::new();
        let a = InclConfig {
            currdir_idx: 1,
            quote_dirs: vec![2, 3],
            angle_dirs: vec![3],
        };
        let b = InclConfig {
            currdir_idx: 1,
            quote_dirs: vec![3, 2],
            angle_dirs: vec![3],
        };
        let ca = graph.cache_for(a.clone());
        let cb = graph.cache_for(b);
        assert_ne!(ca, cb, "search-list order is significant");
        assert_eq!(graph.cache_for(a), ca);
    }

    #[test]
    fn rebinding_aliases_a_key() {
        let mut graph = SummaryGraph::new();
        let cache = graph.cache_for(InclConfig {
            currdir_idx: 1,
            quote_dirs: vec![],
            angle_dirs: vec![],
        });
        let n1 = graph.add_node(Some(7), Some((2, 3)), 0);
        let n2 = graph.add_node(Some(7), Some((4, 3)), 1);
        let key = NodeKey::Real {
            realpath_idx: 7,
            dirname_realpath_idx: 9,
        };
        graph.bind(cache, key, n1);
        assert_eq!(graph.lookup(cache, &key), Some(n1));
        graph.bind(cache, key, n2);
        assert_eq!(graph.lookup(cache, &key), Some(n2));
    }
}
