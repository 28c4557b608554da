//! The analyzer: orchestration of one request and the memoizing
//! include-graph engine.
//!
//! An [`Analyzer`] owns every cache and a generation counter. All caches
//! belong to one generation; flushing (stat-reset triggers, timeouts)
//! increments the generation and rebuilds them, together with a fresh
//! client-root directory. Earlier client roots stay on disk until their
//! reader is done with them.
//!
//! The engine itself is [`Analyzer::find_node`], a memoized recursion over
//! `(filepath, resolution mode, including dir)` keys that builds the
//! summary graph for the request's include configuration. Nodes are
//! registered before their children are explored, which is what terminates
//! the analysis of cyclic include chains; a second cache level keyed by
//! `(realpath, realpath of dir)` merges distinct spellings of one real
//! file, which is what terminates symlink-induced spelling families like
//! `D/../D/foo.h`.

use std::collections::{HashMap, HashSet};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::Command;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{trace, warn};

use crate::cache::{Caches, DirectoryIdx, FilepathPair, RealpathIdx};
use crate::client_root::ClientRootKeeper;
use crate::compiler::CompilerDefaults;
use crate::config::{Config, DEBUG_DATA, DEBUG_TRACE, DEBUG_WARNING};
use crate::error::{Error, Result};
use crate::eval::{SymbolTable, resolve_expr};
use crate::graph::support::{Support, SupportRecordId};
use crate::graph::{
    FilepathKey, InclConfig, IncludeClosure, NodeId, NodeKey, ResolutionMode, SummaryGraph,
};
use crate::mirror::MirrorPath;
use crate::parse::{ParsedCommand, ParsedFile, insert_macro_def, parse_command_args, parse_file};
use crate::paths::{is_absolute, join3, join_paths, split_path};
use crate::stage::StageFiles;
use crate::stats::Stats;
use crate::timer::RequestTimer;

// Name of the placeholder file dropped into every must-exist dir; the
// consumer creates the directory as a side effect of receiving it.
const FORCING_FILENAME: &str = "forcing_dir_placeholder";

static BACKSLASH_NEWLINE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\\\n").unwrap());
static MAKEFILE_TARGET_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^.*:").unwrap());

/// A file identity stamp; any change to it signals regeneration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    mtime: i64,
    mtime_nsec: i64,
    ino: u64,
    dev: u64,
}

fn stamp(path: &str) -> Option<FileStamp> {
    use std::os::unix::fs::MetadataExt;
    let m = std::fs::metadata(path).ok()?;
    Some(FileStamp {
        mtime: m.mtime(),
        mtime_nsec: m.mtime_nsec(),
        ino: m.ino(),
        dev: m.dev(),
    })
}

pub struct Analyzer {
    config: Config,
    pub client_root_keeper: ClientRootKeeper,
    generation: u32,
    // Where the analyzer was started; relative trigger globs resolve here.
    include_server_cwd: PathBuf,
    // glob expression → matched path → stamp at last sight.
    stat_reset_triggers: HashMap<String, HashMap<String, Option<FileStamp>>>,

    // Per-generation caches.
    caches: Caches,
    symbol_table: SymbolTable,
    support: Support,
    file_cache: HashMap<RealpathIdx, ParsedFile>,
    mirror: MirrorPath,
    mirrored: HashSet<(FilepathPair, DirectoryIdx)>,
    compiler_defaults: CompilerDefaults,
    graph: SummaryGraph,
    stage: StageFiles,

    // Per-request state.
    currdir_idx: DirectoryIdx,
    quote_dirs: Vec<DirectoryIdx>,
    angle_dirs: Vec<DirectoryIdx>,
    d_opts: Vec<(String, Option<String>)>,
    translation_unit: String,
    result_file_prefix: String,
    active_cache: usize,
    timer: RequestTimer,
    stats: Stats,
}

impl Analyzer {
    pub fn new(config: Config) -> Result<Self> {
        let include_server_cwd = std::env::current_dir()
            .map_err(|e| Error::fatal(format!("cannot determine working directory: {e}")))?;
        let mut client_root_keeper = ClientRootKeeper::new()?;
        client_root_keeper.clean_out_others();
        let generation = 1;
        client_root_keeper.make_root(generation)?;

        // Record the current state of every trigger glob, so the first
        // request does not flush.
        let mut stat_reset_triggers = HashMap::new();
        for expr in &config.stat_reset_triggers {
            let mut stamps = HashMap::new();
            if let Ok(paths) = glob::glob(expr) {
                for path in paths.flatten() {
                    let path = path.display().to_string();
                    let current = stamp(&path);
                    stamps.insert(path, current);
                }
            }
            stat_reset_triggers.insert(expr.clone(), stamps);
        }

        let caches = Caches::new(&config);
        let compiler_defaults = CompilerDefaults::new(client_root_keeper.client_root.clone());
        let timer = RequestTimer::new(config.user_time_quota);
        Ok(Self {
            config,
            client_root_keeper,
            generation,
            include_server_cwd,
            stat_reset_triggers,
            caches,
            symbol_table: SymbolTable::new(),
            support: Support::new(),
            file_cache: HashMap::new(),
            mirror: MirrorPath::new(),
            mirrored: HashSet::new(),
            compiler_defaults,
            graph: SummaryGraph::new(),
            stage: StageFiles::new(),
            currdir_idx: 0,
            quote_dirs: Vec::new(),
            angle_dirs: Vec::new(),
            d_opts: Vec::new(),
            translation_unit: "unknown translation unit".to_owned(),
            result_file_prefix: String::new(),
            active_cache: 0,
            timer,
            stats: Stats::default(),
        })
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Handle one `(working directory, argv)` request.
    ///
    /// An empty result means "fall back to local preprocessing"; every
    /// recoverable failure maps onto it, with a one-line warning naming the
    /// translation unit. Only fatal errors surface as `Err`.
    pub fn process_request(&mut self, currdir: &Path, argv: &[String]) -> Result<Vec<PathBuf>> {
        match self.handle_request(currdir, argv) {
            Ok(files) => Ok(files),
            Err(err @ Error::Timeout { .. }) => {
                warn!(
                    "preprocessing locally for '{}': {err}",
                    self.translation_unit
                );
                // The memoization has likely degenerated; start over.
                self.clear_stat_caches()?;
                Ok(Vec::new())
            }
            Err(Error::Fatal(reason)) => Err(Error::Fatal(reason)),
            Err(err) => {
                warn!(
                    "preprocessing locally for '{}': {err}",
                    self.translation_unit
                );
                Ok(Vec::new())
            }
        }
    }

    fn handle_request(&mut self, currdir: &Path, argv: &[String]) -> Result<Vec<PathBuf>> {
        self.timer = RequestTimer::new(self.config.user_time_quota);
        self.translation_unit = "unknown translation unit".to_owned();

        // Trigger globs may be relative; evaluate them where the analyzer
        // was started, then move to the compilation's directory so all
        // resolution probes can be issued with relative paths.
        std::env::set_current_dir(&self.include_server_cwd)
            .map_err(|e| Error::fatal(format!("cannot return to own directory: {e}")))?;
        self.do_stat_reset_triggers()?;
        std::env::set_current_dir(currdir).map_err(|e| {
            Error::not_covered(format!(
                "Could not change to directory '{}': {e}",
                currdir.display()
            ))
        })?;

        let currdir_str = currdir
            .to_str()
            .ok_or_else(|| Error::not_covered("working directory is not valid UTF-8"))?;
        let currdir_str = if currdir_str.len() > 1 {
            currdir_str.trim_end_matches('/')
        } else {
            currdir_str
        };

        let parsed = parse_command_args(
            argv,
            currdir_str,
            &mut self.caches,
            &mut self.compiler_defaults,
            &mut self.timer,
        )?;
        let include_closure = self.process_compilation_command(currdir_str, parsed)?;

        // Staging and reporting are not charged against the quota.
        let client_root = self.client_root_keeper.client_root.display().to_string();
        let mut files_and_links = self.stage.stage(
            &include_closure,
            &client_root,
            self.currdir_idx,
            &mut self.caches,
            &mut self.mirror,
            &self.compiler_defaults.system_dirs_all,
        )?;
        // Links accumulate intra-build; all of them are reported every
        // time, system links first since there are few of them.
        files_and_links.extend(self.compiler_defaults.system_links.iter().cloned());
        files_and_links.extend(self.mirror.links().iter().cloned());
        if !self.config.no_force_dirs {
            files_and_links.extend(self.force_directories_to_exist()?);
        }

        if self.config.verify {
            let exact = self.exact_dependencies(argv)?;
            if self.config.write_include_closure {
                let path = format!("{}.d_exact", self.result_file_prefix);
                self.write_dependencies(exact.iter().copied(), &path)?;
            }
            self.verify_exact_dependencies(&include_closure, &exact)?;
        }
        if self.config.write_include_closure {
            let path = format!("{}.d_approx", self.result_file_prefix);
            self.write_dependencies(include_closure.keys().copied(), &path)?;
        }

        self.warn_about_path_observations();
        if self.config.debug(DEBUG_DATA) {
            self.stats.log_summary(
                self.caches.build_stat_cache.stat_count,
                self.caches.build_stat_cache.probe_count,
            );
        }
        Ok(files_and_links)
    }

    /// Flush every cache and start a new generation with a fresh client
    /// root. The previous roots are kept for late readers.
    pub fn clear_stat_caches(&mut self) -> Result<()> {
        self.generation += 1;
        self.client_root_keeper.make_root(self.generation)?;
        self.caches = Caches::new(&self.config);
        self.symbol_table.clear();
        self.support = Support::new();
        self.file_cache.clear();
        self.mirror = MirrorPath::new();
        self.mirrored.clear();
        self.compiler_defaults =
            CompilerDefaults::new(self.client_root_keeper.client_root.clone());
        self.graph.clear();
        self.stage = StageFiles::new();
        Ok(())
    }

    // Reset stat caches if a trigger glob evaluates differently from
    // earlier: a path appearing, disappearing, or changing its stamp.
    fn do_stat_reset_triggers(&mut self) -> Result<()> {
        if self.stat_reset_triggers.is_empty() {
            return Ok(());
        }
        let mut old_paths: Vec<String> = self
            .stat_reset_triggers
            .values()
            .flat_map(|stamps| stamps.keys().cloned())
            .collect();
        let exprs: Vec<String> = self.stat_reset_triggers.keys().cloned().collect();
        for expr in exprs {
            let matches: Vec<String> = match glob::glob(&expr) {
                Ok(paths) => paths.flatten().map(|p| p.display().to_string()).collect(),
                Err(_) => Vec::new(),
            };
            for path in matches {
                old_paths.retain(|p| p != &path);
                let new_stamp = stamp(&path);
                let recorded = self.stat_reset_triggers.get_mut(&expr).expect("known expr");
                match recorded.get(&path) {
                    Some(old_stamp) if *old_stamp != new_stamp => {
                        warn!("Path '{path}' changed. Clearing caches.");
                        recorded.insert(path, new_stamp);
                        return self.clear_stat_caches();
                    }
                    Some(_) => {}
                    None => {
                        warn!("Path '{path}' came into existence. Clearing caches.");
                        recorded.insert(path, new_stamp);
                        return self.clear_stat_caches();
                    }
                }
            }
        }
        if let Some(path) = old_paths.first().cloned() {
            warn!("Path '{path}' no longer exists. Clearing caches.");
            // Forget the stale entries, lest every subsequent request flush
            // again.
            for stamps in self.stat_reset_triggers.values_mut() {
                stamps.retain(|p, _| !old_paths.contains(p));
            }
            return self.clear_stat_caches();
        }
        Ok(())
    }

    fn process_compilation_command(
        &mut self,
        currdir: &str,
        parsed: ParsedCommand,
    ) -> Result<IncludeClosure> {
        self.quote_dirs = parsed.quote_dirs;
        self.angle_dirs = parsed.angle_dirs;
        self.d_opts = parsed.d_opts;
        self.translation_unit = parsed.translation_unit.clone();
        self.result_file_prefix = parsed.result_file_prefix;
        self.currdir_idx = self.caches.directory_map.index(currdir);
        self.stats.quote_path_total += self.quote_dirs.len() as u64;
        self.stats.angle_path_total += self.angle_dirs.len() as u64;

        let mut total_closure = IncludeClosure::new();
        let quote_dirs = self.quote_dirs.clone();
        for include_file in parsed.include_files {
            let fpath = self.caches.includepath_map.string(include_file).to_owned();
            let partial =
                self.process_file_from_command_line(&fpath, currdir, "include file", &quote_dirs)?;
            total_closure.extend(partial);
        }
        let partial = self.process_file_from_command_line(
            &parsed.translation_unit,
            currdir,
            "translation unit",
            &[],
        )?;
        total_closure.extend(partial);
        Ok(total_closure)
    }

    // Closure of a file given on the command line: the translation unit or
    // a -include file.
    fn process_file_from_command_line(
        &mut self,
        fpath: &str,
        currdir: &str,
        kind: &str,
        search_list: &[DirectoryIdx],
    ) -> Result<IncludeClosure> {
        // Absolute filepaths are tolerated here (unlike for includepaths in
        // general): the consumer rewrites the command line. The resolve
        // machinery still wants a (dir, relative-name) split.
        let (file_dirpath, file_filename) = if is_absolute(fpath) {
            split_path(fpath)
        } else {
            ("", fpath)
        };
        let includepath_idx = self.caches.includepath_map.index(file_filename)?;
        let file_dir_idx = self.caches.directory_map.index(file_dirpath);
        let Some((resolved_pair, realpath_idx)) = self.caches.resolve(
            includepath_idx,
            self.currdir_idx,
            Some(file_dir_idx),
            search_list,
        ) else {
            return Err(Error::not_covered(format!("Could not find {kind} '{fpath}'.")));
        };

        let client_root = self.client_root_keeper.client_root.display().to_string();
        let path = join_paths(currdir, fpath);
        self.mirror.do_path(
            &path,
            self.currdir_idx,
            &client_root,
            &mut self.caches,
            &self.compiler_defaults.system_dirs_all,
        )?;

        self.run_algorithm(resolved_pair, realpath_idx)
    }

    // Build (or reuse) the summary graph rooted at the given resolved file
    // and collect its closure.
    fn run_algorithm(
        &mut self,
        resolved_pair: FilepathPair,
        realpath_idx: RealpathIdx,
    ) -> Result<IncludeClosure> {
        let incl_config = InclConfig {
            currdir_idx: self.currdir_idx,
            quote_dirs: self.quote_dirs.clone(),
            angle_dirs: self.angle_dirs.clone(),
        };
        self.active_cache = self.graph.cache_for(incl_config);

        // Symbols defined on the command line. A bare -DX means X=1.
        for (lhs, rhs) in &self.d_opts {
            insert_macro_def(
                lhs,
                rhs.as_deref().unwrap_or("1"),
                &mut self.symbol_table,
                &mut self.support,
            )?;
        }

        let node = self.find_node(
            FilepathKey::Pair(resolved_pair.0, resolved_pair.1),
            ResolutionMode::Resolved,
            None,
            Some(realpath_idx),
        )?;
        Ok(self.calculate_closure_except_system(node))
    }

    /// The heart of the analyzer: find a previously constructed node for
    /// `fp` under the active include configuration, or create one.
    fn find_node(
        &mut self,
        fp: FilepathKey,
        mode: ResolutionMode,
        file_dir_idx: Option<DirectoryIdx>,
        fp_real_idx: Option<RealpathIdx>,
    ) -> Result<NodeId> {
        self.timer.check()?;
        self.stats.find_node_count += 1;
        debug_assert_eq!(
            matches!(fp, FilepathKey::Pair(..)),
            mode == ResolutionMode::Resolved
        );
        debug_assert_eq!(file_dir_idx.is_some(), mode == ResolutionMode::Quote);
        debug_assert!(fp_real_idx.is_none() || mode == ResolutionMode::Resolved);

        // The mode is part of the key; for quote resolution the including
        // file's directory is too, since resolution starts there.
        let key = NodeKey::Spelled {
            filepath: fp,
            mode,
            file_dir_idx,
        };

        let node_id;
        let resolution;
        if let Some(found) = self.graph.lookup(self.active_cache, &key) {
            if self.support.is_valid(self.graph.node(found).support) {
                self.stats.master_hit_count += 1;
                return Ok(found);
            }
            // Invalid support record: the meaning of some computed include
            // may have changed. Keep the node's identity, resolution, and
            // record; rebuild the children. Validity is restored only after
            // the re-registration below, so stale aliases are not reused.
            if self.config.debug(DEBUG_TRACE) {
                trace!(
                    "invalid record for translation unit: {}, node {found}",
                    self.translation_unit
                );
            }
            node_id = found;
            let node = self.graph.node_mut(node_id);
            resolution = node.resolved_pair.zip(node.realpath_idx);
            node.children.clear();
        } else {
            resolution = match mode {
                ResolutionMode::Quote => {
                    let FilepathKey::Includepath(ip) = fp else { unreachable!() };
                    let quote_dirs = self.quote_dirs.clone();
                    self.caches.resolve(ip, self.currdir_idx, file_dir_idx, &quote_dirs)
                }
                ResolutionMode::Angle => {
                    let FilepathKey::Includepath(ip) = fp else { unreachable!() };
                    let angle_dirs = self.angle_dirs.clone();
                    self.caches.resolve(ip, self.currdir_idx, None, &angle_dirs)
                }
                // A dummy whose children are every possible resolvent.
                ResolutionMode::Next => None,
                ResolutionMode::Resolved => {
                    let FilepathKey::Pair(searchdir, ip) = fp else { unreachable!() };
                    Some(((searchdir, ip), fp_real_idx.expect("realpath of resolved file")))
                }
            };
            let support = self.support.new_record();
            node_id = self.graph.add_node(
                resolution.map(|(_, real)| real),
                resolution.map(|(pair, _)| pair),
                support,
            );
            // Register before recursing; cyclic include chains find this
            // binding and stop.
            self.graph.bind(self.active_cache, key, node_id);
        }

        // Replicate the path's directories and symlinks on first sight.
        if let Some((resolved_pair, _)) = resolution {
            if self.mirrored.insert((resolved_pair, self.currdir_idx)) {
                let filepath = join3(
                    self.caches.directory_map.string(self.currdir_idx),
                    self.caches.directory_map.string(resolved_pair.0),
                    self.caches.includepath_map.string(resolved_pair.1),
                );
                let client_root = self.client_root_keeper.client_root.display().to_string();
                self.mirror.do_path(
                    &filepath,
                    self.currdir_idx,
                    &client_root,
                    &mut self.caches,
                    &self.compiler_defaults.system_dirs_all,
                )?;
            }
        }

        let Some(((searchdir_idx, includepath_idx), real_idx)) = resolution else {
            if mode == ResolutionMode::Next {
                // Fan out: resolve against each quote-list dir separately
                // and adopt every hit as a child.
                let FilepathKey::Includepath(ip) = fp else { unreachable!() };
                let quote_dirs = self.quote_dirs.clone();
                for searchdir in quote_dirs {
                    if let Some((pair, real)) =
                        self.caches.resolve(ip, self.currdir_idx, None, &[searchdir])
                    {
                        let child = self.find_node(
                            FilepathKey::Pair(pair.0, pair.1),
                            ResolutionMode::Resolved,
                            None,
                            Some(real),
                        )?;
                        self.graph.node_mut(node_id).children.push(child);
                    }
                }
            }
            // Unresolved non-NEXT nodes stay childless.
            return Ok(node_id);
        };

        // The realpath of the file's directory takes part in its identity:
        // a file reached through a symlinked spelling still resolves quoted
        // includes relative to the spelled directory, so the realpath of
        // the file alone would not be a sound key.
        let (fp_dirname_idx, fp_dirname_real_idx) =
            self.caches.dirname(self.currdir_idx, searchdir_idx, includepath_idx);

        let record = self.graph.node(node_id).support;
        if mode != ResolutionMode::Resolved {
            let real_key = NodeKey::Real {
                realpath_idx: real_idx,
                dirname_realpath_idx: fp_dirname_real_idx,
            };
            if self.support.is_valid(record) {
                if let Some(alias) = self.graph.lookup(self.active_cache, &real_key) {
                    self.stats.master_hit_count += 1;
                    // Another spelling of the same real file: redo the
                    // decision and alias this key to the existing node.
                    self.graph.bind(self.active_cache, key, alias);
                    return Ok(alias);
                }
            }
            self.graph.bind(self.active_cache, real_key, node_id);
        }

        // All chances of hitting the node cache are now exhausted.
        self.stats.master_miss_count += 1;
        self.support.set_valid(record, true);

        let parsed = match self.file_cache.get(&real_idx) {
            Some(parsed) => parsed.clone(),
            None => {
                self.stats.parse_file_count += 1;
                let path = self.caches.realpath_map.string(real_idx).to_owned();
                let parsed = parse_file(
                    &path,
                    &mut self.caches,
                    &mut self.symbol_table,
                    &mut self.support,
                )?;
                self.file_cache.insert(real_idx, parsed.clone());
                parsed
            }
        };

        for quote_ip in parsed.quote_includes.iter().copied() {
            let child = self.find_node(
                FilepathKey::Includepath(quote_ip),
                ResolutionMode::Quote,
                Some(fp_dirname_idx),
                None,
            )?;
            self.adopt_child(node_id, record, child);
        }
        for angle_ip in parsed.angle_includes.iter().copied() {
            let child =
                self.find_node(FilepathKey::Includepath(angle_ip), ResolutionMode::Angle, None, None)?;
            self.adopt_child(node_id, record, child);
        }
        for expr in &parsed.expr_includes {
            self.stats.resolve_expr_count += 1;
            let quote_dirs = self.quote_dirs.clone();
            let angle_dirs = self.angle_dirs.clone();
            let (files, symbols) = resolve_expr(
                &mut self.caches,
                expr,
                self.currdir_idx,
                fp_dirname_idx,
                &quote_dirs,
                &angle_dirs,
                &self.symbol_table,
            )?;
            for (pair, real) in files {
                let child = self.find_node(
                    FilepathKey::Pair(pair.0, pair.1),
                    ResolutionMode::Resolved,
                    None,
                    Some(real),
                )?;
                self.adopt_child(node_id, record, child);
            }
            // Resolution of this file's includes now depends on every
            // symbol occurring in possible expansions.
            self.support.update_with_symbols(record, symbols);
        }
        for next_ip in parsed.next_includes.iter().copied() {
            let child =
                self.find_node(FilepathKey::Includepath(next_ip), ResolutionMode::Next, None, None)?;
            self.adopt_child(node_id, record, child);
        }
        Ok(node_id)
    }

    fn adopt_child(&mut self, parent: NodeId, parent_record: SupportRecordId, child: NodeId) {
        self.graph.node_mut(parent).children.push(child);
        let child_set = self.support.support_id(self.graph.node(child).support);
        self.support.update(parent_record, child_set);
    }

    // Depth-first walk of the subgraph reachable from `root`, gathering
    // realpaths outside the default systemdirs.
    fn calculate_closure_except_system(&mut self, root: NodeId) -> IncludeClosure {
        let mut include_closure = IncludeClosure::new();
        self.caches.systemdir_prefix_cache.fill(
            &self.caches.realpath_map,
            &self.compiler_defaults.system_dirs_all,
        );
        let mut visited: HashSet<NodeId> = HashSet::new();
        let mut stack = vec![root];
        self.stats.closure_nonsys_len = 0;
        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            let node = self.graph.node(id);
            if let Some(real_idx) = node.realpath_idx {
                self.stats.closure_nonsys_len += 1;
                // System includes are skipped: the consumer has them.
                if !self.caches.systemdir_prefix_cache.get(real_idx) {
                    let spellings = include_closure.entry(real_idx).or_default();
                    let pair = node.resolved_pair.expect("resolved node has a pair");
                    if self.caches.directory_map.string(pair.0).starts_with('/') {
                        // An absolute searchdir: record the spelling so the
                        // original name survives in diagnostics.
                        spellings.push(pair);
                    }
                }
            }
            // Dummy nodes carry no filepath but do carry children.
            stack.extend(&node.children);
        }
        self.stats.closure_len = include_closure.len();
        include_closure
    }

    // In rare cases the sources contain #include "foo/../bar" without using
    // any file from foo/ itself. A dummy file in (the mirror of) each such
    // directory makes the consumer create it before preprocessing.
    fn force_directories_to_exist(&self) -> Result<Vec<PathBuf>> {
        let mut forcing_files = Vec::new();
        for dir in self.mirror.must_exist_dirs() {
            let forcing_file = dir.join(FORCING_FILENAME);
            // Append mode: never clobber an existing file of this name.
            OpenOptions::new()
                .append(true)
                .create(true)
                .open(&forcing_file)
                .map_err(|e| {
                    Error::fatal(format!(
                        "Could not create '{}': {e}",
                        forcing_file.display()
                    ))
                })?;
            forcing_files.push(forcing_file);
        }
        Ok(forcing_files)
    }

    // The dependency set as calculated by the real preprocessor, realpath
    // indices of everything outside the systemdirs.
    fn exact_dependencies(&mut self, argv: &[String]) -> Result<HashSet<RealpathIdx>> {
        let object_file = tempfile::NamedTempFile::new()
            .map_err(|e| Error::fatal(format!("cannot create temp file: {e}")))?;
        let deps_file = tempfile::NamedTempFile::new()
            .map_err(|e| Error::fatal(format!("cannot create temp file: {e}")))?;

        // The original command minus -o, plus preprocessing-only flags and
        // dependency output into our temp file.
        let mut preprocess_args: Vec<String> = Vec::with_capacity(argv.len() + 6);
        let mut skip_next = false;
        for arg in &argv[1..] {
            if skip_next {
                skip_next = false;
                continue;
            }
            if arg == "-o" {
                skip_next = true;
                continue;
            }
            if arg.starts_with("-o") && arg.len() > 2 {
                continue;
            }
            preprocess_args.push(arg.clone());
        }
        preprocess_args.extend([
            "-o".to_owned(),
            object_file.path().display().to_string(),
            "-E".to_owned(),
            "-M".to_owned(),
            "-MF".to_owned(),
            deps_file.path().display().to_string(),
        ]);

        let status = Command::new(&argv[0])
            .args(&preprocess_args)
            .status()
            .map_err(|e| {
                Error::not_covered(format!("Could not execute '{} ...': {e}", argv[0]))
            })?;
        if !status.success() {
            return Err(Error::not_covered(format!(
                "Preprocessing for verification failed with {status}."
            )));
        }

        let raw = std::fs::read(deps_file.path())
            .map_err(|e| Error::not_covered(format!("Could not read dependency file: {e}")))?;
        let text: String = raw.iter().map(|&b| b as char).collect();
        let unfolded = BACKSLASH_NEWLINE_RE.replace_all(&text, "").replace('\n', "");
        let without_target = MAKEFILE_TARGET_RE.replace(&unfolded, "");

        let cwd = std::env::current_dir()
            .map_err(|e| Error::fatal(format!("cannot determine working directory: {e}")))?;
        let cwd = cwd.display().to_string();
        let mut deps = HashSet::new();
        for filepath in without_target.split_whitespace() {
            let realpath_idx = self.caches.realpath_index(&join_paths(&cwd, filepath));
            let is_system = self.caches.systemdir_prefix_cache.starts_with_systemdir(
                realpath_idx,
                &self.caches.realpath_map,
                &self.compiler_defaults.system_dirs_all,
            );
            if !is_system {
                deps.insert(realpath_idx);
            }
        }
        Ok(deps)
    }

    fn verify_exact_dependencies(
        &self,
        include_closure: &IncludeClosure,
        exact: &HashSet<RealpathIdx>,
    ) -> Result<()> {
        let missing: Vec<RealpathIdx> = exact
            .iter()
            .copied()
            .filter(|realpath_idx| !include_closure.contains_key(realpath_idx))
            .collect();
        if let Some(&bad) = missing.first() {
            return Err(Error::not_covered(format!(
                "Calculated include closure does not contain: '{}'. \
                 There {} {} such missing {}.",
                self.caches.realpath_map.string(bad),
                if missing.len() == 1 { "is" } else { "are" },
                missing.len(),
                if missing.len() == 1 { "dependency" } else { "dependencies" },
            )));
        }
        Ok(())
    }

    fn write_dependencies(
        &self,
        deps: impl Iterator<Item = RealpathIdx>,
        result_file: &str,
    ) -> Result<()> {
        let mut lines: Vec<&str> =
            deps.map(|idx| self.caches.realpath_map.string(idx)).collect();
        lines.sort_unstable();
        let mut contents = lines.join("\n");
        contents.push('\n');
        std::fs::write(result_file, contents)
            .map_err(|e| Error::not_covered(format!("Could not write to '{result_file}': {e}")))
    }

    fn warn_about_path_observations(&mut self) {
        if !self.config.debug(DEBUG_WARNING) {
            self.caches.build_stat_cache.path_observations.clear();
            return;
        }
        let observations: Vec<_> =
            self.caches.build_stat_cache.path_observations.drain(..).collect();
        for observation in observations {
            warn!(
                "For translation unit '{}', lookup of file '{}' resolved to '{}' \
                 whose realpath is '{}'.",
                self.translation_unit,
                observation.includepath,
                observation.relpath,
                observation.realpath,
            );
        }
    }
}
