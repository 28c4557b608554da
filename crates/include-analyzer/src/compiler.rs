//! Divination of the compiler's built-in system search directories.
//!
//! Headers under the built-in search path must not be staged: a correct
//! compiler installation on the consumer side already has them. The probe
//! runs the compiler once per `(compiler, sysroot, language)` in verbose
//! mode against `/dev/null` and scrapes the search list from its output.
//!
//! The consumer blindly rewrites `-I` options to be relative to its own
//! root, which would break references into relocated system directories. A
//! symlink farm under the client root takes corrective action: for each
//! default dir `/usr/include`, a staged link at `<root>/usr/include` climbs
//! out of any plausible consumer-root nesting with `../` components and
//! lands back on the absolute `/usr/include`.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::cache::CanonicalPath;
use crate::error::{Error, Result};
use crate::timer::RequestTimer;

// An upper bound on the number of directory components of the consumer's
// transplant root. The farm links climb this many levels more than the
// linked directory is deep, plus slack; superfluous `../` components at the
// filesystem root are harmless.
pub const MAX_COMPONENTS_IN_SERVER_ROOT: usize = 20;

// Wall-clock bound on one compiler probe; the request timer is paused while
// the child runs, so the child gets its own kill.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

const SEARCH_LIST_START: &str = "#include <...> search starts here:";
const SEARCH_LIST_END: &str = "End of search list.";

/// Records and caches the default search dirs, and maintains the symlink
/// farm that re-roots them under the client root.
#[derive(Debug)]
pub struct CompilerDefaults {
    // (compiler, sysroot, language) → canonicalized default dirs.
    system_dirs: HashMap<(String, String, String), Vec<String>>,
    /// Union of every default dir observed, canonicalized; consulted by the
    /// systemdir prefix cache.
    pub system_dirs_all: BTreeSet<String>,
    /// Locations under the client root representing system default dirs.
    pub system_links: Vec<PathBuf>,
    client_root: PathBuf,
}

impl CompilerDefaults {
    pub fn new(client_root: PathBuf) -> Self {
        Self {
            system_dirs: HashMap::new(),
            system_dirs_all: BTreeSet::new(),
            system_links: Vec::new(),
            client_root,
        }
    }

    /// The default dirs for a probed triple, in search order.
    pub fn dirs_for(&self, compiler: &str, sysroot: &str, language: &str) -> &[String] {
        self.system_dirs
            .get(&(compiler.to_owned(), sysroot.to_owned(), language.to_owned()))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Probe `compiler` for `language` under `sysroot` unless already known,
    /// then extend the symlink farm.
    ///
    /// The request timer is paused for the duration: the child's runtime is
    /// bounded separately and must not count against the analysis quota.
    pub fn set_system_dirs_defaults(
        &mut self,
        compiler: &str,
        sysroot: &str,
        language: &str,
        timer: &mut RequestTimer,
        canonical: &mut CanonicalPath,
    ) -> Result<()> {
        let key = (compiler.to_owned(), sysroot.to_owned(), language.to_owned());
        if self.system_dirs.contains_key(&key) {
            return Ok(());
        }
        trace!("probing system dirs of {compiler} for {language}, sysroot '{sysroot}'");
        timer.pause();
        let probed = system_searchdirs(compiler, sysroot, language, canonical);
        timer.resume();
        let dirs = probed?;
        debug!("system dirs [{compiler}][{sysroot}][{language}]: {dirs:?}");
        for dir in &dirs {
            self.system_dirs_all.insert(dir.clone());
            make_link_from_mirror_to_real_location(
                dir,
                &self.client_root,
                &mut self.system_links,
            )?;
        }
        self.system_dirs.insert(key, dirs);
        Ok(())
    }
}

/// Run the compiler on an empty file and parse the default search dirs out
/// of its verbose output.
fn system_searchdirs(
    compiler: &str,
    sysroot: &str,
    language: &str,
    canonical: &mut CanonicalPath,
) -> Result<Vec<String>> {
    let mut command = Command::new(compiler);
    command
        .args(["-x", language, "-v", "-c", "/dev/null", "-o", "/dev/null"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        // A scrubbed environment: CPATH and friends would leak extra
        // directories into the result. PATH survives so the compiler's own
        // subprocesses can be found.
        .env_clear();
    if let Some(path) = std::env::var_os("PATH") {
        command.env("PATH", path);
    }
    if !sysroot.is_empty() {
        command.arg(format!("--sysroot={sysroot}"));
    }

    let describe = |detail: String| {
        Error::not_covered(format!(
            "Couldn't determine default system include directories \
             for compiler '{compiler}', language '{language}': {detail}"
        ))
    };

    let output = run_with_deadline(command, PROBE_TIMEOUT).map_err(describe)?;
    if !output.status.success() {
        return Err(describe(format!(
            "probe exited with status {}.\nOutput:\n{}",
            output.status, output.text
        )));
    }
    parse_search_dirs(&output.text)
        .ok_or_else(|| describe(format!("couldn't parse probe output.\nReceived:\n{}", output.text)))
        .map(|dirs| dirs.iter().map(|d| canonical.canonicalize(d)).collect())
}

struct ProbeOutput {
    status: std::process::ExitStatus,
    text: String,
}

// Spawn, wait with a wall-clock bound, and merge stdout with stderr (the
// search list lands on stderr for gcc and clang alike).
fn run_with_deadline(
    mut command: Command,
    timeout: Duration,
) -> std::result::Result<ProbeOutput, String> {
    use std::io::Read;

    let mut child = command.spawn().map_err(|e| format!("error executing probe: {e}"))?;
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                let mut bytes = Vec::new();
                if let Some(mut out) = child.stdout.take() {
                    let _ = out.read_to_end(&mut bytes);
                }
                if let Some(mut err) = child.stderr.take() {
                    let _ = err.read_to_end(&mut bytes);
                }
                return Ok(ProbeOutput {
                    status,
                    text: String::from_utf8_lossy(&bytes).into_owned(),
                });
            }
            Ok(None) => {
                if Instant::now() > deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(format!("probe did not finish within {timeout:?}"));
                }
                std::thread::sleep(Duration::from_millis(20));
            }
            Err(e) => return Err(format!("error waiting for probe: {e}")),
        }
    }
}

/// Extract the directories listed between the search-list markers; `None`
/// when the markers are absent. Framework directories are not search dirs
/// and are dropped.
fn parse_search_dirs(output: &str) -> Option<Vec<String>> {
    let mut dirs = Vec::new();
    let mut in_list = false;
    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with(SEARCH_LIST_START) {
            in_list = true;
            continue;
        }
        if in_list {
            if trimmed.starts_with(SEARCH_LIST_END) {
                return Some(dirs);
            }
            if trimmed.ends_with("(framework directory)") {
                continue;
            }
            dirs.push(trimmed.to_owned());
        }
    }
    None
}

/// The longest prefix of `path` whose components all really exist (symlinks
/// excluded), and whether the component after the prefix is a symlink.
fn real_prefix(path: &Path) -> (PathBuf, bool) {
    let mut prefix = PathBuf::from("/");
    for component in path.components().skip(1) {
        let next = prefix.join(component);
        let metadata = std::fs::symlink_metadata(&next);
        match metadata {
            Ok(m) if m.file_type().is_symlink() => return (prefix, true),
            Ok(m) if m.is_dir() => prefix = next,
            _ => return (prefix, false),
        }
    }
    (prefix, false)
}

/// Create a link under the client root that will resolve to `system_dir` on
/// the consumer.
///
/// The link is only created when necessary: if `/usr` is already served by
/// a link, `/usr/include` needs none; if a subtree of mirrored files was
/// created before the parent dir turned out to be a system dir, the subtree
/// is replaced by one link.
fn make_link_from_mirror_to_real_location(
    system_dir: &str,
    client_root: &Path,
    system_links: &mut Vec<PathBuf>,
) -> Result<()> {
    if !system_dir.starts_with('/') {
        return Err(Error::fatal(format!(
            "Expected absolute path, but got '{system_dir}'."
        )));
    }
    let rooted_system_dir = PathBuf::from(format!(
        "{}{system_dir}",
        client_root.display()
    ));
    let parent = rooted_system_dir.parent().expect("rooted dir has a parent").to_owned();
    let (prefix, is_link) = real_prefix(&rooted_system_dir);

    let make_link = if prefix == rooted_system_dir {
        // Already mirrored as a real directory tree: collapse it to a link.
        std::fs::remove_dir_all(&rooted_system_dir).map_err(|e| {
            Error::fatal(format!(
                "Could not remove '{}': {e}",
                rooted_system_dir.display()
            ))
        })?;
        true
    } else if prefix == parent {
        // The parent chain exists; create the link unless it is there.
        !rooted_system_dir.exists()
    } else if !is_link {
        std::fs::create_dir_all(&parent).map_err(|e| {
            Error::fatal(format!("Could not create '{}': {e}", parent.display()))
        })?;
        true
    } else {
        // A link higher up already serves this location.
        false
    };

    if make_link {
        let depth = system_dir.matches('/').count();
        let target = format!(
            "{}{}",
            "../".repeat(MAX_COMPONENTS_IN_SERVER_ROOT + depth + 3),
            &system_dir[1..]
        );
        std::os::unix::fs::symlink(&target, &rooted_system_dir).map_err(|e| {
            Error::fatal(format!(
                "Could not create '{}': {e}",
                rooted_system_dir.display()
            ))
        })?;
        system_links.push(rooted_system_dir);
    }
    Ok(())
}
