//! Management of the client-root staging directories.
//!
//! Mirrored headers and symlinks are staged under a per-generation temporary
//! directory. The protocol with the consumer of the staged tree stipulates
//! that the prefix prepended to absolute paths is exactly the top three
//! directory components of every staged path, so roots under a shallow temp
//! dir are padded with components literally named `padding`:
//!
//! - `/dev/shm/tmpX.include_analyzer-6642-19` (three components natively)
//! - `/tmp/tmpX.include_analyzer-6642-13/padding`
//!
//! Roots embed the owning pid and the cache generation. Old generations are
//! kept until their reader is done; a cleanout pass removes roots whose
//! owning process no longer exists.

use std::path::{Path, PathBuf};

use nix::sys::signal::kill;
use nix::unistd::Pid;
use tracing::debug;

use crate::error::{Error, Result};

/// Environment variable overriding the directory client roots are made in.
pub const CLIENT_TMP_ENV: &str = "INCLUDE_ANALYZER_CLIENT_TMP";

// Embedded in every client-root directory name.
const ANALYZER_NAME: &str = "include_analyzer";

#[derive(Debug)]
pub struct ClientRootKeeper {
    /// Where the per-generation directories are created.
    pub client_tmp: PathBuf,
    /// The current generation's (padded) root; staged paths live below it.
    pub client_root: PathBuf,
    root_before_padding: PathBuf,
    number_missing_levels: usize,
}

impl ClientRootKeeper {
    pub fn new() -> Result<Self> {
        let client_tmp = match std::env::var_os(CLIENT_TMP_ENV) {
            Some(dir) => PathBuf::from(dir),
            None => {
                let shm = Path::new("/dev/shm");
                if is_usable_dir(shm) {
                    shm.to_owned()
                } else {
                    PathBuf::from("/tmp")
                }
            }
        };
        let tmp_str = client_tmp.to_string_lossy();
        if !tmp_str.starts_with('/') {
            return Err(Error::fatal(format!(
                "{CLIENT_TMP_ENV} must start with '/', got '{tmp_str}'"
            )));
        }
        let tmp_str = tmp_str.trim_end_matches('/').to_owned();
        // '/a/b'.split('/') == ["", "a", "b"]: at most two directory levels,
        // leaving room for the generation directory within the fixed
        // three-component prefix.
        let levels = tmp_str.split('/').count();
        if levels > 3 {
            return Err(Error::fatal(format!(
                "{CLIENT_TMP_ENV} must have at most two directory levels, got '{tmp_str}'"
            )));
        }
        Ok(Self {
            client_tmp: PathBuf::from(tmp_str),
            client_root: PathBuf::new(),
            root_before_padding: PathBuf::new(),
            number_missing_levels: 3 - levels,
        })
    }

    /// Create the staging root for `generation`, leaving earlier roots in
    /// place for readers that have not caught up.
    pub fn make_root(&mut self, generation: u32) -> Result<()> {
        // The name never repeats: pid for the cleanout mechanism, generation
        // for uniqueness within this process.
        let suffix = format!(".{ANALYZER_NAME}-{}-{generation}", std::process::id());
        let dir = tempfile::Builder::new()
            .prefix("tmp")
            .suffix(&suffix)
            .tempdir_in(&self.client_tmp)
            .map_err(|e| {
                Error::fatal(format!(
                    "Could not create client root directory in {}: {e}",
                    self.client_tmp.display()
                ))
            })?;
        self.root_before_padding = dir.keep();
        let mut root = self.root_before_padding.clone();
        for _ in 0..self.number_missing_levels {
            root.push("padding");
        }
        if !root.is_dir() {
            std::fs::create_dir_all(&root).map_err(|e| {
                Error::fatal(format!(
                    "Could not create client root directory {}: {e}",
                    root.display()
                ))
            })?;
        }
        self.client_root = root;
        Ok(())
    }

    /// Unpadded client roots whose pid field matches `pid_expr` (a glob
    /// fragment).
    fn glob_roots(&self, pid_expr: &str) -> Vec<PathBuf> {
        let pattern = format!(
            "{}/*.{ANALYZER_NAME}-{pid_expr}-*",
            self.client_tmp.display()
        );
        match glob::glob(&pattern) {
            Ok(paths) => paths.flatten().collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Delete the client roots belonging to `pid` (default: this process).
    pub fn clean_out_client_roots(&self, pid: Option<u32>) {
        let pid = pid.unwrap_or_else(std::process::id);
        for root in self.glob_roots(&pid.to_string()) {
            let _ = std::fs::remove_dir_all(&root);
        }
    }

    /// Remove left-overs from analyzer processes that have passed away.
    pub fn clean_out_others(&self) {
        for root in self.glob_roots("*") {
            let Some(pid) = owning_pid(&root) else {
                continue; // not one of ours, or a spoofed name
            };
            if pid_alive(pid) {
                continue;
            }
            debug!("cleaning out '{}' after defunct analyzer", root.display());
            self.clean_out_client_roots(Some(pid));
        }
    }
}

// Fish the pid out of a root name such as `tmpX.include_analyzer-6642-13`.
fn owning_pid(root: &Path) -> Option<u32> {
    let name = root.file_name()?.to_str()?;
    let ultimate = name.rfind('-')?;
    let penultimate = name[..ultimate].rfind('-')?;
    name[penultimate + 1..ultimate].parse().ok()
}

fn pid_alive(pid: u32) -> bool {
    // Signal 0 probes existence; EPERM still means the pid is alive.
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::ESRCH) => false,
        Err(_) => true,
    }
}

fn is_usable_dir(dir: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    if !dir.is_dir() {
        return false;
    }
    // A crude writability probe: the mode check mirrors access(R|W|X).
    dir.metadata().map(|m| m.mode() & 0o700 == 0o700).unwrap_or(false)
        && std::fs::read_dir(dir).is_ok()
}
