//! String-level path helpers.
//!
//! The cache layer stores every path as a string and relies on two
//! normalization invariants: directory strings end in `/` (or are empty) and
//! includepaths are relative. Joining is then plain concatenation. The
//! helpers here implement the few POSIX path operations the analyzer needs
//! without round-tripping through `std::path` (which would re-normalize and
//! break the string-identity the interning maps depend on).

/// True iff `path` is absolute.
pub fn is_absolute(path: &str) -> bool {
    path.starts_with('/')
}

/// Join two path fragments. An absolute second fragment wins, as in
/// `os.path.join`.
pub fn join_paths(dir: &str, path: &str) -> String {
    if is_absolute(path) || dir.is_empty() {
        path.to_owned()
    } else if dir.ends_with('/') {
        format!("{dir}{path}")
    } else {
        format!("{dir}/{path}")
    }
}

/// Three-way join; later absolute fragments win.
pub fn join3(a: &str, b: &str, c: &str) -> String {
    join_paths(&join_paths(a, b), c)
}

/// The directory component of `path`; `""` when there is none, `"/"` for
/// entries directly under the root.
pub fn dirname(path: &str) -> &str {
    match path.rfind('/') {
        None => "",
        Some(0) => "/",
        Some(i) => &path[..i],
    }
}

/// Split into `(dirname, basename)`.
pub fn split_path(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        None => ("", path),
        Some(0) => ("/", &path[1..]),
        Some(i) => (&path[..i], &path[i + 1..]),
    }
}

/// Safe, but limited, path normalization: strip leading `./` sequences and
/// any trailing `/`. A full lexical normalization would be unsafe, because
/// `a/../b` need not denote `b` in the presence of symlinks.
pub fn safe_norm_path(path: &str) -> &str {
    if path == "." {
        return "";
    }
    let mut p = path;
    while let Some(rest) = p.strip_prefix("./") {
        p = rest;
    }
    p.trim_end_matches('/')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_prefers_absolute_tail() {
        assert_eq!(join_paths("/a/b", "c.h"), "/a/b/c.h");
        assert_eq!(join_paths("/a/b/", "c.h"), "/a/b/c.h");
        assert_eq!(join_paths("/a", "/etc/hosts"), "/etc/hosts");
        assert_eq!(join_paths("", "c.h"), "c.h");
        assert_eq!(join3("/cwd", "sub/", "x.h"), "/cwd/sub/x.h");
        assert_eq!(join3("/cwd", "/abs/", "x.h"), "/abs/x.h");
    }

    #[test]
    fn dirname_matches_posix() {
        assert_eq!(dirname("/usr/include/foo/bar.h"), "/usr/include/foo");
        assert_eq!(dirname("foo.h"), "");
        assert_eq!(dirname("/bar.h"), "/");
        assert_eq!(dirname("a/b"), "a");
    }

    #[test]
    fn split_keeps_root() {
        assert_eq!(split_path("/a"), ("/", "a"));
        assert_eq!(split_path("a/b/c"), ("a/b", "c"));
        assert_eq!(split_path("plain"), ("", "plain"));
    }

    #[test]
    fn safe_norm_strips_dot_slash_and_trailing() {
        assert_eq!(safe_norm_path("."), "");
        assert_eq!(safe_norm_path("././a/"), "a");
        assert_eq!(safe_norm_path("/usr/include/"), "/usr/include");
        assert_eq!(safe_norm_path("a/b"), "a/b");
    }
}
