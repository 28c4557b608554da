//! Parsing of C and C++ compiler command lines.
//!
//! The argv is translated into the two search lists of the preprocessor,
//! the explicitly forced include files, the translation unit, an output
//! prefix, and the `-D` definitions. Option arguments come as a separate
//! word (`-I dir`), glued on (`-Idir`), or after an equals sign
//! (`--sysroot=dir`), and all three shapes are handled. Options irrelevant to
//! preprocessing are consumed with their argument where they take one, so
//! the argument is not mistaken for a source file.

use tracing::trace;

use crate::cache::{Caches, DirectoryIdx, IncludepathIdx};
use crate::compiler::CompilerDefaults;
use crate::error::{Error, Result};
use crate::paths::{join_paths, safe_norm_path};
use crate::timer::RequestTimer;

/// Source-file extension → language, per the compiler's own convention.
const TRANSLATION_UNIT_MAP: &[(&str, &str)] = &[
    ("c", "c"),
    ("i", "c"),
    ("cc", "c++"),
    ("cpp", "c++"),
    ("cxx", "c++"),
    ("C", "c++"),
    ("CXX", "c++"),
    ("ii", "c++"),
    ("m", "objective-c"),
    ("mi", "objective-c"),
    ("mm", "objective-c++"),
    ("M", "objective-c++"),
    ("mii", "objective-c++"),
];

const LANGUAGES: &[&str] = &["c", "c++", "objective-c", "objective-c++"];

/// Everything the analyzer needs to know about one compilation command.
#[derive(Debug)]
pub struct ParsedCommand {
    pub quote_dirs: Vec<DirectoryIdx>,
    pub angle_dirs: Vec<DirectoryIdx>,
    /// `-include`/`-imacros` files, resolved against the quote list.
    pub include_files: Vec<IncludepathIdx>,
    pub translation_unit: String,
    /// Absolute prefix for result files (`.d_approx` etc.); derived from
    /// `-o` or from the source name.
    pub result_file_prefix: String,
    /// `-D` definitions as `(name-or-lhs, value)` pairs.
    pub d_opts: Vec<(String, Option<String>)>,
}

// Transcript of the flags seen while walking the argv.
#[derive(Debug, Default)]
struct ParseState {
    nostdinc: bool,
    file_names: Vec<String>,
    quote_dirs: Vec<String>,        // -iquote
    include_files: Vec<String>,     // -include, -imacros
    i_dirs: Vec<String>,            // -I, -iwithprefixbefore
    before_system_dirs: Vec<String>, // -isystem
    after_system_dirs: Vec<String>, // -idirafter, -iwithprefix
    language: String,
    isysroot: String,
    sysroot: String,
    output_file: Option<String>,
    iprefix: String,
    d_opts: Vec<(String, Option<String>)>,
}

impl ParseState {
    fn new() -> Self {
        Self {
            language: "none".to_owned(),
            ..Self::default()
        }
    }

    fn include_sysroot(&self) -> &str {
        if !self.isysroot.is_empty() {
            &self.isysroot
        } else {
            &self.sysroot
        }
    }
}

// One-letter options taking an argument, glued or as the next word. The
// no-op letters are listed so "-L foo" never makes foo a source file.
const ONE_LETTER_OPTIONS: &str = "DIUoxAlFuLBVb";

// Options taking an argument glued on or as the next word. Longer names
// first, so glued matching never stops at a proper prefix.
const MAYBE_TWO_WORDS: &[&str] = &[
    "-iwithprefixbefore",
    "-iwithprefix",
    "-idirafter",
    "-imultilib",
    "-isysroot",
    "-isystem",
    "-imacros",
    "-include",
    "-iprefix",
    "-iquote",
    "-target",
    "-arch",
    "-MF",
    "-MT",
    "-MQ",
];
const MAYBE_TWO_WORDS_FIRST_LETTERS: &[char] = &['M', 'i', '-', 'a', 't'];

// Options whose argument is always the next word; all irrelevant to
// preprocessing but consumed so their arguments are not taken for files.
const ALWAYS_TWO_WORDS: &[&str] = &[
    "-Xpreprocessor",
    "-Xassembler",
    "-Xlinker",
    "-Xclang",
    "-aux-info",
    "--param",
];

fn split_macro_arg(arg: &str) -> (String, Option<String>) {
    match arg.find('=') {
        Some(pos) if pos > 0 => (arg[..pos].to_owned(), Some(arg[pos + 1..].to_owned())),
        _ => (arg.to_owned(), None),
    }
}

fn apply_one_letter(state: &mut ParseState, letter: char, arg: &str) -> Result<()> {
    match letter {
        'D' => state.d_opts.push(split_macro_arg(arg)),
        'I' => state.i_dirs.push(arg.to_owned()),
        'o' => state.output_file = Some(arg.to_owned()),
        'x' => state.language = arg.to_owned(),
        // The rest take an argument but do not affect preprocessing.
        'U' | 'A' | 'l' | 'F' | 'u' | 'L' | 'B' | 'V' | 'b' => {}
        _ => unreachable!("unhandled one-letter option -{letter}"),
    }
    Ok(())
}

fn apply_maybe_two_words(state: &mut ParseState, option: &str, arg: &str) -> Result<()> {
    match option {
        "-include" | "-imacros" => state.include_files.push(arg.to_owned()),
        "-idirafter" => state.after_system_dirs.push(arg.to_owned()),
        "-iprefix" => state.iprefix = arg.to_owned(),
        "-iwithprefix" => {
            state.after_system_dirs.push(join_paths(&state.iprefix, arg));
        }
        "-iwithprefixbefore" => {
            state.i_dirs.push(join_paths(&state.iprefix, arg));
        }
        "-isysroot" => state.isysroot = arg.to_owned(),
        "-isystem" => state.before_system_dirs.push(arg.to_owned()),
        "-iquote" => state.quote_dirs.push(arg.to_owned()),
        "-imultilib" => {
            return Err(Error::not_covered("-imultilib is not implemented."));
        }
        // -MF, -MT, -MQ, -arch, -target: argument consumed, nothing recorded.
        _ => {}
    }
    Ok(())
}

/// Parse `args` (a full compiler argv) into the searchdir lists and files,
/// probing the compiler's default dirs on first sight.
pub fn parse_command_args(
    args: &[String],
    current_dir: &str,
    caches: &mut Caches,
    compiler_defaults: &mut CompilerDefaults,
    timer: &mut RequestTimer,
) -> Result<ParsedCommand> {
    trace!("parse command {args:?}");
    if args.len() < 2 {
        return Err(Error::not_covered("Command line: too few arguments."));
    }
    let compiler = &args[0];
    let mut state = ParseState::new();

    let mut i = 1;
    while i < args.len() {
        let arg = &args[i];

        // Everything that is not a flag: a source file ('-' is stdin).
        if !arg.starts_with('-') || arg == "-" {
            if !arg.starts_with("\"-") {
                state.file_names.push(arg.clone());
            }
            i += 1;
            continue;
        }

        // One-letter options, the common case. The argument is either
        // glued on ("-Dfoo") or the next word ("-D foo"). No multi-letter
        // option name begins with a letter from the one-letter set, so this
        // test is safe before the two-word tables.
        let letter = arg[1..].chars().next().unwrap_or('\0');
        if arg.len() >= 2 && ONE_LETTER_OPTIONS.contains(letter) {
            let glued = &arg[2..];
            if !glued.is_empty() {
                apply_one_letter(&mut state, letter, glued)?;
                i += 1;
            } else {
                let value = args.get(i + 1).ok_or_else(|| missing_argument(arg))?;
                apply_one_letter(&mut state, letter, value)?;
                i += 2;
            }
            continue;
        }

        // Exact two-word options ("-MF foo", "-Xlinker foo").
        if MAYBE_TWO_WORDS.contains(&arg.as_str()) || ALWAYS_TWO_WORDS.contains(&arg.as_str()) {
            let value = args.get(i + 1).ok_or_else(|| missing_argument(arg))?;
            if MAYBE_TWO_WORDS.contains(&arg.as_str()) {
                apply_maybe_two_words(&mut state, arg, value)?;
            }
            i += 2;
            continue;
        }

        // Assignment-shaped options ("--sysroot=/mumble").
        if let Some((name, value)) = arg.split_once('=') {
            if name == "--sysroot" {
                state.sysroot = value.to_owned();
                i += 1;
                continue;
            }
        }

        // No-argument options we care about.
        if arg == "-nostdinc" {
            state.nostdinc = true;
            i += 1;
            continue;
        }
        if arg == "-undef" {
            i += 1;
            continue;
        }

        // Glued variants of the two-word options ("-MFfoo", "-includefoo").
        // Slowest, hence last.
        if MAYBE_TWO_WORDS_FIRST_LETTERS.contains(&letter) {
            if let Some(option) = MAYBE_TWO_WORDS.iter().find(|o| arg.starts_with(**o)) {
                apply_maybe_two_words(&mut state, option, &arg[option.len()..])?;
                i += 1;
                continue;
            }
        }

        // Whatever is left is an argument-less option that is safe to
        // ignore.
        i += 1;
    }

    // -I- (search-list splitting) changes quote semantics entirely.
    if state.i_dirs.iter().any(|d| d == "-") {
        return Err(Error::not_covered("-I- is not implemented. (Use -iquote instead.)"));
    }

    if state.file_names.len() != 1 {
        return Err(Error::not_covered(format!(
            "Could not locate name of translation unit: {:?}.",
            state.file_names
        )));
    }
    let source_file = state.file_names.pop().expect("one file name");

    let prefix = match &state.output_file {
        Some(output) => output.strip_suffix(".o").unwrap_or(output).to_owned(),
        None => match source_suffix(&source_file) {
            Some((stem, _)) => stem.to_owned(),
            None => source_file.clone(),
        },
    };
    let result_file_prefix = join_paths(current_dir, &prefix);

    if state.language == "none" {
        // No explicit -x flag (or '-x none'): the extension decides.
        let Some((_, language)) = source_suffix(&source_file) else {
            return Err(Error::not_covered(format!(
                "For source file '{source_file}': unrecognized filename extension"
            )));
        };
        state.language = language.to_owned();
    }
    if !LANGUAGES.contains(&state.language.as_str()) {
        return Err(Error::not_covered(format!(
            "Language '{}' is not supported.",
            state.language
        )));
    }

    let sysroot = state.include_sysroot().to_owned();
    compiler_defaults.set_system_dirs_defaults(
        compiler,
        &sysroot,
        &state.language,
        timer,
        &mut caches.canonical_path,
    )?;

    // String the lists together according to preprocessor semantics.
    let index_dirs = |dirs: &[String], caches: &mut Caches| -> Vec<DirectoryIdx> {
        dirs.iter()
            .map(|d| caches.directory_map.index(safe_norm_path(d)))
            .collect()
    };
    let mut angle_dirs = index_dirs(&state.i_dirs, caches);
    angle_dirs.extend(index_dirs(&state.before_system_dirs, caches));
    if !state.nostdinc {
        let defaults: Vec<String> = compiler_defaults
            .dirs_for(compiler, &sysroot, &state.language)
            .to_vec();
        angle_dirs.extend(index_dirs(&defaults, caches));
    }
    angle_dirs.extend(index_dirs(&state.after_system_dirs, caches));

    let mut quote_dirs = index_dirs(&state.quote_dirs, caches);
    quote_dirs.extend(&angle_dirs);

    // Forced include files may be absolute; the consumer rewrites their
    // location, so the sandbox restriction does not apply to them.
    let include_files = state
        .include_files
        .iter()
        .map(|f| caches.includepath_map.index_allowing_absolute(safe_norm_path(f)))
        .collect();

    Ok(ParsedCommand {
        quote_dirs,
        angle_dirs,
        include_files,
        translation_unit: source_file,
        result_file_prefix,
        d_opts: state.d_opts,
    })
}

fn missing_argument(option: &str) -> Error {
    Error::not_covered(format!("No argument found for option '{option}'"))
}

// The recognized extension of `source_file` and its language, with the
// stem. Extensions are case-sensitive: .C is C++, .c is C.
fn source_suffix(source_file: &str) -> Option<(&str, &str)> {
    let (stem, ext) = source_file.rsplit_once('.')?;
    let (_, language) = TRANSLATION_UNIT_MAP.iter().find(|(e, _)| *e == ext)?;
    Some((stem, language))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    // A stand-in compiler whose -v output advertises `sysdir` as the only
    // default search dir.
    fn fake_compiler(dir: &Path, sysdir: &Path) -> String {
        let path = dir.join("fakecc");
        std::fs::write(
            &path,
            format!(
                "#!/bin/sh\n\
                 echo '#include <...> search starts here:' >&2\n\
                 echo ' {}' >&2\n\
                 echo 'End of search list.' >&2\n",
                sysdir.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    struct Fixture {
        _tmp: tempfile::TempDir,
        caches: Caches,
        defaults: CompilerDefaults,
        timer: RequestTimer,
        compiler: String,
        sysdir: String,
        cwd: String,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let sysdir = tmp.path().join("sys");
        std::fs::create_dir(&sysdir).unwrap();
        let client_root = tmp.path().join("root");
        std::fs::create_dir(&client_root).unwrap();
        let compiler = fake_compiler(tmp.path(), &sysdir);
        let mut caches = Caches::new(&Config::default());
        let canonical_sysdir = caches.canonical_path.canonicalize(&sysdir.display().to_string());
        Fixture {
            _tmp: tmp,
            caches,
            defaults: CompilerDefaults::new(client_root),
            timer: RequestTimer::new(std::time::Duration::from_secs(60)),
            compiler,
            sysdir: canonical_sysdir,
            cwd: "/work".to_owned(),
        }
    }

    fn argv(f: &Fixture, rest: &[&str]) -> Vec<String> {
        std::iter::once(f.compiler.clone())
            .chain(rest.iter().map(|s| (*s).to_string()))
            .collect()
    }

    fn parse(f: &mut Fixture, rest: &[&str]) -> Result<ParsedCommand> {
        let args = argv(f, rest);
        parse_command_args(&args, &f.cwd, &mut f.caches, &mut f.defaults, &mut f.timer)
    }

    fn dir_strings(f: &Fixture, idxs: &[DirectoryIdx]) -> Vec<String> {
        idxs.iter().map(|&d| f.caches.directory_map.string(d).to_owned()).collect()
    }

    #[test]
    fn basic_compile() {
        let mut f = fixture();
        let parsed = parse(&mut f, &["-c", "a.c"]).unwrap();
        assert_eq!(parsed.translation_unit, "a.c");
        assert_eq!(parsed.result_file_prefix, "/work/a");
        // The angle list is exactly the compiler defaults.
        assert_eq!(dir_strings(&f, &parsed.angle_dirs), [format!("{}/", f.sysdir)]);
        assert_eq!(parsed.quote_dirs, parsed.angle_dirs);
    }

    #[test]
    fn search_list_assembly_order() {
        let mut f = fixture();
        let parsed = parse(
            &mut f,
            &[
                "-Ifirst", "-I", "second", "-isystem", "sys1", "-idirafter", "after1",
                "-iquote", "q1", "-c", "a.c",
            ],
        )
        .unwrap();
        let sys = format!("{}/", f.sysdir);
        assert_eq!(
            dir_strings(&f, &parsed.angle_dirs),
            ["first/", "second/", "sys1/", sys.as_str(), "after1/"]
        );
        // Quote list prepends -iquote dirs to the angle list.
        assert_eq!(
            dir_strings(&f, &parsed.quote_dirs),
            ["q1/", "first/", "second/", "sys1/", sys.as_str(), "after1/"]
        );
    }

    #[test]
    fn nostdinc_drops_defaults() {
        let mut f = fixture();
        let parsed = parse(&mut f, &["-nostdinc", "-Ionly", "-c", "a.c"]).unwrap();
        assert_eq!(dir_strings(&f, &parsed.angle_dirs), ["only/"]);
    }

    #[test]
    fn defines_in_all_shapes() {
        let mut f = fixture();
        let parsed = parse(&mut f, &["-DA=1", "-D", "B", "-DC=x=y", "-c", "a.c"]).unwrap();
        assert_eq!(
            parsed.d_opts,
            [
                ("A".to_owned(), Some("1".to_owned())),
                ("B".to_owned(), None),
                ("C".to_owned(), Some("x=y".to_owned())),
            ]
        );
    }

    #[test]
    fn include_files_are_collected() {
        let mut f = fixture();
        let parsed = parse(
            &mut f,
            &["-include", "pre.h", "-imacros", "macros.h", "-c", "a.c"],
        )
        .unwrap();
        let names: Vec<&str> = parsed
            .include_files
            .iter()
            .map(|&i| f.caches.includepath_map.string(i))
            .collect();
        assert_eq!(names, ["pre.h", "macros.h"]);
    }

    #[test]
    fn two_word_noops_consume_their_argument() {
        let mut f = fixture();
        // Without consumption, "map.txt" or "foo" would look like sources.
        let parsed = parse(
            &mut f,
            &["-Xlinker", "map.txt", "-aux-info", "foo", "-L", "libs", "-c", "a.c"],
        )
        .unwrap();
        assert_eq!(parsed.translation_unit, "a.c");
    }

    #[test]
    fn glued_two_word_options() {
        let mut f = fixture();
        let parsed = parse(&mut f, &["-includepre.h", "-MFdeps.d", "-c", "a.c"]).unwrap();
        let names: Vec<&str> = parsed
            .include_files
            .iter()
            .map(|&i| f.caches.includepath_map.string(i))
            .collect();
        assert_eq!(names, ["pre.h"]);
        assert_eq!(parsed.translation_unit, "a.c");
    }

    #[test]
    fn iprefix_composition() {
        let mut f = fixture();
        let parsed = parse(
            &mut f,
            &["-iprefix", "/pfx", "-iwithprefixbefore", "inc", "-iwithprefix", "late", "-c", "a.c"],
        )
        .unwrap();
        let dirs = dir_strings(&f, &parsed.angle_dirs);
        assert_eq!(dirs.first().map(String::as_str), Some("/pfx/inc/"));
        assert_eq!(dirs.last().map(String::as_str), Some("/pfx/late/"));
    }

    #[test]
    fn output_file_drives_prefix() {
        let mut f = fixture();
        let parsed = parse(&mut f, &["-c", "a.c", "-o", "build/out.o"]).unwrap();
        assert_eq!(parsed.result_file_prefix, "/work/build/out");
    }

    #[test]
    fn language_resolution() {
        let mut f = fixture();
        // Extension table, case-sensitive.
        assert!(parse(&mut f, &["-c", "x.cc"]).is_ok());
        assert!(parse(&mut f, &["-c", "x.mm"]).is_ok());
        // Explicit -x wins over an unknown extension.
        assert!(parse(&mut f, &["-x", "c", "-c", "x.weird"]).is_ok());
        // Unknown extension without -x is not covered.
        assert!(parse(&mut f, &["-c", "x.weird"]).is_err());
        // Unsupported explicit language is not covered.
        assert!(parse(&mut f, &["-x", "fortran", "-c", "x.f"]).is_err());
    }

    #[test]
    fn source_file_count_must_be_one() {
        let mut f = fixture();
        assert!(parse(&mut f, &["-c", "a.c", "b.c"]).is_err());
        assert!(parse(&mut f, &["-c"]).is_err());
    }

    #[test]
    fn dash_i_dash_is_rejected() {
        let mut f = fixture();
        let err = parse(&mut f, &["-I-", "-c", "a.c"]).unwrap_err();
        assert!(err.to_string().contains("-I-"));
    }

    #[test]
    fn missing_option_argument_is_rejected() {
        let mut f = fixture();
        let err = parse(&mut f, &["a.c", "-I"]).unwrap_err();
        assert!(err.to_string().contains("-I"));
    }

    #[test]
    fn sysroot_forms() {
        let mut f = fixture();
        let parsed = parse(&mut f, &["--sysroot=/alt", "-c", "a.c"]);
        assert!(parsed.is_ok());
        // -isysroot takes precedence over --sysroot; both are consumed.
        let parsed = parse(&mut f, &["--sysroot=/alt", "-isysroot", "/alt2", "-c", "a.c"]);
        assert!(parsed.is_ok());
    }

    #[test]
    fn probe_is_memoized_per_triple() {
        let mut f = fixture();
        parse(&mut f, &["-c", "a.c"]).unwrap();
        let compiler = f.compiler.clone();
        // Remove the fake compiler: a second parse must not re-probe.
        std::fs::remove_file(&compiler).unwrap();
        assert!(parse(&mut f, &["-c", "b.c"]).is_ok());
        // A different language forces a fresh probe, which now fails.
        assert!(parse(&mut f, &["-c", "b.cc"]).is_err());
    }
}
