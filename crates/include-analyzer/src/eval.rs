//! Over-approximating evaluation of macro expressions.
//!
//! This follows CPP's expansion algorithm, except that every `#define` ever
//! seen counts as possibly live: we cannot know which ones a real
//! preprocessing run would have executed, because conditionals are not
//! modeled. Evaluation is therefore multi-valued. Given
//!
//! ```c
//! #define A x
//! #define A y
//! ```
//!
//! the expression `A.h` evaluates to the set `{A.h, x.h, y.h}`. The
//! unexpanded input is always a member, since "no applicable define ran" is
//! always one of the choices.
//!
//! Deviations from a conforming preprocessor, all deliberate: no whitespace
//! insertion, intermediate expansions are retokenized, and parentheses
//! inside single quotes are not special. Spurious extra expansions are
//! harmless; they at worst stage an unneeded file. A missing expansion would
//! make the remote compile fail and the caller fall back to local
//! preprocessing.

use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::cache::{Caches, DirectoryIdx, FilepathPair, RealpathIdx};
use crate::error::Result;
use crate::parse::directives::INCLUDE_STRING_RE;

// \B: a '#' inside a token sequence, i.e. the stringify operator.
static SINGLE_POUND_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\B#\s*(\S*)").unwrap());
static DOUBLE_POUND_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"##").unwrap());
pub(crate) static SYMBOL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\w+\b").unwrap());

/// One definition of a macro name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MacroDef {
    /// `#define NAME expansion`
    Object(String),
    /// `#define NAME(params...) body`
    Function(Vec<String>, String),
}

/// Macro name → every definition seen so far. All of them are treated as
/// possible.
pub type SymbolTable = HashMap<String, Vec<MacroDef>>;

/// The set of possible expansions of `expr` under `symbol_table`. Always
/// contains `expr` itself.
pub fn eval_expression(expr: &str, symbol_table: &SymbolTable) -> HashSet<String> {
    eval_helper(expr, symbol_table, &HashSet::new())
}

fn eval_helper(
    expr: &str,
    symbol_table: &SymbolTable,
    disabled: &HashSet<String>,
) -> HashSet<String> {
    let Some(m) = SYMBOL_RE.find(expr) else {
        // No symbol: the expression denotes only itself.
        return HashSet::from([expr.to_owned()]);
    };
    let symbol = m.as_str();
    let (args_list, args_end) = parse_args(expr, m.end());

    if !symbol_table.contains_key(symbol) {
        return prepend_to_set(
            &expr[..m.end()],
            eval_helper(&expr[m.end()..], symbol_table, disabled),
        );
    }

    // The unexpanded string is always a possible value.
    let mut value_set = HashSet::from([expr.to_owned()]);
    if disabled.contains(symbol) {
        return value_set;
    }

    for definition in &symbol_table[symbol] {
        // The choice where this definition does not apply.
        value_set.extend(prepend_to_set(
            &expr[..m.end()],
            eval_helper(&expr[m.end()..], symbol_table, disabled),
        ));
        match definition {
            MacroDef::Object(body) => {
                reeval_expansion(
                    &mut value_set,
                    &expr[..m.start()],
                    body,
                    &expr[m.end()..],
                    symbol,
                    symbol_table,
                    disabled,
                );
            }
            MacroDef::Function(params, body) => {
                // Needs an argument list whose length matches the formals;
                // mismatching invocations are dropped from the result set.
                let Some(args) = &args_list else { continue };
                if params.len() != args.len() {
                    continue;
                }
                let args_expanded: Vec<HashSet<String>> = args
                    .iter()
                    .map(|arg| eval_helper(arg, symbol_table, disabled))
                    .collect();
                // Cross-product substitution of actuals for formals.
                let mut expansions = vec![body.clone()];
                for (param, arg_set) in params.iter().zip(&args_expanded) {
                    expansions = expansions
                        .iter()
                        .flat_map(|e| arg_set.iter().map(|arg| substitute_symbol(param, arg, e)))
                        .collect();
                }
                for expansion in expansions {
                    let real_expansion = massage_pound_signs(&expansion);
                    reeval_expansion(
                        &mut value_set,
                        &expr[..m.start()],
                        &real_expansion,
                        &expr[args_end..],
                        symbol,
                        symbol_table,
                        disabled,
                    );
                }
            }
        }
    }
    value_set
}

/// Continue evaluation after substituting `expansion` for a matched macro.
///
/// The suffix is evaluated first, under the unchanged disabled set; then
/// `expansion` concatenated with each suffix value is evaluated with the
/// matched symbol disabled, which is the standard self-reference guard.
#[allow(clippy::too_many_arguments)]
fn reeval_expansion(
    value_set: &mut HashSet<String>,
    before: &str,
    expansion: &str,
    after: &str,
    symbol: &str,
    symbol_table: &SymbolTable,
    disabled: &HashSet<String>,
) {
    let mut now_disabled = disabled.clone();
    now_disabled.insert(symbol.to_owned());
    for after_expansion in eval_helper(after, symbol_table, disabled) {
        let combined = format!("{expansion}{after_expansion}");
        for value in eval_helper(&combined, symbol_table, &now_disabled) {
            value_set.insert(format!("{before}{value}"));
        }
    }
}

fn prepend_to_set(prefix: &str, set: HashSet<String>) -> HashSet<String> {
    set.into_iter().map(|s| format!("{prefix}{s}")).collect()
}

/// Substitute `actual` for whole-word occurrences of `formal` in `body`.
fn substitute_symbol(formal: &str, actual: &str, body: &str) -> String {
    let re = Regex::new(&format!(r"\b{}\b", regex::escape(formal))).expect("escaped pattern");
    re.replace_all(body, regex::NoExpand(actual)).into_owned()
}

/// Apply the `##` (concatenate) and `#` (stringify) operators.
fn massage_pound_signs(body: &str) -> String {
    let glued = DOUBLE_POUND_RE.replace_all(body, "");
    SINGLE_POUND_RE.replace_all(&glued, "\"${1}\"").into_owned()
}

/// Split a parenthesized argument list starting at byte `pos`.
///
/// Returns `(None, pos)` when `expr[pos..]` does not start with a balanced
/// `(`...`)` group. Otherwise returns the segments between top-level commas
/// and the position just past the closing parenthesis. Commas and
/// parentheses inside double quotes do not count; an escaped quote does not
/// close a string.
fn parse_args(expr: &str, pos: usize) -> (Option<Vec<String>>, usize) {
    let bytes = expr.as_bytes();
    if pos >= bytes.len() || bytes[pos] != b'(' {
        return (None, pos);
    }
    let mut open_parens = 0u32;
    let mut commas = vec![pos];
    let mut pos_end = None;
    let mut inside_quotes = false;
    for i in pos..bytes.len() {
        let c = bytes[i];
        if inside_quotes {
            if c == b'"' && bytes[i - 1] != b'\\' {
                inside_quotes = false;
            }
            continue;
        }
        match c {
            b',' if open_parens == 1 => commas.push(i),
            b'(' => open_parens += 1,
            b')' => {
                open_parens -= 1;
                if open_parens == 0 {
                    pos_end = Some(i);
                    break;
                }
            }
            b'"' if i == 0 || bytes[i - 1] != b'\\' => inside_quotes = true,
            _ => {}
        }
    }
    let Some(pos_end) = pos_end else {
        return (None, pos);
    };
    commas.push(pos_end);
    let args = commas
        .windows(2)
        .map(|w| expr[w[0] + 1..w[1]].to_owned())
        .collect();
    (Some(args), pos_end + 1)
}

/// Evaluate a computed-include expression and resolve its possible values.
///
/// Expansions of quote or angle include shape are resolved through the stat
/// cache (quotes against the including file's directory plus `quote_dirs`,
/// angles against `angle_dirs`). The identifiers of every non-include-shaped
/// expansion are returned as the symbols the result depends on; the caller
/// folds them into its support record.
#[allow(clippy::too_many_arguments)]
pub fn resolve_expr(
    caches: &mut Caches,
    expr: &str,
    currdir_idx: DirectoryIdx,
    file_dir_idx: DirectoryIdx,
    quote_dirs: &[DirectoryIdx],
    angle_dirs: &[DirectoryIdx],
    symbol_table: &SymbolTable,
) -> Result<(Vec<(FilepathPair, RealpathIdx)>, HashSet<String>)> {
    let mut resolved_files = Vec::new();
    let mut symbols = HashSet::new();
    for value in eval_expression(expr, symbol_table) {
        if let Some(caps) = INCLUDE_STRING_RE.captures(&value) {
            if let Some(quote) = caps.name("quote").filter(|m| !m.as_str().is_empty()) {
                let idx = caches.includepath_map.index(quote.as_str())?;
                if let Some(found) =
                    caches.resolve(idx, currdir_idx, Some(file_dir_idx), quote_dirs)
                {
                    resolved_files.push(found);
                }
            } else if let Some(angle) = caps.name("angle").filter(|m| !m.as_str().is_empty()) {
                let idx = caches.includepath_map.index(angle.as_str())?;
                if let Some(found) = caches.resolve(idx, currdir_idx, None, angle_dirs) {
                    resolved_files.push(found);
                }
            }
        } else {
            for m in SYMBOL_RE.find_iter(&value) {
                symbols.insert(m.as_str().to_owned());
            }
        }
    }
    Ok((resolved_files, symbols))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(defs: &[(&str, MacroDef)]) -> SymbolTable {
        let mut t = SymbolTable::new();
        for (name, def) in defs {
            t.entry((*name).to_owned()).or_insert_with(Vec::new).push(def.clone());
        }
        t
    }

    fn object(body: &str) -> MacroDef {
        MacroDef::Object(body.to_owned())
    }

    fn function(params: &[&str], body: &str) -> MacroDef {
        MacroDef::Function(params.iter().map(|p| (*p).to_owned()).collect(), body.to_owned())
    }

    #[test]
    fn result_always_contains_input() {
        let t = table(&[("A", object("x"))]);
        for expr in ["A", "A.B", "nothing_defined", "1 + 2"] {
            assert!(eval_expression(expr, &t).contains(expr), "identity lost for {expr}");
        }
    }

    #[test]
    fn multiple_definitions_cross_product() {
        let t = table(&[
            ("A", object("x")),
            ("A", object("y")),
            ("B", object("1")),
            ("B", object("2")),
        ]);
        let values = eval_expression("A.B", &t);
        for expected in ["x.1", "y.1", "x.2", "y.2", "A.B", "A.1", "x.B"] {
            assert!(values.contains(expected), "missing {expected} in {values:?}");
        }
    }

    #[test]
    fn object_like_chain() {
        let t = table(&[("HDR", object("\"hdr.h\""))]);
        let values = eval_expression("HDR", &t);
        assert!(values.contains("\"hdr.h\""));
        assert!(values.contains("HDR"));
    }

    #[test]
    fn self_reference_is_guarded() {
        // A expands to A: the disabled set stops the recursion.
        let t = table(&[("A", object("A"))]);
        let values = eval_expression("A", &t);
        assert_eq!(values, HashSet::from(["A".to_owned()]));
    }

    #[test]
    fn function_like_substitution() {
        let t = table(&[("CAT", function(&["x", "y"], "x ## y"))]);
        let values = eval_expression("CAT(foo,bar)", &t);
        // "x ## y" substitutes to "foo ## bar"; '##' deletion leaves the
        // surrounding spaces in place.
        assert!(values.contains("foo  bar"), "{values:?}");
        assert!(values.contains("CAT(foo,bar)"));
    }

    #[test]
    fn stringify_operator() {
        let t = table(&[("STR", function(&["x"], "#x"))]);
        let values = eval_expression("STR(abc)", &t);
        assert!(values.contains("\"abc\""), "{values:?}");
    }

    #[test]
    fn arity_mismatch_is_dropped() {
        let t = table(&[("F", function(&["a", "b"], "a b"))]);
        let values = eval_expression("F(1)", &t);
        // Only the unexpanded possibilities survive.
        assert!(values.contains("F(1)"));
        assert!(!values.iter().any(|v| v.contains("1 b") || v == "1"));
    }

    #[test]
    fn parse_args_handles_nesting_and_quotes() {
        let (args, end) = parse_args("(a,m(c, n(d)), c)rest", 0);
        assert_eq!(args, Some(vec!["a".to_owned(), "m(c, n(d))".to_owned(), " c".to_owned()]));
        assert_eq!(end, 17);

        let (args, _) = parse_args("(\"x,y\",z)", 0);
        assert_eq!(args, Some(vec!["\"x,y\"".to_owned(), "z".to_owned()]));

        assert_eq!(parse_args("no parens", 0), (None, 0));
        assert_eq!(parse_args("(unbalanced", 0), (None, 0));
    }

    #[test]
    fn empty_argument_list() {
        let (args, end) = parse_args("()", 0);
        assert_eq!(args, Some(vec![String::new()]));
        assert_eq!(end, 2);
    }

    #[test]
    fn massage_pound_signs_applies_both_operators() {
        assert_eq!(massage_pound_signs("a ## b"), "a  b");
        assert_eq!(massage_pound_signs("#x"), "\"x\"");
    }

    #[test]
    fn resolve_expr_resolves_and_reports_symbols() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("hdr.h"), "").unwrap();

        let config = crate::config::Config::default();
        let mut caches = Caches::new(&config);
        let cwd = std::env::current_dir().unwrap();
        let currdir = caches.directory_map.index(&cwd.display().to_string());
        let search = caches.directory_map.index(&tmp.path().display().to_string());

        let t = table(&[("HDR", object("\"hdr.h\""))]);
        let (files, symbols) = resolve_expr(
            &mut caches,
            "HDR",
            currdir,
            search,
            &[search],
            &[search],
            &t,
        )
        .unwrap();
        assert_eq!(files.len(), 1);
        // The unexpanded value "HDR" is not an include string, so the symbol
        // lands in the support set.
        assert!(symbols.contains("HDR"));
    }

    #[test]
    fn resolve_expr_unresolvable_yields_symbols_only() {
        let config = crate::config::Config::default();
        let mut caches = Caches::new(&config);
        let cwd = std::env::current_dir().unwrap();
        let currdir = caches.directory_map.index(&cwd.display().to_string());

        let t = SymbolTable::new();
        let (files, symbols) =
            resolve_expr(&mut caches, "MISSING_MACRO", currdir, currdir, &[], &[], &t).unwrap();
        assert!(files.is_empty());
        assert_eq!(symbols, HashSet::from(["MISSING_MACRO".to_owned()]));
    }
}
