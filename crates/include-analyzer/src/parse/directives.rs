//! A very fast directives-only parser for C and C++ source.
//!
//! Only four directives matter to closure analysis:
//!
//! - `#include`, the standard inclusion mechanism
//! - `#include_next`, a GNU extension
//! - `#import`, the Objective-C variant of `#include`
//! - `#define`, because defines can change what `#include MACRO` means
//!
//! Everything else, including conditionals, is ignored. Parsing is two
//! staged: a coarse scan finds a directive keyword anywhere in the file,
//! then the containing logical line is re-matched against a strict pattern
//! that tolerates block comments and backslash-newline continuations.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::cache::{Caches, IncludepathIdx};
use crate::error::{Error, Result};
use crate::eval::{MacroDef, SymbolTable};
use crate::graph::support::Support;

// Coarse scan: a candidate directive keyword anywhere.
static RE_INCLUDE_DEFINE: Lazy<Regex> =
    Lazy::new(|| Regex::new("include|define|import").unwrap());

// Accept the start of a directive line: optional end of a block comment
// spilling over from the previous line, then whole block comments, then the
// pound sign and keyword.
static POUND_PREFIX_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?x)
        ^[\ \t]*
        (?:\*/)?
        [\ \t]*
        (?:/\*[^\n]*\*/)*
        [\ \t]*
        (?P<directive>\#[\ \t]*(?:include_next|include|import|define))\b",
    )
    .unwrap()
});

// A macro invocation or definition LHS: a symbol, optionally followed by a
// parenthesized parameter list with no nested parentheses.
const MACRO_EXPR: &str = r#"(?P<symbol>\w+)(?:\s*\(\s*(?P<args>[^(),]*(?:,[^(),]*)*)\))?"#;

static MACRO_EXPR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(MACRO_EXPR).unwrap());

// The precise parser for a directive line, applied after continuations and
// paired comments are removed.
static DIRECTIVE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r#"(?x)
        ^[\ \t]*
        \#
        [\ \t]*
        (?:
          (?P<include>include_next|include|import)
          \s*
          (?:
            "(?P<quote>(?:\w|[_/.,+-])*)"
            |
            <(?P<angle>(?:\w|[_/.,+-])*)>
            |
            (?P<expr>.*?)
          )
          |
          (?P<define>define)\s+(?P<lhs>{MACRO_EXPR})\s*(?P<rhs>.*?)
        )
        \s*
        (?:(?:/\*|//).*)?
        $"#
    ))
    .unwrap()
});

// The shape a computed include must evaluate to before it is resolved.
pub(crate) static INCLUDE_STRING_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?x)
        ^\s*
        (?:
          "\s*(?P<quote>(?:\w|[\\_/.,+-])*)\s*"
          |
          <\s*(?P<angle>(?:\w|[\\_/.,+-])*)\s*>
        )
        \s*$"#,
    )
    .unwrap()
});

static BACKSLASH_NEWLINE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\\\n").unwrap());
static PAIRED_COMMENT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"/\*.*?\*/").unwrap());

/// The directives of one source file, in source order within each kind.
#[derive(Debug, Clone, Default)]
pub struct ParsedFile {
    pub quote_includes: Vec<IncludepathIdx>,
    pub angle_includes: Vec<IncludepathIdx>,
    /// Raw computed-include expressions, e.g. the `HDR` of `#include HDR`.
    pub expr_includes: Vec<String>,
    /// `#include_next` operands; quote and angle variants are conflated and
    /// both later searched against the quote list.
    pub next_includes: Vec<IncludepathIdx>,
}

/// Insert a `#define` into the symbol table.
///
/// `lhs` is `NAME` or `NAME(param, ...)`; the latter makes a function-like
/// definition. Every insertion invalidates the support records that mention
/// the name, since the meaning of computed includes may have changed.
pub fn insert_macro_def(
    lhs: &str,
    rhs: &str,
    symbol_table: &mut SymbolTable,
    support: &mut Support,
) -> Result<()> {
    let caps = MACRO_EXPR_RE
        .captures(lhs)
        .filter(|c| {
            let m = c.get(0).expect("whole match");
            m.start() == 0 && m.end() == lhs.len()
        })
        .ok_or_else(|| {
            Error::not_covered(format!("Unexpected macro definition with LHS: '{lhs}'."))
        })?;
    let name = caps.name("symbol").expect("symbol group").as_str();
    let def = match caps.name("args") {
        Some(args) => MacroDef::Function(
            args.as_str().split(',').map(|p| p.trim().to_owned()).collect(),
            rhs.to_owned(),
        ),
        None => MacroDef::Object(rhs.to_owned()),
    };
    symbol_table.entry(name.to_owned()).or_default().push(def);
    support.invalidate(name);
    Ok(())
}

/// Parse `filepath` for directives, updating the symbol table as `#define`s
/// are encountered.
pub fn parse_file(
    filepath: &str,
    caches: &mut Caches,
    symbol_table: &mut SymbolTable,
    support: &mut Support,
) -> Result<ParsedFile> {
    tracing::trace!("parse file {filepath}");
    let bytes = std::fs::read(filepath)
        .map_err(|e| Error::not_covered(format!("Parse file: '{filepath}': {e}")))?;
    // Latin-1 decode: every byte maps to the code point of the same value,
    // so headers in any 8-bit encoding scan fine.
    let contents: String = bytes.iter().map(|&b| b as char).collect();

    let mut parsed = ParsedFile::default();
    let mut search_pos = 0;
    let mut last_line_start = usize::MAX;

    while let Some(found) = RE_INCLUDE_DEFINE.find_at(&contents, search_pos) {
        search_pos = found.end();
        // Back up to the start of the containing line.
        let line_start = contents[..found.end()].rfind('\n').map(|p| p + 1).unwrap_or(0);
        if line_start == last_line_start {
            continue;
        }
        last_line_start = line_start;

        let Some(prefix) = POUND_PREFIX_RE.captures(&contents[line_start..]) else {
            continue;
        };
        let directive_start = line_start + prefix.name("directive").expect("directive").start();
        let directive_end = logical_line_end(&contents, directive_start);
        let unfolded =
            BACKSLASH_NEWLINE_RE.replace_all(&contents[directive_start..directive_end], "");
        let cleaned = PAIRED_COMMENT_RE.replace_all(&unfolded, "");
        let Some(caps) = DIRECTIVE_RE.captures(&cleaned) else {
            continue;
        };
        parse_directive(&caps, filepath, caches, symbol_table, support, &mut parsed)?;
    }
    Ok(parsed)
}

fn parse_directive(
    caps: &regex::Captures<'_>,
    filepath: &str,
    caches: &mut Caches,
    symbol_table: &mut SymbolTable,
    support: &mut Support,
    parsed: &mut ParsedFile,
) -> Result<()> {
    let group = |name: &str| {
        caps.name(name).map(|m| m.as_str()).filter(|s| !s.is_empty())
    };
    if let Some(kind) = caps.name("include") {
        let index = |caches: &mut Caches, operand: &str| {
            caches
                .includepath_map
                .index(operand)
                .map_err(|e| e.with_file(filepath))
        };
        match kind.as_str() {
            "include" | "import" => {
                if let Some(quote) = group("quote") {
                    parsed.quote_includes.push(index(caches, quote)?);
                } else if let Some(angle) = group("angle") {
                    parsed.angle_includes.push(index(caches, angle)?);
                } else if let Some(expr) = group("expr") {
                    parsed.expr_includes.push(expr.trim_end().to_owned());
                }
            }
            "include_next" => {
                // Both variants are conservatively treated as quote-style.
                if let Some(quote) = group("quote") {
                    parsed.next_includes.push(index(caches, quote)?);
                } else if let Some(angle) = group("angle") {
                    parsed.next_includes.push(index(caches, angle)?);
                } else if group("expr").is_some() {
                    // Routing include_next is intractable under multi-valued
                    // expansion.
                    return Err(Error::not_covered(
                        "For include_next: cannot deal with computed include here.",
                    )
                    .with_file(filepath));
                }
            }
            _ => unreachable!("directive keyword {kind:?}"),
        }
    } else if caps.name("define").is_some() {
        let Some(lhs) = caps.name("lhs").map(|m| m.as_str()) else {
            return Err(
                Error::not_covered("Unexpected macro definition with no LHS.").with_file(filepath)
            );
        };
        let rhs = caps.name("rhs").map(|m| m.as_str()).unwrap_or("");
        insert_macro_def(lhs, rhs, symbol_table, support).map_err(|e| e.with_file(filepath))?;
    }
    Ok(())
}

// End of the logical line beginning at `start`: the first newline not
// preceded by a backslash.
fn logical_line_end(contents: &str, start: usize) -> usize {
    let bytes = contents.as_bytes();
    let mut i = start;
    while i < bytes.len() {
        if bytes[i] == b'\n' && (i == start || bytes[i - 1] != b'\\') {
            return i;
        }
        i += 1;
    }
    bytes.len()
}
