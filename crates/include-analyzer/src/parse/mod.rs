//! Parsers: source-file directives and compiler command lines.

pub(crate) mod command;
pub(crate) mod directives;

pub use command::{ParsedCommand, parse_command_args};
pub use directives::{ParsedFile, insert_macro_def, parse_file};
