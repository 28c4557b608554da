use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::Serialize;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use include_analyzer::{Analyzer, Config};

#[derive(Parser, Debug)]
#[command(name = "include-analyzer", version, about)]
struct Args {
    #[arg(long, short)]
    verbose: bool,

    #[arg(long)]
    log_file: Option<String>,

    /// Working directory of the compilation (defaults to the current one).
    #[arg(long)]
    dir: Option<PathBuf>,

    /// Debug bitmask: 1 warnings, 2/4/8 trace levels, 16 data.
    #[arg(long, default_value_t = 1)]
    debug_pattern: u32,

    /// Tolerate absolute includepaths by silently skipping them.
    #[arg(long)]
    unsafe_absolute_includes: bool,

    /// Do not emit placeholder files for must-exist directories.
    #[arg(long)]
    no_force_dirs: bool,

    /// Glob whose changes flush all caches; may be repeated.
    #[arg(long = "stat-reset-trigger")]
    stat_reset_triggers: Vec<String>,

    /// Warn when a resolved realpath matches this expression.
    #[arg(long)]
    path_observation_re: Option<String>,

    /// Also run the real preprocessor and compare dependency sets.
    #[arg(long)]
    verify: bool,

    /// Write the computed closure next to the output file.
    #[arg(long)]
    write_include_closure: bool,

    /// Per-request time quota in seconds.
    #[arg(long)]
    time_quota: Option<f64>,

    /// Emit the response as JSON instead of one path per line.
    #[arg(long)]
    json: bool,

    /// The compiler command to analyze, e.g. `gcc -I. -c foo.c`.
    #[arg(trailing_var_arg = true, required = true)]
    command: Vec<String>,
}

/// The analyzer's answer for one compilation, in machine-readable form. An
/// empty file list means "preprocess locally".
#[derive(Serialize)]
struct Response<'a> {
    files: &'a [PathBuf],
}

fn default_log_path() -> PathBuf {
    if let Some(home) = std::env::var_os("HOME") {
        let dir = PathBuf::from(home).join(".include-analyzer");
        if std::fs::create_dir_all(&dir).is_ok() {
            return dir.join("include-analyzer.log");
        }
    }
    std::env::temp_dir().join("include-analyzer.log")
}

fn main() {
    let args = Args::parse();

    let stderr_filter = if args.verbose {
        EnvFilter::new("include_analyzer=trace")
    } else {
        EnvFilter::new("include_analyzer=warn")
    };
    let file_filter = if args.verbose {
        EnvFilter::new("include_analyzer=trace")
    } else {
        EnvFilter::new("include_analyzer=info")
    };

    let log_path = args.log_file.as_ref().map(PathBuf::from).unwrap_or_else(default_log_path);
    let file_appender = tracing_appender::rolling::never(
        log_path.parent().unwrap_or(std::path::Path::new(".")),
        log_path
            .file_name()
            .unwrap_or(std::ffi::OsStr::new("include-analyzer.log")),
    );
    let file_layer = fmt::layer()
        .with_writer(file_appender)
        .with_ansi(false)
        .with_target(false)
        .with_filter(file_filter);
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(false)
        .with_filter(stderr_filter);
    tracing_subscriber::registry().with(file_layer).with(stderr_layer).init();

    let path_observation_re = args.path_observation_re.as_deref().map(|expr| {
        regex::Regex::new(expr).unwrap_or_else(|e| {
            error!("bad --path-observation-re: {e}");
            std::process::exit(2);
        })
    });
    let mut config = Config {
        debug_pattern: args.debug_pattern,
        unsafe_absolute_includes: args.unsafe_absolute_includes,
        no_force_dirs: args.no_force_dirs,
        stat_reset_triggers: args.stat_reset_triggers,
        path_observation_re,
        verify: args.verify,
        write_include_closure: args.write_include_closure,
        ..Config::default()
    };
    if let Some(quota) = args.time_quota {
        config.user_time_quota = Duration::from_secs_f64(quota);
    }

    let currdir = args
        .dir
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("/"));

    let mut analyzer = match Analyzer::new(config) {
        Ok(analyzer) => analyzer,
        Err(e) => {
            error!("startup failed: {e}");
            std::process::exit(1);
        }
    };
    info!(
        "analyzing in {}: {}",
        currdir.display(),
        args.command.join(" ")
    );

    match analyzer.process_request(&currdir, &args.command) {
        Ok(files) => {
            if args.json {
                match serde_json::to_string_pretty(&Response { files: &files }) {
                    Ok(json) => println!("{json}"),
                    Err(e) => {
                        error!("cannot encode response: {e}");
                        std::process::exit(1);
                    }
                }
            } else {
                for file in &files {
                    println!("{}", file.display());
                }
            }
            if files.is_empty() && !args.json {
                // The caller should preprocess locally; the warning naming
                // the reason has already been logged.
                std::process::exit(3);
            }
        }
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    }
}
