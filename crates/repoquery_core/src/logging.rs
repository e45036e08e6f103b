//! Process-wide file logging for the repository layer.
//!
//! Query and transaction events go through the `log` facade; this module only
//! wires a rotating `flexi_logger` backend behind it, once per process.
//!
//! # Invariants
//! - A second initialization with the same level and directory is a no-op;
//!   any other combination is rejected with `LoggingError::Conflict`.
//! - Panic payloads are flattened and capped before they reach the log, since
//!   they may carry statement text.

use crate::config::LoggingConfig;
use flexi_logger::{
    Cleanup, Criterion, FileSpec, FlexiLoggerError, LogSpecification, Logger, LoggerHandle,
    Naming, WriteMode,
};
use log::{error, info, LevelFilter};
use once_cell::sync::OnceCell;
use std::path::{Path, PathBuf};
use thiserror::Error;

const FILE_BASENAME: &str = "repoquery";
const ROTATE_AT_BYTES: u64 = 8 * 1024 * 1024;
const KEEP_FILES: usize = 4;
const PANIC_SUMMARY_CHARS: usize = 160;

static ACTIVE: OnceCell<ActiveLogger> = OnceCell::new();

struct ActiveLogger {
    level: LevelFilter,
    dir: PathBuf,
    _handle: LoggerHandle,
}

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("unsupported log level `{0}`; expected trace|debug|info|warn|error")]
    Level(String),
    #[error("log directory must be a non-empty absolute path, got `{0}`")]
    Directory(String),
    #[error("cannot create log directory `{}`: {source}", .dir.display())]
    CreateDirectory {
        dir: PathBuf,
        source: std::io::Error,
    },
    #[error("logger backend failed to start: {0}")]
    Backend(#[from] FlexiLoggerError),
    #[error("logging already runs at {active}; refusing {requested}")]
    Conflict { active: String, requested: String },
}

/// Starts file logging at `level` under the absolute directory `log_dir`.
///
/// # Errors
/// - `Level` / `Directory` for unusable arguments.
/// - `Conflict` when logging already runs with another level or directory.
pub fn init_logging(level: &str, log_dir: &str) -> Result<(), LoggingError> {
    let level = parse_level(level)?;
    let dir = absolute_dir(log_dir)?;
    let active = ACTIVE.get_or_try_init(|| start(level, &dir))?;
    if active.level != level || active.dir != dir {
        return Err(LoggingError::Conflict {
            active: describe(active.level, &active.dir),
            requested: describe(level, &dir),
        });
    }
    Ok(())
}

/// Starts logging when `config.dir` is set; reports whether it did.
pub fn init_from_config(config: &LoggingConfig) -> Result<bool, LoggingError> {
    let Some(dir) = config.dir.as_deref() else {
        return Ok(false);
    };
    init_logging(&config.level, dir)?;
    Ok(true)
}

/// `debug` for debug builds, `info` otherwise.
pub fn default_log_level() -> &'static str {
    if cfg!(debug_assertions) {
        "debug"
    } else {
        "info"
    }
}

fn start(level: LevelFilter, dir: &Path) -> Result<ActiveLogger, LoggingError> {
    std::fs::create_dir_all(dir).map_err(|source| LoggingError::CreateDirectory {
        dir: dir.to_path_buf(),
        source,
    })?;
    let handle = Logger::with(LogSpecification::builder().default(level).build())
        .log_to_file(FileSpec::default().directory(dir).basename(FILE_BASENAME))
        .rotate(
            Criterion::Size(ROTATE_AT_BYTES),
            Naming::Numbers,
            Cleanup::KeepLogFiles(KEEP_FILES),
        )
        .write_mode(WriteMode::BufferAndFlush)
        .append()
        .format_for_files(flexi_logger::detailed_format)
        .start()?;

    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic| {
        let location = panic
            .location()
            .map_or_else(|| "unknown".to_string(), |loc| format!("{}:{}", loc.file(), loc.line()));
        error!(
            "event=panic module=logging status=error location={location} payload={}",
            panic_summary(panic.payload())
        );
        previous(panic);
    }));

    info!(
        "event=logging_init module=logging status=ok level={} dir={} version={}",
        level.as_str().to_ascii_lowercase(),
        dir.display(),
        env!("CARGO_PKG_VERSION")
    );
    Ok(ActiveLogger {
        level,
        dir: dir.to_path_buf(),
        _handle: handle,
    })
}

fn parse_level(level: &str) -> Result<LevelFilter, LoggingError> {
    let trimmed = level.trim();
    let name = if trimmed.eq_ignore_ascii_case("warning") {
        "warn"
    } else {
        trimmed
    };
    match name.parse::<LevelFilter>() {
        Ok(LevelFilter::Off) | Err(_) => Err(LoggingError::Level(trimmed.to_string())),
        Ok(parsed) => Ok(parsed),
    }
}

fn absolute_dir(log_dir: &str) -> Result<PathBuf, LoggingError> {
    let path = Path::new(log_dir.trim());
    if path.as_os_str().is_empty() || !path.is_absolute() {
        return Err(LoggingError::Directory(log_dir.to_string()));
    }
    Ok(path.to_path_buf())
}

fn describe(level: LevelFilter, dir: &Path) -> String {
    format!("level={} dir={}", level.as_str().to_ascii_lowercase(), dir.display())
}

fn panic_summary(payload: &(dyn std::any::Any + Send)) -> String {
    let text = payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload");
    flatten(text, PANIC_SUMMARY_CHARS)
}

fn flatten(text: &str, max_chars: usize) -> String {
    let mut flat: String = text
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .take(max_chars)
        .collect();
    if text.chars().count() > max_chars {
        flat.push_str("...");
    }
    flat
}
