//! Session logger: a `log` backend that writes to a single file in the OS
//! data directory.
//!
//! The file is **truncated (overwritten) at each launch**, so it only ever
//! contains output from the most-recent session.
//!
//! Log location (`dirs::data_dir()`):
//!   Windows:  `%APPDATA%\LayerCraft\layercraft.log`
//!   Linux:    `~/.local/share/LayerCraft/layercraft.log`
//!   macOS:    `~/Library/Application Support/LayerCraft/layercraft.log`
//!
//! Use the `log` macros (`log::info!`, `log::warn!`, ...) anywhere in the
//! crate.  The level comes from `LAYERCRAFT_LOG` (default `info`).  Panics
//! are mirrored to the file by a hook installed in [`init`].

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{Level, LevelFilter, Log, Metadata, Record};

pub const LEVEL_ENV: &str = "LAYERCRAFT_LOG";

static LOGGER: OnceLock<SessionLogger> = OnceLock::new();

struct SessionLogger {
    file: Option<Mutex<File>>,
    path: Option<PathBuf>,
    level: LevelFilter,
    /// Also echo warnings and errors to stderr.
    echo: bool,
}

impl Log for SessionLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format!(
            "[{}] [{}] {}: {}",
            timestamp(),
            record.level(),
            record.target(),
            record.args()
        );
        self.write_line(&line);
        if self.echo && record.level() <= Level::Warn {
            eprintln!("{line}");
        }
    }

    fn flush(&self) {
        if let Some(mutex) = &self.file
            && let Ok(mut file) = mutex.lock()
        {
            let _ = file.flush();
        }
    }
}

impl SessionLogger {
    /// Silently ignores I/O errors so that logging never fails the caller.
    fn write_line(&self, line: &str) {
        if let Some(mutex) = &self.file
            && let Ok(mut file) = mutex.lock()
        {
            let _ = writeln!(file, "{}", line);
        }
    }
}

/// Returns the path to the current session log file.
pub fn log_path() -> Option<&'static Path> {
    LOGGER.get().and_then(|l| l.path.as_deref())
}

/// Initialise the session logger at the default location.
pub fn init(verbose: bool) {
    init_at(log_file_path(), verbose);
}

/// Initialise the session logger writing to `path`.  Only the first call in
/// a process has any effect.
///
/// * Creates (or truncates) the log file.
/// * Installs a panic hook that writes the panic message to the log before
///   propagating to the default handler.
pub fn init_at(path: PathBuf, verbose: bool) {
    if LOGGER.get().is_some() {
        return;
    }

    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    let file = match OpenOptions::new().create(true).write(true).truncate(true).open(&path) {
        Ok(f) => Some(Mutex::new(f)),
        Err(e) => {
            // not fatal: keep the stderr echo only
            eprintln!("[logger] Failed to open log file {:?}: {}", path, e);
            None
        }
    };

    let level = if verbose {
        LevelFilter::Debug
    } else {
        level_from_env(std::env::var(LEVEL_ENV).ok().as_deref())
    };
    let logger = SessionLogger {
        path: file.as_ref().map(|_| path.clone()),
        file,
        level,
        echo: true,
    };
    if LOGGER.set(logger).is_err() {
        return;
    }
    let Some(logger) = LOGGER.get() else { return };
    if log::set_logger(logger).is_err() {
        // another backend was installed first
        return;
    }
    log::set_max_level(level);

    logger.write_line(&format!("=== LayerCraft session started {} ===", human_timestamp()));
    logger.write_line(&format!("Log file: {}", path.display()));
    logger.write_line("");

    // Install panic hook: mirror panic info to the log, then run the default handler
    let prev = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        if let Some(logger) = LOGGER.get() {
            logger.write_line(&format!("[{}] [PANIC] {}", timestamp(), info));
        }
        prev(info);
    }));
}

fn level_from_env(value: Option<&str>) -> LevelFilter {
    value
        .and_then(|v| v.trim().parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Info)
}

fn log_file_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("LayerCraft")
        .join("layercraft.log")
}

/// HH:MM:SS within the current UTC day.
fn timestamp() -> String {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => {
            let secs = d.as_secs();
            let h = (secs % 86400) / 3600;
            let m = (secs % 3600) / 60;
            let s = secs % 60;
            format!("{:02}:{:02}:{:02}", h, m, s)
        }
        Err(_) => "??:??:??".to_string(),
    }
}

fn human_timestamp() -> String {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => format!("(unix {})", d.as_secs()),
        Err(_) => "(unknown time)".to_string(),
    }
}
