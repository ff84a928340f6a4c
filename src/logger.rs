//! File logging.
//!
//! [`init_logger`] writes every `tracing` event of the coordinator (and of the match threads,
//! which inherit its dispatcher) into `[year]-[month]-[day]_[hour]:[minute]:[second]_log.txt`.

use std::{fs::File, path::PathBuf};

use anyhow::Context;
use time::{macros::format_description, OffsetDateTime};
use tracing::{dispatcher::DefaultGuard, Level};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, FmtSubscriber};

/// Where and how much to log.
#[derive(Debug, Clone)]
pub struct LogSettings {
    /// Directory receiving the log file.
    pub dir: PathBuf,
    /// Most verbose level kept.
    pub level: Level,
}

impl Default for LogSettings {
    fn default() -> Self {
        LogSettings {
            dir: PathBuf::from("."),
            level: Level::TRACE,
        }
    }
}

/// Keeps the file subscriber installed. Dropping it restores the previous one.
#[derive(Debug)]
pub struct LoggerGuard {
    path: PathBuf,
    _default: DefaultGuard,
}

impl LoggerGuard {
    /// The log file.
    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

/// Installs a file subscriber as the default of the calling thread.
pub fn init_logger(settings: &LogSettings) -> anyhow::Result<LoggerGuard> {
    std::fs::create_dir_all(&settings.dir)
        .with_context(|| format!("cannot create log directory {}", settings.dir.display()))?;
    let path = settings.dir.join(log_file_name()?);
    let file = File::create(&path)
        .with_context(|| format!("cannot create log file {}", path.display()))?;
    let writer = BoxMakeWriter::new(file);

    // the local offset is unavailable on some multi-threaded hosts
    let local_offset = time::UtcOffset::current_local_offset().unwrap_or(time::UtcOffset::UTC);
    let timer = tracing_subscriber::fmt::time::OffsetTime::new(
        local_offset,
        format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"),
    );

    let subscriber = FmtSubscriber::builder()
        .with_max_level(settings.level)
        .with_ansi(false)
        .with_thread_names(true)
        .with_timer(timer)
        .with_writer(writer)
        .finish();

    let default = tracing::subscriber::set_default(subscriber);
    Ok(LoggerGuard {
        path,
        _default: default,
    })
}

fn log_file_name() -> anyhow::Result<String> {
    let format = format_description!("[year]-[month]-[day]_[hour]:[minute]:[second]_log.txt");
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    Ok(now.format(format)?)
}
