//! Process-wide log output, owned by the supervisor and re-initialized on every
//! accepted configuration snapshot.
//!
//! The level and the destination file can both change at runtime. `reinit`
//! validates the new settings before touching anything, so a snapshot that
//! would break logging leaves the previous setup in place.
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing::Subscriber;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, Registry};

use crate::config::Config;

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("unknown log level {0:?}, expected one of DEBUG, INFO, ERROR")]
    UnknownLevel(String),
    #[error("failed to open log file {path}: {source}")]
    OpenFile { path: PathBuf, source: io::Error },
    #[error("failed to change the log level: {0}")]
    Reload(#[from] reload::Error),
    #[error("failed to install the log subscriber: {0}")]
    Install(String),
}

/// Map a configured level name to a filter. Matching ignores case.
pub fn parse_level(name: &str) -> Result<LevelFilter, LoggingError> {
    match name.trim().to_ascii_uppercase().as_str() {
        "" | "DEBUG" => Ok(LevelFilter::DEBUG),
        "INFO" => Ok(LevelFilter::INFO),
        "ERROR" => Ok(LevelFilter::ERROR),
        _ => Err(LoggingError::UnknownLevel(name.to_owned())),
    }
}

struct OpenLog {
    path: PathBuf,
    file: File,
}

/// Shared destination of the fmt layer: an append-only file, or stdout when
/// no file is configured.
#[derive(Clone, Default)]
pub struct LogSink {
    target: Arc<Mutex<Option<OpenLog>>>,
}

impl LogSink {
    /// Point the sink at `filename`. The file is only reopened when the name changes.
    fn point_to(&self, filename: &str) -> Result<bool, LoggingError> {
        let mut target = self
            .target
            .lock()
            .map_err(|_| LoggingError::Install("poisoned log sink".to_owned()))?;

        let wanted = (!filename.is_empty()).then(|| PathBuf::from(filename));
        let current = target.as_ref().map(|open| open.path.as_path());
        if current == wanted.as_deref() {
            return Ok(false);
        }

        *target = match wanted {
            Some(path) => Some(OpenLog {
                file: open_append(&path)?,
                path,
            }),
            None => None,
        };
        Ok(true)
    }

    pub fn current_path(&self) -> Option<PathBuf> {
        self.target
            .lock()
            .ok()
            .and_then(|target| target.as_ref().map(|open| open.path.clone()))
    }
}

fn open_append(path: &Path) -> Result<File, LoggingError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| LoggingError::OpenFile {
            path: path.to_owned(),
            source,
        })
}

pub struct LogSinkWriter<'a> {
    sink: &'a LogSink,
}

impl Write for LogSinkWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut target = self
            .sink
            .target
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "poisoned log sink"))?;
        match target.as_mut() {
            Some(open) => open.file.write(buf),
            None => io::stdout().write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut target = self
            .sink
            .target
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "poisoned log sink"))?;
        match target.as_mut() {
            Some(open) => open.file.flush(),
            None => io::stdout().flush(),
        }
    }
}

impl<'a> MakeWriter<'a> for LogSink {
    type Writer = LogSinkWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        LogSinkWriter { sink: self }
    }
}

/// Handle on the installed subscriber: the only way to change level or destination.
pub struct Logging {
    level: reload::Handle<LevelFilter, Registry>,
    sink: LogSink,
}

impl Logging {
    /// Build the subscriber without installing it. The caller keeps the subscriber
    /// alive for as long as the returned `Logging` is used.
    pub fn new() -> (Self, impl Subscriber + Send + Sync + 'static) {
        let (filter, level) = reload::Layer::new(LevelFilter::DEBUG);
        let sink = LogSink::default();
        let subscriber = tracing_subscriber::registry().with(filter).with(
            fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(sink.clone()),
        );
        (Self { level, sink }, subscriber)
    }

    /// Install the subscriber process-wide and apply `config` to it.
    pub fn install(config: &Config) -> Result<Self, LoggingError> {
        let (mut logging, subscriber) = Self::new();
        subscriber
            .try_init()
            .map_err(|e| LoggingError::Install(e.to_string()))?;
        logging.reinit(config)?;
        Ok(logging)
    }

    /// Apply the level and file of a new snapshot. On error nothing has changed.
    pub fn reinit(&mut self, config: &Config) -> Result<(), LoggingError> {
        let level = parse_level(&config.log_level)?;
        let reopened = self.sink.point_to(&config.log_filename)?;
        self.level.reload(level)?;

        info!(
            level = %level,
            file = %config.log_filename,
            reopened,
            "logging configured"
        );
        Ok(())
    }

    pub fn level(&self) -> Option<LevelFilter> {
        self.level.clone_current()
    }

    pub fn sink(&self) -> &LogSink {
        &self.sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;

    fn config(level: &str, filename: &str) -> Config {
        let yaml = format!(
            "reload_config_interval: 1\nlog_level: {:?}\nlog_filename: {:?}\n",
            level, filename
        );
        Config::from_yaml(&yaml, Path::new("test.yaml")).unwrap()
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("debug").unwrap(), LevelFilter::DEBUG);
        assert_eq!(parse_level("Info").unwrap(), LevelFilter::INFO);
        assert_eq!(parse_level("ERROR").unwrap(), LevelFilter::ERROR);
        assert_eq!(parse_level("").unwrap(), LevelFilter::DEBUG);
        assert!(matches!(
            parse_level("verbose"),
            Err(LoggingError::UnknownLevel(level)) if level == "verbose"
        ));
    }

    #[test]
    fn test_reinit_changes_level_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first.log");
        let second = dir.path().join("second.log");

        let (mut logging, subscriber) = Logging::new();
        let _guard = tracing::subscriber::set_default(subscriber);

        logging
            .reinit(&config("info", first.to_str().unwrap()))
            .unwrap();
        assert_eq!(logging.level(), Some(LevelFilter::INFO));
        assert_eq!(logging.sink().current_path(), Some(first.clone()));
        tracing::info!("goes to the first file");
        tracing::debug!("filtered out");

        logging
            .reinit(&config("error", second.to_str().unwrap()))
            .unwrap();
        assert_eq!(logging.level(), Some(LevelFilter::ERROR));
        tracing::error!("goes to the second file");

        let first_contents = fs::read_to_string(&first).unwrap();
        assert!(first_contents.contains("goes to the first file"));
        assert!(!first_contents.contains("filtered out"));
        assert!(!first_contents.contains("second file"));
        let second_contents = fs::read_to_string(&second).unwrap();
        assert!(second_contents.contains("goes to the second file"));
    }

    #[test]
    fn test_failed_reinit_keeps_previous_setup() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("monitor.log");

        let (mut logging, subscriber) = Logging::new();
        let _guard = tracing::subscriber::set_default(subscriber);
        logging
            .reinit(&config("info", log.to_str().unwrap()))
            .unwrap();

        let unknown_level = logging.reinit(&config("chatty", "elsewhere.log"));
        assert!(matches!(unknown_level, Err(LoggingError::UnknownLevel(_))));
        assert_eq!(logging.level(), Some(LevelFilter::INFO));
        assert_eq!(logging.sink().current_path(), Some(log.clone()));

        let unopenable = dir.path().join("missing-dir").join("monitor.log");
        let bad_file = logging.reinit(&config("error", unopenable.to_str().unwrap()));
        assert!(matches!(bad_file, Err(LoggingError::OpenFile { .. })));
        assert_eq!(logging.level(), Some(LevelFilter::INFO));
        assert_eq!(logging.sink().current_path(), Some(log));
    }

    #[test]
    fn test_empty_filename_logs_to_stdout() {
        let (mut logging, _subscriber) = Logging::new();
        logging.reinit(&config("debug", "")).unwrap();
        assert_eq!(logging.sink().current_path(), None);
    }
}
