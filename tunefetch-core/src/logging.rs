use std::io;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::{fmt, util::SubscriberInitExt, EnvFilter};

use crate::config::{data_dir, LogLevel, LogSettings};

const LOG_FILE_PREFIX: &str = "tunefetch.log";
const FILTER_ENV: &str = "TUNEFETCH_LOG";
// HTTP internals are noisy at debug level while streaming pages and covers.
const QUIET_TARGETS: [&str; 3] = ["hyper=warn", "reqwest=warn", "rustls=warn"];

// Linux: ~/.local/share/tunefetch/logs
// macOS: ~/Library/Application Support/com.tunefetch.tunefetch/logs
// Windows: %APPDATA%\tunefetch\tunefetch\data\logs
static DEFAULT_LOG_DIR: Lazy<PathBuf> = Lazy::new(|| data_dir().join("logs"));

/// Keeps the non-blocking file writer alive. Dropping it flushes the log.
pub struct LogManager {
    _guard: Option<WorkerGuard>,
    level: Level,
    file_dir: Option<PathBuf>,
}

impl LogManager {
    pub fn builder() -> LogManagerBuilder {
        LogManagerBuilder::default()
    }

    pub fn level(&self) -> Level {
        self.level
    }

    /// Directory of the rolling log file, if file logging is on.
    pub fn file_dir(&self) -> Option<&Path> {
        self.file_dir.as_deref()
    }
}

pub struct LogManagerBuilder {
    level: Level,
    file_dir: Option<PathBuf>,
    stdout: bool,
}

impl Default for LogManagerBuilder {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            file_dir: Some(DEFAULT_LOG_DIR.clone()),
            stdout: true,
        }
    }
}

impl LogManagerBuilder {
    pub fn with_settings(mut self, settings: &LogSettings) -> Self {
        self.level = level_from_config(&settings.level);
        if !settings.enabled {
            self.file_dir = None;
        }
        self
    }

    pub fn level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn file_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.file_dir = dir;
        self
    }

    pub fn stdout(mut self, enabled: bool) -> Self {
        self.stdout = enabled;
        self
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_env(FILTER_ENV).unwrap_or_else(|_| {
            QUIET_TARGETS
                .iter()
                .filter_map(|directive| directive.parse::<Directive>().ok())
                .fold(EnvFilter::default().add_directive(self.level.into()), |filter, directive| {
                    filter.add_directive(directive)
                })
        })
    }

    /// Installs the global subscriber. Fails if one is already installed.
    pub fn build(self) -> io::Result<LogManager> {
        let (file_layer, guard) = match &self.file_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
                let (writer, guard) = tracing_appender::non_blocking(appender);
                let layer = fmt::layer().with_writer(writer).with_ansi(false);
                (Some(layer), Some(guard))
            }
            None => (None, None),
        };
        let stdout_layer = self.stdout.then(|| fmt::layer().with_target(true));

        tracing_subscriber::registry()
            .with(file_layer.with_filter(self.filter()))
            .with(stdout_layer.with_filter(self.filter()))
            .try_init()
            .map_err(|error| io::Error::new(io::ErrorKind::AlreadyExists, error.to_string()))?;

        Ok(LogManager {
            _guard: guard,
            level: self.level,
            file_dir: self.file_dir,
        })
    }
}

fn level_from_config(level: &LogLevel) -> Level {
    match level {
        LogLevel::Error => Level::ERROR,
        LogLevel::Warn => Level::WARN,
        LogLevel::Info => Level::INFO,
        LogLevel::Debug => Level::DEBUG,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_settings_turn_off_the_file_layer() {
        let settings = LogSettings {
            enabled: false,
            level: LogLevel::Debug,
        };
        let builder = LogManager::builder().with_settings(&settings);
        assert_eq!(builder.level, Level::DEBUG);
        assert!(builder.file_dir.is_none());
        assert_eq!(level_from_config(&LogLevel::Warn), Level::WARN);
    }

    #[test]
    fn default_filter_quiets_http_crates() {
        std::env::remove_var(FILTER_ENV);
        let filter = LogManager::builder().level(Level::DEBUG).filter().to_string();
        assert!(filter.contains("debug"));
        assert!(filter.contains("reqwest=warn"));
    }
}
