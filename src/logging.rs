use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_FILE_PREFIX: &str = "danci-session.log";

/// Dependencies that drown out session logs at `info`. Applied unless the
/// configured filter names the target itself.
const QUIET_TARGETS: [(&str, &str); 5] = [
    ("sqlx", "warn"),
    ("hyper", "warn"),
    ("h2", "warn"),
    ("reqwest", "warn"),
    ("tower_http", "info"),
];

/// Where and how much the service logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    /// `RUST_LOG`-style filter, e.g. `debug` or `danci_session::session=trace`.
    pub filter: String,
    /// Daily rolling files go here when set.
    pub file_dir: Option<PathBuf>,
}

/// Keeps the non-blocking file writer flushing; hold it for the process lifetime.
pub struct FileLogGuard {
    _guard: WorkerGuard,
}

/// Expands the configured filter with the quiet defaults for noisy
/// dependencies. An empty or blank filter means `info`.
pub fn filter_directives(filter: &str) -> String {
    let filter = filter.trim();
    let mut directives: Vec<String> = if filter.is_empty() {
        vec!["info".to_string()]
    } else {
        filter.split(',').map(|d| d.trim().to_string()).filter(|d| !d.is_empty()).collect()
    };

    for (target, level) in QUIET_TARGETS {
        let named = directives.iter().any(|d| {
            d.split(['=', '[']).next().is_some_and(|t| t == target || t.starts_with(&format!("{target}::")))
        });
        if !named {
            directives.push(format!("{target}={level}"));
        }
    }
    directives.join(",")
}

fn env_filter(filter: &str) -> EnvFilter {
    EnvFilter::try_new(filter_directives(filter)).unwrap_or_else(|err| {
        eprintln!("invalid log filter {filter:?}: {err}, falling back to info");
        EnvFilter::new(filter_directives("info"))
    })
}

fn file_writer(dir: &Path) -> std::io::Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    std::fs::create_dir_all(dir)?;
    let appender = RollingFileAppender::new(Rotation::DAILY, dir, LOG_FILE_PREFIX);
    Ok(tracing_appender::non_blocking(appender))
}

pub fn init_tracing(settings: &LogSettings) -> Option<FileLogGuard> {
    let stdout_layer = fmt::layer().with_target(true);

    let file = settings.file_dir.as_deref().and_then(|dir| match file_writer(dir) {
        Ok(writer) => Some(writer),
        Err(err) => {
            eprintln!("file logging disabled, cannot use {}: {err}", dir.display());
            None
        }
    });

    match file {
        Some((writer, guard)) => {
            let file_layer = fmt::layer().with_writer(writer).with_ansi(false).with_target(true);
            tracing_subscriber::registry()
                .with(env_filter(&settings.filter))
                .with(stdout_layer)
                .with(file_layer)
                .init();
            tracing::info!(dir = ?settings.file_dir, "file logging enabled");
            Some(FileLogGuard { _guard: guard })
        }
        None => {
            tracing_subscriber::registry()
                .with(env_filter(&settings.filter))
                .with(stdout_layer)
                .init();
            None
        }
    }
}
