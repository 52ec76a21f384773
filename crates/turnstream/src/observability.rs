use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

const ENABLED_VAR: &str = "TURNSTREAM_OBSERVABILITY_ENABLED";
const LEVEL_VAR: &str = "TURNSTREAM_LOG_LEVEL";
const JSON_LOG_PATH_VAR: &str = "TURNSTREAM_JSON_LOG_PATH";
const DEFAULT_LOG_FILE: &str = "turnstream.logs.jsonl";

static INSTALLED: OnceCell<bool> = OnceCell::new();

/// Logging settings read from the environment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObservabilitySettings {
    /// Whether a subscriber should be installed at all.
    pub enabled: bool,
    /// Filter directive from `TURNSTREAM_LOG_LEVEL`; `RUST_LOG` or `info` otherwise.
    pub level: Option<String>,
    /// JSONL output file; compact stdout logging when unset.
    pub json_log_path: Option<PathBuf>,
}

impl Default for ObservabilitySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            level: None,
            json_log_path: None,
        }
    }
}

impl ObservabilitySettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds settings from an arbitrary variable lookup. Unparseable enable
    /// flags and blank values fall back to the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_blank = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        Self {
            enabled: non_blank(ENABLED_VAR)
                .and_then(|value| parse_bool(&value))
                .unwrap_or(true),
            level: non_blank(LEVEL_VAR),
            json_log_path: non_blank(JSON_LOG_PATH_VAR).map(PathBuf::from),
        }
    }

    fn env_filter(&self) -> EnvFilter {
        if let Some(level) = &self.level
            && let Ok(filter) = EnvFilter::try_new(level)
        {
            return filter;
        }
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "enabled" => Some(true),
        "0" | "false" | "no" | "off" | "disabled" => Some(false),
        _ => None,
    }
}

/// Splits a log path into the directory and file name the appender expects.
fn log_file_parts(path: &Path) -> (PathBuf, String) {
    let dir = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(DEFAULT_LOG_FILE)
        .to_owned();
    (dir, file_name)
}

/// Installs a global `tracing` subscriber from `TURNSTREAM_*` settings.
///
/// The library only emits events; binaries and demos call this to see them.
/// Returns whether this process ended up with the turnstream subscriber. Only
/// the first call does any work; later calls report the first outcome.
pub fn init_observability() -> bool {
    *INSTALLED.get_or_init(|| install(&ObservabilitySettings::from_env()))
}

fn install(settings: &ObservabilitySettings) -> bool {
    if !settings.enabled {
        return false;
    }

    let env_filter = settings.env_filter();
    match &settings.json_log_path {
        Some(path) => {
            let (dir, file_name) = log_file_parts(path);
            let _ = std::fs::create_dir_all(&dir);
            let writer = tracing_appender::rolling::never(dir, file_name);
            let json_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .with_writer(writer);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(json_layer)
                .try_init()
                .is_ok()
        }
        None => {
            let console_layer = tracing_subscriber::fmt::layer()
                .compact()
                .with_target(false)
                .with_writer(std::io::stdout);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .try_init()
                .is_ok()
        }
    }
}
