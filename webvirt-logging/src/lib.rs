//! Tracing setup shared by the webvirt binaries.
//!
//! Output is controlled through environment variables:
//!
//! - `LOG_LEVEL`: default filter directive when `RUST_LOG` is unset (`info`)
//! - `LOG_OUTPUT`: `console`, `file` or `both` (`console`)
//! - `LOG_FORMAT`: `human` or `json` (`human`)
//! - `LOG_FILE_PATH`: file written by the daily rolling appender (`/tmp/webvirt.log`)

use std::env;
use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    layer::{Layered, SubscriberExt},
    registry::Registry,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

type Filtered = Layered<EnvFilter, Registry>;
type BoxedLayer = Box<dyn Layer<Filtered> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Human,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogOptions {
    pub level: String,
    pub console: bool,
    pub file: Option<PathBuf>,
    pub format: LogFormat,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            console: true,
            file: None,
            format: LogFormat::Human,
        }
    }
}

impl LogOptions {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds options from an arbitrary key lookup so callers and tests do not
    /// have to touch the process environment.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let level = lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string());
        let output = lookup("LOG_OUTPUT").unwrap_or_else(|| "console".to_string());
        let format = match lookup("LOG_FORMAT").as_deref() {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Human,
        };
        let file_path = lookup("LOG_FILE_PATH").unwrap_or_else(|| "/tmp/webvirt.log".to_string());

        let (console, file) = match output.as_str() {
            "file" => (false, Some(PathBuf::from(file_path))),
            "both" => (true, Some(PathBuf::from(file_path))),
            _ => (true, None),
        };

        Self {
            level,
            console,
            file,
            format,
        }
    }
}

fn format_layer<W>(format: LogFormat, writer: W) -> BoxedLayer
where
    W: for<'w> tracing_subscriber::fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = tracing_subscriber::fmt::layer().with_writer(writer);
    match format {
        LogFormat::Json => layer.json().boxed(),
        LogFormat::Human => layer.with_target(true).boxed(),
    }
}

/// Installs the global subscriber. The returned guard must be held for the
/// lifetime of the process when file output is enabled, otherwise buffered
/// lines are dropped on exit.
pub fn init_subscriber(options: &LogOptions) -> Option<WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&options.level))
        .add_directive("hyper=warn".parse().expect("static directive"))
        .add_directive("sqlx=warn".parse().expect("static directive"));

    let mut layers: Vec<BoxedLayer> = Vec::new();
    let mut guard = None;

    if options.console {
        layers.push(format_layer(options.format, std::io::stdout));
    }

    if let Some(path) = &options.file {
        let dir = path.parent().unwrap_or_else(|| Path::new("/tmp"));
        let file_name = path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_else(|| "webvirt.log".into());
        let appender = tracing_appender::rolling::daily(dir, file_name);
        let (writer, worker_guard) = tracing_appender::non_blocking(appender);
        guard = Some(worker_guard);
        layers.push(format_layer(options.format, writer));
    }

    // A second call (e.g. from tests) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(layers)
        .try_init();

    guard
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_to_human_console_output() {
        let options = LogOptions::from_lookup(lookup(&[]));
        assert_eq!(options, LogOptions::default());
    }

    #[test]
    fn both_output_enables_console_and_file() {
        let options = LogOptions::from_lookup(lookup(&[
            ("LOG_OUTPUT", "both"),
            ("LOG_FORMAT", "json"),
            ("LOG_FILE_PATH", "/var/log/webvirt/api.log"),
        ]));
        assert!(options.console);
        assert_eq!(options.file, Some(PathBuf::from("/var/log/webvirt/api.log")));
        assert_eq!(options.format, LogFormat::Json);
    }

    #[test]
    fn file_output_disables_console() {
        let options = LogOptions::from_lookup(lookup(&[("LOG_OUTPUT", "file")]));
        assert!(!options.console);
        assert_eq!(options.file, Some(PathBuf::from("/tmp/webvirt.log")));
    }
}
