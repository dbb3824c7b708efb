// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Process-wide `tracing` setup.
//!
//! ```text
//! Registry
//!   ├── reload::Layer<Targets>     level filter, adjustable at runtime
//!   ├── stdout fmt layer           text or JSON
//!   ├── file fmt layer             <dir>/<prefix>.YYYY-MM-DD-HH
//!   └── error file fmt layer       <dir>/<prefix>-err.YYYY-MM-DD-HH, ERROR only
//! ```

use std::{
    env,
    io::IsTerminal,
    sync::{Arc, Mutex, Once},
};

use bon::Builder;
use once_cell::sync::{Lazy, OnceCell};
use serde::{Deserialize, Deserializer, Serialize, de};
use smart_default::SmartDefault;
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_log::LogTracer;
use tracing_subscriber::{
    EnvFilter, Layer, Registry, filter,
    layer::{Layered, SubscriberExt},
    reload,
};

/// Deserializes a string field, treating `""` as `T::default()`.
pub fn empty_string_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    let s = String::deserialize(deserializer)?;
    if s.is_empty() {
        Ok(T::default())
    } else {
        T::deserialize(de::value::StrDeserializer::new(&s)).map_err(|e: de::value::Error| {
            de::Error::custom(format!("invalid value, expect empty string, err: {e}"))
        })
    }
}

/// Directory used for log files when one is wanted but none is configured.
pub const DEFAULT_LOGGING_DIR: &str = "logs";

/// Default level filter when neither the options nor `RUST_LOG` set one.
const DEFAULT_LOG_TARGETS: &str = "info";

/// Handle for changing the level filter after initialization.
///
/// Empty until [`init_global_logging`] has run.
pub static RELOAD_HANDLE: OnceCell<reload::Handle<filter::Targets, Registry>> = OnceCell::new();

/// Logging configuration.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, SmartDefault, Builder)]
#[serde(default)]
pub struct LoggingOptions {
    /// Directory for hourly-rotated log files. Empty disables file output.
    #[default = ""]
    #[builder(default)]
    pub dir: String,

    /// Target filter such as `"info,spool=debug"`. Falls back to `RUST_LOG`.
    pub level: Option<String>,

    #[serde(default, deserialize_with = "empty_string_as_default")]
    #[builder(default)]
    pub log_format: LogFormat,

    /// Prefix of the rotated file names.
    #[default = "logspool"]
    #[builder(default = "logspool".to_string())]
    pub file_prefix: String,

    /// Rotated files kept per log stream; 720 is a month of hourly files.
    #[default = 720]
    #[builder(default = 720)]
    pub max_log_files: usize,

    #[default = true]
    #[builder(default = true)]
    pub append_stdout: bool,
}

/// Output format of every fmt layer.
#[derive(
    Clone, Debug, Copy, PartialEq, Eq, Serialize, Deserialize, Default, derive_more::Display,
)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// One JSON object per event, for log shippers.
    Json,
    #[default]
    Text,
}

/// Stdout-only text logging with default options.
#[must_use]
pub fn init_tracing_subscriber(app_name: &str) -> Vec<WorkerGuard> {
    init_global_logging(app_name, &LoggingOptions::default())
}

static GLOBAL_UT_LOG_GUARD: Lazy<Arc<Mutex<Option<Vec<WorkerGuard>>>>> =
    Lazy::new(|| Arc::new(Mutex::new(None)));

/// Logging for tests, safe to call from every test.
///
/// Writes to `UNITTEST_LOG_DIR` (default `/tmp/__unittest_logs`) at
/// `UNITTEST_LOG_LEVEL` (default `debug`). The worker guards are kept in a
/// static so output is not lost when a test returns.
pub fn init_default_ut_logging() {
    static START: Once = Once::new();

    START.call_once(|| {
        let dir =
            env::var("UNITTEST_LOG_DIR").unwrap_or_else(|_| "/tmp/__unittest_logs".to_string());
        let level = env::var("UNITTEST_LOG_LEVEL").unwrap_or_else(|_| "debug".to_string());

        let opts = LoggingOptions {
            dir: dir.clone(),
            level: Some(level),
            file_prefix: "unittest".to_string(),
            ..Default::default()
        };
        let guards = init_global_logging("unittest", &opts);
        if let Ok(mut slot) = GLOBAL_UT_LOG_GUARD.lock() {
            *slot = Some(guards);
        }

        tracing::info!("logs dir = {}", dir);
    });
}

type FilteredRegistry = Layered<reload::Layer<filter::Targets, Registry>, Registry>;
type BoxedLayer = Box<dyn Layer<FilteredRegistry> + Send + Sync>;

fn fmt_layer<W>(writer: W, format: LogFormat, ansi: bool) -> BoxedLayer
where
    W: for<'w> tracing_subscriber::fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    match format {
        LogFormat::Json => tracing_subscriber::fmt::Layer::new()
            .json()
            .with_writer(writer)
            .with_ansi(ansi)
            .with_current_span(true)
            .with_span_list(true)
            .with_thread_names(true)
            .boxed(),
        LogFormat::Text => tracing_subscriber::fmt::Layer::new()
            .with_writer(writer)
            .with_ansi(ansi)
            .with_thread_names(true)
            .boxed(),
    }
}

fn rolling_appender(opts: &LoggingOptions, prefix: &str) -> RollingFileAppender {
    RollingFileAppender::builder()
        .rotation(Rotation::HOURLY)
        .filename_prefix(prefix)
        .max_log_files(opts.max_log_files)
        .build(&opts.dir)
        .unwrap_or_else(|e| {
            panic!(
                "initializing rolling file appender at {} failed: {}",
                &opts.dir, e
            )
        })
}

/// Installs the global subscriber.
///
/// Only the first call has an effect. The returned guards flush the
/// non-blocking writers when dropped and must be held for the life of the
/// process.
///
/// # Panics
///
/// On an unusable log directory, an unparsable level string, or when another
/// global subscriber is already installed.
pub fn init_global_logging(app_name: &str, opts: &LoggingOptions) -> Vec<WorkerGuard> {
    static START: Once = Once::new();
    let mut guards = vec![];

    START.call_once(|| {
        LogTracer::init().expect("log tracer must be valid");

        let mut layers: Vec<BoxedLayer> = Vec::new();
        if opts.append_stdout {
            let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());
            guards.push(guard);
            layers.push(fmt_layer(
                writer,
                opts.log_format,
                std::io::stdout().is_terminal(),
            ));
        }

        if !opts.dir.is_empty() {
            let (writer, guard) =
                tracing_appender::non_blocking(rolling_appender(opts, &opts.file_prefix));
            guards.push(guard);
            layers.push(fmt_layer(writer, opts.log_format, false));

            let err_prefix = format!("{}-err", opts.file_prefix);
            let (writer, guard) =
                tracing_appender::non_blocking(rolling_appender(opts, &err_prefix));
            guards.push(guard);
            layers.push(
                fmt_layer(writer, opts.log_format, false)
                    .with_filter(filter::LevelFilter::ERROR)
                    .boxed(),
            );
        }

        let targets = opts
            .level
            .as_deref()
            .or(env::var(EnvFilter::DEFAULT_ENV).ok().as_deref())
            .unwrap_or(DEFAULT_LOG_TARGETS)
            .parse::<filter::Targets>()
            .expect("error parsing log level string");
        let (dyn_filter, reload_handle) = reload::Layer::new(targets);
        RELOAD_HANDLE
            .set(reload_handle)
            .expect("reload handle already set, maybe init_global_logging get called twice?");

        let subscriber = Registry::default().with(dyn_filter).with(layers);
        tracing::subscriber::set_global_default(subscriber)
            .expect("error setting global tracing subscriber");

        tracing::info!(
            app = app_name,
            version = env!("CARGO_PKG_VERSION"),
            dir = %opts.dir,
            format = %opts.log_format,
            "Logging initialized"
        );
    });

    guards
}

/// Replaces the active level filter, e.g. `"debug"` or `"info,spool=trace"`.
pub fn reload_level(level: &str) -> Result<(), String> {
    let targets = level
        .parse::<filter::Targets>()
        .map_err(|e| format!("invalid level filter {level:?}: {e}"))?;
    let handle = RELOAD_HANDLE
        .get()
        .ok_or_else(|| "logging is not initialized".to_string())?;
    handle.reload(targets).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let opts = LoggingOptions::default();
        assert!(opts.dir.is_empty());
        assert_eq!(opts.level, None);
        assert_eq!(opts.log_format, LogFormat::Text);
        assert_eq!(opts.file_prefix, "logspool");
        assert_eq!(opts.max_log_files, 720);
        assert!(opts.append_stdout);
    }

    #[test]
    fn test_builder_matches_defaults() {
        let built = LoggingOptions::builder().build();
        assert_eq!(built, LoggingOptions::default());

        let custom = LoggingOptions::builder()
            .dir("/var/log/agent".to_string())
            .level("debug".to_string())
            .log_format(LogFormat::Json)
            .build();
        assert_eq!(custom.dir, "/var/log/agent");
        assert_eq!(custom.level.as_deref(), Some("debug"));
        assert_eq!(custom.log_format, LogFormat::Json);
    }

    #[test]
    fn test_deserialize_partial_options() {
        let opts: LoggingOptions =
            serde_json::from_str(r#"{"dir":"/tmp/logs","log_format":"json"}"#).unwrap();
        assert_eq!(opts.dir, "/tmp/logs");
        assert_eq!(opts.log_format, LogFormat::Json);
        assert_eq!(opts.max_log_files, 720);
    }

    #[test]
    fn test_empty_format_string_is_default() {
        let opts: LoggingOptions = serde_json::from_str(r#"{"log_format":""}"#).unwrap();
        assert_eq!(opts.log_format, LogFormat::Text);
        assert!(serde_json::from_str::<LoggingOptions>(r#"{"log_format":"xml"}"#).is_err());
    }

    #[test]
    fn test_reload_rejects_bad_filter() {
        assert!(reload_level("info,spool=loud").is_err());
    }
}
