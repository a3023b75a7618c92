//! Tracing initialization with configurable log sinks.
//!
//! The console layer is always installed and honors `RUST_LOG` (default
//! `info`). Additional sinks come from the `logging.sinks` configuration
//! section; each names a provider that is looked up in an explicit
//! [`SinkRegistry`] populated at startup.
//!
//! ```yaml
//! logging:
//!   sinks:
//!     - provider: file
//!       path: log/warnings.log
//!       level: warn
//!       exact_level: true
//!     - provider: json_file
//!       path: log/all.jsonl
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Mutex;

use serde::Deserialize;
use tracing::Level;
use tracing_subscriber::filter::{LevelFilter, filter_fn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt as tfmt};

/// A type-erased subscriber layer.
pub type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Builds a layer from its configuration.
pub type SinkConstructor = fn(&SinkConfig) -> io::Result<BoxedLayer>;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive for the console layer when `RUST_LOG` is unset.
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default)]
    pub sinks: Vec<SinkConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    pub provider: String,
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Minimum level (or the only level, with `exact_level`).
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub exact_level: bool,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

/// Provider name → layer constructor.
#[derive(Clone)]
pub struct SinkRegistry {
    constructors: BTreeMap<&'static str, SinkConstructor>,
}

impl fmt::Debug for SinkRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinkRegistry")
            .field("providers", &self.constructors.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for SinkRegistry {
    fn default() -> Self {
        let mut registry = Self {
            constructors: BTreeMap::new(),
        };
        registry.register("stderr", stderr_sink);
        registry.register("file", file_sink);
        registry.register("json_file", json_file_sink);
        registry
    }
}

impl SinkRegistry {
    pub fn register(&mut self, provider: &'static str, constructor: SinkConstructor) {
        self.constructors.insert(provider, constructor);
    }

    pub fn providers(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.constructors.keys().copied()
    }

    /// Build the layer for `sink`, or `None` if the provider is unknown.
    pub fn build(&self, sink: &SinkConfig) -> Option<io::Result<BoxedLayer>> {
        self.constructors
            .get(sink.provider.as_str())
            .map(|construct| construct(sink))
    }
}

fn level_of(sink: &SinkConfig) -> io::Result<Option<Level>> {
    sink.level
        .as_deref()
        .map(|l| {
            Level::from_str(l)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))
        })
        .transpose()
}

/// Apply the sink's level settings to a formatting layer.
fn filtered<L>(layer: L, sink: &SinkConfig) -> io::Result<BoxedLayer>
where
    L: Layer<Registry> + Send + Sync + 'static,
{
    Ok(match (level_of(sink)?, sink.exact_level) {
        (Some(level), true) => layer
            .with_filter(filter_fn(move |meta| *meta.level() == level))
            .boxed(),
        (Some(level), false) => layer.with_filter(LevelFilter::from_level(level)).boxed(),
        (None, _) => layer.boxed(),
    })
}

fn open_sink_file(sink: &SinkConfig) -> io::Result<fs::File> {
    let path = sink.path.as_ref().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("sink '{}' requires a path", sink.provider),
        )
    })?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

fn stderr_sink(sink: &SinkConfig) -> io::Result<BoxedLayer> {
    let layer = tfmt::layer()
        .with_writer(io::stderr)
        .with_target(true)
        .with_timer(UtcTime::rfc_3339());
    filtered(layer, sink)
}

fn file_sink(sink: &SinkConfig) -> io::Result<BoxedLayer> {
    let file = open_sink_file(sink)?;
    let layer = tfmt::layer()
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_target(true)
        .with_timer(UtcTime::rfc_3339());
    filtered(layer, sink)
}

fn json_file_sink(sink: &SinkConfig) -> io::Result<BoxedLayer> {
    let file = open_sink_file(sink)?;
    let layer = tfmt::layer()
        .json()
        .with_writer(Mutex::new(file))
        .with_timer(UtcTime::rfc_3339());
    filtered(layer, sink)
}

/// Install the global subscriber.
///
/// Returns messages about sinks that could not be built; they are meant to
/// be logged by the caller once tracing is up.
pub fn init(config: &LoggingConfig, registry: &SinkRegistry) -> Vec<String> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(config.filter.as_deref().unwrap_or("info"))
    });
    let console = tfmt::layer()
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_timer(UtcTime::rfc_3339())
        .with_filter(filter)
        .boxed();

    let mut problems = Vec::new();
    let mut layers: Vec<BoxedLayer> = vec![console];
    for sink in config.sinks.iter().filter(|s| s.enabled) {
        match registry.build(sink) {
            Some(Ok(layer)) => layers.push(layer),
            Some(Err(e)) => problems.push(format!("log sink '{}' failed: {e}", sink.provider)),
            None => problems.push(format!(
                "unknown log sink provider '{}' (known: {})",
                sink.provider,
                registry.providers().collect::<Vec<_>>().join(", ")
            )),
        }
    }

    tracing_subscriber::registry().with(layers).init();
    problems
}
