//! Shared tracing configuration for the gpu-mirror workspace.
//!
//! Binaries, integration tests and benchmarks install their `tracing`
//! subscriber through this crate so that log output looks the same no matter
//! which crate emitted it. Library crates only emit events; they never install
//! a subscriber themselves.

pub mod performance;

#[macro_use]
pub mod macros;

use std::env;
use std::fmt;

pub use tracing::{debug, error, info, trace, warn};

use tracing::Subscriber;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt as tracing_fmt, EnvFilter, Registry};

/// Environment variable selecting a preset (`local`, `ci`, `performance`).
pub const ENV_PROFILE: &str = "GPU_MIRROR_TRACING_PROFILE";
/// Environment variable overriding the filter directives.
pub const ENV_DIRECTIVES: &str = "GPU_MIRROR_TRACING_DIRECTIVES";
/// Environment variable selecting the output format (`pretty`, `compact`, `json`).
pub const ENV_FORMAT: &str = "GPU_MIRROR_TRACING_FORMAT";
/// Environment variable toggling performance spans.
pub const ENV_PERF_TRACING: &str = "GPU_MIRROR_PERF_TRACING";
/// Environment variable with the minimum duration (µs) a performance span needs to be logged.
pub const ENV_PERF_THRESHOLD_US: &str = "GPU_MIRROR_PERF_THRESHOLD_US";

/// Configuration describing how the shared tracing subscriber should behave.
#[derive(Clone, Debug)]
pub struct TracingConfig {
    /// Optional filter directives (e.g. `mirror_core=debug,info`). When absent
    /// `RUST_LOG` is consulted, then [`default_directive`](Self::default_directive).
    pub directives: Option<String>,
    /// Fallback directive used when nothing else resolves.
    pub default_directive: String,
    /// Whether event targets (module paths) appear in the output.
    pub include_targets: bool,
    /// ANSI colouring. Always off for JSON output.
    pub ansi: bool,
    /// Span lifecycle events to emit.
    pub span_events: FmtSpan,
    /// Output format for the formatter layer.
    pub output: TracingOutput,
    /// When false, performance spans are created but never logged.
    pub enable_performance_tracing: bool,
    /// Minimum duration in microseconds for a performance span to be logged.
    pub performance_threshold_us: Option<u64>,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self::for_local()
    }
}

impl TracingConfig {
    /// Pretty, coloured output for local development.
    pub fn for_local() -> Self {
        Self {
            directives: None,
            default_directive: "info".to_string(),
            include_targets: true,
            ansi: true,
            span_events: FmtSpan::NONE,
            output: TracingOutput::Pretty,
            enable_performance_tracing: cfg!(debug_assertions),
            performance_threshold_us: None,
        }
    }

    /// JSON lines without colour, for CI and log collectors.
    pub fn for_ci() -> Self {
        Self {
            ansi: false,
            output: TracingOutput::Json,
            enable_performance_tracing: false,
            ..Self::for_local()
        }
    }

    /// Debug-level transfer and allocation events with span timings.
    pub fn for_performance() -> Self {
        Self {
            directives: Some("mirror_core=debug,mirror_runtime=debug".to_string()),
            ansi: false,
            span_events: FmtSpan::CLOSE,
            output: TracingOutput::Json,
            enable_performance_tracing: true,
            ..Self::for_local()
        }
    }

    /// Build a configuration from the `GPU_MIRROR_*` environment variables.
    ///
    /// Unknown or malformed values are ignored and the preset value is kept.
    pub fn from_env() -> Self {
        let profile = env::var(ENV_PROFILE)
            .unwrap_or_else(|_| "local".to_string())
            .to_ascii_lowercase();

        let mut config = match profile.as_str() {
            "ci" => Self::for_ci(),
            "performance" => Self::for_performance(),
            _ => Self::for_local(),
        };

        if let Ok(directives) = env::var(ENV_DIRECTIVES) {
            if !directives.trim().is_empty() {
                config.directives = Some(directives);
            }
        }

        if let Some(output) = env::var(ENV_FORMAT).ok().and_then(|v| TracingOutput::from_env_value(&v)) {
            config.output = output;
            if config.output == TracingOutput::Json {
                config.ansi = false;
            }
        }

        if let Ok(flag) = env::var(ENV_PERF_TRACING) {
            config.enable_performance_tracing =
                flag == "1" || flag.eq_ignore_ascii_case("true") || flag.eq_ignore_ascii_case("yes");
        }

        if let Some(threshold) = env::var(ENV_PERF_THRESHOLD_US).ok().and_then(|v| v.parse::<u64>().ok()) {
            config.performance_threshold_us = Some(threshold);
        }

        config
    }

    fn resolve_filter(&self) -> Result<EnvFilter, TracingSetupError> {
        match &self.directives {
            Some(directives) => {
                EnvFilter::try_new(directives).map_err(|err| TracingSetupError::InvalidFilter(err.to_string()))
            }
            None => Ok(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.default_directive))),
        }
    }
}

/// Output format choices for the formatter layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TracingOutput {
    Compact,
    Pretty,
    Json,
}

impl TracingOutput {
    fn from_env_value(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Some(Self::Compact),
            "pretty" => Some(Self::Pretty),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Errors surfaced when the subscriber cannot be configured.
#[derive(Debug)]
pub enum TracingSetupError {
    /// The directive string could not be parsed.
    InvalidFilter(String),
    /// A global subscriber is already installed.
    SubscriberInit(tracing_subscriber::util::TryInitError),
}

impl fmt::Display for TracingSetupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TracingSetupError::InvalidFilter(msg) => write!(f, "invalid tracing directive: {msg}"),
            TracingSetupError::SubscriberInit(err) => write!(f, "failed to install global tracing subscriber: {err}"),
        }
    }
}

impl std::error::Error for TracingSetupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TracingSetupError::SubscriberInit(err) => Some(err),
            TracingSetupError::InvalidFilter(_) => None,
        }
    }
}

/// Build a subscriber from the configuration without installing it.
pub fn build_subscriber(config: &TracingConfig) -> Result<impl Subscriber + Send + Sync, TracingSetupError> {
    let filter = config.resolve_filter()?;
    Ok(Registry::default().with(formatter_layer(config)).with(filter))
}

fn formatter_layer(config: &TracingConfig) -> Box<dyn Layer<Registry> + Send + Sync> {
    let layer = tracing_fmt::layer()
        .with_target(config.include_targets)
        .with_span_events(config.span_events.clone());

    match config.output {
        TracingOutput::Compact => Box::new(layer.compact().with_ansi(config.ansi)),
        TracingOutput::Pretty => Box::new(layer.pretty().with_ansi(config.ansi)),
        TracingOutput::Json => Box::new(layer.json().with_ansi(false)),
    }
}

/// Install the configured subscriber as the process-wide default.
pub fn init_global_tracing(config: &TracingConfig) -> Result<(), TracingSetupError> {
    build_subscriber(config)?
        .try_init()
        .map_err(TracingSetupError::SubscriberInit)
}

/// Install a test-friendly subscriber once; later calls are no-ops.
///
/// Intended for integration tests, which run many tests in one process.
pub fn init_test_tracing() {
    let config = TracingConfig {
        ansi: false,
        output: TracingOutput::Compact,
        ..TracingConfig::from_env()
    };
    if let Ok(subscriber) = build_subscriber(&config) {
        let _ = subscriber.try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn reset_env() {
        for key in [ENV_PROFILE, ENV_DIRECTIVES, ENV_FORMAT, ENV_PERF_TRACING, ENV_PERF_THRESHOLD_US] {
            env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn rejects_invalid_directive() {
        reset_env();
        let config = TracingConfig {
            directives: Some("=::invalid".to_string()),
            ..TracingConfig::default()
        };
        assert!(matches!(build_subscriber(&config), Err(TracingSetupError::InvalidFilter(_))));
    }

    #[test]
    #[serial]
    fn builds_every_output_format() {
        reset_env();
        for output in [TracingOutput::Compact, TracingOutput::Pretty, TracingOutput::Json] {
            let config = TracingConfig {
                output,
                ..TracingConfig::default()
            };
            assert!(build_subscriber(&config).is_ok());
        }
    }

    #[test]
    #[serial]
    fn from_env_respects_profile_and_format() {
        reset_env();
        env::set_var(ENV_PROFILE, "ci");
        env::set_var(ENV_FORMAT, "compact");
        env::set_var(ENV_DIRECTIVES, "mirror_core=trace");

        let config = TracingConfig::from_env();
        assert_eq!(config.directives.as_deref(), Some("mirror_core=trace"));
        assert_eq!(config.output, TracingOutput::Compact);
        assert!(!config.ansi);
        reset_env();
    }

    #[test]
    #[serial]
    fn from_env_reads_performance_settings() {
        reset_env();
        env::set_var(ENV_PERF_TRACING, "yes");
        env::set_var(ENV_PERF_THRESHOLD_US, "250");

        let config = TracingConfig::from_env();
        assert!(config.enable_performance_tracing);
        assert_eq!(config.performance_threshold_us, Some(250));

        env::set_var(ENV_PERF_THRESHOLD_US, "not-a-number");
        assert_eq!(TracingConfig::from_env().performance_threshold_us, None);
        reset_env();
    }

    #[test]
    fn performance_preset_is_json() {
        let config = TracingConfig::for_performance();
        assert!(config.enable_performance_tracing);
        assert_eq!(config.output, TracingOutput::Json);
        assert!(!config.ansi);
        assert!(config.directives.is_some());
    }
}
