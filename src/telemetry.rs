use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{BloomError, Result};

pub const DEFAULT_LOG_FILTER: &str = "info,bloombuddy_engine=debug";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = BloomError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(BloomError::Config(format!("unknown log format `{other}`"))),
        }
    }
}

/// Installs the global subscriber. `RUST_LOG` overrides the default filter.
///
/// Fails if a subscriber is already installed.
pub fn init_tracing(format: LogFormat) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let registry = tracing_subscriber::registry().with(filter);
    let installed = match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_target(true))
            .try_init(),
        LogFormat::Pretty => registry
            .with(fmt::layer().with_target(true))
            .try_init(),
    };
    installed.map_err(|err| BloomError::Config(format!("failed to install tracing subscriber: {err}")))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub kind: String,
    pub timestamp: SystemTime,
    pub detail: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub context: String,
    pub error: String,
    pub attempt: u32,
}

/// Events kept per buffer before the oldest are dropped.
pub const DEFAULT_TELEMETRY_CAPACITY: usize = 1024;

/// In-process sink for degradation events and swallowed failures.
///
/// Both buffers are bounded; past `capacity` the oldest entry is evicted.
#[derive(Clone)]
pub struct TelemetryCollector {
    events: Arc<Mutex<VecDeque<TelemetryEvent>>>,
    failures: Arc<Mutex<VecDeque<FailureRecord>>>,
    capacity: usize,
}

impl Default for TelemetryCollector {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_TELEMETRY_CAPACITY)
    }
}

fn push_bounded<T>(buffer: &Mutex<VecDeque<T>>, item: T, capacity: usize) {
    if let Ok(mut buffer) = buffer.lock() {
        while buffer.len() >= capacity.max(1) {
            buffer.pop_front();
        }
        buffer.push_back(item);
    }
}

fn take_all<T>(buffer: &Mutex<VecDeque<T>>) -> Vec<T> {
    buffer
        .lock()
        .map(|mut guard| guard.drain(..).collect())
        .unwrap_or_default()
}

impl TelemetryCollector {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::default(),
            failures: Arc::default(),
            capacity,
        }
    }

    pub fn record(&self, kind: impl Into<String>, detail: serde_json::Value) {
        let event = TelemetryEvent {
            kind: kind.into(),
            timestamp: SystemTime::now(),
            detail,
        };
        push_bounded(&self.events, event, self.capacity);
    }

    pub fn record_failure(
        &self,
        context: impl Into<String>,
        error: impl Into<String>,
        attempt: u32,
    ) {
        let failure = FailureRecord {
            context: context.into(),
            error: error.into(),
            attempt,
        };
        push_bounded(&self.failures, failure, self.capacity);
    }

    pub fn events_of(&self, kind: &str) -> usize {
        self.events
            .lock()
            .map(|events| events.iter().filter(|e| e.kind == kind).count())
            .unwrap_or(0)
    }

    pub fn drain(&self) -> (Vec<TelemetryEvent>, Vec<FailureRecord>) {
        (take_all(&self.events), take_all(&self.failures))
    }
}

/// What a two-stage pipeline does when its primary stage fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationPolicy {
    /// Run the fallback stage for any primary failure except cancellation.
    #[default]
    Fallback,
    /// Surface the primary failure unchanged.
    FailFast,
}

impl DegradationPolicy {
    pub fn should_degrade(&self, err: &BloomError) -> bool {
        match self {
            DegradationPolicy::FailFast => false,
            DegradationPolicy::Fallback => !matches!(err, BloomError::Cancelled),
        }
    }
}
