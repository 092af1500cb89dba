//! Configuration schema (§4.9, AMBIENT).
//!
//! These are *engine* tuning knobs only — connection-string parsing and
//! token sourcing stay out of scope (§1) and are wired up programmatically
//! by the embedding application.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub listener: ListenerSection,
    pub client: ClientSection,
    pub logging: LoggingSection,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listener: ListenerSection::default(),
            client: ClientSection::default(),
            logging: LoggingSection::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerSection {
    pub operation_timeout_secs: u64,
    pub reconnect_schedule_secs: Vec<u64>,
    pub connection_buffer_bytes: usize,
}

impl Default for ListenerSection {
    fn default() -> Self {
        Self {
            operation_timeout_secs: 60,
            reconnect_schedule_secs: vec![0, 1, 2, 5, 10, 30],
            connection_buffer_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    pub operation_timeout_secs: u64,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self { operation_timeout_secs: 70 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: LogLevel,
    pub format: LogFormat,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self { level: LogLevel::Info, format: LogFormat::Pretty }
    }
}

impl ListenerSection {
    pub fn operation_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn reconnect_schedule(&self) -> Vec<std::time::Duration> {
        self.reconnect_schedule_secs.iter().map(|s| std::time::Duration::from_secs(*s)).collect()
    }
}

impl ClientSection {
    pub fn operation_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.operation_timeout_secs)
    }
}
