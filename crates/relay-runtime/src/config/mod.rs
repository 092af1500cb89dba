//! Layered configuration for engine tuning knobs (§4.9, AMBIENT).

pub mod error;
pub mod loader;
pub mod schema;
pub mod validation;

pub use error::{ConfigError, ConfigResult};
pub use loader::{ConfigLoader, load_config, load_config_from_file};
pub use schema::{ClientSection, ListenerSection, LogFormat, LogLevel, LoggingSection, RelayConfig};
pub use validation::validate_config;
