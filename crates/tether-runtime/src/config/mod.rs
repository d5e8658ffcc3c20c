//! Configuration for the Tether runtime.
//!
//! Layered loading through figment (defaults, files, `TETHER_*` environment
//! variables, programmatic overrides) followed by validation.

pub mod error;
pub mod loader;
pub mod schema;
pub mod validation;

pub use error::{ConfigError, ConfigResult};
pub use loader::{ConfigLoader, Profile};
pub use schema::{
    BotConfig, GlobalConfig, LogFormat, LogLevel, LogOutput, LogRotation, LoggingConfig,
    PasswordFormat, SpanEventConfig, StoreConfig, TetherConfig, WebConfig,
};
pub use validation::{PARENTAL_CODE_LENGTH, validate_config};
