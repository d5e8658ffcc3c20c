//! Configuration schema definitions.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use tether_core::{Credentials, MAX_CONNECTIONS, PersonaState};

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TetherConfig {
    /// Settings shared by every bot.
    #[serde(default)]
    pub global: GlobalConfig,

    /// One entry per account.
    #[serde(default)]
    pub bots: Vec<BotConfig>,

    /// Web hosts and handshake keys.
    #[serde(default)]
    pub web: WebConfig,

    /// Where persisted artifacts live.
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

// =============================================================================
// Global
// =============================================================================

/// Process-wide timing and limiting knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Seconds without traffic before a connection is considered dead.
    #[serde(default = "default_connection_timeout_secs")]
    pub connection_timeout_secs: u64,

    /// Minimum spacing between login attempt starts, process-wide.
    #[serde(default = "default_login_limiter_delay_secs")]
    pub login_limiter_delay_secs: u64,

    /// Minimum spacing between request starts per web host. 0 disables limiting.
    #[serde(default = "default_web_limiter_delay_ms")]
    pub web_limiter_delay_ms: u64,

    /// In-flight request cap per web host.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Extra diagnostics (request tracing).
    #[serde(default)]
    pub debug: bool,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            connection_timeout_secs: default_connection_timeout_secs(),
            login_limiter_delay_secs: default_login_limiter_delay_secs(),
            web_limiter_delay_ms: default_web_limiter_delay_ms(),
            max_connections: default_max_connections(),
            debug: false,
        }
    }
}

impl GlobalConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    /// Window within which a web session check or refresh is not repeated.
    pub fn min_session_validity(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs / 6)
    }

    pub fn login_limiter_delay(&self) -> Duration {
        Duration::from_secs(self.login_limiter_delay_secs)
    }

    pub fn web_limiter_delay(&self) -> Duration {
        Duration::from_millis(self.web_limiter_delay_ms)
    }
}

fn default_connection_timeout_secs() -> u64 {
    90
}

fn default_login_limiter_delay_secs() -> u64 {
    10
}

fn default_web_limiter_delay_ms() -> u64 {
    300
}

fn default_max_connections() -> usize {
    MAX_CONNECTIONS
}

// =============================================================================
// Bots
// =============================================================================

/// How the configured password is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PasswordFormat {
    #[default]
    Plain,
    Base64,
}

impl PasswordFormat {
    /// Decodes `password`. Returns `None` when it is not valid in this format.
    pub fn decode(self, password: &str) -> Option<String> {
        match self {
            Self::Plain => Some(password.to_string()),
            Self::Base64 => STANDARD
                .decode(password.trim())
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok()),
        }
    }
}

/// A single account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    /// Unique name. Also names the artifact files.
    pub name: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Account login name.
    #[serde(default)]
    pub login: String,

    /// Account password, in `password_format`.
    #[serde(default)]
    pub password: String,

    #[serde(default)]
    pub password_format: PasswordFormat,

    /// Ask for and use persisted login keys instead of the password.
    #[serde(default = "default_use_login_keys")]
    pub use_login_keys: bool,

    /// Presence set after login.
    #[serde(default)]
    pub online_status: PersonaState,

    /// 4-character parental unlock code.
    #[serde(default)]
    pub parental_code: Option<String>,
}

impl BotConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: default_enabled(),
            login: String::new(),
            password: String::new(),
            password_format: PasswordFormat::default(),
            use_login_keys: default_use_login_keys(),
            online_status: PersonaState::default(),
            parental_code: None,
        }
    }

    /// Login material as configured. The password stays encoded.
    pub fn credentials(&self) -> Credentials {
        Credentials {
            parental_code: self.parental_code.clone().filter(|code| !code.is_empty()),
            ..Credentials::new(&self.login, &self.password)
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_use_login_keys() -> bool {
    true
}

// =============================================================================
// Web
// =============================================================================

/// Base URLs of the logical web hosts and the handshake public keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    #[serde(default = "default_community_url")]
    pub community: String,

    #[serde(default = "default_store_url")]
    pub store: String,

    #[serde(default = "default_help_url")]
    pub help: String,

    /// Web API host used for the session handshake.
    #[serde(default = "default_api_url")]
    pub api: String,

    /// Hex-encoded DER public key per universe name (`public`, `beta`, ...).
    #[serde(default)]
    pub universe_keys: HashMap<String, String>,

    #[serde(default)]
    pub user_agent: Option<String>,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            community: default_community_url(),
            store: default_store_url(),
            help: default_help_url(),
            api: default_api_url(),
            universe_keys: HashMap::new(),
            user_agent: None,
        }
    }
}

impl WebConfig {
    /// `(name, url)` for every configured host.
    pub fn hosts(&self) -> [(&'static str, &str); 4] {
        [
            ("community", &self.community),
            ("store", &self.store),
            ("help", &self.help),
            ("api", &self.api),
        ]
    }
}

fn default_community_url() -> String {
    "https://steamcommunity.com".to_string()
}

fn default_store_url() -> String {
    "https://store.steampowered.com".to_string()
}

fn default_help_url() -> String {
    "https://help.steampowered.com".to_string()
}

fn default_api_url() -> String {
    "https://api.steampowered.com".to_string()
}

// =============================================================================
// Store
// =============================================================================

/// Artifact store location. Without a directory, artifacts stay in memory.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StoreConfig {
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

// =============================================================================
// Logging
// =============================================================================

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,

    #[serde(default)]
    pub format: LogFormat,

    #[serde(default)]
    pub output: LogOutput,

    /// Log file for [`LogOutput::File`].
    #[serde(default)]
    pub file_path: Option<PathBuf>,

    #[serde(default)]
    pub rotation: LogRotation,

    #[serde(default)]
    pub span_events: SpanEventConfig,

    #[serde(default)]
    pub thread_ids: bool,

    /// Include source file and line.
    #[serde(default)]
    pub file_location: bool,

    /// Per-target levels, e.g. `tether_transport = "trace"`.
    #[serde(default)]
    pub filters: HashMap<String, LogLevel>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::default(),
            format: LogFormat::default(),
            output: LogOutput::default(),
            file_path: None,
            rotation: LogRotation::default(),
            span_events: SpanEventConfig::default(),
            thread_ids: false,
            file_location: false,
            filters: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
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
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    pub fn to_tracing_level(self) -> tracing::Level {
        match self {
            Self::Trace => tracing::Level::TRACE,
            Self::Debug => tracing::Level::DEBUG,
            Self::Info => tracing::Level::INFO,
            Self::Warn => tracing::Level::WARN,
            Self::Error => tracing::Level::ERROR,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Full,
    Pretty,
    #[cfg(feature = "json-log")]
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Stdout,
    Stderr,
    File,
}

/// When the log file rolls over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    #[default]
    Never,
    Hourly,
    Daily,
}

/// Which span lifecycle events are logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SpanEventConfig {
    #[serde(default)]
    pub new: bool,
    #[serde(default)]
    pub enter: bool,
    #[serde(default)]
    pub exit: bool,
    #[serde(default)]
    pub close: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_validity_is_a_sixth_of_timeout() {
        let global = GlobalConfig::default();
        assert_eq!(global.connection_timeout(), Duration::from_secs(90));
        assert_eq!(global.min_session_validity(), Duration::from_secs(15));
    }

    #[test]
    fn test_base64_password_decoding() {
        assert_eq!(
            PasswordFormat::Base64.decode("aHVudGVyMg==").as_deref(),
            Some("hunter2")
        );
        assert_eq!(PasswordFormat::Base64.decode("%%%"), None);
        assert_eq!(PasswordFormat::Plain.decode("%%%").as_deref(), Some("%%%"));
    }

    #[test]
    fn test_credentials_drop_empty_parental_code() {
        let mut bot = BotConfig::new("main");
        bot.login = "user".into();
        bot.parental_code = Some(String::new());

        let credentials = bot.credentials();
        assert_eq!(credentials.login, "user");
        assert!(credentials.parental_code.is_none());
    }
}
