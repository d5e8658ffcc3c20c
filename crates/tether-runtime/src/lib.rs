//! Tether Runtime - connection control and orchestration for Tether.
//!
//! This crate provides:
//! - The connection controller of an account ([`Bot`])
//! - The authenticated web session it keeps alive ([`WebSession`])
//! - Process-wide login rate limiting ([`LoginLimiter`])
//! - Runtime orchestration ([`TetherRuntime`])
//! - Configuration loading and logging setup
//!
//! ```ignore
//! use std::sync::Arc;
//!
//! use tether_runtime::{BotEvent, TetherRuntime};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let runtime = TetherRuntime::new()?;
//!
//!     for bot in runtime.register_bots(|config| Arc::new(MyTransport::new(config))).await? {
//!         let mut events = bot.subscribe();
//!         tokio::spawn(async move {
//!             while let Ok(event) = events.recv().await {
//!                 if let BotEvent::CredentialNeeded(kind) = event {
//!                     let code = ask_owner(kind).await;
//!                     bot.submit_code(kind, code).await;
//!                 }
//!             }
//!         });
//!     }
//!
//!     // Run until Ctrl+C
//!     runtime.run().await?;
//!     Ok(())
//! }
//! ```

pub mod bot;
pub mod config;
pub mod context;
pub mod crypto;
pub mod error;
pub mod limiter;
pub mod logging;
pub mod runtime;
pub mod session;

// Re-exports
pub use bot::{Bot, BotEvent};
pub use config::{
    BotConfig, ConfigError, ConfigLoader, ConfigResult, GlobalConfig, TetherConfig, WebConfig,
};
pub use context::{RuntimeContext, WebEndpoints, WebHost};
pub use crypto::{EncryptedLogin, RsaAesCipher, SessionCipher};
pub use error::{RuntimeError, RuntimeResult};
pub use limiter::{LOGIN_COOLDOWN, LoginLimiter};
pub use logging::{LoggingBuilder, SpanEvents};
pub use runtime::{RuntimeBuilder, TetherRuntime};
pub use session::{SessionKey, SessionOwner, WebSession};

// Re-export tracing for use by other crates
pub use tracing;
pub use tracing_subscriber;

/// Prelude module for convenient imports.
///
/// This provides all the commonly used logging macros:
/// - `trace!`, `debug!`, `info!`, `warn!`, `error!`
/// - `span`, `event`
/// - `instrument` attribute
/// - `Level` for span creation
pub mod prelude {
    pub use tracing::{Level, debug, error, event, info, instrument, span, trace, warn};
}
