//! # Tether
//!
//! A persistent, self-healing client for session-oriented network services.
//!
//! ## Overview
//!
//! Tether keeps one or more accounts logged on to a service whose wire
//! protocol stays behind a [`Transport`](core::Transport) collaborator, and
//! keeps an authenticated web session derived from each network login.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐  events  ┌──────────────┐  nonce  ┌─────────────┐  HTTP  ┌────────────┐
//! │ Transport │─────────▶│  Bot         │────────▶│ WebSession  │───────▶│ WebBrowser │
//! │ (opaque)  │◀─────────│ (controller) │◀────────│ (cookies)   │        │ + limiter  │
//! └───────────┘ commands └──────────────┘ refresh └─────────────┘        └────────────┘
//! ```
//!
//! - **Runtime**: builds the shared context and owns the bots
//! - **Bot**: connect, log-on, reconnect, heartbeat and the event feed
//! - **WebSession**: handshake, expiry checks, refresh and guarded requests
//! - **WebBrowser**: retries, manual redirects and per-host rate gates
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//!
//! use tether::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let runtime = TetherRuntime::new()?;
//!     runtime.register_bots(|config| Arc::new(MyTransport::new(config))).await?;
//!     runtime.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - `toml-config`: TOML configuration files (default)
//! - `yaml-config`: YAML configuration files
//! - `json-log`: JSON log output

pub use tether_core as core;
pub use tether_runtime as runtime;
pub use tether_transport as transport;

/// Prelude module for convenient imports.
///
/// ```rust,ignore
/// use tether::prelude::*;
/// ```
pub mod prelude {
    // Runtime - main entry point
    pub use tether_runtime::{Bot, BotEvent, RuntimeBuilder, TetherRuntime};

    // Configuration
    pub use tether_runtime::{BotConfig, TetherConfig};

    // Web session
    pub use tether_runtime::{SessionKey, WebSession, WebHost};

    // Collaborator contracts for custom implementations
    pub use tether_core::{ArtifactStore, Transport, TransportEvent};

    // Model
    pub use tether_core::{
        AccountId, Cacheable, CodeKind, ConnectionState, Fallback, LoginResult, PersonaState,
        ProtocolEvent,
    };

    // HTTP layer
    pub use tether_transport::{FormData, RequestOptions, WebBrowser};
}
