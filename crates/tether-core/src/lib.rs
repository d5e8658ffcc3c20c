//! # Tether Core
//!
//! Shared model and collaborator contracts for the Tether session client.
//!
//! This crate holds everything the controller, the web session and the HTTP
//! layer agree on without depending on each other:
//!
//! - **Model**: account identity, login results, connection states and
//!   credentials ([`AccountId`], [`LoginResult`], [`ConnectionState`],
//!   [`Credentials`])
//! - **Transport contract**: the opaque connection collaborator and its
//!   inbound event feed ([`Transport`], [`TransportEvent`])
//! - **Protocol dispatch**: decoding of inbound service messages
//!   ([`ProtocolMessageHandler`], [`ProtocolEvent`])
//! - **Caching**: single-flight, time-boxed resolution ([`Cacheable`])
//! - **Persistence**: sentry file, login key and cell id
//!   ([`ArtifactStore`], [`FileStore`], [`MemoryStore`])
//!
//! ```text
//! ┌─────────────┐  TransportEvent  ┌────────────┐  ProtocolEvent  ┌──────────┐
//! │  Transport  │─────────────────▶│ Controller │────────────────▶│  Owner   │
//! └─────────────┘                  └────────────┘                 └──────────┘
//! ```

pub mod cacheable;
pub mod error;
pub mod model;
pub mod protocol;
pub mod store;
pub mod transport;

/// Default number of attempts for retried operations.
pub const MAX_TRIES: u8 = 5;

/// Default concurrency cap per web host.
pub const MAX_CONNECTIONS: usize = 5;

pub use cacheable::{Cacheable, Fallback, PURGE_GRACE};
pub use error::{StoreError, StoreResult, TransportError, TransportResult};
pub use model::{
    AccountFlags, AccountId, CodeKind, ConnectionState, Credentials, LoginResult, PersonaState,
    Universe,
};
pub use protocol::{InboundMessage, NotificationKind, ProtocolEvent, ProtocolMessageHandler};
pub use store::{ArtifactStore, FileStore, MAX_SENTRY_SIZE, MemoryStore};
pub use transport::{
    LOGIN_ID, LogOnDetails, LoggedOn, MachineAuthResponse, MachineAuthUpdate, Transport,
    TransportEvent,
};

/// Prelude for common imports.
pub mod prelude {
    pub use super::cacheable::{Cacheable, Fallback};
    pub use super::model::*;
    pub use super::protocol::{InboundMessage, ProtocolEvent};
    pub use super::store::ArtifactStore;
    pub use super::transport::{Transport, TransportEvent};
}
