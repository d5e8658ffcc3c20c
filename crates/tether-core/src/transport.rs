//! Connection collaborator contract.
//!
//! The wire protocol of the underlying service is opaque to Tether. A
//! [`Transport`] exposes the command primitives the controller needs and
//! hands out a single inbound feed of [`TransportEvent`]s, which the
//! controller's message pump drains.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::TransportResult;
use crate::model::{AccountFlags, AccountId, LoginResult, PersonaState, Universe};
use crate::protocol::InboundMessage;

/// Identifier sent with every log-on so concurrent sessions can be told apart.
pub const LOGIN_ID: u32 = 1212;

// =============================================================================
// Commands
// =============================================================================

/// Everything submitted with a log-on request.
#[derive(Clone, Default)]
pub struct LogOnDetails {
    pub username: String,
    /// Empty when logging on with a login key.
    pub password: String,
    pub login_key: Option<String>,
    pub auth_code: Option<String>,
    pub two_factor_code: Option<String>,
    /// SHA-1 of the persisted sentry file.
    pub sentry_file_hash: Option<Vec<u8>>,
    pub cell_id: u32,
    pub login_id: u32,
    /// Ask the service to issue a login key for the next log-on.
    pub should_remember_password: bool,
}

impl std::fmt::Debug for LogOnDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogOnDetails")
            .field("username", &self.username)
            .field("has_password", &!self.password.is_empty())
            .field("has_login_key", &self.login_key.is_some())
            .field("has_auth_code", &self.auth_code.is_some())
            .field("has_two_factor_code", &self.two_factor_code.is_some())
            .field("has_sentry", &self.sentry_file_hash.is_some())
            .field("cell_id", &self.cell_id)
            .finish()
    }
}

/// Acknowledgement for a sentry file update.
#[derive(Debug, Clone)]
pub struct MachineAuthResponse {
    pub job_id: u64,
    pub file_name: String,
    pub offset: u64,
    pub bytes_written: usize,
    pub file_size: usize,
    pub one_time_password: Option<String>,
    pub sentry_file_hash: Vec<u8>,
}

// =============================================================================
// Events
// =============================================================================

/// Payload of a login-result event.
#[derive(Debug, Clone, Default)]
pub struct LoggedOn {
    pub result: LoginResult,
    pub extended_result: i32,
    pub account_id: AccountId,
    pub vanity_url: Option<String>,
    pub cell_id: u32,
    /// One-time token for deriving the web session.
    pub web_api_nonce: Option<String>,
    pub account_flags: AccountFlags,
}

/// Request from the service to write a chunk of the sentry file.
#[derive(Debug, Clone)]
pub struct MachineAuthUpdate {
    pub job_id: u64,
    pub file_name: String,
    pub offset: u64,
    pub data: Vec<u8>,
    pub one_time_password: Option<String>,
}

/// Inbound event published by a transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The socket-level connection is up.
    Connected,
    /// The connection went down.
    Disconnected {
        /// `true` when the disconnect was requested locally.
        user_initiated: bool,
    },
    /// Result of a log-on request.
    LoggedOn(LoggedOn),
    /// A fresh login key was issued.
    LoginKey { key: String },
    /// The service sent (part of) a sentry file.
    MachineAuth(MachineAuthUpdate),
    /// Any other service message.
    Message(InboundMessage),
}

// =============================================================================
// Transport
// =============================================================================

/// The opaque connection collaborator.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Hands out the inbound event feed. Returns `None` once taken.
    fn take_event_receiver(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>>;

    /// Returns whether the socket-level connection is up.
    fn is_connected(&self) -> bool;

    /// Universe of the current connection.
    fn universe(&self) -> Universe;

    /// Starts connecting. Completion is reported as [`TransportEvent::Connected`].
    async fn connect(&self) -> TransportResult<()>;

    /// Closes the connection. Reported as a user-initiated
    /// [`TransportEvent::Disconnected`].
    async fn disconnect(&self);

    /// Submits a log-on. The result arrives as [`TransportEvent::LoggedOn`].
    async fn log_on(&self, details: LogOnDetails) -> TransportResult<()>;

    /// Requests a fresh one-time web nonce.
    async fn request_web_api_nonce(&self) -> TransportResult<String>;

    /// Lightweight round trip used as a keepalive.
    async fn request_profile_info(&self, account: AccountId) -> TransportResult<()>;

    async fn set_persona_state(&self, state: PersonaState) -> TransportResult<()>;

    async fn request_persona_update(&self, account: AccountId) -> TransportResult<()>;

    /// Confirms that a new login key was stored.
    async fn accept_login_key(&self, key: &str) -> TransportResult<()>;

    /// Confirms that a sentry file update was written.
    async fn send_machine_auth_response(
        &self,
        response: MachineAuthResponse,
    ) -> TransportResult<()>;
}
