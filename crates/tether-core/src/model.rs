//! Shared data model: identities, login results, connection states and
//! credentials.

use std::fmt;

use serde::{Deserialize, Serialize};

// =============================================================================
// Identity
// =============================================================================

/// Server-assigned account identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(pub u64);

impl AccountId {
    /// Returns `true` for a non-zero identity.
    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Service universe a connection belongs to. Selects the handshake public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Universe {
    #[default]
    Invalid,
    Public,
    Beta,
    Internal,
    Dev,
}

impl Universe {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Invalid => "invalid",
            Self::Public => "public",
            Self::Beta => "beta",
            Self::Internal => "internal",
            Self::Dev => "dev",
        }
    }
}

impl fmt::Display for Universe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Login Results
// =============================================================================

/// Result code reported for a login attempt.
///
/// Only the codes the controller reacts to are named; everything else is kept
/// as [`LoginResult::Other`] with its raw value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LoginResult {
    /// No result recorded (also the "unset" marker between attempts).
    #[default]
    Invalid,
    Ok,
    NoConnection,
    InvalidPassword,
    Timeout,
    ServiceUnavailable,
    AccountDisabled,
    TryAnotherCm,
    PasswordRequiredToKickSession,
    AccountLogonDenied,
    RateLimitExceeded,
    AccountLoginDeniedNeedTwoFactor,
    TwoFactorCodeMismatch,
    Other(i32),
}

impl LoginResult {
    /// Decodes a raw wire result code.
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Invalid,
            1 => Self::Ok,
            3 => Self::NoConnection,
            5 => Self::InvalidPassword,
            16 => Self::Timeout,
            20 => Self::ServiceUnavailable,
            43 => Self::AccountDisabled,
            48 => Self::TryAnotherCm,
            49 => Self::PasswordRequiredToKickSession,
            63 => Self::AccountLogonDenied,
            84 => Self::RateLimitExceeded,
            85 => Self::AccountLoginDeniedNeedTwoFactor,
            88 => Self::TwoFactorCodeMismatch,
            other => Self::Other(other),
        }
    }

    /// Returns the raw wire result code.
    pub fn code(self) -> i32 {
        match self {
            Self::Invalid => 0,
            Self::Ok => 1,
            Self::NoConnection => 3,
            Self::InvalidPassword => 5,
            Self::Timeout => 16,
            Self::ServiceUnavailable => 20,
            Self::AccountDisabled => 43,
            Self::TryAnotherCm => 48,
            Self::PasswordRequiredToKickSession => 49,
            Self::AccountLogonDenied => 63,
            Self::RateLimitExceeded => 84,
            Self::AccountLoginDeniedNeedTwoFactor => 85,
            Self::TwoFactorCodeMismatch => 88,
            Self::Other(code) => code,
        }
    }

    /// Network-level failures that are retried after a short fixed delay.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::NoConnection | Self::ServiceUnavailable | Self::Timeout | Self::TryAnotherCm
        )
    }

    /// Failures that must never be retried.
    ///
    /// An invalid password is only permanent when no persisted login key can
    /// be tried instead.
    pub fn is_permanent(self, has_login_key: bool) -> bool {
        match self {
            Self::AccountDisabled => true,
            Self::InvalidPassword => !has_login_key,
            _ => false,
        }
    }
}

impl fmt::Display for LoginResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Other(code) => write!(f, "Other({code})"),
            named => write!(f, "{named:?}"),
        }
    }
}

// =============================================================================
// Connection State
// =============================================================================

/// Lifecycle state of a controller's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    ConnectedUnauthenticated,
    LoggedOn,
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::ConnectedUnauthenticated => write!(f, "Connected-Unauthenticated"),
            Self::LoggedOn => write!(f, "LoggedOn"),
            Self::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

// =============================================================================
// Account Flags & Presence
// =============================================================================

/// Account flag bits reported with a successful login.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccountFlags(pub u32);

impl AccountFlags {
    pub const NORMAL_USER: Self = Self(0);
    pub const LIMITED_USER: Self = Self(1 << 12);
    pub const LIMITED_USER_FORCE: Self = Self(1 << 13);
    pub const LOCKDOWN: Self = Self(1 << 23);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Limited accounts have no access to the web API key.
    pub fn is_limited(self) -> bool {
        self.contains(Self::LIMITED_USER) || self.contains(Self::LIMITED_USER_FORCE)
    }

    pub fn is_locked(self) -> bool {
        self.contains(Self::LOCKDOWN)
    }
}

/// Presence advertised after login.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersonaState {
    Offline,
    #[default]
    Online,
    Busy,
    Away,
    Snooze,
    LookingToTrade,
    LookingToPlay,
    Invisible,
}

// =============================================================================
// Credentials
// =============================================================================

/// Kind of one-time code a login challenge asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodeKind {
    /// Guard code delivered out of band (e.g. by mail).
    AuthCode,
    /// Code from a two-factor authenticator.
    TwoFactor,
}

impl fmt::Display for CodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AuthCode => write!(f, "auth code"),
            Self::TwoFactor => write!(f, "two-factor code"),
        }
    }
}

/// Login material owned by a controller.
///
/// The password is kept in its configured (possibly encoded) form and decoded
/// by the controller right before use. The persisted login key lives in the
/// artifact store, not here.
#[derive(Clone, Default)]
pub struct Credentials {
    pub login: String,
    pub password: String,
    pub parental_code: Option<String>,
    pub auth_code: Option<String>,
    pub two_factor_code: Option<String>,
}

impl Credentials {
    pub fn new(login: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            login: login.into(),
            password: password.into(),
            ..Default::default()
        }
    }

    /// Returns `true` while a one-time code waits to be submitted.
    pub fn has_pending_code(&self) -> bool {
        self.auth_code.is_some() || self.two_factor_code.is_some()
    }

    /// Stores a one-time code supplied by the credential owner.
    pub fn set_code(&mut self, kind: CodeKind, code: String) {
        match kind {
            CodeKind::AuthCode => self.auth_code = Some(code),
            CodeKind::TwoFactor => self.two_factor_code = Some(code),
        }
    }

    /// Takes both one-time codes, leaving none pending.
    pub fn take_codes(&mut self) -> (Option<String>, Option<String>) {
        (self.auth_code.take(), self.two_factor_code.take())
    }

    pub fn clear_codes(&mut self) {
        self.auth_code = None;
        self.two_factor_code = None;
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("login", &self.login)
            .field("has_password", &!self.password.is_empty())
            .field("has_parental_code", &self.parental_code.is_some())
            .field("has_pending_code", &self.has_pending_code())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_result_round_trips_codes() {
        assert_eq!(LoginResult::from_code(84), LoginResult::RateLimitExceeded);
        assert_eq!(LoginResult::from_code(999), LoginResult::Other(999));
        assert_eq!(LoginResult::Other(999).code(), 999);
    }

    #[test]
    fn test_invalid_password_permanence_depends_on_login_key() {
        assert!(LoginResult::InvalidPassword.is_permanent(false));
        assert!(!LoginResult::InvalidPassword.is_permanent(true));
        assert!(LoginResult::AccountDisabled.is_permanent(true));
        assert!(!LoginResult::Timeout.is_permanent(false));
    }

    #[test]
    fn test_limited_flags() {
        assert!(AccountFlags(1 << 12 | 1).is_limited());
        assert!(AccountFlags::LIMITED_USER_FORCE.is_limited());
        assert!(!AccountFlags::NORMAL_USER.is_limited());
    }

    #[test]
    fn test_take_codes_clears_pending() {
        let mut credentials = Credentials::new("user", "pass");
        credentials.set_code(CodeKind::TwoFactor, "ABCDE".into());
        assert!(credentials.has_pending_code());

        let (auth, two_factor) = credentials.take_codes();
        assert_eq!(auth, None);
        assert_eq!(two_factor.as_deref(), Some("ABCDE"));
        assert!(!credentials.has_pending_code());
    }
}
