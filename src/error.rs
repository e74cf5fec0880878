//! Error taxonomy for session management.
//!
//! Plumbing (config, storage, HTTP) reports `anyhow` errors with context.
//! Everything a caller of the session API can observe is a [`SessionError`].

use crate::tab::TabId;

/// Fatal conditions signalled by the backend through control frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalKind {
    /// The bearer token is no longer accepted.
    TokenExpired,
    /// The identity already runs the maximum number of sessions.
    QuotaExceeded,
    /// The environment was terminated and a new one may only be requested later.
    Cooldown,
}

impl std::fmt::Display for FatalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TokenExpired => write!(f, "token expired"),
            Self::QuotaExceeded => write!(f, "session quota exceeded"),
            Self::Cooldown => write!(f, "environment in cooldown"),
        }
    }
}

/// Errors observable through the session API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// No credential could be resolved; no socket was opened.
    MissingCredential,
    /// The socket did not reach the open state in time.
    ConnectionTimeout,
    /// The socket reported an error or closed uncleanly.
    TransportError(String),
    /// The backend signalled a fatal condition.
    ProtocolFatal(FatalKind),
    /// A payload could not be decoded as a control frame.
    ///
    /// Never surfaced to users; such payloads are handled as raw terminal data.
    MalformedFrame,
    /// All tab slots are in use.
    TabLimitExceeded,
    /// No tab exists with this identifier.
    UnknownTab(TabId),
    /// The auth server rejected or failed to validate the token.
    Validation(String),
}

impl SessionError {
    /// Whether the error ends the credential's usefulness.
    #[must_use]
    pub fn invalidates_credential(&self) -> bool {
        matches!(
            self,
            Self::TransportError(_) | Self::ProtocolFatal(FatalKind::TokenExpired)
        )
    }
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingCredential => write!(f, "Cannot connect: missing authentication token"),
            Self::ConnectionTimeout => write!(f, "Connection timeout. Server not responding."),
            Self::TransportError(msg) => write!(f, "Connection error: {msg}"),
            Self::ProtocolFatal(kind) => write!(f, "Session ended: {kind}"),
            Self::MalformedFrame => write!(f, "Malformed control frame"),
            Self::TabLimitExceeded => write!(f, "Maximum number of terminals reached"),
            Self::UnknownTab(tab) => write!(f, "No terminal tab {tab}"),
            Self::Validation(msg) => write!(f, "Token validation failed: {msg}"),
        }
    }
}

impl std::error::Error for SessionError {}
