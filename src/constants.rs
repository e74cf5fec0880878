//! Application-wide constants for termtab.
//!
//! This module centralizes the magic numbers of the session protocol and
//! the client-side policy so they can be discovered in one place. Values
//! that users may want to tune (timeouts, geometry) have a matching field
//! in [`crate::config::Config`]; the constants here are the defaults.
//!
//! # Categories
//!
//! - **Tabs**: concurrency limits and identifiers
//! - **Timeouts**: connection, latch and teardown timing
//! - **Geometry**: default terminal size
//! - **Protocol**: server message indicators

use std::time::Duration;

// ============================================================================
// Tabs
// ============================================================================

/// Maximum number of terminal tabs that may exist at once.
pub const MAX_TABS: usize = 4;

/// Storage key holding the JSON list of active tab identifiers.
pub const ACTIVE_TABS_KEY: &str = "terminal_active_tabs";

// ============================================================================
// Timeouts
// ============================================================================

/// How long a socket may take to reach the open state before the attempt
/// is abandoned with `ConnectionTimeout`.
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Minimum time the connect latch stays held after an attempt resolves.
///
/// Absorbs duplicate connect calls fired in quick succession (a click and
/// an automatic trigger landing together).
pub const CONNECT_COOLOFF: Duration = Duration::from_millis(1000);

/// Delay between a fatal policy signal and closing every socket.
///
/// Lets the final frames drain so the notice is not cut off by the
/// teardown it triggers.
pub const TEARDOWN_GRACE: Duration = Duration::from_millis(200);

/// HTTP request timeout for calls to the auth server.
pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Geometry
// ============================================================================

/// Default terminal width. Resize frames never go below this.
pub const DEFAULT_COLS: u16 = 120;

/// Default terminal height. Resize frames never go below this.
pub const DEFAULT_ROWS: u16 = 30;

// ============================================================================
// Protocol indicators
// ============================================================================

/// Substring of an `error` frame message signalling an expired bearer token.
pub const TOKEN_EXPIRED_INDICATOR: &str = "token expired";

/// Substring of an `error` frame message signalling the concurrent session
/// quota has been reached.
pub const QUOTA_EXCEEDED_INDICATOR: &str = "you have reached the maximum limit";

/// Substring of a cooldown-carrying message that also ends the login.
pub const SESSION_EXPIRED_INDICATOR: &str = "session expired";

/// Name of the cookie carrying the bearer token.
pub const AUTH_COOKIE_NAME: &str = "auth_token";
