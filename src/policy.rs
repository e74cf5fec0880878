//! Quota and cooldown policy.
//!
//! Turns fatal control frames into a [`PolicyDecision`]. The checks are
//! independent: one `error` frame can both expire the token and carry a
//! cooldown, and every matching action applies. Indicator matching ignores
//! case.
//!
//! Cooldown expiry is never tracked locally. The notice stays until the user
//! starts over; the backend decides when a new session is allowed.

use chrono::{DateTime, Local, TimeZone};

use crate::constants::{
    QUOTA_EXCEEDED_INDICATOR, SESSION_EXPIRED_INDICATOR, TOKEN_EXPIRED_INDICATOR,
};
use crate::error::FatalKind;
use crate::protocol::{Cooldown, ExpiryTimestamp, ServerFrame, ServerFrameType};
use crate::tab::TabId;

/// Shown when the server sends a cooldown without a usable expiry.
const UNKNOWN_EXPIRY: &str = "a later time";

/// Cooldown shown in a tab.
#[derive(Debug, Clone, PartialEq)]
pub struct CooldownNotice {
    /// Tab that received the cooldown.
    pub tab: TabId,
    /// Expiry as sent by the server.
    pub expiry_timestamp: Option<ExpiryTimestamp>,
    /// Display-ready expiry time.
    pub formatted_time: String,
}

/// Actions required by one control frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PolicyDecision {
    /// Clear the active credential.
    pub invalidate_credential: bool,
    /// Show the quota notice in the tab.
    pub quota_exceeded: bool,
    /// Dispose the tab's terminal and show this notice.
    pub cooldown: Option<CooldownNotice>,
    /// Close every socket after the grace delay.
    pub teardown_after_grace: bool,
    /// Most severe fatal condition found, for logging and state tracking.
    pub fatal: Option<FatalKind>,
}

impl PolicyDecision {
    /// Whether the frame requires no action.
    #[must_use]
    pub fn is_inert(&self) -> bool {
        *self == Self::default()
    }
}

/// Evaluate a control frame received on `tab`.
#[must_use]
pub fn evaluate(tab: TabId, frame: &ServerFrame) -> PolicyDecision {
    let mut decision = PolicyDecision::default();

    match frame.kind {
        ServerFrameType::Error => {
            let message = frame.message().to_lowercase();

            if message.contains(QUOTA_EXCEEDED_INDICATOR) {
                decision.quota_exceeded = true;
                decision.fatal = Some(FatalKind::QuotaExceeded);
            }
            if let Some(cooldown) = &frame.cooldown {
                decision.cooldown = Some(notice(tab, cooldown));
                decision.teardown_after_grace = true;
                decision.fatal = Some(FatalKind::Cooldown);
                if message.contains(SESSION_EXPIRED_INDICATOR) {
                    decision.invalidate_credential = true;
                }
            }
            if message.contains(TOKEN_EXPIRED_INDICATOR) {
                decision.invalidate_credential = true;
                decision.teardown_after_grace = true;
                decision.fatal = Some(FatalKind::TokenExpired);
            }
        }
        ServerFrameType::EnvironmentTerminated => match &frame.cooldown {
            Some(cooldown) => {
                decision.cooldown = Some(notice(tab, cooldown));
                decision.teardown_after_grace = true;
                decision.fatal = Some(FatalKind::Cooldown);
            }
            None => log::info!("[Policy] Environment terminated on tab {tab} without cooldown"),
        },
        _ => {}
    }

    if let Some(kind) = decision.fatal {
        log::info!("[Policy] Tab {tab}: {kind}");
    }
    decision
}

fn notice(tab: TabId, cooldown: &Cooldown) -> CooldownNotice {
    CooldownNotice {
        tab,
        expiry_timestamp: cooldown.expiry_timestamp.clone(),
        formatted_time: format_cooldown(cooldown),
    }
}

/// Server-supplied `formattedTime`, else the expiry as local `HH:MM`.
#[must_use]
pub fn format_cooldown(cooldown: &Cooldown) -> String {
    if let Some(formatted) = cooldown.formatted_time.as_deref().filter(|s| !s.is_empty()) {
        return formatted.to_string();
    }
    cooldown
        .expiry_timestamp
        .as_ref()
        .and_then(expiry_local)
        .map_or_else(
            || UNKNOWN_EXPIRY.to_string(),
            |time| time.format("%H:%M").to_string(),
        )
}

fn expiry_local(expiry: &ExpiryTimestamp) -> Option<DateTime<Local>> {
    match expiry {
        ExpiryTimestamp::Millis(ms) => Local.timestamp_millis_opt(*ms).single(),
        ExpiryTimestamp::Text(text) => DateTime::parse_from_rfc3339(text)
            .ok()
            .map(|time| time.with_timezone(&Local)),
    }
}
