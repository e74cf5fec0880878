//! UI collaborator contract.
//!
//! The session core never renders anything itself. Every user-visible
//! outcome goes through [`SessionUi`], which a front end implements. All
//! failure states are static messages; recovering from them always takes an
//! explicit user action.

use crate::credentials::Identity;
use crate::tab::TabId;

/// Severity of a status notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    /// Progress information.
    Info,
    /// Something completed.
    Success,
    /// Something failed.
    Error,
}

/// Front-end hooks driven by the session core.
///
/// Calls happen on the event loop, in the order the triggering events were
/// processed. Implementations must not block.
pub trait SessionUi: Send + Sync + std::fmt::Debug {
    /// Show a status line.
    fn notify(&self, message: &str, level: NoticeLevel);

    /// Enable or disable the control that opens a new tab.
    fn set_tab_add_enabled(&self, enabled: bool);

    /// Show or hide the multi-tab chrome.
    fn set_tabs_visible(&self, visible: bool);

    /// Replace the tab's content with a loading message.
    fn show_loading(&self, tab: TabId, message: &str);

    /// Replace the tab's content with a cooldown notice.
    fn show_cooldown(&self, tab: TabId, formatted_time: &str);

    /// Replace the tab's content with a quota notice.
    fn show_quota_exceeded(&self, tab: TabId);

    /// Replace the tab's content with a connection-lost notice.
    fn show_connection_lost(&self, tab: TabId);

    /// The active credential changed. `None` means logged out.
    fn auth_status_changed(&self, identity: Option<&Identity>);
}

/// [`SessionUi`] for a line-oriented terminal front end.
///
/// Writes notices to stderr with `\r\n` endings so they render correctly
/// while the terminal is in raw mode, and mirrors everything to the log.
#[derive(Debug, Default)]
pub struct ConsoleUi;

impl ConsoleUi {
    fn line(&self, text: &str) {
        eprint!("\r\n{text}\r\n");
    }
}

impl SessionUi for ConsoleUi {
    fn notify(&self, message: &str, level: NoticeLevel) {
        match level {
            NoticeLevel::Error => {
                log::error!("{message}");
                self.line(&format!("[error] {message}"));
            }
            NoticeLevel::Success => {
                log::info!("{message}");
                self.line(message);
            }
            NoticeLevel::Info => log::info!("{message}"),
        }
    }

    fn set_tab_add_enabled(&self, enabled: bool) {
        log::debug!("New tab control {}", if enabled { "enabled" } else { "disabled" });
    }

    fn set_tabs_visible(&self, visible: bool) {
        log::debug!("Tab bar {}", if visible { "shown" } else { "hidden" });
    }

    fn show_loading(&self, tab: TabId, message: &str) {
        self.line(&format!("[tab {tab}] {message} Please wait."));
    }

    fn show_cooldown(&self, tab: TabId, formatted_time: &str) {
        self.line(&format!(
            "[tab {tab}] The session has expired. \
             Reconnect after {formatted_time} to request a new session."
        ));
    }

    fn show_quota_exceeded(&self, tab: TabId) {
        self.line(&format!(
            "[tab {tab}] You reached the maximum number of terminals. \
             Are you connected from several clients at once?"
        ));
    }

    fn show_connection_lost(&self, tab: TabId) {
        self.line(&format!(
            "[tab {tab}] Connection to the server has been lost. Log in again to reconnect."
        ));
    }

    fn auth_status_changed(&self, identity: Option<&Identity>) {
        match identity {
            Some(identity) => log::info!("Authenticated as {}", identity.display_name),
            None => log::info!("Not authenticated"),
        }
    }
}
