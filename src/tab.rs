//! Tab identifiers and per-tab session records.
//!
//! Tabs live in a small bounded key space (`1..=MAX_TABS`). A [`TabId`]
//! can only be constructed inside that range, which lets the registry keep
//! its sessions in a fixed-size array indexed by [`TabId::index`].

use std::time::Instant;

use crate::constants::MAX_TABS;
use crate::lifecycle::{ConnectionState, SocketHandle};
use crate::terminal::{InputSink, TerminalPair};

/// Identifier of a terminal tab, `1..=MAX_TABS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TabId(u8);

impl TabId {
    /// The tab that always exists.
    pub const FIRST: TabId = TabId(1);

    /// Create a tab id, returning `None` outside `1..=MAX_TABS`.
    #[must_use]
    pub fn new(n: usize) -> Option<Self> {
        if (1..=MAX_TABS).contains(&n) {
            u8::try_from(n).ok().map(Self)
        } else {
            None
        }
    }

    /// Zero-based slot index.
    #[must_use]
    pub fn index(self) -> usize {
        usize::from(self.0) - 1
    }

    /// Numeric value.
    #[must_use]
    pub fn get(self) -> u8 {
        self.0
    }
}

impl std::fmt::Display for TabId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TabId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<usize>()
            .ok()
            .and_then(TabId::new)
            .ok_or_else(|| format!("tab id must be between 1 and {MAX_TABS}, got {s:?}"))
    }
}

/// Display region owned by a tab, handed to the terminal emulator on open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabContainer {
    /// Owning tab.
    pub tab: TabId,
    /// Stable element name, `terminal-container-<tab>`.
    pub name: String,
}

impl TabContainer {
    /// Container for `tab`.
    #[must_use]
    pub fn for_tab(tab: TabId) -> Self {
        Self {
            tab,
            name: format!("terminal-container-{tab}"),
        }
    }
}

/// Socket, terminal and connection state of one tab.
#[derive(Debug)]
pub struct TabSession {
    /// Tab identifier.
    pub id: TabId,
    /// Backing display region.
    pub container: TabContainer,
    /// Live socket, if any. At most one per tab.
    pub socket: Option<SocketHandle>,
    /// Terminal emulator and its fit helper, present or absent together.
    pub terminal: Option<TerminalPair>,
    /// Keystroke sink handed to the emulator, bound to the current socket.
    pub input: InputSink,
    /// Lifecycle state.
    pub state: ConnectionState,
    /// Last time a frame arrived or input was sent.
    pub last_activity_at: Instant,
}

impl TabSession {
    /// Fresh idle session for `id`.
    #[must_use]
    pub fn new(id: TabId) -> Self {
        Self {
            id,
            container: TabContainer::for_tab(id),
            socket: None,
            terminal: None,
            input: InputSink::new(),
            state: ConnectionState::Idle,
            last_activity_at: Instant::now(),
        }
    }

    /// Whether the tab's socket has completed its opening handshake.
    #[must_use]
    pub fn has_open_socket(&self) -> bool {
        self.socket.as_ref().is_some_and(SocketHandle::is_open)
    }

    /// Record activity now.
    pub fn touch(&mut self) {
        self.last_activity_at = Instant::now();
    }
}
