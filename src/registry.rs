//! Session Registry.
//!
//! Owns every tab's socket, terminal and connection state, and runs the
//! event loop that all background producers feed into.
//!
//! # Event loop
//!
//! Connection tasks and timers never touch registry state. They send a
//! [`RegistryEvent`] on one unbounded channel and the owner of the
//! registry drives [`SessionRegistry::run_until`], which applies events one
//! at a time in arrival order. Frames from one socket are therefore handled
//! in order, and no locking is needed beyond the connect latch.
//!
//! # Slots
//!
//! ```text
//! tabs: [ Some(tab 1), Some(tab 2), None, None ]
//!                ^ always present
//! ```
//!
//! A tab holds at most one socket. Replacing or closing a socket detaches
//! it first, so the old task's late events are dropped as unknown.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::Config;
use crate::constants::{ACTIVE_TABS_KEY, MAX_TABS};
use crate::credentials::{CredentialStore, RestoreOutcome};
use crate::error::{FatalKind, SessionError};
use crate::latch::ConnectLatch;
use crate::lifecycle::{
    self, ConnectRequest, ConnectionEvent, ConnectionState, SocketEvent, SocketHandle, Trigger,
};
use crate::policy::{self, CooldownNotice};
use crate::protocol::{self, ClientFrame, Inbound, ServerFrame, ServerFrameType};
use crate::tab::{TabId, TabSession};
use crate::terminal::TerminalFactory;
use crate::ui::{NoticeLevel, SessionUi};
use crate::ws;

/// Event delivered to the registry's loop.
#[derive(Debug)]
pub enum RegistryEvent {
    /// Something happened on a tab's socket.
    Socket(SocketEvent),
    /// The grace delay after a fatal frame elapsed; close everything.
    TeardownDue,
}

impl From<SocketEvent> for RegistryEvent {
    fn from(event: SocketEvent) -> Self {
        Self::Socket(event)
    }
}

/// Result of a connect request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// A connection task was started.
    Started {
        /// Identifier of the new socket.
        socket_id: u64,
    },
    /// Another connect is in flight or cooling off; nothing was done.
    Skipped,
}

/// Owner of all tab sessions.
#[derive(Debug)]
pub struct SessionRegistry {
    config: Config,
    tabs: [Option<TabSession>; MAX_TABS],
    active_tab: TabId,
    latch: ConnectLatch,
    /// Socket whose resolution releases the latch.
    pending_connect: Option<u64>,
    next_socket_id: u64,
    teardown_scheduled: bool,
    cooldown: Option<CooldownNotice>,
    credentials: CredentialStore,
    ui: Arc<dyn SessionUi>,
    terminals: Box<dyn TerminalFactory>,
    events_tx: mpsc::UnboundedSender<RegistryEvent>,
    events_rx: mpsc::UnboundedReceiver<RegistryEvent>,
}

impl SessionRegistry {
    /// Registry with tab 1 present and active.
    pub fn new(
        config: Config,
        credentials: CredentialStore,
        ui: Arc<dyn SessionUi>,
        terminals: Box<dyn TerminalFactory>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut tabs: [Option<TabSession>; MAX_TABS] = std::array::from_fn(|_| None);
        tabs[TabId::FIRST.index()] = Some(TabSession::new(TabId::FIRST));

        Self {
            config,
            tabs,
            active_tab: TabId::FIRST,
            latch: ConnectLatch::new(),
            pending_connect: None,
            next_socket_id: 1,
            teardown_scheduled: false,
            cooldown: None,
            credentials,
            ui,
            terminals,
            events_tx,
            events_rx,
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Credential store.
    #[must_use]
    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    /// Mutable credential store.
    pub fn credentials_mut(&mut self) -> &mut CredentialStore {
        &mut self.credentials
    }

    /// Currently active tab.
    #[must_use]
    pub fn active_tab(&self) -> TabId {
        self.active_tab
    }

    /// Existing tabs in ascending order.
    #[must_use]
    pub fn tab_ids(&self) -> Vec<TabId> {
        self.tabs.iter().flatten().map(|session| session.id).collect()
    }

    /// Number of existing tabs.
    #[must_use]
    pub fn tab_count(&self) -> usize {
        self.tabs.iter().flatten().count()
    }

    /// Session record of `tab`.
    #[must_use]
    pub fn session(&self, tab: TabId) -> Option<&TabSession> {
        self.tabs[tab.index()].as_ref()
    }

    /// Lifecycle state of `tab`.
    #[must_use]
    pub fn state(&self, tab: TabId) -> Option<ConnectionState> {
        self.session(tab).map(|session| session.state)
    }

    /// Whether `tab` currently owns a socket, open or not.
    #[must_use]
    pub fn has_socket(&self, tab: TabId) -> bool {
        self.session(tab).is_some_and(|session| session.socket.is_some())
    }

    /// Number of sockets across all tabs.
    #[must_use]
    pub fn socket_count(&self) -> usize {
        self.tabs
            .iter()
            .flatten()
            .filter(|session| session.socket.is_some())
            .count()
    }

    /// Whether `tab` has a terminal attached.
    #[must_use]
    pub fn has_terminal(&self, tab: TabId) -> bool {
        self.session(tab).is_some_and(|session| session.terminal.is_some())
    }

    /// Cooldown received in this process, if any.
    #[must_use]
    pub fn cooldown(&self) -> Option<&CooldownNotice> {
        self.cooldown.as_ref()
    }

    /// The process-wide connect latch.
    #[must_use]
    pub fn latch(&self) -> &ConnectLatch {
        &self.latch
    }

    // ========================================================================
    // Event loop
    // ========================================================================

    /// Wait for the next event.
    pub async fn next_event(&mut self) -> Option<RegistryEvent> {
        self.events_rx.recv().await
    }

    /// Process events until `stop` completes.
    pub async fn run_until<F>(&mut self, stop: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(stop);
        loop {
            tokio::select! {
                () = &mut stop => break,
                event = self.events_rx.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
            }
        }
    }

    /// Process events for `duration`.
    pub async fn run_for(&mut self, duration: Duration) {
        self.run_until(tokio::time::sleep(duration)).await;
    }

    /// Apply one event.
    pub fn handle_event(&mut self, event: RegistryEvent) {
        match event {
            RegistryEvent::Socket(event) => self.handle_socket_event(event),
            RegistryEvent::TeardownDue => {
                self.teardown_scheduled = false;
                log::info!("[Registry] Grace delay elapsed, closing all connections");
                self.close_all();
            }
        }
    }

    fn handle_socket_event(&mut self, event: SocketEvent) {
        let SocketEvent {
            tab,
            socket_id,
            event,
        } = event;

        let current = self
            .session(tab)
            .and_then(|session| session.socket.as_ref())
            .map(SocketHandle::id);
        if current != Some(socket_id) {
            log::trace!("[Registry] Dropping event from detached socket {socket_id} (tab {tab})");
            return;
        }

        match event {
            ConnectionEvent::Opened => {
                self.resolve_pending(socket_id);
                if let Some(session) = self.tabs[tab.index()].as_mut() {
                    if let Some(socket) = session.socket.as_mut() {
                        socket.mark_open();
                    }
                    session.state.apply(tab, Trigger::Opened);
                    session.touch();
                }
            }
            ConnectionEvent::Text(text) => self.on_inbound(tab, protocol::classify_text(&text)),
            ConnectionEvent::Binary(data) => self.on_inbound(tab, protocol::classify_binary(data)),
            ConnectionEvent::Closed { clean, code } => {
                self.resolve_pending(socket_id);
                self.on_closed(tab, clean, code);
            }
            ConnectionEvent::Failed(err) => {
                self.resolve_pending(socket_id);
                self.on_failed(tab, err);
            }
        }
    }

    fn resolve_pending(&mut self, socket_id: u64) {
        if self.pending_connect == Some(socket_id) {
            self.pending_connect = None;
            self.latch.release_after(self.config.connect_cooloff());
        }
    }

    // ========================================================================
    // Inbound frames
    // ========================================================================

    fn on_inbound(&mut self, tab: TabId, inbound: Inbound) {
        if let Some(session) = self.tabs[tab.index()].as_mut() {
            session.touch();
        }
        match inbound {
            Inbound::Raw(bytes) => self.write_output(tab, &bytes),
            Inbound::Ignored(kind) => log::debug!("[Registry] Tab {tab}: ignoring '{kind}' frame"),
            Inbound::Control(frame) => self.on_control(tab, &frame),
        }
    }

    fn on_control(&mut self, tab: TabId, frame: &ServerFrame) {
        match frame.kind {
            ServerFrameType::VmCreating => {
                if self.transition(tab, Trigger::VmCreating) {
                    self.ui.show_loading(tab, "Creating your environment...");
                    self.ui.set_tab_add_enabled(false);
                }
            }
            ServerFrameType::VmReady => {
                if self.transition(tab, Trigger::VmReady) {
                    log::info!("[Registry] Tab {tab}: environment ready");
                    self.ui.set_tabs_visible(true);
                    self.ui.set_tab_add_enabled(true);
                    if !self.has_terminal(tab) {
                        self.attach_terminal(tab);
                    }
                }
            }
            ServerFrameType::Connected => {
                if self.transition(tab, Trigger::Activity) {
                    self.ui.notify("SSH connection established", NoticeLevel::Success);
                }
            }
            ServerFrameType::Data => {
                if let Some(data) = &frame.data {
                    self.write_output(tab, data.as_bytes());
                }
            }
            ServerFrameType::Error => {
                self.ui
                    .notify(&format!("Error: {}", frame.message()), NoticeLevel::Error);
                self.ui.set_tab_add_enabled(false);
                self.enforce_policy(tab, frame);
            }
            ServerFrameType::EnvironmentTerminated => {
                self.ui.set_tab_add_enabled(false);
                self.enforce_policy(tab, frame);
            }
            ServerFrameType::Closed => {
                self.ui.notify("SSH connection closed", NoticeLevel::Info);
            }
        }
    }

    fn transition(&mut self, tab: TabId, trigger: Trigger) -> bool {
        self.tabs[tab.index()]
            .as_mut()
            .is_some_and(|session| session.state.apply(tab, trigger))
    }

    fn write_output(&mut self, tab: TabId, bytes: &[u8]) {
        if !self.transition(tab, Trigger::Activity) {
            return;
        }
        match self.tabs[tab.index()]
            .as_mut()
            .and_then(|session| session.terminal.as_mut())
        {
            Some(pair) => pair.emulator.write(bytes),
            None => log::trace!("[Registry] Tab {tab}: no terminal, dropping {} bytes", bytes.len()),
        }
    }

    fn enforce_policy(&mut self, tab: TabId, frame: &ServerFrame) {
        let decision = policy::evaluate(tab, frame);
        if decision.is_inert() {
            return;
        }

        if decision.fatal.is_some() {
            self.transition(tab, Trigger::Failure);
        }
        if decision.invalidate_credential {
            self.credentials.invalidate();
        }
        if decision.quota_exceeded {
            self.ui.show_quota_exceeded(tab);
        }
        if let Some(notice) = decision.cooldown {
            self.dispose_terminal(tab);
            self.ui.set_tabs_visible(false);
            self.ui.show_cooldown(tab, &notice.formatted_time);
            self.cooldown = Some(notice);
        }
        if decision.teardown_after_grace {
            self.schedule_teardown();
        }
    }

    fn schedule_teardown(&mut self) {
        if self.teardown_scheduled {
            return;
        }
        self.teardown_scheduled = true;

        let tx = self.events_tx.clone();
        let grace = self.config.teardown_grace();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = tx.send(RegistryEvent::TeardownDue);
        });
    }

    // ========================================================================
    // Socket termination
    // ========================================================================

    fn on_closed(&mut self, tab: TabId, clean: bool, code: u16) {
        self.drop_socket(tab);
        if clean {
            log::info!("[Registry] Tab {tab}: connection closed cleanly, code {code}");
            if self.transition(tab, Trigger::CleanClose) {
                self.transition(tab, Trigger::SocketGone);
            }
        } else {
            log::warn!("[Registry] Tab {tab}: connection died unexpectedly, code {code}");
            self.transition(tab, Trigger::Failure);
            self.connection_lost(tab);
        }
    }

    fn on_failed(&mut self, tab: TabId, err: SessionError) {
        self.drop_socket(tab);
        self.transition(tab, Trigger::Failure);
        self.ui.notify(&err.to_string(), NoticeLevel::Error);
        if err.invalidates_credential() {
            self.connection_lost(tab);
        }
    }

    fn connection_lost(&mut self, tab: TabId) {
        self.ui.set_tabs_visible(false);
        self.ui.show_connection_lost(tab);
        self.credentials.invalidate();
    }

    /// Forget a socket whose task has already finished.
    fn drop_socket(&mut self, tab: TabId) {
        if let Some(session) = self.tabs[tab.index()].as_mut() {
            session.input.unbind();
            session.socket = None;
        }
    }

    /// Detach and close a live socket. Its task reports nothing afterwards.
    fn detach_socket(&mut self, tab: TabId) {
        let Some(session) = self.tabs[tab.index()].as_mut() else {
            return;
        };
        let Some(handle) = session.socket.take() else {
            return;
        };
        session.input.unbind();
        if session.state.apply(tab, Trigger::CloseRequested)
            && session.state == ConnectionState::Closing
        {
            session.state.apply(tab, Trigger::SocketGone);
        }

        let socket_id = handle.id();
        handle.close();
        log::debug!("[Registry] Tab {tab}: socket {socket_id} closed");

        // The task stays silent after a requested close, so its pending
        // connect resolves here.
        self.resolve_pending(socket_id);
    }

    fn dispose_terminal(&mut self, tab: TabId) {
        if let Some(pair) = self.tabs[tab.index()]
            .as_mut()
            .and_then(|session| session.terminal.take())
        {
            log::debug!("[Registry] Tab {tab}: disposing terminal");
            pair.dispose();
        }
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Open a socket for `tab`.
    ///
    /// While another connect is in flight or cooling off, returns
    /// [`ConnectOutcome::Skipped`] without doing anything. Without a
    /// resolvable credential (token plus identity), fails with
    /// [`SessionError::MissingCredential`] and opens nothing. An existing socket on the tab is closed first.
    pub fn connect(
        &mut self,
        tab: TabId,
        force_session_check: bool,
    ) -> Result<ConnectOutcome, SessionError> {
        if self.session(tab).is_none() {
            return Err(SessionError::UnknownTab(tab));
        }
        if self.cooldown.is_some() {
            log::info!("[Registry] Tab {tab}: connect refused during cooldown");
            return Err(SessionError::ProtocolFatal(FatalKind::Cooldown));
        }
        if !self.latch.try_acquire() {
            log::debug!("[Registry] Tab {tab}: connect already in progress, skipping");
            return Ok(ConnectOutcome::Skipped);
        }

        let Some(credential) = self
            .credentials
            .resolve()
            .or_else(|| self.credentials.active().cloned())
        else {
            let err = SessionError::MissingCredential;
            self.ui.notify(&err.to_string(), NoticeLevel::Error);
            self.latch.release_after(self.config.connect_cooloff());
            return Err(err);
        };
        let token = credential.token;

        let url = match ws::session_url(&self.config, &token, tab, force_session_check) {
            Ok(url) => url,
            Err(e) => {
                let err = SessionError::TransportError(format!("{e:#}"));
                self.ui.notify(&err.to_string(), NoticeLevel::Error);
                self.latch.release_after(self.config.connect_cooloff());
                return Err(err);
            }
        };

        self.detach_socket(tab);
        self.ui.show_loading(tab, "Connecting to terminal...");

        let socket_id = self.next_socket_id;
        self.next_socket_id += 1;

        let handle = lifecycle::spawn_connection(
            ConnectRequest {
                tab,
                socket_id,
                url,
                timeout: self.config.connection_timeout(),
            },
            self.events_tx.clone(),
        );

        if let Some(session) = self.tabs[tab.index()].as_mut() {
            session.state.apply(tab, Trigger::Connect);
            session.input.bind(handle.outbound());
            session.socket = Some(handle);
        }
        self.pending_connect = Some(socket_id);
        Ok(ConnectOutcome::Started { socket_id })
    }

    /// Make `tab` active and make sure it has a live terminal.
    ///
    /// Does nothing while unauthenticated. Refits the terminal of an open
    /// socket, attaches one to an open socket without a terminal, and
    /// otherwise connects.
    pub fn switch_active_tab(&mut self, tab: TabId) -> Result<(), SessionError> {
        if !self.credentials.is_authenticated() {
            log::debug!("[Registry] Ignoring switch to tab {tab}, not authenticated");
            return Ok(());
        }
        if self.session(tab).is_none() {
            return Err(SessionError::UnknownTab(tab));
        }
        self.active_tab = tab;
        self.ensure_live(tab)
    }

    /// Add a tab and switch to it.
    ///
    /// Fails with [`SessionError::TabLimitExceeded`] when all slots are in
    /// use, leaving the registry untouched.
    pub fn create_tab(&mut self) -> Result<TabId, SessionError> {
        let Some(tab) = self
            .tabs
            .iter()
            .position(Option::is_none)
            .and_then(|index| TabId::new(index + 1))
        else {
            let err = SessionError::TabLimitExceeded;
            self.ui
                .notify(&format!("{err} ({MAX_TABS})"), NoticeLevel::Error);
            return Err(err);
        };

        self.tabs[tab.index()] = Some(TabSession::new(tab));
        self.remember_tab(tab);
        log::info!("[Registry] Created tab {tab}");

        if let Err(e) = self.switch_active_tab(tab) {
            log::warn!("[Registry] Tab {tab} created but not connected: {e}");
        }
        Ok(tab)
    }

    /// Close one tab's socket and terminal.
    ///
    /// Tab 1 keeps its slot; any other tab is removed.
    pub fn close_tab(&mut self, tab: TabId) -> Result<(), SessionError> {
        if self.session(tab).is_none() {
            return Err(SessionError::UnknownTab(tab));
        }
        self.detach_socket(tab);
        self.dispose_terminal(tab);

        if tab != TabId::FIRST {
            self.tabs[tab.index()] = None;
            self.forget_tab(tab);
            log::info!("[Registry] Removed tab {tab}");
        }
        if self.active_tab == tab && tab != TabId::FIRST {
            self.active_tab = TabId::FIRST;
        }
        Ok(())
    }

    /// Detach and close every socket.
    ///
    /// Terminals stay attached so their content remains visible.
    pub fn close_all(&mut self) {
        log::info!("[Registry] Closing all connections");
        for tab in self.tab_ids() {
            self.detach_socket(tab);
        }
    }

    /// Close everything and clear session-scoped state before exit.
    pub fn shutdown(&mut self) {
        self.close_all();
        for tab in self.tab_ids() {
            self.dispose_terminal(tab);
        }
        if let Err(e) = self.credentials.storage_mut().remove(ACTIVE_TABS_KEY) {
            log::warn!("[Registry] Failed to clear active tab list: {e:#}");
        }
    }

    /// Close every socket and clear the credential.
    pub fn logout(&mut self) {
        self.close_all();
        self.credentials.invalidate();
    }

    /// The terminal became visible: connect the active tab, or refit it
    /// when its socket is already open.
    pub fn show(&mut self) -> Result<(), SessionError> {
        self.ensure_live(self.active_tab)
    }

    /// Refit an open socket's terminal, attach one to an open socket, or
    /// connect. A terminal left behind by a closed socket is reused once the
    /// new socket reports `vm_ready`.
    fn ensure_live(&mut self, tab: TabId) -> Result<(), SessionError> {
        let Some(session) = self.session(tab) else {
            return Err(SessionError::UnknownTab(tab));
        };

        if !session.has_open_socket() {
            return self.connect(tab, false).map(|_| ());
        }
        if session.terminal.is_some() {
            self.resize_tab(tab)?;
        } else {
            self.attach_terminal(tab);
        }
        Ok(())
    }

    /// Restore the credential at startup and connect when possible.
    ///
    /// Returns whether the client ended up authenticated.
    pub async fn restore_session(&mut self) -> Result<bool, SessionError> {
        match self.credentials.restore() {
            RestoreOutcome::Authenticated(_) => {
                self.show()?;
                Ok(true)
            }
            RestoreOutcome::NeedsValidation(token) => {
                self.complete_login(&token, false).await?;
                Ok(true)
            }
            RestoreOutcome::Unauthenticated => Ok(false),
        }
    }

    /// Adopt a token issued by the auth server and connect the active tab.
    ///
    /// `force_session_check` asks the backend to look for an existing
    /// session, used right after an OAuth login.
    pub async fn complete_login(
        &mut self,
        token: &str,
        force_session_check: bool,
    ) -> Result<(), SessionError> {
        self.credentials.set_session_cookie(Some(token.to_string()));
        if let Err(e) = self.credentials.validate_and_adopt(token).await {
            self.credentials.set_session_cookie(None);
            return Err(e);
        }
        self.connect(self.active_tab, force_session_check).map(|_| ())
    }

    /// Refit `tab` and send its geometry if the socket is open.
    ///
    /// Geometry never goes below the configured defaults. Returns whether a
    /// resize frame was sent.
    pub fn resize_tab(&mut self, tab: TabId) -> Result<bool, SessionError> {
        let (min_cols, min_rows) = (self.config.default_cols, self.config.default_rows);
        let Some(session) = self.tabs[tab.index()].as_mut() else {
            return Err(SessionError::UnknownTab(tab));
        };
        let Some(pair) = session.terminal.as_mut() else {
            return Ok(false);
        };
        pair.fit();

        let Some(socket) = session.socket.as_ref().filter(|socket| socket.is_open()) else {
            return Ok(false);
        };
        let cols = pair.emulator.cols().max(min_cols);
        let rows = pair.emulator.rows().max(min_rows);
        log::trace!("[Registry] Tab {tab}: resize {cols}x{rows}");
        Ok(socket.send(ClientFrame::Resize { cols, rows }))
    }

    /// Refit every tab with a terminal.
    pub fn resize_all(&mut self) {
        for tab in self.tab_ids() {
            if let Err(e) = self.resize_tab(tab) {
                log::debug!("[Registry] Resize of tab {tab} failed: {e}");
            }
        }
    }

    /// Create and bind a terminal for `tab`, disposing any previous one.
    fn attach_terminal(&mut self, tab: TabId) {
        self.dispose_terminal(tab);

        let mut pair =
            self.terminals
                .create(tab, self.config.default_cols, self.config.default_rows);
        let Some(session) = self.tabs[tab.index()].as_mut() else {
            pair.dispose();
            return;
        };
        pair.emulator.open(&session.container);
        pair.emulator.on_data(session.input.clone());
        session.terminal = Some(pair);
        log::debug!("[Registry] Tab {tab}: terminal attached");

        if let Err(e) = self.resize_tab(tab) {
            log::debug!("[Registry] Initial resize of tab {tab} failed: {e}");
        }
    }

    // ========================================================================
    // Active tab list
    // ========================================================================

    fn stored_tabs(&self) -> Vec<String> {
        self.credentials
            .storage()
            .get_json(ACTIVE_TABS_KEY)
            .unwrap_or_else(|| vec![TabId::FIRST.to_string()])
    }

    fn remember_tab(&mut self, tab: TabId) {
        let mut tabs = self.stored_tabs();
        let id = tab.to_string();
        if !tabs.contains(&id) {
            tabs.push(id);
            if let Err(e) = self.credentials.storage_mut().set_json(ACTIVE_TABS_KEY, &tabs) {
                log::warn!("[Registry] Failed to store active tab list: {e:#}");
            }
        }
    }

    fn forget_tab(&mut self, tab: TabId) {
        let mut tabs = self.stored_tabs();
        let id = tab.to_string();
        if tabs.contains(&id) {
            tabs.retain(|t| *t != id);
            if let Err(e) = self.credentials.storage_mut().set_json(ACTIVE_TABS_KEY, &tabs) {
                log::warn!("[Registry] Failed to store active tab list: {e:#}");
            }
        }
    }
}
