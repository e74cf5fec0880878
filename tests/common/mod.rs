//! Shared fixtures for integration tests.
//!
//! - [`RecordingUi`] records every UI call.
//! - [`RecordingTerminals`] hands out emulators whose output and lifecycle
//!   can be inspected after the fact.
//! - [`MockBackend`] is a local session server that records what clients
//!   send and plays a script after the `auth` frame.

#![allow(dead_code, reason = "each test binary uses a different subset")]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tempfile::TempDir;
use termtab::auth::AuthClient;
use termtab::storage::DurableStorage;
use termtab::tab::TabContainer;
use termtab::terminal::{FitAddon, InputSink, TerminalEmulator, TerminalFactory, TerminalPair};
use termtab::{Config, CredentialStore, Identity, NoticeLevel, SessionRegistry, SessionUi, TabId};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

// ============================================================================
// UI
// ============================================================================

/// One recorded UI call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    Notify(String, NoticeLevel),
    TabAddEnabled(bool),
    TabsVisible(bool),
    Loading(TabId, String),
    Cooldown(TabId, String),
    QuotaExceeded(TabId),
    ConnectionLost(TabId),
    AuthChanged(Option<String>),
}

#[derive(Debug, Default)]
pub struct RecordingUi {
    events: Mutex<Vec<UiEvent>>,
}

impl RecordingUi {
    pub fn events(&self) -> Vec<UiEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn contains(&self, event: &UiEvent) -> bool {
        self.events.lock().unwrap().contains(event)
    }

    pub fn notified(&self, needle: &str) -> bool {
        self.events
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, UiEvent::Notify(message, _) if message.contains(needle)))
    }

    fn push(&self, event: UiEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl SessionUi for RecordingUi {
    fn notify(&self, message: &str, level: NoticeLevel) {
        self.push(UiEvent::Notify(message.to_string(), level));
    }
    fn set_tab_add_enabled(&self, enabled: bool) {
        self.push(UiEvent::TabAddEnabled(enabled));
    }
    fn set_tabs_visible(&self, visible: bool) {
        self.push(UiEvent::TabsVisible(visible));
    }
    fn show_loading(&self, tab: TabId, message: &str) {
        self.push(UiEvent::Loading(tab, message.to_string()));
    }
    fn show_cooldown(&self, tab: TabId, formatted_time: &str) {
        self.push(UiEvent::Cooldown(tab, formatted_time.to_string()));
    }
    fn show_quota_exceeded(&self, tab: TabId) {
        self.push(UiEvent::QuotaExceeded(tab));
    }
    fn show_connection_lost(&self, tab: TabId) {
        self.push(UiEvent::ConnectionLost(tab));
    }
    fn auth_status_changed(&self, identity: Option<&Identity>) {
        self.push(UiEvent::AuthChanged(identity.map(|i| i.handle.clone())));
    }
}

// ============================================================================
// Terminals
// ============================================================================

/// What happened to one created terminal.
#[derive(Debug, Default)]
pub struct TerminalRecord {
    pub tab: Option<TabId>,
    pub container: Option<String>,
    pub output: Vec<u8>,
    pub sink: Option<InputSink>,
    pub size: (u16, u16),
    pub disposed: bool,
}

#[derive(Debug)]
struct RecordingTerminal {
    record: Arc<Mutex<TerminalRecord>>,
}

impl TerminalEmulator for RecordingTerminal {
    fn open(&mut self, container: &TabContainer) {
        self.record.lock().unwrap().container = Some(container.name.clone());
    }
    fn write(&mut self, data: &[u8]) {
        self.record.lock().unwrap().output.extend_from_slice(data);
    }
    fn on_data(&mut self, sink: InputSink) {
        self.record.lock().unwrap().sink = Some(sink);
    }
    fn cols(&self) -> u16 {
        self.record.lock().unwrap().size.0
    }
    fn rows(&self) -> u16 {
        self.record.lock().unwrap().size.1
    }
    fn resize(&mut self, cols: u16, rows: u16) {
        self.record.lock().unwrap().size = (cols, rows);
    }
    fn dispose(&mut self) {
        self.record.lock().unwrap().disposed = true;
    }
}

/// Fits every terminal to a fixed window size.
#[derive(Debug)]
struct FixedFit(u16, u16);

impl FitAddon for FixedFit {
    fn fit(&mut self, terminal: &mut dyn TerminalEmulator) {
        terminal.resize(self.0, self.1);
    }
}

/// Factory whose terminals stay inspectable after creation.
#[derive(Debug, Clone)]
pub struct RecordingTerminals {
    created: Arc<Mutex<Vec<Arc<Mutex<TerminalRecord>>>>>,
    window: (u16, u16),
}

impl RecordingTerminals {
    pub fn with_window(cols: u16, rows: u16) -> Self {
        Self {
            created: Arc::default(),
            window: (cols, rows),
        }
    }

    pub fn count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    /// Most recent terminal created for `tab`.
    pub fn latest(&self, tab: TabId) -> Option<Arc<Mutex<TerminalRecord>>> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|r| r.lock().unwrap().tab == Some(tab))
            .cloned()
    }

    pub fn output(&self, tab: TabId) -> String {
        self.latest(tab)
            .map(|r| String::from_utf8_lossy(&r.lock().unwrap().output).into_owned())
            .unwrap_or_default()
    }
}

impl TerminalFactory for RecordingTerminals {
    fn create(&self, tab: TabId, cols: u16, rows: u16) -> TerminalPair {
        let record = Arc::new(Mutex::new(TerminalRecord {
            tab: Some(tab),
            size: (cols, rows),
            ..TerminalRecord::default()
        }));
        self.created.lock().unwrap().push(Arc::clone(&record));
        TerminalPair::new(
            Box::new(RecordingTerminal { record }),
            Some(Box::new(FixedFit(self.window.0, self.window.1))),
        )
    }
}

// ============================================================================
// Backend
// ============================================================================

/// What the backend does after receiving `auth`.
#[derive(Debug, Clone)]
pub enum Step {
    /// Send a message.
    Send(Message),
    /// Drop the TCP connection without a close frame.
    Drop,
}

/// Shorthand for a text step.
pub fn text(json: &str) -> Step {
    Step::Send(Message::Text(json.to_string()))
}

#[derive(Debug, Default)]
struct BackendState {
    connections: AtomicUsize,
    closed: AtomicUsize,
    urls: Mutex<Vec<String>>,
    received: Mutex<Vec<String>>,
    pushers: Mutex<Vec<mpsc::UnboundedSender<Message>>>,
}

/// Local session server.
#[derive(Debug, Clone)]
pub struct MockBackend {
    url: String,
    state: Arc<BackendState>,
}

impl MockBackend {
    /// Serve `script` to every connection.
    pub async fn start(script: Vec<Step>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/", listener.local_addr().unwrap());
        let state = Arc::new(BackendState::default());

        let accept_state = Arc::clone(&state);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = Arc::clone(&accept_state);
                let script = script.clone();
                tokio::spawn(serve(stream, state, script));
            }
        });

        Self { url, state }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }

    pub fn urls(&self) -> Vec<String> {
        self.state.urls.lock().unwrap().clone()
    }

    pub fn received(&self) -> Vec<String> {
        self.state.received.lock().unwrap().clone()
    }

    /// Send a message on the most recent connection.
    pub fn push(&self, message: Message) {
        if let Some(tx) = self.state.pushers.lock().unwrap().last() {
            let _ = tx.send(message);
        }
    }

    /// Wait until a client has sent `count` frames in total.
    pub async fn wait_for_received(&self, count: usize) -> Vec<String> {
        for _ in 0..100 {
            if self.received().len() >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.received()
    }
}

async fn serve(stream: tokio::net::TcpStream, state: Arc<BackendState>, script: Vec<Step>) {
    let url_state = Arc::clone(&state);
    let capture = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        url_state.urls.lock().unwrap().push(request.uri().to_string());
        Ok(response)
    };
    let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, capture).await else {
        return;
    };
    state.connections.fetch_add(1, Ordering::SeqCst);

    let (push_tx, mut push_rx) = mpsc::unbounded_channel();
    state.pushers.lock().unwrap().push(push_tx);

    let (mut tx, mut rx) = ws.split();
    let mut authed = false;

    loop {
        tokio::select! {
            msg = rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let is_auth = text.contains(r#""type":"auth""#);
                    state.received.lock().unwrap().push(text);
                    if is_auth && !authed {
                        authed = true;
                        for step in &script {
                            match step {
                                Step::Send(message) => {
                                    if tx.send(message.clone()).await.is_err() {
                                        return;
                                    }
                                }
                                Step::Drop => return,
                            }
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
            Some(message) = push_rx.recv() => {
                if tx.send(message).await.is_err() {
                    break;
                }
            }
        }
    }
    state.closed.fetch_add(1, Ordering::SeqCst);
}

// ============================================================================
// Registry
// ============================================================================

pub struct Harness {
    pub dir: TempDir,
    pub ui: Arc<RecordingUi>,
    pub terminals: RecordingTerminals,
    pub registry: SessionRegistry,
}

/// Short timings so tests do not wait on production delays.
pub fn test_config(ws_url: &str) -> Config {
    Config {
        ws_url: Some(ws_url.to_string()),
        connection_timeout_ms: 2_000,
        connect_cooloff_ms: 20,
        teardown_grace_ms: 50,
        ..Config::default()
    }
}

pub fn harness(config: Config) -> Harness {
    harness_with_window(config, 160, 48)
}

pub fn harness_with_window(config: Config, cols: u16, rows: u16) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let ui = Arc::new(RecordingUi::default());
    let session_ui = Arc::clone(&ui) as Arc<dyn SessionUi>;
    let storage = DurableStorage::open_file(dir.path().join("storage.json")).unwrap();
    let credentials = CredentialStore::new(
        storage,
        AuthClient::new(&config).unwrap(),
        Arc::clone(&session_ui),
    );
    let terminals = RecordingTerminals::with_window(cols, rows);
    let registry =
        SessionRegistry::new(config, credentials, session_ui, Box::new(terminals.clone()));
    Harness {
        dir,
        ui,
        terminals,
        registry,
    }
}

/// Make `octocat`/`tok` the active credential.
pub fn login(registry: &mut SessionRegistry) {
    registry
        .credentials_mut()
        .adopt("tok", Identity::from_username("octocat"))
        .unwrap();
}

/// Process events until `done` holds or two seconds pass.
///
/// Rechecks `done` periodically too, for conditions changed by timers
/// rather than events (the connect latch).
pub async fn pump_until<F>(registry: &mut SessionRegistry, mut done: F) -> bool
where
    F: FnMut(&SessionRegistry) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !done(&*registry) {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::select! {
            event = registry.next_event() => match event {
                Some(event) => registry.handle_event(event),
                None => return false,
            },
            () = tokio::time::sleep(Duration::from_millis(10)) => {}
        }
    }
    true
}
