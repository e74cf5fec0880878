//! Per-tab connection lifecycle.
//!
//! Two halves:
//!
//! - [`ConnectionState`] and its transition table. The registry feeds every
//!   socket event through [`ConnectionState::apply`]; transitions missing
//!   from the table are logged and rejected.
//! - [`spawn_connection`], one tokio task per connection attempt. It opens
//!   the socket under a timeout, sends the `auth` frame, then pumps frames
//!   both ways until the socket ends. Everything it observes is reported as
//!   a [`SocketEvent`] on the registry's event channel.
//!
//! # Detaching
//!
//! The registry detaches a socket by dropping it from the tab before asking
//! the task to close. The task emits nothing after a requested close, and
//! events from sockets the registry no longer knows are discarded, so an
//! intentional teardown never shows up as a failure.

use std::time::Duration;

use reqwest::Url;
use tokio::sync::mpsc;

use crate::error::SessionError;
use crate::protocol::ClientFrame;
use crate::tab::TabId;
use crate::ws::{self, WsMessage, WsReader, WsWriter};

/// Lifecycle state of one tab's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection attempted yet.
    Idle,
    /// Socket opening.
    Connecting,
    /// Socket open, `auth` sent.
    AwaitingAuthAck,
    /// Backend is allocating the remote environment.
    Provisioning,
    /// Terminal attached and streaming.
    Ready,
    /// Close requested or clean close received.
    Closing,
    /// Socket gone after an orderly close.
    Closed,
    /// Attempt or session ended by an error.
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::AwaitingAuthAck => "awaiting-auth-ack",
            Self::Provisioning => "provisioning",
            Self::Ready => "ready",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Input to the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// A connect request was accepted.
    Connect,
    /// The socket opened.
    Opened,
    /// `vm_creating` received.
    VmCreating,
    /// `vm_ready` received.
    VmReady,
    /// `connected`, `data` or raw output received.
    Activity,
    /// Transport error, unclean close, timeout or fatal control frame.
    Failure,
    /// Intentional close by the client.
    CloseRequested,
    /// The server closed the socket cleanly.
    CleanClose,
    /// The socket is gone.
    SocketGone,
}

impl ConnectionState {
    /// Target state for `trigger`, or `None` when the table has no entry.
    #[must_use]
    pub fn next(self, trigger: Trigger) -> Option<Self> {
        use ConnectionState as S;
        use Trigger as T;

        match (self, trigger) {
            (S::Idle | S::Closed | S::Failed, T::Connect) => Some(S::Connecting),
            (S::Connecting, T::Opened) => Some(S::AwaitingAuthAck),
            (S::AwaitingAuthAck | S::Provisioning, T::VmCreating) => Some(S::Provisioning),
            (S::AwaitingAuthAck | S::Provisioning | S::Ready, T::VmReady) => Some(S::Ready),
            (S::AwaitingAuthAck | S::Provisioning | S::Ready, T::Activity) => Some(self),
            // Quota errors fail the tab but leave the socket streaming.
            (S::Failed, T::Activity) => Some(S::Failed),
            (S::Idle, T::Failure) => None,
            (_, T::Failure) => Some(S::Failed),
            (S::Failed, T::CloseRequested) => Some(S::Failed),
            (
                S::Connecting | S::AwaitingAuthAck | S::Provisioning | S::Ready,
                T::CloseRequested | T::CleanClose,
            ) => Some(S::Closing),
            (S::Closing, T::SocketGone) => Some(S::Closed),
            _ => None,
        }
    }

    /// Apply `trigger`, logging and ignoring transitions outside the table.
    ///
    /// Returns whether the transition was accepted.
    pub fn apply(&mut self, tab: TabId, trigger: Trigger) -> bool {
        match self.next(trigger) {
            Some(next) => {
                if next != *self {
                    log::debug!("[Connection] Tab {tab}: {self} -> {next}");
                }
                *self = next;
                true
            }
            None => {
                log::warn!("[Connection] Tab {tab}: rejected {trigger:?} in state {self}");
                false
            }
        }
    }

    /// Whether the socket has passed its opening handshake.
    #[must_use]
    pub fn is_open(self) -> bool {
        matches!(self, Self::AwaitingAuthAck | Self::Provisioning | Self::Ready)
    }
}

/// Command from the registry to a connection task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Send a frame.
    Frame(ClientFrame),
    /// Close the socket without reporting back.
    Close,
}

/// What happened on a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Handshake done and `auth` sent.
    Opened,
    /// Text payload.
    Text(String),
    /// Binary payload.
    Binary(Vec<u8>),
    /// Server closed the socket.
    Closed {
        /// Whether the close handshake completed normally.
        clean: bool,
        /// Close code.
        code: u16,
    },
    /// The attempt or session failed.
    Failed(SessionError),
}

/// A [`ConnectionEvent`] tagged with its origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketEvent {
    /// Owning tab.
    pub tab: TabId,
    /// Socket the event came from.
    pub socket_id: u64,
    /// The event.
    pub event: ConnectionEvent,
}

/// Registry-side handle of a connection task.
#[derive(Debug)]
pub struct SocketHandle {
    id: u64,
    tx: mpsc::UnboundedSender<Outbound>,
    open: bool,
}

impl SocketHandle {
    /// Socket identifier, unique per process.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the opening handshake completed.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Record that the socket opened.
    pub fn mark_open(&mut self) {
        self.open = true;
    }

    /// Queue a frame. Returns `false` if the task is gone.
    pub fn send(&self, frame: ClientFrame) -> bool {
        self.tx.send(Outbound::Frame(frame)).is_ok()
    }

    pub(crate) fn outbound(&self) -> mpsc::UnboundedSender<Outbound> {
        self.tx.clone()
    }

    /// Close the socket. The task reports nothing afterwards.
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for SocketHandle {
    fn drop(&mut self) {
        // Input sinks hold sender clones, so the channel alone would not end the task.
        let _ = self.tx.send(Outbound::Close);
    }
}

/// Parameters of one connection attempt.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    /// Tab the socket belongs to.
    pub tab: TabId,
    /// Unique socket identifier.
    pub socket_id: u64,
    /// Session URL including the token.
    pub url: Url,
    /// Time allowed for the socket to open.
    pub timeout: Duration,
}

/// Start a connection task and return its handle.
///
/// Events go to `events`. Must be called from within a tokio runtime.
pub fn spawn_connection<E>(request: ConnectRequest, events: mpsc::UnboundedSender<E>) -> SocketHandle
where
    E: From<SocketEvent> + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = SocketHandle {
        id: request.socket_id,
        tx,
        open: false,
    };
    tokio::spawn(run_connection(request, rx, events));
    handle
}

async fn run_connection<E>(
    request: ConnectRequest,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<E>,
) where
    E: From<SocketEvent> + Send + 'static,
{
    let tab = request.tab;
    let emit = |event: ConnectionEvent| {
        let _ = events.send(E::from(SocketEvent {
            tab,
            socket_id: request.socket_id,
            event,
        }));
    };

    log::info!("[Connection] Tab {tab}: connecting (socket {})", request.socket_id);

    let connected = tokio::select! {
        () = closed_before_open(&mut outbound_rx) => {
            log::debug!("[Connection] Tab {tab}: abandoned before open");
            return;
        }
        result = tokio::time::timeout(request.timeout, ws::connect(&request.url)) => result,
    };

    let (mut writer, mut reader) = match connected {
        Ok(Ok(pair)) => pair,
        Ok(Err(e)) => {
            log::warn!("[Connection] Tab {tab}: {e:#}");
            emit(ConnectionEvent::Failed(SessionError::TransportError(format!("{e:#}"))));
            return;
        }
        Err(_elapsed) => {
            log::warn!("[Connection] Tab {tab}: {}", SessionError::ConnectionTimeout);
            emit(ConnectionEvent::Failed(SessionError::ConnectionTimeout));
            return;
        }
    };

    if let Err(e) = send_frame(&mut writer, &ClientFrame::Auth).await {
        emit(ConnectionEvent::Failed(SessionError::TransportError(format!("{e:#}"))));
        return;
    }
    log::info!("[Connection] Tab {tab}: socket open, auth sent");
    emit(ConnectionEvent::Opened);

    pump(tab, &mut writer, &mut reader, &mut outbound_rx, emit).await;
}

/// Resolves when the registry closes the socket before it has opened.
/// Frames queued in the meantime are dropped.
async fn closed_before_open(outbound_rx: &mut mpsc::UnboundedReceiver<Outbound>) {
    loop {
        match outbound_rx.recv().await {
            Some(Outbound::Frame(frame)) => {
                log::debug!("[Connection] Dropping {frame:?}, socket not open yet");
            }
            Some(Outbound::Close) | None => return,
        }
    }
}

async fn send_frame(writer: &mut WsWriter, frame: &ClientFrame) -> anyhow::Result<()> {
    writer.send_text(&frame.encode()?).await
}

/// Move frames both ways until the socket ends or the registry closes it.
///
/// Emits exactly one `Closed` or `Failed` event, unless the registry asked
/// for the close.
async fn pump<F>(
    tab: TabId,
    writer: &mut WsWriter,
    reader: &mut WsReader,
    outbound_rx: &mut mpsc::UnboundedReceiver<Outbound>,
    emit: F,
) where
    F: Fn(ConnectionEvent),
{
    loop {
        tokio::select! {
            msg = reader.recv() => match msg {
                Some(Ok(WsMessage::Text(text))) => emit(ConnectionEvent::Text(text)),
                Some(Ok(WsMessage::Binary(data))) => emit(ConnectionEvent::Binary(data)),
                Some(Ok(WsMessage::Ping(data))) => {
                    if let Err(e) = writer.send_pong(data).await {
                        log::debug!("[Connection] Tab {tab}: pong failed: {e:#}");
                    }
                }
                Some(Ok(WsMessage::Close { code, reason })) => {
                    let clean = ws::is_clean_close(code);
                    log::info!("[Connection] Tab {tab}: closed by server, code {code} {reason}");
                    emit(ConnectionEvent::Closed { clean, code });
                    return;
                }
                Some(Err(e)) => {
                    log::warn!("[Connection] Tab {tab}: {e:#}");
                    emit(ConnectionEvent::Failed(SessionError::TransportError(format!("{e:#}"))));
                    return;
                }
                None => {
                    log::warn!("[Connection] Tab {tab}: stream ended without close frame");
                    emit(ConnectionEvent::Closed { clean: false, code: 1006 });
                    return;
                }
            },
            cmd = outbound_rx.recv() => match cmd {
                Some(Outbound::Frame(frame)) => {
                    if let Err(e) = send_frame(writer, &frame).await {
                        log::warn!("[Connection] Tab {tab}: send failed: {e:#}");
                        emit(ConnectionEvent::Failed(SessionError::TransportError(format!("{e:#}"))));
                        return;
                    }
                }
                Some(Outbound::Close) | None => {
                    log::debug!("[Connection] Tab {tab}: closing on request");
                    if let Err(e) = writer.close().await {
                        log::debug!("[Connection] Tab {tab}: close failed: {e:#}");
                    }
                    return;
                }
            },
        }
    }
}
