//! Terminal-emulator collaborator.
//!
//! The core drives an emulator through [`TerminalEmulator`] and never
//! interprets terminal output itself. An emulator and its optional
//! [`FitAddon`] always travel together in a [`TerminalPair`], so the
//! registry cannot drop one while keeping a reference to the other.
//!
//! [`StdoutTerminal`] is the emulator used by the `termtab` binary: the
//! local terminal in raw mode, with remote output written straight to
//! stdout.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use tokio::sync::mpsc;

use crate::lifecycle::Outbound;
use crate::protocol::ClientFrame;
use crate::tab::{TabContainer, TabId};

/// Sends user keystrokes to a tab's current socket as `data` frames.
///
/// One sink exists per tab and outlives individual sockets; the registry
/// rebinds it whenever the tab gets a new socket. Input typed while no
/// socket is bound is dropped.
#[derive(Debug, Clone, Default)]
pub struct InputSink {
    target: Arc<Mutex<Option<mpsc::UnboundedSender<Outbound>>>>,
}

impl InputSink {
    /// Unbound sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn target(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<Outbound>>> {
        self.target.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn bind(&self, tx: mpsc::UnboundedSender<Outbound>) {
        *self.target() = Some(tx);
    }

    pub(crate) fn unbind(&self) {
        *self.target() = None;
    }

    /// Whether a socket is bound.
    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.target().is_some()
    }

    /// Forward `data` to the remote terminal.
    pub fn send(&self, data: &str) {
        let frame = ClientFrame::Data {
            data: data.to_string(),
        };
        let delivered = self
            .target()
            .as_ref()
            .is_some_and(|tx| tx.send(Outbound::Frame(frame)).is_ok());
        if !delivered {
            log::trace!("[Terminal] Dropping input, no open socket");
        }
    }
}

/// Terminal emulator bound to one tab.
pub trait TerminalEmulator: Send + std::fmt::Debug {
    /// Attach to the tab's display region.
    fn open(&mut self, container: &TabContainer);

    /// Render remote output.
    fn write(&mut self, data: &[u8]);

    /// Route user input to `sink`.
    fn on_data(&mut self, sink: InputSink);

    /// Current width in columns.
    fn cols(&self) -> u16;

    /// Current height in rows.
    fn rows(&self) -> u16;

    /// Change the emulator geometry.
    fn resize(&mut self, cols: u16, rows: u16);

    /// Release all resources. The emulator is not used afterwards.
    fn dispose(&mut self);
}

/// Layout helper that sizes an emulator to its container.
pub trait FitAddon: Send + std::fmt::Debug {
    /// Resize `terminal` to fill its container.
    fn fit(&mut self, terminal: &mut dyn TerminalEmulator);
}

/// Emulator plus its optional fit helper.
#[derive(Debug)]
pub struct TerminalPair {
    /// The emulator.
    pub emulator: Box<dyn TerminalEmulator>,
    /// Optional fit helper for the same emulator.
    pub fit: Option<Box<dyn FitAddon>>,
}

impl TerminalPair {
    /// Pair an emulator with an optional fit helper.
    #[must_use]
    pub fn new(emulator: Box<dyn TerminalEmulator>, fit: Option<Box<dyn FitAddon>>) -> Self {
        Self { emulator, fit }
    }

    /// Run the fit helper, if any.
    pub fn fit(&mut self) {
        if let Some(fit) = self.fit.as_mut() {
            fit.fit(self.emulator.as_mut());
        }
    }

    /// Dispose the emulator, consuming both halves.
    pub fn dispose(mut self) {
        self.emulator.dispose();
    }
}

/// Creates emulators for tabs.
pub trait TerminalFactory: Send + Sync + std::fmt::Debug {
    /// New emulator for `tab` with the given initial geometry.
    fn create(&self, tab: TabId, cols: u16, rows: u16) -> TerminalPair;
}

// ============================================================================
// Stdout-backed emulator
// ============================================================================

/// Key that detaches the local terminal from the session (Ctrl-]).
pub const DETACH_KEY: u8 = 0x1d;

/// Restores cooked mode on drop, including on panic.
#[derive(Debug)]
pub struct RawModeGuard;

impl RawModeGuard {
    /// Enable raw mode until the guard is dropped.
    pub fn enable() -> std::io::Result<Self> {
        enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

/// Emulator that hands remote output to the local terminal.
///
/// Only the attached tab owns stdin and stdout. Emulators for other tabs
/// track geometry and discard output.
#[derive(Debug)]
pub struct StdoutTerminal {
    tab: TabId,
    attached: bool,
    cols: u16,
    rows: u16,
    raw_mode: Option<RawModeGuard>,
    disposed: Arc<AtomicBool>,
    detach_tx: mpsc::UnboundedSender<TabId>,
}

impl StdoutTerminal {
    fn new(
        tab: TabId,
        attached: bool,
        (cols, rows): (u16, u16),
        detach_tx: mpsc::UnboundedSender<TabId>,
    ) -> Self {
        Self {
            tab,
            attached,
            cols,
            rows,
            raw_mode: None,
            disposed: Arc::new(AtomicBool::new(false)),
            detach_tx,
        }
    }
}

impl TerminalEmulator for StdoutTerminal {
    fn open(&mut self, container: &TabContainer) {
        if !self.attached {
            log::debug!("[Terminal] Opened {} in the background", container.name);
            return;
        }
        match RawModeGuard::enable() {
            Ok(guard) => self.raw_mode = Some(guard),
            Err(e) => log::warn!("[Terminal] Could not enable raw mode: {e}"),
        }
        log::debug!("[Terminal] Opened {}", container.name);
    }

    fn write(&mut self, data: &[u8]) {
        if !self.attached {
            log::trace!("[Terminal] Tab {} not attached, discarding {} bytes", self.tab, data.len());
            return;
        }
        let mut stdout = std::io::stdout().lock();
        if let Err(e) = stdout.write_all(data).and_then(|()| stdout.flush()) {
            log::warn!("[Terminal] stdout write failed: {e}");
        }
    }

    fn on_data(&mut self, sink: InputSink) {
        if !self.attached {
            return;
        }
        let disposed = Arc::clone(&self.disposed);
        let detach_tx = self.detach_tx.clone();
        let tab = self.tab;

        // stdin has no async reader that can be cancelled; the thread exits
        // on the first read after dispose.
        let spawned = std::thread::Builder::new()
            .name(format!("termtab-stdin-{tab}"))
            .spawn(move || {
                let mut stdin = std::io::stdin();
                let mut buf = [0u8; 1024];
                let mut pending = Vec::new();
                loop {
                    let n = match stdin.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    if disposed.load(Ordering::SeqCst) {
                        break;
                    }
                    if buf[..n].contains(&DETACH_KEY) {
                        let _ = detach_tx.send(tab);
                        break;
                    }
                    let text = decode_input(&mut pending, &buf[..n]);
                    if !text.is_empty() {
                        sink.send(&text);
                    }
                }
            });
        if let Err(e) = spawned {
            log::error!("[Terminal] Failed to start input thread: {e}");
        }
    }

    fn cols(&self) -> u16 {
        self.cols
    }

    fn rows(&self) -> u16 {
        self.rows
    }

    fn resize(&mut self, cols: u16, rows: u16) {
        self.cols = cols;
        self.rows = rows;
    }

    fn dispose(&mut self) {
        self.disposed.store(true, Ordering::SeqCst);
        self.raw_mode = None;
    }
}

/// Length of a UTF-8 sequence cut off at the end of `bytes`, or 0.
fn incomplete_tail(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let byte = bytes[bytes.len() - back];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let needed = match byte {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        return if needed > back { back } else { 0 };
    }
    0
}

/// Decode a stdin read, holding back a trailing partial character until the
/// next read completes it.
fn decode_input(pending: &mut Vec<u8>, bytes: &[u8]) -> String {
    pending.extend_from_slice(bytes);
    let split = pending.len() - incomplete_tail(pending);
    let text = String::from_utf8_lossy(&pending[..split]).into_owned();
    pending.drain(..split);
    text
}

/// Fit helper that matches the local terminal window.
#[derive(Debug, Default)]
pub struct WindowFit;

impl FitAddon for WindowFit {
    fn fit(&mut self, terminal: &mut dyn TerminalEmulator) {
        match crossterm::terminal::size() {
            Ok((cols, rows)) => terminal.resize(cols, rows),
            Err(e) => log::debug!("[Terminal] Window size unavailable: {e}"),
        }
    }
}

/// Factory for [`StdoutTerminal`]s.
///
/// Detach requests (Ctrl-]) from any created terminal arrive on the
/// receiver returned by [`StdoutTerminalFactory::new`].
#[derive(Debug)]
pub struct StdoutTerminalFactory {
    attached: TabId,
    detach_tx: mpsc::UnboundedSender<TabId>,
}

impl StdoutTerminalFactory {
    /// Create the factory and its detach receiver. Terminals for `attached`
    /// use the local terminal; all others run in the background.
    #[must_use]
    pub fn new(attached: TabId) -> (Self, mpsc::UnboundedReceiver<TabId>) {
        let (detach_tx, detach_rx) = mpsc::unbounded_channel();
        (
            Self {
                attached,
                detach_tx,
            },
            detach_rx,
        )
    }
}

impl TerminalFactory for StdoutTerminalFactory {
    fn create(&self, tab: TabId, cols: u16, rows: u16) -> TerminalPair {
        let attached = tab == self.attached;
        TerminalPair::new(
            Box::new(StdoutTerminal::new(
                tab,
                attached,
                (cols, rows),
                self.detach_tx.clone(),
            )),
            attached.then(|| Box::new(WindowFit) as Box<dyn FitAddon>),
        )
    }
}
