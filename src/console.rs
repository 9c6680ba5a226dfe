// src/console.rs
//
// Console model behind the main window.
//
// Holds everything the UI shows that is not widget state: the serial worker,
// the rendered scrollback, command history and the selected line ending.
// Both the desktop shell and the command-line tool drive this type; neither
// touches the worker directly.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::io::serial::{
    ConnectionInfo, DisconnectReason, EventSender, LineEnding, PortOpener, SerialWorker,
    SystemPorts, Transmitter, WorkerEvent, BAUD_RATES,
};
use crate::io::SerialError;
use crate::settings::MAX_HISTORY;
use crate::settings_store::SettingsStore;

/// Retained scrollback size; older text is trimmed from the front
const MAX_SCROLLBACK_BYTES: usize = 1 << 20;

// ============================================================================
// Scrollback
// ============================================================================

/// Append-only log of received text with a timestamp at the start of each line
pub struct Scrollback {
    text: String,
    at_line_start: bool,
    /// Trailing bytes of an incomplete UTF-8 sequence, completed by the next read
    pending: Vec<u8>,
    max_bytes: usize,
}

impl Default for Scrollback {
    fn default() -> Self {
        Self::with_limit(MAX_SCROLLBACK_BYTES)
    }
}

impl Scrollback {
    pub fn with_limit(max_bytes: usize) -> Self {
        Self {
            text: String::new(),
            at_line_start: true,
            pending: Vec::new(),
            max_bytes,
        }
    }

    /// Decode and timestamp `bytes`, append them, and return the rendered chunk
    pub fn append(&mut self, bytes: &[u8], now: DateTime<Local>) -> String {
        let decoded = decode_utf8_stream(&mut self.pending, bytes);
        let stamp = now.format("[%H:%M:%S%.3f] ").to_string();

        let mut rendered = String::with_capacity(decoded.len() + stamp.len());
        for c in decoded.chars() {
            if self.at_line_start {
                rendered.push_str(&stamp);
                self.at_line_start = false;
            }
            rendered.push(c);
            if c == '\n' {
                self.at_line_start = true;
            }
        }

        self.text.push_str(&rendered);
        self.trim();
        rendered
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Empty the scrollback; the next character starts a new timestamped line
    pub fn clear(&mut self) {
        self.text.clear();
        self.pending.clear();
        self.at_line_start = true;
    }

    fn trim(&mut self) {
        if self.text.len() <= self.max_bytes {
            return;
        }
        let mut cut = self.text.len() - self.max_bytes;
        while !self.text.is_char_boundary(cut) {
            cut += 1;
        }
        // Prefer cutting at a line boundary so the first retained line keeps its timestamp
        if let Some(offset) = self.text[cut..].find('\n') {
            if cut + offset + 1 < self.text.len() {
                cut += offset + 1;
            }
        }
        self.text.drain(..cut);
    }
}

/// Decode `bytes` appended to `pending`. Invalid sequences become U+FFFD; an
/// incomplete sequence at the end stays in `pending`.
fn decode_utf8_stream(pending: &mut Vec<u8>, bytes: &[u8]) -> String {
    pending.extend_from_slice(bytes);

    let mut out = String::with_capacity(pending.len());
    let mut start = 0;
    while start < pending.len() {
        match std::str::from_utf8(&pending[start..]) {
            Ok(s) => {
                out.push_str(s);
                start = pending.len();
            }
            Err(e) => {
                let valid = e.valid_up_to();
                out.push_str(&String::from_utf8_lossy(&pending[start..start + valid]));
                match e.error_len() {
                    Some(len) => {
                        out.push(char::REPLACEMENT_CHARACTER);
                        start += valid + len;
                    }
                    None => {
                        start += valid;
                        break;
                    }
                }
            }
        }
    }

    pending.drain(..start);
    out
}

// ============================================================================
// Command History
// ============================================================================

/// Sent commands in send order, oldest first. Duplicates are kept.
pub struct CommandHistory {
    entries: Vec<String>,
    limit: usize,
}

impl CommandHistory {
    pub fn new(entries: Vec<String>, limit: usize) -> Self {
        let mut history = Self {
            entries,
            limit,
        };
        history.enforce_limit();
        history
    }

    pub fn push(&mut self, text: &str) {
        self.entries.push(text.to_string());
        self.enforce_limit();
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    /// Remove the entries at `indices`; out-of-range indices are ignored
    pub fn delete(&mut self, indices: &[usize]) {
        let mut indices: Vec<usize> = indices
            .iter()
            .copied()
            .filter(|&i| i < self.entries.len())
            .collect();
        indices.sort_unstable();
        indices.dedup();
        for i in indices.into_iter().rev() {
            self.entries.remove(i);
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn enforce_limit(&mut self) {
        if self.entries.len() > self.limit {
            let excess = self.entries.len() - self.limit;
            self.entries.drain(..excess);
        }
    }
}

// ============================================================================
// Console
// ============================================================================

/// Connection status shown by the connect toggle and status bar
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub port: Option<String>,
    pub baud_rate: Option<u32>,
}

impl From<Option<ConnectionInfo>> for ConnectionStatus {
    fn from(info: Option<ConnectionInfo>) -> Self {
        match info {
            Some(info) => ConnectionStatus {
                connected: true,
                port: Some(info.port),
                baud_rate: Some(info.baud_rate),
            },
            None => ConnectionStatus {
                connected: false,
                port: None,
                baud_rate: None,
            },
        }
    }
}

/// What the UI should do after a worker event has been applied
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConsoleUpdate {
    /// Append `text` to the scrollback view
    Received { seq: u64, text: String, bytes: Vec<u8> },
    /// The connection ended; `error` is set when it ended unexpectedly
    Disconnected {
        status: ConnectionStatus,
        error: Option<SerialError>,
    },
}

/// Everything the main window needs to render itself from scratch
#[derive(Clone, Debug, Serialize)]
pub struct ConsoleSnapshot {
    pub status: ConnectionStatus,
    pub line_ending: LineEnding,
    pub line_endings: Vec<LineEnding>,
    pub baud_rates: Vec<u32>,
    pub last_port: String,
    pub last_baud_rate: u32,
    pub history: Vec<String>,
    pub scrollback: String,
    pub batch_content: String,
    pub batch_interval_ms: u64,
}

pub struct Console<O: PortOpener = SystemPorts> {
    worker: SerialWorker<O>,
    settings: Arc<SettingsStore>,
    line_ending: LineEnding,
    history: CommandHistory,
    scrollback: Scrollback,
}

impl<O: PortOpener> Console<O> {
    /// Build a console, restoring line ending and history from `settings`
    pub fn new(opener: O, events: EventSender, settings: Arc<SettingsStore>) -> Self {
        let saved = settings.get();
        Self {
            worker: SerialWorker::new(opener, events),
            line_ending: saved.line_ending,
            history: CommandHistory::new(saved.history, MAX_HISTORY),
            scrollback: Scrollback::default(),
            settings,
        }
    }

    pub fn status(&mut self) -> ConnectionStatus {
        self.worker.connection_info().into()
    }

    pub fn is_connected(&mut self) -> bool {
        self.worker.is_connected()
    }

    /// Open `port` and remember it (and the baud rate) for next time
    pub fn connect(&mut self, port: &str, baud_rate: u32) -> Result<ConnectionStatus, SerialError> {
        if port.trim().is_empty() {
            return Err(SerialError::connection(port, "no serial port selected"));
        }

        self.worker.open(port, baud_rate)?;
        self.settings.update(|s| {
            s.port = port.to_string();
            s.baud_rate = baud_rate;
        });
        tlog!("[console] Connected to {} at {} baud", port, baud_rate);
        Ok(self.status())
    }

    pub fn disconnect(&mut self) -> ConnectionStatus {
        self.worker.close();
        self.status()
    }

    pub fn line_ending(&self) -> LineEnding {
        self.line_ending
    }

    pub fn set_line_ending(&mut self, line_ending: LineEnding) {
        self.line_ending = line_ending;
        self.settings.update(|s| s.line_ending = line_ending);
    }

    /// Encode `text` with the current line ending for the open connection.
    /// `None` for whitespace-only text.
    pub fn prepare_send(&mut self, text: &str) -> Result<Option<OutboundText>, SerialError> {
        if text.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(OutboundText {
            text: text.to_string(),
            bytes: self.line_ending.encode(text),
            transmitter: self.worker.transmitter()?,
        }))
    }

    /// Append a successfully sent command to history
    pub fn record_sent(&mut self, text: &str) {
        self.history.push(text);
        self.persist_history();
    }

    pub fn history(&self) -> &[String] {
        self.history.entries()
    }

    pub fn delete_history(&mut self, indices: &[usize]) {
        self.history.delete(indices);
        self.persist_history();
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
        self.persist_history();
    }

    pub fn scrollback(&self) -> &str {
        self.scrollback.text()
    }

    pub fn clear_scrollback(&mut self) {
        self.scrollback.clear();
    }

    /// Remember the batch send box contents and interval
    pub fn set_batch_draft(&mut self, content: &str, interval_ms: u64) {
        self.settings.update(|s| {
            s.batch_content = content.to_string();
            s.batch_interval_ms = interval_ms;
        });
    }

    /// Apply a worker event to the console state
    pub fn handle_event(&mut self, event: WorkerEvent, now: DateTime<Local>) -> ConsoleUpdate {
        match event {
            WorkerEvent::Data { seq, bytes } => {
                let text = self.scrollback.append(&bytes, now);
                ConsoleUpdate::Received { seq, text, bytes }
            }
            WorkerEvent::Disconnected { port, reason } => {
                let error = match reason {
                    DisconnectReason::Closed => None,
                    DisconnectReason::Unexpected(reason) => {
                        tlog!("[console] {} disconnected unexpectedly: {}", port, reason);
                        Some(SerialError::unexpected_disconnect(&port, reason))
                    }
                };
                ConsoleUpdate::Disconnected {
                    status: self.status(),
                    error,
                }
            }
        }
    }

    pub fn snapshot(&mut self) -> ConsoleSnapshot {
        let saved = self.settings.get();
        ConsoleSnapshot {
            status: self.status(),
            line_ending: self.line_ending,
            line_endings: LineEnding::ALL.to_vec(),
            baud_rates: BAUD_RATES.to_vec(),
            last_port: saved.port,
            last_baud_rate: saved.baud_rate,
            history: self.history.entries().to_vec(),
            scrollback: self.scrollback.text().to_string(),
            batch_content: saved.batch_content,
            batch_interval_ms: saved.batch_interval_ms,
        }
    }

    /// Close the connection; called on application exit
    pub fn shutdown(&mut self) {
        self.worker.close();
    }

    fn persist_history(&self) {
        let history = self.history.entries().to_vec();
        self.settings.update(|s| s.history = history);
    }
}

/// An encoded command bound to the connection it was prepared for
pub struct OutboundText {
    text: String,
    bytes: Vec<u8>,
    transmitter: Transmitter,
}

impl OutboundText {
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Write the bytes; blocks until the device has drained them
    pub fn transmit(&self) -> Result<usize, SerialError> {
        self.transmitter.send(&self.bytes)
    }
}

/// Lock a shared console, recovering from a poisoned lock
pub fn lock_console<O: PortOpener>(console: &Mutex<Console<O>>) -> MutexGuard<'_, Console<O>> {
    match console.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Send `text` with the current line ending and record it in history.
/// Returns the number of bytes written; whitespace-only text is ignored.
///
/// The console lock is held only to encode and to record, never while
/// waiting on the device.
pub fn send_text<O: PortOpener>(
    console: &Mutex<Console<O>>,
    text: &str,
) -> Result<usize, SerialError> {
    let Some(outbound) = lock_console(console).prepare_send(text)? else {
        return Ok(0);
    };
    let written = outbound.transmit()?;
    lock_console(console).record_sent(outbound.text());
    Ok(written)
}

// ============================================================================
// Tests
// ============================================================================
