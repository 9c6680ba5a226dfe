// src/batch.rs
//
// Batch sender: sends a multi-line script one line at a time with a fixed
// delay between lines. Runs as an async task; stopped through a cancel flag.

use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::console::{lock_console, send_text, Console};
use crate::io::serial::PortOpener;
use crate::io::SerialError;

/// Upper bound on how long a stop request waits during an inter-line delay
const CANCEL_POLL: Duration = Duration::from_millis(20);

/// Lines of a batch script, in send order
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchJob {
    lines: Vec<String>,
}

impl BatchJob {
    /// Split `text` into lines. Blank lines are skipped; a trailing `\r` is
    /// dropped so CRLF scripts send the same bytes as LF ones.
    pub fn parse(text: &str) -> Self {
        let lines = text
            .trim()
            .split('\n')
            .map(|line| line.strip_suffix('\r').unwrap_or(line))
            .filter(|line| !line.trim().is_empty())
            .map(str::to_string)
            .collect();
        Self { lines }
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// Progress payload emitted after each line
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BatchProgress {
    /// 1-based position of the line
    pub index: usize,
    pub total: usize,
    pub line: String,
    pub error: Option<String>,
}

impl BatchProgress {
    pub fn message(&self) -> String {
        match &self.error {
            None => format!("Sent [{}/{}]: {}", self.index, self.total, self.line),
            Some(e) => format!(
                "Failed [{}/{}]: {} ({})",
                self.index, self.total, self.line, e
            ),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchOutcome {
    /// Every line was attempted
    Completed,
    /// A stop was requested
    Cancelled,
    /// The connection was lost
    Aborted,
}

impl BatchOutcome {
    pub fn message(&self) -> &'static str {
        match self {
            BatchOutcome::Completed => "Send completed",
            BatchOutcome::Cancelled => "Send stopped",
            BatchOutcome::Aborted => "Send aborted: disconnected",
        }
    }
}

/// Send every line of `job` through `console`, waiting `interval_ms` between
/// lines. `report` is called after each attempted line.
pub async fn run_batch<O, F>(
    console: Arc<Mutex<Console<O>>>,
    job: BatchJob,
    interval_ms: u64,
    cancel_flag: Arc<AtomicBool>,
    mut report: F,
) -> BatchOutcome
where
    O: PortOpener,
    F: FnMut(BatchProgress),
{
    let total = job.len();
    let interval = Duration::from_millis(interval_ms);
    tlog!("[batch] Starting {} lines, interval {}ms", total, interval_ms);

    for (i, line) in job.lines.into_iter().enumerate() {
        if i > 0 && !wait_or_cancel(interval, &cancel_flag).await {
            tlog!("[batch] Stopped after {}/{} lines", i, total);
            return BatchOutcome::Cancelled;
        }
        if cancel_flag.load(Ordering::Relaxed) {
            tlog!("[batch] Stopped after {}/{} lines", i, total);
            return BatchOutcome::Cancelled;
        }

        let result = send_text(&console, &line);
        let connected = lock_console(&console).is_connected();

        if matches!(result, Err(SerialError::NotConnected)) || !connected {
            tlog!("[batch] Connection lost at line {}/{}", i + 1, total);
            return BatchOutcome::Aborted;
        }

        let error = result.err().map(|e| e.to_string());
        if let Some(e) = &error {
            tlog!("[batch] Line {}/{} failed: {}", i + 1, total, e);
        }
        report(BatchProgress {
            index: i + 1,
            total,
            line,
            error,
        });
    }

    tlog!("[batch] Completed {} lines", total);
    BatchOutcome::Completed
}

// ============================================================================
// Batch Slot
// ============================================================================

struct RunningBatch<H> {
    cancel_flag: Arc<AtomicBool>,
    handle: H,
}

impl<H: Future> RunningBatch<H> {
    async fn stop(self) {
        self.cancel_flag.store(true, Ordering::Relaxed);
        // The task sees the flag within one cancel poll and reports its own outcome
        let _ = self.handle.await;
    }
}

/// At most one running batch. `H` is the join handle of the spawned task.
pub struct BatchSlot<H> {
    running: tokio::sync::Mutex<Option<RunningBatch<H>>>,
}

impl<H> Default for BatchSlot<H> {
    fn default() -> Self {
        Self {
            running: tokio::sync::Mutex::new(None),
        }
    }
}

impl<H: Future> BatchSlot<H> {
    /// Stop the current batch, wait for it, then spawn the next one.
    /// The slot stays locked throughout, so concurrent callers queue up.
    pub async fn replace<F>(&self, spawn: F)
    where
        F: FnOnce(Arc<AtomicBool>) -> H,
    {
        let mut running = self.running.lock().await;
        if let Some(previous) = running.take() {
            previous.stop().await;
        }
        let cancel_flag = Arc::new(AtomicBool::new(false));
        let handle = spawn(cancel_flag.clone());
        *running = Some(RunningBatch {
            cancel_flag,
            handle,
        });
    }

    /// Stop the current batch and wait for it to finish
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        if let Some(task) = running.take() {
            task.stop().await;
        }
    }

    /// Flag the current batch to stop without waiting. Used on exit.
    pub fn request_stop(&self) {
        if let Ok(running) = self.running.try_lock() {
            if let Some(task) = running.as_ref() {
                task.cancel_flag.store(true, Ordering::Relaxed);
            }
        }
    }
}

/// Sleep for `duration`, returning early with `false` if a stop is requested
async fn wait_or_cancel(duration: Duration, cancel_flag: &AtomicBool) -> bool {
    if duration.is_zero() {
        tokio::task::yield_now().await;
        return !cancel_flag.load(Ordering::Relaxed);
    }

    let deadline = tokio::time::Instant::now() + duration;
    loop {
        if cancel_flag.load(Ordering::Relaxed) {
            return false;
        }
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return true;
        }
        tokio::time::sleep((deadline - now).min(CANCEL_POLL)).await;
    }
}
