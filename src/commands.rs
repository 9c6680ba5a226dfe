// src/commands.rs
//
// Tauri commands and events for the main window.
//
// Worker events reach the front end through an event-pump thread: it applies
// each event to the console model under its mutex and re-emits the result as
// a Tauri event. Commands never touch the UI directly.

use serde::Serialize;
use std::sync::atomic::AtomicBool;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, MutexGuard};
use tauri::{AppHandle, Emitter, Manager, State};

use crate::batch::{run_batch, BatchJob, BatchOutcome, BatchSlot};
use crate::console::{
    lock_console, send_text, Console, ConnectionStatus, ConsoleSnapshot, ConsoleUpdate,
};
use crate::io::serial::{list_ports, LineEnding, PortInfo, WorkerEvent, BAUD_RATES, DEFAULT_BAUD_RATE};
use crate::io::SerialError;
use crate::settings_store::SettingsStore;

// ============================================================================
// State
// ============================================================================

pub struct AppState {
    console: Arc<Mutex<Console>>,
    settings: Arc<SettingsStore>,
    batch: BatchSlot<tauri::async_runtime::JoinHandle<()>>,
}

impl AppState {
    pub fn new(console: Arc<Mutex<Console>>, settings: Arc<SettingsStore>) -> Self {
        Self {
            console,
            settings,
            batch: BatchSlot::default(),
        }
    }

    fn console(&self) -> MutexGuard<'_, Console> {
        lock_console(&self.console)
    }
}

// ============================================================================
// Event Payloads
// ============================================================================

#[derive(Clone, Serialize)]
struct SerialDataEvent {
    seq: u64,
    text: String,
    bytes: Vec<u8>,
}

#[derive(Clone, Serialize)]
struct SerialErrorEvent {
    message: String,
}

#[derive(Clone, Serialize)]
struct BatchFinishedEvent {
    outcome: BatchOutcome,
    message: String,
}

#[derive(Clone, Serialize)]
struct BatchProgressEvent {
    index: usize,
    total: usize,
    line: String,
    error: Option<String>,
    message: String,
}

#[derive(Clone, Serialize)]
pub struct BaudRateOptions {
    rates: Vec<u32>,
    default: u32,
}

fn emit_status(app: &AppHandle, status: &ConnectionStatus) {
    let _ = app.emit("serial-status", status);
}

fn emit_error(app: &AppHandle, message: String) {
    let _ = app.emit("serial-error", SerialErrorEvent { message });
}

// ============================================================================
// Event Pump
// ============================================================================

/// Forward worker events to the front end until the sender side is dropped
pub fn spawn_event_pump(
    app: AppHandle,
    console: Arc<Mutex<Console>>,
    events: Receiver<WorkerEvent>,
) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name("serial-event-pump".to_string())
        .spawn(move || {
            for event in events {
                let update = lock_console(&console).handle_event(event, chrono::Local::now());

                match update {
                    ConsoleUpdate::Received { seq, text, bytes } => {
                        let _ = app.emit("serial-data", SerialDataEvent { seq, text, bytes });
                    }
                    ConsoleUpdate::Disconnected { status, error } => {
                        if let Some(e) = error {
                            emit_error(&app, e.to_string());
                        }
                        emit_status(&app, &status);
                    }
                }
            }
            tlog!("[console] Event pump stopped");
        })?;
    Ok(())
}

// ============================================================================
// Commands
// ============================================================================

#[tauri::command]
pub fn list_serial_ports() -> Vec<PortInfo> {
    list_ports()
}

#[tauri::command]
pub fn get_baud_rates() -> BaudRateOptions {
    BaudRateOptions {
        rates: BAUD_RATES.to_vec(),
        default: DEFAULT_BAUD_RATE,
    }
}

#[tauri::command]
pub async fn get_console_state(state: State<'_, AppState>) -> Result<ConsoleSnapshot, String> {
    Ok(state.console().snapshot())
}

#[tauri::command(rename_all = "snake_case")]
pub async fn serial_connect(
    app: AppHandle,
    state: State<'_, AppState>,
    port: String,
    baud_rate: u32,
) -> Result<ConnectionStatus, String> {
    let status = state.console().connect(&port, baud_rate)?;
    emit_status(&app, &status);
    Ok(status)
}

#[tauri::command]
pub async fn serial_disconnect(
    app: AppHandle,
    state: State<'_, AppState>,
) -> Result<ConnectionStatus, String> {
    state.batch.stop().await;
    let status = state.console().disconnect();
    emit_status(&app, &status);
    Ok(status)
}

#[tauri::command]
pub async fn serial_send(state: State<'_, AppState>, text: String) -> Result<usize, String> {
    Ok(send_text(&state.console, &text)?)
}

#[tauri::command(rename_all = "snake_case")]
pub async fn set_line_ending(
    state: State<'_, AppState>,
    line_ending: String,
) -> Result<LineEnding, String> {
    let mode: LineEnding = line_ending.parse()?;
    state.console().set_line_ending(mode);
    Ok(mode)
}

#[tauri::command]
pub async fn clear_scrollback(state: State<'_, AppState>) -> Result<(), String> {
    state.console().clear_scrollback();
    Ok(())
}

#[tauri::command]
pub async fn delete_history(
    state: State<'_, AppState>,
    indices: Vec<usize>,
) -> Result<Vec<String>, String> {
    let mut console = state.console();
    console.delete_history(&indices);
    Ok(console.history().to_vec())
}

#[tauri::command]
pub async fn clear_history(state: State<'_, AppState>) -> Result<(), String> {
    state.console().clear_history();
    Ok(())
}

#[tauri::command(rename_all = "snake_case")]
pub async fn save_batch_draft(
    state: State<'_, AppState>,
    text: String,
    interval_ms: u64,
) -> Result<(), String> {
    state.console().set_batch_draft(&text, interval_ms);
    Ok(())
}

/// Start sending `text` line by line. Returns the number of lines queued.
#[tauri::command(rename_all = "snake_case")]
pub async fn start_batch(
    app: AppHandle,
    state: State<'_, AppState>,
    text: String,
    interval_ms: u64,
) -> Result<usize, String> {
    state.console().set_batch_draft(&text, interval_ms);

    let job = BatchJob::parse(&text);
    if job.is_empty() {
        return Ok(0);
    }
    let connected = state.console().is_connected();
    if !connected {
        return Err(SerialError::NotConnected.into());
    }

    let total = job.len();
    let console = state.console.clone();

    state
        .batch
        .replace(move |cancel_flag| {
            tauri::async_runtime::spawn(run_batch_task(app, console, job, interval_ms, cancel_flag))
        })
        .await;
    Ok(total)
}

async fn run_batch_task(
    app: AppHandle,
    console: Arc<Mutex<Console>>,
    job: BatchJob,
    interval_ms: u64,
    cancel_flag: Arc<AtomicBool>,
) {
    let progress_app = app.clone();
    let outcome = run_batch(console, job, interval_ms, cancel_flag, move |p| {
        let _ = progress_app.emit(
            "batch-progress",
            BatchProgressEvent {
                message: p.message(),
                index: p.index,
                total: p.total,
                line: p.line,
                error: p.error,
            },
        );
    })
    .await;

    let _ = app.emit(
        "batch-finished",
        BatchFinishedEvent {
            outcome,
            message: outcome.message().to_string(),
        },
    );
}

#[tauri::command]
pub async fn stop_batch(state: State<'_, AppState>) -> Result<(), String> {
    state.batch.stop().await;
    Ok(())
}

/// Close the connection and write settings; called once on exit
pub fn shutdown(app: &AppHandle) {
    let Some(state) = app.try_state::<AppState>() else {
        return;
    };

    state.batch.request_stop();
    state.console().shutdown();
    if let Err(e) = state.settings.flush() {
        tlog!("[settings] Failed to save on exit: {}", e);
    }
}
