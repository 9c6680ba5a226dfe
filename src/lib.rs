#[macro_use]
mod logging;

pub mod batch;
pub mod console;
pub mod io;
pub mod settings;
pub mod settings_store;

#[cfg(feature = "desktop")]
mod commands;

pub use logging::{init_file_logging, stop_file_logging};

#[cfg(feature = "desktop")]
use std::sync::{Arc, Mutex};
#[cfg(feature = "desktop")]
use tauri::{Manager, RunEvent};

#[cfg(feature = "desktop")]
#[cfg_attr(mobile, tauri::mobile_entry_point)]
pub fn run() {
    let builder = tauri::Builder::default().setup(|app| {
        match app.path().app_log_dir() {
            Ok(log_dir) => {
                if let Err(e) = logging::init_file_logging(&log_dir) {
                    tlog!("[setup] {}", e);
                }
            }
            Err(e) => tlog!("[setup] No log directory: {}", e),
        }

        let config_dir = app.path().app_config_dir()?;
        let settings = settings_store::SettingsStore::open(settings::settings_path_in(&config_dir));

        let (events_tx, events_rx) = std::sync::mpsc::channel();
        let console = Arc::new(Mutex::new(console::Console::new(
            io::serial::SystemPorts,
            events_tx,
            settings.clone(),
        )));
        commands::spawn_event_pump(app.handle().clone(), console.clone(), events_rx)?;

        app.manage(commands::AppState::new(console, settings));
        Ok(())
    });

    let builder = builder.invoke_handler(tauri::generate_handler![
        commands::list_serial_ports,
        commands::get_baud_rates,
        commands::get_console_state,
        commands::serial_connect,
        commands::serial_disconnect,
        commands::serial_send,
        commands::set_line_ending,
        commands::clear_scrollback,
        commands::delete_history,
        commands::clear_history,
        commands::save_batch_draft,
        commands::start_batch,
        commands::stop_batch,
    ]);

    builder
        .build(tauri::generate_context!())
        .expect("error while building tauri application")
        .run(|app, event| {
            if let RunEvent::Exit = event {
                commands::shutdown(app);
                logging::stop_file_logging();
            }
        });
}
