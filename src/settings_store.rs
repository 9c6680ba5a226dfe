// src/settings_store.rs
//
// In-memory settings with debounced persistence.
// Every update marks the settings dirty and schedules a save; a background
// thread coalesces bursts of updates into one write. `flush` writes
// immediately and is called at shutdown.

use std::path::PathBuf;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::settings::{load_settings_or_default, save_settings, AppSettings, SettingsError};

/// Quiet period after the last update before settings are written
const SAVE_DEBOUNCE: Duration = Duration::from_millis(500);

pub struct SettingsStore {
    settings: RwLock<AppSettings>,
    /// Where settings are persisted; `None` keeps them in memory only
    path: Option<PathBuf>,
    /// Channel for triggering debounced saves
    save_tx: Option<mpsc::UnboundedSender<()>>,
}

impl SettingsStore {
    /// Load settings from `path` (defaults if missing or unreadable) and start
    /// the debounced saver.
    pub fn open(path: PathBuf) -> Arc<Self> {
        let settings = load_settings_or_default(&path);
        tlog!("[settings] Loaded settings from {}", path.display());

        let (tx, rx) = mpsc::unbounded_channel::<()>();
        let store = Arc::new(Self {
            settings: RwLock::new(settings),
            path: Some(path),
            save_tx: Some(tx),
        });
        spawn_saver(Arc::downgrade(&store), rx);
        store
    }

    /// A store that never touches the disk
    pub fn in_memory(settings: AppSettings) -> Arc<Self> {
        Arc::new(Self {
            settings: RwLock::new(settings),
            path: None,
            save_tx: None,
        })
    }

    /// Snapshot of the current settings
    pub fn get(&self) -> AppSettings {
        match self.settings.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Apply `f` to the settings and schedule a save
    pub fn update<F: FnOnce(&mut AppSettings)>(&self, f: F) {
        match self.settings.write() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
        if let Some(tx) = &self.save_tx {
            let _ = tx.send(());
        }
    }

    /// Write the settings now
    pub fn flush(&self) -> Result<(), SettingsError> {
        match &self.path {
            Some(path) => save_settings(path, &self.get()),
            None => Ok(()),
        }
    }
}

fn spawn_saver(store: Weak<SettingsStore>, mut rx: mpsc::UnboundedReceiver<()>) {
    let spawned = std::thread::Builder::new()
        .name("settings-saver".to_string())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    tlog!("[settings] Failed to start saver runtime: {}", e);
                    return;
                }
            };

            rt.block_on(async {
                let mut pending = false;

                loop {
                    tokio::select! {
                        result = rx.recv() => {
                            if result.is_none() {
                                // Store dropped
                                break;
                            }
                            pending = true;
                        }
                        _ = tokio::time::sleep(SAVE_DEBOUNCE), if pending => {
                            pending = false;
                            let Some(store) = store.upgrade() else {
                                break;
                            };
                            if let Err(e) = store.flush() {
                                tlog!("[settings] Failed to save: {}", e);
                            }
                        }
                    }
                }
            });
        });

    if let Err(e) = spawned {
        tlog!("[settings] Failed to spawn saver thread: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::serial::LineEnding;
    use crate::settings::load_settings;
    use std::time::Instant;

    #[test]
    fn test_in_memory_update() {
        let store = SettingsStore::in_memory(AppSettings::default());
        store.update(|s| s.port = "COM3".to_string());
        assert_eq!(store.get().port, "COM3");
        assert!(store.flush().is_ok());
    }

    #[test]
    fn test_updates_are_saved_after_debounce() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let store = SettingsStore::open(path.clone());

        store.update(|s| s.baud_rate = 57600);
        store.update(|s| s.line_ending = LineEnding::Cr);

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Ok(saved) = load_settings(&path) {
                if saved.baud_rate == 57600 && saved.line_ending == LineEnding::Cr {
                    break;
                }
            }
            assert!(Instant::now() < deadline, "settings were never saved");
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    #[test]
    fn test_flush_writes_immediately_and_reopen_restores() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let store = SettingsStore::open(path.clone());
        store.update(|s| s.history.push("AT".to_string()));
        store.flush().unwrap();
        drop(store);

        let reopened = SettingsStore::open(path);
        assert_eq!(reopened.get().history, vec!["AT".to_string()]);
    }
}
