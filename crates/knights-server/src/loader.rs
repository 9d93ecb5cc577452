//! Warm-configuration loader.
//!
//! Loading a game configuration is expensive, so a dedicated loader
//! thread keeps exactly one spare `GameConfig` ready for immediate
//! handoff when the server wants to spawn a new empty game. The handoff
//! is a single-producer / single-consumer slot; loader failures land in a
//! dedicated error slot that the consumer re-raises on its own thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use knights_engine::GameConfig;

use crate::error::ServerError;

struct LoaderShared {
    slot: Mutex<Option<GameConfig>>,
    error: Mutex<Option<String>>,
    stop: AtomicBool,
}

/// Background loader keeping one spare configuration warm.
pub struct ConfigLoader {
    shared: Arc<LoaderShared>,
    thread: Option<JoinHandle<()>>,
}

impl ConfigLoader {
    /// Spawns the loader. `load` is called whenever the slot is empty.
    pub fn spawn<F>(load: F) -> Self
    where
        F: Fn() -> Result<GameConfig, String> + Send + 'static,
    {
        let shared = Arc::new(LoaderShared {
            slot: Mutex::new(None),
            error: Mutex::new(None),
            stop: AtomicBool::new(false),
        });

        let thread_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("knights-config-loader".into())
            .spawn(move || loader_main(&thread_shared, load))
            .expect("spawning the config loader thread");

        ConfigLoader {
            shared,
            thread: Some(thread),
        }
    }

    /// Takes the warm configuration if one is ready; the loader starts on
    /// the next one immediately. Loader errors are re-raised here.
    pub fn take(&self) -> Result<Option<GameConfig>, ServerError> {
        if let Some(err) = self
            .shared
            .error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            return Err(ServerError::ConfigLoader(err));
        }
        Ok(self
            .shared
            .slot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take())
    }
}

impl Drop for ConfigLoader {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn loader_main<F>(shared: &LoaderShared, load: F)
where
    F: Fn() -> Result<GameConfig, String>,
{
    while !shared.stop.load(Ordering::Relaxed) {
        let empty = shared
            .slot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_none();
        if empty {
            match load() {
                Ok(config) => {
                    *shared.slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(config);
                }
                Err(err) => {
                    *shared.error.lock().unwrap_or_else(|e| e.into_inner()) = Some(err);
                    return; // a broken data set won't fix itself
                }
            }
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use knights_engine::{ArenaFactory, Manifest};

    #[test]
    fn loader_keeps_one_config_warm() {
        let loader = ConfigLoader::spawn(|| {
            Ok(GameConfig::new(
                Arc::new(Manifest::builtin()),
                Arc::new(ArenaFactory),
            ))
        });
        // the loader needs a moment to fill the slot
        let mut got = None;
        for _ in 0..50 {
            if let Some(config) = loader.take().unwrap() {
                got = Some(config);
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(got.is_some());
    }

    #[test]
    fn loader_error_is_reraised_once() {
        let loader = ConfigLoader::spawn(|| Err("no data dir".to_owned()));
        let mut saw_error = false;
        for _ in 0..50 {
            match loader.take() {
                Err(ServerError::ConfigLoader(msg)) => {
                    assert_eq!(msg, "no data dir");
                    saw_error = true;
                    break;
                }
                Ok(None) => std::thread::sleep(Duration::from_millis(20)),
                Ok(Some(_)) => panic!("loader produced a config from an error"),
                Err(other) => panic!("unexpected loader error: {:?}", other),
            }
        }
        assert!(saw_error);
    }
}
