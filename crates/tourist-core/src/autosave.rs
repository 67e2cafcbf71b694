//! Periodic save cascade from the main context down to the store.

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info};

use crate::error::LaneError;
use crate::stack::MainContext;

const THREAD_NAME: &str = "autosave";

/// A running autosave timer. Dropping it stops the timer.
#[derive(Debug)]
pub struct Autosave {
    interval: Duration,
    stop: Option<Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl Autosave {
    /// Start the timer with an interval in seconds. A zero or negative
    /// interval arms nothing.
    pub fn arm(main: MainContext, interval_secs: i64) -> Result<Option<Self>, LaneError> {
        if interval_secs <= 0 {
            debug!(interval_secs, "autosave disabled");
            return Ok(None);
        }
        Self::every(main, Duration::from_secs(interval_secs.unsigned_abs())).map(Some)
    }

    /// Post a save cascade to the main lane every `interval`, starting one
    /// interval from now.
    pub fn every(main: MainContext, interval: Duration) -> Result<Self, LaneError> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let join = thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        debug!("autosave tick");
                        if main.save_cascade().is_err() {
                            break;
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .map_err(|e| LaneError::Spawn {
                name: THREAD_NAME.to_string(),
                message: e.to_string(),
            })?;

        info!(interval_ms = interval.as_millis() as u64, "autosave armed");
        Ok(Self {
            interval,
            stop: Some(stop_tx),
            join: Some(join),
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Stop the timer and wait for its thread to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        // Dropping the sender wakes the timer thread.
        self.stop.take();
        if let Some(join) = self.join.take() {
            let _ = join.join();
            debug!("autosave stopped");
        }
    }
}

impl Drop for Autosave {
    fn drop(&mut self) {
        self.shutdown();
    }
}
