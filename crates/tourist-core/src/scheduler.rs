//! Batch operation scheduler.
//!
//! All mutation goes through here. A unit runs on the background lane, then
//! its changes cascade Background → Main → Persistent → store. Units run one
//! at a time in submission order, and each unit's cascade is queued behind the
//! cascades of the units before it.

use std::sync::mpsc;

use tracing::warn;

use crate::context::{Context, Tier};
use crate::error::LaneError;
use crate::lane::LaneHandle;

/// Submits batch units to the background context.
#[derive(Clone, Debug)]
pub struct BatchScheduler {
    background: LaneHandle<Context>,
    main: LaneHandle<Context>,
    persistent: LaneHandle<Context>,
}

impl BatchScheduler {
    pub(crate) fn new(
        background: LaneHandle<Context>,
        main: LaneHandle<Context>,
        persistent: LaneHandle<Context>,
    ) -> Self {
        Self {
            background,
            main,
            persistent,
        }
    }

    /// Queue `unit` and return immediately.
    pub fn submit<F>(&self, unit: F) -> Result<(), LaneError>
    where
        F: FnOnce(&mut Context) + Send + 'static,
    {
        self.submit_then_with(unit, |()| {})
    }

    /// Queue `unit`; `done` runs once its changes are in the store.
    pub fn submit_then<F, D>(&self, unit: F, done: D) -> Result<(), LaneError>
    where
        F: FnOnce(&mut Context) + Send + 'static,
        D: FnOnce() + Send + 'static,
    {
        self.submit_then_with(unit, move |()| done())
    }

    /// Queue `unit`; `done` receives its return value once its changes are in
    /// the store. `done` runs on the persistent lane and must not block on the
    /// stack.
    pub fn submit_then_with<F, R, D>(&self, unit: F, done: D) -> Result<(), LaneError>
    where
        F: FnOnce(&mut Context) -> R + Send + 'static,
        R: Send + 'static,
        D: FnOnce(R) + Send + 'static,
    {
        let main = self.main.clone();
        let persistent = self.persistent.clone();
        self.background.perform(move |background| {
            let output = unit(background);
            background.save();

            let posted = main.perform(move |main| {
                main.save_cascade();
                // Queued behind the store save posted by the cascade above.
                if let Err(err) = persistent.perform(move |_| done(output)) {
                    warn!(error = %err, "batch completion dropped");
                }
            });
            if let Err(err) = posted {
                warn!(error = %err, "batch cascade dropped");
            }
        })
    }

    /// Block until every unit submitted before this call is in the store.
    pub fn flush(&self) -> Result<(), LaneError> {
        for lane in [&self.background, &self.main, &self.persistent] {
            if lane.is_current() {
                return Err(LaneError::Reentrant(lane.name().to_string()));
            }
        }
        let (tx, rx) = mpsc::sync_channel(1);
        self.submit_then(
            |_| {},
            move || {
                let _ = tx.send(());
            },
        )?;
        rx.recv()
            .map_err(|_| LaneError::Closed(Tier::Persistent.lane_name().to_string()))
    }

    pub(crate) fn background(&self) -> &LaneHandle<Context> {
        &self.background
    }

    pub(crate) fn main(&self) -> &LaneHandle<Context> {
        &self.main
    }

    pub(crate) fn persistent(&self) -> &LaneHandle<Context> {
        &self.persistent
    }
}
