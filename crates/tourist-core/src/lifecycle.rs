//! Application lifecycle hooks.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::stack::Stack;

/// Process lifecycle transitions the host forwards to the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEvent {
    DidFinishLaunching,
    WillResignActive,
    DidEnterBackground,
    WillEnterForeground,
    DidBecomeActive,
    WillTerminate,
}

impl Stack {
    /// React to a lifecycle transition.
    ///
    /// Launch arms autosave. Losing the foreground flushes synchronously so
    /// the store is current before the host may suspend the process.
    /// Termination flushes and stops autosave.
    pub fn handle_lifecycle(&self, event: LifecycleEvent) -> Result<()> {
        debug!(?event, "lifecycle event");
        match event {
            LifecycleEvent::DidFinishLaunching => {
                self.arm_autosave()?;
            }
            LifecycleEvent::WillResignActive | LifecycleEvent::DidEnterBackground => {
                self.flush()?;
            }
            LifecycleEvent::WillEnterForeground | LifecycleEvent::DidBecomeActive => {}
            LifecycleEvent::WillTerminate => {
                self.flush()?;
                self.disarm_autosave();
            }
        }
        Ok(())
    }
}
