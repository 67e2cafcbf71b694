//! Serialized execution lanes.
//!
//! A lane is a named OS thread that owns one piece of state and runs the jobs
//! posted to it one at a time, in the order they were posted. Nothing outside
//! the lane ever touches the state directly; other threads talk to it through
//! a cloneable [`LaneHandle`].

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use tracing::{debug, warn};

use crate::error::LaneError;

type Job<T> = Box<dyn FnOnce(&mut T) + Send + 'static>;

enum Message<T> {
    Run(Job<T>),
    Stop,
}

/// Posts jobs to a lane.
pub struct LaneHandle<T> {
    name: Arc<str>,
    thread: ThreadId,
    tx: Sender<Message<T>>,
}

impl<T> Clone for LaneHandle<T> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            thread: self.thread,
            tx: self.tx.clone(),
        }
    }
}

impl<T> std::fmt::Debug for LaneHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaneHandle").field("name", &self.name).finish()
    }
}

impl<T: 'static> LaneHandle<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the calling thread is this lane's thread.
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.thread
    }

    /// Queue `job` and return immediately.
    pub fn perform<F>(&self, job: F) -> Result<(), LaneError>
    where
        F: FnOnce(&mut T) + Send + 'static,
    {
        self.tx
            .send(Message::Run(Box::new(job)))
            .map_err(|_| LaneError::Closed(self.name.to_string()))
    }

    /// Queue `job` and block until it has run, returning its result.
    ///
    /// Fails with [`LaneError::Reentrant`] when called from the lane itself,
    /// since the job would be queued behind the caller forever.
    pub fn perform_and_wait<F, R>(&self, job: F) -> Result<R, LaneError>
    where
        F: FnOnce(&mut T) -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_current() {
            return Err(LaneError::Reentrant(self.name.to_string()));
        }
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        self.perform(move |state| {
            let _ = reply_tx.send(job(state));
        })?;
        reply_rx
            .recv()
            .map_err(|_| LaneError::Closed(self.name.to_string()))
    }
}

/// Owner of a lane thread. Dropping it stops the lane after the jobs already
/// queued have run.
pub struct Lane<T: 'static> {
    handle: LaneHandle<T>,
    join: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> Lane<T> {
    /// Start a lane named `name` that owns `state`.
    pub fn spawn(name: &str, state: T) -> Result<Self, LaneError> {
        let (tx, rx) = mpsc::channel();
        let thread_name = name.to_string();
        let join = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || run(thread_name, state, rx))
            .map_err(|e| LaneError::Spawn {
                name: name.to_string(),
                message: e.to_string(),
            })?;

        let handle = LaneHandle {
            name: Arc::from(name),
            thread: join.thread().id(),
            tx,
        };
        Ok(Self {
            handle,
            join: Some(join),
        })
    }
}

impl<T: 'static> Lane<T> {
    pub fn handle(&self) -> LaneHandle<T> {
        self.handle.clone()
    }

    /// Stop the lane and wait for its thread to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(join) = self.join.take() else {
            return;
        };
        let _ = self.handle.tx.send(Message::Stop);
        if self.handle.is_current() {
            return;
        }
        if join.join().is_err() {
            warn!(lane = %self.handle.name, "lane thread panicked");
        }
    }
}

impl<T: 'static> Drop for Lane<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run<T>(name: String, mut state: T, rx: Receiver<Message<T>>) {
    debug!(lane = %name, "lane started");
    while let Ok(message) = rx.recv() {
        match message {
            Message::Run(job) => job(&mut state),
            Message::Stop => break,
        }
    }
    debug!(lane = %name, "lane stopped");
}
