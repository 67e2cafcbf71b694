//! The persistence stack: store, contexts and their lanes.
//!
//! [`Stack::open`] is the single entry point. It either returns a fully
//! started stack or a startup error, in which case no lane is running.
//! Components receive what they need from the stack explicitly: a
//! [`MainContext`] for reads and live queries, a [`BatchScheduler`] for
//! mutation.

use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{info, warn};

use crate::autosave::Autosave;
use crate::config::StackConfig;
use crate::context::{CommitNotice, Context, Parent, Tier};
use crate::entity::EntityKind;
use crate::error::{LaneError, Result, StackError};
use crate::graph::Graph;
use crate::lane::{Lane, LaneHandle};
use crate::model::Model;
use crate::scheduler::BatchScheduler;
use crate::store::SqliteStore;

/// Read access to the main context.
///
/// Display code never mutates; every closure here gets `&Context`.
#[derive(Clone, Debug)]
pub struct MainContext {
    lane: LaneHandle<Context>,
}

impl MainContext {
    pub(crate) fn new(lane: LaneHandle<Context>) -> Self {
        Self { lane }
    }

    /// Run `read` on the main lane and return its result.
    pub fn read<F, R>(&self, read: F) -> Result<R>
    where
        F: FnOnce(&Context) -> R + Send + 'static,
        R: Send + 'static,
    {
        Ok(self.lane.perform_and_wait(move |context| read(context))?)
    }

    /// Run `read` on the main lane without waiting.
    pub fn perform<F>(&self, read: F) -> Result<()>
    where
        F: FnOnce(&Context) + Send + 'static,
    {
        Ok(self.lane.perform(move |context| read(context))?)
    }

    /// Current graph of the main context.
    pub fn snapshot(&self) -> Result<Arc<Graph>> {
        self.read(|context| context.snapshot())
    }

    pub fn has_changes(&self) -> Result<bool> {
        self.read(|context| context.has_changes())
    }

    /// Run `read` and subscribe to commit notices in the same job, returning
    /// the read result and the generation it reflects.
    pub fn observe<F, R>(&self, read: F) -> Result<(R, u64, Receiver<CommitNotice>)>
    where
        F: FnOnce(&Context) -> R + Send + 'static,
        R: Send + 'static,
    {
        Ok(self.lane.perform_and_wait(move |context| {
            let result = read(context);
            (result, context.generation(), context.subscribe())
        })?)
    }

    /// Post a save cascade to the main lane.
    pub fn save_cascade(&self) -> std::result::Result<(), LaneError> {
        self.lane.perform(|context| context.save_cascade())
    }
}

pub struct Stack {
    config: StackConfig,
    model: Arc<Model>,
    store_path: Option<PathBuf>,
    scheduler: BatchScheduler,
    main: MainContext,
    /// Background, Main, Persistent: the order they are stopped in
    lanes: Vec<Lane<Context>>,
    autosave: Mutex<Option<Autosave>>,
}

impl std::fmt::Debug for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stack")
            .field("store_path", &self.store_path)
            .field("model_version", &self.model.version)
            .finish()
    }
}

impl Stack {
    /// Load the model, open the store and start the three context lanes.
    pub fn open(config: StackConfig) -> Result<Self> {
        let model = load_model(&config)?;
        let path = config.resolve_store_path()?;
        let store = SqliteStore::open(&path, Arc::clone(&model))?;
        Self::start(config, model, Some(path), store)
    }

    /// A stack over an in-memory store (for testing).
    pub fn open_in_memory(config: StackConfig) -> Result<Self> {
        let model = load_model(&config)?;
        let store = SqliteStore::open_in_memory(Arc::clone(&model))?;
        Self::start(config, model, None, store)
    }

    fn start(
        config: StackConfig,
        model: Arc<Model>,
        store_path: Option<PathBuf>,
        store: SqliteStore,
    ) -> Result<Self> {
        let graph = Arc::new(store.load()?);
        let (pins, photos) = (graph.pins().count(), graph.photos().count());

        let persistent = Lane::spawn(
            Tier::Persistent.lane_name(),
            Context::new(Tier::Persistent, Arc::clone(&graph), Parent::Store(store)),
        )?;
        let main = Lane::spawn(
            Tier::Main.lane_name(),
            Context::new(
                Tier::Main,
                Arc::clone(&graph),
                Parent::Context(persistent.handle()),
            ),
        )?;
        let background = Lane::spawn(
            Tier::Background.lane_name(),
            Context::new(Tier::Background, graph, Parent::Context(main.handle())),
        )?;

        let scheduler = BatchScheduler::new(background.handle(), main.handle(), persistent.handle());
        info!(pins, photos, store = ?store_path, "stack opened");

        Ok(Self {
            config,
            model,
            store_path,
            scheduler,
            main: MainContext::new(main.handle()),
            lanes: vec![background, main, persistent],
            autosave: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    /// Path of the store file; `None` for in-memory stacks.
    pub fn store_path(&self) -> Option<&Path> {
        self.store_path.as_deref()
    }

    pub fn main(&self) -> MainContext {
        self.main.clone()
    }

    pub fn scheduler(&self) -> BatchScheduler {
        self.scheduler.clone()
    }

    // ==================== Batches ====================

    /// Run `unit` on the background context, then cascade its changes to the
    /// store. Returns without waiting.
    pub fn perform_background_batch<F>(&self, unit: F) -> Result<()>
    where
        F: FnOnce(&mut Context) + Send + 'static,
    {
        Ok(self.scheduler.submit(unit)?)
    }

    /// Like [`Stack::perform_background_batch`]; `done` runs once the unit's
    /// changes are in the store.
    pub fn perform_background_batch_then<F, D>(&self, unit: F, done: D) -> Result<()>
    where
        F: FnOnce(&mut Context) + Send + 'static,
        D: FnOnce() + Send + 'static,
    {
        Ok(self.scheduler.submit_then(unit, done)?)
    }

    /// Run `job` on the background context without a cascade. Nothing is
    /// saved unless the job saves, and a background save reaches the main
    /// context only; the next cascade carries it to the store.
    pub fn perform_background<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce(&mut Context) + Send + 'static,
    {
        Ok(self.scheduler.background().perform(job)?)
    }

    /// Block until every unit submitted so far, and any change the main
    /// context still holds, is in the store.
    pub fn flush(&self) -> Result<()> {
        Ok(self.scheduler.flush()?)
    }

    /// Delete the store file, recreate an empty store in its place and reset
    /// every context to the empty graph. Live queries see a reset batch.
    ///
    /// A storage failure is returned after every context has been reset to
    /// whatever the store still holds, so later batches commit normally.
    pub fn drop_all_data(&self) -> Result<()> {
        for lane in [
            self.scheduler.background(),
            self.scheduler.main(),
            self.scheduler.persistent(),
        ] {
            if lane.is_current() {
                return Err(LaneError::Reentrant(lane.name().to_string()).into());
            }
        }

        let main = self.scheduler.main().clone();
        let persistent = self.scheduler.persistent().clone();
        // Lanes are held top-down so no context observes a half-reset stack.
        let dropped = self
            .scheduler
            .background()
            .perform_and_wait(move |background| -> Result<()> {
                let (graph, dropped) = main.perform_and_wait(
                    move |main| -> Result<(Arc<Graph>, Result<()>)> {
                        let (graph, dropped) = persistent.perform_and_wait(reset_persistent)?;
                        main.reset(Arc::clone(&graph));
                        Ok((graph, dropped))
                    },
                )??;
                background.reset(graph);
                dropped
            })?;

        match dropped {
            Ok(()) => {
                info!(store = ?self.store_path, "all data dropped");
                Ok(())
            }
            Err(err) => {
                warn!(
                    store = ?self.store_path,
                    error = %err,
                    "drop all data failed, contexts reloaded from the store"
                );
                Err(err)
            }
        }
    }

    /// Rows of `kind` committed to the store.
    pub fn store_count(&self, kind: EntityKind) -> Result<usize> {
        self.scheduler
            .persistent()
            .perform_and_wait(move |persistent| match persistent.store_mut() {
                Some(store) => store.count(kind),
                None => Ok(0),
            })?
    }

    // ==================== Autosave ====================

    /// Arm autosave with the configured interval. Returns whether a timer is
    /// running afterwards; arming twice keeps the first timer.
    pub fn arm_autosave(&self) -> Result<bool> {
        let mut slot = self.autosave.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Autosave::arm(self.main(), self.config.autosave_interval_secs)?;
        }
        Ok(slot.is_some())
    }

    pub fn disarm_autosave(&self) {
        let taken = self
            .autosave
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(autosave) = taken {
            autosave.stop();
        }
    }

    pub fn autosave_armed(&self) -> bool {
        self.autosave
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

fn load_model(config: &StackConfig) -> Result<Arc<Model>> {
    config.validate()?;
    let model = match &config.model_path {
        Some(path) => Model::load(path)?,
        None => Model::bundled()?,
    };
    Ok(Arc::new(model))
}

impl Drop for Stack {
    fn drop(&mut self) {
        self.disarm_autosave();
        // Each lane finishes its queue before stopping; the main lane's last
        // cascades land on the persistent lane before it is stopped.
        for lane in self.lanes.drain(..) {
            if lane.handle().name() == Tier::Main.lane_name() {
                if let Err(err) = self.main.save_cascade() {
                    warn!(error = %err, "final save cascade not posted");
                }
            }
            lane.stop();
        }
        info!("stack closed");
    }
}

/// Recreate the store and reset the persistent context to what it now
/// holds: empty on success, the surviving rows otherwise.
fn reset_persistent(persistent: &mut Context) -> (Arc<Graph>, Result<()>) {
    let (graph, dropped) = match persistent.store_mut() {
        Some(store) => match store.destroy_and_recreate() {
            Ok(()) => (Graph::new(), Ok(())),
            Err(err) => {
                let graph = store.load().unwrap_or_else(|load_err| {
                    warn!(error = %load_err, "store not readable after failed drop");
                    Graph::new()
                });
                (graph, Err(err))
            }
        },
        None => (Graph::new(), Ok(())),
    };
    let graph = Arc::new(graph);
    persistent.reset(Arc::clone(&graph));
    (graph, dropped)
}
