//! Contexts: isolated working copies of the object graph.
//!
//! Three contexts form a chain, Background → Main → Persistent → store. Each
//! one lives on its own lane and is only ever reached as `&mut Context` from a
//! job running there. Mutations stay private to a context until it saves,
//! which pushes its pending changes one tier down.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

use tracing::{debug, error};

use crate::entity::{Entity, NewPhoto, ObjectId, Photo, Pin, PinId};
use crate::error::{ContextError, Result, StackError};
use crate::graph::{Change, ChangeSet, Graph};
use crate::lane::LaneHandle;
use crate::model::keys;
use crate::query::FetchRequest;
use crate::store::SqliteStore;

/// Position of a context in the hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    /// Private lane; the only place mutations happen
    Background,
    /// Display reads and live queries
    Main,
    /// Private lane owning the store connection
    Persistent,
}

impl Tier {
    /// Name of the lane thread hosting this tier.
    pub fn lane_name(self) -> &'static str {
        match self {
            Tier::Background => "Background Context",
            Tier::Main => "Main Context",
            Tier::Persistent => "Persistent Context",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.lane_name())
    }
}

/// Published by a context each time a child's save lands in it, or when it is
/// reset by `drop_all_data`.
#[derive(Debug, Clone)]
pub struct CommitNotice {
    pub generation: u64,
    pub changes: Arc<ChangeSet>,
    /// The context's graph right after the commit.
    pub snapshot: Arc<Graph>,
    /// The graph was replaced wholesale; observers should reload.
    pub reset: bool,
}

pub(crate) enum Parent {
    Context(LaneHandle<Context>),
    Store(SqliteStore),
}

pub struct Context {
    tier: Tier,
    graph: Arc<Graph>,
    pending: ChangeSet,
    generation: u64,
    parent: Parent,
    observers: Vec<Sender<CommitNotice>>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("tier", &self.tier)
            .field("objects", &self.graph.len())
            .field("pending", &self.pending.len())
            .field("generation", &self.generation)
            .finish()
    }
}

impl Context {
    pub(crate) fn new(tier: Tier, graph: Arc<Graph>, parent: Parent) -> Self {
        Self {
            tier,
            graph,
            pending: ChangeSet::new(),
            generation: 0,
            parent,
            observers: Vec::new(),
        }
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    /// Commits absorbed from the child since startup, plus resets.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether there are changes not yet pushed to the parent.
    pub fn has_changes(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending(&self) -> &ChangeSet {
        &self.pending
    }

    // ==================== Saving ====================

    /// Push pending changes into the parent.
    ///
    /// A failure here leaves the tiers disagreeing about what exists, so it
    /// is logged and the process aborts.
    pub fn save(&mut self) {
        if let Err(err) = self.try_save() {
            fatal(self.tier, &err);
        }
    }

    /// Like [`Context::save`] but hands the error back. Returns whether
    /// anything was saved. On failure the pending changes are kept.
    pub fn try_save(&mut self) -> Result<bool> {
        if self.pending.is_empty() {
            return Ok(false);
        }
        let changes = Arc::new(std::mem::take(&mut self.pending));

        let result = match &mut self.parent {
            Parent::Context(parent) => {
                let shipped = Arc::clone(&changes);
                parent
                    .perform_and_wait(move |parent| parent.absorb(&shipped))
                    .map_err(StackError::from)
            }
            Parent::Store(store) => store.commit(&changes),
        };

        match result {
            Ok(()) => {
                debug!(
                    context = %self.tier,
                    changes = changes.len(),
                    generation = self.generation,
                    "context saved"
                );
                Ok(true)
            }
            Err(err) => {
                self.pending = Arc::try_unwrap(changes).unwrap_or_else(|shared| (*shared).clone());
                Err(err)
            }
        }
    }

    /// Save this context, then post a save of the parent to the parent's lane
    /// without waiting for it. Does nothing if there are no pending changes.
    pub fn save_cascade(&mut self) {
        if !self.has_changes() {
            return;
        }
        self.save();
        if let Parent::Context(parent) = &self.parent {
            if let Err(err) = parent.perform(|parent| parent.save()) {
                fatal(self.tier, &StackError::from(err));
            }
        }
    }

    fn absorb(&mut self, changes: &ChangeSet) {
        Arc::make_mut(&mut self.graph).apply(changes);
        self.pending.merge(changes);
        self.generation += 1;
        self.publish(Arc::new(changes.clone()), false);
    }

    // ==================== Observation ====================

    /// Register for commit notices. The receiver sees every commit absorbed
    /// after this call.
    pub fn subscribe(&mut self) -> Receiver<CommitNotice> {
        let (tx, rx) = mpsc::channel();
        self.observers.push(tx);
        rx
    }

    fn publish(&mut self, changes: Arc<ChangeSet>, reset: bool) {
        if self.observers.is_empty() {
            return;
        }
        let notice = CommitNotice {
            generation: self.generation,
            changes,
            snapshot: Arc::clone(&self.graph),
            reset,
        };
        self.observers.retain(|tx| tx.send(notice.clone()).is_ok());
    }

    /// Replace the graph wholesale and drop pending changes.
    pub(crate) fn reset(&mut self, graph: Arc<Graph>) {
        self.graph = graph;
        self.pending = ChangeSet::new();
        self.generation += 1;
        self.publish(Arc::new(ChangeSet::new()), true);
    }

    pub(crate) fn store_mut(&mut self) -> Option<&mut SqliteStore> {
        match &mut self.parent {
            Parent::Store(store) => Some(store),
            Parent::Context(_) => None,
        }
    }

    // ==================== Reads ====================

    /// Point-in-time view of everything this context can see.
    pub fn snapshot(&self) -> Arc<Graph> {
        Arc::clone(&self.graph)
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn pin(&self, id: ObjectId) -> Option<&Pin> {
        self.graph.pin(id)
    }

    pub fn pin_by_id(&self, id: PinId) -> Option<&Pin> {
        self.graph.pins().find(|pin| pin.id == id)
    }

    pub fn photo(&self, id: ObjectId) -> Option<&Photo> {
        self.graph.photo(id)
    }

    /// All pins, oldest first.
    pub fn pins(&self) -> Vec<Pin> {
        FetchRequest::pins().execute(&self.graph)
    }

    /// Photos of `pin` ordered by index.
    pub fn photos_of(&self, pin: ObjectId) -> Vec<Photo> {
        FetchRequest::photos_of(pin).execute(&self.graph)
    }

    pub fn fetch<E: Entity>(&self, request: &FetchRequest<E>) -> Vec<E> {
        request.execute(&self.graph)
    }

    pub fn count<E: Entity>(&self, request: &FetchRequest<E>) -> usize {
        request.count(&self.graph)
    }

    // ==================== Mutations ====================

    pub fn insert_pin(&mut self, latitude: f64, longitude: f64) -> std::result::Result<Pin, ContextError> {
        let pin = Pin::new(latitude, longitude)?;
        self.stage(pin.object_id, Change::Inserted(pin.clone().into()));
        Ok(pin)
    }

    /// Delete a pin together with every photo it owns.
    pub fn delete_pin(&mut self, id: ObjectId) -> std::result::Result<Pin, ContextError> {
        let pin = self.require_pin(id)?.clone();
        let owned: Vec<ObjectId> = self.graph.photos_of(id).map(|photo| photo.object_id).collect();
        for photo in owned {
            self.stage(photo, Change::Deleted(Photo::KIND));
        }
        self.stage(id, Change::Deleted(Pin::KIND));
        Ok(pin)
    }

    pub fn insert_photo(&mut self, pin: ObjectId, new: NewPhoto) -> std::result::Result<Photo, ContextError> {
        self.require_pin(pin)?;
        let photo = Photo::new(pin, new)?;
        self.stage(photo.object_id, Change::Inserted(photo.clone().into()));
        Ok(photo)
    }

    /// Create one photo per `(provider id, url)` record, indexed in
    /// enumeration order. Nothing is inserted if any record is rejected.
    pub fn insert_photos<I>(&mut self, pin: ObjectId, records: I) -> std::result::Result<Vec<Photo>, ContextError>
    where
        I: IntoIterator<Item = (i64, String)>,
    {
        self.require_pin(pin)?;
        let photos = records
            .into_iter()
            .enumerate()
            .map(|(index, (id, url))| {
                Photo::new(
                    pin,
                    NewPhoto {
                        id,
                        index: index as i64,
                        url,
                    },
                )
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;
        for photo in &photos {
            self.stage(photo.object_id, Change::Inserted(photo.clone().into()));
        }
        Ok(photos)
    }

    pub fn delete_photo(&mut self, id: ObjectId) -> std::result::Result<Photo, ContextError> {
        let photo = self.require_photo(id)?.clone();
        self.stage(id, Change::Deleted(Photo::KIND));
        Ok(photo)
    }

    /// Delete every photo of `pin`, returning how many were removed.
    pub fn delete_photos_of(&mut self, pin: ObjectId) -> std::result::Result<usize, ContextError> {
        self.require_pin(pin)?;
        let owned: Vec<ObjectId> = self.graph.photos_of(pin).map(|photo| photo.object_id).collect();
        for photo in &owned {
            self.stage(*photo, Change::Deleted(Photo::KIND));
        }
        Ok(owned.len())
    }

    /// Attach downloaded image bytes. Each photo takes an image once.
    pub fn set_photo_image(
        &mut self,
        id: ObjectId,
        image: impl Into<Arc<[u8]>>,
    ) -> std::result::Result<(), ContextError> {
        let mut photo = self.require_photo(id)?.clone();
        if photo.has_image() {
            return Err(ContextError::ImageAlreadySet(id));
        }
        photo.image = Some(image.into());
        self.stage(id, Change::Updated(photo.into()));
        Ok(())
    }

    fn stage(&mut self, id: ObjectId, change: Change) {
        let graph = Arc::make_mut(&mut self.graph);
        match &change {
            Change::Inserted(object) | Change::Updated(object) => graph.upsert(object.clone()),
            Change::Deleted(kind) => graph.remove(*kind, id),
        }
        self.pending.record(id, change);
    }

    fn require_pin(&self, id: ObjectId) -> std::result::Result<&Pin, ContextError> {
        match self.graph.pin(id) {
            Some(pin) => Ok(pin),
            None if self.graph.photo(id).is_some() => Err(ContextError::WrongEntity {
                id,
                expected: keys::PIN,
            }),
            None => Err(ContextError::ObjectNotFound(id)),
        }
    }

    fn require_photo(&self, id: ObjectId) -> std::result::Result<&Photo, ContextError> {
        match self.graph.photo(id) {
            Some(photo) => Ok(photo),
            None if self.graph.pin(id).is_some() => Err(ContextError::WrongEntity {
                id,
                expected: keys::PHOTO,
            }),
            None => Err(ContextError::ObjectNotFound(id)),
        }
    }
}

fn fatal(tier: Tier, err: &StackError) -> ! {
    error!(context = %tier, error = %err, "unresolved error while saving context");
    std::process::abort();
}
