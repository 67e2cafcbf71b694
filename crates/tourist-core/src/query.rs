//! Fetch requests and live queries against the main context.
//!
//! A [`FetchRequest`] selects objects of one entity type and puts them in a
//! total order. A [`LiveQuery`] keeps the result of a request current: it
//! receives the main context's commit notices and turns each batch of them
//! into raw [`ChangeEvent`]s describing how the ordered result moved.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::context::CommitNotice;
use crate::entity::{Entity, ObjectId, Photo, Pin};
use crate::error::Result;
use crate::graph::Graph;
use crate::stack::MainContext;

type Predicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;
type SortOrder<E> = Arc<dyn Fn(&E, &E) -> Ordering + Send + Sync>;

/// Entity type, optional predicate and sort order.
///
/// Ties in the sort order are broken by object id, so results are totally
/// ordered.
pub struct FetchRequest<E> {
    predicate: Option<Predicate<E>>,
    order: SortOrder<E>,
}

impl<E> Clone for FetchRequest<E> {
    fn clone(&self) -> Self {
        Self {
            predicate: self.predicate.clone(),
            order: Arc::clone(&self.order),
        }
    }
}

impl<E> std::fmt::Debug for FetchRequest<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchRequest")
            .field("filtered", &self.predicate.is_some())
            .finish()
    }
}

impl<E: Entity> FetchRequest<E> {
    /// Every object of the entity, ordered by object id.
    pub fn all() -> Self {
        Self {
            predicate: None,
            order: Arc::new(|_, _| Ordering::Equal),
        }
    }

    pub fn filter(mut self, predicate: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn sorted_by(mut self, order: impl Fn(&E, &E) -> Ordering + Send + Sync + 'static) -> Self {
        self.order = Arc::new(order);
        self
    }

    pub fn matches(&self, object: &E) -> bool {
        self.predicate.as_ref().map_or(true, |predicate| predicate(object))
    }

    pub fn compare(&self, a: &E, b: &E) -> Ordering {
        (self.order)(a, b).then_with(|| a.object_id().cmp(&b.object_id()))
    }

    pub fn execute(&self, graph: &Graph) -> Vec<E> {
        let mut objects: Vec<E> = E::table(graph)
            .values()
            .filter(|object| self.matches(object))
            .cloned()
            .collect();
        objects.sort_by(|a, b| self.compare(a, b));
        objects
    }

    pub fn count(&self, graph: &Graph) -> usize {
        E::table(graph).values().filter(|object| self.matches(object)).count()
    }
}

impl FetchRequest<Pin> {
    /// All pins, oldest first.
    pub fn pins() -> Self {
        Self::all().sorted_by(|a, b| a.create_date.cmp(&b.create_date))
    }
}

impl FetchRequest<Photo> {
    /// Photos owned by `pin`, by ascending index.
    pub fn photos_of(pin: ObjectId) -> Self {
        Self::all()
            .filter(move |photo| photo.pin == pin)
            .sorted_by(|a, b| a.index.cmp(&b.index))
    }
}

/// How one object's position in a query result changed across a batch.
///
/// `old_index` positions refer to the result before the batch, `new_index`
/// positions to the result after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeEvent {
    Inserted { object_id: ObjectId, new_index: usize },
    Deleted { object_id: ObjectId, old_index: usize },
    Updated { object_id: ObjectId, old_index: usize },
    Moved { object_id: ObjectId, old_index: usize, new_index: usize },
}

impl ChangeEvent {
    pub fn object_id(&self) -> ObjectId {
        match self {
            ChangeEvent::Inserted { object_id, .. }
            | ChangeEvent::Deleted { object_id, .. }
            | ChangeEvent::Updated { object_id, .. }
            | ChangeEvent::Moved { object_id, .. } => *object_id,
        }
    }
}

/// Compare two ordered results.
///
/// Objects kept in place form the longest run whose relative order survives
/// the batch; every other surviving object is reported as moved. Objects in
/// `changed` that kept their place are reported as updated.
pub fn diff_results<E: Entity>(old: &[E], new: &[E], changed: &HashSet<ObjectId>) -> Vec<ChangeEvent> {
    let new_positions: HashMap<ObjectId, usize> = new
        .iter()
        .enumerate()
        .map(|(index, object)| (object.object_id(), index))
        .collect();
    let old_ids: HashSet<ObjectId> = old.iter().map(Entity::object_id).collect();

    let mut events = Vec::new();
    // (old index, new index) of every object present on both sides, in old order.
    let mut survivors = Vec::new();
    for (old_index, object) in old.iter().enumerate() {
        let object_id = object.object_id();
        match new_positions.get(&object_id) {
            Some(&new_index) => survivors.push((object_id, old_index, new_index)),
            None => events.push(ChangeEvent::Deleted { object_id, old_index }),
        }
    }
    for (new_index, object) in new.iter().enumerate() {
        let object_id = object.object_id();
        if !old_ids.contains(&object_id) {
            events.push(ChangeEvent::Inserted { object_id, new_index });
        }
    }

    let ranks: Vec<usize> = survivors.iter().map(|(_, _, new_index)| *new_index).collect();
    let stable = longest_increasing_run(&ranks);
    for (position, (object_id, old_index, new_index)) in survivors.into_iter().enumerate() {
        if !stable.contains(&position) {
            events.push(ChangeEvent::Moved {
                object_id,
                old_index,
                new_index,
            });
        } else if changed.contains(&object_id) {
            events.push(ChangeEvent::Updated { object_id, old_index });
        }
    }
    events
}

/// Positions of one longest strictly increasing subsequence of `values`.
fn longest_increasing_run(values: &[usize]) -> HashSet<usize> {
    // tails[k] is the position ending the best run of length k + 1
    let mut tails: Vec<usize> = Vec::new();
    let mut previous: Vec<Option<usize>> = vec![None; values.len()];
    for (position, value) in values.iter().enumerate() {
        let slot = tails.partition_point(|&tail| values[tail] < *value);
        if slot > 0 {
            previous[position] = Some(tails[slot - 1]);
        }
        if slot == tails.len() {
            tails.push(position);
        } else {
            tails[slot] = position;
        }
    }

    let mut run = HashSet::with_capacity(tails.len());
    let mut cursor = tails.last().copied();
    while let Some(position) = cursor {
        run.insert(position);
        cursor = previous[position];
    }
    run
}

/// Everything a live query observed since its previous batch.
#[derive(Debug, Clone)]
pub struct ChangeBatch<E> {
    /// Generation of the last commit folded into this batch
    pub generation: u64,
    pub events: Vec<ChangeEvent>,
    /// Result before the batch
    pub old: Vec<E>,
    /// Result after the batch
    pub new: Vec<E>,
    /// The main context was reset; incremental updates do not apply
    pub reset: bool,
}

/// A fetch request kept current against the main context.
pub struct LiveQuery<E: Entity> {
    request: FetchRequest<E>,
    notices: Receiver<CommitNotice>,
    current: Vec<E>,
    generation: u64,
}

impl<E: Entity> LiveQuery<E> {
    /// Run the baseline fetch and subscribe to commits in one main-lane job,
    /// so no commit falls between the two.
    pub fn new(main: &MainContext, request: FetchRequest<E>) -> Result<Self> {
        let baseline_request = request.clone();
        let (current, generation, notices) =
            main.observe(move |context| context.fetch(&baseline_request))?;
        Ok(Self {
            request,
            notices,
            current,
            generation,
        })
    }

    pub fn request(&self) -> &FetchRequest<E> {
        &self.request
    }

    /// The result as of the last delivered batch.
    pub fn objects(&self) -> &[E] {
        &self.current
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Fold every commit notice already queued into one batch. Returns `None`
    /// when nothing queued affects this query.
    pub fn try_next_batch(&mut self) -> Option<ChangeBatch<E>> {
        let mut pending = Vec::new();
        loop {
            match self.notices.try_recv() {
                Ok(notice) => pending.push(notice),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        self.fold(pending)
    }

    /// Wait up to `timeout` for a batch that affects this query.
    pub fn next_batch_timeout(&mut self, timeout: Duration) -> Option<ChangeBatch<E>> {
        // No deadline when `timeout` is past what `Instant` can represent.
        let deadline = Instant::now().checked_add(timeout);
        loop {
            let first = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    match self.notices.recv_timeout(remaining) {
                        Ok(notice) => notice,
                        Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                            return None
                        }
                    }
                }
                None => self.notices.recv().ok()?,
            };
            let mut pending = vec![first];
            while let Ok(notice) = self.notices.try_recv() {
                pending.push(notice);
            }
            if let Some(batch) = self.fold(pending) {
                return Some(batch);
            }
        }
    }

    fn fold(&mut self, notices: Vec<CommitNotice>) -> Option<ChangeBatch<E>> {
        let last = notices.last()?;
        let generation = last.generation;
        let snapshot = Arc::clone(&last.snapshot);

        let reset = notices.iter().any(|notice| notice.reset);
        let changed: HashSet<ObjectId> = notices
            .iter()
            .flat_map(|notice| notice.changes.ids_of(E::KIND).collect::<Vec<_>>())
            .collect();
        self.generation = generation;
        if !reset && changed.is_empty() {
            return None;
        }

        let new = self.request.execute(&snapshot);
        let events = diff_results(&self.current, &new, &changed);
        if events.is_empty() && !reset {
            return None;
        }
        debug!(
            generation,
            commits = notices.len(),
            events = events.len(),
            reset,
            "live query batch"
        );
        let old = std::mem::replace(&mut self.current, new.clone());
        Some(ChangeBatch {
            generation,
            events,
            old,
            new,
            reset,
        })
    }
}
