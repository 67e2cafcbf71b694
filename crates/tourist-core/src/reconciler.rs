//! Change diff reconciler.
//!
//! Turns the change batches of a [`LiveQuery`] into ordered structural
//! operations for a list view. Every batch is either applied as one atomic
//! group of operations, or, when the operations cannot be shown to transform
//! the view's current list into the new result, replaced by a full reload.

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::entity::{Entity, ObjectId};
use crate::query::{ChangeBatch, ChangeEvent, LiveQuery};

/// One structural change to an ordered list.
///
/// `Delete`, `Update` and `Move::from` positions are in the list as it was
/// before the batch; `Insert` and `Move::to` positions are in the list after
/// it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StructuralOp {
    Delete(usize),
    Insert(usize),
    Move { from: usize, to: usize },
    Update(usize),
}

impl From<ChangeEvent> for StructuralOp {
    fn from(event: ChangeEvent) -> Self {
        match event {
            ChangeEvent::Inserted { new_index, .. } => StructuralOp::Insert(new_index),
            ChangeEvent::Deleted { old_index, .. } => StructuralOp::Delete(old_index),
            ChangeEvent::Updated { old_index, .. } => StructuralOp::Update(old_index),
            ChangeEvent::Moved {
                old_index,
                new_index,
                ..
            } => StructuralOp::Move {
                from: old_index,
                to: new_index,
            },
        }
    }
}

/// Translate raw events into operations in application order: deletes from
/// the highest position down, moves, inserts from the lowest position up,
/// then updates.
pub fn plan_operations(events: &[ChangeEvent]) -> Vec<StructuralOp> {
    let mut deletes = Vec::new();
    let mut moves = Vec::new();
    let mut inserts = Vec::new();
    let mut updates = Vec::new();
    for event in events {
        match StructuralOp::from(*event) {
            op @ StructuralOp::Delete(_) => deletes.push(op),
            op @ StructuralOp::Move { .. } => moves.push(op),
            op @ StructuralOp::Insert(_) => inserts.push(op),
            op @ StructuralOp::Update(_) => updates.push(op),
        }
    }
    deletes.sort_by(|a, b| position(b).cmp(&position(a)));
    moves.sort_by_key(position);
    inserts.sort_by_key(position);
    updates.sort_by_key(position);

    let mut ops = deletes;
    ops.extend(moves);
    ops.extend(inserts);
    ops.extend(updates);
    ops
}

fn position(op: &StructuralOp) -> usize {
    match op {
        StructuralOp::Delete(index) | StructuralOp::Insert(index) | StructuralOp::Update(index) => *index,
        StructuralOp::Move { to, .. } => *to,
    }
}

/// Why a set of operations could not be applied.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiffError {
    #[error("{op:?} is out of bounds for a list of {len}")]
    OutOfBounds { op: StructuralOp, len: usize },

    #[error("{0:?} touches a position another operation already claimed")]
    Conflict(StructuralOp),

    #[error("operations produce {actual} items, expected {expected}")]
    CountMismatch { expected: usize, actual: usize },
}

/// Apply `ops` to `old` the way a list view would.
///
/// Untouched items are carried over from `old`; inserted, moved and updated
/// items take their content from `new_items`, the post-batch list.
pub fn apply_operations<T: Clone>(
    old: &[T],
    ops: &[StructuralOp],
    new_items: &[T],
) -> Result<Vec<T>, DiffError> {
    let mut removed = vec![false; old.len()];
    let mut updated = vec![false; old.len()];
    let mut placed: Vec<Option<T>> = vec![None; new_items.len()];

    let claim_old = |flags: &mut Vec<bool>, other: &[bool], index: usize, op: StructuralOp| {
        if index >= flags.len() {
            return Err(DiffError::OutOfBounds { op, len: flags.len() });
        }
        if flags[index] || other[index] {
            return Err(DiffError::Conflict(op));
        }
        flags[index] = true;
        Ok(())
    };

    for &op in ops {
        match op {
            StructuralOp::Delete(index) => claim_old(&mut removed, &updated, index, op)?,
            StructuralOp::Update(index) => claim_old(&mut updated, &removed, index, op)?,
            StructuralOp::Insert(index) => {
                let slot = placed
                    .get_mut(index)
                    .ok_or(DiffError::OutOfBounds { op, len: new_items.len() })?;
                if slot.is_some() {
                    return Err(DiffError::Conflict(op));
                }
                *slot = Some(new_items[index].clone());
            }
            StructuralOp::Move { from, to } => {
                claim_old(&mut removed, &updated, from, op)?;
                let slot = placed
                    .get_mut(to)
                    .ok_or(DiffError::OutOfBounds { op, len: new_items.len() })?;
                if slot.is_some() {
                    return Err(DiffError::Conflict(op));
                }
                *slot = Some(new_items[to].clone());
            }
        }
    }

    let kept: Vec<usize> = (0..old.len()).filter(|&index| !removed[index]).collect();
    let free = placed.iter().filter(|slot| slot.is_none()).count();
    if kept.len() != free {
        return Err(DiffError::CountMismatch {
            expected: new_items.len(),
            actual: new_items.len() - free + kept.len(),
        });
    }

    let mut kept = kept.into_iter();
    let mut result = Vec::with_capacity(new_items.len());
    for (slot_index, slot) in placed.into_iter().enumerate() {
        match slot {
            Some(item) => result.push(item),
            None => {
                // Counts matched above, so a kept item is always available.
                let Some(index) = kept.next() else {
                    return Err(DiffError::CountMismatch {
                        expected: new_items.len(),
                        actual: result.len(),
                    });
                };
                if updated[index] {
                    result.push(new_items[slot_index].clone());
                } else {
                    result.push(old[index].clone());
                }
            }
        }
    }
    Ok(result)
}

/// A rendering surface showing an ordered list.
pub trait ListView<E> {
    /// Number of items the view currently shows.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply `ops` as one animated group. `snapshot` is the list after the
    /// batch, for reading the content of inserted and updated items.
    fn perform_batch_updates(&mut self, ops: &[StructuralOp], snapshot: &[E]);

    /// Discard everything and show `snapshot`.
    fn reload_data(&mut self, snapshot: &[E]);
}

/// List view backed by a `Vec`, recording what was done to it.
#[derive(Debug, Clone)]
pub struct VecListView<E> {
    items: Vec<E>,
    batches: Vec<Vec<StructuralOp>>,
    reloads: usize,
}

impl<E> Default for VecListView<E> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            batches: Vec::new(),
            reloads: 0,
        }
    }
}

impl<E: Clone> VecListView<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> &[E] {
        &self.items
    }

    /// Operation groups applied so far, oldest first.
    pub fn batches(&self) -> &[Vec<StructuralOp>] {
        &self.batches
    }

    pub fn reloads(&self) -> usize {
        self.reloads
    }
}

impl<E: Clone> ListView<E> for VecListView<E> {
    fn len(&self) -> usize {
        self.items.len()
    }

    fn perform_batch_updates(&mut self, ops: &[StructuralOp], snapshot: &[E]) {
        match apply_operations(&self.items, ops, snapshot) {
            Ok(items) => {
                self.items = items;
                self.batches.push(ops.to_vec());
            }
            Err(err) => {
                warn!(error = %err, "list view rejected batch, reloading");
                self.reload_data(snapshot);
            }
        }
    }

    fn reload_data(&mut self, snapshot: &[E]) {
        self.items = snapshot.to_vec();
        self.reloads += 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilerState {
    Idle,
    BatchReceived,
    Diffing,
    Applying,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadReason {
    /// The main context was reset
    Reset,
    /// The view does not show what the reconciler last gave it
    ViewOutOfSync { view_len: usize, expected: usize },
    /// The batch does not start from the list the view shows
    StaleBatch,
    /// The operations are malformed
    InvalidOperations(DiffError),
    /// The operations are well formed but produce the wrong list
    ResultMismatch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Applied {
        generation: u64,
        operations: Vec<StructuralOp>,
    },
    Reloaded {
        generation: u64,
        reason: ReloadReason,
    },
    /// No batch affecting the query was pending
    Unchanged,
}

/// Drives a list view from a live query.
pub struct Reconciler<E: Entity, V: ListView<E>> {
    query: LiveQuery<E>,
    view: V,
    /// Ids the view shows, in order
    shadow: Vec<ObjectId>,
    state: ReconcilerState,
}

impl<E: Entity, V: ListView<E>> Reconciler<E, V> {
    /// Load the query's current result into `view`.
    pub fn new(query: LiveQuery<E>, mut view: V) -> Self {
        view.reload_data(query.objects());
        let shadow = ids(query.objects());
        Self {
            query,
            view,
            shadow,
            state: ReconcilerState::Idle,
        }
    }

    pub fn state(&self) -> ReconcilerState {
        self.state
    }

    pub fn view(&self) -> &V {
        &self.view
    }

    pub fn view_mut(&mut self) -> &mut V {
        &mut self.view
    }

    pub fn query(&self) -> &LiveQuery<E> {
        &self.query
    }

    pub fn into_view(self) -> V {
        self.view
    }

    /// Handle whatever batch is already queued.
    pub fn process_pending(&mut self) -> Outcome {
        match self.query.try_next_batch() {
            Some(batch) => self.handle(batch),
            None => Outcome::Unchanged,
        }
    }

    /// Wait up to `timeout` for a batch, then handle it.
    pub fn wait_and_process(&mut self, timeout: Duration) -> Outcome {
        match self.query.next_batch_timeout(timeout) {
            Some(batch) => self.handle(batch),
            None => Outcome::Unchanged,
        }
    }

    fn handle(&mut self, batch: ChangeBatch<E>) -> Outcome {
        self.state = ReconcilerState::BatchReceived;
        let generation = batch.generation;
        if batch.reset {
            return self.reload(batch, ReloadReason::Reset);
        }
        if self.view.len() != self.shadow.len() {
            let reason = ReloadReason::ViewOutOfSync {
                view_len: self.view.len(),
                expected: self.shadow.len(),
            };
            return self.reload(batch, reason);
        }
        if ids(&batch.old) != self.shadow {
            return self.reload(batch, ReloadReason::StaleBatch);
        }

        self.state = ReconcilerState::Diffing;
        let operations = plan_operations(&batch.events);
        let new_ids = ids(&batch.new);
        match apply_operations(&self.shadow, &operations, &new_ids) {
            Ok(result) if result == new_ids => {}
            Ok(_) => return self.reload(batch, ReloadReason::ResultMismatch),
            Err(err) => return self.reload(batch, ReloadReason::InvalidOperations(err)),
        }

        self.state = ReconcilerState::Applying;
        self.view.perform_batch_updates(&operations, &batch.new);
        self.shadow = new_ids;
        self.state = ReconcilerState::Idle;
        debug!(generation, operations = operations.len(), "batch applied");
        Outcome::Applied {
            generation,
            operations,
        }
    }

    fn reload(&mut self, batch: ChangeBatch<E>, reason: ReloadReason) -> Outcome {
        if reason == ReloadReason::Reset {
            info!(generation = batch.generation, "context reset, reloading list");
        } else {
            warn!(generation = batch.generation, ?reason, "diff rejected, reloading list");
        }
        self.view.reload_data(&batch.new);
        self.shadow = ids(&batch.new);
        self.state = ReconcilerState::Idle;
        Outcome::Reloaded {
            generation: batch.generation,
            reason,
        }
    }
}

fn ids<E: Entity>(objects: &[E]) -> Vec<ObjectId> {
    objects.iter().map(Entity::object_id).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn event_ids(n: usize) -> Vec<ObjectId> {
        (0..n).map(|_| Uuid::new_v4()).collect()
    }

    #[test]
    fn plan_orders_deletes_descending_then_inserts_ascending() {
        let id = Uuid::new_v4();
        let events = vec![
            ChangeEvent::Inserted { object_id: id, new_index: 4 },
            ChangeEvent::Deleted { object_id: id, old_index: 1 },
            ChangeEvent::Updated { object_id: id, old_index: 2 },
            ChangeEvent::Inserted { object_id: id, new_index: 0 },
            ChangeEvent::Deleted { object_id: id, old_index: 3 },
            ChangeEvent::Moved { object_id: id, old_index: 0, new_index: 2 },
        ];
        assert_eq!(
            plan_operations(&events),
            vec![
                StructuralOp::Delete(3),
                StructuralOp::Delete(1),
                StructuralOp::Move { from: 0, to: 2 },
                StructuralOp::Insert(0),
                StructuralOp::Insert(4),
                StructuralOp::Update(2),
            ]
        );
    }

    #[test]
    fn apply_handles_mixed_operations() {
        let ids = event_ids(6);
        let old = vec![ids[0], ids[1], ids[2], ids[3]];
        // delete ids[1], move ids[0] to the end, insert ids[4] and ids[5]
        let new = vec![ids[4], ids[2], ids[3], ids[5], ids[0]];
        let ops = vec![
            StructuralOp::Delete(1),
            StructuralOp::Move { from: 0, to: 4 },
            StructuralOp::Insert(0),
            StructuralOp::Insert(3),
        ];
        assert_eq!(apply_operations(&old, &ops, &new).unwrap(), new);
    }

    #[test]
    fn apply_rejects_out_of_bounds_and_conflicts() {
        let ids = event_ids(3);
        let old = vec![ids[0], ids[1]];
        assert_eq!(
            apply_operations(&old, &[StructuralOp::Delete(2)], &old[..1]),
            Err(DiffError::OutOfBounds {
                op: StructuralOp::Delete(2),
                len: 2
            })
        );
        assert_eq!(
            apply_operations(
                &old,
                &[StructuralOp::Delete(0), StructuralOp::Update(0)],
                &old[1..]
            ),
            Err(DiffError::Conflict(StructuralOp::Update(0)))
        );
        assert!(matches!(
            apply_operations(&old, &[StructuralOp::Insert(0)], &ids[..2]),
            Err(DiffError::CountMismatch { .. })
        ));
    }

    #[test]
    fn updates_take_the_new_content() {
        let old = vec!["a", "b", "c"];
        let new = vec!["a", "B", "c"];
        assert_eq!(
            apply_operations(&old, &[StructuralOp::Update(1)], &new).unwrap(),
            new
        );
    }

    #[test]
    fn vec_list_view_records_batches_and_reloads() {
        let mut view: VecListView<i32> = VecListView::new();
        view.reload_data(&[1, 2, 3]);
        view.perform_batch_updates(&[StructuralOp::Delete(0)], &[2, 3]);
        assert_eq!(view.items(), &[2, 3]);
        assert_eq!(view.batches().len(), 1);

        view.perform_batch_updates(&[StructuralOp::Delete(7)], &[9]);
        assert_eq!(view.items(), &[9]);
        assert_eq!(view.reloads(), 2);
    }
}
