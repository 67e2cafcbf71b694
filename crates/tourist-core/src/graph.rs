//! Object graph snapshots and the change sets that move between them.
//!
//! A [`Graph`] is an immutable-by-convention arena of every pin and photo a
//! context can see. Contexts hold it behind an `Arc` and mutate it with
//! `Arc::make_mut`, so a snapshot handed to another lane stays a consistent
//! point-in-time view while the owner moves on to the next generation.

use std::collections::btree_map;
use std::collections::BTreeMap;

use crate::entity::{EntityKind, Object, ObjectId, Photo, Pin};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Graph {
    pub(crate) pins: BTreeMap<ObjectId, Pin>,
    pub(crate) photos: BTreeMap<ObjectId, Photo>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pin(&self, id: ObjectId) -> Option<&Pin> {
        self.pins.get(&id)
    }

    pub fn photo(&self, id: ObjectId) -> Option<&Photo> {
        self.photos.get(&id)
    }

    pub fn pins(&self) -> impl Iterator<Item = &Pin> {
        self.pins.values()
    }

    pub fn photos(&self) -> impl Iterator<Item = &Photo> {
        self.photos.values()
    }

    /// Photos owned by `pin`, in no particular order.
    pub fn photos_of(&self, pin: ObjectId) -> impl Iterator<Item = &Photo> {
        self.photos.values().filter(move |photo| photo.pin == pin)
    }

    pub fn kind_of(&self, id: ObjectId) -> Option<EntityKind> {
        if self.pins.contains_key(&id) {
            Some(EntityKind::Pin)
        } else if self.photos.contains_key(&id) {
            Some(EntityKind::Photo)
        } else {
            None
        }
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.kind_of(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.pins.len() + self.photos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pins.is_empty() && self.photos.is_empty()
    }

    pub(crate) fn upsert(&mut self, object: Object) {
        match object {
            Object::Pin(pin) => {
                self.pins.insert(pin.object_id, pin);
            }
            Object::Photo(photo) => {
                self.photos.insert(photo.object_id, photo);
            }
        }
    }

    pub(crate) fn remove(&mut self, kind: EntityKind, id: ObjectId) {
        match kind {
            EntityKind::Pin => {
                self.pins.remove(&id);
            }
            EntityKind::Photo => {
                self.photos.remove(&id);
            }
        }
    }

    /// Apply a child's committed changes on top of this graph.
    pub(crate) fn apply(&mut self, changes: &ChangeSet) {
        for (id, change) in changes.iter() {
            match change {
                Change::Inserted(object) | Change::Updated(object) => self.upsert(object.clone()),
                Change::Deleted(kind) => self.remove(*kind, *id),
            }
        }
    }
}

/// Net effect of a context's mutations on one object since its last save.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Inserted(Object),
    Updated(Object),
    Deleted(EntityKind),
}

impl Change {
    pub fn kind(&self) -> EntityKind {
        match self {
            Change::Inserted(object) | Change::Updated(object) => object.kind(),
            Change::Deleted(kind) => *kind,
        }
    }

    /// Fold a later change into this one; `None` means the two cancel out.
    fn then(self, later: Change) -> Option<Change> {
        match (self, later) {
            (Change::Inserted(_), Change::Deleted(_)) => None,
            (Change::Inserted(_), Change::Inserted(object) | Change::Updated(object)) => {
                Some(Change::Inserted(object))
            }
            (Change::Updated(_) | Change::Deleted(_), Change::Inserted(object) | Change::Updated(object)) => {
                Some(Change::Updated(object))
            }
            (Change::Updated(_) | Change::Deleted(_), Change::Deleted(kind)) => {
                Some(Change::Deleted(kind))
            }
        }
    }
}

/// Pending changes keyed by object identity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    changes: BTreeMap<ObjectId, Change>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn get(&self, id: ObjectId) -> Option<&Change> {
        self.changes.get(&id)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, ObjectId, Change> {
        self.changes.iter()
    }

    /// Whether any change concerns objects of `kind`.
    pub fn touches(&self, kind: EntityKind) -> bool {
        self.changes.values().any(|change| change.kind() == kind)
    }

    /// Ids of changed objects of `kind`.
    pub fn ids_of(&self, kind: EntityKind) -> impl Iterator<Item = ObjectId> + '_ {
        self.changes
            .iter()
            .filter(move |(_, change)| change.kind() == kind)
            .map(|(id, _)| *id)
    }

    pub fn inserted_count(&self) -> usize {
        self.count(|change| matches!(change, Change::Inserted(_)))
    }

    pub fn updated_count(&self) -> usize {
        self.count(|change| matches!(change, Change::Updated(_)))
    }

    pub fn deleted_count(&self) -> usize {
        self.count(|change| matches!(change, Change::Deleted(_)))
    }

    fn count(&self, predicate: impl Fn(&Change) -> bool) -> usize {
        self.changes.values().filter(|change| predicate(change)).count()
    }

    pub(crate) fn record(&mut self, id: ObjectId, change: Change) {
        match self.changes.remove(&id) {
            None => {
                self.changes.insert(id, change);
            }
            Some(earlier) => {
                if let Some(folded) = earlier.then(change) {
                    self.changes.insert(id, folded);
                }
            }
        }
    }

    /// Fold `later` into this set as if its changes had been recorded here.
    pub(crate) fn merge(&mut self, later: &ChangeSet) {
        for (id, change) in later.iter() {
            self.record(*id, change.clone());
        }
    }

    /// Changes in an order that respects foreign keys: pin writes, photo
    /// writes, photo deletes, then pin deletes.
    pub(crate) fn in_commit_order(&self) -> Vec<(ObjectId, &Change)> {
        let rank = |change: &Change| match change {
            Change::Inserted(Object::Pin(_)) | Change::Updated(Object::Pin(_)) => 0,
            Change::Inserted(Object::Photo(_)) | Change::Updated(Object::Photo(_)) => 1,
            Change::Deleted(EntityKind::Photo) => 2,
            Change::Deleted(EntityKind::Pin) => 3,
        };
        let mut ordered: Vec<(ObjectId, &Change)> =
            self.changes.iter().map(|(id, change)| (*id, change)).collect();
        ordered.sort_by_key(|(_, change)| rank(change));
        ordered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::NewPhoto;

    fn photo(pin: ObjectId, index: i64) -> Photo {
        Photo::new(
            pin,
            NewPhoto {
                id: index,
                index,
                url: format!("https://farm.example/{index}.jpg"),
            },
        )
        .unwrap()
    }

    #[test]
    fn insert_then_delete_cancels_out() {
        let pin = Pin::new(10.0, 10.0).unwrap();
        let mut changes = ChangeSet::new();
        changes.record(pin.object_id, Change::Inserted(pin.clone().into()));
        changes.record(pin.object_id, Change::Deleted(EntityKind::Pin));
        assert!(changes.is_empty());
    }

    #[test]
    fn insert_then_update_stays_an_insert() {
        let pin = Pin::new(10.0, 10.0).unwrap();
        let mut photo = photo(pin.object_id, 0);
        let mut changes = ChangeSet::new();
        changes.record(photo.object_id, Change::Inserted(photo.clone().into()));
        photo.image = Some(vec![1u8, 2, 3].into());
        changes.record(photo.object_id, Change::Updated(photo.clone().into()));

        assert_eq!(changes.inserted_count(), 1);
        assert_eq!(
            changes.get(photo.object_id),
            Some(&Change::Inserted(photo.into()))
        );
    }

    #[test]
    fn merge_folds_later_changes() {
        let pin = Pin::new(10.0, 10.0).unwrap();
        let mut earlier = ChangeSet::new();
        earlier.record(pin.object_id, Change::Updated(pin.clone().into()));

        let mut later = ChangeSet::new();
        later.record(pin.object_id, Change::Deleted(EntityKind::Pin));

        earlier.merge(&later);
        assert_eq!(earlier.deleted_count(), 1);
        assert!(earlier.touches(EntityKind::Pin));
        assert!(!earlier.touches(EntityKind::Photo));
    }

    #[test]
    fn commit_order_puts_pins_before_photos() {
        let pin = Pin::new(10.0, 10.0).unwrap();
        let photo = photo(pin.object_id, 0);
        let old_pin = Pin::new(20.0, 20.0).unwrap();
        let old_photo = self::photo(old_pin.object_id, 0);

        let mut changes = ChangeSet::new();
        changes.record(old_pin.object_id, Change::Deleted(EntityKind::Pin));
        changes.record(photo.object_id, Change::Inserted(photo.clone().into()));
        changes.record(old_photo.object_id, Change::Deleted(EntityKind::Photo));
        changes.record(pin.object_id, Change::Inserted(pin.clone().into()));

        let order: Vec<ObjectId> = changes.in_commit_order().into_iter().map(|(id, _)| id).collect();
        assert_eq!(
            order,
            vec![
                pin.object_id,
                photo.object_id,
                old_photo.object_id,
                old_pin.object_id
            ]
        );
    }

    #[test]
    fn apply_upserts_and_removes() {
        let pin = Pin::new(10.0, 10.0).unwrap();
        let photo = photo(pin.object_id, 3);

        let mut changes = ChangeSet::new();
        changes.record(pin.object_id, Change::Inserted(pin.clone().into()));
        changes.record(photo.object_id, Change::Inserted(photo.clone().into()));

        let mut graph = Graph::new();
        graph.apply(&changes);
        assert_eq!(graph.len(), 2);
        assert_eq!(graph.photos_of(pin.object_id).count(), 1);

        let mut removal = ChangeSet::new();
        removal.record(photo.object_id, Change::Deleted(EntityKind::Photo));
        graph.apply(&removal);
        assert!(graph.photo(photo.object_id).is_none());
        assert_eq!(graph.kind_of(pin.object_id), Some(EntityKind::Pin));
    }
}
