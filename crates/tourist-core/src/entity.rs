use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ContextError;
use crate::graph::Graph;
use crate::model::keys;

/// Store-wide object identity (UUID v4).
///
/// This is the handle passed between lanes; the receiving lane looks the
/// object up again in its own context.
pub type ObjectId = Uuid;

/// Random 32-bit pin identifier assigned at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PinId(pub u32);

impl PinId {
    /// Draw a fresh identifier in `[0, i32::MAX)`. Collisions are not checked.
    pub fn random() -> Self {
        PinId(rand::rng().random_range(0..i32::MAX as u32))
    }
}

impl std::fmt::Display for PinId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Entity types known to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityKind {
    Pin,
    Photo,
}

impl EntityKind {
    /// Entity name as declared in the model.
    pub fn name(self) -> &'static str {
        match self {
            EntityKind::Pin => keys::PIN,
            EntityKind::Photo => keys::PHOTO,
        }
    }
}

/// A geographic marker owning a collection of photos.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pin {
    pub object_id: ObjectId,
    pub id: PinId,
    pub latitude: f64,
    pub longitude: f64,
    pub create_date: DateTime<Utc>,
}

impl Pin {
    /// Create a pin with a fresh identity and the current time, truncated to
    /// the millisecond precision the store keeps.
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, ContextError> {
        validate_coordinate(latitude, longitude)?;
        Ok(Self {
            object_id: Uuid::new_v4(),
            id: PinId::random(),
            latitude,
            longitude,
            create_date: Utc::now().trunc_subsecs(3),
        })
    }

    /// Latitude and longitude formatted the way the photo search API takes them.
    pub fn coordinate_strings(&self) -> (String, String) {
        (self.latitude.to_string(), self.longitude.to_string())
    }
}

/// Reject coordinates that are not finite or out of range.
pub fn validate_coordinate(latitude: f64, longitude: f64) -> Result<(), ContextError> {
    let valid = latitude.is_finite()
        && longitude.is_finite()
        && (-90.0..=90.0).contains(&latitude)
        && (-180.0..=180.0).contains(&longitude);
    if valid {
        Ok(())
    } else {
        Err(ContextError::InvalidCoordinate {
            latitude,
            longitude,
        })
    }
}

/// A single image belonging to exactly one pin.
#[derive(Debug, Clone, PartialEq)]
pub struct Photo {
    pub object_id: ObjectId,
    /// Provider-assigned id; not unique across pins.
    pub id: i64,
    /// Position within the owning pin's collection.
    pub index: i64,
    pub url: String,
    /// Raw image bytes, written once after the download completes.
    pub image: Option<Arc<[u8]>>,
    /// Owning pin.
    pub pin: ObjectId,
}

impl Photo {
    pub fn new(pin: ObjectId, new: NewPhoto) -> Result<Self, ContextError> {
        if new.url.trim().is_empty() {
            return Err(ContextError::MissingUrl(new.id));
        }
        Ok(Self {
            object_id: Uuid::new_v4(),
            id: new.id,
            index: new.index,
            url: new.url,
            image: None,
            pin,
        })
    }

    pub fn has_image(&self) -> bool {
        self.image.is_some()
    }
}

/// Attributes supplied when creating a photo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPhoto {
    pub id: i64,
    pub index: i64,
    pub url: String,
}

/// Any stored object.
#[derive(Debug, Clone, PartialEq)]
pub enum Object {
    Pin(Pin),
    Photo(Photo),
}

impl Object {
    pub fn object_id(&self) -> ObjectId {
        match self {
            Object::Pin(pin) => pin.object_id,
            Object::Photo(photo) => photo.object_id,
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            Object::Pin(_) => EntityKind::Pin,
            Object::Photo(_) => EntityKind::Photo,
        }
    }
}

impl From<Pin> for Object {
    fn from(pin: Pin) -> Self {
        Object::Pin(pin)
    }
}

impl From<Photo> for Object {
    fn from(photo: Photo) -> Self {
        Object::Photo(photo)
    }
}

/// Typed access to one entity table of a [`Graph`].
pub trait Entity: Clone + Send + Sync + 'static {
    const KIND: EntityKind;

    fn object_id(&self) -> ObjectId;

    fn table(graph: &Graph) -> &BTreeMap<ObjectId, Self>;
}

impl Entity for Pin {
    const KIND: EntityKind = EntityKind::Pin;

    fn object_id(&self) -> ObjectId {
        self.object_id
    }

    fn table(graph: &Graph) -> &BTreeMap<ObjectId, Self> {
        &graph.pins
    }
}

impl Entity for Photo {
    const KIND: EntityKind = EntityKind::Photo;

    fn object_id(&self) -> ObjectId {
        self.object_id
    }

    fn table(graph: &Graph) -> &BTreeMap<ObjectId, Self> {
        &graph.photos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_rejects_non_finite_coordinates() {
        assert!(Pin::new(f64::NAN, 0.0).is_err());
        assert!(Pin::new(0.0, f64::INFINITY).is_err());
        assert!(Pin::new(91.0, 0.0).is_err());
        assert!(Pin::new(0.0, -180.5).is_err());

        let pin = Pin::new(28.497529, -81.368113).unwrap();
        assert!(pin.id.0 < i32::MAX as u32);
        assert_eq!(
            pin.coordinate_strings(),
            ("28.497529".to_string(), "-81.368113".to_string())
        );
    }

    #[test]
    fn photo_requires_url() {
        let pin = Uuid::new_v4();
        let err = Photo::new(
            pin,
            NewPhoto {
                id: 7,
                index: 0,
                url: "  ".into(),
            },
        )
        .unwrap_err();
        assert_eq!(err, ContextError::MissingUrl(7));

        let photo = Photo::new(
            pin,
            NewPhoto {
                id: 7,
                index: 0,
                url: "https://farm.example/7.jpg".into(),
            },
        )
        .unwrap();
        assert_eq!(photo.pin, pin);
        assert!(!photo.has_image());
    }

    #[test]
    fn pin_serde_round_trip() {
        let pin = Pin::new(48.8584, 2.2945).unwrap();
        let json = serde_json::to_string(&pin).unwrap();
        let back: Pin = serde_json::from_str(&json).unwrap();
        assert_eq!(pin, back);
    }
}
