//! Static description of the stored entities.
//!
//! The model is loaded once at startup, either from the copy bundled into the
//! binary or from a file named by `StackConfig::model_path`. It drives the
//! store's DDL and is checked against the entities the engine maps before any
//! lane is started.

use std::fmt::Write as _;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StackError};

/// The model shipped with the crate
const BUNDLED_MODEL: &str = include_str!("../resources/Model.toml");

/// Entity, attribute and relationship names shared by the model and the code.
pub mod keys {
    pub const PIN: &str = "Pin";
    pub const PHOTO: &str = "Photo";

    pub mod pin {
        pub const ID: &str = "id";
        pub const LATITUDE: &str = "latitude";
        pub const LONGITUDE: &str = "longitude";
        pub const CREATE_DATE: &str = "createDate";
        pub const PHOTOS: &str = "photos";
    }

    pub mod photo {
        pub const ID: &str = "id";
        pub const INDEX: &str = "index";
        pub const URL: &str = "url";
        pub const IMAGE: &str = "image";
        pub const PIN: &str = "pin";
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeKind {
    Int32,
    Int64,
    Double,
    /// Milliseconds since the Unix epoch
    Date,
    String,
    Binary,
    Uuid,
}

impl AttributeKind {
    fn sql_type(self) -> &'static str {
        match self {
            AttributeKind::Int32 | AttributeKind::Int64 | AttributeKind::Date => "INTEGER",
            AttributeKind::Double => "REAL",
            AttributeKind::String | AttributeKind::Uuid => "TEXT",
            AttributeKind::Binary => "BLOB",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteRule {
    #[default]
    Nullify,
    Cascade,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeDescription {
    pub name: String,
    pub kind: AttributeKind,
    #[serde(default)]
    pub optional: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipDescription {
    pub name: String,
    pub destination: String,
    #[serde(default)]
    pub to_many: bool,
    #[serde(default)]
    pub inverse: Option<String>,
    #[serde(default)]
    pub delete_rule: DeleteRule,
    #[serde(default)]
    pub optional: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDescription {
    pub name: String,
    #[serde(default)]
    pub attributes: Vec<AttributeDescription>,
    #[serde(default)]
    pub relationships: Vec<RelationshipDescription>,
}

impl EntityDescription {
    pub fn attribute(&self, name: &str) -> Option<&AttributeDescription> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn relationship(&self, name: &str) -> Option<&RelationshipDescription> {
        self.relationships.iter().find(|r| r.name == name)
    }
}

/// Entity types, attributes and relationships of the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub name: String,
    pub version: u32,
    pub entities: Vec<EntityDescription>,
}

impl Model {
    /// The model compiled into the crate, validated.
    pub fn bundled() -> Result<Self> {
        let model = Self::from_toml(BUNDLED_MODEL)?;
        model.validate()?;
        Ok(model)
    }

    /// Read and validate a model file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => StackError::ModelNotFound(path.to_path_buf()),
            _ => StackError::ModelParse(format!("{}: {}", path.display(), e)),
        })?;
        let model = Self::from_toml(&text)?;
        model.validate()?;
        Ok(model)
    }

    /// Parse without validating.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| StackError::ModelParse(e.to_string()))
    }

    pub fn entity(&self, name: &str) -> Option<&EntityDescription> {
        self.entities.iter().find(|e| e.name == name)
    }

    /// Check internal consistency and that the mapped entities are present.
    pub fn validate(&self) -> Result<()> {
        for entity in &self.entities {
            if self.entities.iter().filter(|e| e.name == entity.name).count() > 1 {
                return Err(invalid(format!("entity {} declared twice", entity.name)));
            }
            for relationship in &entity.relationships {
                let destination = self.entity(&relationship.destination).ok_or_else(|| {
                    invalid(format!(
                        "{}.{} points at unknown entity {}",
                        entity.name, relationship.name, relationship.destination
                    ))
                })?;
                match &relationship.inverse {
                    Some(inverse) => {
                        if destination.relationship(inverse).is_none() {
                            return Err(invalid(format!(
                                "{}.{} names missing inverse {}.{}",
                                entity.name, relationship.name, destination.name, inverse
                            )));
                        }
                    }
                    None if !relationship.to_many => {
                        return Err(invalid(format!(
                            "to-one relationship {}.{} has no inverse",
                            entity.name, relationship.name
                        )));
                    }
                    None => {}
                }
            }
        }

        self.require_attributes(
            keys::PIN,
            &[
                (keys::pin::ID, AttributeKind::Int32),
                (keys::pin::LATITUDE, AttributeKind::Double),
                (keys::pin::LONGITUDE, AttributeKind::Double),
                (keys::pin::CREATE_DATE, AttributeKind::Date),
            ],
        )?;
        self.require_attributes(
            keys::PHOTO,
            &[
                (keys::photo::ID, AttributeKind::Int64),
                (keys::photo::INDEX, AttributeKind::Int64),
                (keys::photo::URL, AttributeKind::String),
                (keys::photo::IMAGE, AttributeKind::Binary),
            ],
        )?;

        let owner = self
            .entity(keys::PHOTO)
            .and_then(|photo| photo.relationship(keys::photo::PIN))
            .ok_or_else(|| invalid("Photo.pin relationship missing".to_string()))?;
        if owner.to_many || owner.destination != keys::PIN {
            return Err(invalid("Photo.pin must be a to-one relationship to Pin".to_string()));
        }

        let photos = self
            .entity(keys::PIN)
            .and_then(|pin| pin.relationship(keys::pin::PHOTOS))
            .ok_or_else(|| invalid("Pin.photos relationship missing".to_string()))?;
        if !photos.to_many || photos.delete_rule != DeleteRule::Cascade {
            return Err(invalid(
                "Pin.photos must be a to-many relationship with cascade delete".to_string(),
            ));
        }

        Ok(())
    }

    fn require_attributes(&self, entity: &str, expected: &[(&str, AttributeKind)]) -> Result<()> {
        let description = self
            .entity(entity)
            .ok_or_else(|| invalid(format!("entity {entity} missing")))?;
        for (name, kind) in expected {
            match description.attribute(name) {
                Some(attribute) if attribute.kind == *kind => {}
                Some(attribute) => {
                    return Err(invalid(format!(
                        "{entity}.{name} is {:?}, expected {:?}",
                        attribute.kind, kind
                    )))
                }
                None => return Err(invalid(format!("{entity}.{name} missing"))),
            }
        }
        Ok(())
    }

    /// SQLite DDL for every entity table and its foreign-key indexes.
    pub fn create_tables_sql(&self) -> String {
        let mut sql = String::new();
        for entity in &self.entities {
            let _ = writeln!(sql, "CREATE TABLE IF NOT EXISTS \"{}\" (", entity.name);
            let mut columns = vec!["    object_id TEXT PRIMARY KEY NOT NULL".to_string()];
            for attribute in &entity.attributes {
                let null = if attribute.optional { "" } else { " NOT NULL" };
                columns.push(format!(
                    "    \"{}\" {}{}",
                    attribute.name,
                    attribute.kind.sql_type(),
                    null
                ));
            }
            for relationship in entity.relationships.iter().filter(|r| !r.to_many) {
                let null = if relationship.optional { "" } else { " NOT NULL" };
                let on_delete = match self.inverse_delete_rule(relationship) {
                    DeleteRule::Cascade => "CASCADE",
                    DeleteRule::Nullify => "SET NULL",
                };
                columns.push(format!(
                    "    \"{}\" TEXT{} REFERENCES \"{}\"(object_id) ON DELETE {}",
                    relationship.name, null, relationship.destination, on_delete
                ));
            }
            sql.push_str(&columns.join(",\n"));
            sql.push_str("\n);\n");

            for relationship in entity.relationships.iter().filter(|r| !r.to_many) {
                let _ = writeln!(
                    sql,
                    "CREATE INDEX IF NOT EXISTS \"idx_{0}_{1}\" ON \"{0}\"(\"{1}\");",
                    entity.name, relationship.name
                );
            }
        }
        sql
    }

    fn inverse_delete_rule(&self, relationship: &RelationshipDescription) -> DeleteRule {
        relationship
            .inverse
            .as_deref()
            .and_then(|inverse| {
                self.entity(&relationship.destination)
                    .and_then(|destination| destination.relationship(inverse))
            })
            .map(|inverse| inverse.delete_rule)
            .unwrap_or_default()
    }
}

fn invalid(message: String) -> StackError {
    StackError::ModelInvalid(message)
}
