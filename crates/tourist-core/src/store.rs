//! SQLite-backed durable store.
//!
//! Owned exclusively by the persistent context's lane; nothing else holds the
//! connection.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use rusqlite::{params, Connection};
use tracing::{debug, error, info};

use crate::entity::{EntityKind, Object, ObjectId, Photo, Pin, PinId};
use crate::error::{Result, StackError};
use crate::graph::{Change, ChangeSet, Graph};
use crate::model::{keys, Model};

const SCHEMA_VERSION_TABLE: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);
";

/// The on-disk database file holding every committed pin and photo.
pub struct SqliteStore {
    conn: Connection,
    path: Option<PathBuf>,
    model: Arc<Model>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("path", &self.path)
            .field("model_version", &self.model.version)
            .finish()
    }
}

impl SqliteStore {
    /// Open (or create) the store file at `path`.
    pub fn open(path: &Path, model: Arc<Model>) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| open_error(path, e))?;
        let store = Self {
            conn,
            path: Some(path.to_path_buf()),
            model,
        };
        store.initialize().map_err(|e| match e {
            StackError::Storage(message) => StackError::StoreOpen {
                path: path.to_path_buf(),
                message,
            },
            other => other,
        })?;
        info!(path = %path.display(), "store opened");
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    pub fn open_in_memory(model: Arc<Model>) -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| open_error(Path::new(":memory:"), e))?;
        let store = Self {
            conn,
            path: None,
            model,
        };
        store.initialize()?;
        Ok(store)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    fn initialize(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA foreign_keys = ON;
            ",
        )?;
        self.conn.execute_batch(SCHEMA_VERSION_TABLE)?;

        let current_version = self.schema_version().unwrap_or(0);
        let model_version = self.model.version;
        if current_version > model_version {
            return Err(StackError::Storage(format!(
                "store was written by model version {current_version}, this build knows {model_version}"
            )));
        }
        if current_version < model_version {
            // Tables are created with IF NOT EXISTS, so an older store only
            // gains the entities it lacks.
            self.conn.execute_batch(&self.model.create_tables_sql())?;
            self.conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                [model_version],
            )?;
            debug!(from = current_version, to = model_version, "store schema created");
        }
        Ok(())
    }

    fn schema_version(&self) -> Option<u32> {
        self.conn
            .query_row(
                "SELECT version FROM schema_version ORDER BY rowid DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .ok()
    }

    /// Read every committed object.
    pub fn load(&self) -> Result<Graph> {
        let mut graph = Graph::new();

        let mut stmt = self.conn.prepare(&format!(
            "SELECT object_id, \"{}\", \"{}\", \"{}\", \"{}\" FROM \"{}\"",
            keys::pin::ID,
            keys::pin::LATITUDE,
            keys::pin::LONGITUDE,
            keys::pin::CREATE_DATE,
            keys::PIN
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, f64>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;
        for row in rows {
            let (object_id, id, latitude, longitude, created_ms) = row?;
            let id = u32::try_from(id)
                .map_err(|_| StackError::Storage(format!("pin id out of range: {id}")))?;
            let create_date = Utc
                .timestamp_millis_opt(created_ms)
                .single()
                .ok_or_else(|| StackError::Storage(format!("bad createDate: {created_ms}")))?;
            graph.upsert(Object::Pin(Pin {
                object_id: parse_object_id(&object_id)?,
                id: PinId(id),
                latitude,
                longitude,
                create_date,
            }));
        }

        let mut stmt = self.conn.prepare(&format!(
            "SELECT object_id, \"{}\", \"{}\", \"{}\", \"{}\", \"{}\" FROM \"{}\"",
            keys::photo::ID,
            keys::photo::INDEX,
            keys::photo::URL,
            keys::photo::IMAGE,
            keys::photo::PIN,
            keys::PHOTO
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<Vec<u8>>>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;
        for row in rows {
            let (object_id, id, index, url, image, pin) = row?;
            graph.upsert(Object::Photo(Photo {
                object_id: parse_object_id(&object_id)?,
                id,
                index,
                url,
                image: image.map(Arc::from),
                pin: parse_object_id(&pin)?,
            }));
        }

        Ok(graph)
    }

    /// Write `changes` in a single transaction.
    pub fn commit(&mut self, changes: &ChangeSet) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let upsert_pin = format!(
            "INSERT INTO \"{pin}\" (object_id, \"{id}\", \"{lat}\", \"{lon}\", \"{created}\")
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(object_id) DO UPDATE SET
                \"{id}\" = excluded.\"{id}\",
                \"{lat}\" = excluded.\"{lat}\",
                \"{lon}\" = excluded.\"{lon}\",
                \"{created}\" = excluded.\"{created}\"",
            pin = keys::PIN,
            id = keys::pin::ID,
            lat = keys::pin::LATITUDE,
            lon = keys::pin::LONGITUDE,
            created = keys::pin::CREATE_DATE,
        );
        let upsert_photo = format!(
            "INSERT INTO \"{photo}\" (object_id, \"{id}\", \"{index}\", \"{url}\", \"{image}\", \"{pin}\")
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(object_id) DO UPDATE SET
                \"{id}\" = excluded.\"{id}\",
                \"{index}\" = excluded.\"{index}\",
                \"{url}\" = excluded.\"{url}\",
                \"{image}\" = excluded.\"{image}\",
                \"{pin}\" = excluded.\"{pin}\"",
            photo = keys::PHOTO,
            id = keys::photo::ID,
            index = keys::photo::INDEX,
            url = keys::photo::URL,
            image = keys::photo::IMAGE,
            pin = keys::photo::PIN,
        );

        let tx = self.conn.transaction()?;
        for (object_id, change) in changes.in_commit_order() {
            match change {
                Change::Inserted(Object::Pin(pin)) | Change::Updated(Object::Pin(pin)) => {
                    tx.execute(
                        &upsert_pin,
                        params![
                            pin.object_id.to_string(),
                            pin.id.0,
                            pin.latitude,
                            pin.longitude,
                            pin.create_date.timestamp_millis(),
                        ],
                    )?;
                }
                Change::Inserted(Object::Photo(photo)) | Change::Updated(Object::Photo(photo)) => {
                    tx.execute(
                        &upsert_photo,
                        params![
                            photo.object_id.to_string(),
                            photo.id,
                            photo.index,
                            photo.url,
                            photo.image.as_deref(),
                            photo.pin.to_string(),
                        ],
                    )?;
                }
                Change::Deleted(kind) => {
                    tx.execute(
                        &format!("DELETE FROM \"{}\" WHERE object_id = ?1", kind.name()),
                        [object_id.to_string()],
                    )?;
                }
            }
        }
        tx.commit()?;

        debug!(
            inserted = changes.inserted_count(),
            updated = changes.updated_count(),
            deleted = changes.deleted_count(),
            "store commit"
        );
        Ok(())
    }

    /// Number of committed rows of `kind`.
    pub fn count(&self, kind: EntityKind) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM \"{}\"", kind.name()),
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Delete the store file and its journal, then open an empty store at the
    /// same path. In-memory stores just lose their rows.
    ///
    /// On error the store stays usable: either the old file is still open, or
    /// a freshly initialized connection replaces it.
    pub fn destroy_and_recreate(&mut self) -> Result<()> {
        let Some(path) = self.path.clone() else {
            self.conn = Connection::open_in_memory()?;
            return self.initialize();
        };

        let files = store_files(&path);
        for file in &files {
            if std::fs::symlink_metadata(file).is_ok_and(|meta| meta.is_dir()) {
                return Err(StackError::Storage(format!(
                    "{}: is a directory",
                    file.display()
                )));
            }
        }

        let placeholder = Connection::open_in_memory()?;
        let old = std::mem::replace(&mut self.conn, placeholder);
        if let Err((old, e)) = old.close() {
            self.conn = old;
            return Err(e.into());
        }

        let removed = files.iter().try_for_each(|file| match std::fs::remove_file(file) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StackError::from(e)),
        });
        let reopened = self.reopen(&path);
        removed?;
        reopened?;
        info!(path = %path.display(), "store destroyed and recreated");
        Ok(())
    }

    /// Point the connection back at `path`. If that fails, commits go to an
    /// initialized in-memory store until the stack is reopened.
    fn reopen(&mut self, path: &Path) -> Result<()> {
        let reopened = Connection::open(path)
            .map_err(StackError::from)
            .and_then(|conn| {
                self.conn = conn;
                self.initialize()
            });
        if let Err(e) = reopened {
            error!(path = %path.display(), error = %e, "store not reopened, committing in memory");
            self.conn = Connection::open_in_memory()?;
            self.initialize()?;
            return Err(e);
        }
        Ok(())
    }
}

/// The store file followed by its WAL and shared-memory files.
fn store_files(path: &Path) -> Vec<PathBuf> {
    ["", "-wal", "-shm"]
        .iter()
        .map(|suffix| {
            let mut file = path.as_os_str().to_os_string();
            file.push(suffix);
            PathBuf::from(file)
        })
        .collect()
}

fn parse_object_id(text: &str) -> Result<ObjectId> {
    uuid::Uuid::parse_str(text).map_err(|e| StackError::Storage(format!("object id {text}: {e}")))
}

fn open_error(path: &Path, err: rusqlite::Error) -> StackError {
    StackError::StoreOpen {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::NewPhoto;

    fn model() -> Arc<Model> {
        Arc::new(Model::bundled().unwrap())
    }

    fn pin_with_photos(count: i64) -> (Pin, Vec<Photo>) {
        let pin = Pin::new(28.497529, -81.368113).unwrap();
        let photos = (0..count)
            .map(|index| {
                Photo::new(
                    pin.object_id,
                    NewPhoto {
                        id: 1000 + index,
                        index,
                        url: format!("https://farm.example/{index}.jpg"),
                    },
                )
                .unwrap()
            })
            .collect();
        (pin, photos)
    }

    fn inserts(pin: &Pin, photos: &[Photo]) -> ChangeSet {
        let mut changes = ChangeSet::new();
        changes.record(pin.object_id, Change::Inserted(pin.clone().into()));
        for photo in photos {
            changes.record(photo.object_id, Change::Inserted(photo.clone().into()));
        }
        changes
    }

    #[test]
    fn commit_then_load_round_trip() {
        let mut store = SqliteStore::open_in_memory(model()).unwrap();
        let (pin, mut photos) = pin_with_photos(3);
        photos[1].image = Some(Arc::from(vec![0xFFu8, 0xD8, 0xFF]));
        store.commit(&inserts(&pin, &photos)).unwrap();

        let graph = store.load().unwrap();
        assert_eq!(graph.pin(pin.object_id), Some(&pin));
        for photo in &photos {
            assert_eq!(graph.photo(photo.object_id), Some(photo));
        }
    }

    #[test]
    fn pin_delete_cascades_in_the_store() {
        let mut store = SqliteStore::open_in_memory(model()).unwrap();
        let (pin, photos) = pin_with_photos(4);
        store.commit(&inserts(&pin, &photos)).unwrap();
        assert_eq!(store.count(EntityKind::Photo).unwrap(), 4);

        let mut removal = ChangeSet::new();
        removal.record(pin.object_id, Change::Deleted(EntityKind::Pin));
        store.commit(&removal).unwrap();
        assert_eq!(store.count(EntityKind::Pin).unwrap(), 0);
        assert_eq!(store.count(EntityKind::Photo).unwrap(), 0);
    }

    #[test]
    fn updating_a_pin_keeps_its_photos() {
        let mut store = SqliteStore::open_in_memory(model()).unwrap();
        let (mut pin, photos) = pin_with_photos(2);
        store.commit(&inserts(&pin, &photos)).unwrap();

        pin.latitude = 10.0;
        let mut update = ChangeSet::new();
        update.record(pin.object_id, Change::Updated(pin.clone().into()));
        store.commit(&update).unwrap();

        assert_eq!(store.count(EntityKind::Photo).unwrap(), 2);
        assert_eq!(store.load().unwrap().pin(pin.object_id).unwrap().latitude, 10.0);
    }

    #[test]
    fn photo_without_pin_is_rejected() {
        let mut store = SqliteStore::open_in_memory(model()).unwrap();
        let (pin, photos) = pin_with_photos(1);
        let mut changes = ChangeSet::new();
        changes.record(photos[0].object_id, Change::Inserted(photos[0].clone().into()));
        assert!(store.commit(&changes).is_err());
        assert!(store.load().unwrap().pin(pin.object_id).is_none());
        assert_eq!(store.count(EntityKind::Photo).unwrap(), 0);
    }

    #[test]
    fn reopen_and_destroy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.sqlite");
        let (pin, photos) = pin_with_photos(2);
        {
            let mut store = SqliteStore::open(&path, model()).unwrap();
            store.commit(&inserts(&pin, &photos)).unwrap();
        }

        let mut store = SqliteStore::open(&path, model()).unwrap();
        assert_eq!(store.load().unwrap().len(), 3);

        store.destroy_and_recreate().unwrap();
        assert!(path.exists());
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn blocked_destroy_keeps_the_store_usable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.sqlite");
        let (pin, photos) = pin_with_photos(2);
        let mut store = SqliteStore::open(&path, model()).unwrap();
        store.commit(&inserts(&pin, &photos)).unwrap();

        let shm = dir.path().join("model.sqlite-shm");
        let _ = std::fs::remove_file(&shm);
        std::fs::create_dir(&shm).unwrap();
        std::fs::write(shm.join("keep"), b"x").unwrap();

        assert!(matches!(
            store.destroy_and_recreate(),
            Err(StackError::Storage(_))
        ));
        assert!(path.exists());
        assert_eq!(store.load().unwrap().len(), 3);

        let (other, _) = pin_with_photos(0);
        store.commit(&inserts(&other, &[])).unwrap();
        assert_eq!(store.count(EntityKind::Pin).unwrap(), 2);
    }

    #[test]
    fn newer_store_refuses_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.sqlite");
        drop(SqliteStore::open(&path, model()).unwrap());
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute("INSERT INTO schema_version (version) VALUES (99)", [])
                .unwrap();
        }
        assert!(matches!(
            SqliteStore::open(&path, model()),
            Err(StackError::StoreOpen { .. })
        ));
    }

    #[test]
    fn garbage_file_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.sqlite");
        std::fs::write(&path, vec![0x42u8; 4096]).unwrap();
        assert!(matches!(
            SqliteStore::open(&path, model()),
            Err(StackError::StoreOpen { .. })
        ));
    }
}
