//! rollcall-store — Local persistence for Rollcall.
//!
//! One SQLite file holds both the key-value namespaces ([`kv`]) and the
//! face-id/person table ([`people`]). The synchronous functions in those
//! modules take a `rusqlite::Connection`; [`Store`] runs them on the single
//! `tokio-rusqlite` connection thread, so every writer in the process is
//! serialized through one queue.

pub mod kv;
pub mod migrations;
pub mod people;

pub use kv::{KvValue, Namespace};
pub use people::{Person, PersonUpdate};

use rollcall_core::{FaceId, Role};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store connection: {0}")]
    Connection(#[from] tokio_rusqlite::Error),
    #[error("malformed JSON in {namespace}/{key}: {source}")]
    MalformedJson {
        namespace: &'static str,
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode value: {0}")]
    Encode(serde_json::Error),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("failed to create data directory: {0}")]
    Io(#[from] std::io::Error),
}

/// Async handle to the store. Cheap to clone; all clones share one
/// connection thread.
#[derive(Clone)]
pub struct Store {
    conn: tokio_rusqlite::Connection,
}

impl Store {
    /// Open (creating if needed) the database file and apply migrations.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = tokio_rusqlite::Connection::open(path).await?;
        let store = Self { conn };
        store.run(migrations::migrate).await?;
        tracing::info!(path = %path.display(), "store opened");
        Ok(store)
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = tokio_rusqlite::Connection::open_in_memory().await?;
        let store = Self { conn };
        store.run(migrations::migrate).await?;
        Ok(store)
    }

    /// Run `f` on the connection thread.
    async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        self.conn
            .call(move |conn| Ok::<_, tokio_rusqlite::Error>(f(conn)))
            .await?
    }

    // --- key-value namespaces ---

    pub async fn kv_get(&self, ns: Namespace, key: &str) -> Result<Option<KvValue>, StoreError> {
        let key = key.to_string();
        self.run(move |c| kv::get(c, ns, &key)).await
    }

    pub async fn kv_set(&self, ns: Namespace, key: &str, value: KvValue) -> Result<(), StoreError> {
        let key = key.to_string();
        self.run(move |c| kv::set(c, ns, &key, &value)).await
    }

    pub async fn kv_delete(&self, ns: Namespace, key: &str) -> Result<(), StoreError> {
        let key = key.to_string();
        self.run(move |c| kv::delete(c, ns, &key)).await
    }

    pub async fn kv_list_keys(&self, ns: Namespace) -> Result<Vec<String>, StoreError> {
        self.run(move |c| kv::list_keys(c, ns)).await
    }

    pub async fn get_json<T>(&self, ns: Namespace, key: &str) -> Result<Option<T>, StoreError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let key = key.to_string();
        self.run(move |c| kv::get_json(c, ns, &key)).await
    }

    pub async fn set_json<T>(&self, ns: Namespace, key: &str, value: &T) -> Result<(), StoreError>
    where
        T: Serialize + ?Sized,
    {
        let text = serde_json::to_string(value).map_err(StoreError::Encode)?;
        self.kv_set(ns, key, KvValue::Text(text)).await
    }

    /// Roster version (DTVER) for a role; 0 when never synced.
    pub async fn roster_version(&self, role: Role) -> Result<i64, StoreError> {
        Ok(self
            .kv_get(Namespace::FaceVersion, role.as_str())
            .await?
            .and_then(|v| v.as_i64())
            .unwrap_or(0))
    }

    pub async fn set_roster_version(&self, role: Role, version: i64) -> Result<(), StoreError> {
        self.kv_set(Namespace::FaceVersion, role.as_str(), KvValue::from(version))
            .await
    }

    // --- people ---

    pub async fn upsert_person(&self, person: Person) -> Result<(), StoreError> {
        self.run(move |c| people::upsert_person(c, &person)).await
    }

    pub async fn update_person_by_face_id(
        &self,
        face_id: FaceId,
        update: PersonUpdate,
    ) -> Result<usize, StoreError> {
        self.run(move |c| people::update_person_by_face_id(c, face_id, &update))
            .await
    }

    pub async fn get_by_face_id(&self, face_id: FaceId) -> Result<Option<Person>, StoreError> {
        self.run(move |c| people::get_by_face_id(c, face_id)).await
    }

    pub async fn query_by_external_id(
        &self,
        external_id: &str,
        role: Role,
    ) -> Result<Option<Person>, StoreError> {
        let external_id = external_id.to_string();
        self.run(move |c| people::query_by_external_id(c, &external_id, role))
            .await
    }

    pub async fn query_by_org_id(&self, org_id: &str) -> Result<Vec<Person>, StoreError> {
        let org_id = org_id.to_string();
        self.run(move |c| people::query_by_org_id(c, &org_id)).await
    }

    pub async fn query_by_role(&self, role: Role) -> Result<Vec<Person>, StoreError> {
        self.run(move |c| people::query_by_role(c, role)).await
    }

    pub async fn count_by_role(&self, role: Role) -> Result<i64, StoreError> {
        self.run(move |c| people::count_by_role(c, role)).await
    }

    pub async fn list_all(&self) -> Result<Vec<Person>, StoreError> {
        self.run(|c| people::list_all(c)).await
    }

    pub async fn delete_by_face_id(&self, face_id: FaceId) -> Result<usize, StoreError> {
        self.run(move |c| people::delete_by_face_id(c, face_id)).await
    }

    pub async fn delete_by_org_id(&self, org_id: &str) -> Result<usize, StoreError> {
        let org_id = org_id.to_string();
        self.run(move |c| people::delete_by_org_id(c, &org_id)).await
    }

    pub async fn record_mapping(&self, person: Person) -> Result<(), StoreError> {
        self.run(move |c| people::record_mapping(c, &person)).await
    }

    pub async fn forget_mapping(&self, face_id: FaceId) -> Result<Option<Person>, StoreError> {
        self.run(move |c| people::forget_mapping(c, face_id)).await
    }
}
