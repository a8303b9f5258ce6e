//! Turning a photo into a hub feature plus a local mapping row, and undoing it.

use std::sync::Arc;

use image::RgbImage;
use rollcall_core::{FaceId, HubOutcome, Role};
use rollcall_frame::FrameError;
use rollcall_store::{Person, Store, StoreError};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::engine::{EngineHandle, WorkerError};

#[derive(Error, Debug)]
pub enum RegistrationError {
    #[error("{0} must not be empty")]
    MissingField(&'static str),
    #[error("no face detected")]
    NoFaceDetected,
    #[error("cannot decode photo: {0}")]
    Decode(#[from] FrameError),
    #[error("feature hub refused: {0}")]
    Hub(String),
    #[error(transparent)]
    Worker(WorkerError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<WorkerError> for RegistrationError {
    fn from(e: WorkerError) -> Self {
        match e {
            WorkerError::NoFaceDetected => RegistrationError::NoFaceDetected,
            WorkerError::Hub(reason) => RegistrationError::Hub(reason),
            other => RegistrationError::Worker(other),
        }
    }
}

/// A photo submitted for registration outside the roster sync.
#[derive(Debug, Clone, Deserialize)]
pub struct PhotoRegistration {
    pub name: String,
    /// Generated when absent.
    #[serde(default)]
    pub external_id: Option<String>,
    pub role: Role,
    #[serde(default)]
    pub org_id: String,
    #[serde(default)]
    pub org_name: String,
    #[serde(default)]
    pub source_image_url: String,
}

/// Hex SHA-256 of an encoded photo.
pub fn photo_digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[derive(Clone)]
pub struct RegistrationService {
    engine: EngineHandle,
    store: Store,
    /// Held across every hub + table change so that two flows never
    /// interleave on the same person.
    writer: Arc<Mutex<()>>,
}

impl RegistrationService {
    pub fn new(engine: EngineHandle, store: Store) -> Self {
        Self {
            engine,
            store,
            writer: Arc::new(Mutex::new(())),
        }
    }

    /// Register one encoded photo. Nothing is written unless a face was
    /// found and inserted into the hub.
    pub async fn register_photo(
        &self,
        request: PhotoRegistration,
        photo: &[u8],
    ) -> Result<Person, RegistrationError> {
        let name = request.name.trim();
        if name.is_empty() {
            return Err(RegistrationError::MissingField("name"));
        }
        if photo.is_empty() {
            return Err(RegistrationError::MissingField("image"));
        }

        let image = rollcall_frame::frame::decode(photo)?;
        let external_id = request
            .external_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("local-{}", uuid::Uuid::new_v4()));

        let person = Person {
            face_id: 0,
            external_id,
            display_name: name.to_string(),
            role: request.role,
            org_id: request.org_id,
            org_name: request.org_name,
            source_image_url: request.source_image_url,
            photo_digest: Some(photo_digest(photo)),
            updated_at: String::new(),
        };
        self.enroll(image, person).await
    }

    /// Store `image`'s largest face in the hub and record `person` under
    /// its face id.
    ///
    /// A person already mapped under the same external id and role keeps
    /// their face id: the hub feature is replaced in place. If the hub has
    /// lost that face, a new one is inserted. A failed hub update leaves the
    /// old feature and mapping untouched.
    pub async fn enroll(
        &self,
        image: RgbImage,
        mut person: Person,
    ) -> Result<Person, RegistrationError> {
        let _writer = self.writer.lock().await;
        let previous = self
            .store
            .query_by_external_id(&person.external_id, person.role)
            .await?;

        let refreshed = match &previous {
            Some(old) => match self.engine.refresh(old.face_id, image.clone()).await? {
                HubOutcome::Ok(()) => Some(old.face_id),
                HubOutcome::NotFound => {
                    tracing::info!(face_id = old.face_id, "face missing from hub; inserting anew");
                    None
                }
                HubOutcome::Failed(reason) => {
                    tracing::warn!(face_id = old.face_id, %reason, "hub update failed");
                    return Err(RegistrationError::Hub(reason));
                }
            },
            None => None,
        };
        person.face_id = match refreshed {
            Some(face_id) => face_id,
            None => self.engine.register(image).await?,
        };

        // Replaces the previous row for this person, if any.
        self.store.record_mapping(person.clone()).await?;
        tracing::info!(
            face_id = person.face_id,
            external_id = %person.external_id,
            role = %person.role,
            refreshed = refreshed.is_some(),
            "person registered"
        );
        Ok(person)
    }

    /// Remove a face from the hub, then its mapping. A face the hub does not
    /// know is treated as removed; a failed hub call leaves the mapping.
    pub async fn remove_person(
        &self,
        face_id: FaceId,
    ) -> Result<Option<Person>, RegistrationError> {
        let _writer = self.writer.lock().await;
        match self.engine.remove(face_id).await? {
            HubOutcome::Ok(()) | HubOutcome::NotFound => {}
            HubOutcome::Failed(reason) => {
                tracing::warn!(face_id, %reason, "hub removal failed; mapping kept");
                return Err(RegistrationError::Hub(reason));
            }
        }
        let removed = self.store.forget_mapping(face_id).await?;
        tracing::info!(face_id, found = removed.is_some(), "person removed");
        Ok(removed)
    }
}
