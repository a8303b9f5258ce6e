//! Registration sync: bring the hub and the mapping table in line with the
//! remote roster of one role.

use std::sync::Arc;

use rollcall_api::{ApiClient, ApiError, RosterEntry};
use rollcall_core::Role;
use rollcall_store::{Person, PersonUpdate, Store, StoreError};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::registration::{photo_digest, RegistrationError, RegistrationService};

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("a sync is already running")]
    AlreadyRunning,
    #[error("no organisation to sync: log in or set ROLLCALL_ORG_ID")]
    NoOrganisation,
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Complete,
    PartialFailure,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub run_id: String,
    pub role: Role,
    pub org_id: String,
    pub from_version: i64,
    pub to_version: i64,
    /// Whether `to_version` was persisted. Only clean runs advance the version.
    pub version_stored: bool,
    pub registered: usize,
    pub updated: usize,
    pub removed: usize,
    pub failures: usize,
    pub log: Vec<String>,
    pub status: SyncStatus,
}

impl SyncReport {
    fn fail(&mut self, who: &str, what: impl std::fmt::Display) {
        self.failures += 1;
        let line = format!("{who}: {what}");
        tracing::warn!(run = %self.run_id, role = %self.role, "{line}");
        self.log.push(line);
    }

    fn note(&mut self, line: String) {
        tracing::debug!(run = %self.run_id, role = %self.role, "{line}");
        self.log.push(line);
    }
}

enum Change {
    Registered,
    Updated,
}

#[derive(Clone)]
pub struct SyncService {
    api: ApiClient,
    store: Store,
    registration: RegistrationService,
    running: Arc<Mutex<()>>,
}

impl SyncService {
    pub fn new(api: ApiClient, store: Store, registration: RegistrationService) -> Self {
        Self {
            api,
            store,
            registration,
            running: Arc::new(Mutex::new(())),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.try_lock().is_err()
    }

    /// Sync one role of one organisation.
    ///
    /// Per-person failures are counted and logged; the batch carries on and
    /// nothing already done is rolled back. Version 0 means a full resync.
    pub async fn sync(&self, role: Role, org_id: &str) -> Result<SyncReport, SyncError> {
        let _guard = self
            .running
            .try_lock()
            .map_err(|_| SyncError::AlreadyRunning)?;

        let run_id = uuid::Uuid::new_v4().to_string();
        let from_version = self.store.roster_version(role).await?;
        tracing::info!(run = %run_id, %role, org_id, from_version, "sync started");

        let diff = self.api.fetch_roster_diff(org_id, role, from_version).await?;
        let mut report = SyncReport {
            run_id,
            role,
            org_id: org_id.to_string(),
            from_version,
            to_version: diff.version,
            version_stored: false,
            registered: 0,
            updated: 0,
            removed: 0,
            failures: 0,
            log: Vec::new(),
            status: SyncStatus::Complete,
        };

        if from_version == 0 {
            self.clear_role(&mut report).await?;
        }

        for external_id in &diff.removals {
            let Some(person) = self.store.query_by_external_id(external_id, role).await? else {
                continue;
            };
            match self.registration.remove_person(person.face_id).await {
                Ok(_) => {
                    report.removed += 1;
                    report.note(format!("{external_id}: removed"));
                }
                Err(e) => report.fail(external_id, e),
            }
        }

        for entry in &diff.upserts {
            match self.sync_person(role, entry).await {
                Ok(Change::Registered) => {
                    report.registered += 1;
                    report.note(format!("{}: registered", entry.person_id));
                }
                Ok(Change::Updated) => {
                    report.updated += 1;
                    report.note(format!("{}: metadata updated", entry.person_id));
                }
                Err(e) => report.fail(&format!("{} ({})", entry.person_id, entry.name), e),
            }
        }

        if report.failures == 0 {
            self.store.set_roster_version(role, diff.version).await?;
            report.version_stored = true;
        } else {
            report.status = SyncStatus::PartialFailure;
        }

        tracing::info!(
            run = %report.run_id,
            %role,
            registered = report.registered,
            updated = report.updated,
            removed = report.removed,
            failures = report.failures,
            to_version = report.to_version,
            "sync finished"
        );
        Ok(report)
    }

    /// Remove every mapping of the role. Rows whose hub removal fails stay.
    async fn clear_role(&self, report: &mut SyncReport) -> Result<(), SyncError> {
        let people = self.store.query_by_role(report.role).await?;
        tracing::info!(
            run = %report.run_id,
            role = %report.role,
            count = people.len(),
            "full resync: clearing role"
        );
        for person in people {
            match self.registration.remove_person(person.face_id).await {
                Ok(_) => report.removed += 1,
                Err(e) => report.fail(&person.external_id, format!("not cleared: {e}")),
            }
        }
        Ok(())
    }

    async fn sync_person(
        &self,
        role: Role,
        entry: &RosterEntry,
    ) -> Result<Change, SyncPersonError> {
        if entry.photo_url.trim().is_empty() {
            return Err(SyncPersonError::NoPhoto);
        }
        let existing = self.store.query_by_external_id(&entry.person_id, role).await?;
        let photo = self.api.download(&entry.photo_url).await?;
        let digest = photo_digest(&photo);

        if let Some(current) = &existing {
            if current.photo_digest.as_deref() == Some(digest.as_str()) {
                self.store
                    .update_person_by_face_id(
                        current.face_id,
                        PersonUpdate {
                            display_name: Some(entry.name.clone()),
                            org_id: Some(entry.org_id.clone()),
                            org_name: Some(entry.org_name.clone()),
                            source_image_url: Some(entry.photo_url.clone()),
                            photo_digest: None,
                        },
                    )
                    .await?;
                return Ok(Change::Updated);
            }
        }

        let image = rollcall_frame::frame::decode(&photo).map_err(RegistrationError::from)?;
        let person = Person {
            face_id: 0,
            external_id: entry.person_id.clone(),
            display_name: entry.name.clone(),
            role,
            org_id: entry.org_id.clone(),
            org_name: entry.org_name.clone(),
            source_image_url: entry.photo_url.clone(),
            photo_digest: Some(digest),
            updated_at: String::new(),
        };
        self.registration.enroll(image, person).await?;
        Ok(Change::Registered)
    }
}

#[derive(Error, Debug)]
enum SyncPersonError {
    #[error("no photo URL")]
    NoPhoto,
    #[error("photo download failed: {0}")]
    Download(#[from] ApiError),
    #[error(transparent)]
    Registration(#[from] RegistrationError),
    #[error(transparent)]
    Store(#[from] StoreError),
}
