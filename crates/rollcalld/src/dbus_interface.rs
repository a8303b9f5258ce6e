use std::sync::Arc;

use rollcall_api::CurrentUser;
use rollcall_core::Role;
use serde::Serialize;
use zbus::interface;

use crate::app::App;
use crate::registration::PhotoRegistration;
use crate::settings::ParamsPatch;

/// D-Bus interface for the Rollcall attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
///
/// Structured values are passed as JSON strings.
pub struct AttendanceService {
    app: Arc<App>,
}

impl AttendanceService {
    pub fn new(app: Arc<App>) -> Self {
        Self { app }
    }
}

fn failed(e: impl std::fmt::Display) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

fn to_json<T: Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(failed)
}

fn from_json<T: serde::de::DeserializeOwned>(what: &str, json: &str) -> zbus::fdo::Result<T> {
    serde_json::from_str(json)
        .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("invalid {what}: {e}")))
}

/// Empty string means "all roles".
fn parse_role(role: &str) -> zbus::fdo::Result<Option<Role>> {
    if role.trim().is_empty() {
        return Ok(None);
    }
    role.parse()
        .map(Some)
        .map_err(|e: rollcall_core::UnknownRole| zbus::fdo::Error::InvalidArgs(e.to_string()))
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceService {
    /// Log in with phone number and password. Returns the login outcome.
    async fn login(
        &self,
        phone: &str,
        password: &str,
        remember: bool,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(phone, "login requested");
        let outcome = self
            .app
            .login(phone, password, remember)
            .await
            .map_err(failed)?;
        to_json(&outcome)
    }

    /// Phone number of the last login made with `remember`, or "".
    async fn remembered_phone(&self) -> zbus::fdo::Result<String> {
        let phone = self.app.login.remembered_phone().await.map_err(failed)?;
        Ok(phone.unwrap_or_default())
    }

    /// Pick one of the accounts offered by a multi-account login.
    async fn select_account(&self, account: &str) -> zbus::fdo::Result<bool> {
        let user: CurrentUser = from_json("account", account)?;
        self.app.select_account(user).await.map_err(failed)?;
        Ok(true)
    }

    async fn get_settings(&self) -> zbus::fdo::Result<String> {
        to_json(&self.app.settings.get())
    }

    /// Apply a partial update, e.g. `{"similarity_threshold": 75}`.
    async fn update_settings(&self, patch: &str) -> zbus::fdo::Result<String> {
        let patch: ParamsPatch = from_json("settings patch", patch)?;
        let params = self.app.settings.update(patch).await.map_err(failed)?;
        to_json(&params)
    }

    /// Sync a role ("teacher", "student", or "" for both) of an organisation
    /// ("" for the default). Returns one report per role.
    async fn sync(&self, role: &str, org_id: &str) -> zbus::fdo::Result<String> {
        let role = parse_role(role)?;
        let org_id = Some(org_id).filter(|o| !o.trim().is_empty());
        tracing::info!(?role, org_id, "sync requested");
        let reports = self.app.sync(role, org_id).await.map_err(failed)?;
        to_json(&reports)
    }

    /// Register one photo. `person` carries name, role and optional ids.
    async fn register_photo(&self, person: &str, photo: Vec<u8>) -> zbus::fdo::Result<String> {
        let request: PhotoRegistration = from_json("person", person)?;
        tracing::info!(
            name = %request.name,
            role = %request.role,
            bytes = photo.len(),
            "register_photo requested"
        );
        let person = self
            .app
            .registration
            .register_photo(request, &photo)
            .await
            .map_err(failed)?;
        to_json(&person)
    }

    async fn recognize_photo(&self, photo: Vec<u8>) -> zbus::fdo::Result<String> {
        let params = self.app.settings.get();
        let result = self
            .app
            .recognition
            .recognize_photo(&photo, &params)
            .await
            .map_err(failed)?;
        to_json(&result)
    }

    /// Remove a person by face id. Returns false if no mapping existed.
    async fn remove_person(&self, face_id: i64) -> zbus::fdo::Result<bool> {
        tracing::info!(face_id, "remove_person requested");
        let removed = self
            .app
            .registration
            .remove_person(face_id)
            .await
            .map_err(failed)?;
        Ok(removed.is_some())
    }

    async fn list_people(&self, role: &str) -> zbus::fdo::Result<String> {
        let role = parse_role(role)?;
        let people = self.app.list_people(role).await.map_err(failed)?;
        to_json(&people)
    }

    async fn start_recognition(&self) -> zbus::fdo::Result<bool> {
        self.app.start_recognition().await.map_err(failed)?;
        Ok(true)
    }

    /// Returns false if recognition was not running.
    async fn stop_recognition(&self) -> zbus::fdo::Result<bool> {
        Ok(self.app.recognition.stop().await)
    }

    async fn last_result(&self) -> zbus::fdo::Result<String> {
        to_json(&self.app.recognition.last_result())
    }

    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.app.status().await.map_err(failed)?;
        Ok(status.to_string())
    }
}
