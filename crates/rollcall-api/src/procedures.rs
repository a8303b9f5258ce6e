//! Typed wrappers for the stored procedures Rollcall calls.

use rollcall_core::{RecognitionParameters, Role};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::client::{ApiClient, Params, ResultSets, Row};
use crate::error::ApiError;
use crate::session::CurrentUser;

pub const LOGIN: &str = "p_app_login";
pub const FACE_CONFIG: &str = "p_face_config";
pub const ROSTER_DIFF: &str = "p_face_roster_diff";

/// Rows returned by the login procedure (result set 1).
#[derive(Debug, Clone, Default)]
pub struct LoginRows {
    pub rows: Vec<Row>,
}

impl LoginRows {
    pub fn from_sets(sets: &ResultSets) -> Self {
        Self {
            rows: sets.set(1).to_vec(),
        }
    }

    /// `o_issuc == "0"` on the first row marks a rejected login.
    pub fn is_rejected(&self) -> bool {
        match self.rows.first() {
            None => true,
            Some(row) => row.text("o_issuc").is_some_and(|v| v.trim() == "0"),
        }
    }

    /// Server-supplied message, if any.
    pub fn message(&self) -> Option<String> {
        self.rows
            .first()
            .and_then(|r| r.text("o_msg"))
            .filter(|m| !m.is_empty())
    }

    pub fn accounts(&self) -> Vec<CurrentUser> {
        self.rows.iter().map(CurrentUser::from_row).collect()
    }
}

/// One person to (re)register.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub person_id: String,
    pub name: String,
    pub photo_url: String,
    pub org_id: String,
    pub org_name: String,
}

impl RosterEntry {
    fn from_row(row: &Row) -> Option<Self> {
        let person_id = row.text("person_id").or_else(|| row.text("id"))?;
        Some(Self {
            person_id,
            name: row.text("name").unwrap_or_default(),
            photo_url: row
                .text("photo_url")
                .or_else(|| row.text("face_url"))
                .unwrap_or_default(),
            org_id: row.text("org_id").unwrap_or_default(),
            org_name: row.text("org_name").unwrap_or_default(),
        })
    }
}

/// Roster changes since a version.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RosterDiff {
    pub upserts: Vec<RosterEntry>,
    /// External ids removed upstream.
    pub removals: Vec<String>,
    /// The roster version this diff brings the caller to.
    pub version: i64,
}

impl RosterDiff {
    pub fn from_sets(sets: &ResultSets) -> Result<Self, ApiError> {
        let mut upserts = Vec::new();
        for row in sets.set(1) {
            match RosterEntry::from_row(row) {
                Some(entry) => upserts.push(entry),
                None => debug!("skipping roster row without person id"),
            }
        }
        let removals = sets
            .set(2)
            .iter()
            .filter_map(|r| r.text("person_id").or_else(|| r.text("id")))
            .collect();
        let version = sets
            .set(3)
            .first()
            .and_then(|r| r.int("dtver"))
            .ok_or_else(|| ApiError::Contract {
                procedure: ROSTER_DIFF.into(),
                detail: "result set 3 carries no dtver".into(),
            })?;
        Ok(Self {
            upserts,
            removals,
            version,
        })
    }
}

fn params_from_row(row: &Row) -> RecognitionParameters {
    let defaults = RecognitionParameters::default();
    RecognitionParameters {
        use_front_camera: row.flag("use_front_camera").unwrap_or(defaults.use_front_camera),
        liveness_enabled: row.flag("liveness").unwrap_or(defaults.liveness_enabled),
        similarity_threshold: row
            .float("similarity")
            .map(|v| v as f32)
            .unwrap_or(defaults.similarity_threshold),
        quality_threshold: row
            .float("quality")
            .map(|v| v as f32)
            .unwrap_or(defaults.quality_threshold),
        preview_resolution: row
            .text("resolution")
            .filter(|r| !r.is_empty())
            .unwrap_or(defaults.preview_resolution),
    }
}

impl ApiClient {
    pub async fn login(&self, phone: &str, password: &str) -> Result<LoginRows, ApiError> {
        let sets = self
            .call_public(LOGIN, Params::new().text("phone", phone).text("password", password))
            .await?;
        let rows = LoginRows::from_sets(&sets);
        info!(rows = rows.rows.len(), "login procedure answered");
        Ok(rows)
    }

    /// Recognition parameters configured server-side, if any.
    pub async fn fetch_remote_params(&self) -> Result<Option<RecognitionParameters>, ApiError> {
        let sets = self.call(FACE_CONFIG, Params::new()).await?;
        Ok(sets.set(1).first().map(params_from_row))
    }

    pub async fn fetch_roster_diff(
        &self,
        org_id: &str,
        role: Role,
        version: i64,
    ) -> Result<RosterDiff, ApiError> {
        let sets = self
            .call(
                ROSTER_DIFF,
                Params::new()
                    .text("org_id", org_id)
                    .text("role", role.as_str())
                    .number("dtver", version as f64),
            )
            .await?;
        let diff = RosterDiff::from_sets(&sets)?;
        info!(
            %role,
            from = version,
            to = diff.version,
            upserts = diff.upserts.len(),
            removals = diff.removals.len(),
            "roster diff fetched"
        );
        Ok(diff)
    }
}
