//! The authenticated account and the shared cell the client reads it from.

use crate::client::Row;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};

/// The account record returned by login, cached for every later call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentUser {
    pub token: String,
    pub user_id: String,
    pub name: String,
    pub phone: String,
    pub org_id: String,
    pub org_name: String,
    /// The full login row, for procedure-specific columns.
    #[serde(default)]
    pub raw: serde_json::Map<String, serde_json::Value>,
}

impl CurrentUser {
    /// Build from a login result row. Column names vary between deployments,
    /// so a few aliases are accepted.
    pub fn from_row(row: &Row) -> Self {
        let pick = |names: &[&str]| {
            names
                .iter()
                .find_map(|n| row.text(n))
                .unwrap_or_default()
        };
        Self {
            token: pick(&["token", "o_token"]),
            user_id: pick(&["user_id", "userid", "id"]),
            name: pick(&["user_name", "name"]),
            phone: pick(&["phone", "mobile"]),
            org_id: pick(&["org_id", "orgid"]),
            org_name: pick(&["org_name", "orgname"]),
            raw: row.as_map().clone(),
        }
    }
}

/// Shared, explicitly passed session state. The client reads the token from
/// here; the login flow writes it.
#[derive(Debug, Clone, Default)]
pub struct SessionCell {
    inner: Arc<RwLock<Option<CurrentUser>>>,
}

impl SessionCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, user: CurrentUser) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        *guard = Some(user);
    }

    pub fn current(&self) -> Option<CurrentUser> {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn token(&self) -> Option<String> {
        self.current().map(|u| u.token).filter(|t| !t.is_empty())
    }

    pub fn is_authenticated(&self) -> bool {
        self.token().is_some()
    }
}
