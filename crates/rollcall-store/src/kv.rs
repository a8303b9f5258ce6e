//! Named key-value namespaces.
//!
//! Plain CRUD over text/number/bool values. Structured values are JSON text
//! encoded by the caller; [`get_json`] and [`set_json`] are the caller-side
//! helpers for that.

use crate::StoreError;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;

/// The persisted namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// Last login phone number and "remember me" flag.
    Login,
    /// The authenticated account record (JSON).
    CurrentUser,
    /// Recognition parameters (JSON).
    RecognitionParams,
    /// Roster versions (DTVER), one key per role.
    FaceVersion,
    /// `"{external_id}_{role}"` → face id.
    FaceMapping,
}

impl Namespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Login => "login",
            Namespace::CurrentUser => "current_user",
            Namespace::RecognitionParams => "recognition_params",
            Namespace::FaceVersion => "face_version",
            Namespace::FaceMapping => "face_mapping",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum KvValue {
    Text(String),
    Number(f64),
    Bool(bool),
}

impl KvValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            KvValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Numbers, and text that parses as a number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            KvValue::Number(n) => Some(*n),
            KvValue::Text(s) => s.trim().parse().ok(),
            KvValue::Bool(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.as_f64().filter(|n| n.fract() == 0.0).map(|n| n as i64)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            KvValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    fn encode(&self) -> (&'static str, String) {
        match self {
            KvValue::Text(s) => ("text", s.clone()),
            KvValue::Number(n) => ("number", n.to_string()),
            KvValue::Bool(b) => ("bool", b.to_string()),
        }
    }

    fn decode(kind: &str, raw: String) -> KvValue {
        match kind {
            "number" => raw.parse().map(KvValue::Number).unwrap_or(KvValue::Text(raw)),
            "bool" => KvValue::Bool(raw == "true"),
            _ => KvValue::Text(raw),
        }
    }
}

impl From<&str> for KvValue {
    fn from(s: &str) -> Self {
        KvValue::Text(s.to_string())
    }
}

impl From<String> for KvValue {
    fn from(s: String) -> Self {
        KvValue::Text(s)
    }
}

impl From<i64> for KvValue {
    fn from(n: i64) -> Self {
        KvValue::Number(n as f64)
    }
}

impl From<f64> for KvValue {
    fn from(n: f64) -> Self {
        KvValue::Number(n)
    }
}

impl From<bool> for KvValue {
    fn from(b: bool) -> Self {
        KvValue::Bool(b)
    }
}

pub fn get(conn: &Connection, ns: Namespace, key: &str) -> Result<Option<KvValue>, StoreError> {
    let row = conn
        .query_row(
            "SELECT kind, value FROM kv_entries WHERE namespace = ?1 AND key = ?2",
            params![ns.as_str(), key],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
        )
        .optional()?;
    Ok(row.map(|(kind, raw)| KvValue::decode(&kind, raw)))
}

pub fn set(conn: &Connection, ns: Namespace, key: &str, value: &KvValue) -> Result<(), StoreError> {
    let (kind, raw) = value.encode();
    conn.execute(
        "INSERT INTO kv_entries (namespace, key, kind, value) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (namespace, key) DO UPDATE SET kind = excluded.kind, value = excluded.value",
        params![ns.as_str(), key, kind, raw],
    )?;
    Ok(())
}

pub fn delete(conn: &Connection, ns: Namespace, key: &str) -> Result<(), StoreError> {
    conn.execute(
        "DELETE FROM kv_entries WHERE namespace = ?1 AND key = ?2",
        params![ns.as_str(), key],
    )?;
    Ok(())
}

pub fn list_keys(conn: &Connection, ns: Namespace) -> Result<Vec<String>, StoreError> {
    let mut stmt = conn.prepare("SELECT key FROM kv_entries WHERE namespace = ?1 ORDER BY key")?;
    let keys = stmt
        .query_map([ns.as_str()], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(keys)
}

/// Read a JSON-encoded text value.
pub fn get_json<T: DeserializeOwned>(
    conn: &Connection,
    ns: Namespace,
    key: &str,
) -> Result<Option<T>, StoreError> {
    let Some(value) = get(conn, ns, key)? else {
        return Ok(None);
    };
    let text = match value {
        KvValue::Text(s) => s,
        other => other.encode().1,
    };
    serde_json::from_str(&text)
        .map(Some)
        .map_err(|source| StoreError::MalformedJson {
            namespace: ns.as_str(),
            key: key.to_string(),
            source,
        })
}

pub fn set_json<T: Serialize + ?Sized>(
    conn: &Connection,
    ns: Namespace,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    let text = serde_json::to_string(value).map_err(StoreError::Encode)?;
    set(conn, ns, key, &KvValue::Text(text))
}
