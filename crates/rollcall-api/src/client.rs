//! Stored-procedure API client.
//!
//! Every call is a form-encoded POST to `{base_url}?func={api_name}` carrying
//! a `procedure` field. Responses are a JSON envelope whose `data` object
//! holds positional result sets (`#result-set-1`, `#result-set-2`, ...).

use std::collections::BTreeMap;

use bytes::Bytes;
use reqwest::Client;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::config::ApiConfig;
use crate::error::ApiError;
use crate::session::SessionCell;

const TOKEN_FIELD: &str = "token";
const RESULT_SET_PREFIX: &str = "#result-set-";

/// Form parameters for one procedure call, in insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params {
    pairs: Vec<(String, String)>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(mut self, name: &str, value: impl Into<String>) -> Self {
        self.pairs.push((name.to_string(), value.into()));
        self
    }

    pub fn number(mut self, name: &str, value: impl Into<f64>) -> Self {
        let value: f64 = value.into();
        let rendered = if value.fract() == 0.0 && value.abs() < 1e15 {
            format!("{}", value as i64)
        } else {
            value.to_string()
        };
        self.pairs.push((name.to_string(), rendered));
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }
}

/// One result-set row.
#[derive(Debug, Clone, PartialEq)]
pub struct Row(Map<String, Value>);

impl Row {
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Row(map)),
            _ => None,
        }
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    /// Column as text. Numbers and booleans are rendered; null and missing are `None`.
    pub fn text(&self, column: &str) -> Option<String> {
        match self.0.get(column)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Column as an integer. Numeric strings are accepted.
    pub fn int(&self, column: &str) -> Option<i64> {
        match self.0.get(column)? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Column as a float. Numeric strings are accepted.
    pub fn float(&self, column: &str) -> Option<f64> {
        match self.0.get(column)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Column as a flag: `true`, non-zero numbers, and `"1"`/`"true"`/`"y"`.
    pub fn flag(&self, column: &str) -> Option<bool> {
        match self.0.get(column)? {
            Value::Bool(b) => Some(*b),
            Value::Number(n) => n.as_f64().map(|f| f != 0.0),
            Value::String(s) => Some(matches!(
                s.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "y" | "yes"
            )),
            _ => None,
        }
    }
}

/// The positional result sets of one response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSets {
    sets: BTreeMap<usize, Vec<Row>>,
}

impl ResultSets {
    /// Parse a response body. Fails unless it is JSON with a `data` object.
    pub fn parse(body: &[u8]) -> Result<Self, ApiError> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| ApiError::MalformedBody(format!("invalid JSON: {e}")))?;
        let data = value
            .get("data")
            .and_then(Value::as_object)
            .ok_or_else(|| ApiError::MalformedBody("missing `data` object".into()))?;

        let mut sets = BTreeMap::new();
        for (key, rows) in data {
            let Some(index) = key
                .strip_prefix(RESULT_SET_PREFIX)
                .and_then(|n| n.parse::<usize>().ok())
            else {
                debug!(key, "ignoring non result-set key");
                continue;
            };
            let rows = match rows {
                Value::Array(items) => items.iter().cloned().filter_map(Row::from_value).collect(),
                Value::Null => Vec::new(),
                other => {
                    return Err(ApiError::MalformedBody(format!(
                        "{key} is not an array: {other}"
                    )))
                }
            };
            sets.insert(index, rows);
        }
        Ok(Self { sets })
    }

    /// Result set `n` (1-based). Missing sets are empty.
    pub fn set(&self, n: usize) -> &[Row] {
        self.sets.get(&n).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn has_set(&self, n: usize) -> bool {
        self.sets.contains_key(&n)
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}

/// Client for the stored-procedure API.
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    config: ApiConfig,
    session: SessionCell,
}

impl ApiClient {
    pub fn new(config: ApiConfig, session: SessionCell) -> Result<Self, ApiError> {
        if config.base_url.trim().is_empty() {
            return Err(ApiError::Config("base_url is empty".into()));
        }
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(ApiError::Http)?;
        Ok(Self {
            http,
            config,
            session,
        })
    }

    pub fn session(&self) -> &SessionCell {
        &self.session
    }

    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    /// Call an authenticated procedure.
    ///
    /// The session token is attached unless `params` already carries one;
    /// without either the call fails with [`ApiError::NotAuthenticated`].
    pub async fn call(&self, procedure: &str, params: Params) -> Result<ResultSets, ApiError> {
        let params = self.authorize(params)?;
        self.post(procedure, params).await
    }

    /// Call a procedure that needs no session, such as login.
    pub async fn call_public(
        &self,
        procedure: &str,
        params: Params,
    ) -> Result<ResultSets, ApiError> {
        self.post(procedure, params).await
    }

    /// Fetch a binary resource, e.g. a roster photo.
    pub async fn download(&self, url: &str) -> Result<Bytes, ApiError> {
        let resp = self.http.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp.bytes().await?)
    }

    fn authorize(&self, params: Params) -> Result<Params, ApiError> {
        if params.contains(TOKEN_FIELD) {
            return Ok(params);
        }
        let token = self.session.token().ok_or(ApiError::NotAuthenticated)?;
        Ok(params.text(TOKEN_FIELD, token))
    }

    async fn post(&self, procedure: &str, params: Params) -> Result<ResultSets, ApiError> {
        let mut form = Vec::with_capacity(params.pairs.len() + 1);
        form.push(("procedure".to_string(), procedure.to_string()));
        form.extend(params.pairs);

        debug!(procedure, url = %self.config.base_url, "calling procedure");
        let resp = self
            .http
            .post(&self.config.base_url)
            .query(&[("func", self.config.api_name.as_str())])
            .form(&form)
            .send()
            .await?;

        let status = resp.status();
        let body = resp.bytes().await?;
        if !status.is_success() {
            warn!(procedure, status = status.as_u16(), "procedure call failed");
            return Err(ApiError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        ResultSets::parse(&body)
    }
}
