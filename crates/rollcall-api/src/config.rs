//! Configuration for the remote API client.

use std::time::Duration;

/// Where the stored-procedure API lives.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Endpoint URL, e.g. "https://api.example.com/service".
    pub base_url: String,
    /// Value of the `func` query parameter selecting the API.
    pub api_name: String,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl ApiConfig {
    pub fn new(base_url: impl Into<String>, api_name: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_name: api_name.into(),
            timeout: Duration::from_secs(15),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self::new("http://localhost:8080/api", "attendance")
    }
}
