//! Client helpers shared by the daemon's tests.

use rollcall_api::{ApiClient, ApiConfig, CurrentUser, Row, SessionCell};

pub use rollcall_testkit::{serve, serve_with, StubResponse};

pub fn api_client(url: &str) -> ApiClient {
    ApiClient::new(ApiConfig::new(url, "attendance"), SessionCell::new()).unwrap()
}

/// A client whose session already carries a token for org `c1`.
pub fn logged_in_client(url: &str) -> ApiClient {
    let client = api_client(url);
    let row = Row::from_value(serde_json::json!({
        "token": "tok",
        "user_id": "u1",
        "org_id": "c1",
        "org_name": "North"
    }))
    .unwrap();
    client.session().set(CurrentUser::from_row(&row));
    client
}
