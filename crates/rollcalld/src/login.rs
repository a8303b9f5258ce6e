//! Login flow: one procedure call, then account selection when the phone
//! number belongs to several organisations.

use rollcall_api::{ApiClient, ApiError, CurrentUser};
use rollcall_store::{KvValue, Namespace, Store, StoreError};
use serde::Serialize;
use thiserror::Error;

const USER_KEY: &str = "user";

#[derive(Error, Debug)]
pub enum LoginError {
    #[error("phone number and password are required")]
    MissingCredentials,
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LoginOutcome {
    Authenticated { user: CurrentUser },
    SelectAccount { accounts: Vec<CurrentUser> },
    Rejected { message: String },
}

#[derive(Clone)]
pub struct LoginService {
    api: ApiClient,
    store: Store,
}

impl LoginService {
    pub fn new(api: ApiClient, store: Store) -> Self {
        Self { api, store }
    }

    pub async fn login(
        &self,
        phone: &str,
        password: &str,
        remember: bool,
    ) -> Result<LoginOutcome, LoginError> {
        let phone = phone.trim();
        if phone.is_empty() || password.is_empty() {
            return Err(LoginError::MissingCredentials);
        }

        let rows = self.api.login(phone, password).await?;
        if rows.is_rejected() {
            let message = rows
                .message()
                .unwrap_or_else(|| "login rejected".to_string());
            tracing::info!(phone, %message, "login rejected");
            return Ok(LoginOutcome::Rejected { message });
        }

        self.store
            .kv_set(Namespace::Login, "phone", KvValue::from(phone))
            .await?;
        self.store
            .kv_set(Namespace::Login, "remember", KvValue::from(remember))
            .await?;

        let mut accounts = rows.accounts();
        if accounts.len() > 1 {
            tracing::info!(phone, accounts = accounts.len(), "account selection required");
            return Ok(LoginOutcome::SelectAccount { accounts });
        }
        let user = accounts.remove(0);
        self.select_account(user.clone()).await?;
        Ok(LoginOutcome::Authenticated { user })
    }

    /// Make `user` the current account and persist it.
    pub async fn select_account(&self, user: CurrentUser) -> Result<(), LoginError> {
        self.store
            .set_json(Namespace::CurrentUser, USER_KEY, &user)
            .await?;
        tracing::info!(user_id = %user.user_id, org_id = %user.org_id, "account selected");
        self.api.session().set(user);
        Ok(())
    }

    /// Load the persisted account into the session, if there is one.
    pub async fn restore(&self) -> Result<Option<CurrentUser>, LoginError> {
        let user: Option<CurrentUser> = self
            .store
            .get_json(Namespace::CurrentUser, USER_KEY)
            .await?;
        if let Some(user) = &user {
            tracing::info!(user_id = %user.user_id, "restored persisted session");
            self.api.session().set(user.clone());
        }
        Ok(user)
    }

    /// Last phone number, when the user asked to be remembered.
    pub async fn remembered_phone(&self) -> Result<Option<String>, LoginError> {
        let remember = self
            .store
            .kv_get(Namespace::Login, "remember")
            .await?
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if !remember {
            return Ok(None);
        }
        Ok(self
            .store
            .kv_get(Namespace::Login, "phone")
            .await?
            .and_then(|v| v.as_str().map(str::to_string)))
    }

    pub fn current(&self) -> Option<CurrentUser> {
        self.api.session().current()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{api_client, serve};

    async fn service(responses: Vec<(u16, &'static str)>) -> (LoginService, Store) {
        let (url, _) = serve(responses).await;
        let store = Store::open_in_memory().await.unwrap();
        (LoginService::new(api_client(&url), store.clone()), store)
    }

    #[tokio::test]
    async fn test_single_account_is_authenticated_and_persisted() {
        let (login, store) = service(vec![(
            200,
            r##"{"data":{"#result-set-1":[{
                "o_issuc":"1","o_msg":"ok","token":"tok","user_id":"u1","org_id":"c1"
            }]}}"##,
        )])
        .await;

        let outcome = login.login("13800000000", "pw", true).await.unwrap();
        let LoginOutcome::Authenticated { user } = outcome else {
            panic!("expected authenticated, got {outcome:?}");
        };
        assert_eq!(user.token, "tok");
        assert_eq!(login.current().map(|u| u.token).as_deref(), Some("tok"));

        let stored: CurrentUser = store
            .get_json(Namespace::CurrentUser, USER_KEY)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored, user);
        assert_eq!(
            login.remembered_phone().await.unwrap().as_deref(),
            Some("13800000000")
        );
    }

    #[tokio::test]
    async fn test_rejected_login_carries_server_message() {
        let (login, store) = service(vec![(
            200,
            r##"{"data":{"#result-set-1":[{"o_issuc":"0","o_msg":"account disabled"}]}}"##,
        )])
        .await;

        let outcome = login.login("138", "pw", false).await.unwrap();
        assert_eq!(
            outcome,
            LoginOutcome::Rejected {
                message: "account disabled".into()
            }
        );
        assert!(login.current().is_none());
        let stored: Option<CurrentUser> =
            store.get_json(Namespace::CurrentUser, USER_KEY).await.unwrap();
        assert!(stored.is_none());
    }

    #[tokio::test]
    async fn test_no_rows_is_rejected() {
        let (login, _) = service(vec![(200, r##"{"data":{"#result-set-1":[]}}"##)]).await;
        let outcome = login.login("138", "pw", false).await.unwrap();
        assert!(matches!(outcome, LoginOutcome::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_multiple_accounts_need_selection() {
        let (login, store) = service(vec![(
            200,
            r##"{"data":{"#result-set-1":[
                {"o_issuc":"1","token":"a","org_id":"c1"},
                {"o_issuc":"1","token":"b","org_id":"c2"}
            ]}}"##,
        )])
        .await;

        let outcome = login.login("138", "pw", false).await.unwrap();
        let LoginOutcome::SelectAccount { accounts } = outcome else {
            panic!("expected account selection");
        };
        assert!(login.current().is_none());
        assert!(login.remembered_phone().await.unwrap().is_none());

        login.select_account(accounts[1].clone()).await.unwrap();
        assert_eq!(login.current().map(|u| u.org_id).as_deref(), Some("c2"));

        let restored = LoginService::new(api_client("http://127.0.0.1:9/"), store)
            .restore()
            .await
            .unwrap();
        assert_eq!(restored.map(|u| u.token).as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_missing_credentials() {
        let (login, _) = service(vec![]).await;
        assert!(matches!(
            login.login(" ", "pw", false).await,
            Err(LoginError::MissingCredentials)
        ));
    }
}
