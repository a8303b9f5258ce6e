//! The daemon's services, constructed once at startup and shared by the
//! D-Bus interface.

use anyhow::Context;
use rollcall_api::inference::RemoteFaceEngine;
use rollcall_api::{ApiClient, ApiConfig, SessionCell};
use rollcall_core::Role;
use rollcall_frame::SpoolFrameSource;
use rollcall_store::{Person, Store};

use crate::config::Config;
use crate::engine::{self, EngineHandle};
use crate::login::{LoginError, LoginOutcome, LoginService};
use crate::recognition::{LoopConfig, RecognitionError, RecognitionService};
use crate::registration::RegistrationService;
use crate::settings::{live_session_config, SettingsService};
use crate::sync::{SyncError, SyncReport, SyncService};

pub struct App {
    pub config: Config,
    pub store: Store,
    pub login: LoginService,
    pub settings: SettingsService,
    pub registration: RegistrationService,
    pub sync: SyncService,
    pub recognition: RecognitionService,
}

impl App {
    /// Open the store, restore the session, load parameters and start the
    /// engine worker.
    pub async fn open(config: Config) -> anyhow::Result<Self> {
        let store = Store::open(&config.db_path)
            .await
            .with_context(|| format!("opening store at {}", config.db_path.display()))?;

        let api = ApiClient::new(
            ApiConfig::new(&config.api_url, &config.api_name).with_timeout(config.http_timeout()),
            SessionCell::new(),
        )?;

        let login = LoginService::new(api.clone(), store.clone());
        if let Err(e) = login.restore().await {
            tracing::warn!(error = %e, "could not restore session");
        }

        let settings = SettingsService::new(api.clone(), store.clone());
        let params = settings.load_or_init().await?;

        let engine = engine::spawn_worker(
            Box::new(RemoteFaceEngine::new(&config.engine_url, config.http_timeout())),
            live_session_config(&params),
            config.engine_timeout(),
        )
        .await
        .with_context(|| format!("starting face engine at {}", config.engine_url))?;
        tracing::info!(url = %config.engine_url, "face engine ready");

        Ok(Self::assemble(config, store, api, login, settings, engine))
    }

    fn assemble(
        config: Config,
        store: Store,
        api: ApiClient,
        login: LoginService,
        settings: SettingsService,
        engine: EngineHandle,
    ) -> Self {
        let registration = RegistrationService::new(engine.clone(), store.clone());
        let sync = SyncService::new(api, store.clone(), registration.clone());
        let recognition = RecognitionService::new(
            engine,
            store.clone(),
            LoopConfig {
                interval: config.poll_interval(),
                frame_budget: config.frame_budget(),
                overlay_path: config.overlay_path.clone(),
            },
        );
        Self {
            config,
            store,
            login,
            settings,
            registration,
            sync,
            recognition,
        }
    }

    /// Log in; on success make sure recognition parameters were fetched.
    pub async fn login(
        &self,
        phone: &str,
        password: &str,
        remember: bool,
    ) -> Result<LoginOutcome, LoginError> {
        let outcome = self.login.login(phone, password, remember).await?;
        if matches!(outcome, LoginOutcome::Authenticated { .. }) {
            self.after_login().await;
        }
        Ok(outcome)
    }

    pub async fn select_account(&self, user: rollcall_api::CurrentUser) -> Result<(), LoginError> {
        self.login.select_account(user).await?;
        self.after_login().await;
        Ok(())
    }

    async fn after_login(&self) {
        if let Err(e) = self.settings.ensure_initialised().await {
            tracing::warn!(error = %e, "recognition parameters not initialised");
        }
    }

    /// Organisation to sync: the argument, then the configured one, then the
    /// logged-in account's.
    fn resolve_org(&self, org_id: Option<&str>) -> Result<String, SyncError> {
        org_id
            .map(str::to_string)
            .or_else(|| self.config.org_id.clone())
            .or_else(|| self.login.current().map(|u| u.org_id))
            .filter(|o| !o.trim().is_empty())
            .ok_or(SyncError::NoOrganisation)
    }

    /// Sync one role, or both when `role` is `None`.
    pub async fn sync(
        &self,
        role: Option<Role>,
        org_id: Option<&str>,
    ) -> Result<Vec<SyncReport>, SyncError> {
        let org_id = self.resolve_org(org_id)?;
        let roles = match role {
            Some(role) => vec![role],
            None => Role::ALL.to_vec(),
        };
        let mut reports = Vec::with_capacity(roles.len());
        for role in roles {
            reports.push(self.sync.sync(role, &org_id).await?);
        }
        Ok(reports)
    }

    /// Start the live loop on the spool file with the current parameters.
    pub async fn start_recognition(&self) -> Result<(), RecognitionError> {
        let source =
            SpoolFrameSource::with_layout(&self.config.frame_path, self.config.frame_layout);
        self.recognition
            .start(Box::new(source), self.settings.get())
            .await
    }

    pub async fn list_people(
        &self,
        role: Option<Role>,
    ) -> Result<Vec<Person>, rollcall_store::StoreError> {
        match role {
            Some(role) => self.store.query_by_role(role).await,
            None => self.store.list_all().await,
        }
    }

    pub async fn status(&self) -> anyhow::Result<serde_json::Value> {
        let mut roles = serde_json::Map::new();
        for role in Role::ALL {
            roles.insert(
                role.as_str().to_string(),
                serde_json::json!({
                    "version": self.store.roster_version(role).await?,
                    "people": self.store.count_by_role(role).await?,
                }),
            );
        }
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "logged_in": self.login.current().is_some(),
            "org_id": self.login.current().map(|u| u.org_id),
            "roles": roles,
            "sync_running": self.sync.is_running(),
            "recognition": self.recognition.status().await,
        }))
    }

    pub async fn shutdown(&self) {
        self.recognition.stop().await;
    }
}
