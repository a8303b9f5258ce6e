//! Recognition parameters: stored copy first, then the remote defaults once,
//! then built-in defaults.

use std::sync::{Arc, RwLock};

use rollcall_api::{ApiClient, ApiError};
use rollcall_core::{ParamsError, RecognitionParameters, SessionConfig};
use rollcall_store::{Namespace, Store, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const PARAMS_KEY: &str = "params";

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("invalid parameters: {0}")]
    Invalid(#[from] ParamsError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Partial update; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ParamsPatch {
    pub use_front_camera: Option<bool>,
    pub liveness_enabled: Option<bool>,
    pub similarity_threshold: Option<f32>,
    pub quality_threshold: Option<f32>,
    pub preview_resolution: Option<String>,
}

impl ParamsPatch {
    fn apply(self, params: &mut RecognitionParameters) {
        if let Some(v) = self.use_front_camera {
            params.use_front_camera = v;
        }
        if let Some(v) = self.liveness_enabled {
            params.liveness_enabled = v;
        }
        if let Some(v) = self.similarity_threshold {
            params.similarity_threshold = v;
        }
        if let Some(v) = self.quality_threshold {
            params.quality_threshold = v;
        }
        if let Some(v) = self.preview_resolution {
            params.preview_resolution = v;
        }
    }
}

/// Options for the live engine session derived from the parameters.
pub fn live_session_config(params: &RecognitionParameters) -> SessionConfig {
    SessionConfig {
        tracking: true,
        liveness_enabled: params.liveness_enabled,
        quality_threshold: params.quality_threshold / 100.0,
        ..SessionConfig::default()
    }
}

#[derive(Clone)]
pub struct SettingsService {
    api: ApiClient,
    store: Store,
    current: Arc<RwLock<RecognitionParameters>>,
    persisted: Arc<RwLock<bool>>,
}

impl SettingsService {
    pub fn new(api: ApiClient, store: Store) -> Self {
        Self {
            api,
            store,
            current: Arc::new(RwLock::new(RecognitionParameters::default())),
            persisted: Arc::new(RwLock::new(false)),
        }
    }

    /// Load the stored parameters. Without a stored copy, ask the server once
    /// and persist whatever it answers (or the defaults). When the server
    /// cannot be asked yet because nobody is logged in, the defaults are used
    /// in memory and the server is asked on the next call.
    pub async fn load_or_init(&self) -> Result<RecognitionParameters, SettingsError> {
        if let Some(stored) = self
            .store
            .get_json::<RecognitionParameters>(Namespace::RecognitionParams, PARAMS_KEY)
            .await?
        {
            self.replace(stored.clone(), true);
            return Ok(stored);
        }

        let params = match self.api.fetch_remote_params().await {
            Ok(Some(remote)) => match remote.validate() {
                Ok(()) => remote,
                Err(e) => {
                    tracing::warn!(error = %e, "remote parameters invalid, using defaults");
                    RecognitionParameters::default()
                }
            },
            Ok(None) => RecognitionParameters::default(),
            Err(ApiError::NotAuthenticated) => {
                tracing::info!("not logged in, using default parameters for now");
                let params = RecognitionParameters::default();
                self.replace(params.clone(), false);
                return Ok(params);
            }
            Err(e) => {
                tracing::warn!(error = %e, "remote parameters unavailable, using defaults");
                RecognitionParameters::default()
            }
        };

        self.store
            .set_json(Namespace::RecognitionParams, PARAMS_KEY, &params)
            .await?;
        tracing::info!(?params, "recognition parameters initialised");
        self.replace(params.clone(), true);
        Ok(params)
    }

    /// Run [`Self::load_or_init`] unless parameters were already persisted.
    pub async fn ensure_initialised(&self) -> Result<RecognitionParameters, SettingsError> {
        if *self.persisted.read().unwrap_or_else(|e| e.into_inner()) {
            return Ok(self.get());
        }
        self.load_or_init().await
    }

    pub fn get(&self) -> RecognitionParameters {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Apply `patch`, validate, persist. The stored copy is left untouched
    /// when validation fails.
    pub async fn update(&self, patch: ParamsPatch) -> Result<RecognitionParameters, SettingsError> {
        let mut params = self.get();
        patch.apply(&mut params);
        params.validate()?;
        self.store
            .set_json(Namespace::RecognitionParams, PARAMS_KEY, &params)
            .await?;
        tracing::info!(?params, "recognition parameters updated");
        self.replace(params.clone(), true);
        Ok(params)
    }

    fn replace(&self, params: RecognitionParameters, persisted: bool) {
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = params;
        *self.persisted.write().unwrap_or_else(|e| e.into_inner()) = persisted;
    }
}
