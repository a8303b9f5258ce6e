//! HTTP adapter for the face-engine façade.
//!
//! Forwards session and hub calls to an inference service. Images travel as
//! base64 JPEG. The façade is synchronous, so this uses the blocking reqwest
//! client; it must only be driven from a plain OS thread, never from inside
//! the tokio runtime.

use std::io::Cursor;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use image::{ImageFormat, RgbImage};
use reqwest::blocking::{Client, Response};
use reqwest::StatusCode;
use rollcall_core::{
    EngineError, FaceDetection, FaceEngine, FaceId, FaceSession, FaceToken, FeatureHub,
    FeatureVector, HubOutcome, SearchHit, SessionConfig,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Engine backed by a remote inference service.
///
/// Holds configuration only; HTTP clients are built lazily by
/// [`FaceEngine::create_session`] and [`FaceEngine::open_hub`] on the calling
/// thread.
#[derive(Debug, Clone)]
pub struct RemoteFaceEngine {
    base_url: String,
    timeout: Duration,
}

impl RemoteFaceEngine {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        }
    }

    fn client(&self) -> Result<Client, EngineError> {
        Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| EngineError::Transport(e.to_string()))
    }
}

#[derive(Deserialize)]
struct SessionCreated {
    session_id: String,
}

#[derive(Deserialize)]
struct Detections {
    faces: Vec<FaceDetection>,
}

#[derive(Serialize)]
struct ImageBody<'a> {
    image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<&'a FaceToken>,
}

#[derive(Deserialize)]
struct Inserted {
    face_id: FaceId,
}

impl FaceEngine for RemoteFaceEngine {
    fn create_session(&self, config: &SessionConfig) -> Result<Box<dyn FaceSession>, EngineError> {
        let client = self.client()?;
        let resp = client
            .post(format!("{}/v1/sessions", self.base_url))
            .json(config)
            .send()
            .map_err(|e| EngineError::SessionCreate(e.to_string()))?;
        let created: SessionCreated = json_body(resp).map_err(EngineError::SessionCreate)?;
        debug!(session = %created.session_id, "inference session created");
        Ok(Box::new(RemoteSession {
            client,
            base_url: self.base_url.clone(),
            id: created.session_id,
        }))
    }

    fn open_hub(&self) -> Result<Box<dyn FeatureHub>, EngineError> {
        Ok(Box::new(RemoteHub {
            client: self.client()?,
            base_url: self.base_url.clone(),
        }))
    }
}

fn encode_jpeg(image: &RgbImage) -> Result<String, String> {
    let mut buf = Cursor::new(Vec::new());
    image
        .write_to(&mut buf, ImageFormat::Jpeg)
        .map_err(|e| format!("jpeg encode: {e}"))?;
    Ok(STANDARD.encode(buf.into_inner()))
}

fn json_body<T: serde::de::DeserializeOwned>(resp: Response) -> Result<T, String> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().unwrap_or_default();
        return Err(format!("inference service returned {status}: {body}"));
    }
    resp.json::<T>().map_err(|e| format!("bad response body: {e}"))
}

struct RemoteSession {
    client: Client,
    base_url: String,
    id: String,
}

impl RemoteSession {
    fn url(&self, action: &str) -> String {
        format!("{}/v1/sessions/{}/{action}", self.base_url, self.id)
    }
}

impl FaceSession for RemoteSession {
    fn detect_faces(&mut self, image: &RgbImage) -> Result<Vec<FaceDetection>, EngineError> {
        let body = ImageBody {
            image: encode_jpeg(image).map_err(EngineError::Detection)?,
            token: None,
        };
        let resp = self
            .client
            .post(self.url("detect"))
            .json(&body)
            .send()
            .map_err(|e| EngineError::Transport(e.to_string()))?;
        let detections: Detections = json_body(resp).map_err(EngineError::Detection)?;
        Ok(detections.faces)
    }

    fn extract_feature(
        &mut self,
        image: &RgbImage,
        token: &FaceToken,
    ) -> Result<FeatureVector, EngineError> {
        let body = ImageBody {
            image: encode_jpeg(image).map_err(EngineError::Extraction)?,
            token: Some(token),
        };
        let resp = self
            .client
            .post(self.url("extract"))
            .json(&body)
            .send()
            .map_err(|e| EngineError::Transport(e.to_string()))?;
        json_body(resp).map_err(EngineError::Extraction)
    }

    fn dispose(self: Box<Self>) {
        let url = format!("{}/v1/sessions/{}", self.base_url, self.id);
        match self.client.delete(url).send() {
            Ok(resp) if resp.status().is_success() => {
                debug!(session = %self.id, "inference session disposed")
            }
            Ok(resp) => warn!(
                session = %self.id,
                status = %resp.status(),
                "session dispose refused"
            ),
            Err(e) => warn!(session = %self.id, error = %e, "session dispose failed"),
        }
    }
}

struct RemoteHub {
    client: Client,
    base_url: String,
}

impl RemoteHub {
    fn outcome<T>(
        result: reqwest::Result<Response>,
        read: impl FnOnce(Response) -> Result<T, String>,
    ) -> HubOutcome<T> {
        let resp = match result {
            Ok(resp) => resp,
            Err(e) => return HubOutcome::Failed(e.to_string()),
        };
        match resp.status() {
            StatusCode::NOT_FOUND => HubOutcome::NotFound,
            s if s.is_success() => match read(resp) {
                Ok(v) => HubOutcome::Ok(v),
                Err(e) => HubOutcome::Failed(e),
            },
            s => {
                let body = resp.text().unwrap_or_default();
                HubOutcome::Failed(format!("hub returned {s}: {body}"))
            }
        }
    }
}

impl FeatureHub for RemoteHub {
    fn insert(&mut self, feature: &FeatureVector) -> HubOutcome<FaceId> {
        let sent = self
            .client
            .post(format!("{}/v1/hub/faces", self.base_url))
            .json(feature)
            .send();
        Self::outcome(sent, |r| {
            r.json::<Inserted>()
                .map(|i| i.face_id)
                .map_err(|e| e.to_string())
        })
    }

    fn update(&mut self, face_id: FaceId, feature: &FeatureVector) -> HubOutcome<()> {
        let sent = self
            .client
            .put(format!("{}/v1/hub/faces/{face_id}", self.base_url))
            .json(feature)
            .send();
        Self::outcome(sent, |_| Ok(()))
    }

    fn search(&mut self, feature: &FeatureVector) -> HubOutcome<SearchHit> {
        let sent = self
            .client
            .post(format!("{}/v1/hub/search", self.base_url))
            .json(feature)
            .send();
        Self::outcome(sent, |r| r.json::<SearchHit>().map_err(|e| e.to_string()))
    }

    fn remove(&mut self, face_id: FaceId) -> HubOutcome<()> {
        let sent = self
            .client
            .delete(format!("{}/v1/hub/faces/{face_id}", self.base_url))
            .send();
        Self::outcome(sent, |_| Ok(()))
    }
}
