//! Call surface of the external face engine.
//!
//! The engine owns detection, feature extraction and similarity search. This
//! workspace never reimplements them; it drives an implementation of these
//! traits from a single worker thread. Implementations may wrap a native SDK,
//! a subprocess or a remote inference service.

use crate::types::{FaceDetection, FaceId, FaceToken, FeatureVector, SearchHit};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("session creation failed: {0}")]
    SessionCreate(String),
    #[error("detection failed: {0}")]
    Detection(String),
    #[error("feature extraction failed: {0}")]
    Extraction(String),
    #[error("feature hub unavailable: {0}")]
    Hub(String),
    #[error("engine transport: {0}")]
    Transport(String),
}

/// Options passed to the engine when a session is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Track faces across consecutive frames (live video) rather than
    /// treating every image independently (still photos).
    pub tracking: bool,
    pub liveness_enabled: bool,
    /// Minimum detection quality in [0, 1]; lower-quality faces are dropped
    /// by the engine.
    pub quality_threshold: f32,
    pub max_faces: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tracking: false,
            liveness_enabled: false,
            quality_threshold: 0.0,
            max_faces: 5,
        }
    }
}

/// Result of a feature-hub call.
///
/// Hub operations distinguish "nothing there" from "the call itself failed";
/// both are ordinary outcomes the caller must handle.
#[derive(Debug, Clone, PartialEq)]
pub enum HubOutcome<T> {
    Ok(T),
    NotFound,
    Failed(String),
}

impl<T> HubOutcome<T> {
    pub fn is_ok(&self) -> bool {
        matches!(self, HubOutcome::Ok(_))
    }

    pub fn ok(self) -> Option<T> {
        match self {
            HubOutcome::Ok(v) => Some(v),
            _ => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> HubOutcome<U> {
        match self {
            HubOutcome::Ok(v) => HubOutcome::Ok(f(v)),
            HubOutcome::NotFound => HubOutcome::NotFound,
            HubOutcome::Failed(reason) => HubOutcome::Failed(reason),
        }
    }
}

/// Factory for sessions and the hub. One per process.
pub trait FaceEngine: Send {
    fn create_session(&self, config: &SessionConfig) -> Result<Box<dyn FaceSession>, EngineError>;

    fn open_hub(&self) -> Result<Box<dyn FeatureHub>, EngineError>;
}

/// A detection/extraction session. Exclusively owned by whoever created it.
pub trait FaceSession: Send {
    fn detect_faces(&mut self, image: &RgbImage) -> Result<Vec<FaceDetection>, EngineError>;

    fn extract_feature(
        &mut self,
        image: &RgbImage,
        token: &FaceToken,
    ) -> Result<FeatureVector, EngineError>;

    /// Release engine-side resources. Called exactly once by the owner.
    fn dispose(self: Box<Self>);
}

/// The engine's feature database.
pub trait FeatureHub: Send {
    fn insert(&mut self, feature: &FeatureVector) -> HubOutcome<FaceId>;

    fn update(&mut self, face_id: FaceId, feature: &FeatureVector) -> HubOutcome<()>;

    fn search(&mut self, feature: &FeatureVector) -> HubOutcome<SearchHit>;

    fn remove(&mut self, face_id: FaceId) -> HubOutcome<()>;
}
