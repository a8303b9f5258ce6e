//! rollcall-core — Domain types and the face-engine façade.
//!
//! Detection, feature extraction and similarity search live in an external
//! engine. This crate only names the call surface ([`engine`]) and the
//! records the rest of the workspace passes around ([`types`]).

pub mod engine;
pub mod types;

pub use engine::{
    EngineError, FaceEngine, FaceSession, FeatureHub, HubOutcome, SessionConfig,
};
pub use types::{
    BoundingBox, FaceDetection, FaceId, FaceToken, FeatureVector, Identity, ParamsError,
    PersonFaceMapping, RecognitionParameters, RecognitionResult, RecognizedFace, Role,
    SearchHit, UnknownRole,
};
