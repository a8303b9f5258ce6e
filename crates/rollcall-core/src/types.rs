use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Identifier assigned by the feature hub on insert.
///
/// Only meaningful together with the hub database that issued it.
pub type FaceId = i64;

/// Roster a person belongs to. Each roster is synced independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Teacher,
    Student,
}

impl Role {
    pub const ALL: [Role; 2] = [Role::Teacher, Role::Student];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Teacher => "teacher",
            Role::Student => "student",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown role: {0}")]
pub struct UnknownRole(pub String);

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "teacher" => Ok(Role::Teacher),
            "student" => Ok(Role::Student),
            other => Err(UnknownRole(other.to_string())),
        }
    }
}

/// Axis-aligned face rectangle in image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Mirror the box horizontally inside an image of the given width.
    ///
    /// Front-camera frames are mirrored for display, so boxes reported on the
    /// raw frame must be flipped before they are drawn on the preview.
    pub fn mirrored(&self, image_width: f32) -> BoundingBox {
        BoundingBox {
            x: image_width - self.x - self.width,
            ..*self
        }
    }

    /// Scale coordinates, e.g. from a downscaled preview back to full size.
    pub fn scaled(&self, sx: f32, sy: f32) -> BoundingBox {
        BoundingBox {
            x: self.x * sx,
            y: self.y * sy,
            width: self.width * sx,
            height: self.height * sy,
        }
    }
}

/// Opaque per-detection handle used to request extraction for one face.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FaceToken(pub String);

/// A face reported by the engine for one image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceDetection {
    pub bbox: BoundingBox,
    pub track_id: i64,
    pub token: FaceToken,
}

impl FaceDetection {
    /// Pick the largest face, the one closest to the camera.
    pub fn largest(faces: &[FaceDetection]) -> Option<&FaceDetection> {
        faces
            .iter()
            .max_by(|a, b| a.bbox.area().total_cmp(&b.bbox.area()))
    }
}

/// Feature vector produced by the engine. Opaque to this workspace apart from
/// being handed back to the hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureVector {
    pub values: Vec<f32>,
    /// Engine model that produced the feature, when the engine reports one.
    pub model_version: Option<String>,
}

/// Best match returned by a hub search.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub face_id: FaceId,
    /// Engine confidence in [0, 1].
    pub confidence: f32,
}

/// Local record linking a hub face id to a person on a remote roster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonFaceMapping {
    pub face_id: FaceId,
    pub external_id: String,
    pub display_name: String,
    pub role: Role,
    pub org_id: String,
    pub org_name: String,
    pub source_image_url: String,
    /// SHA-256 (hex) of the photo the feature was extracted from.
    pub photo_digest: Option<String>,
    /// RFC 3339 timestamp of the last write.
    pub updated_at: String,
}

impl PersonFaceMapping {
    /// Key of the `face_mapping` key-value namespace: `"{external_id}_{role}"`.
    pub fn mapping_key(external_id: &str, role: Role) -> String {
        format!("{external_id}_{role}")
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ParamsError {
    #[error("{field} must be within 0..=100, got {value}")]
    OutOfRange { field: &'static str, value: f32 },
    #[error("preview resolution must look like WIDTHxHEIGHT, got {0:?}")]
    BadResolution(String),
}

/// Recognition settings, editable locally and seeded once from remote config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionParameters {
    pub use_front_camera: bool,
    pub liveness_enabled: bool,
    /// Minimum search confidence, in percent.
    pub similarity_threshold: f32,
    /// Minimum detection quality, in percent.
    pub quality_threshold: f32,
    /// Preview size, `"WIDTHxHEIGHT"`.
    pub preview_resolution: String,
}

impl Default for RecognitionParameters {
    fn default() -> Self {
        Self {
            use_front_camera: true,
            liveness_enabled: false,
            similarity_threshold: 80.0,
            quality_threshold: 60.0,
            preview_resolution: "640x480".to_string(),
        }
    }
}

impl RecognitionParameters {
    pub fn validate(&self) -> Result<(), ParamsError> {
        for (field, value) in [
            ("similarity_threshold", self.similarity_threshold),
            ("quality_threshold", self.quality_threshold),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(ParamsError::OutOfRange { field, value });
            }
        }
        self.preview_size()?;
        Ok(())
    }

    /// Similarity threshold on the engine's [0, 1] confidence scale.
    pub fn similarity_cutoff(&self) -> f32 {
        self.similarity_threshold / 100.0
    }

    /// Parse `preview_resolution` into `(width, height)`.
    pub fn preview_size(&self) -> Result<(u32, u32), ParamsError> {
        let bad = || ParamsError::BadResolution(self.preview_resolution.clone());
        let (w, h) = self
            .preview_resolution
            .trim()
            .split_once(['x', 'X', '*'])
            .ok_or_else(bad)?;
        let w: u32 = w.trim().parse().map_err(|_| bad())?;
        let h: u32 = h.trim().parse().map_err(|_| bad())?;
        if w == 0 || h == 0 {
            return Err(bad());
        }
        Ok((w, h))
    }
}

/// A hub match resolved against the local mapping table.
#[derive(Debug, Clone, Serialize)]
pub struct Identity {
    pub face_id: FaceId,
    pub confidence: f32,
    /// `None` when the hub knows the face but no local row does.
    pub person: Option<PersonFaceMapping>,
}

impl Identity {
    pub fn display_name(&self) -> &str {
        self.person
            .as_ref()
            .map(|p| p.display_name.as_str())
            .unwrap_or("unknown")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecognizedFace {
    pub detection: FaceDetection,
    pub identity: Option<Identity>,
}

/// Outcome of one frame or photo. Never persisted.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecognitionResult {
    pub faces: Vec<RecognizedFace>,
    pub frame_sequence: Option<u64>,
}

impl RecognitionResult {
    pub fn matched(&self) -> impl Iterator<Item = &Identity> {
        self.faces.iter().filter_map(|f| f.identity.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(x: f32, w: f32, h: f32, track: i64) -> FaceDetection {
        FaceDetection {
            bbox: BoundingBox {
                x,
                y: 0.0,
                width: w,
                height: h,
            },
            track_id: track,
            token: FaceToken(format!("t{track}")),
        }
    }

    #[test]
    fn test_role_roundtrip_strings() {
        assert_eq!("Teacher".parse::<Role>().unwrap(), Role::Teacher);
        assert_eq!(" student ".parse::<Role>().unwrap(), Role::Student);
        assert!("janitor".parse::<Role>().is_err());
        assert_eq!(Role::Student.to_string(), "student");
    }

    #[test]
    fn test_mapping_key_combines_id_and_role() {
        assert_eq!(PersonFaceMapping::mapping_key("S-17", Role::Student), "S-17_student");
        assert_ne!(
            PersonFaceMapping::mapping_key("42", Role::Student),
            PersonFaceMapping::mapping_key("42", Role::Teacher)
        );
    }

    #[test]
    fn test_largest_face_wins() {
        let faces = vec![
            detection(0.0, 10.0, 10.0, 1),
            detection(50.0, 40.0, 30.0, 2),
            detection(5.0, 20.0, 20.0, 3),
        ];
        assert_eq!(FaceDetection::largest(&faces).unwrap().track_id, 2);
        assert!(FaceDetection::largest(&[]).is_none());
    }

    #[test]
    fn test_bbox_mirror() {
        let b = BoundingBox {
            x: 10.0,
            y: 5.0,
            width: 20.0,
            height: 20.0,
        };
        let m = b.mirrored(100.0);
        assert_eq!(m.x, 70.0);
        assert_eq!(m.y, 5.0);
        assert_eq!(m.mirrored(100.0), b);
    }

    #[test]
    fn test_default_params_are_valid() {
        let p = RecognitionParameters::default();
        assert!(p.validate().is_ok());
        assert_eq!(p.preview_size().unwrap(), (640, 480));
        assert!((p.similarity_cutoff() - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_params_reject_out_of_range() {
        let p = RecognitionParameters {
            similarity_threshold: 120.0,
            ..Default::default()
        };
        assert_eq!(
            p.validate(),
            Err(ParamsError::OutOfRange {
                field: "similarity_threshold",
                value: 120.0
            })
        );
        let p = RecognitionParameters {
            quality_threshold: -1.0,
            ..Default::default()
        };
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_params_reject_bad_resolution() {
        for bad in ["", "640", "x480", "640x0", "axb"] {
            let p = RecognitionParameters {
                preview_resolution: bad.into(),
                ..Default::default()
            };
            assert!(p.validate().is_err(), "{bad:?} should be rejected");
        }
        let p = RecognitionParameters {
            preview_resolution: "1280*720".into(),
            ..Default::default()
        };
        assert_eq!(p.preview_size().unwrap(), (1280, 720));
    }

    #[test]
    fn test_identity_display_name_fallback() {
        let id = Identity {
            face_id: 3,
            confidence: 0.9,
            person: None,
        };
        assert_eq!(id.display_name(), "unknown");
    }
}
