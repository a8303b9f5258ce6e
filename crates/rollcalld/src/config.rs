use std::path::PathBuf;
use std::time::Duration;

use rollcall_frame::{PixelFormat, SpoolLayout};

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Stored-procedure API endpoint.
    pub api_url: String,
    /// Value of the `func` query parameter.
    pub api_name: String,
    /// Base URL of the inference service backing the face engine.
    pub engine_url: String,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Spool file the camera pipeline writes the latest frame to.
    pub frame_path: PathBuf,
    /// Encoded images, or raw buffers of a fixed format and size.
    pub frame_layout: SpoolLayout,
    /// Where the live loop writes its overlay preview, if anywhere.
    pub overlay_path: Option<PathBuf>,
    /// Live loop tick period.
    pub poll_interval_ms: u64,
    /// Upper bound for one frame's inference.
    pub frame_budget_ms: u64,
    /// Timeout for each HTTP request.
    pub http_timeout_secs: u64,
    /// Timeout for one engine request during sync and registration.
    pub engine_timeout_secs: u64,
    /// Organisation to sync when the caller does not name one. Falls back to
    /// the logged-in account's organisation.
    pub org_id: Option<String>,
}

/// Below this the engine cannot answer even a small frame.
const MIN_FRAME_BUDGET_MS: u64 = 50;

/// `ROLLCALL_FRAME_FORMAT` unset, `jpeg` or `png` means encoded images. Raw
/// formats need both dimensions; without them the spool is read as encoded.
fn frame_layout(format: Option<&str>, width: u64, height: u64) -> SpoolLayout {
    let format = match format.map(str::trim) {
        None | Some("") => return SpoolLayout::Encoded,
        Some(f) => f.to_ascii_lowercase(),
    };
    if matches!(format.as_str(), "jpeg" | "jpg" | "png" | "encoded") {
        return SpoolLayout::Encoded;
    }
    let format: PixelFormat = match format.parse() {
        Ok(format) => format,
        Err(e) => {
            tracing::warn!(error = %e, "reading spool as encoded images");
            return SpoolLayout::Encoded;
        }
    };
    match (u32::try_from(width), u32::try_from(height)) {
        (Ok(width), Ok(height)) if width > 0 && height > 0 => SpoolLayout::Raw {
            format,
            width,
            height,
        },
        _ => {
            tracing::warn!(
                ?format,
                width,
                height,
                "raw spool needs ROLLCALL_FRAME_WIDTH and ROLLCALL_FRAME_HEIGHT; reading as encoded"
            );
            SpoolLayout::Encoded
        }
    }
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = get("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = get("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let u64_or = |key: &str, default: u64| {
            get(key)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        };

        Self {
            api_url: get("ROLLCALL_API_URL")
                .unwrap_or_else(|| "http://localhost:8080/api".to_string()),
            api_name: get("ROLLCALL_API_NAME").unwrap_or_else(|| "attendance".to_string()),
            engine_url: get("ROLLCALL_ENGINE_URL")
                .unwrap_or_else(|| "http://127.0.0.1:7070".to_string()),
            db_path: get("ROLLCALL_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("rollcall.db")),
            frame_path: get("ROLLCALL_FRAME_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("latest.jpg")),
            frame_layout: frame_layout(
                get("ROLLCALL_FRAME_FORMAT").as_deref(),
                u64_or("ROLLCALL_FRAME_WIDTH", 0),
                u64_or("ROLLCALL_FRAME_HEIGHT", 0),
            ),
            overlay_path: get("ROLLCALL_OVERLAY_PATH")
                .filter(|p| !p.is_empty())
                .map(PathBuf::from),
            poll_interval_ms: u64_or("ROLLCALL_POLL_INTERVAL_MS", 500).max(10),
            frame_budget_ms: u64_or("ROLLCALL_FRAME_BUDGET_MS", 2000).max(MIN_FRAME_BUDGET_MS),
            http_timeout_secs: u64_or("ROLLCALL_HTTP_TIMEOUT_SECS", 15).max(1),
            engine_timeout_secs: u64_or("ROLLCALL_ENGINE_TIMEOUT_SECS", 30).max(1),
            org_id: get("ROLLCALL_ORG_ID").filter(|o| !o.is_empty()),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn frame_budget(&self) -> Duration {
        Duration::from_millis(self.frame_budget_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn engine_timeout(&self) -> Duration {
        Duration::from_secs(self.engine_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn test_defaults() {
        let c = config(&[("HOME", "/home/kiosk")]);
        let data = PathBuf::from("/home/kiosk/.local/share/rollcall");
        assert_eq!(c.db_path, data.join("rollcall.db"));
        assert_eq!(c.frame_path, data.join("latest.jpg"));
        assert_eq!(c.poll_interval(), Duration::from_millis(500));
        assert_eq!(c.api_name, "attendance");
        assert!(c.overlay_path.is_none());
        assert!(c.org_id.is_none());
    }

    #[test]
    fn test_overrides() {
        let c = config(&[
            ("XDG_DATA_HOME", "/data"),
            ("ROLLCALL_POLL_INTERVAL_MS", "250"),
            ("ROLLCALL_FRAME_BUDGET_MS", "nonsense"),
            ("ROLLCALL_OVERLAY_PATH", "/run/overlay.png"),
            ("ROLLCALL_ORG_ID", "c1"),
        ]);
        assert_eq!(c.db_path, PathBuf::from("/data/rollcall/rollcall.db"));
        assert_eq!(c.poll_interval_ms, 250);
        assert_eq!(c.frame_budget_ms, 2000);
        assert_eq!(c.overlay_path, Some(PathBuf::from("/run/overlay.png")));
        assert_eq!(c.org_id.as_deref(), Some("c1"));
    }

    #[test]
    fn test_intervals_have_floors() {
        let c = config(&[
            ("ROLLCALL_POLL_INTERVAL_MS", "0"),
            ("ROLLCALL_FRAME_BUDGET_MS", "0"),
            ("ROLLCALL_HTTP_TIMEOUT_SECS", "0"),
            ("ROLLCALL_ENGINE_TIMEOUT_SECS", "0"),
        ]);
        assert_eq!(c.poll_interval_ms, 10);
        assert_eq!(c.frame_budget(), Duration::from_millis(MIN_FRAME_BUDGET_MS));
        assert_eq!(c.http_timeout(), Duration::from_secs(1));
        assert_eq!(c.engine_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_raw_frame_layout() {
        let c = config(&[
            ("ROLLCALL_FRAME_FORMAT", "NV21"),
            ("ROLLCALL_FRAME_WIDTH", "640"),
            ("ROLLCALL_FRAME_HEIGHT", "480"),
        ]);
        assert_eq!(
            c.frame_layout,
            SpoolLayout::Raw {
                format: PixelFormat::Nv21,
                width: 640,
                height: 480,
            }
        );
    }

    #[test]
    fn test_frame_layout_falls_back_to_encoded() {
        assert_eq!(config(&[]).frame_layout, SpoolLayout::Encoded);
        assert_eq!(
            config(&[("ROLLCALL_FRAME_FORMAT", "jpeg")]).frame_layout,
            SpoolLayout::Encoded
        );
        // raw without dimensions
        assert_eq!(
            config(&[("ROLLCALL_FRAME_FORMAT", "yuyv")]).frame_layout,
            SpoolLayout::Encoded
        );
        assert_eq!(
            config(&[
                ("ROLLCALL_FRAME_FORMAT", "bayer"),
                ("ROLLCALL_FRAME_WIDTH", "4"),
                ("ROLLCALL_FRAME_HEIGHT", "4"),
            ])
            .frame_layout,
            SpoolLayout::Encoded
        );
    }
}
