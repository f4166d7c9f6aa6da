use rollcall_core::detector::DEFAULT_DETECTION_THRESHOLD;
use rollcall_core::matcher::DEFAULT_RECOGNITION_THRESHOLD;
use std::path::PathBuf;

/// Runtime configuration, loaded from environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// SQLite attendance ledger.
    pub db_path: PathBuf,
    /// Enrollment image corpus, one directory per identity.
    pub dataset_dir: PathBuf,
    /// Persisted gallery file pair.
    pub gallery_dir: PathBuf,
    /// Directory containing `det_10g.onnx` and `w600k_r50.onnx`.
    pub model_dir: PathBuf,
    /// Similarity a match must exceed.
    pub recognition_threshold: f32,
    /// Minimum SCRFD score for a detection.
    pub detection_threshold: f32,
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    pub frame_width: u32,
    pub frame_height: u32,
    /// Identities seeded into the ledger at startup.
    pub default_identities: Vec<String>,
    /// Optional TOML file with box colors.
    pub display_config: Option<PathBuf>,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let path = |key: &str| var(key).filter(|v| !v.is_empty()).map(PathBuf::from);

        let data_dir = path("ROLLCALL_DATA_DIR").unwrap_or_else(|| {
            path("XDG_DATA_HOME")
                .unwrap_or_else(|| {
                    let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
                    PathBuf::from(home).join(".local/share")
                })
                .join("rollcall")
        });

        let parsed_f32 = |key: &str, default: f32| {
            var(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
        };
        let parsed_u32 = |key: &str, default: u32| {
            var(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
        };

        Self {
            db_path: path("ROLLCALL_DB_PATH").unwrap_or_else(|| data_dir.join("attendance.db")),
            dataset_dir: path("ROLLCALL_DATASET_DIR").unwrap_or_else(|| data_dir.join("dataset")),
            gallery_dir: path("ROLLCALL_GALLERY_DIR").unwrap_or_else(|| data_dir.join("gallery")),
            model_dir: path("ROLLCALL_MODEL_DIR").unwrap_or_else(|| data_dir.join("models")),
            recognition_threshold: parsed_f32(
                "ROLLCALL_RECOGNITION_THRESHOLD",
                DEFAULT_RECOGNITION_THRESHOLD,
            ),
            detection_threshold: parsed_f32("ROLLCALL_DETECTION_THRESHOLD", DEFAULT_DETECTION_THRESHOLD),
            camera_device: var("ROLLCALL_CAMERA_DEVICE").unwrap_or_else(|| "/dev/video0".to_string()),
            frame_width: parsed_u32("ROLLCALL_FRAME_WIDTH", 640),
            frame_height: parsed_u32("ROLLCALL_FRAME_HEIGHT", 480),
            default_identities: var("ROLLCALL_DEFAULT_IDENTITIES")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            display_config: path("ROLLCALL_DISPLAY_CONFIG"),
        }
    }
}
