use crate::capture::CaptureSettings;
use rollcall_core::{DetectorParams, DistanceMetric};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}

/// Application configuration.
///
/// Built from defaults, then an optional TOML file named by `ROLLCALL_CONFIG`,
/// then `ROLLCALL_*` environment variables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Root for photos, the registry and the capture buffer.
    pub data_dir: PathBuf,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Camera index (`/dev/video{index}`).
    pub camera_index: u32,
    /// Length of a bounded capture.
    pub capture_duration_secs: f32,
    /// Minimum time between two saved face crops.
    pub save_interval_secs: f32,
    /// Pause between frame reads.
    pub frame_delay_ms: u64,
    /// A student matches when their best verified distance is below this.
    pub match_threshold: f32,
    /// ArcFace model file stem in `model_dir`.
    pub model_name: String,
    pub distance_metric: DistanceMetric,
    /// Overrides the metric's default verification threshold.
    pub verify_threshold: Option<f32>,
    /// The closed set of class groups.
    pub groups: Vec<String>,
    pub min_face_size: f32,
    pub detector_confidence: f32,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        Self {
            model_dir: data_dir.join("models"),
            data_dir,
            camera_index: 0,
            capture_duration_secs: 8.0,
            save_interval_secs: 0.5,
            frame_delay_ms: 50,
            match_threshold: 0.68,
            model_name: "w600k_r50".to_string(),
            distance_metric: DistanceMetric::Cosine,
            verify_threshold: None,
            groups: ["ГР-1", "ГР-2", "ГР-3", "ГР-4"].map(String::from).to_vec(),
            min_face_size: 30.0,
            detector_confidence: 0.5,
        }
    }
}

impl Config {
    /// Load configuration from the optional file and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("ROLLCALL_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&raw)?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    /// Apply `ROLLCALL_*` overrides looked up through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(v) = lookup("ROLLCALL_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
            if lookup("ROLLCALL_MODEL_DIR").is_none() {
                self.model_dir = self.data_dir.join("models");
            }
        }
        if let Some(v) = lookup("ROLLCALL_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        override_parsed(&lookup, "ROLLCALL_CAMERA_INDEX", &mut self.camera_index)?;
        override_parsed(&lookup, "ROLLCALL_CAPTURE_DURATION_SECS", &mut self.capture_duration_secs)?;
        override_parsed(&lookup, "ROLLCALL_SAVE_INTERVAL_SECS", &mut self.save_interval_secs)?;
        override_parsed(&lookup, "ROLLCALL_FRAME_DELAY_MS", &mut self.frame_delay_ms)?;
        override_parsed(&lookup, "ROLLCALL_MATCH_THRESHOLD", &mut self.match_threshold)?;
        override_parsed(&lookup, "ROLLCALL_DISTANCE_METRIC", &mut self.distance_metric)?;
        override_parsed(&lookup, "ROLLCALL_MIN_FACE_SIZE", &mut self.min_face_size)?;
        override_parsed(&lookup, "ROLLCALL_DETECTOR_CONFIDENCE", &mut self.detector_confidence)?;
        if let Some(v) = lookup("ROLLCALL_VERIFY_THRESHOLD") {
            let parsed = v.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: "ROLLCALL_VERIFY_THRESHOLD",
                value: v.clone(),
            })?;
            self.verify_threshold = Some(parsed);
        }
        if let Some(v) = lookup("ROLLCALL_MODEL_NAME") {
            self.model_name = v;
        }
        if let Some(v) = lookup("ROLLCALL_GROUPS") {
            self.groups = v
                .split(',')
                .map(str::trim)
                .filter(|g| !g.is_empty())
                .map(String::from)
                .collect();
        }
        self.validate()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let bad = |key: &'static str, value: String| Err(ConfigError::InvalidValue { key, value });
        if self.groups.is_empty() {
            return bad("groups", "[]".into());
        }
        if self.capture_duration_secs <= 0.0 {
            return bad("capture_duration_secs", self.capture_duration_secs.to_string());
        }
        seconds("capture_duration_secs", self.capture_duration_secs)?;
        seconds("save_interval_secs", self.save_interval_secs)?;
        if !self.match_threshold.is_finite() {
            return bad("match_threshold", self.match_threshold.to_string());
        }
        Ok(())
    }

    pub fn photos_dir(&self) -> PathBuf {
        self.data_dir.join("photos")
    }

    pub fn temp_faces_dir(&self) -> PathBuf {
        self.data_dir.join("temp_faces")
    }

    pub fn registry_path(&self) -> PathBuf {
        self.data_dir.join("registry.db")
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir
            .join("det_10g.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        self.model_dir
            .join(format!("{}.onnx", self.model_name))
            .to_string_lossy()
            .into_owned()
    }

    pub fn capture_duration(&self) -> Duration {
        Duration::try_from_secs_f32(self.capture_duration_secs).unwrap_or(Duration::MAX)
    }

    pub fn capture_settings(&self) -> CaptureSettings {
        CaptureSettings {
            save_interval: Duration::try_from_secs_f32(self.save_interval_secs).unwrap_or(Duration::MAX),
            frame_delay: Duration::from_millis(self.frame_delay_ms),
        }
    }

    pub fn detector_params(&self) -> DetectorParams {
        DetectorParams {
            confidence_threshold: self.detector_confidence,
            min_face_size: self.min_face_size,
            ..DetectorParams::default()
        }
    }

    pub fn verify_threshold(&self) -> f32 {
        self.verify_threshold
            .unwrap_or_else(|| self.distance_metric.default_threshold())
    }
}

/// Convert a non-negative number of seconds, rejecting NaN, infinities and
/// values too large for a [`Duration`].
pub fn seconds(key: &'static str, secs: f32) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f32(secs).map_err(|_| ConfigError::InvalidValue {
        key,
        value: secs.to_string(),
    })
}

fn override_parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    slot: &mut T,
) -> Result<(), ConfigError> {
    if let Some(raw) = lookup(key) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value: raw.clone() })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.camera_index, 0);
        assert_eq!(config.capture_duration(), Duration::from_secs(8));
        assert_eq!(config.capture_settings().save_interval, Duration::from_millis(500));
        assert_eq!(config.match_threshold, 0.68);
        assert_eq!(config.distance_metric, DistanceMetric::Cosine);
        assert_eq!(config.verify_threshold(), 0.68);
        assert_eq!(config.groups.len(), 4);
        assert!(config.arcface_model_path().ends_with("w600k_r50.onnx"));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_overrides(env(&[
                ("ROLLCALL_DATA_DIR", "/srv/rollcall"),
                ("ROLLCALL_CAMERA_INDEX", "2"),
                ("ROLLCALL_SAVE_INTERVAL_SECS", "1.5"),
                ("ROLLCALL_DISTANCE_METRIC", "euclidean_l2"),
                ("ROLLCALL_GROUPS", "A, B ,,C"),
            ]))
            .unwrap();

        assert_eq!(config.photos_dir(), PathBuf::from("/srv/rollcall/photos"));
        assert_eq!(config.model_dir, PathBuf::from("/srv/rollcall/models"));
        assert_eq!(config.temp_faces_dir(), PathBuf::from("/srv/rollcall/temp_faces"));
        assert_eq!(config.camera_index, 2);
        assert_eq!(config.capture_settings().save_interval, Duration::from_millis(1500));
        assert_eq!(config.distance_metric, DistanceMetric::EuclideanL2);
        assert_eq!(config.verify_threshold(), 1.13);
        assert_eq!(config.groups, ["A", "B", "C"]);
    }

    #[test]
    fn test_invalid_env_value_rejected() {
        let mut config = Config::default();
        let err = config
            .apply_overrides(env(&[("ROLLCALL_CAMERA_INDEX", "front")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "ROLLCALL_CAMERA_INDEX", .. }));
    }

    #[test]
    fn test_oversized_durations_rejected() {
        for (key, raw) in [
            ("ROLLCALL_SAVE_INTERVAL_SECS", "1e30"),
            ("ROLLCALL_CAPTURE_DURATION_SECS", "1e30"),
            ("ROLLCALL_CAPTURE_DURATION_SECS", "inf"),
            ("ROLLCALL_SAVE_INTERVAL_SECS", "-1"),
        ] {
            let mut config = Config::default();
            let err = config.apply_overrides(env(&[(key, raw)])).unwrap_err();
            assert!(matches!(err, ConfigError::InvalidValue { .. }), "{key}={raw}");
        }

        let mut config = Config::default();
        assert!(config
            .apply_overrides(env(&[("ROLLCALL_CAPTURE_DURATION_SECS", "0")]))
            .is_err());
    }

    #[test]
    fn test_seconds() {
        assert_eq!(seconds("duration", 2.5).unwrap(), Duration::from_millis(2500));
        assert!(seconds("duration", 1e30).is_err());
        assert!(seconds("duration", f32::NAN).is_err());
    }

    #[test]
    fn test_toml_oversized_interval_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rollcall.toml");
        std::fs::write(&path, "save_interval_secs = 1e30\n").unwrap();
        assert!(matches!(
            Config::from_file(&path),
            Err(ConfigError::InvalidValue { key: "save_interval_secs", .. })
        ));
    }

    #[test]
    fn test_empty_groups_rejected() {
        let mut config = Config::default();
        assert!(config.apply_overrides(env(&[("ROLLCALL_GROUPS", " , ")])).is_err());
    }

    #[test]
    fn test_toml_file_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rollcall.toml");
        std::fs::write(
            &path,
            r#"
groups = ["7A", "7B"]
match_threshold = 0.5
distance_metric = "euclidean"
verify_threshold = 3.0
"#,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.groups, ["7A", "7B"]);
        assert_eq!(config.match_threshold, 0.5);
        assert_eq!(config.distance_metric, DistanceMetric::Euclidean);
        assert_eq!(config.verify_threshold(), 3.0);
        assert_eq!(config.camera_index, 0);
    }

    #[test]
    fn test_toml_unknown_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rollcall.toml");
        std::fs::write(&path, "admin_password = \"admin\"\n").unwrap();
        assert!(matches!(Config::from_file(&path), Err(ConfigError::Parse(_))));
    }
}
