use anyhow::{anyhow, bail, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::metadata::ObjectClass;
use crate::stage::StageOptions;

pub const CONFIG_ENV: &str = "PIPELINE_CONFIG";

const DEFAULT_DEVICE: &str = "/dev/video0";
const DEFAULT_FPS: u32 = 30;
const DEFAULT_WIDTH: u32 = 1920;
const DEFAULT_HEIGHT: u32 = 1080;
const DEFAULT_BATCH_SIZE: usize = 1;
const DEFAULT_BATCH_TIMEOUT_MS: u64 = 33;
const DEFAULT_LOCATION: &str = "rtmp://localhost/live/stream";
const DEFAULT_BACKEND: &str = "stub";
const DEFAULT_THRESHOLD: f32 = 0.4;
const DEFAULT_IOU_THRESHOLD: f32 = 0.3;
const DEFAULT_MAX_AGE: u32 = 15;
const DEFAULT_CHANNEL_CAPACITY: usize = 4;
const DEFAULT_CLASSIFIERS: [&str; 2] = ["vehicle-color", "vehicle-type"];

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    sources: Option<Vec<SourceConfigFile>>,
    muxer: Option<MuxerConfigFile>,
    inference: Option<InferenceConfigFile>,
    tracker: Option<TrackerConfigFile>,
    publish: Option<PublishConfigFile>,
    channel_capacity: Option<usize>,
    run_timeout_secs: Option<u64>,
    stages: Option<BTreeMap<String, StageOptions>>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    device: Option<String>,
    fps: Option<u32>,
    frame_limit: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct MuxerConfigFile {
    batch_size: Option<usize>,
    batch_timeout_ms: Option<u64>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct InferenceConfigFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    threshold: Option<f32>,
    secondary: Option<Vec<SecondaryConfigFile>>,
}

#[derive(Debug, Deserialize, Default)]
struct SecondaryConfigFile {
    classifier: String,
    targets: Option<Vec<ObjectClass>>,
}

#[derive(Debug, Deserialize, Default)]
struct TrackerConfigFile {
    iou_threshold: Option<f32>,
    max_age: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct PublishConfigFile {
    location: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub sources: Vec<SourceSettings>,
    pub muxer: MuxerSettings,
    pub inference: InferenceSettings,
    pub tracker: TrackerSettings,
    pub publish: PublishSettings,
    pub channel_capacity: usize,
    pub run_timeout: Option<Duration>,
    /// Extra options applied to named stages after construction.
    pub stage_options: BTreeMap<String, StageOptions>,
}

#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub device: String,
    pub fps: u32,
    /// Finite sources end after this many frames.
    pub frame_limit: Option<u64>,
}

impl SourceSettings {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            fps: DEFAULT_FPS,
            frame_limit: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MuxerSettings {
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct InferenceSettings {
    pub backend: String,
    pub model_path: Option<PathBuf>,
    pub threshold: f32,
    pub secondary: Vec<SecondarySettings>,
}

#[derive(Debug, Clone)]
pub struct SecondarySettings {
    pub classifier: String,
    pub targets: Vec<ObjectClass>,
}

impl SecondarySettings {
    pub fn new(classifier: impl Into<String>) -> Self {
        Self {
            classifier: classifier.into(),
            targets: vec![ObjectClass::Vehicle],
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrackerSettings {
    pub iou_threshold: f32,
    /// Frames an unmatched track survives before its id is retired.
    pub max_age: u32,
}

#[derive(Debug, Clone)]
pub struct PublishSettings {
    pub location: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        // An empty file yields every default; this cannot fail.
        Self::from_file(PipelineConfigFile::default())
    }
}

impl PipelineConfig {
    /// Load from the file named by `PIPELINE_CONFIG` (if set), then apply
    /// environment overrides and validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var(CONFIG_ENV).ok().map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => PipelineConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: PipelineConfigFile) -> Self {
        let sources = match file.sources {
            Some(sources) if !sources.is_empty() => sources
                .into_iter()
                .map(|source| SourceSettings {
                    device: source.device.unwrap_or_else(|| DEFAULT_DEVICE.to_string()),
                    fps: source.fps.unwrap_or(DEFAULT_FPS),
                    frame_limit: source.frame_limit,
                })
                .collect(),
            _ => vec![SourceSettings::new(DEFAULT_DEVICE)],
        };
        let muxer = file.muxer.unwrap_or_default();
        let muxer = MuxerSettings {
            batch_size: muxer.batch_size.unwrap_or(DEFAULT_BATCH_SIZE),
            batch_timeout: Duration::from_millis(
                muxer.batch_timeout_ms.unwrap_or(DEFAULT_BATCH_TIMEOUT_MS),
            ),
            width: muxer.width.unwrap_or(DEFAULT_WIDTH),
            height: muxer.height.unwrap_or(DEFAULT_HEIGHT),
        };
        let inference = file.inference.unwrap_or_default();
        let inference = InferenceSettings {
            backend: inference
                .backend
                .unwrap_or_else(|| DEFAULT_BACKEND.to_string()),
            model_path: inference.model_path,
            threshold: inference.threshold.unwrap_or(DEFAULT_THRESHOLD),
            secondary: match inference.secondary {
                Some(secondary) => secondary
                    .into_iter()
                    .map(|entry| SecondarySettings {
                        classifier: entry.classifier,
                        targets: entry.targets.unwrap_or_else(|| vec![ObjectClass::Vehicle]),
                    })
                    .collect(),
                None => DEFAULT_CLASSIFIERS
                    .iter()
                    .map(|name| SecondarySettings::new(*name))
                    .collect(),
            },
        };
        let tracker = file.tracker.unwrap_or_default();
        let tracker = TrackerSettings {
            iou_threshold: tracker.iou_threshold.unwrap_or(DEFAULT_IOU_THRESHOLD),
            max_age: tracker.max_age.unwrap_or(DEFAULT_MAX_AGE),
        };
        let publish = PublishSettings {
            location: file
                .publish
                .and_then(|publish| publish.location)
                .unwrap_or_else(|| DEFAULT_LOCATION.to_string()),
        };
        Self {
            sources,
            muxer,
            inference,
            tracker,
            publish,
            channel_capacity: file.channel_capacity.unwrap_or(DEFAULT_CHANNEL_CAPACITY),
            run_timeout: file.run_timeout_secs.map(Duration::from_secs),
            stage_options: file.stages.unwrap_or_default(),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(devices) = std::env::var("PIPELINE_DEVICE") {
            let parsed = split_csv(&devices);
            if !parsed.is_empty() {
                let fps = self.sources.first().map_or(DEFAULT_FPS, |s| s.fps);
                self.sources = parsed
                    .into_iter()
                    .map(|device| SourceSettings {
                        fps,
                        ..SourceSettings::new(device)
                    })
                    .collect();
            }
        }
        if let Ok(location) = std::env::var("PIPELINE_LOCATION") {
            if !location.trim().is_empty() {
                self.publish.location = location.trim().to_string();
            }
        }
        if let Some(size) = env_number::<usize>("PIPELINE_BATCH_SIZE")? {
            self.muxer.batch_size = size;
        }
        if let Some(ms) = env_number::<u64>("PIPELINE_BATCH_TIMEOUT_MS")? {
            self.muxer.batch_timeout = Duration::from_millis(ms);
        }
        if let Some(width) = env_number::<u32>("PIPELINE_WIDTH")? {
            self.muxer.width = width;
        }
        if let Some(height) = env_number::<u32>("PIPELINE_HEIGHT")? {
            self.muxer.height = height;
        }
        if let Some(secs) = env_number::<u64>("PIPELINE_RUN_TIMEOUT_SECS")? {
            self.run_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            bail!("at least one source is required");
        }
        for source in &self.sources {
            if source.device.trim().is_empty() {
                bail!("source device must not be empty");
            }
        }
        if self.muxer.batch_size == 0 {
            bail!("batch size must be at least 1");
        }
        if self.muxer.batch_timeout.is_zero() {
            bail!("batch timeout must be greater than zero");
        }
        if self.muxer.width == 0 || self.muxer.height == 0 {
            bail!("output resolution must be non-zero");
        }
        if !(0.0..=1.0).contains(&self.inference.threshold) {
            bail!("detection threshold must be within 0..=1");
        }
        if !(0.0..=1.0).contains(&self.tracker.iou_threshold) {
            bail!("tracker IoU threshold must be within 0..=1");
        }
        if self.channel_capacity == 0 {
            bail!("channel capacity must be at least 1");
        }
        let location = url::Url::parse(&self.publish.location)
            .map_err(|e| anyhow!("invalid publish location {}: {}", self.publish.location, e))?;
        match location.scheme() {
            "rtmp" | "rtmps" | "stub" => Ok(()),
            other => Err(anyhow!(
                "unsupported publish scheme '{}' in {}",
                other,
                self.publish.location
            )),
        }
    }
}

fn read_config_file(path: &Path) -> Result<PipelineConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))
    }
}

fn env_number<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a non-negative integer", key)),
        _ => Ok(None),
    }
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_pipeline() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.sources.len(), 1);
        assert_eq!(cfg.sources[0].device, "/dev/video0");
        assert_eq!(cfg.muxer.batch_size, 1);
        assert_eq!(cfg.muxer.batch_timeout, Duration::from_millis(33));
        assert_eq!((cfg.muxer.width, cfg.muxer.height), (1920, 1080));
        assert_eq!(cfg.inference.secondary.len(), 2);
        assert_eq!(cfg.channel_capacity, 4);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_location() {
        let mut cfg = PipelineConfig::default();
        cfg.publish.location = "http://example.com/live".to_string();
        assert!(cfg.validate().is_err());
        cfg.publish.location = "not a url".to_string();
        assert!(cfg.validate().is_err());
        cfg.publish.location = "stub://sink".to_string();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn split_csv_skips_blanks() {
        assert_eq!(split_csv(" a, ,b "), vec!["a".to_string(), "b".to_string()]);
    }
}
