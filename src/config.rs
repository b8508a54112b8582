//! YAML configuration loading (§6). Unrecognized device tags or missing
//! required keys fail fast, before the machine is constructed (§7
//! "Unrecognized configuration").

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::devices::registry::DeviceRegistry;
use crate::devices::{Detector, Instrument, Mount, Roof, Weather};
use crate::site::{HorizonProfile, Site};

/// A loosely-typed device sub-config (`weather_config`, `roof_config`, …),
/// holding the recognized simulator options of §4.1 plus any passthrough
/// keys a hardware driver might need.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct DeviceConfig(BTreeMap<String, serde_yaml::Value>);

impl DeviceConfig {
    pub fn f64_opt(&self, key: &str) -> Option<f64> {
        self.0.get(key).and_then(|v| v.as_f64())
    }

    pub fn u32_opt(&self, key: &str) -> Option<u32> {
        self.0.get(key).and_then(|v| v.as_u64()).map(|v| v as u32)
    }

    pub fn bool_opt(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(|v| v.as_bool())
    }

    pub fn string_opt(&self, key: &str) -> Option<String> {
        self.0.get(key).and_then(|v| v.as_str()).map(|s| s.to_string())
    }
}

/// Horizon as named in the YAML file: either a scalar minimum altitude or
/// a path to a `az,h` CSV.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawHorizon {
    Scalar(f64),
    Path(String),
}

fn load_horizon(raw: &RawHorizon) -> Result<HorizonProfile> {
    match raw {
        RawHorizon::Scalar(h) => Ok(HorizonProfile::Scalar(*h)),
        RawHorizon::Path(path) => {
            let mut reader = csv::Reader::from_path(path)
                .with_context(|| format!("reading horizon file {path}"))?;
            let mut samples = Vec::new();
            for record in reader.deserialize() {
                let record: HorizonRow = record?;
                samples.push((record.az, record.h));
            }
            if samples.is_empty() {
                return Err(anyhow!("horizon file {path} has no rows"));
            }
            Ok(HorizonProfile::from_samples(samples))
        }
    }
}

#[derive(Debug, Deserialize)]
struct HorizonRow {
    az: f64,
    h: f64,
}

/// As read straight off the YAML document (§6's recognized options).
#[derive(Debug, Deserialize)]
pub struct RawConfig {
    pub name: String,
    #[serde(rename = "OTA")]
    pub ota: String,
    pub datadir: String,

    #[serde(default = "default_waittime")]
    pub waittime: f64,
    #[serde(default = "default_maxwait")]
    pub maxwait: f64,
    #[serde(default)]
    pub max_allowed_errors: u32,

    pub lat: f64,
    pub lon: f64,
    #[serde(default)]
    pub height: f64,
    pub horizon: RawHorizon,

    #[serde(default = "default_loglevel")]
    pub loglevel_console: String,
    pub logfile: Option<String>,
    #[serde(default = "default_loglevel")]
    pub loglevel_file: String,

    pub weather: String,
    #[serde(default)]
    pub weather_config: DeviceConfig,
    pub roof: String,
    #[serde(default)]
    pub roof_config: DeviceConfig,
    pub telescope: String,
    #[serde(default)]
    pub telescope_config: DeviceConfig,
    pub instrument: String,
    #[serde(default)]
    pub instrument_config: DeviceConfig,
    pub detector: Vec<String>,
    #[serde(default)]
    pub detector_config: Vec<DeviceConfig>,
}

fn default_waittime() -> f64 {
    2.0
}
fn default_maxwait() -> f64 {
    10.0
}
fn default_loglevel() -> String {
    "INFO".to_string()
}

/// Fully resolved configuration: devices constructed, horizon parsed,
/// everything validated. This is what `RollOffRoof::new` consumes.
pub struct SequencerConfig {
    pub name: String,
    pub datadir: PathBuf,
    pub waittime_secs: f64,
    pub maxwait_secs: f64,
    pub max_allowed_errors: u32,
    pub site: Site,
    pub loglevel_console: String,
    pub logfile: Option<PathBuf>,
    pub loglevel_file: String,
    pub weather: Box<dyn Weather>,
    pub roof: Box<dyn Roof>,
    pub mount: Box<dyn Mount>,
    pub instrument: Box<dyn Instrument>,
    pub detectors: Vec<Box<dyn Detector>>,
}

/// Load and validate a YAML configuration file, resolving device tags
/// through `registry`. Fails fast on any unrecognized tag or malformed
/// document — this must happen before the state machine is constructed.
pub fn load_config(path: impl AsRef<Path>, registry: &DeviceRegistry) -> Result<SequencerConfig> {
    let text = std::fs::read_to_string(path.as_ref())
        .with_context(|| format!("reading config file {}", path.as_ref().display()))?;
    let raw: RawConfig = serde_yaml::from_str(&text).context("parsing config YAML")?;

    if raw.detector.len() != raw.detector_config.len() && !raw.detector_config.is_empty() {
        return Err(anyhow!(
            "detector and detector_config lists must be the same length ({} vs {})",
            raw.detector.len(),
            raw.detector_config.len()
        ));
    }

    let horizon = load_horizon(&raw.horizon)?;
    let site = Site::new(raw.lat, raw.lon, raw.height, horizon);

    let weather = registry.weather(&raw.weather, &raw.weather_config)?;
    let roof = registry.roof(&raw.roof, &raw.roof_config)?;
    let mount = registry.mount(&raw.telescope, &raw.telescope_config)?;
    let instrument = registry.instrument(&raw.instrument, &raw.instrument_config)?;

    let empty_cfg = DeviceConfig::default();
    let mut detectors = Vec::with_capacity(raw.detector.len());
    for (i, tag) in raw.detector.iter().enumerate() {
        let cfg = raw.detector_config.get(i).unwrap_or(&empty_cfg);
        detectors.push(registry.detector(tag, i, cfg)?);
    }
    if detectors.is_empty() {
        return Err(anyhow!("at least one detector must be configured"));
    }

    Ok(SequencerConfig {
        name: raw.name,
        datadir: PathBuf::from(raw.datadir),
        waittime_secs: raw.waittime,
        maxwait_secs: raw.maxwait,
        max_allowed_errors: raw.max_allowed_errors,
        site,
        loglevel_console: raw.loglevel_console,
        logfile: raw.logfile.map(PathBuf::from),
        loglevel_file: raw.loglevel_file,
        weather,
        roof,
        mount,
        instrument,
        detectors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(dir: &Path, safety_file: &Path) -> PathBuf {
        let path = dir.join("config.yaml");
        let yaml = format!(
            r#"
name: testobs
OTA: OTA1
datadir: {datadir}
waittime: 0
maxwait: 0.1
max_allowed_errors: 1
lat: 20.0
lon: -155.0
height: 3000.0
horizon: 15.0
weather: simulator
weather_config:
  safety_file: {safety}
roof: simulator
roof_config: {{}}
telescope: simulator
telescope_config: {{}}
instrument: simulator
instrument_config: {{}}
detector: [simulator]
detector_config:
  - {{}}
"#,
            datadir = dir.display(),
            safety = safety_file.display(),
        );
        std::fs::write(&path, yaml).unwrap();
        path
    }

    #[test]
    fn loads_a_valid_config() {
        let dir = tempfile::tempdir().unwrap();
        let safety_file = dir.path().join("safe.txt");
        std::fs::write(&safety_file, "2020-01-01T00:00:00 safe\n").unwrap();
        let config_path = write_config(dir.path(), &safety_file);
        let registry = DeviceRegistry::default();
        let cfg = load_config(&config_path, &registry).unwrap();
        assert_eq!(cfg.name, "testobs");
        assert_eq!(cfg.detectors.len(), 1);
    }

    #[test]
    fn unrecognized_device_tag_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let safety_file = dir.path().join("safe.txt");
        std::fs::write(&safety_file, "2020-01-01T00:00:00 safe\n").unwrap();
        let config_path = write_config(dir.path(), &safety_file);
        let text = std::fs::read_to_string(&config_path).unwrap();
        let text = text.replace("roof: simulator", "roof: alpaca_gemini");
        std::fs::write(&config_path, text).unwrap();
        let registry = DeviceRegistry::default();
        assert!(load_config(&config_path, &registry).is_err());
    }
}
