//! Factory registry keyed by device tag (§9 "dynamic device loading").
//!
//! The source imports a Python module by name to resolve a device; here
//! configuration names a string tag, and startup resolves tag → factory
//! function. Only the `"simulator"` tag is registered out of the box —
//! a hardware Alpaca client would register under its own tag the same way.

use std::collections::HashMap;

use anyhow::{anyhow, Result};

use super::simulator::{SimDetector, SimInstrument, SimMount, SimRoof, SimWeather};
use super::{Detector, FailureProfile, Instrument, Mount, Roof, Weather};
use crate::config::DeviceConfig;

fn profile(cfg: &DeviceConfig, action: &str) -> FailureProfile {
    FailureProfile {
        time_to_action_secs: cfg.f64_opt(&format!("time_to_{action}")).unwrap_or(0.0),
        fail_after: cfg.u32_opt(&format!("{action}_fail_after")),
        random_fail_rate: cfg.f64_opt(&format!("{action}_random_fail_rate")).unwrap_or(0.0),
    }
}

pub type WeatherFactory = Box<dyn Fn(&DeviceConfig) -> Result<Box<dyn Weather>> + Send + Sync>;
pub type RoofFactory = Box<dyn Fn(&DeviceConfig) -> Result<Box<dyn Roof>> + Send + Sync>;
pub type MountFactory = Box<dyn Fn(&DeviceConfig) -> Result<Box<dyn Mount>> + Send + Sync>;
pub type InstrumentFactory = Box<dyn Fn(&DeviceConfig) -> Result<Box<dyn Instrument>> + Send + Sync>;
pub type DetectorFactory = Box<dyn Fn(usize, &DeviceConfig) -> Result<Box<dyn Detector>> + Send + Sync>;

/// Holds one factory table per device kind, keyed by tag.
pub struct DeviceRegistry {
    weather: HashMap<String, WeatherFactory>,
    roof: HashMap<String, RoofFactory>,
    mount: HashMap<String, MountFactory>,
    instrument: HashMap<String, InstrumentFactory>,
    detector: HashMap<String, DetectorFactory>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        let mut registry = Self {
            weather: HashMap::new(),
            roof: HashMap::new(),
            mount: HashMap::new(),
            instrument: HashMap::new(),
            detector: HashMap::new(),
        };
        registry.register_simulators();
        registry
    }
}

impl DeviceRegistry {
    fn register_simulators(&mut self) {
        self.weather.insert(
            "simulator".to_string(),
            Box::new(|cfg: &DeviceConfig| -> Result<Box<dyn Weather>> {
                let path = cfg
                    .string_opt("safety_file")
                    .ok_or_else(|| anyhow!("weather simulator requires `safety_file`"))?;
                let age_limit = cfg.f64_opt("age_limit").unwrap_or(300.0);
                Ok(Box::new(SimWeather::new(path, age_limit)))
            }),
        );
        self.roof.insert(
            "simulator".to_string(),
            Box::new(|cfg: &DeviceConfig| -> Result<Box<dyn Roof>> {
                Ok(Box::new(SimRoof::new(profile(cfg, "open"), profile(cfg, "close"))))
            }),
        );
        self.mount.insert(
            "simulator".to_string(),
            Box::new(|cfg: &DeviceConfig| -> Result<Box<dyn Mount>> {
                Ok(Box::new(SimMount::new(profile(cfg, "slew"), profile(cfg, "park"))))
            }),
        );
        self.instrument.insert(
            "simulator".to_string(),
            Box::new(|cfg: &DeviceConfig| -> Result<Box<dyn Instrument>> {
                Ok(Box::new(SimInstrument::new(
                    profile(cfg, "configure"),
                    profile(cfg, "focus"),
                )))
            }),
        );
        self.detector.insert(
            "simulator".to_string(),
            Box::new(|index: usize, cfg: &DeviceConfig| -> Result<Box<dyn Detector>> {
                let simulate_exposure_time = cfg.bool_opt("simulate_exposure_time").unwrap_or(true);
                Ok(Box::new(SimDetector::new(
                    index,
                    profile(cfg, "setup"),
                    profile(cfg, "expose"),
                    simulate_exposure_time,
                )))
            }),
        );
    }

    pub fn weather(&self, tag: &str, cfg: &DeviceConfig) -> Result<Box<dyn Weather>> {
        let f = self.weather.get(tag).ok_or_else(|| unrecognized("weather", tag))?;
        f(cfg)
    }

    pub fn roof(&self, tag: &str, cfg: &DeviceConfig) -> Result<Box<dyn Roof>> {
        let f = self.roof.get(tag).ok_or_else(|| unrecognized("roof", tag))?;
        f(cfg)
    }

    pub fn mount(&self, tag: &str, cfg: &DeviceConfig) -> Result<Box<dyn Mount>> {
        let f = self.mount.get(tag).ok_or_else(|| unrecognized("telescope", tag))?;
        f(cfg)
    }

    pub fn instrument(&self, tag: &str, cfg: &DeviceConfig) -> Result<Box<dyn Instrument>> {
        let f = self.instrument.get(tag).ok_or_else(|| unrecognized("instrument", tag))?;
        f(cfg)
    }

    pub fn detector(&self, tag: &str, index: usize, cfg: &DeviceConfig) -> Result<Box<dyn Detector>> {
        let f = self.detector.get(tag).ok_or_else(|| unrecognized("detector", tag))?;
        f(index, cfg)
    }
}

fn unrecognized(kind: &str, tag: &str) -> anyhow::Error {
    anyhow!("unrecognized {kind} device tag: {tag}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrecognized_tag_fails_fast() {
        let registry = DeviceRegistry::default();
        let err = registry.roof("alpaca", &DeviceConfig::default()).unwrap_err();
        assert!(err.to_string().contains("unrecognized"));
    }
}
