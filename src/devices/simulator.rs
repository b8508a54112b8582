//! File-backed / in-memory simulators for every device port. These stand
//! in for the real Alpaca hardware clients (out of scope, §1) and are
//! configured with the recognized failure-injection options of §4.1.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use rand::rngs::SmallRng;
use rand::SeedableRng;

use super::{Detector, FailureProfile, Header, ImageBundle, Instrument, Mount, Roof, Weather};
use crate::error::HardwareFault;
use crate::model::{DetectorConfig, EquatorialCoord, InstrumentConfig};

/// Reads an append-only `safe`/`unsafe` log. Entries older than
/// `age_limit_secs` are treated as unsafe (§4.1, §6).
pub struct SimWeather {
    pub path: PathBuf,
    pub age_limit_secs: f64,
}

impl SimWeather {
    pub fn new(path: impl Into<PathBuf>, age_limit_secs: f64) -> Self {
        Self {
            path: path.into(),
            age_limit_secs,
        }
    }

    fn read_lines(&self) -> std::io::Result<Vec<String>> {
        std::fs::read_to_string(&self.path)
            .map(|s| s.lines().map(|l| l.to_string()).collect())
    }

    fn parse_line(line: &str) -> Option<(DateTime<Utc>, bool)> {
        let line = line.trim();
        if line.len() < 19 {
            return None;
        }
        let (ts, rest) = line.split_at(19);
        let naive = NaiveDateTime::parse_from_str(ts, "%Y-%m-%dT%H:%M:%S").ok()?;
        let timestamp = DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc);
        let status = rest.trim().to_lowercase();
        let safe = status == "safe";
        Some((timestamp, safe))
    }
}

#[async_trait]
impl Weather for SimWeather {
    async fn is_safe(&self) -> bool {
        let lines = match self.read_lines() {
            Ok(l) => l,
            Err(_) => return false,
        };
        let Some(last) = lines.iter().rev().find_map(|l| Self::parse_line(l)) else {
            return false;
        };
        let (timestamp, safe) = last;
        let age = (Utc::now() - timestamp).num_milliseconds() as f64 / 1000.0;
        safe && age.abs() <= self.age_limit_secs
    }

    async fn was_safe_since(&self, since: DateTime<Utc>) -> bool {
        let lines = match self.read_lines() {
            Ok(l) => l,
            Err(_) => return false,
        };
        let mut saw_any = false;
        for line in lines.iter().rev() {
            let Some((timestamp, safe)) = Self::parse_line(line) else {
                continue;
            };
            if timestamp < since {
                break;
            }
            saw_any = true;
            if !safe {
                return false;
            }
        }
        saw_any
    }
}

/// Roof simulator: `open`/`close` both obey a `FailureProfile`.
pub struct SimRoof {
    pub is_open: bool,
    open_profile: FailureProfile,
    close_profile: FailureProfile,
    open_count: u32,
    close_count: u32,
    rng: SmallRng,
}

impl SimRoof {
    pub fn new(open_profile: FailureProfile, close_profile: FailureProfile) -> Self {
        Self {
            is_open: false,
            open_profile,
            close_profile,
            open_count: 0,
            close_count: 0,
            rng: SmallRng::from_entropy(),
        }
    }
}

#[async_trait]
impl Roof for SimRoof {
    async fn open(&mut self) -> Result<(), HardwareFault> {
        tokio::time::sleep(std::time::Duration::from_secs_f64(self.open_profile.time_to_action_secs)).await;
        self.open_count += 1;
        self.is_open = true;
        if self.open_profile.should_fail(self.open_count, &mut self.rng) {
            return Err(HardwareFault::Roof(format!("open failed on attempt {}", self.open_count)));
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), HardwareFault> {
        tokio::time::sleep(std::time::Duration::from_secs_f64(self.close_profile.time_to_action_secs)).await;
        self.close_count += 1;
        if self.close_profile.should_fail(self.close_count, &mut self.rng) {
            return Err(HardwareFault::Roof(format!("close failed on attempt {}", self.close_count)));
        }
        self.is_open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.is_open
    }
}

/// Mount simulator: slew and park each obey their own `FailureProfile`.
pub struct SimMount {
    at_park: bool,
    tracking: bool,
    slew_profile: FailureProfile,
    park_profile: FailureProfile,
    slew_count: u32,
    park_count: u32,
    rng: SmallRng,
    header: Header,
}

impl SimMount {
    pub fn new(slew_profile: FailureProfile, park_profile: FailureProfile) -> Self {
        Self {
            at_park: true,
            tracking: false,
            slew_profile,
            park_profile,
            slew_count: 0,
            park_count: 0,
            rng: SmallRng::from_entropy(),
            header: Header::new(),
        }
    }
}

#[async_trait]
impl Mount for SimMount {
    async fn slew(&mut self, coord: EquatorialCoord) -> Result<(), HardwareFault> {
        tokio::time::sleep(std::time::Duration::from_secs_f64(self.slew_profile.time_to_action_secs)).await;
        self.slew_count += 1;
        if self.slew_profile.should_fail(self.slew_count, &mut self.rng) {
            return Err(HardwareFault::Mount(format!("slew failed on attempt {}", self.slew_count)));
        }
        self.at_park = false;
        self.header.insert("TELRA".into(), coord.ra_deg.to_string());
        self.header.insert("TELDEC".into(), coord.dec_deg.to_string());
        Ok(())
    }

    async fn park(&mut self) -> Result<(), HardwareFault> {
        tokio::time::sleep(std::time::Duration::from_secs_f64(self.park_profile.time_to_action_secs)).await;
        self.park_count += 1;
        if self.park_profile.should_fail(self.park_count, &mut self.rng) {
            return Err(HardwareFault::Mount(format!("park failed on attempt {}", self.park_count)));
        }
        self.at_park = true;
        self.tracking = false;
        Ok(())
    }

    async fn unpark(&mut self) -> Result<(), HardwareFault> {
        self.at_park = false;
        Ok(())
    }

    fn at_park(&self) -> bool {
        self.at_park
    }

    fn tracking(&self) -> bool {
        self.tracking
    }

    fn set_tracking(&mut self, on: bool) {
        self.tracking = on;
    }

    fn collect_header_metadata(&self) -> Header {
        self.header.clone()
    }
}

/// Instrument simulator: `configure` and `move_focuser` each obey their
/// own `FailureProfile`.
pub struct SimInstrument {
    configure_profile: FailureProfile,
    focuser_profile: FailureProfile,
    configure_count: u32,
    focuser_count: u32,
    rng: SmallRng,
    last_config: Option<InstrumentConfig>,
    focuser_position: f64,
}

impl SimInstrument {
    pub fn new(configure_profile: FailureProfile, focuser_profile: FailureProfile) -> Self {
        Self {
            configure_profile,
            focuser_profile,
            configure_count: 0,
            focuser_count: 0,
            rng: SmallRng::from_entropy(),
            last_config: None,
            focuser_position: 0.0,
        }
    }
}

#[async_trait]
impl Instrument for SimInstrument {
    async fn configure(&mut self, config: &InstrumentConfig) -> Result<(), HardwareFault> {
        tokio::time::sleep(std::time::Duration::from_secs_f64(
            self.configure_profile.time_to_action_secs,
        ))
        .await;
        self.configure_count += 1;
        if self.configure_profile.should_fail(self.configure_count, &mut self.rng) {
            return Err(HardwareFault::Instrument(format!(
                "configure failed on attempt {}",
                self.configure_count
            )));
        }
        self.last_config = Some(config.clone());
        if let Some(pos) = config.focuser_positions.first() {
            self.focuser_position = *pos;
        }
        Ok(())
    }

    async fn move_focuser(&mut self, position: f64) -> Result<(), HardwareFault> {
        tokio::time::sleep(std::time::Duration::from_secs_f64(
            self.focuser_profile.time_to_action_secs,
        ))
        .await;
        self.focuser_count += 1;
        if self.focuser_profile.should_fail(self.focuser_count, &mut self.rng) {
            return Err(HardwareFault::Focuser(format!(
                "move to {position} failed on attempt {}",
                self.focuser_count
            )));
        }
        self.focuser_position = position;
        Ok(())
    }

    fn focuser_position(&self) -> f64 {
        self.focuser_position
    }

    fn collect_header_metadata(&self) -> Header {
        let mut h = BTreeMap::new();
        h.insert("ICINST".into(), "simulator".to_string());
        h
    }
}

/// Detector simulator: `expose` obeys a `FailureProfile`; exposure time is
/// simulated with a real sleep unless `simulate_exposure_time` is false.
pub struct SimDetector {
    pub index: usize,
    setup_profile: FailureProfile,
    expose_profile: FailureProfile,
    simulate_exposure_time: bool,
    expose_count: u32,
    rng: SmallRng,
    exptime_sec: f64,
}

impl SimDetector {
    pub fn new(index: usize, setup_profile: FailureProfile, expose_profile: FailureProfile, simulate_exposure_time: bool) -> Self {
        Self {
            index,
            setup_profile,
            expose_profile,
            simulate_exposure_time,
            expose_count: 0,
            rng: SmallRng::from_entropy(),
            exptime_sec: 0.0,
        }
    }
}

#[async_trait]
impl Detector for SimDetector {
    async fn setup(&mut self, config: &DetectorConfig) -> Result<(), HardwareFault> {
        tokio::time::sleep(std::time::Duration::from_secs_f64(self.setup_profile.time_to_action_secs)).await;
        self.exptime_sec = config.exptime_sec;
        if self.setup_profile.should_fail(1, &mut self.rng) {
            return Err(HardwareFault::Detector(format!("cam{} setup failed", self.index)));
        }
        Ok(())
    }

    async fn expose(&mut self, header: Header) -> Result<ImageBundle, HardwareFault> {
        if self.simulate_exposure_time {
            tokio::time::sleep(std::time::Duration::from_secs_f64(
                self.exptime_sec + self.expose_profile.time_to_action_secs,
            ))
            .await;
        }
        self.expose_count += 1;
        if self.expose_profile.should_fail(self.expose_count, &mut self.rng) {
            return Err(HardwareFault::Detector(format!(
                "cam{} exposure {} failed",
                self.index, self.expose_count
            )));
        }
        Ok(ImageBundle {
            header,
            pixels: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roof_fails_after_configured_attempt() {
        let mut roof = SimRoof::new(
            FailureProfile {
                time_to_action_secs: 0.0,
                fail_after: Some(1),
                random_fail_rate: 0.0,
            },
            FailureProfile::default(),
        );
        assert!(roof.open().await.is_err());
    }

    #[tokio::test]
    async fn weather_stale_reading_is_unsafe() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("safe.txt");
        let stale = (Utc::now() - chrono::Duration::seconds(9000)).format("%Y-%m-%dT%H:%M:%S");
        std::fs::write(&path, format!("{stale} safe\n")).unwrap();
        let weather = SimWeather::new(path, 300.0);
        assert!(!weather.is_safe().await);
    }

    #[tokio::test]
    async fn weather_fresh_safe_reading_is_safe() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("safe.txt");
        let now = Utc::now().format("%Y-%m-%dT%H:%M:%S");
        std::fs::write(&path, format!("{now} safe\n")).unwrap();
        let weather = SimWeather::new(path, 300.0);
        assert!(weather.is_safe().await);
    }
}
