//! Device ports (§4.1): polymorphic contracts for Weather, Roof, Mount,
//! Instrument and Detector. Two concrete implementations exist per port in
//! a real deployment (a hardware Alpaca client and a simulator); only the
//! simulator is in scope here, behind the same trait a hardware client
//! would implement.

pub mod registry;
pub mod simulator;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::HardwareFault;
use crate::model::{DetectorConfig, EquatorialCoord, InstrumentConfig};

pub type Header = BTreeMap<String, String>;

/// The image data a detector hands back from an exposure. The FITS writer
/// itself is out of scope (§1); this just carries enough to persist a
/// placeholder file and assert filename non-collision.
#[derive(Debug, Clone)]
pub struct ImageBundle {
    pub header: Header,
    pub pixels: Vec<u8>,
}

#[async_trait]
pub trait Weather: Send + Sync {
    async fn is_safe(&self) -> bool;
    /// True iff every safety reading since `since` was safe.
    async fn was_safe_since(&self, since: DateTime<Utc>) -> bool;
}

#[async_trait]
pub trait Roof: Send + Sync {
    async fn open(&mut self) -> Result<(), HardwareFault>;
    async fn close(&mut self) -> Result<(), HardwareFault>;
    fn is_open(&self) -> bool;
}

#[async_trait]
pub trait Mount: Send + Sync {
    async fn slew(&mut self, coord: EquatorialCoord) -> Result<(), HardwareFault>;
    async fn park(&mut self) -> Result<(), HardwareFault>;
    async fn unpark(&mut self) -> Result<(), HardwareFault>;
    fn at_park(&self) -> bool;
    fn tracking(&self) -> bool;
    fn set_tracking(&mut self, on: bool);
    fn collect_header_metadata(&self) -> Header;
}

#[async_trait]
pub trait Instrument: Send + Sync {
    async fn configure(&mut self, config: &InstrumentConfig) -> Result<(), HardwareFault>;
    /// Move the OTA's focuser to an absolute position. Focuser motion is
    /// modeled as an instrument sub-capability (the device list of §4.1
    /// has no standalone focuser port), but its failures are their own
    /// hardware taxon (`HardwareFault::Focuser`) since a focus run treats
    /// them distinctly from a configuration failure.
    async fn move_focuser(&mut self, position: f64) -> Result<(), HardwareFault>;
    fn focuser_position(&self) -> f64;
    fn collect_header_metadata(&self) -> Header;
}

#[async_trait]
pub trait Detector: Send + Sync {
    async fn setup(&mut self, config: &DetectorConfig) -> Result<(), HardwareFault>;
    async fn expose(&mut self, header: Header) -> Result<ImageBundle, HardwareFault>;
}

/// Recognized simulator failure-injection options (§4.1): a fixed delay,
/// failure after the Nth call, and a probabilistic failure rate.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailureProfile {
    pub time_to_action_secs: f64,
    pub fail_after: Option<u32>,
    pub random_fail_rate: f64,
}

impl FailureProfile {
    /// Advance the call counter and decide whether this call fails.
    /// `rng` is injected so tests can pin randomness.
    pub fn should_fail(&self, call_count: u32, rng: &mut impl rand::Rng) -> bool {
        if let Some(n) = self.fail_after {
            if call_count >= n {
                return true;
            }
        }
        if self.random_fail_rate > 0.0 {
            return rng.gen::<f64>() < self.random_fail_rate;
        }
        false
    }
}
