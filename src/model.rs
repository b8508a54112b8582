//! Observing-block value objects. In the production system these are
//! supplied by an external ODL (observation description language) package;
//! here they are plain, immutable data the scheduler and driver consume.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// J2000 equatorial coordinate, degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquatorialCoord {
    pub ra_deg: f64,
    pub dec_deg: f64,
}

/// A proper-motion-corrected target. Proper motion is stored but not
/// applied (no epoch propagation needed by this sequencer — see Non-goals).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub name: String,
    pub coord: EquatorialCoord,
    pub proper_motion_ra_masyr: f64,
    pub proper_motion_dec_masyr: f64,
}

impl Target {
    pub fn new(name: impl Into<String>, ra_deg: f64, dec_deg: f64) -> Self {
        Self {
            name: name.into(),
            coord: EquatorialCoord { ra_deg, dec_deg },
            proper_motion_ra_masyr: 0.0,
            proper_motion_dec_masyr: 0.0,
        }
    }
}

/// Alignment strategy for placing a target under the pointing.
///
/// A closed, exhaustive set: adding a variant without updating the
/// driver's `match` in `driver::acquire` is a compile error by design
/// (§9 "Polymorphism over OB subtypes and align variants").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Align {
    /// Slew-only.
    Blind,
    /// Slew plus mask centroiding. Not implemented in v1; the driver
    /// records an `AcquisitionFault` when it sees this variant.
    Mask,
}

impl fmt::Display for Align {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Align::Blind => write!(f, "BlindAlign"),
            Align::Mask => write!(f, "MaskAlign"),
        }
    }
}

/// One offset from the pattern's nominal center.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OffsetPosition {
    pub d_ra_arcsec: f64,
    pub d_dec_arcsec: f64,
    pub guide: bool,
}

/// An ordered telescope offset pattern, e.g. `Stare` (one position) or
/// `Dither` (several).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub name: String,
    pub positions: Vec<OffsetPosition>,
}

impl Pattern {
    pub fn stare() -> Self {
        Self {
            name: "Stare".to_string(),
            positions: vec![OffsetPosition {
                d_ra_arcsec: 0.0,
                d_dec_arcsec: 0.0,
                guide: false,
            }],
        }
    }

    pub fn dither(n: usize, step_arcsec: f64) -> Self {
        let positions = (0..n)
            .map(|i| OffsetPosition {
                d_ra_arcsec: step_arcsec * i as f64,
                d_dec_arcsec: 0.0,
                guide: false,
            })
            .collect();
        Self {
            name: "Dither".to_string(),
            positions,
        }
    }
}

/// Per-OTA filter and focuser configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentConfig {
    pub name: String,
    pub filter: String,
    pub focuser_positions: Vec<f64>,
    pub wavelength_nm: f64,
}

impl InstrumentConfig {
    pub fn to_header(&self) -> BTreeMap<String, String> {
        let mut h = BTreeMap::new();
        h.insert("ICNAME".into(), self.name.clone());
        h.insert("ICFILT".into(), self.filter.clone());
        for (i, pos) in self.focuser_positions.iter().enumerate() {
            h.insert(format!("ICFOC{i}"), pos.to_string());
        }
        h
    }
}

/// Detector readout mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadoutMode {
    Normal,
    Fast,
    LowNoise,
}

impl fmt::Display for ReadoutMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReadoutMode::Normal => "normal",
            ReadoutMode::Fast => "fast",
            ReadoutMode::LowNoise => "low_noise",
        };
        write!(f, "{s}")
    }
}

/// Per-camera exposure parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfig {
    pub name: String,
    pub exptime_sec: f64,
    pub nexp: u32,
    pub gain: Option<f64>,
    pub binning: (u32, u32),
    pub window: Option<(u32, u32, u32, u32)>,
    pub readout_mode: ReadoutMode,
}

impl DetectorConfig {
    pub fn to_header(&self) -> BTreeMap<String, String> {
        let mut h = BTreeMap::new();
        h.insert("DCNAME".into(), self.name.clone());
        h.insert("DCEXPT".into(), self.exptime_sec.to_string());
        h.insert("DCNEXP".into(), self.nexp.to_string());
        h.insert("DCRDMODE".into(), self.readout_mode.to_string());
        h.insert("DCBIN".into(), format!("{}x{}", self.binning.0, self.binning.1));
        if let Some(g) = self.gain {
            h.insert("DCGAIN".into(), g.to_string());
        }
        if let Some((x0, y0, x1, y1)) = self.window {
            h.insert("DCWINDOW".into(), format!("{x0},{y0},{x1},{y1}"));
        }
        h
    }
}

/// Focus strategy parameters (spec.md §4.6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FocusStrategy {
    FitParabola {
        n_focus_positions: u32,
        focus_step: f64,
        images_per_position: u32,
        refocus_if_near_edge: bool,
    },
    MaxRun,
}

/// The kind of observing block. `Science` and `Calibration` blocks go
/// straight to `observing`; a focus subtype goes through `focusing` first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BlockType {
    Science,
    Focus(FocusStrategy),
    Calibration,
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockType::Science => write!(f, "Science"),
            BlockType::Focus(FocusStrategy::FitParabola { .. }) => write!(f, "FocusFitParabola"),
            BlockType::Focus(FocusStrategy::MaxRun) => write!(f, "FocusMaxRun"),
            BlockType::Calibration => write!(f, "Calibration"),
        }
    }
}

/// An immutable unit of work handed to the sequencer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservingBlock {
    pub blocktype: BlockType,
    pub target: Target,
    pub align: Align,
    pub pattern: Pattern,
    pub instconfig: InstrumentConfig,
    pub detconfig: Vec<DetectorConfig>,
}

impl ObservingBlock {
    /// Rough wall-clock estimate used by the horizon pre-check. Overhead
    /// per exposure is ignored; this is a planning estimate, not a promise.
    pub fn estimate_duration_secs(&self) -> f64 {
        let per_position: f64 = self
            .detconfig
            .iter()
            .map(|dc| dc.exptime_sec * dc.nexp as f64)
            .fold(0.0, f64::max);
        per_position * self.pattern.positions.len() as f64
    }

    pub fn to_header(&self) -> BTreeMap<String, String> {
        let mut h = BTreeMap::new();
        h.insert("OBTYPE".into(), self.blocktype.to_string());
        h.insert("OBJECT".into(), self.target.name.clone());
        h.insert("RA".into(), self.target.coord.ra_deg.to_string());
        h.insert("DEC".into(), self.target.coord.dec_deg.to_string());
        h.extend(self.instconfig.to_header());
        h
    }

    /// Comma-joined detector-config names, matching the original's
    /// execution-record row format.
    pub fn detconfig_names(&self) -> String {
        self.detconfig
            .iter()
            .map(|dc| dc.name.clone())
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_duration_is_positions_times_longest_detector() {
        let ob = ObservingBlock {
            blocktype: BlockType::Science,
            target: Target::new("M42", 83.8, -5.4),
            align: Align::Blind,
            pattern: Pattern::dither(3, 5.0),
            instconfig: InstrumentConfig {
                name: "L filter".into(),
                filter: "L".into(),
                focuser_positions: vec![1000.0],
                wavelength_nm: 550.0,
            },
            detconfig: vec![DetectorConfig {
                name: "cam0".into(),
                exptime_sec: 30.0,
                nexp: 2,
                gain: None,
                binning: (1, 1),
                window: None,
                readout_mode: ReadoutMode::Normal,
            }],
        };
        assert_eq!(ob.estimate_duration_secs(), 3.0 * 60.0);
    }
}
