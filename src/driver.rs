//! Per-OB orchestration (§4.6): acquisition, both focus strategies, and the
//! per-position exposure fan-out/join. These are free functions rather than
//! a struct owning the devices, since the devices already live as distinct
//! fields on the runner — borrowing them individually lets the borrow
//! checker see the fan-out as disjoint from everything else the runner
//! holds, with no need for a `driver` object of its own.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use futures::future::join_all;

use crate::devices::{Detector, Header, ImageBundle, Instrument, Mount};
use crate::error::{Fault, FaultBook, HardwareFault, SoftwareFault};
use crate::model::{Align, DetectorConfig, FocusStrategy, ObservingBlock};
use crate::site::Site;

/// Ensures the mount is unparked and tracking, dispatches on the OB's
/// `align` variant, then configures the instrument (filter, focuser seed)
/// for the OB about to run. Returns `true` iff acquisition failed.
///
/// Before touching any hardware, projects the target to where it will be
/// once the OB's estimated duration has elapsed (§4.3) and refuses to
/// acquire a target that will have set by then.
pub async fn acquire(
    mount: &mut dyn Mount,
    instrument: &mut dyn Instrument,
    site: &Site,
    ob: &ObservingBlock,
    faults: &mut FaultBook,
) -> bool {
    let eta = Utc::now() + Duration::milliseconds((ob.estimate_duration_secs() * 1000.0) as i64);
    if site.below_horizon(&ob.target.coord, eta) {
        faults.record(Fault::Software(SoftwareFault::Acquisition(format!(
            "{} will be below the horizon before the OB completes",
            ob.target.name
        ))));
        return true;
    }
    if mount.at_park() {
        if let Err(e) = mount.unpark().await {
            faults.record(Fault::Hardware(e));
            return true;
        }
    }
    if !mount.tracking() {
        mount.set_tracking(true);
    }
    let slewed = match &ob.align {
        Align::Blind => match mount.slew(ob.target.coord).await {
            Ok(()) => true,
            Err(e) => {
                faults.record(Fault::Hardware(e));
                false
            }
        },
        // No mask-align in v1 (spec.md §4.6); any non-Blind variant is
        // recorded as an acquisition fault rather than attempted.
        Align::Mask => {
            faults.record(Fault::Software(SoftwareFault::Acquisition(
                "mask-align is not implemented".to_string(),
            )));
            false
        }
    };
    if !slewed {
        return true;
    }
    if let Err(e) = instrument.configure(&ob.instconfig).await {
        faults.record(Fault::Hardware(e));
        return true;
    }
    false
}

/// Estimates image sharpness at a given focuser position. Stands in for
/// the real image-analysis pipeline (out of scope, §1): a real
/// implementation would measure FWHM from the exposed frame.
pub trait FwhmEstimator: Send + Sync {
    fn estimate(&self, focuser_position: f64) -> f64;
}

/// A synthetic parabola-shaped FWHM curve centered on `best_position`.
pub struct SimulatedFwhmEstimator {
    pub best_position: f64,
    pub min_fwhm: f64,
    pub curvature: f64,
}

impl FwhmEstimator for SimulatedFwhmEstimator {
    fn estimate(&self, focuser_position: f64) -> f64 {
        self.min_fwhm + self.curvature * (focuser_position - self.best_position).powi(2)
    }
}

/// External focus-analysis adapter for `FocusMaxRun` (§4.6): `(instrument,
/// detector) → ok`. The real adapter lives outside this crate; only the
/// contract is specified, so the simulator below always reports success.
#[async_trait]
pub trait FocusMaxAdapter: Send + Sync {
    async fn evaluate(&mut self, instrument: &str, detector_index: usize) -> bool;
}

pub struct AlwaysOkFocusMaxAdapter;

#[async_trait]
impl FocusMaxAdapter for AlwaysOkFocusMaxAdapter {
    async fn evaluate(&mut self, _instrument: &str, _detector_index: usize) -> bool {
        true
    }
}

/// Runs the OB's focus strategy, leaving the instrument's focuser at the
/// resolved best position. Returns `Err` (focus failed) per §4.6's failure
/// sources: fewer than 5 valid points, non-concave fit, or hardware fault.
pub async fn run_focus(
    instrument: &mut dyn Instrument,
    detector: &mut dyn Detector,
    fwhm: &dyn FwhmEstimator,
    focus_adapter: &mut dyn FocusMaxAdapter,
    instrument_name: &str,
    strategy: &FocusStrategy,
    faults: &mut FaultBook,
) -> Result<f64, SoftwareFault> {
    match strategy {
        FocusStrategy::FitParabola {
            n_focus_positions,
            focus_step,
            images_per_position,
            refocus_if_near_edge,
        } => {
            let center = instrument.focuser_position();
            let mut fit = fit_parabola_focus(
                instrument,
                detector,
                fwhm,
                center,
                *n_focus_positions,
                *focus_step,
                *images_per_position,
                faults,
            )
            .await?;

            if *refocus_if_near_edge {
                if let Some(shifted_center) = fit.near_edge_shift {
                    fit = fit_parabola_focus(
                        instrument,
                        detector,
                        fwhm,
                        shifted_center,
                        *n_focus_positions,
                        *focus_step,
                        *images_per_position,
                        faults,
                    )
                    .await?;
                }
            }

            instrument
                .move_focuser(fit.x0)
                .await
                .map_err(|e| SoftwareFault::FocusRun(e.to_string()))?;
            Ok(fit.x0)
        }
        FocusStrategy::MaxRun => {
            if focus_adapter.evaluate(instrument_name, 0).await {
                Ok(instrument.focuser_position())
            } else {
                Err(SoftwareFault::FocusRun("focus-max-run adapter reported failure".to_string()))
            }
        }
    }
}

struct ParabolaFit {
    x0: f64,
    /// `Some(new_center)` when `x0` landed within one step of the sampled
    /// range and the caller asked for a re-focus pass.
    near_edge_shift: Option<f64>,
}

/// Samples `n_focus_positions` symmetric steps around `center`, measuring
/// `images_per_position` exposures at each, then fits `FWHM = a(x-x0)^2+c`.
#[allow(clippy::too_many_arguments)]
async fn fit_parabola_focus(
    instrument: &mut dyn Instrument,
    detector: &mut dyn Detector,
    fwhm: &dyn FwhmEstimator,
    center: f64,
    n_focus_positions: u32,
    focus_step: f64,
    images_per_position: u32,
    faults: &mut FaultBook,
) -> Result<ParabolaFit, SoftwareFault> {
    let half = (n_focus_positions as f64 - 1.0) / 2.0;
    let mut points = Vec::with_capacity(n_focus_positions as usize);

    for i in 0..n_focus_positions {
        let position = center + (i as f64 - half) * focus_step;
        if let Err(e) = instrument.move_focuser(position).await {
            faults.record(Fault::Hardware(e));
            continue;
        }

        let mut samples = Vec::with_capacity(images_per_position as usize);
        for k in 1..=images_per_position {
            let mut header = Header::new();
            header.insert("FOCUSPOS".into(), position.to_string());
            header.insert("FOCUSIMG".into(), k.to_string());
            match detector.expose(header).await {
                Ok(_bundle) => samples.push(fwhm.estimate(position)),
                Err(e) => faults.record(Fault::Hardware(e)),
            }
        }
        if !samples.is_empty() {
            let mean = samples.iter().sum::<f64>() / samples.len() as f64;
            points.push((position, mean));
        }
    }

    if points.len() < 5 {
        return Err(SoftwareFault::FocusRun(format!(
            "only {} valid focus points, need at least 5",
            points.len()
        )));
    }

    let (a, b, c) = fit_quadratic(&points)
        .ok_or_else(|| SoftwareFault::FocusRun("focus curve fit is singular".to_string()))?;
    if a <= 0.0 {
        return Err(SoftwareFault::FocusRun("focus curve is not concave".to_string()));
    }
    let x0 = -b / (2.0 * a);
    let _ = c;

    let lo = points.iter().map(|(x, _)| *x).fold(f64::INFINITY, f64::min);
    let hi = points.iter().map(|(x, _)| *x).fold(f64::NEG_INFINITY, f64::max);
    let near_edge_shift = if x0 < lo + focus_step {
        Some(center - half * focus_step)
    } else if x0 > hi - focus_step {
        Some(center + half * focus_step)
    } else {
        None
    };

    Ok(ParabolaFit { x0, near_edge_shift })
}

/// Least-squares fit of `y = a*x^2 + b*x + c` via the normal equations,
/// solved directly since the corpus carries no linear-algebra crate.
fn fit_quadratic(points: &[(f64, f64)]) -> Option<(f64, f64, f64)> {
    if points.len() < 3 {
        return None;
    }
    let n = points.len() as f64;
    let (mut sx, mut sx2, mut sx3, mut sx4, mut sy, mut sxy, mut sx2y) =
        (0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0);
    for &(x, y) in points {
        let x2 = x * x;
        let x3 = x2 * x;
        let x4 = x2 * x2;
        sx += x;
        sx2 += x2;
        sx3 += x3;
        sx4 += x4;
        sy += y;
        sxy += x * y;
        sx2y += x2 * y;
    }
    let m = [[sx4, sx3, sx2], [sx3, sx2, sx], [sx2, sx, n]];
    let b = [sx2y, sxy, sy];
    solve_3x3(m, b)
}

fn solve_3x3(m: [[f64; 3]; 3], b: [f64; 3]) -> Option<(f64, f64, f64)> {
    let det = det3(m);
    if det.abs() < 1e-9 {
        return None;
    }
    let mut m_a = m;
    let mut m_b = m;
    let mut m_c = m;
    for row in 0..3 {
        m_a[row][0] = b[row];
        m_b[row][1] = b[row];
        m_c[row][2] = b[row];
    }
    Some((det3(m_a) / det, det3(m_b) / det, det3(m_c) / det))
}

fn det3(m: [[f64; 3]; 3]) -> f64 {
    m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
        - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
}

/// Runs the per-position exposure fan-out of §4.6/I6: every detector is
/// set up and exposed `nexp` times at each pattern position, joined before
/// the cursor advances. Returns `true` iff the OB failed (some detector
/// produced zero successful exposures at some position).
pub async fn observe(
    mount: &dyn Mount,
    instrument: &dyn Instrument,
    detectors: &mut [Box<dyn Detector>],
    ob: &ObservingBlock,
    datadir: &Path,
    faults: &mut FaultBook,
) -> bool {
    let mut ob_failed = false;

    for (pos_idx, position) in ob.pattern.positions.iter().enumerate() {
        let mut base_header = ob.to_header();
        base_header.extend(mount.collect_header_metadata());
        base_header.extend(instrument.collect_header_metadata());
        base_header.insert("POSITION".into(), (pos_idx + 1).to_string());
        base_header.insert("GUIDE".into(), position.guide.to_string());

        let instrument_name = ob.instconfig.name.clone();
        let detconfig = &ob.detconfig;

        let results = join_all(detectors.iter_mut().enumerate().map(|(j, det)| {
            let header = base_header.clone();
            let dc = detconfig.get(j).cloned();
            let instrument_name = instrument_name.clone();
            let datadir = datadir.to_path_buf();
            async move { expose_one_detector(det.as_mut(), j, dc, header, &datadir, &instrument_name).await }
        }))
        .await;

        for (success, detector_faults) in results {
            if success == 0 {
                ob_failed = true;
            }
            for fault in detector_faults {
                faults.record(Fault::Hardware(fault));
            }
        }
    }

    ob_failed
}

/// `setup` then `nexp` exposures on a single detector, persisting each
/// successful image-bundle. Returns the count of successful exposures and
/// any faults raised along the way.
async fn expose_one_detector(
    det: &mut dyn Detector,
    index: usize,
    dc: Option<DetectorConfig>,
    header: Header,
    datadir: &Path,
    instrument_name: &str,
) -> (u32, Vec<HardwareFault>) {
    let mut raised = Vec::new();
    let Some(dc) = dc else {
        raised.push(HardwareFault::Detector(format!(
            "no detector_config configured for detector {index}"
        )));
        return (0, raised);
    };

    if let Err(e) = det.setup(&dc).await {
        raised.push(e);
        return (0, raised);
    }

    let mut success = 0;
    for expno in 1..=dc.nexp {
        let mut h = header.clone();
        h.extend(dc.to_header());
        h.insert("EXPNO".into(), expno.to_string());
        match det.expose(h).await {
            Ok(bundle) => match persist_image(&bundle, datadir, instrument_name, index) {
                Ok(_path) => success += 1,
                Err(io_err) => raised.push(HardwareFault::Detector(format!(
                    "cam{index} image persist failed: {io_err}"
                ))),
            },
            Err(e) => raised.push(e),
        }
    }
    (success, raised)
}

/// Writes a placeholder image-bundle under `datadir`, failing rather than
/// overwriting an existing file (§6 "Image filenames").
fn persist_image(
    bundle: &ImageBundle,
    datadir: &Path,
    instrument_name: &str,
    det_index: usize,
) -> std::io::Result<PathBuf> {
    use std::io::Write;

    std::fs::create_dir_all(datadir)?;
    let stamp = chrono::Utc::now().format("%Y%m%d_at_%H%M%S");
    let filename = format!("{instrument_name}_{det_index}_{stamp}UT.fits");
    let path = datadir.join(filename);
    let mut file = std::fs::OpenOptions::new().write(true).create_new(true).open(&path)?;
    for (key, value) in &bundle.header {
        writeln!(file, "{key}={value}")?;
    }
    file.write_all(&bundle.pixels)?;
    Ok(path)
}
