//! Top-level runner (§2 "Top-level runner", §6 "CLI / entry"): owns every
//! device, the scheduler, the sky oracle and the machine core, and exposes
//! the single `wake_up()` entry point that drives the queued-trigger
//! dispatch loop to completion.

use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::config::SequencerConfig;
use crate::devices::{Detector, Instrument, Mount, Roof, Weather};
use crate::driver::{self, AlwaysOkFocusMaxAdapter, FocusMaxAdapter, FwhmEstimator, SimulatedFwhmEstimator};
use crate::error::{Fault, FaultBook};
use crate::machine::{resolve_transition, Guards, MachineCore, Trigger};
use crate::model::BlockType;
use crate::record::ExecutionRecord;
use crate::scheduler::Scheduler;
use crate::site::{Site, SkyOracle};
use crate::state::MachineState;

/// Owns the whole night: devices, machine, fault book, execution record.
/// Constructed once per run; `wake_up()` drives it to a terminal state.
pub struct RollOffRoof {
    datadir: PathBuf,
    waittime_secs: f64,
    maxwait_secs: f64,
    site: Site,

    weather: Box<dyn Weather>,
    roof: Box<dyn Roof>,
    mount: Box<dyn Mount>,
    instrument: Box<dyn Instrument>,
    detectors: Vec<Box<dyn Detector>>,

    scheduler: Box<dyn Scheduler>,
    sky: Box<dyn SkyOracle>,
    fwhm: Box<dyn FwhmEstimator>,
    focus_adapter: Box<dyn FocusMaxAdapter>,

    core: MachineCore,
    faults: FaultBook,
    record: ExecutionRecord,

    current_ob: Option<crate::model::ObservingBlock>,
    we_are_done: bool,
    acquisition_failed: bool,
    focus_failed: bool,
    last_open_ok: bool,
    last_close_ok: bool,
    unsafe_since: Option<DateTime<Utc>>,
}

impl RollOffRoof {
    pub fn new(config: SequencerConfig, scheduler: Box<dyn Scheduler>, sky: Box<dyn SkyOracle>) -> Self {
        let focus_positions = Vec::new();
        Self::with_focus_collaborators(
            config,
            scheduler,
            sky,
            Box::new(SimulatedFwhmEstimator {
                best_position: focus_positions.first().copied().unwrap_or(0.0),
                min_fwhm: 1.5,
                curvature: 0.002,
            }),
            Box::new(AlwaysOkFocusMaxAdapter),
        )
    }

    /// Constructs with explicit focus collaborators, for callers (tests,
    /// or a future real image-analysis adapter) that need to override the
    /// defaults `new` picks.
    pub fn with_focus_collaborators(
        config: SequencerConfig,
        scheduler: Box<dyn Scheduler>,
        sky: Box<dyn SkyOracle>,
        fwhm: Box<dyn FwhmEstimator>,
        focus_adapter: Box<dyn FocusMaxAdapter>,
    ) -> Self {
        Self {
            datadir: config.datadir,
            waittime_secs: config.waittime_secs,
            maxwait_secs: config.maxwait_secs,
            site: config.site,
            weather: config.weather,
            roof: config.roof,
            mount: config.mount,
            instrument: config.instrument,
            detectors: config.detectors,
            scheduler,
            sky,
            fwhm,
            focus_adapter,
            core: MachineCore::new(MachineState::Sleeping),
            faults: FaultBook::new(config.max_allowed_errors),
            record: ExecutionRecord::new(),
            current_ob: None,
            we_are_done: false,
            acquisition_failed: false,
            focus_failed: false,
            last_open_ok: true,
            last_close_ok: true,
            unsafe_since: None,
        }
    }

    pub fn state(&self) -> MachineState {
        self.core.state()
    }

    pub fn fault_book(&self) -> &FaultBook {
        &self.faults
    }

    pub fn execution_record(&self) -> &ExecutionRecord {
        &self.record
    }

    /// Fires `wake_up` and drains the trigger queue until it runs dry —
    /// which only happens once the machine has reached a terminal state,
    /// since every on-entry action above fires its own follow-up trigger.
    #[tracing::instrument(skip(self))]
    pub async fn wake_up(&mut self) -> MachineState {
        self.core.fire(Trigger::WakeUp);
        self.drain().await;
        self.core.state()
    }

    async fn drain(&mut self) {
        while let Some(trigger) = self.core.pop_trigger() {
            self.core.set_processing(true);
            self.dispatch(trigger).await;
            self.core.set_processing(false);
        }
    }

    async fn dispatch(&mut self, trigger: Trigger) {
        let source = self.core.state();
        let guards = self.build_guards().await;
        let Some(dest) = resolve_transition(trigger, source, &guards) else {
            return;
        };
        let elapsed = self.core.enter(dest);
        self.record.accumulate(source, elapsed);
        tracing::debug!(?source, ?dest, "transition");
        self.on_enter(dest).await;
    }

    /// Evaluates every guard predicate used anywhere in §4.5's table. Guard
    /// values not relevant to the current `(trigger, source)` pair are
    /// simply unused by `resolve_transition` — computing all of them
    /// unconditionally keeps this the only place device state is read for
    /// transition purposes.
    async fn build_guards(&mut self) -> Guards {
        let is_safe = self.weather.is_safe().await;
        let now = Utc::now();

        if is_safe {
            self.unsafe_since = None;
        } else if self.unsafe_since.is_none() {
            self.unsafe_since = Some(now);
        }
        let long_wait = self
            .unsafe_since
            .map(|since| (now - since).num_milliseconds() as f64 / 1000.0 >= self.maxwait_secs)
            .unwrap_or(false);

        let is_dark = self.sky.is_dark(now);
        let done_observing = self.we_are_done || self.faults.scheduler_exhausted();
        let focus_next = matches!(
            self.current_ob.as_ref().map(|ob| &ob.blocktype),
            Some(BlockType::Focus(_))
        );

        Guards {
            is_safe,
            is_unsafe: !is_safe,
            is_dark,
            done_observing,
            not_done_observing: !done_observing,
            have_target: self.current_ob.is_some(),
            no_roof_error: self.last_open_ok,
            roof_err: !self.last_close_ok,
            ready_to_open: is_safe && is_dark && !done_observing,
            long_wait,
            acquisition_failed: self.acquisition_failed,
            focus_next,
            focus_failed: self.focus_failed,
        }
    }

    #[tracing::instrument(skip(self))]
    async fn on_enter(&mut self, dest: MachineState) {
        match dest {
            MachineState::Sleeping => {}

            MachineState::Opening => {
                match self.roof.open().await {
                    Ok(()) => self.last_open_ok = true,
                    Err(e) => {
                        self.last_open_ok = false;
                        if self.faults.record(Fault::Hardware(e)) {
                            self.we_are_done = true;
                        }
                    }
                }
                self.core.fire(Trigger::DoneOpening);
            }

            MachineState::WaitingClosed => {
                tokio::time::sleep(std::time::Duration::from_secs_f64(self.waittime_secs)).await;
                self.pop_ob_if_needed();
                self.core.fire(Trigger::DoneWaiting);
            }

            MachineState::WaitingOpen => {
                tokio::time::sleep(std::time::Duration::from_secs_f64(self.waittime_secs)).await;
                self.pop_ob_if_needed();
                self.core.fire(Trigger::Acquire);
            }

            MachineState::Acquiring => {
                self.acquisition_failed = false;
                if let Some(ob) = self.current_ob.as_ref() {
                    let ob = ob.clone();
                    self.acquisition_failed = driver::acquire(
                        self.mount.as_mut(),
                        self.instrument.as_mut(),
                        &self.site,
                        &ob,
                        &mut self.faults,
                    )
                    .await;
                }
                // A failed acquisition never reaches focusing/observing, so
                // it gets no execution-record row (P4) — drop it so the
                // next `waiting_open` cycle pulls a fresh OB instead of
                // retrying the same target forever.
                if self.acquisition_failed {
                    self.current_ob = None;
                }
                self.core.fire(Trigger::DoneAcquiring);
            }

            MachineState::Focusing => {
                self.focus_failed = false;
                if let Some(ob) = self.current_ob.take() {
                    if let BlockType::Focus(strategy) = &ob.blocktype {
                        let outcome = match self.detectors.first_mut() {
                            Some(detector) => {
                                driver::run_focus(
                                    self.instrument.as_mut(),
                                    detector.as_mut(),
                                    self.fwhm.as_ref(),
                                    self.focus_adapter.as_mut(),
                                    &ob.instconfig.name,
                                    strategy,
                                    &mut self.faults,
                                )
                                .await
                            }
                            None => Err(crate::error::SoftwareFault::FocusRun(
                                "no detector configured to measure focus quality".to_string(),
                            )),
                        };
                        if let Err(e) = outcome {
                            self.focus_failed = true;
                            self.faults.record(Fault::Software(e));
                        }
                    }
                    self.record.record_ob(&ob, self.focus_failed);
                }
                self.core.fire(Trigger::FocusingComplete);
            }

            MachineState::Observing => {
                if let Some(ob) = self.current_ob.take() {
                    let failed = driver::observe(
                        self.mount.as_ref(),
                        self.instrument.as_ref(),
                        &mut self.detectors,
                        &ob,
                        &self.datadir,
                        &mut self.faults,
                    )
                    .await;
                    self.record.record_ob(&ob, failed);
                }
                self.core.fire(Trigger::ObservationComplete);
            }

            MachineState::Parking => {
                // A park fault is fatal (§4.5 "fatal-on-fault") but, like a
                // roof-open fault, still advances via the state's own
                // `done_*` trigger rather than stalling the machine.
                if let Err(e) = self.mount.park().await {
                    self.faults.record(Fault::Hardware(e));
                    self.we_are_done = true;
                }
                self.core.fire(Trigger::DoneParking);
            }

            MachineState::Closing => {
                match self.roof.close().await {
                    Ok(()) => self.last_close_ok = true,
                    Err(e) => {
                        self.last_close_ok = false;
                        // A roof-close fault is always fatal (§4.4, §7).
                        self.faults.record(Fault::Hardware(e));
                        self.we_are_done = true;
                    }
                }
                self.core.fire(Trigger::DoneClosing);
            }

            MachineState::Pau | MachineState::Alert => {
                let summary = self.record.night_summary(self.faults.error_count());
                tracing::info!(state = %dest, "{}", summary);
            }
        }
    }

    fn pop_ob_if_needed(&mut self) {
        if self.current_ob.is_some() || self.we_are_done {
            return;
        }
        match self.scheduler.select() {
            Ok(ob) => self.current_ob = Some(ob),
            Err(e) => {
                self.faults.record(Fault::Software(e));
                if self.faults.scheduler_exhausted() {
                    self.we_are_done = true;
                }
            }
        }
    }
}

/// Process exit code per §6: `0` on `pau`, `2` on `alert`. Any other final
/// state is unreachable by construction (P1) but mapped to `1` defensively.
pub fn exit_code(state: MachineState) -> i32 {
    match state {
        MachineState::Pau => 0,
        MachineState::Alert => 2,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::registry::DeviceRegistry;
    use crate::model::{Align, DetectorConfig, FocusStrategy, InstrumentConfig, ObservingBlock, Pattern, ReadoutMode, Target};
    use crate::scheduler::FifoScheduler;
    use crate::site::TimerSkyOracle;

    fn write_happy_path_config(dir: &std::path::Path, safety_file: &std::path::Path) -> PathBuf {
        let path = dir.join("config.yaml");
        let yaml = format!(
            r#"
name: testobs
OTA: OTA1
datadir: {datadir}
waittime: 0
maxwait: 0.2
max_allowed_errors: 1
lat: 20.0
lon: -155.0
height: 3000.0
horizon: -90.0
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

    fn sample_science_ob(name: &str) -> ObservingBlock {
        ObservingBlock {
            blocktype: crate::model::BlockType::Science,
            target: Target::new(name, 10.0, 10.0),
            align: Align::Blind,
            pattern: Pattern::stare(),
            instconfig: InstrumentConfig {
                name: "L".into(),
                filter: "L".into(),
                focuser_positions: vec![1000.0],
                wavelength_nm: 550.0,
            },
            detconfig: vec![DetectorConfig {
                name: "cam0".into(),
                exptime_sec: 0.0,
                nexp: 1,
                gain: None,
                binning: (1, 1),
                window: None,
                readout_mode: ReadoutMode::Normal,
            }],
        }
    }

    fn sample_focus_ob() -> ObservingBlock {
        let mut ob = sample_science_ob("focus-star");
        ob.blocktype = crate::model::BlockType::Focus(FocusStrategy::FitParabola {
            n_focus_positions: 5,
            focus_step: 10.0,
            images_per_position: 1,
            refocus_if_near_edge: false,
        });
        ob
    }

    #[tokio::test]
    async fn happy_path_reaches_pau_with_no_faults() {
        let dir = tempfile::tempdir().unwrap();
        let safety_file = dir.path().join("safe.txt");
        std::fs::write(&safety_file, "2020-01-01T00:00:00 safe\n").unwrap();
        let config_path = write_happy_path_config(dir.path(), &safety_file);
        let registry = DeviceRegistry::default();
        let config = crate::config::load_config(&config_path, &registry).unwrap();
        let maxwait = config.maxwait_secs;

        let obs = vec![sample_focus_ob(), sample_science_ob("A"), sample_science_ob("B"), sample_science_ob("C")];
        let scheduler = Box::new(FifoScheduler::new(obs));
        let sky = Box::new(TimerSkyOracle::new(Utc::now(), maxwait));

        let mut roof = RollOffRoof::new(config, scheduler, sky);
        let final_state = roof.wake_up().await;

        assert_eq!(final_state, MachineState::Pau);
        assert_eq!(roof.fault_book().error_count(), 0);
        assert_eq!(roof.execution_record().rows().len(), 4);
        assert!(roof.execution_record().rows().iter().all(|r| !r.failed));
    }

    #[tokio::test]
    async fn roof_open_failure_ends_pau_without_opening() {
        let dir = tempfile::tempdir().unwrap();
        let safety_file = dir.path().join("safe.txt");
        std::fs::write(&safety_file, "2020-01-01T00:00:00 safe\n").unwrap();
        let config_path = write_happy_path_config(dir.path(), &safety_file);
        let text = std::fs::read_to_string(&config_path).unwrap();
        let text = text.replace("roof_config: {}", "roof_config: {open_fail_after: 0}");
        std::fs::write(&config_path, text).unwrap();

        let registry = DeviceRegistry::default();
        let config = crate::config::load_config(&config_path, &registry).unwrap();
        let maxwait = config.maxwait_secs;
        let scheduler = Box::new(FifoScheduler::new(vec![sample_science_ob("A")]));
        let sky = Box::new(TimerSkyOracle::new(Utc::now(), maxwait));

        let mut roof = RollOffRoof::new(config, scheduler, sky);
        let final_state = roof.wake_up().await;

        assert_eq!(final_state, MachineState::Pau);
        assert_eq!(roof.fault_book().error_count(), 1);
        assert!(roof.execution_record().rows().is_empty());
    }

    #[tokio::test]
    async fn roof_close_failure_ends_alert() {
        let dir = tempfile::tempdir().unwrap();
        let safety_file = dir.path().join("safe.txt");
        std::fs::write(&safety_file, "2020-01-01T00:00:00 safe\n").unwrap();
        let config_path = write_happy_path_config(dir.path(), &safety_file);
        let text = std::fs::read_to_string(&config_path).unwrap();
        let text = text.replace("roof_config: {}", "roof_config: {close_fail_after: 0}");
        std::fs::write(&config_path, text).unwrap();

        let registry = DeviceRegistry::default();
        let config = crate::config::load_config(&config_path, &registry).unwrap();
        let maxwait = config.maxwait_secs;
        let scheduler = Box::new(FifoScheduler::new(vec![sample_science_ob("A")]));
        let sky = Box::new(TimerSkyOracle::new(Utc::now(), maxwait));

        let mut roof = RollOffRoof::new(config, scheduler, sky);
        let final_state = roof.wake_up().await;

        assert_eq!(final_state, MachineState::Alert);
        assert!(roof.fault_book().error_count() >= 1);
    }

    #[tokio::test]
    async fn scheduler_exhaustion_ends_pau() {
        let dir = tempfile::tempdir().unwrap();
        let safety_file = dir.path().join("safe.txt");
        std::fs::write(&safety_file, "2020-01-01T00:00:00 safe\n").unwrap();
        let config_path = write_happy_path_config(dir.path(), &safety_file);
        let text = std::fs::read_to_string(&config_path).unwrap();
        let text = text.replace("maxwait: 0.2", "maxwait: 0.05");
        std::fs::write(&config_path, text).unwrap();

        let registry = DeviceRegistry::default();
        let config = crate::config::load_config(&config_path, &registry).unwrap();
        let maxwait = config.maxwait_secs;
        let scheduler = Box::new(FifoScheduler::new(vec![sample_science_ob("A"), sample_science_ob("B")]));
        let sky = Box::new(TimerSkyOracle::new(Utc::now(), maxwait));

        let mut roof = RollOffRoof::new(config, scheduler, sky);
        let final_state = roof.wake_up().await;

        assert_eq!(final_state, MachineState::Pau);
        assert!(roof.execution_record().rows().len() <= 2);
    }
}
