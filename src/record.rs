//! Append-only execution record and per-state duration accounting (§3, I5).

use std::collections::BTreeMap;
use std::fmt;

use crate::model::ObservingBlock;
use crate::state::MachineState;

/// One completed (or failed) OB attempt.
#[derive(Debug, Clone)]
pub struct ExecutedRow {
    pub blocktype: String,
    pub target: String,
    pub pattern: String,
    pub instconfig: String,
    pub detconfig: String,
    pub failed: bool,
}

impl ExecutedRow {
    pub fn from_ob(ob: &ObservingBlock, failed: bool) -> Self {
        Self {
            blocktype: ob.blocktype.to_string(),
            target: ob.target.name.clone(),
            pattern: ob.pattern.name.clone(),
            instconfig: ob.instconfig.name.clone(),
            detconfig: ob.detconfig_names(),
            failed,
        }
    }
}

/// Cumulative seconds spent in each state, plus the executed-OB table.
/// Both are append-only in the order the driver thread produces them (I5).
#[derive(Debug, Default)]
pub struct ExecutionRecord {
    rows: Vec<ExecutedRow>,
    durations: BTreeMap<MachineState, f64>,
}

impl ExecutionRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_ob(&mut self, ob: &ObservingBlock, failed: bool) {
        self.rows.push(ExecutedRow::from_ob(ob, failed));
    }

    pub fn accumulate(&mut self, state: MachineState, secs: f64) {
        *self.durations.entry(state).or_insert(0.0) += secs;
    }

    pub fn rows(&self) -> &[ExecutedRow] {
        &self.rows
    }

    pub fn durations(&self) -> &BTreeMap<MachineState, f64> {
        &self.durations
    }

    pub fn total_duration(&self) -> f64 {
        self.durations.values().sum()
    }

    pub fn night_summary(&self, error_count: u32) -> NightSummary {
        NightSummary {
            rows: self.rows.clone(),
            durations: self.durations.clone(),
            error_count,
        }
    }
}

/// A rendered end-of-night report (§7): executed vs failed OBs, per-state
/// dwell times and percentages, total fault count.
pub struct NightSummary {
    rows: Vec<ExecutedRow>,
    durations: BTreeMap<MachineState, f64>,
    error_count: u32,
}

impl fmt::Display for NightSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total: f64 = self.durations.values().sum();
        writeln!(f, "====== Timing ======")?;
        for (state, secs) in &self.durations {
            let pct = if total > 0.0 { secs / total * 100.0 } else { 0.0 };
            writeln!(f, "  {state:13} {secs:8.0}s  {pct:5.1}%")?;
        }
        writeln!(f, "====== Observed ({} OBs, {} failed) ======", self.rows.len(), self.rows.iter().filter(|r| r.failed).count())?;
        for row in &self.rows {
            writeln!(
                f,
                "  {:10} {:15} {:10} failed={}",
                row.blocktype, row.target, row.pattern, row.failed
            )?;
        }
        writeln!(f, "====== Faults: {} ======", self.error_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Align, BlockType, DetectorConfig, InstrumentConfig, Pattern, ReadoutMode, Target};

    fn sample_ob() -> ObservingBlock {
        ObservingBlock {
            blocktype: BlockType::Science,
            target: Target::new("M42", 10.0, 10.0),
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
                exptime_sec: 1.0,
                nexp: 1,
                gain: None,
                binning: (1, 1),
                window: None,
                readout_mode: ReadoutMode::Normal,
            }],
        }
    }

    #[test]
    fn row_count_matches_recorded_obs() {
        let mut record = ExecutionRecord::new();
        record.record_ob(&sample_ob(), false);
        record.record_ob(&sample_ob(), true);
        assert_eq!(record.rows().len(), 2);
        assert!(record.rows()[1].failed);
    }

    #[test]
    fn durations_accumulate_across_multiple_visits_to_a_state() {
        let mut record = ExecutionRecord::new();
        record.accumulate(MachineState::Observing, 5.0);
        record.accumulate(MachineState::Observing, 2.5);
        assert_eq!(record.durations()[&MachineState::Observing], 7.5);
    }
}
