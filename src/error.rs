//! Fault taxonomy and the running fault ledger.
//!
//! Faults are split into two taxa per spec: hardware faults raised by a
//! device port, and software faults raised by the sequencer's own logic
//! (scheduling, acquisition bookkeeping, focus analysis). Only hardware
//! faults and the error budget drive `we_are_done`; software faults are
//! recorded but only ≥10 consecutive `SchedulingFault`s force exhaustion.

use thiserror::Error;

/// A fault raised by a device driver.
#[derive(Debug, Clone, Error)]
pub enum HardwareFault {
    #[error("roof fault: {0}")]
    Roof(String),
    #[error("mount fault: {0}")]
    Mount(String),
    #[error("instrument fault: {0}")]
    Instrument(String),
    #[error("detector fault: {0}")]
    Detector(String),
    #[error("focuser fault: {0}")]
    Focuser(String),
}

/// A fault raised by sequencer logic rather than a device.
#[derive(Debug, Clone, Error)]
pub enum SoftwareFault {
    #[error("scheduling fault: {0}")]
    Scheduling(String),
    #[error("acquisition fault: {0}")]
    Acquisition(String),
    #[error("focus run fault: {0}")]
    FocusRun(String),
}

/// Either taxon, for the book's single append point.
#[derive(Debug, Clone, Error)]
pub enum Fault {
    #[error(transparent)]
    Hardware(#[from] HardwareFault),
    #[error(transparent)]
    Software(#[from] SoftwareFault),
}

impl Fault {
    /// True for the hardware taxon, which counts against the error budget.
    pub fn is_hardware(&self) -> bool {
        matches!(self, Fault::Hardware(_))
    }

    pub fn is_roof(&self) -> bool {
        matches!(self, Fault::Hardware(HardwareFault::Roof(_)))
    }

    pub fn is_scheduling(&self) -> bool {
        matches!(self, Fault::Software(SoftwareFault::Scheduling(_)))
    }

    pub fn is_acquisition(&self) -> bool {
        matches!(self, Fault::Software(SoftwareFault::Acquisition(_)))
    }

    pub fn is_focus_run(&self) -> bool {
        matches!(self, Fault::Software(SoftwareFault::FocusRun(_)))
    }
}

/// Append-only fault ledger plus the budget that governs shutdown (I3).
#[derive(Debug, Default)]
pub struct FaultBook {
    hardware_errors: Vec<HardwareFault>,
    software_errors: Vec<SoftwareFault>,
    error_count: u32,
    allowed_errors: u32,
    consecutive_scheduling_faults: u32,
}

impl FaultBook {
    pub fn new(allowed_errors: u32) -> Self {
        Self {
            allowed_errors,
            ..Default::default()
        }
    }

    /// Record a fault. Returns true if, after recording, the error budget
    /// has been exceeded (I3) — the caller must then set `we_are_done`.
    pub fn record(&mut self, fault: Fault) -> bool {
        match &fault {
            Fault::Hardware(h) => {
                self.hardware_errors.push(h.clone());
                self.error_count += 1;
            }
            Fault::Software(s) => {
                self.software_errors.push(s.clone());
                if matches!(s, SoftwareFault::Scheduling(_)) {
                    self.consecutive_scheduling_faults += 1;
                } else {
                    self.consecutive_scheduling_faults = 0;
                }
            }
        }
        self.error_count > self.allowed_errors
    }

    /// §4.4: ≥10 consecutive scheduling faults signal queue exhaustion.
    pub fn scheduler_exhausted(&self) -> bool {
        self.consecutive_scheduling_faults >= 10
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    pub fn allowed_errors(&self) -> u32 {
        self.allowed_errors
    }

    pub fn hardware_errors(&self) -> &[HardwareFault] {
        &self.hardware_errors
    }

    pub fn software_errors(&self) -> &[SoftwareFault] {
        &self.software_errors
    }

    pub fn software_len(&self) -> usize {
        self.software_errors.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_trips_after_allowed_errors() {
        let mut book = FaultBook::new(1);
        assert!(!book.record(Fault::Hardware(HardwareFault::Roof("timeout".into()))));
        assert!(book.record(Fault::Hardware(HardwareFault::Mount("slew".into()))));
        assert_eq!(book.error_count(), 2);
    }

    #[test]
    fn software_faults_do_not_count_against_budget() {
        let mut book = FaultBook::new(0);
        for _ in 0..5 {
            book.record(Fault::Software(SoftwareFault::Scheduling("empty queue".into())));
        }
        assert_eq!(book.error_count(), 0);
        assert!(!book.scheduler_exhausted());
        for _ in 0..5 {
            book.record(Fault::Software(SoftwareFault::Scheduling("empty queue".into())));
        }
        assert!(book.scheduler_exhausted());
    }

    #[test]
    fn non_scheduling_software_fault_resets_streak() {
        let mut book = FaultBook::new(0);
        for _ in 0..9 {
            book.record(Fault::Software(SoftwareFault::Scheduling("empty".into())));
        }
        book.record(Fault::Software(SoftwareFault::Acquisition("bad align".into())));
        assert!(!book.scheduler_exhausted());
    }
}
