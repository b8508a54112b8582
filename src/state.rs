//! The sequencer's state set (§3, §4.5).

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MachineState {
    Sleeping,
    Opening,
    WaitingOpen,
    WaitingClosed,
    Acquiring,
    Focusing,
    Observing,
    Parking,
    Closing,
    /// Terminal: normal end of night.
    Pau,
    /// Terminal: unrecoverable.
    Alert,
}

impl MachineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, MachineState::Pau | MachineState::Alert)
    }

    /// I4: the mount must be parked whenever in one of these states.
    pub fn requires_parked_mount(self) -> bool {
        matches!(self, MachineState::Sleeping | MachineState::Pau | MachineState::Alert)
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MachineState::Sleeping => "sleeping",
            MachineState::Opening => "opening",
            MachineState::WaitingOpen => "waiting_open",
            MachineState::WaitingClosed => "waiting_closed",
            MachineState::Acquiring => "acquiring",
            MachineState::Focusing => "focusing",
            MachineState::Observing => "observing",
            MachineState::Parking => "parking",
            MachineState::Closing => "closing",
            MachineState::Pau => "pau",
            MachineState::Alert => "alert",
        };
        write!(f, "{s}")
    }
}
