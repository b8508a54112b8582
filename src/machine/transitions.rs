//! The transition table of §4.5, as an exhaustive, order-preserving match.
//! Where the spec lists more than one guarded destination for a trigger,
//! the declaration order below is the tie-break, matching spec.md's
//! "Tie-break: when multiple guards hold, the declaration order above
//! wins."

use crate::state::MachineState;
use MachineState::*;

use super::Trigger;

/// Snapshot of every guard predicate needed to resolve a transition.
/// Guards that call a device (`is_safe`) are evaluated by the runner
/// *before* this snapshot is built, since device calls are async and this
/// resolver is not — keeping the transition table itself pure and total.
#[derive(Debug, Clone, Copy, Default)]
pub struct Guards {
    pub is_safe: bool,
    pub is_unsafe: bool,
    pub is_dark: bool,
    pub done_observing: bool,
    pub not_done_observing: bool,
    pub have_target: bool,
    pub no_roof_error: bool,
    pub roof_err: bool,
    pub ready_to_open: bool,
    pub long_wait: bool,
    pub acquisition_failed: bool,
    pub focus_next: bool,
    pub focus_failed: bool,
}

/// Resolve `(trigger, source)` to a destination state under `guards`.
///
/// Returns `None` if the trigger does not apply from `source` at all
/// (e.g. `Acquire` fired while in `Sleeping`) — the caller should treat
/// this as a no-op, not a fault.
pub fn resolve_transition(trigger: Trigger, source: MachineState, guards: &Guards) -> Option<MachineState> {
    match (trigger, source) {
        (Trigger::WakeUp, Sleeping) => {
            if guards.is_safe && guards.is_dark && guards.not_done_observing {
                Some(Opening)
            } else {
                Some(Pau)
            }
        }
        (Trigger::DoneOpening, Opening) => {
            if guards.no_roof_error {
                Some(WaitingOpen)
            } else {
                Some(Parking)
            }
        }
        (Trigger::DoneWaiting, WaitingClosed) => {
            if guards.ready_to_open {
                Some(Opening)
            } else if guards.done_observing || !guards.is_dark || guards.long_wait {
                Some(Parking)
            } else {
                Some(WaitingClosed)
            }
        }
        (Trigger::Acquire, WaitingOpen) => {
            if guards.have_target && guards.is_safe && guards.not_done_observing {
                Some(Acquiring)
            } else if guards.is_unsafe {
                Some(WaitingClosed)
            } else if guards.done_observing {
                Some(Parking)
            } else {
                Some(WaitingOpen)
            }
        }
        (Trigger::DoneAcquiring, Acquiring) => {
            if guards.focus_next && !guards.acquisition_failed {
                Some(Focusing)
            } else if !guards.focus_next && !guards.acquisition_failed {
                Some(Observing)
            } else {
                Some(WaitingOpen)
            }
        }
        (Trigger::FocusingComplete, Focusing) => {
            if !guards.focus_failed {
                Some(Observing)
            } else {
                Some(WaitingOpen)
            }
        }
        (Trigger::ObservationComplete, Observing) => Some(WaitingOpen),
        (Trigger::DoneParking, Parking) => Some(Closing),
        (Trigger::DoneClosing, Closing) => {
            if guards.roof_err {
                Some(Alert)
            } else {
                Some(Pau)
            }
        }
        (Trigger::Panic, s) if !s.is_terminal() => Some(Parking),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wakeup_opens_when_safe_dark_and_not_done() {
        let guards = Guards {
            is_safe: true,
            is_dark: true,
            not_done_observing: true,
            ..Default::default()
        };
        assert_eq!(resolve_transition(Trigger::WakeUp, Sleeping, &guards), Some(Opening));
    }

    #[test]
    fn wakeup_goes_straight_to_pau_otherwise() {
        let guards = Guards::default();
        assert_eq!(resolve_transition(Trigger::WakeUp, Sleeping, &guards), Some(Pau));
    }

    #[test]
    fn acquire_prefers_acquiring_when_both_have_target_and_unsafe_hold() {
        // have_target+is_safe+not_done_observing wins over is_unsafe by
        // declaration order even if is_unsafe were (incoherently) also set.
        let guards = Guards {
            have_target: true,
            is_safe: true,
            not_done_observing: true,
            ..Default::default()
        };
        assert_eq!(resolve_transition(Trigger::Acquire, WaitingOpen, &guards), Some(Acquiring));
    }

    #[test]
    fn panic_parks_from_any_nonterminal_state() {
        let guards = Guards::default();
        assert_eq!(resolve_transition(Trigger::Panic, Focusing, &guards), Some(Parking));
        assert_eq!(resolve_transition(Trigger::Panic, Pau, &guards), None);
    }

    #[test]
    fn irrelevant_trigger_source_pair_is_none() {
        let guards = Guards::default();
        assert_eq!(resolve_transition(Trigger::Acquire, Sleeping, &guards), None);
    }

    /// Once `done_observing` holds, every gate that can newly *enter* an
    /// active state (`opening` from `sleeping`, `acquiring` from
    /// `waiting_open`, `opening` from `waiting_closed`) refuses to.
    /// `done_acquiring`/`focusing_complete` are not gates here: by the time
    /// they fire the machine is already inside `acquiring`/`focusing`,
    /// which `done_observing` never let it enter in the first place.
    #[test]
    fn done_observing_blocks_entry_into_active_states() {
        let guards = Guards {
            done_observing: true,
            not_done_observing: false,
            ..Default::default()
        };
        assert_eq!(resolve_transition(Trigger::WakeUp, Sleeping, &guards), Some(Pau));
        assert_eq!(resolve_transition(Trigger::Acquire, WaitingOpen, &guards), Some(Parking));
        assert_eq!(resolve_transition(Trigger::DoneWaiting, WaitingClosed, &guards), Some(Parking));
    }
}
