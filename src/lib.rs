//! Autonomous control sequencer for a roll-off-roof robotic observatory.
//!
//! [`runner::RollOffRoof`] is the entry point: construct one from a
//! [`config::SequencerConfig`], a [`scheduler::Scheduler`] and a
//! [`site::SkyOracle`], then call [`runner::RollOffRoof::wake_up`].

pub mod config;
pub mod devices;
pub mod driver;
pub mod error;
pub mod machine;
pub mod model;
pub mod record;
pub mod runner;
pub mod scheduler;
pub mod site;
pub mod state;

pub use error::{Fault, FaultBook, HardwareFault, SoftwareFault};
pub use runner::RollOffRoof;
pub use state::MachineState;
