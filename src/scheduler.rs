//! Produces the next observing block, or fails with a `SchedulingFault`
//! when none is selectable (§4.2). The scheduler is single-threaded
//! relative to the machine and must never mutate an OB it hands out.

use crate::error::SoftwareFault;
use crate::model::ObservingBlock;

pub trait Scheduler: Send {
    fn select(&mut self) -> Result<ObservingBlock, SoftwareFault>;
}

/// Reference policy: strictly FIFO over the initial OB sequence.
pub struct FifoScheduler {
    queue: std::collections::VecDeque<ObservingBlock>,
}

impl FifoScheduler {
    pub fn new(obs: impl IntoIterator<Item = ObservingBlock>) -> Self {
        Self {
            queue: obs.into_iter().collect(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.queue.len()
    }
}

impl Scheduler for FifoScheduler {
    fn select(&mut self) -> Result<ObservingBlock, SoftwareFault> {
        self.queue
            .pop_front()
            .ok_or_else(|| SoftwareFault::Scheduling("no OBs remaining in queue".to_string()))
    }
}
