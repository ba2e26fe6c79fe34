// Controller side of the link: the control-law contract, the dispatch loop that runs it
// one batch at a time, and the UDP service around it.

pub mod dispatch;
pub mod service;

use crate::plant::variable::ValueMap;

/// User-supplied control law.
pub trait Controller: Send {
    /// Computes actuation commands from the latest accepted sample mapping. The result may name
    /// any subset of the plant's actuators.
    fn process(&mut self, samples: &ValueMap) -> anyhow::Result<ValueMap>;

    /// Called exactly once when the controller service stops.
    fn shutdown(&mut self) {}
}
