//! Global stop signal shared by the tick loop and the transport threads.
//!
//! The first halt cause wins; later ones are logged and ignored so the recorded reason is
//! always the one that actually stopped the run.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use log::debug;
use parking_lot::Mutex;

use crate::error::HaltCause;

#[derive(Clone, Default)]
pub struct StopSignal {
    stopped: Arc<AtomicBool>,
    cause: Arc<Mutex<Option<HaltCause>>>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        !self.stopped.load(Ordering::Acquire)
    }

    /// Requests a clean stop (duration elapsed, caller shutdown).
    pub fn stop(&self) {
        self.halt(HaltCause::Stopped);
    }

    /// Stops the run and records why. Returns false if a cause was already recorded.
    pub fn halt(&self, cause: HaltCause) -> bool {
        let mut slot = self.cause.lock();
        let first = slot.is_none();
        if first {
            *slot = Some(cause);
        } else {
            debug!("[Stop] already halted ({:?}), ignoring {:?}", slot, cause);
        }
        self.stopped.store(true, Ordering::Release);
        first
    }

    pub fn cause(&self) -> Option<HaltCause> {
        self.cause.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_cause_wins() {
        let stop = StopSignal::new();
        assert!(stop.is_running());
        assert!(stop.halt(HaltCause::UserLogic {
            component: "state".into(),
            message: "boom".into()
        }));
        assert!(!stop.halt(HaltCause::Stopped));
        assert!(!stop.is_running());
        assert!(matches!(stop.cause(), Some(HaltCause::UserLogic { .. })));
    }

    #[test]
    fn clones_share_the_flag() {
        let stop = StopSignal::new();
        let other = stop.clone();
        other.stop();
        assert!(!stop.is_running());
        assert_eq!(stop.cause(), Some(HaltCause::Stopped));
    }
}
