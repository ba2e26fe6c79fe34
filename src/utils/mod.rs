// Shared runtime utilities: event recording and the stop signal.

pub mod metrics;
pub mod shutdown;
