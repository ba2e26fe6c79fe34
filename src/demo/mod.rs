// Reference model and control law used by the `ncs` binary and the integration tests.

pub mod speed;
