//! Transport between plant and controller: batch framing and UDP plumbing.

pub mod protocol;
pub mod socket;
