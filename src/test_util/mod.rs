//! Utilities for testing code based on LwComm: an in-process network connecting several
//!  services, a receiver that records what it gets, and configuration helpers. They are used for
//!  testing the crate itself, but they are also exported for application testing.

pub mod network;
pub mod node;
pub mod receiver;
