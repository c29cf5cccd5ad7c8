pub mod liveness;
pub mod monitor;
