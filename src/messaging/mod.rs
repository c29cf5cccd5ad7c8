pub mod arrival_sequencer;
pub mod frame;
pub mod frame_sender;
pub mod message;
pub mod transport;
