//! Lightweight reliable messaging between the nodes of a cluster, on top of an unreliable
//!  point-to-point transport.
//!
//! Messages are sent along named routes. A route has an ordered list of destinations and a mode:
//!  *failover* tries the destinations in order, *load balance* spreads messages round-robin.
//!  Every message is retransmitted according to the route's retransmit pattern until a
//!  destination acknowledges it, failing over to the next destination when the pattern is
//!  exhausted or the destination rejects the message.
//!
//! Receivers deduplicate messages by id, apply a per-tag accept mode (accept, drop or reject), and
//!  pass accepted messages to the application, one at a time per message group.
//!
//! Nodes exchange heartbeats to track each other's liveness.

pub mod config;
pub mod heartbeat;
pub mod incoming;
pub mod messaging;
pub mod outgoing;
pub mod service;
pub mod stats;
pub mod topology;
pub mod util;
pub mod test_util;
