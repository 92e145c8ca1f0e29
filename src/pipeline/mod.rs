//! Event delivery: store → scheduler → workers → transport.

pub mod event;
pub mod in_flight;
pub mod scheduler;
pub mod store;
pub mod transport;
pub mod worker;
