//! Adaptive control policy: presets, device inputs, server pushes and the
//! resolver that picks one of them.

pub mod bus;
pub mod device;
pub mod policy;
pub mod resolver;
pub mod server;
