//! Demo harness pieces used by the `tracking-pipeline` binary.

pub mod producer;
