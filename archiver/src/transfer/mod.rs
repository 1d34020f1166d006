//! Progress reporting for long-running writes.

pub mod progress;
