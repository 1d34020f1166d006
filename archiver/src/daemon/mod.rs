//! Process-level concerns of the archiver binary.

pub mod shutdown;
