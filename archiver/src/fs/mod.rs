//! Filesystem helpers.

pub mod inventory;
