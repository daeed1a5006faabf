//! Data models and store queries

pub mod event;
pub mod stats;

pub use event::*;
pub use stats::*;
