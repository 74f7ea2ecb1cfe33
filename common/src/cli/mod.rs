//! CLI-related shared utilities.
//!
//! This module centralizes CLI policy so binaries don't duplicate behavior.

mod color;
mod seconds;

pub use color::ColorWhen;
pub use seconds::{parse_seconds, MAX_RUN_SECS};
