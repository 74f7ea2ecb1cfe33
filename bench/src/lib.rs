//! End-to-end VoIP benchmark.
//!
//! A trial streams audio from a sender session through a simulated
//! network relay to a receiver, plays it out through the jitter buffer
//! and scores the call. A sweep repeats the trial across network
//! profiles or codecs.

pub mod report;
pub mod sweep;
pub mod trial;

pub use report::TrialReport;
pub use sweep::{compare_codecs, run_sweep, NamedConditions, Sweep, SweepEntry, SweepReport};
pub use trial::{run_trial, Trial, TrialConfig};
