//! Test support: pipeline fixtures, a wired in-memory engine, and a
//! scripted executor that drives runs end to end.

pub mod executor;
pub mod fixtures;

pub use executor::{ScriptedExecutor, Step};
pub use fixtures::{TestEngine, TEST_PIPELINE};
