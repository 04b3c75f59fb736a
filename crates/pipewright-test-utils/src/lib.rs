//! Mocks and fixtures shared by the Pipewright test suites.

pub mod fixtures;
mod mocks;

pub use mocks::{MemoryRunLog, MockIsolated, RecordingEvents, RecordingSink, ScriptedRemote};
