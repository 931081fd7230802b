//! Testing utilities for varbridge.
//!
//! Recording fakes for the collaborator traits, a mockall propagator, a
//! liveness monitor the test drives by hand, and fixture helpers.

pub mod data_generators;
pub mod implementations;
pub mod mocks;

/// Re-export commonly used types for convenience
pub use mockall;

pub use data_generators::{consumer, init_test_logging, metadata, owner, session};
pub use implementations::{
    FailingCallback, ManualLiveness, RecordingAuditSink, RecordingCallback, RecordingPropagator,
};
pub use mocks::MockPropagator;
