//! Shared fixtures for the patchbay end-to-end suite.

pub mod fixtures;

pub use fixtures::TestStack;
