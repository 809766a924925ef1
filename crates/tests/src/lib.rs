//! # Integration Tests
//!
//! Cross-crate end-to-end tests.
//!
//! Covers:
//! - configuration file to running pipeline
//! - the example scenarios (overflow, rotation, routing, failure isolation,
//!   shutdown deadline)
//! - pipeline-wide properties (non-blocking submit, no duplication, rotation
//!   atomicity, ordering, idempotent reconfigure, conservation on shutdown)

#[cfg(test)]
mod support;

#[cfg(test)]
mod scenarios;

#[cfg(test)]
mod properties;
