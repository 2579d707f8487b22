//! Testing utilities and mock implementations
//!
//! Lets connection and pool behaviour be exercised without a running MQTT broker.

pub mod mocks;

pub use mocks::*;
