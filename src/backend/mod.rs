//! Backend abstraction layer
//!
//! Provides the device/context traits the buffer models drive, plus a
//! recording dummy backend for tests and headless use.

pub mod traits;
pub mod types;

#[cfg(feature = "dummy")]
pub mod dummy;

pub use traits::*;
pub use types::*;
