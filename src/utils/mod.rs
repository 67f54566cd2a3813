//! Utility functions and helpers

pub mod error;

pub use error::ResultExt;
