//! Flag module.
//!
//! This module contains the representation of message flags and
//! free-form labels, as they are compared by the synchronization
//! passes.

pub mod flag;
pub use flag::*;

pub mod flags;
pub use flags::*;

pub mod labels;
pub use labels::*;
