//! Shared helpers.

pub mod index;

pub use index::{IndexError, IndexTable};
