//! Sorting controller communication.
//!
pub mod link;
pub mod protocol;
