//! Plain data shared by the slot table and its collaborators.
//!
//! Nothing in this crate performs I/O or owns runtime state: identifiers, resource
//! quantities, slot states and the slot report published with worker heartbeats.

mod domain;
pub use domain::*;
