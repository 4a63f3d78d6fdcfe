//! Core data model.
//!
//! A work item is something that needs doing. It has identity (type plus
//! optional grouping, deduplication, and serialization keys), scheduling
//! attributes, and lifecycle state. Request payloads and the pure
//! state-transition engine live in submodules.

pub mod request;
pub mod transition;
pub mod work;

pub use request::*;
pub use work::*;
