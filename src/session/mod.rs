//! Session ownership and dispatch
//!
//! The registry is the single owner of live sessions: creates, teardown
//! events, and shutdown all pass through one serialized dispatch task.

pub mod registry;

pub use registry::{CreateSession, EventSender, SessionRegistry};
