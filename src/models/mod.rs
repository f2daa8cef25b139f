//! Core data models for the object metadata index.
//!
//! Notifications describe what changed in the storage namespace, records are
//! what the index persists, and the envelope types frame what goes back to
//! the hosting platform.

pub mod envelope;
pub mod notification;
pub mod record;
