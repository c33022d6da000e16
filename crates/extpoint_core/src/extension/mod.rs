//! Extension point registry.
//!
//! Feature modules register extensions against named points at load time;
//! callers later dispatch a typed capability call across every eligible
//! extension of a point, threading one [`baton::Baton`] through the chain.

pub mod baton;
pub mod dispatch;
pub mod point;
pub mod registry;
pub mod spec;
