//! Durable queue of outbound writes awaiting replay.
//!
//! Records are sanitized before they are written and survive restarts; the
//! sync trigger drains them oldest-first.

mod action;
mod store;

pub use action::{ActionId, ActionPayload, NewAction, QueuedAction};
pub use store::{QueueStore, SqliteQueue};
