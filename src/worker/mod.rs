//! The relay worker: request interception, lifecycle, control messages and
//! background replay.

mod interceptor;
mod lifecycle;
mod messages;
mod sync;

pub use interceptor::Outcome;
pub use lifecycle::{MessageReply, ServiceWorker, WorkerState};
pub use messages::ControlMessage;
pub use sync::{SyncReport, SyncSignal};
