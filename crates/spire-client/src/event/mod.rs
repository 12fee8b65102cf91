//! Asynchronous execution.
//!
//! Commands submitted through the async API run on a small set of event
//! loop threads. Each attempt is an explicit, resumable state machine
//! ([`state::Machine`]) driven over non-blocking sockets; the retry policy
//! around it is shared with the blocking executor.

mod completion;
mod event_loop;
mod io;
mod pipeline;
mod state;

pub use completion::CommandHandle;
pub(crate) use event_loop::EventLoops;
