//! Invariant violations that leave the process in an undefined state.
//!
//! These are logic defects, not runtime conditions, so the only response is
//! to log and abort. Recoverable failures use `anyhow` or the typed errors of
//! the module that raises them.

use std::time::Duration;

use tracing::error;

#[derive(Debug, thiserror::Error)]
pub enum FatalError {
    #[error("client {public_id} already has a live connection")]
    DoubleBind { public_id: u64 },
    #[error("client {public_id} was added to group '{group}' twice")]
    DuplicateClient { group: String, public_id: u64 },
    #[error("connection routed to client {public_id}, which group '{group}' does not own")]
    UnknownClient { group: String, public_id: u64 },
    #[error("task queue '{queue}' did not accept a task within {timeout:?}")]
    TaskQueueUnresponsive { queue: String, timeout: Duration },
}

pub fn abort(error: FatalError) -> ! {
    error!(%error, "Fatal invariant violation, aborting");
    std::process::abort()
}
