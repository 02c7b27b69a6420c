//! Download engine
//!
//! - Bounded FIFO admission of manifests into transfer slots
//! - Resumable HTTP byte transfers behind a backend trait
//! - Pause/resume/retry/cancel with re-acquisition of stale URLs
//! - Voucher persistence on completion

mod install;
mod orchestrator;
mod transfer;

pub use install::*;
pub use orchestrator::*;
pub use transfer::*;
