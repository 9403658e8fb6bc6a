//! Dispatcher implementations for Runtime
//!
//! - `orchestration`: signals, instance gate, replay passes and the recovery sweep
//! - `worker`: activity workers, retries and outcome recording

pub(super) mod orchestration;
pub(super) mod worker;
