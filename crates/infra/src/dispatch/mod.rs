//! Message → command dispatch runtime.
//!
//! Binds one message type to one command type, runs one worker loop per
//! subscription, and turns command outcomes into ack / redeliver / dead-letter
//! decisions.

pub mod retry;
pub mod runtime;

pub use retry::{BackoffStrategy, Disposition, RetryPolicy};
pub use runtime::{DispatchConfig, DispatchError, DispatchRuntime, MessageContext, RuntimeHandle};
