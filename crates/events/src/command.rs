use std::sync::Arc;

use async_trait::async_trait;

use waypoint_core::{CommandResult, JobId};

/// A command is the internal intent derived from one delivered message.
///
/// Commands are:
/// - **Cloneable**: they may be copied for retries, logging, etc.
/// - **Send + Sync + 'static**: they cross task boundaries
/// - **Correlated**: every command names the job it targets
pub trait Command: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable command name for logs (e.g. "UpdateWeatherResult").
    fn command_type(&self) -> &'static str;

    fn correlation_id(&self) -> JobId;
}

/// Executes commands and reports the outcome as a value.
///
/// Expected failures are returned as `CommandError`; implementations must not
/// let them escape as panics.
#[async_trait]
pub trait CommandBus<C: Command>: Send + Sync {
    async fn send(&self, command: C) -> CommandResult;
}

#[async_trait]
impl<C, B> CommandBus<C> for Arc<B>
where
    C: Command,
    B: CommandBus<C> + ?Sized,
{
    async fn send(&self, command: C) -> CommandResult {
        (**self).send(command).await
    }
}
