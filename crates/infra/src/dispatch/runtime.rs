use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};

use waypoint_core::{CommandError, CommandResult, JobId, MessageId};
use waypoint_events::{BusError, Command, CommandBus, Delivery, Message, MessageBus, MessageEnvelope, Subscription};

use super::retry::{Disposition, RetryPolicy};

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchConfig {
    /// Consumer group shared by every subscription of this runtime.
    pub group: String,
    pub consumer_name: String,
    /// Max wait per poll.
    pub poll_interval: Duration,
    pub consumers_per_subscription: usize,
    pub retry_policy: RetryPolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            group: "waypoint.orchestrator".to_string(),
            consumer_name: "orchestrator".to_string(),
            poll_interval: Duration::from_millis(250),
            consumers_per_subscription: 1,
            retry_policy: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("message type {0} is already registered")]
    DuplicateRegistration(&'static str),

    #[error("failed to subscribe to {message_type}: {source}")]
    Subscribe {
        message_type: &'static str,
        #[source]
        source: BusError,
    },
}

/// Delivery metadata handed to the message → command conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageContext {
    /// Publication id; stable across redeliveries of the same message.
    pub message_id: MessageId,
    pub correlation_id: JobId,
    pub attempt: u32,
}

/// Uniform entry point for one registered message type.
#[async_trait]
trait Dispatch: Send + Sync {
    fn message_type(&self) -> &'static str;

    async fn dispatch(&self, envelope: MessageEnvelope, attempt: u32) -> CommandResult;
}

struct TypedDispatch<M, C: Command, F> {
    to_command: F,
    command_bus: Arc<dyn CommandBus<C>>,
    _message: PhantomData<fn() -> M>,
}

#[async_trait]
impl<M, C, F> Dispatch for TypedDispatch<M, C, F>
where
    M: Message,
    C: Command,
    F: Fn(M, MessageContext) -> C + Send + Sync + 'static,
{
    fn message_type(&self) -> &'static str {
        M::MESSAGE_TYPE
    }

    async fn dispatch(&self, envelope: MessageEnvelope, attempt: u32) -> CommandResult {
        if envelope.message_type() != M::MESSAGE_TYPE {
            return Err(CommandError::validation(format!(
                "expected {} but received {}",
                M::MESSAGE_TYPE,
                envelope.message_type()
            )));
        }

        let message = envelope.decode::<M>().map_err(|e| {
            CommandError::validation(format!("undecodable {} payload: {e}", M::MESSAGE_TYPE))
        })?;

        let ctx = MessageContext {
            message_id: envelope.message_id(),
            correlation_id: envelope.correlation_id(),
            attempt,
        };
        let command = (self.to_command)(message, ctx);
        debug!(command_type = command.command_type(), "sending command");

        self.command_bus.send(command).await
    }
}

/// Registry of message type → (conversion, command bus) bindings.
pub struct DispatchRuntime {
    bus: Arc<dyn MessageBus>,
    config: DispatchConfig,
    registrations: Vec<Arc<dyn Dispatch>>,
}

impl DispatchRuntime {
    pub fn new(bus: Arc<dyn MessageBus>, config: DispatchConfig) -> Self {
        Self {
            bus,
            config,
            registrations: Vec::new(),
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Bind message type `M` to command type `C`.
    ///
    /// Each message type may be registered once; it gets its own worker loop(s).
    pub fn register<M, C, F>(
        &mut self,
        to_command: F,
        command_bus: Arc<dyn CommandBus<C>>,
    ) -> Result<&mut Self, DispatchError>
    where
        M: Message,
        C: Command,
        F: Fn(M, MessageContext) -> C + Send + Sync + 'static,
    {
        if self.registered_types().any(|t| t == M::MESSAGE_TYPE) {
            return Err(DispatchError::DuplicateRegistration(M::MESSAGE_TYPE));
        }

        self.registrations.push(Arc::new(TypedDispatch::<M, C, F> {
            to_command,
            command_bus,
            _message: PhantomData,
        }));
        Ok(self)
    }

    pub fn registered_types(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.registrations.iter().map(|r| r.message_type())
    }

    /// Subscribe every registration and spawn its worker loops.
    pub async fn start(self) -> Result<RuntimeHandle, DispatchError> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut workers = Vec::new();
        let per_subscription = self.config.consumers_per_subscription.max(1);

        for dispatch in &self.registrations {
            let message_type = dispatch.message_type();

            for index in 0..per_subscription {
                let consumer = if per_subscription == 1 {
                    self.config.consumer_name.clone()
                } else {
                    format!("{}-{index}", self.config.consumer_name)
                };

                let subscription = match self
                    .bus
                    .subscribe(message_type, &self.config.group, &consumer)
                    .await
                {
                    Ok(s) => s,
                    Err(source) => {
                        // Already-running loops must not outlive a failed start.
                        let _ = shutdown_tx.send(true);
                        for w in workers {
                            let _ = w.await;
                        }
                        return Err(DispatchError::Subscribe {
                            message_type,
                            source,
                        });
                    }
                };

                let worker = Worker {
                    dispatch: dispatch.clone(),
                    subscription,
                    consumer: consumer.clone(),
                    poll_interval: self.config.poll_interval,
                    retry_policy: self.config.retry_policy.clone(),
                };
                workers.push(tokio::spawn(worker.run(shutdown_rx.clone())));
            }

            info!(
                message_type,
                group = %self.config.group,
                consumers = per_subscription,
                "subscription started"
            );
        }

        Ok(RuntimeHandle {
            shutdown: shutdown_tx,
            workers,
        })
    }
}

/// Handle to stop and join the runtime's worker loops.
#[derive(Debug)]
pub struct RuntimeHandle {
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl RuntimeHandle {
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Stop taking new messages and wait for in-flight ones to finish.
    ///
    /// Dropping the handle without calling this also stops the loops, but
    /// does not wait for them.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!(error = %e, "dispatch worker ended abnormally");
            }
        }
    }
}

struct Worker {
    dispatch: Arc<dyn Dispatch>,
    subscription: Box<dyn Subscription>,
    consumer: String,
    poll_interval: Duration,
    retry_policy: RetryPolicy,
}

impl Worker {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let message_type = self.dispatch.message_type();
        debug!(message_type, consumer = %self.consumer, "worker loop started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            // A dropped sender counts as a shutdown request.
            let polled = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                polled = self.subscription.next(self.poll_interval) => polled,
            };

            match polled {
                Ok(Some(delivery)) if *shutdown.borrow() => {
                    self.release(&delivery).await;
                    break;
                }
                Ok(Some(delivery)) => self.process(delivery).await,
                Ok(None) => {}
                Err(e) => {
                    warn!(message_type, error = %e, "failed to poll subscription");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }

        debug!(message_type, consumer = %self.consumer, "worker loop stopped");
    }

    /// Hand a delivery that arrived after shutdown back to the queue untouched.
    async fn release(&mut self, delivery: &Delivery) {
        let correlation_id = delivery.envelope().correlation_id();
        debug!(%correlation_id, "shutting down; returning delivery to the queue");
        if let Err(e) = self.subscription.nack(delivery, Duration::ZERO).await {
            warn!(%correlation_id, error = %e, "failed to return delivery on shutdown");
        }
    }

    async fn process(&mut self, delivery: Delivery) {
        let envelope = delivery.envelope().clone();
        let attempt = delivery.attempt();
        let correlation_id = envelope.correlation_id();
        let message_id = envelope.message_id();

        let span = info_span!(
            "dispatch",
            message_type = self.dispatch.message_type(),
            message_id = %message_id,
            correlation_id = %correlation_id,
            attempt
        );

        // Each message runs in its own task: a panic ends that task, not the loop.
        let dispatch = self.dispatch.clone();
        let task = tokio::spawn(
            async move { dispatch.dispatch(envelope, attempt).await }.instrument(span.clone()),
        );
        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => Err(CommandError::unexpected(format!(
                "handler panicked: {}",
                panic_message(e.into_panic())
            ))),
            Err(e) => Err(CommandError::unexpected(format!("dispatch task failed: {e}"))),
        };

        let disposition = self.retry_policy.disposition(attempt, &outcome);
        self.settle(&delivery, disposition, outcome.err())
            .instrument(span)
            .await;
    }

    async fn settle(&mut self, delivery: &Delivery, disposition: Disposition, failure: Option<CommandError>) {
        let correlation_id = delivery.envelope().correlation_id();

        let result = match disposition {
            Disposition::Ack => self.subscription.ack(delivery).await,
            Disposition::Redeliver(delay) => {
                if let Some(e) = &failure {
                    warn!(
                        %correlation_id,
                        error_kind = %e.kind(),
                        error = %e.message(),
                        redeliver_in_ms = delay.as_millis() as u64,
                        "command failed; leaving message for redelivery"
                    );
                }
                self.subscription.nack(delivery, delay).await
            }
            Disposition::DeadLetter(reason) => {
                error!(
                    %correlation_id,
                    error_kind = failure.as_ref().map(|e| e.kind().as_str()).unwrap_or("unknown"),
                    %reason,
                    "command failed; dead-lettering message"
                );
                self.subscription.dead_letter(delivery, &reason).await
            }
        };

        if let Err(e) = result {
            // The transport redelivers unsettled messages on its own.
            error!(%correlation_id, error = %e, "failed to settle delivery");
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
