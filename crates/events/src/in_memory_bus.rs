//! In-memory message bus for tests/dev.
//!
//! - Queues per (message type, consumer group)
//! - A new group starts from the beginning of the message type's history
//! - Unacked deliveries can be redelivered with a delay (at-least-once)
//! - Dead-lettered and published messages stay inspectable

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::bus::{BusError, Delivery, MessageBus, MessagePublisher, Subscription};
use crate::{Message, MessageEnvelope};

#[derive(Debug, Clone)]
struct Queued {
    tag: u64,
    attempt: u32,
    envelope: MessageEnvelope,
    visible_at: Instant,
}

#[derive(Debug, Default)]
struct GroupQueue {
    ready: VecDeque<Queued>,
    in_flight: HashMap<u64, Queued>,
    notify: Arc<Notify>,
}

/// A delivery that was given up on.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub group: String,
    pub attempt: u32,
    pub reason: String,
    pub envelope: MessageEnvelope,
}

#[derive(Debug, Default)]
struct BusState {
    history: HashMap<String, Vec<MessageEnvelope>>,
    groups: HashMap<(String, String), GroupQueue>,
    dead_letters: Vec<DeadLetter>,
    next_tag: u64,
}

impl BusState {
    fn next_tag(&mut self) -> u64 {
        self.next_tag += 1;
        self.next_tag
    }
}

/// In-memory durable-queue simulation.
#[derive(Debug, Clone, Default)]
pub struct InMemoryMessageBus {
    state: Arc<Mutex<BusState>>,
}

impl InMemoryMessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, BusState>, BusError> {
        self.state
            .lock()
            .map_err(|_| BusError::Command("in-memory bus lock poisoned".to_string()))
    }

    /// Every envelope ever published for `message_type`, in publish order.
    pub fn published(&self, message_type: &str) -> Vec<MessageEnvelope> {
        self.lock()
            .map(|s| s.history.get(message_type).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Typed view of `published`. Envelopes that fail to decode are skipped.
    pub fn published_messages<M: Message>(&self) -> Vec<M> {
        self.published(M::MESSAGE_TYPE)
            .iter()
            .filter_map(|e| e.decode::<M>().ok())
            .collect()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.lock().map(|s| s.dead_letters.clone()).unwrap_or_default()
    }

    /// Messages not yet acknowledged (ready or in flight) for a group.
    pub fn pending_count(&self, message_type: &str, group: &str) -> usize {
        self.lock()
            .ok()
            .and_then(|s| {
                s.groups
                    .get(&(message_type.to_string(), group.to_string()))
                    .map(|q| q.ready.len() + q.in_flight.len())
            })
            .unwrap_or(0)
    }
}

#[async_trait]
impl MessagePublisher for InMemoryMessageBus {
    async fn publish(&self, envelope: MessageEnvelope) -> Result<(), BusError> {
        let mut state = self.lock()?;
        let message_type = envelope.message_type().to_string();

        state
            .history
            .entry(message_type.clone())
            .or_default()
            .push(envelope.clone());

        let keys = state
            .groups
            .keys()
            .filter(|(t, _)| *t == message_type)
            .cloned()
            .collect::<Vec<_>>();

        for key in keys {
            let tag = state.next_tag();
            if let Some(queue) = state.groups.get_mut(&key) {
                queue.ready.push_back(Queued {
                    tag,
                    attempt: 1,
                    envelope: envelope.clone(),
                    visible_at: Instant::now(),
                });
                queue.notify.notify_one();
            }
        }

        Ok(())
    }
}

#[async_trait]
impl MessageBus for InMemoryMessageBus {
    async fn subscribe(
        &self,
        message_type: &str,
        group: &str,
        _consumer: &str,
    ) -> Result<Box<dyn Subscription>, BusError> {
        let mut state = self.lock()?;
        let key = (message_type.to_string(), group.to_string());

        if !state.groups.contains_key(&key) {
            let backlog = state.history.get(message_type).cloned().unwrap_or_default();
            let mut queue = GroupQueue::default();
            for envelope in backlog {
                let tag = state.next_tag();
                queue.ready.push_back(Queued {
                    tag,
                    attempt: 1,
                    envelope,
                    visible_at: Instant::now(),
                });
            }
            state.groups.insert(key.clone(), queue);
        }

        let notify = state
            .groups
            .get(&key)
            .map(|q| q.notify.clone())
            .ok_or(BusError::Closed)?;

        Ok(Box::new(InMemorySubscription {
            state: self.state.clone(),
            key,
            notify,
        }))
    }
}

struct InMemorySubscription {
    state: Arc<Mutex<BusState>>,
    key: (String, String),
    notify: Arc<Notify>,
}

impl InMemorySubscription {
    fn lock(&self) -> Result<MutexGuard<'_, BusState>, BusError> {
        self.state
            .lock()
            .map_err(|_| BusError::Command("in-memory bus lock poisoned".to_string()))
    }

    fn parse_tag(delivery: &Delivery) -> Result<u64, BusError> {
        delivery
            .tag()
            .parse()
            .map_err(|_| BusError::Command(format!("foreign delivery tag: {}", delivery.tag())))
    }

    fn take_in_flight(&self, delivery: &Delivery) -> Result<Option<Queued>, BusError> {
        let tag = Self::parse_tag(delivery)?;
        let mut state = self.lock()?;
        Ok(state
            .groups
            .get_mut(&self.key)
            .and_then(|q| q.in_flight.remove(&tag)))
    }

    /// Pop the first visible message, or report when the next one becomes visible.
    fn try_take(&self) -> Result<Result<Delivery, Option<Instant>>, BusError> {
        let mut state = self.lock()?;
        let queue = state.groups.get_mut(&self.key).ok_or(BusError::Closed)?;
        let now = Instant::now();

        match queue.ready.iter().position(|m| m.visible_at <= now) {
            Some(idx) => {
                let Some(msg) = queue.ready.remove(idx) else {
                    return Ok(Err(None));
                };
                let delivery = Delivery::new(msg.tag.to_string(), msg.attempt, msg.envelope.clone());
                queue.in_flight.insert(msg.tag, msg);
                Ok(Ok(delivery))
            }
            None => Ok(Err(queue.ready.iter().map(|m| m.visible_at).min())),
        }
    }
}

#[async_trait]
impl Subscription for InMemorySubscription {
    async fn next(&mut self, wait: Duration) -> Result<Option<Delivery>, BusError> {
        let deadline = Instant::now() + wait;

        loop {
            let next_visible = match self.try_take()? {
                Ok(delivery) => return Ok(Some(delivery)),
                Err(next_visible) => next_visible,
            };

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            let wake_at = next_visible.map_or(deadline, |at| at.min(deadline));
            let _ = tokio::time::timeout_at(wake_at, self.notify.notified()).await;
        }
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<(), BusError> {
        self.take_in_flight(delivery)?;
        Ok(())
    }

    async fn nack(&mut self, delivery: &Delivery, redeliver_after: Duration) -> Result<(), BusError> {
        let Some(mut msg) = self.take_in_flight(delivery)? else {
            return Ok(());
        };
        msg.attempt += 1;
        msg.visible_at = Instant::now() + redeliver_after;

        let mut state = self.lock()?;
        if let Some(queue) = state.groups.get_mut(&self.key) {
            queue.ready.push_back(msg);
            queue.notify.notify_one();
        }
        Ok(())
    }

    async fn dead_letter(&mut self, delivery: &Delivery, reason: &str) -> Result<(), BusError> {
        let Some(msg) = self.take_in_flight(delivery)? else {
            return Ok(());
        };

        tracing::debug!(
            message_type = %self.key.0,
            group = %self.key.1,
            attempt = msg.attempt,
            reason,
            "message dead-lettered"
        );
        let mut state = self.lock()?;
        let group = self.key.1.clone();
        state.dead_letters.push(DeadLetter {
            group,
            attempt: msg.attempt,
            reason: reason.to_string(),
            envelope: msg.envelope,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::JobStatusUpdate;
    use crate::publish_message;
    use waypoint_core::{JobId, JobStatus};

    fn status(job_id: JobId) -> JobStatusUpdate {
        JobStatusUpdate {
            job_id,
            status: JobStatus::Processing,
            details: None,
        }
    }

    const WAIT: Duration = Duration::from_millis(200);

    #[tokio::test]
    async fn acked_message_is_removed_from_the_group() {
        let bus = InMemoryMessageBus::new();
        let mut sub = bus.subscribe("job.status_update", "g", "c1").await.unwrap();

        publish_message(&bus, &status(JobId::new())).await.unwrap();

        let d = sub.next(WAIT).await.unwrap().expect("delivery");
        assert_eq!(d.attempt(), 1);
        assert_eq!(bus.pending_count("job.status_update", "g"), 1);

        sub.ack(&d).await.unwrap();
        assert_eq!(bus.pending_count("job.status_update", "g"), 0);
        assert!(sub.next(Duration::from_millis(20)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn nacked_message_is_redelivered_with_next_attempt() {
        let bus = InMemoryMessageBus::new();
        let mut sub = bus.subscribe("job.status_update", "g", "c1").await.unwrap();
        let job_id = JobId::new();
        publish_message(&bus, &status(job_id)).await.unwrap();

        let first = sub.next(WAIT).await.unwrap().unwrap();
        sub.nack(&first, Duration::from_millis(10)).await.unwrap();

        let second = sub.next(WAIT).await.unwrap().unwrap();
        assert_eq!(second.attempt(), 2);
        assert_eq!(second.envelope().message_id(), first.envelope().message_id());
        assert_eq!(second.envelope().correlation_id(), job_id);
    }

    #[tokio::test]
    async fn nack_delay_hides_the_message_until_it_expires() {
        let bus = InMemoryMessageBus::new();
        let mut sub = bus.subscribe("job.status_update", "g", "c1").await.unwrap();
        publish_message(&bus, &status(JobId::new())).await.unwrap();

        let d = sub.next(WAIT).await.unwrap().unwrap();
        sub.nack(&d, Duration::from_secs(60)).await.unwrap();

        assert!(sub.next(Duration::from_millis(30)).await.unwrap().is_none());
        assert_eq!(bus.pending_count("job.status_update", "g"), 1);
    }

    #[tokio::test]
    async fn dead_lettered_message_is_parked() {
        let bus = InMemoryMessageBus::new();
        let mut sub = bus.subscribe("job.status_update", "g", "c1").await.unwrap();
        publish_message(&bus, &status(JobId::new())).await.unwrap();

        let d = sub.next(WAIT).await.unwrap().unwrap();
        sub.dead_letter(&d, "malformed").await.unwrap();

        let dead = bus.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, "malformed");
        assert_eq!(dead[0].group, "g");
        assert_eq!(bus.pending_count("job.status_update", "g"), 0);
    }

    #[tokio::test]
    async fn new_group_receives_backlog_and_groups_are_independent() {
        let bus = InMemoryMessageBus::new();
        publish_message(&bus, &status(JobId::new())).await.unwrap();

        let mut a = bus.subscribe("job.status_update", "a", "c").await.unwrap();
        let mut b = bus.subscribe("job.status_update", "b", "c").await.unwrap();

        let da = a.next(WAIT).await.unwrap().unwrap();
        a.ack(&da).await.unwrap();
        assert!(b.next(WAIT).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn competing_consumers_split_a_group() {
        let bus = InMemoryMessageBus::new();
        let mut c1 = bus.subscribe("job.status_update", "g", "c1").await.unwrap();
        let mut c2 = bus.subscribe("job.status_update", "g", "c2").await.unwrap();

        publish_message(&bus, &status(JobId::new())).await.unwrap();
        publish_message(&bus, &status(JobId::new())).await.unwrap();

        let d1 = c1.next(WAIT).await.unwrap().unwrap();
        let d2 = c2.next(WAIT).await.unwrap().unwrap();
        assert_ne!(d1.envelope().message_id(), d2.envelope().message_id());
    }

    #[tokio::test]
    async fn published_log_is_typed() {
        let bus = InMemoryMessageBus::new();
        let job_id = JobId::new();
        publish_message(&bus, &status(job_id)).await.unwrap();

        let msgs = bus.published_messages::<JobStatusUpdate>();
        assert_eq!(msgs, vec![status(job_id)]);
    }
}
