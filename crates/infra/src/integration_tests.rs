//! End-to-end tests for the orchestrator pipeline.
//!
//! Messages → DispatchRuntime → JobAggregationSaga → JobStore / MessageBus
//!
//! Verifies:
//! - A job reaches exactly one terminal notification
//! - Out-of-order and duplicate deliveries converge to the same result
//! - Invalid messages end on the dead-letter queue

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;

    use waypoint_core::{
        CoordinateOutcome, Coordinates, DirectionsResult, ImagingResult, JobId, JobStatus,
        WeatherResult,
    };
    use waypoint_events::{
        DirectionsComplete, GeocodingComplete, ImagingComplete, InMemoryMessageBus, JobCreated,
        LocationsReady, Message, ProcessingComplete, WeatherComplete, publish_message,
    };

    use crate::dispatch::{DispatchConfig, DispatchRuntime, RetryPolicy, RuntimeHandle};
    use crate::job_store::{InMemoryJobStore, JobStore};
    use crate::saga::{JobAggregationSaga, register_subscriptions};

    struct Harness {
        bus: Arc<InMemoryMessageBus>,
        store: Arc<InMemoryJobStore>,
        handle: RuntimeHandle,
    }

    async fn start(consumers_per_subscription: usize) -> Harness {
        let bus = Arc::new(InMemoryMessageBus::new());
        let store = Arc::new(InMemoryJobStore::new());
        let saga = Arc::new(JobAggregationSaga::new(store.clone(), bus.clone()));

        let mut runtime = DispatchRuntime::new(
            bus.clone(),
            DispatchConfig {
                group: "orchestrator".to_string(),
                consumer_name: "it".to_string(),
                poll_interval: Duration::from_millis(10),
                consumers_per_subscription,
                retry_policy: RetryPolicy::fixed(100, Duration::from_millis(10)),
            },
        );
        register_subscriptions(&mut runtime, saga).unwrap();
        let handle = runtime.start().await.unwrap();

        Harness { bus, store, handle }
    }

    async fn wait_for<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..500 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    fn job_created(job_id: JobId) -> JobCreated {
        JobCreated {
            job_id,
            idempotency_key: None,
            starting_address: "A".to_string(),
            destination_address: "B".to_string(),
            email: "traveller@example.com".to_string(),
            created_at: Utc::now(),
        }
    }

    fn geocoding_complete(job_id: JobId) -> GeocodingComplete {
        GeocodingComplete {
            job_id,
            starting_coordinates: Some(CoordinateOutcome::resolved(Coordinates::new(1.0, 1.0))),
            destination_coordinates: Some(CoordinateOutcome::resolved(Coordinates::new(2.0, 2.0))),
        }
    }

    fn directions_complete(job_id: JobId) -> DirectionsComplete {
        DirectionsComplete {
            job_id,
            directions: Some(DirectionsResult {
                successful: true,
                travel_time_seconds: Some(900),
                distance_km: Some(157.2),
                ..Default::default()
            }),
        }
    }

    fn weather_complete(job_id: JobId) -> WeatherComplete {
        WeatherComplete {
            job_id,
            weather: Some(WeatherResult {
                successful: true,
                ..Default::default()
            }),
        }
    }

    fn imaging_complete(job_id: JobId) -> ImagingComplete {
        ImagingComplete {
            job_id,
            imaging: Some(ImagingResult {
                successful: true,
                image_url: Some("https://maps.example/a-b.png".to_string()),
                ..Default::default()
            }),
        }
    }

    async fn publish_branches(bus: &InMemoryMessageBus, job_id: JobId) {
        publish_message(bus, &directions_complete(job_id)).await.unwrap();
        publish_message(bus, &weather_complete(job_id)).await.unwrap();
        publish_message(bus, &imaging_complete(job_id)).await.unwrap();
    }

    fn completions_for(bus: &InMemoryMessageBus, job_id: JobId) -> Vec<ProcessingComplete> {
        bus.published_messages::<ProcessingComplete>()
            .into_iter()
            .filter(|m| m.job_id == job_id)
            .collect()
    }

    async fn status_of(store: &InMemoryJobStore, job_id: JobId) -> Option<JobStatus> {
        store.get_job_by_id(job_id).await.unwrap().map(|j| j.status)
    }

    #[tokio::test]
    async fn job_runs_from_creation_to_completion() {
        let h = start(1).await;
        let job_id = JobId::new();

        publish_message(&*h.bus, &job_created(job_id)).await.unwrap();
        wait_for(|| async { h.store.get_job_by_id(job_id).await.unwrap().is_some() }).await;

        publish_message(&*h.bus, &geocoding_complete(job_id)).await.unwrap();
        wait_for(|| async { !h.bus.published_messages::<LocationsReady>().is_empty() }).await;

        let ready = h.bus.published_messages::<LocationsReady>();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].starting_address, "A");
        assert_eq!(ready[0].starting_coordinates, Coordinates::new(1.0, 1.0));
        assert_eq!(ready[0].destination_address, "B");
        assert_eq!(ready[0].destination_coordinates, Coordinates::new(2.0, 2.0));

        publish_branches(&h.bus, job_id).await;
        wait_for(|| async { status_of(&h.store, job_id).await == Some(JobStatus::Complete) }).await;
        h.handle.shutdown().await;

        let done = completions_for(&h.bus, job_id);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].email, "traveller@example.com");
        assert!(done[0].directions.successful);
        assert!(done[0].weather.successful);
        assert!(done[0].imaging.successful);
        assert!(h.bus.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn results_arriving_before_the_job_are_retried_until_it_exists() {
        let h = start(1).await;
        let job_id = JobId::new();

        publish_message(&*h.bus, &geocoding_complete(job_id)).await.unwrap();
        publish_branches(&h.bus, job_id).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(completions_for(&h.bus, job_id).is_empty());

        publish_message(&*h.bus, &job_created(job_id)).await.unwrap();
        wait_for(|| async { completions_for(&h.bus, job_id).len() == 1 }).await;
        wait_for(|| async { status_of(&h.store, job_id).await == Some(JobStatus::Complete) }).await;
        h.handle.shutdown().await;

        assert_eq!(completions_for(&h.bus, job_id).len(), 1);
        assert!(h.bus.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn duplicate_deliveries_produce_one_notification() {
        let h = start(1).await;
        let job_id = JobId::new();

        publish_message(&*h.bus, &job_created(job_id)).await.unwrap();
        publish_message(&*h.bus, &job_created(job_id)).await.unwrap();
        publish_message(&*h.bus, &geocoding_complete(job_id)).await.unwrap();
        publish_branches(&h.bus, job_id).await;
        publish_branches(&h.bus, job_id).await;

        wait_for(|| async { status_of(&h.store, job_id).await == Some(JobStatus::Complete) }).await;
        // Let the duplicates drain before counting.
        wait_for(|| async {
            h.bus.pending_count(DirectionsComplete::MESSAGE_TYPE, "orchestrator") == 0
                && h.bus.pending_count(WeatherComplete::MESSAGE_TYPE, "orchestrator") == 0
                && h.bus.pending_count(ImagingComplete::MESSAGE_TYPE, "orchestrator") == 0
        })
        .await;
        h.handle.shutdown().await;

        assert_eq!(h.store.len(), 1);
        assert_eq!(completions_for(&h.bus, job_id).len(), 1);
    }

    #[tokio::test]
    async fn unresolvable_address_fails_the_job_without_branches() {
        let h = start(1).await;
        let job_id = JobId::new();

        publish_message(&*h.bus, &job_created(job_id)).await.unwrap();
        let mut geocoded = geocoding_complete(job_id);
        geocoded.starting_coordinates = Some(CoordinateOutcome::failed("no match for 'A'"));
        publish_message(&*h.bus, &geocoded).await.unwrap();

        wait_for(|| async { status_of(&h.store, job_id).await == Some(JobStatus::Failed) }).await;
        h.handle.shutdown().await;

        assert!(h.bus.published(LocationsReady::MESSAGE_TYPE).is_empty());
        let done = completions_for(&h.bus, job_id);
        assert_eq!(done.len(), 1);
        assert!(!done[0].directions.successful);

        let job = h.store.get_job_by_id(job_id).await.unwrap().unwrap();
        assert!(
            job.additional_information
                .unwrap()
                .contains("no match for 'A'")
        );
    }

    #[tokio::test]
    async fn failed_branch_marks_the_job_failed() {
        let h = start(1).await;
        let job_id = JobId::new();

        publish_message(&*h.bus, &job_created(job_id)).await.unwrap();
        publish_message(&*h.bus, &geocoding_complete(job_id)).await.unwrap();
        publish_message(&*h.bus, &directions_complete(job_id)).await.unwrap();
        publish_message(
            &*h.bus,
            &WeatherComplete {
                job_id,
                weather: Some(WeatherResult::failed("forecast service down")),
            },
        )
        .await
        .unwrap();
        publish_message(&*h.bus, &imaging_complete(job_id)).await.unwrap();

        wait_for(|| async { status_of(&h.store, job_id).await == Some(JobStatus::Failed) }).await;
        h.handle.shutdown().await;

        let done = completions_for(&h.bus, job_id);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].weather.error.as_deref(), Some("forecast service down"));
    }

    #[tokio::test]
    async fn competing_consumers_finish_each_job_once() {
        let h = start(4).await;
        let jobs = (0..10).map(|_| JobId::new()).collect::<Vec<_>>();

        for job_id in &jobs {
            publish_message(&*h.bus, &job_created(*job_id)).await.unwrap();
            publish_message(&*h.bus, &geocoding_complete(*job_id)).await.unwrap();
            publish_branches(&h.bus, *job_id).await;
        }

        for job_id in &jobs {
            wait_for(|| async { !completions_for(&h.bus, *job_id).is_empty() }).await;
        }
        h.handle.shutdown().await;

        for job_id in &jobs {
            assert_eq!(completions_for(&h.bus, *job_id).len(), 1, "job {job_id}");
        }
    }

    #[tokio::test]
    async fn invalid_results_are_dead_lettered() {
        let h = start(1).await;
        let job_id = JobId::new();

        publish_message(&*h.bus, &job_created(job_id)).await.unwrap();
        publish_message(&*h.bus, &WeatherComplete { job_id, weather: None })
            .await
            .unwrap();

        wait_for(|| async { h.bus.dead_letters().len() == 1 }).await;
        h.handle.shutdown().await;

        let dead = &h.bus.dead_letters()[0];
        assert_eq!(dead.envelope.message_type(), WeatherComplete::MESSAGE_TYPE);
        assert_eq!(dead.attempt, 1);
        assert!(dead.reason.contains("weather result is missing"));
    }
}
