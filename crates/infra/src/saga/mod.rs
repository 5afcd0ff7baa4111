//! Job aggregation saga and the subscriptions that feed it.

pub mod commands;
pub mod job_aggregation;

use std::sync::Arc;

use waypoint_events::{
    CommandBus, DirectionsComplete, GeocodingComplete, ImagingComplete, JobCreated,
    JobStatusUpdate, MessagePublisher, WeatherComplete,
};

use crate::dispatch::{DispatchError, DispatchRuntime, MessageContext};
use crate::job_store::JobStore;

pub use commands::{
    ApplyJobStatusUpdate, CreateJob, NotifyJobStatusUpdate, NotifyProcessingComplete, SagaCommand,
    UpdateDirectionsResult, UpdateGeocodingResult, UpdateImagingResult, UpdateWeatherResult,
};
pub use job_aggregation::{GEOCODING_STARTED, JobAggregationSaga};

/// Bind every message the saga consumes to its command.
///
/// Fan-in commands carry the message id so redeliveries of the same
/// publication are recognised as the same claimant.
pub fn register_subscriptions<S, P>(
    runtime: &mut DispatchRuntime,
    saga: Arc<JobAggregationSaga<S, P>>,
) -> Result<(), DispatchError>
where
    S: JobStore + 'static,
    P: MessagePublisher + 'static,
{
    let bus: Arc<dyn CommandBus<SagaCommand>> = saga;

    runtime
        .register::<JobCreated, SagaCommand, _>(
            |m, _ctx: MessageContext| SagaCommand::CreateJob(m.into()),
            bus.clone(),
        )?
        .register::<GeocodingComplete, SagaCommand, _>(
            |m, ctx: MessageContext| {
                SagaCommand::UpdateGeocodingResult(UpdateGeocodingResult::from_message(
                    m,
                    ctx.message_id,
                ))
            },
            bus.clone(),
        )?
        .register::<DirectionsComplete, SagaCommand, _>(
            |m, ctx: MessageContext| {
                SagaCommand::UpdateDirectionsResult(UpdateDirectionsResult::from_message(
                    m,
                    ctx.message_id,
                ))
            },
            bus.clone(),
        )?
        .register::<WeatherComplete, SagaCommand, _>(
            |m, ctx: MessageContext| {
                SagaCommand::UpdateWeatherResult(UpdateWeatherResult::from_message(
                    m,
                    ctx.message_id,
                ))
            },
            bus.clone(),
        )?
        .register::<ImagingComplete, SagaCommand, _>(
            |m, ctx: MessageContext| {
                SagaCommand::UpdateImagingResult(UpdateImagingResult::from_message(
                    m,
                    ctx.message_id,
                ))
            },
            bus.clone(),
        )?
        .register::<JobStatusUpdate, SagaCommand, _>(
            |m, _ctx: MessageContext| SagaCommand::ApplyJobStatusUpdate(m.into()),
            bus,
        )?;

    Ok(())
}
