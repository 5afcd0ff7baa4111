//! Message contracts and transport mechanics for the directions job saga.

pub mod bus;
pub mod command;
pub mod envelope;
pub mod in_memory_bus;
pub mod message;
pub mod messages;

pub use bus::{BusError, Delivery, MessageBus, MessagePublisher, Subscription, publish_message};
pub use command::{Command, CommandBus};
pub use envelope::MessageEnvelope;
pub use in_memory_bus::{DeadLetter, InMemoryMessageBus};
pub use message::Message;
pub use messages::{
    DirectionsComplete, GeocodingComplete, ImagingComplete, JobCreated, JobStatusUpdate,
    LocationsReady, ProcessingComplete, WeatherComplete,
};
