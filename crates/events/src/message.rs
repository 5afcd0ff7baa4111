use serde::{Serialize, de::DeserializeOwned};

use waypoint_core::JobId;

/// A message that travels over the bus.
///
/// Messages are:
/// - **immutable** (treat them as facts)
/// - **keyed by type**: `MESSAGE_TYPE` is the topic/queue name
/// - **correlated**: every message names the job it belongs to
pub trait Message: Serialize + DeserializeOwned + Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable message type identifier (e.g. "geocoding.complete").
    const MESSAGE_TYPE: &'static str;

    /// The job this message belongs to (used for tracing/log correlation).
    fn correlation_id(&self) -> JobId;
}
