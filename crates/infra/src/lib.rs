//! Infrastructure for the directions job orchestrator.
//!
//! - `job_store`: the job record store (in-memory and Postgres)
//! - `event_bus`: transport adapters (Redis Streams behind the `redis` feature)
//! - `dispatch`: the message → command runtime and its redelivery policy
//! - `saga`: the job aggregation saga and its subscriptions
//! - `config`: environment-driven settings

pub mod config;
pub mod dispatch;
pub mod event_bus;
pub mod job_store;
pub mod saga;

#[cfg(test)]
mod integration_tests;
