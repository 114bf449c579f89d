//! Dispatch side of the pipeline: drains the outbox tables and delivers
//! each event to the target API with at-least-once semantics.

pub mod engine;
pub mod mapper;

pub use engine::{
    response_error_message, response_indicates_success, DispatchEngine, EnrichmentDefaults,
    QueueConfig, RetryPolicy,
};
