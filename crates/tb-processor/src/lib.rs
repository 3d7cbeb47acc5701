//! Queue consumer.
//!
//! - `HandlerRegistry`: message type to handler, built once at startup
//! - `QueueProcessor`: per-queue receive loop with poison routing
//!
//! A message is poisoned when it has been delivered too often, cannot be
//! deserialized, carries a newer envelope schema, or has no handler.
//! Handler failures leave the message on the queue for redelivery.

pub mod handler;
pub mod processor;

pub use handler::{HandlerRegistry, QueueMessageHandler, SampleHandler};
pub use processor::{MessageOutcome, PoisonReason, ProcessorConfig, QueueProcessor, TickSummary};
