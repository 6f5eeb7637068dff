//! Relay dispatch engine.
//!
//! This crate provides the core building blocks for durable, idempotent
//! background job dispatch:
//!
//! - [`HandlerRegistry`] — explicit, startup-populated mapping from job
//!   names to [`JobHandler`] implementations with their feature category
//!   and idempotence flag.
//! - [`QueueTransport`] / [`IdempotencyStore`] — abstractions over the
//!   durable queue and the duplicate-execution guard, so the engine is
//!   agnostic to the underlying queue technology. [`postgres`] implements
//!   them over `relay-db`; [`memory`] is an in-process implementation used
//!   by tests and local development.
//! - [`Dispatcher`] — enqueue API plus the at-least-once consume loop with
//!   retry classification, bounded backoff, and dead-lettering.
//! - [`JobEventBus`] — in-process broadcast of job lifecycle events,
//!   backed by `tokio::sync::broadcast`.

pub mod dispatcher;
pub mod error;
pub mod events;
pub mod memory;
pub mod postgres;
pub mod registry;
pub mod transport;

pub use dispatcher::{DeliveryOutcome, Dispatcher};
pub use error::{EnqueueError, HandlerError, TransportError};
pub use events::{JobEvent, JobEventBus, JobEventKind};
pub use registry::{FnHandler, HandlerRegistration, HandlerRegistry, JobContext, JobHandler};
pub use transport::{Delivery, DeliveryToken, IdempotencyClaim, IdempotencyStore, QueueTransport};
