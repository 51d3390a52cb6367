//! HTTP protocol step: request parsing and response composition.
//!
//! Consumed by the runtime as the unit of work a worker executes between
//! readiness events. Everything here is synchronous over byte buffers; the
//! runtime decides when bytes arrive and where response bytes go.

pub mod request;
pub mod response;

pub use request::{ParseOutcome, Request};
pub use response::Response;
