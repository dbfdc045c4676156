//! Handler module - request dispatch.
//!
//! Provides:
//! - [`Handler`] - one command's implementation
//! - [`HandlerRegistry`] - maps commands to handlers and builds responses
//!
//! Handlers return response data or a failure [`StatusCode`]; pairing the
//! sequence number is the registry's job, so a handler cannot answer the
//! wrong request.
//!
//! [`StatusCode`]: crate::protocol::StatusCode

mod registry;

pub use registry::{BoxFuture, FnHandler, Handler, HandlerRegistry, HandlerResult};
