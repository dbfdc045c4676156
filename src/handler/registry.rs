//! Handler registry for dispatching requests by command.
//!
//! The registry maps SmartPort commands to handlers and turns handler
//! results into responses carrying the request's sequence number.
//! Commands without a handler, and codes outside the command table, are
//! answered with `BAD_COMMAND`.
//!
//! # Example
//!
//! ```ignore
//! use bytes::Bytes;
//! use smartport_bridge::handler::HandlerRegistry;
//! use smartport_bridge::protocol::{Command, Request, RequestBody, StatusCode};
//!
//! let mut registry = HandlerRegistry::new();
//! registry.register(Command::Init, |_request: Request| async { Ok(Bytes::new()) });
//!
//! let response = registry.dispatch(Request::new(3, RequestBody::Init { unit: 1 })).await;
//! assert_eq!(response.sequence_number(), 3);
//! assert_eq!(response.status(), StatusCode::OK);
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;

use bytes::Bytes;

use crate::protocol::{Command, Request, Response, StatusCode};

/// Result type for handler functions: response data or a failure status.
pub type HandlerResult = std::result::Result<Bytes, StatusCode>;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Trait for command handlers.
pub trait Handler: Send + Sync + 'static {
    /// Handle one request.
    fn call(&self, request: Request) -> BoxFuture<'static, HandlerResult>;
}

/// Adapter from an async closure to [`Handler`].
pub struct FnHandler<F, Fut>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnHandler<F, Fut>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    /// Wrap a closure.
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, Fut> Handler for FnHandler<F, Fut>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, request: Request) -> BoxFuture<'static, HandlerResult> {
        Box::pin((self.handler)(request))
    }
}

/// Registry mapping commands to handlers.
pub struct HandlerRegistry {
    handlers: HashMap<Command, Box<dyn Handler>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register an async closure for `command`, replacing any previous one.
    pub fn register<F, Fut>(&mut self, command: Command, handler: F)
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register_handler(command, FnHandler::new(handler));
    }

    /// Register a [`Handler`] implementation for `command`.
    pub fn register_handler<H: Handler>(&mut self, command: Command, handler: H) {
        if self.handlers.insert(command, Box::new(handler)).is_some() {
            tracing::debug!(%command, "handler replaced");
        }
    }

    /// Check if a handler is registered for `command`.
    pub fn contains(&self, command: Command) -> bool {
        self.handlers.contains_key(&command)
    }

    /// Registered commands, in code order.
    pub fn commands(&self) -> Vec<Command> {
        let mut commands: Vec<_> = self.handlers.keys().copied().collect();
        commands.sort_by_key(|c| c.code());
        commands
    }

    /// Run the handler for `request` and build its response.
    ///
    /// The response always carries the request's sequence number.
    pub async fn dispatch(&self, request: Request) -> Response {
        let sequence_number = request.sequence_number;

        let handler = match request.command().and_then(|c| self.handlers.get(&c)) {
            Some(handler) => handler,
            None => {
                tracing::debug!(
                    seq = sequence_number,
                    command = request.command_code(),
                    "unsupported command"
                );
                return Response::unsupported(&request);
            }
        };

        match handler.call(request).await {
            Ok(data) => Response::ok(sequence_number, data),
            Err(status) => Response::error(sequence_number, status),
        }
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
