//! A bidirectional middleware pipeline for axum WebSocket connections.
//!
//! Each connection owns a state value produced by a [`StateFactory`].
//! Inbound frames are decoded by a [`MessageConverter`] and walked through
//! the middleware chain front to back; messages emitted by a middleware
//! walk back to front before being encoded and written to the socket.

mod handler;
mod middleware;
mod server;

pub use handler::{MessageConverter, MessageHandler};
pub use middleware::{
    ConnectionContext, DisconnectContext, InboundContext, Middleware, MiddlewareVec,
    OutboundContext, SendError, SendMessage, MessageSender,
};
pub use server::{PipelineBuilder, PipelineError, StateFactory, WebSocketHandler};
