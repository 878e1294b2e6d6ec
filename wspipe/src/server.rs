use crate::{MessageConverter, MessageHandler, Middleware, MiddlewareVec};
use axum::extract::ws::{Message, WebSocket};
use axum::Error as AxumError;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::Receiver as MpscReceiver;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Creates the per-connection state value.
///
/// Called once for every accepted WebSocket; the token is cancelled when
/// the connection ends so state holders can tie background work to it.
pub trait StateFactory<S> {
    fn create_state(&self, token: CancellationToken) -> S;
}

/// Errors surfaced while serving a connection. Every variant carries the
/// connection state back out so the disconnect phase still runs.
#[derive(Error, Debug)]
pub enum PipelineError<S: Send + Sync + 'static> {
    #[error("websocket error: {0}")]
    Socket(AxumError, S),

    #[error("client disconnected without closing handshake")]
    AbruptClose(AxumError, S),

    #[error("handler error: {0}")]
    Handler(Box<dyn std::error::Error + Send + Sync>, S),

    #[error("inbound conversion error: {0}")]
    InboundConversion(String, S),

    #[error("outbound conversion error: {0}")]
    OutboundConversion(String, S),

    #[error("maximum concurrent connections reached")]
    ConnectionLimit(S),
}

impl<S: Send + Sync + 'static> PipelineError<S> {
    pub fn into_state(self) -> S {
        match self {
            Self::Socket(_, state)
            | Self::AbruptClose(_, state)
            | Self::Handler(_, state)
            | Self::InboundConversion(_, state)
            | Self::OutboundConversion(_, state)
            | Self::ConnectionLimit(state) => state,
        }
    }
}

/// Fluent configuration for a [`WebSocketHandler`].
pub struct PipelineBuilder<
    S: Send + Sync + 'static,
    I: Send + Sync + 'static,
    O: Send + Sync + 'static,
    C: MessageConverter<I, O> + Send + Sync + Clone + 'static,
    F: StateFactory<S> + Send + Sync + Clone + 'static,
> {
    state_factory: F,
    converter: C,
    middlewares: MiddlewareVec<S, I, O>,
    channel_size: usize,
    max_connection_time: Option<Duration>,
    max_connections: Option<usize>,
}

impl<
        S: Send + Sync + 'static,
        I: Send + Sync + 'static,
        O: Send + Sync + 'static,
        C: MessageConverter<I, O> + Send + Sync + Clone + 'static,
        F: StateFactory<S> + Send + Sync + Clone + 'static,
    > PipelineBuilder<S, I, O, C, F>
{
    pub fn new(state_factory: F, converter: C) -> Self {
        Self {
            state_factory,
            converter,
            middlewares: Vec::new(),
            channel_size: 100,
            max_connection_time: None,
            max_connections: None,
        }
    }

    /// Appends a middleware. Inbound order is insertion order.
    #[must_use]
    pub fn with_middleware<M>(mut self, middleware: M) -> Self
    where
        M: Middleware<State = S, IncomingMessage = I, OutgoingMessage = O> + 'static,
    {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    /// Size of the per-connection outbound buffer.
    #[must_use]
    pub const fn with_channel_size(mut self, size: usize) -> Self {
        self.channel_size = size;
        self
    }

    /// Closes connections that outlive this duration.
    #[must_use]
    pub fn with_max_connection_time(mut self, duration: Duration) -> Self {
        self.max_connection_time = Some(duration);
        self
    }

    /// Caps the number of concurrently served connections.
    #[must_use]
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = Some(max);
        self
    }

    pub fn build(self) -> WebSocketHandler<S, I, O, C, F> {
        WebSocketHandler {
            middlewares: Arc::new(self.middlewares),
            converter: Arc::new(self.converter),
            state_factory: self.state_factory,
            channel_size: self.channel_size,
            max_connection_time: self.max_connection_time,
            connection_semaphore: self.max_connections.map(|n| Arc::new(Semaphore::new(n))),
        }
    }
}

/// Serves WebSocket connections through the configured middleware chain.
#[derive(Clone)]
pub struct WebSocketHandler<S, I, O, C, F>
where
    S: Send + Sync + 'static,
    I: Send + Sync + 'static,
    O: Send + Sync + 'static,
    C: MessageConverter<I, O> + Send + Sync + Clone + 'static,
    F: StateFactory<S> + Send + Sync + Clone + 'static,
{
    middlewares: Arc<MiddlewareVec<S, I, O>>,
    converter: Arc<C>,
    state_factory: F,
    channel_size: usize,
    max_connection_time: Option<Duration>,
    connection_semaphore: Option<Arc<Semaphore>>,
}

impl<S, I, O, C, F> WebSocketHandler<S, I, O, C, F>
where
    S: Send + Sync + 'static,
    I: Send + Sync + 'static,
    O: Send + Sync + 'static,
    C: MessageConverter<I, O> + Send + Sync + Clone + 'static,
    F: StateFactory<S> + Send + Sync + Clone + 'static,
{
    /// Serves one WebSocket until the client leaves, the token fires or the
    /// connection time limit is hit. The disconnect phase always runs
    /// exactly once, regardless of how the connection ended.
    pub async fn start(
        &self,
        socket: WebSocket,
        connection_id: String,
        cancellation_token: CancellationToken,
    ) -> Result<(), PipelineError<S>> {
        let _permit: Option<OwnedSemaphorePermit> = match &self.connection_semaphore {
            Some(semaphore) => match semaphore.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    warn!("[{}] connection limit reached, rejecting", connection_id);
                    let state = self
                        .state_factory
                        .create_state(cancellation_token.child_token());
                    return Err(PipelineError::ConnectionLimit(state));
                }
            },
            None => None,
        };

        let connection_token = cancellation_token.child_token();

        if let Some(max_time) = self.max_connection_time {
            let watchdog_token = connection_token.clone();
            let conn_id = connection_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(max_time).await;
                warn!("[{}] max connection time exceeded, closing", conn_id);
                watchdog_token.cancel();
            });
        }

        let state = self.state_factory.create_state(connection_token.clone());
        let mut handler = MessageHandler::new(
            self.middlewares.clone(),
            self.converter.clone(),
            connection_token.clone(),
            self.channel_size,
        );

        debug!("[{}] connection established", connection_id);

        let state = match serve_connection(
            &connection_id,
            socket,
            &mut handler,
            connection_token,
            state,
        )
        .await
        {
            Ok(state) => state,
            Err(PipelineError::AbruptClose(e, state)) => {
                debug!("[{}] client left without closing handshake: {}", connection_id, e);
                state
            }
            Err(e) => {
                error!("[{}] connection error: {}", connection_id, e);
                e.into_state()
            }
        };

        if let Err(e) = handler.on_disconnect(connection_id.clone(), state).await {
            error!("[{}] disconnect handler error: {}", connection_id, e);
        }

        debug!("[{}] connection closed", connection_id);
        Ok(())
    }
}

async fn serve_connection<S, I, O, C>(
    connection_id: &str,
    socket: WebSocket,
    handler: &mut MessageHandler<S, I, O, C>,
    cancellation_token: CancellationToken,
    state: S,
) -> Result<S, PipelineError<S>>
where
    S: Send + Sync + 'static,
    I: Send + Sync + 'static,
    O: Send + Sync + 'static,
    C: MessageConverter<I, O> + Send + Sync + 'static,
{
    let (state, receiver) = handler
        .on_connect(connection_id.to_string(), state)
        .await?;

    message_loop(
        connection_id,
        socket,
        receiver,
        handler,
        cancellation_token,
        state,
    )
    .await
}

async fn write_outbound<S, I, O, C>(
    connection_id: &str,
    socket: &mut WebSocket,
    message: O,
    middleware_index: usize,
    handler: &MessageHandler<S, I, O, C>,
    state: S,
) -> Result<S, PipelineError<S>>
where
    S: Send + Sync + 'static,
    I: Send + Sync + 'static,
    O: Send + Sync + 'static,
    C: MessageConverter<I, O> + Send + Sync + 'static,
{
    let (state, text) = handler
        .handle_outbound_message(connection_id.to_string(), message, middleware_index, state)
        .await?;

    if let Some(text) = text {
        if let Err(e) = socket.send(Message::Text(text)).await {
            return Err(PipelineError::Socket(e, state));
        }
    }

    Ok(state)
}

async fn message_loop<S, I, O, C>(
    connection_id: &str,
    mut socket: WebSocket,
    mut receiver: MpscReceiver<(O, usize)>,
    handler: &mut MessageHandler<S, I, O, C>,
    cancellation_token: CancellationToken,
    mut state: S,
) -> Result<S, PipelineError<S>>
where
    S: Send + Sync + 'static,
    I: Send + Sync + 'static,
    O: Send + Sync + 'static,
    C: MessageConverter<I, O> + Send + Sync + 'static,
{
    loop {
        tokio::select! {
            biased;

            _ = cancellation_token.cancelled() => {
                // Drain whatever is already queued before closing.
                while let Ok((message, middleware_index)) = receiver.try_recv() {
                    state = write_outbound(
                        connection_id,
                        &mut socket,
                        message,
                        middleware_index,
                        handler,
                        state,
                    )
                    .await?;
                }

                if let Err(e) = socket.send(Message::Close(None)).await {
                    debug!("[{}] failed to send close frame: {}", connection_id, e);
                }
                return Ok(state);
            }

            outgoing = receiver.recv() => {
                match outgoing {
                    Some((message, middleware_index)) => {
                        state = write_outbound(
                            connection_id,
                            &mut socket,
                            message,
                            middleware_index,
                            handler,
                            state,
                        )
                        .await?;
                    }
                    None => return Ok(state),
                }
            }

            incoming = socket.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        state = match handler
                            .handle_incoming_message(connection_id.to_string(), text, state)
                            .await
                        {
                            Ok(state) => state,
                            Err(PipelineError::InboundConversion(reason, state)) => {
                                debug!("[{}] unparseable frame: {}", connection_id, reason);
                                state
                            }
                            Err(e) => return Err(e),
                        };
                    }
                    Some(Ok(Message::Binary(_))) => {
                        debug!("[{}] ignoring binary frame", connection_id);
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if let Err(e) = socket.send(Message::Pong(payload)).await {
                            warn!("[{}] failed to send pong: {}", connection_id, e);
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        let _ = socket.send(Message::Close(None)).await;
                        return Ok(state);
                    }
                    Some(Err(e)) => {
                        if e.to_string().contains("without closing handshake") {
                            return Err(PipelineError::AbruptClose(e, state));
                        }
                        return Err(PipelineError::Socket(e, state));
                    }
                    None => return Ok(state),
                }
            }
        }
    }
}
