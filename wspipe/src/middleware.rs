use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc::{error::TrySendError, Sender};
use tracing::error;

/// Ordered middleware chain shared by every connection of a handler.
pub type MiddlewareVec<S, I, O> =
    Vec<Arc<dyn Middleware<State = S, IncomingMessage = I, OutgoingMessage = O>>>;

/// A hook into the connection lifecycle.
///
/// Default implementations pass the context to the next middleware, so an
/// implementation only overrides the phases it cares about. Inbound
/// processing runs front to back; outbound processing runs from the
/// middleware that emitted the message back to the front of the chain.
#[async_trait]
pub trait Middleware: Send + Sync + std::fmt::Debug {
    type State: Send + Sync + 'static;
    type IncomingMessage: Send + Sync + 'static;
    type OutgoingMessage: Send + Sync + 'static;

    async fn process_inbound(
        &self,
        ctx: &mut InboundContext<'_, Self::State, Self::IncomingMessage, Self::OutgoingMessage>,
    ) -> Result<()> {
        ctx.next().await
    }

    async fn process_outbound(
        &self,
        ctx: &mut OutboundContext<'_, Self::State, Self::IncomingMessage, Self::OutgoingMessage>,
    ) -> Result<()> {
        ctx.next().await
    }

    async fn on_connect(
        &self,
        ctx: &mut ConnectionContext<'_, Self::State, Self::IncomingMessage, Self::OutgoingMessage>,
    ) -> Result<()> {
        ctx.next().await
    }

    async fn on_disconnect(
        &self,
        ctx: &mut DisconnectContext<'_, Self::State, Self::IncomingMessage, Self::OutgoingMessage>,
    ) -> Result<()> {
        ctx.next().await
    }
}

/// Failure modes of a non-blocking send into a connection's outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The outbound buffer is full; the peer is not draining fast enough.
    Full,
    /// The connection is gone.
    Closed,
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendError::Full => write!(f, "outbound buffer full"),
            SendError::Closed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for SendError {}

/// Handle for queueing outgoing messages into a connection.
///
/// The carried index records which middleware emitted the message so that
/// outbound processing starts from the right position in the chain.
#[derive(Debug, Clone)]
pub struct MessageSender<O> {
    sender: Sender<(O, usize)>,
    pub index: usize,
}

impl<O> MessageSender<O> {
    pub fn new(sender: Sender<(O, usize)>, index: usize) -> Self {
        Self { sender, index }
    }

    /// Queues a message, waiting for buffer space if necessary.
    pub async fn send(&mut self, message: O) -> Result<()> {
        if let Err(e) = self.sender.send((message, self.index)).await {
            error!("failed to queue outgoing message: {}", e);
            return Err(anyhow::anyhow!("failed to queue outgoing message"));
        }
        Ok(())
    }

    /// Queues a message without waiting. Used on fan-out paths where a slow
    /// peer must not stall the sender.
    pub fn try_send(&mut self, message: O) -> Result<(), SendError> {
        self.sender
            .try_send((message, self.index))
            .map_err(|e| match e {
                TrySendError::Full(_) => SendError::Full,
                TrySendError::Closed(_) => SendError::Closed,
            })
    }

    /// Remaining capacity of the outbound buffer.
    pub fn capacity(&self) -> usize {
        self.sender.capacity()
    }
}

/// Uniform interface middlewares use to queue a message from any context.
#[async_trait]
pub trait SendMessage<O> {
    async fn send_message(&mut self, message: O) -> Result<()>;
}

macro_rules! forward_context {
    ($name:ident, $phase:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug)]
        pub struct $name<'a, S: Send + Sync + 'static, I: Send + Sync + 'static, O: Send + Sync + 'static>
        {
            pub connection_id: String,
            pub state: &'a mut S,
            pub sender: Option<MessageSender<O>>,
            pub(crate) index: usize,
            pub(crate) middlewares: &'a [Arc<dyn Middleware<State = S, IncomingMessage = I, OutgoingMessage = O>>],
        }

        impl<'a, S: Send + Sync + 'static, I: Send + Sync + 'static, O: Send + Sync + 'static>
            $name<'a, S, I, O>
        {
            pub fn new(
                connection_id: String,
                sender: Option<Sender<(O, usize)>>,
                state: &'a mut S,
                middlewares: &'a [Arc<
                    dyn Middleware<State = S, IncomingMessage = I, OutgoingMessage = O>,
                >],
                index: usize,
            ) -> Self {
                Self {
                    connection_id,
                    sender: sender.map(|s| MessageSender::new(s, index)),
                    state,
                    middlewares,
                    index,
                }
            }

            /// Hands the context to the next middleware in the chain.
            pub async fn next(&mut self) -> Result<()> {
                if self.index + 1 >= self.middlewares.len() {
                    return Ok(());
                }
                self.index += 1;
                if let Some(sender) = &mut self.sender {
                    sender.index += 1;
                }
                self.middlewares[self.index].$phase(self).await
            }
        }

        #[async_trait]
        impl<S: Send + Sync + 'static, I: Send + Sync + 'static, O: Send + Sync + 'static>
            SendMessage<O> for $name<'_, S, I, O>
        {
            async fn send_message(&mut self, message: O) -> Result<()> {
                if let Some(sender) = &mut self.sender {
                    sender.send(message).await?;
                }
                Ok(())
            }
        }
    };
}

forward_context!(
    ConnectionContext,
    on_connect,
    "Context handed to middlewares when a connection opens."
);
forward_context!(
    DisconnectContext,
    on_disconnect,
    "Context handed to middlewares when a connection ends."
);

/// Context carrying one decoded inbound message through the chain.
#[derive(Debug)]
pub struct InboundContext<'a, S: Send + Sync + 'static, I: Send + Sync + 'static, O: Send + Sync + 'static>
{
    pub connection_id: String,
    pub message: I,
    pub state: &'a mut S,
    pub sender: Option<MessageSender<O>>,
    pub(crate) index: usize,
    pub(crate) middlewares: &'a [Arc<dyn Middleware<State = S, IncomingMessage = I, OutgoingMessage = O>>],
}

impl<'a, S: Send + Sync + 'static, I: Send + Sync + 'static, O: Send + Sync + 'static>
    InboundContext<'a, S, I, O>
{
    pub fn new(
        connection_id: String,
        message: I,
        sender: Option<Sender<(O, usize)>>,
        state: &'a mut S,
        middlewares: &'a [Arc<dyn Middleware<State = S, IncomingMessage = I, OutgoingMessage = O>>],
        index: usize,
    ) -> Self {
        Self {
            connection_id,
            message,
            sender: sender.map(|s| MessageSender::new(s, index)),
            state,
            middlewares,
            index,
        }
    }

    pub async fn next(&mut self) -> Result<()> {
        if self.index + 1 >= self.middlewares.len() {
            return Ok(());
        }
        self.index += 1;
        if let Some(sender) = &mut self.sender {
            sender.index += 1;
        }
        self.middlewares[self.index].process_inbound(self).await
    }
}

#[async_trait]
impl<S: Send + Sync + 'static, I: Send + Sync + 'static, O: Send + Sync + 'static> SendMessage<O>
    for InboundContext<'_, S, I, O>
{
    async fn send_message(&mut self, message: O) -> Result<()> {
        if let Some(sender) = &mut self.sender {
            sender.send(message).await?;
        }
        Ok(())
    }
}

/// Context carrying one outgoing message back through the chain.
///
/// A middleware may replace `message` or set it to `None` to drop the
/// frame entirely; the walk runs toward the front of the chain.
#[derive(Debug)]
pub struct OutboundContext<'a, S: Send + Sync + 'static, I: Send + Sync + 'static, O: Send + Sync + 'static>
{
    pub connection_id: String,
    pub message: Option<O>,
    pub state: &'a mut S,
    pub sender: Option<MessageSender<O>>,
    pub(crate) index: usize,
    pub(crate) middlewares: &'a [Arc<dyn Middleware<State = S, IncomingMessage = I, OutgoingMessage = O>>],
}

impl<'a, S: Send + Sync + 'static, I: Send + Sync + 'static, O: Send + Sync + 'static>
    OutboundContext<'a, S, I, O>
{
    pub fn new(
        connection_id: String,
        message: O,
        sender: Option<Sender<(O, usize)>>,
        state: &'a mut S,
        middlewares: &'a [Arc<dyn Middleware<State = S, IncomingMessage = I, OutgoingMessage = O>>],
        index: usize,
    ) -> Self {
        Self {
            connection_id,
            message: Some(message),
            sender: sender.map(|s| MessageSender::new(s, index)),
            state,
            middlewares,
            index,
        }
    }

    pub async fn next(&mut self) -> Result<()> {
        if self.index == 0 {
            return Ok(());
        }
        self.index -= 1;
        if let Some(sender) = &mut self.sender {
            sender.index -= 1;
        }
        self.middlewares[self.index].process_outbound(self).await
    }
}

#[async_trait]
impl<S: Send + Sync + 'static, I: Send + Sync + 'static, O: Send + Sync + 'static> SendMessage<O>
    for OutboundContext<'_, S, I, O>
{
    async fn send_message(&mut self, message: O) -> Result<()> {
        if let Some(sender) = &mut self.sender {
            sender.send(message).await?;
        }
        Ok(())
    }
}
