use crate::{
    ConnectionContext, DisconnectContext, InboundContext, MiddlewareVec, OutboundContext,
};
use crate::server::PipelineError;
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::mpsc::{Receiver as MpscReceiver, Sender as MpscSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Translates between the socket's text frames and the pipeline's typed
/// messages. Returning `Ok(None)` from `inbound_from_string` silently drops
/// the frame.
pub trait MessageConverter<I, O>: Send + Sync {
    fn inbound_from_string(&self, message: String) -> Result<Option<I>>;
    fn outbound_to_string(&self, message: O) -> Result<String>;
}

/// Drives one connection's messages through the middleware chain.
pub struct MessageHandler<
    S: Send + Sync + 'static,
    I: Send + Sync + 'static,
    O: Send + Sync + 'static,
    C: MessageConverter<I, O> + Send + Sync + 'static,
> {
    middlewares: Arc<MiddlewareVec<S, I, O>>,
    converter: Arc<C>,
    sender: Option<MpscSender<(O, usize)>>,
    cancellation_token: CancellationToken,
    channel_size: usize,
}

impl<
        S: Send + Sync + 'static,
        I: Send + Sync + 'static,
        O: Send + Sync + 'static,
        C: MessageConverter<I, O> + Send + Sync + 'static,
    > MessageHandler<S, I, O, C>
{
    pub fn new(
        middlewares: Arc<MiddlewareVec<S, I, O>>,
        converter: Arc<C>,
        cancellation_token: CancellationToken,
        channel_size: usize,
    ) -> Self {
        Self {
            middlewares,
            converter,
            sender: None,
            cancellation_token,
            channel_size,
        }
    }

    /// Runs the connect phase and opens the outbound channel.
    pub async fn on_connect(
        &mut self,
        connection_id: String,
        mut state: S,
    ) -> Result<(S, MpscReceiver<(O, usize)>), PipelineError<S>> {
        let (sender, receiver) = tokio::sync::mpsc::channel(self.channel_size);
        self.sender = Some(sender);

        let mut ctx = ConnectionContext::new(
            connection_id,
            self.sender.clone(),
            &mut state,
            &self.middlewares,
            0,
        );

        if let Err(e) = self.middlewares[0].on_connect(&mut ctx).await {
            return Err(PipelineError::Handler(e.into(), state));
        }

        Ok((state, receiver))
    }

    /// Decodes one inbound frame and walks it through the chain.
    pub async fn handle_incoming_message(
        &self,
        connection_id: String,
        payload: String,
        mut state: S,
    ) -> Result<S, PipelineError<S>> {
        let decoded = match self.converter.inbound_from_string(payload) {
            Ok(decoded) => decoded,
            Err(e) => {
                return Err(PipelineError::InboundConversion(e.to_string(), state));
            }
        };

        let Some(message) = decoded else {
            return Ok(state);
        };

        let mut ctx = InboundContext::new(
            connection_id.clone(),
            message,
            self.sender.clone(),
            &mut state,
            &self.middlewares,
            0,
        );

        if let Err(e) = self.middlewares[0].process_inbound(&mut ctx).await {
            error!("[{}] error in middleware chain: {:?}", connection_id, e);
            return Err(PipelineError::Handler(e.into(), state));
        }

        Ok(state)
    }

    /// Walks an outgoing message back through the chain and encodes it.
    ///
    /// Returns `None` when a middleware dropped the message.
    pub async fn handle_outbound_message(
        &self,
        connection_id: String,
        message: O,
        middleware_index: usize,
        mut state: S,
    ) -> Result<(S, Option<String>), PipelineError<S>> {
        let message = if middleware_index > 0 {
            let mut ctx = OutboundContext::new(
                connection_id.clone(),
                message,
                self.sender.clone(),
                &mut state,
                &self.middlewares,
                middleware_index,
            );

            if let Err(e) = self.middlewares[middleware_index]
                .process_outbound(&mut ctx)
                .await
            {
                error!(
                    "[{}] error processing outbound message at middleware {}: {:?}",
                    connection_id, middleware_index, e
                );
                return Err(PipelineError::Handler(e.into(), state));
            }
            ctx.message
        } else {
            Some(message)
        };

        match message {
            Some(message) => match self.converter.outbound_to_string(message) {
                Ok(text) => Ok((state, Some(text))),
                Err(e) => Err(PipelineError::OutboundConversion(e.to_string(), state)),
            },
            None => {
                debug!("[{}] outbound message dropped by chain", connection_id);
                Ok((state, None))
            }
        }
    }

    /// Runs the disconnect phase and cancels the connection token.
    pub async fn on_disconnect(
        &self,
        connection_id: String,
        mut state: S,
    ) -> Result<S, PipelineError<S>> {
        let mut ctx = DisconnectContext::new(
            connection_id,
            self.sender.clone(),
            &mut state,
            &self.middlewares,
            0,
        );

        if let Err(e) = self.middlewares[0].on_disconnect(&mut ctx).await {
            return Err(PipelineError::Handler(e.into(), state));
        }

        self.cancellation_token.cancel();
        Ok(state)
    }
}
