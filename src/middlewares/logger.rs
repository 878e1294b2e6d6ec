use crate::message::{ClientMessage, RelayMessage};
use crate::session::ConnectionState;
use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};
use wspipe::{ConnectionContext, DisconnectContext, InboundContext, Middleware, OutboundContext};

/// First in the chain: logs every frame in both directions.
#[derive(Debug, Default)]
pub struct LoggerMiddleware;

impl LoggerMiddleware {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Middleware for LoggerMiddleware {
    type State = ConnectionState;
    type IncomingMessage = ClientMessage;
    type OutgoingMessage = RelayMessage;

    async fn process_inbound(
        &self,
        ctx: &mut InboundContext<'_, Self::State, Self::IncomingMessage, Self::OutgoingMessage>,
    ) -> Result<()> {
        match &ctx.message {
            ClientMessage::Event(event) => {
                info!(
                    "[{}] > event kind {} id {}",
                    ctx.connection_id, event.kind, event.id
                );
            }
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                info!(
                    "[{}] > req {}: {}",
                    ctx.connection_id,
                    subscription_id,
                    filters
                        .iter()
                        .map(|f| f.to_value().to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                );
            }
            ClientMessage::Count {
                subscription_id, ..
            } => {
                info!("[{}] > count {}", ctx.connection_id, subscription_id);
            }
            ClientMessage::Close(subscription_id) => {
                info!("[{}] > close {}", ctx.connection_id, subscription_id);
            }
            ClientMessage::Auth(event) => {
                info!("[{}] > auth event {}", ctx.connection_id, event.id);
            }
            ClientMessage::Invalid { reason } => {
                warn!("[{}] > invalid frame: {}", ctx.connection_id, reason);
            }
        }
        ctx.next().await
    }

    async fn process_outbound(
        &self,
        ctx: &mut OutboundContext<'_, Self::State, Self::IncomingMessage, Self::OutgoingMessage>,
    ) -> Result<()> {
        let Some(message) = &ctx.message else {
            return Ok(());
        };

        match message {
            RelayMessage::Event {
                subscription_id,
                event,
            } => {
                info!(
                    "[{}] < event for {}: kind {} id {}",
                    ctx.connection_id, subscription_id, event.kind, event.id
                );
            }
            RelayMessage::Ok {
                event_id,
                accepted,
                message,
            } => {
                if *accepted {
                    info!("[{}] < ok {}", ctx.connection_id, event_id);
                } else {
                    warn!("[{}] < ok {} false: {}", ctx.connection_id, event_id, message);
                }
            }
            RelayMessage::EndOfStoredEvents(subscription_id) => {
                info!("[{}] < eose {}", ctx.connection_id, subscription_id);
            }
            RelayMessage::Notice(message) => {
                warn!("[{}] < notice: {}", ctx.connection_id, message);
            }
            RelayMessage::Auth { .. } => {
                info!("[{}] < auth challenge", ctx.connection_id);
            }
            RelayMessage::Count {
                subscription_id,
                count,
            } => {
                info!("[{}] < count {}: {}", ctx.connection_id, subscription_id, count);
            }
        }
        ctx.next().await
    }

    async fn on_connect(
        &self,
        ctx: &mut ConnectionContext<'_, Self::State, Self::IncomingMessage, Self::OutgoingMessage>,
    ) -> Result<()> {
        info!("[{}] connected", ctx.connection_id);
        ctx.next().await
    }

    async fn on_disconnect(
        &self,
        ctx: &mut DisconnectContext<'_, Self::State, Self::IncomingMessage, Self::OutgoingMessage>,
    ) -> Result<()> {
        info!("[{}] disconnected", ctx.connection_id);
        ctx.next().await
    }
}
