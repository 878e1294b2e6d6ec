//! Runs the rejection chains: the general event chain, the kind-specific
//! chains and the filter chain. Also answers unparseable frames.

use crate::error::ClientMessageId;
use crate::message::{ClientMessage, RelayMessage};
use crate::policy::PolicyPipeline;
use crate::session::ConnectionState;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use wspipe::{InboundContext, Middleware, SendMessage};

#[derive(Debug)]
pub struct PolicyGate {
    pipeline: Arc<PolicyPipeline>,
    relay_pubkey: String,
}

impl PolicyGate {
    pub fn new(pipeline: Arc<PolicyPipeline>, relay_pubkey: String) -> Self {
        Self {
            pipeline,
            relay_pubkey,
        }
    }
}

#[async_trait]
impl Middleware for PolicyGate {
    type State = ConnectionState;
    type IncomingMessage = ClientMessage;
    type OutgoingMessage = RelayMessage;

    async fn process_inbound(
        &self,
        ctx: &mut InboundContext<'_, Self::State, Self::IncomingMessage, Self::OutgoingMessage>,
    ) -> Result<()> {
        match &ctx.message {
            ClientMessage::Invalid { reason } => {
                ctx.send_message(RelayMessage::notice(reason.clone())).await
            }
            ClientMessage::Event(event) => {
                let event_ctx = ctx
                    .state
                    .event_context(&ctx.connection_id, &self.relay_pubkey);
                match self.pipeline.check_event(event, &event_ctx) {
                    Ok(()) => ctx.next().await,
                    Err(e) => {
                        let event_id = event.id.clone();
                        e.respond(ctx, ClientMessageId::Event(event_id)).await
                    }
                }
            }
            ClientMessage::Req {
                subscription_id,
                filters,
            }
            | ClientMessage::Count {
                subscription_id,
                filters,
            } => {
                let event_ctx = ctx
                    .state
                    .event_context(&ctx.connection_id, &self.relay_pubkey);
                match self.pipeline.check_filters(filters, &event_ctx) {
                    Ok(()) => ctx.next().await,
                    Err(e) => {
                        let subscription_id = subscription_id.clone();
                        e.respond(ctx, ClientMessageId::Subscription(subscription_id))
                            .await
                    }
                }
            }
            _ => ctx.next().await,
        }
    }
}
