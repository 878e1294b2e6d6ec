use crate::message::{ClientMessage, RelayMessage};
use crate::session::ConnectionState;
use anyhow::Result;
use async_trait::async_trait;
use wspipe::{InboundContext, Middleware, SendMessage};

/// Checks the canonical id and Schnorr signature of every submitted
/// event before it reaches storage.
#[derive(Debug, Default)]
pub struct EventVerifier;

#[async_trait]
impl Middleware for EventVerifier {
    type State = ConnectionState;
    type IncomingMessage = ClientMessage;
    type OutgoingMessage = RelayMessage;

    async fn process_inbound(
        &self,
        ctx: &mut InboundContext<'_, Self::State, Self::IncomingMessage, Self::OutgoingMessage>,
    ) -> Result<()> {
        match &ctx.message {
            ClientMessage::Event(event) => match event.verify() {
                Ok(()) => ctx.next().await,
                Err(e) => {
                    let response = RelayMessage::ok(event.id.clone(), false, e.to_string());
                    ctx.send_message(response).await
                }
            },
            _ => ctx.next().await,
        }
    }
}
