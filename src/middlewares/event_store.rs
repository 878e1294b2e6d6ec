//! Terminal dispatcher: owns the per-connection storage handle, serves
//! EVENT/REQ/CLOSE/COUNT, and keeps subscriptions live after EOSE.

use crate::connection::RelayConnection;
use crate::error::ClientMessageId;
use crate::filter::Filter;
use crate::message::{ClientMessage, RelayMessage};
use crate::relay_store::RelayStore;
use crate::session::ConnectionState;
use crate::store::StoreCommand;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use wspipe::{
    ConnectionContext, DisconnectContext, InboundContext, MessageSender, Middleware, SendMessage,
};

#[derive(Debug)]
pub struct EventStoreMiddleware {
    store: Arc<RelayStore>,
    max_subscriptions: usize,
}

impl EventStoreMiddleware {
    pub fn new(store: Arc<RelayStore>, max_subscriptions: usize) -> Self {
        Self {
            store,
            max_subscriptions,
        }
    }
}

/// Streams stored events followed by EOSE from a separate task, so a
/// large result set never stalls the connection's frame processing. The
/// token stops the stream the moment the subscription is dropped.
fn stream_stored_events(
    connection_id: String,
    store: Arc<RelayStore>,
    subscription_id: String,
    filters: Vec<Filter>,
    mut sender: MessageSender<RelayMessage>,
    token: CancellationToken,
) {
    tokio::spawn(async move {
        let stored = match store.query(&filters).await {
            Ok(stored) => stored,
            Err(e) => {
                error!(
                    "[{}] query for {} failed: {}",
                    connection_id, subscription_id, e
                );
                let _ = sender.send(RelayMessage::notice("error: internal error")).await;
                return;
            }
        };

        debug!(
            "[{}] streaming {} stored events for {}",
            connection_id,
            stored.len(),
            subscription_id
        );

        for event in stored {
            let message = RelayMessage::event(subscription_id.clone(), event);
            tokio::select! {
                _ = token.cancelled() => return,
                sent = sender.send(message) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }
        }

        if !token.is_cancelled() {
            let _ = sender.send(RelayMessage::eose(subscription_id)).await;
        }
    });
}

#[async_trait]
impl Middleware for EventStoreMiddleware {
    type State = ConnectionState;
    type IncomingMessage = ClientMessage;
    type OutgoingMessage = RelayMessage;

    async fn on_connect(
        &self,
        ctx: &mut ConnectionContext<'_, Self::State, Self::IncomingMessage, Self::OutgoingMessage>,
    ) -> Result<()> {
        let Some(sender) = ctx.sender.clone() else {
            return Err(anyhow::anyhow!("no outbound sender for connection"));
        };

        let connection = RelayConnection::new(
            ctx.connection_id.clone(),
            self.store.clone(),
            ctx.state.connection_token.clone(),
            sender,
        );
        ctx.state.relay_connection = Some(connection);
        ctx.next().await
    }

    async fn process_inbound(
        &self,
        ctx: &mut InboundContext<'_, Self::State, Self::IncomingMessage, Self::OutgoingMessage>,
    ) -> Result<()> {
        match &ctx.message {
            ClientMessage::Event(event) => {
                let event = (**event).clone();
                let commands = vec![StoreCommand::SaveSignedEvent(event.clone())];
                match ctx.state.commit_commands(commands).await {
                    Ok(announced) => {
                        ctx.send_message(RelayMessage::ok(event.id.clone(), true, ""))
                            .await?;
                        ctx.state.announce_events(&announced);
                        Ok(())
                    }
                    Err(e) => e.respond(ctx, ClientMessageId::Event(event.id)).await,
                }
            }

            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                let subscription_id = subscription_id.clone();
                let filters = filters.clone();

                let replacing = ctx.state.subscriptions.contains_key(&subscription_id);
                if !replacing && ctx.state.subscriptions.len() >= self.max_subscriptions {
                    return ctx
                        .send_message(RelayMessage::notice("too many subscriptions"))
                        .await;
                }

                let Some(connection) = ctx.state.relay_connection.clone() else {
                    return Err(anyhow::anyhow!("no storage connection"));
                };
                let Some(sender) = ctx.sender.clone() else {
                    return Err(anyhow::anyhow!("no outbound sender for connection"));
                };

                // A REQ re-using an id replaces the old subscription and
                // stops its in-flight stream.
                if let Some(old_token) = ctx.state.subscriptions.remove(&subscription_id) {
                    old_token.cancel();
                }

                let token = ctx.state.connection_token.child_token();
                ctx.state
                    .subscriptions
                    .insert(subscription_id.clone(), token.clone());

                // Register for live events first so nothing accepted
                // mid-query is missed.
                connection.add_subscription(subscription_id.clone(), filters.clone());

                stream_stored_events(
                    ctx.connection_id.clone(),
                    self.store.clone(),
                    subscription_id,
                    filters,
                    sender,
                    token,
                );
                Ok(())
            }

            ClientMessage::Close(subscription_id) => {
                // Dropped silently; no acknowledgement on the wire.
                if let Some(connection) = ctx.state.relay_connection.as_ref() {
                    connection.remove_subscription(subscription_id);
                }
                let subscription_id = subscription_id.clone();
                if let Some(token) = ctx.state.subscriptions.remove(&subscription_id) {
                    token.cancel();
                }
                Ok(())
            }

            ClientMessage::Count {
                subscription_id,
                filters,
            } => {
                let subscription_id = subscription_id.clone();
                match self.store.count(filters).await {
                    Ok(count) => {
                        ctx.send_message(RelayMessage::count(subscription_id, count))
                            .await
                    }
                    Err(e) => {
                        e.respond(ctx, ClientMessageId::Subscription(subscription_id))
                            .await
                    }
                }
            }

            // AUTH and invalid frames are answered earlier in the chain.
            _ => ctx.next().await,
        }
    }

    async fn on_disconnect(
        &self,
        ctx: &mut DisconnectContext<'_, Self::State, Self::IncomingMessage, Self::OutgoingMessage>,
    ) -> Result<()> {
        // Subscription, broadcast and streaming tasks all hang off the
        // connection token, which is cancelled when the socket goes away;
        // clearing the handle releases the store reference.
        ctx.state.relay_connection = None;
        ctx.state.subscriptions.clear();
        ctx.next().await
    }
}
