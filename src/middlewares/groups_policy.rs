//! Component gate for relay-moderated groups: turns group events into
//! state mutations plus storage commands, gates `#h` subscriptions
//! against private groups, and filters outbound events the reader may
//! not see.

use crate::error::ClientMessageId;
use crate::groups::Groups;
use crate::message::{ClientMessage, RelayMessage};
use crate::session::ConnectionState;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use wspipe::{InboundContext, Middleware, OutboundContext, SendMessage};

#[derive(Debug)]
pub struct GroupsPolicy {
    groups: Arc<Groups>,
}

impl GroupsPolicy {
    pub fn new(groups: Arc<Groups>) -> Self {
        Self { groups }
    }
}

#[async_trait]
impl Middleware for GroupsPolicy {
    type State = ConnectionState;
    type IncomingMessage = ClientMessage;
    type OutgoingMessage = RelayMessage;

    async fn process_inbound(
        &self,
        ctx: &mut InboundContext<'_, Self::State, Self::IncomingMessage, Self::OutgoingMessage>,
    ) -> Result<()> {
        match &ctx.message {
            ClientMessage::Event(event) => {
                let event = event.clone();
                match self.groups.handle_event(&event) {
                    // Not a group event; the generic store path takes it.
                    Ok(None) => ctx.next().await,
                    Ok(Some(commands)) => {
                        match ctx.state.commit_commands(commands).await {
                            Ok(announced) => {
                                // The publisher's OK goes out ahead of any
                                // broadcast frame for the same event.
                                ctx.send_message(RelayMessage::ok(event.id.clone(), true, ""))
                                    .await?;
                                ctx.state.announce_events(&announced);
                                self.groups.record_accepted(&event);
                                Ok(())
                            }
                            Err(e) => {
                                e.respond(ctx, ClientMessageId::Event(event.id.clone())).await
                            }
                        }
                    }
                    Err(e) => e.respond(ctx, ClientMessageId::Event(event.id.clone())).await,
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
                let check = self
                    .groups
                    .verify_filters(ctx.state.authed_pubkey.as_deref(), filters);
                match check {
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

    async fn process_outbound(
        &self,
        ctx: &mut OutboundContext<'_, Self::State, Self::IncomingMessage, Self::OutgoingMessage>,
    ) -> Result<()> {
        if let Some(RelayMessage::Event { event, .. }) = &ctx.message {
            if !self.groups.can_deliver(&ctx.state.authed_pubkey, event) {
                ctx.message = None;
            }
        }
        ctx.next().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Tag;
    use crate::groups::KIND_GROUP_CREATE;
    use crate::keys::RelayKeys;
    use crate::session::ConnectionFactory;
    use crate::test_utils::sign_test_event;
    use tokio_util::sync::CancellationToken;
    use wspipe::StateFactory;

    fn outbound_ctx<'a>(
        state: &'a mut ConnectionState,
        message: RelayMessage,
    ) -> OutboundContext<'a, ConnectionState, ClientMessage, RelayMessage> {
        OutboundContext::new("conn".to_string(), message, None, state, &[], 0)
    }

    #[tokio::test]
    async fn outbound_frames_for_private_groups_are_blanked() {
        let relay = RelayKeys::generate();
        let admin = RelayKeys::generate();
        let stranger = RelayKeys::generate();
        let groups = Arc::new(Groups::new(relay.public_key.clone()));

        let create = sign_test_event(&admin, KIND_GROUP_CREATE, vec![Tag::new(["h", "g1"])], "");
        groups.handle_event(&create).unwrap().unwrap();

        let content = sign_test_event(&admin, 9, vec![Tag::new(["h", "g1"])], "secret");
        let middleware = GroupsPolicy::new(groups);
        let factory = ConnectionFactory::new("wss://relay.test".to_string());

        // A member (the admin) sees the frame.
        let mut state = factory.create_state(CancellationToken::new());
        state.authed_pubkey = Some(admin.public_key.clone());
        let mut ctx = outbound_ctx(&mut state, RelayMessage::event("sub", content.clone()));
        middleware.process_outbound(&mut ctx).await.unwrap();
        assert!(ctx.message.is_some());

        // A stranger does not.
        let mut state = factory.create_state(CancellationToken::new());
        state.authed_pubkey = Some(stranger.public_key.clone());
        let mut ctx = outbound_ctx(&mut state, RelayMessage::event("sub", content.clone()));
        middleware.process_outbound(&mut ctx).await.unwrap();
        assert!(ctx.message.is_none());

        // Neither does an unauthenticated reader.
        let mut state = factory.create_state(CancellationToken::new());
        let mut ctx = outbound_ctx(&mut state, RelayMessage::event("sub", content));
        middleware.process_outbound(&mut ctx).await.unwrap();
        assert!(ctx.message.is_none());
    }

    #[tokio::test]
    async fn non_group_outbound_frames_pass() {
        let relay = RelayKeys::generate();
        let author = RelayKeys::generate();
        let groups = Arc::new(Groups::new(relay.public_key.clone()));
        let middleware = GroupsPolicy::new(groups);
        let factory = ConnectionFactory::new("wss://relay.test".to_string());

        let note = sign_test_event(&author, 1, vec![], "public note");
        let mut state = factory.create_state(CancellationToken::new());
        let mut ctx = outbound_ctx(&mut state, RelayMessage::event("sub", note));
        middleware.process_outbound(&mut ctx).await.unwrap();
        assert!(ctx.message.is_some());
    }
}
