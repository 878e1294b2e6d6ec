//! NIP-42 authentication: a challenge is pushed as soon as the
//! connection opens; a signed kind-22242 response binds a pubkey to the
//! session.

use crate::event::Event;
use crate::message::{ClientMessage, RelayMessage};
use crate::session::ConnectionState;
use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, warn};
use wspipe::{ConnectionContext, InboundContext, Middleware, SendMessage};

pub const KIND_CLIENT_AUTH: u32 = 22242;

/// Seconds of clock skew tolerated on the auth event's timestamp.
const MAX_AUTH_EVENT_AGE: u64 = 600;

#[derive(Debug)]
pub struct Nip42Auth {
    relay_url: String,
}

impl Nip42Auth {
    pub fn new(relay_url: String) -> Self {
        Self { relay_url }
    }

    /// Validates a challenge response; `Some(pubkey)` on success.
    pub fn authed_pubkey(&self, event: &Event, challenge: Option<&str>, now: u64) -> Option<String> {
        let Some(challenge) = challenge else {
            warn!("auth event before any challenge was issued");
            return None;
        };

        if event.kind != KIND_CLIENT_AUTH {
            warn!("auth event has kind {}, expected {}", event.kind, KIND_CLIENT_AUTH);
            return None;
        }

        if now.abs_diff(event.created_at) > MAX_AUTH_EVENT_AGE {
            warn!(
                "auth event timestamp {} too far from now {}",
                event.created_at, now
            );
            return None;
        }

        if event.tag_value("challenge") != Some(challenge) {
            warn!("auth event carries a stale or missing challenge");
            return None;
        }

        let relay_tag = event.tag_value("relay").map(|u| u.trim_end_matches('/'));
        if relay_tag != Some(self.relay_url.trim_end_matches('/')) {
            warn!(
                "auth event relay tag {:?} does not match {}",
                relay_tag, self.relay_url
            );
            return None;
        }

        if let Err(e) = event.verify() {
            warn!("auth event failed verification: {}", e);
            return None;
        }

        Some(event.pubkey.clone())
    }
}

#[async_trait]
impl Middleware for Nip42Auth {
    type State = ConnectionState;
    type IncomingMessage = ClientMessage;
    type OutgoingMessage = RelayMessage;

    async fn process_inbound(
        &self,
        ctx: &mut InboundContext<'_, Self::State, Self::IncomingMessage, Self::OutgoingMessage>,
    ) -> Result<()> {
        match &ctx.message {
            ClientMessage::Auth(event) => {
                debug!("[{}] auth attempt with event {}", ctx.connection_id, event.id);

                ctx.state.authed_pubkey = self.authed_pubkey(
                    event,
                    ctx.state.challenge.as_deref(),
                    crate::event::unix_now(),
                );

                let response = if ctx.state.is_authenticated() {
                    RelayMessage::ok(event.id.clone(), true, "")
                } else {
                    RelayMessage::ok(
                        event.id.clone(),
                        false,
                        "auth-failed: invalid authentication event",
                    )
                };
                ctx.send_message(response).await
            }
            _ => ctx.next().await,
        }
    }

    async fn on_connect(
        &self,
        ctx: &mut ConnectionContext<'_, Self::State, Self::IncomingMessage, Self::OutgoingMessage>,
    ) -> Result<()> {
        let challenge = ctx.state.challenge_message();
        ctx.send_message(challenge).await?;
        ctx.next().await
    }
}
