//! Per-connection state shared by every middleware.

use crate::connection::RelayConnection;
use crate::error::Error;
use crate::event::Event;
use crate::message::RelayMessage;
use crate::policy::EventContext;
use crate::store::StoreCommand;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use wspipe::StateFactory;

#[derive(Debug, Clone)]
pub struct ConnectionState {
    /// Canonical relay URL clients must echo in NIP-42 auth events.
    pub relay_url: String,
    pub challenge: Option<String>,
    pub authed_pubkey: Option<String>,
    pub relay_connection: Option<RelayConnection>,
    pub connection_token: CancellationToken,
    /// Live subscriptions, each with the token that stops its stored
    /// events from streaming once the subscription is dropped.
    pub subscriptions: HashMap<String, CancellationToken>,
}

impl ConnectionState {
    pub fn is_authenticated(&self) -> bool {
        self.authed_pubkey.is_some()
    }

    /// The pending challenge, minting one on first use.
    pub fn challenge_message(&mut self) -> RelayMessage {
        let challenge = match &self.challenge {
            Some(challenge) => challenge.clone(),
            None => {
                let challenge = format!("{:016x}", rand::random::<u64>());
                self.challenge = Some(challenge.clone());
                challenge
            }
        };
        RelayMessage::auth(challenge)
    }

    pub fn event_context(&self, connection_id: &str, relay_pubkey: &str) -> EventContext {
        EventContext::new(
            connection_id.to_string(),
            self.authed_pubkey.clone(),
            relay_pubkey.to_string(),
        )
    }

    /// Persists a command batch and returns the events to broadcast once
    /// the publisher's acknowledgement is queued.
    pub async fn commit_commands(
        &self,
        commands: Vec<StoreCommand>,
    ) -> Result<Vec<Event>, Error> {
        let Some(connection) = self.relay_connection.as_ref() else {
            return Err(Error::internal("no storage connection"));
        };
        connection.commit(commands).await
    }

    pub fn announce_events(&self, events: &[Event]) {
        if let Some(connection) = self.relay_connection.as_ref() {
            connection.announce(events);
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionFactory {
    relay_url: String,
}

impl ConnectionFactory {
    pub fn new(relay_url: String) -> Self {
        Self { relay_url }
    }
}

impl StateFactory<ConnectionState> for ConnectionFactory {
    fn create_state(&self, token: CancellationToken) -> ConnectionState {
        ConnectionState {
            relay_url: self.relay_url.clone(),
            challenge: None,
            authed_pubkey: None,
            relay_connection: None,
            connection_token: token,
            subscriptions: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_is_stable_once_minted() {
        let factory = ConnectionFactory::new("wss://relay.test".to_string());
        let mut state = factory.create_state(CancellationToken::new());
        assert!(state.challenge.is_none());

        let first = state.challenge_message().as_json();
        let second = state.challenge_message().as_json();
        assert_eq!(first, second);
        assert!(state.challenge.is_some());
    }

    #[test]
    fn fresh_state_is_unauthenticated() {
        let factory = ConnectionFactory::new("wss://relay.test".to_string());
        let state = factory.create_state(CancellationToken::new());
        assert!(!state.is_authenticated());
        assert!(state.relay_connection.is_none());
        assert!(state.subscriptions.is_empty());
    }
}
