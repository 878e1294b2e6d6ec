//! Per-connection subscription bookkeeping and live fan-out.
//!
//! Each WebSocket owns one [`RelayConnection`]. A subscription task keeps
//! the id → filter-set table and matches broadcast events against it; a
//! second task funnels the store's broadcast feed into that matcher. A
//! slow peer does not stall anyone: fan-out uses non-blocking sends and
//! drops the subscription when the peer's buffer is full.

use crate::error::Error;
use crate::event::Event;
use crate::filter::Filter;
use crate::message::RelayMessage;
use crate::relay_store::RelayStore;
use crate::store::StoreCommand;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use wspipe::{MessageSender, SendError};

#[derive(Debug)]
enum SubscriptionMessage {
    Add(String, Vec<Filter>),
    Remove(String),
    CheckEvent {
        event: Event,
        sender: MessageSender<RelayMessage>,
    },
}

#[derive(Debug, Clone)]
pub struct RelayConnection {
    id: String,
    store: Arc<RelayStore>,
    subscription_tx: mpsc::UnboundedSender<SubscriptionMessage>,
}

impl RelayConnection {
    pub fn new(
        id: String,
        store: Arc<RelayStore>,
        cancellation_token: CancellationToken,
        outgoing: MessageSender<RelayMessage>,
    ) -> Self {
        let (subscription_tx, subscription_rx) = mpsc::unbounded_channel();

        let connection = Self {
            id: id.clone(),
            store: store.clone(),
            subscription_tx,
        };

        spawn_subscription_task(id.clone(), subscription_rx, cancellation_token.clone());
        spawn_broadcast_task(
            id,
            store,
            connection.subscription_tx.clone(),
            outgoing,
            cancellation_token,
        );

        connection
    }

    /// Registers a subscription; an existing one with the same id is
    /// replaced.
    pub fn add_subscription(&self, subscription_id: String, filters: Vec<Filter>) {
        if let Err(e) = self
            .subscription_tx
            .send(SubscriptionMessage::Add(subscription_id, filters))
        {
            error!("[{}] failed to register subscription: {}", self.id, e);
        }
    }

    pub fn remove_subscription(&self, subscription_id: &str) {
        if let Err(e) = self
            .subscription_tx
            .send(SubscriptionMessage::Remove(subscription_id.to_string()))
        {
            error!("[{}] failed to drop subscription: {}", self.id, e);
        }
    }

    /// Runs the persistence half of a command batch and returns the
    /// events ready to broadcast. The caller queues the publisher's OK
    /// between this and [`RelayConnection::announce`] so the acknowledge
    /// always precedes the fan-out.
    pub async fn commit(&self, commands: Vec<StoreCommand>) -> Result<Vec<Event>, Error> {
        let mut announced = Vec::new();
        for command in commands {
            match command {
                StoreCommand::SaveSignedEvent(event) => {
                    self.store.persist(&event).await?;
                    announced.push(event);
                }
                StoreCommand::SaveUnsignedEvent(draft) => {
                    // Relay-authored follow-ups replace their predecessors;
                    // losing that race is not a client-visible failure.
                    match self.store.save_relay_event(draft).await {
                        Ok(_) => {}
                        Err(Error::Notice { message, .. }) => {
                            debug!("[{}] relay event superseded: {}", self.id, message);
                        }
                        Err(e) => return Err(e),
                    }
                }
                StoreCommand::DeleteEvents(filter) => {
                    let deleted = self.store.delete_matching(filter).await?;
                    debug!("[{}] deleted {} events", self.id, deleted);
                }
            }
        }
        Ok(announced)
    }

    /// Broadcasts previously committed events to every live subscription.
    pub fn announce(&self, events: &[Event]) {
        for event in events {
            self.store.announce(event);
        }
    }
}

fn spawn_subscription_task(
    id: String,
    mut subscription_rx: mpsc::UnboundedReceiver<SubscriptionMessage>,
    token: CancellationToken,
) {
    tokio::spawn(async move {
        let mut subscriptions: HashMap<String, Vec<Filter>> = HashMap::new();

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("[{}] subscription task shutting down", id);
                    break;
                }
                Some(message) = subscription_rx.recv() => match message {
                    SubscriptionMessage::Add(subscription_id, filters) => {
                        debug!(
                            "[{}] subscription {} registered ({} active)",
                            id,
                            subscription_id,
                            subscriptions.len() + 1
                        );
                        subscriptions.insert(subscription_id, filters);
                    }
                    SubscriptionMessage::Remove(subscription_id) => {
                        if subscriptions.remove(&subscription_id).is_some() {
                            debug!("[{}] subscription {} dropped", id, subscription_id);
                        }
                    }
                    SubscriptionMessage::CheckEvent { event, sender } => {
                        fan_out(&id, &event, &mut subscriptions, sender);
                    }
                },
                else => break,
            }
        }
    });
}

/// Sends one EVENT frame per matching subscription. A full outbound
/// buffer drops the subscription and tells the client why.
fn fan_out(
    id: &str,
    event: &Event,
    subscriptions: &mut HashMap<String, Vec<Filter>>,
    mut sender: MessageSender<RelayMessage>,
) {
    let mut overloaded: Vec<String> = Vec::new();

    for (subscription_id, filters) in subscriptions.iter() {
        if !filters.iter().any(|f| f.matches(event)) {
            continue;
        }

        let message = RelayMessage::event(subscription_id.clone(), event.clone());
        match sender.try_send(message) {
            Ok(()) => {}
            Err(SendError::Full) => {
                warn!(
                    "[{}] subscription {} overloaded, dropping it",
                    id, subscription_id
                );
                overloaded.push(subscription_id.clone());
            }
            Err(SendError::Closed) => return,
        }
    }

    for subscription_id in overloaded {
        subscriptions.remove(&subscription_id);
        let _ = sender.try_send(RelayMessage::notice(format!(
            "subscription {subscription_id} overloaded"
        )));
    }
}

fn spawn_broadcast_task(
    id: String,
    store: Arc<RelayStore>,
    subscription_tx: mpsc::UnboundedSender<SubscriptionMessage>,
    outgoing: MessageSender<RelayMessage>,
    token: CancellationToken,
) {
    let mut broadcast_rx = store.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("[{}] broadcast task shutting down", id);
                    break;
                }
                received = broadcast_rx.recv() => match received {
                    Ok(event) => {
                        if subscription_tx
                            .send(SubscriptionMessage::CheckEvent {
                                event,
                                sender: outgoing.clone(),
                            })
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("[{}] broadcast receiver lagged, {} events skipped", id, skipped);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    });
}
