//! Abstract persistence contract. The relay core only ever talks to
//! backends through this trait; the reference backend lives in
//! [`sqlite`].

pub mod sqlite;

use crate::error::Error;
use crate::event::{Event, EventDraft};
use crate::filter::Filter;
use async_trait::async_trait;

/// Contract every storage backend satisfies.
///
/// `replace_event` is atomic: either the incoming event supplants every
/// event sharing its address or the store is unchanged. `save_event`
/// rejects duplicate ids by returning `Ok(false)`.
#[async_trait]
pub trait EventStore: Send + Sync + std::fmt::Debug {
    /// Idempotent setup (schema creation, directory layout, ...).
    async fn init(&self) -> Result<(), Error>;

    /// Persists an event; `Ok(false)` means the id is already stored.
    async fn save_event(&self, event: &Event) -> Result<bool, Error>;

    /// Events matching any of the filters, each filter's limit applied
    /// after ordering by `created_at` descending, ties by ascending id.
    async fn query(&self, filters: &[Filter]) -> Result<Vec<Event>, Error>;

    /// Number of distinct events matching any of the filters.
    async fn count(&self, filters: &[Filter]) -> Result<usize, Error>;

    /// Deletes one event scoped to its author; `Ok(false)` if nothing
    /// matched.
    async fn delete_event(&self, id: &str, pubkey: &str) -> Result<bool, Error>;

    /// Replaces all events sharing the incoming event's address.
    /// `Ok(false)` means a stored event is as new or newer and the store
    /// was left untouched.
    async fn replace_event(&self, event: &Event) -> Result<bool, Error>;
}

/// Deferred storage work produced by the group state machine and executed
/// by the connection that accepted the triggering event.
#[derive(Debug, Clone)]
pub enum StoreCommand {
    SaveSignedEvent(Event),
    /// Relay-authored; signed with the relay keys at execution time.
    SaveUnsignedEvent(EventDraft),
    DeleteEvents(Filter),
}
