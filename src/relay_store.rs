//! Storage front door: runs the policy pipeline's storage chains,
//! resolves replaceable/addressable semantics and feeds the live
//! broadcast channel.

use crate::error::Error;
use crate::event::{classify_kind, unix_now, Event, EventClass, EventDraft, ReplaceableMode, Tag};
use crate::filter::Filter;
use crate::keys::RelayKeys;
use crate::policy::PolicyPipeline;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, error};

#[derive(Debug)]
pub struct RelayStore {
    pipeline: Arc<PolicyPipeline>,
    keys: Arc<RelayKeys>,
    event_tx: broadcast::Sender<Event>,
    replaceable_mode: ReplaceableMode,
    max_limit: usize,
    /// Last `created_at` issued per relay-authored address, so successive
    /// snapshots within one second still replace their predecessors.
    snapshot_stamps: Mutex<HashMap<String, u64>>,
}

impl RelayStore {
    pub fn new(
        pipeline: Arc<PolicyPipeline>,
        keys: Arc<RelayKeys>,
        replaceable_mode: ReplaceableMode,
        max_limit: usize,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(1024);
        Self {
            pipeline,
            keys,
            event_tx,
            replaceable_mode,
            max_limit,
            snapshot_stamps: Mutex::new(HashMap::new()),
        }
    }

    pub fn relay_pubkey(&self) -> &str {
        &self.keys.public_key
    }

    pub fn pipeline(&self) -> &PolicyPipeline {
        &self.pipeline
    }

    pub fn replaceable_mode(&self) -> ReplaceableMode {
        self.replaceable_mode
    }

    /// Live feed of every accepted event, ephemeral ones included.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Persists an event according to its kind class without announcing
    /// it. Ephemeral events are accepted as-is; replaceable and
    /// addressable events go through the newest-wins resolver; everything
    /// else appends through the store chain.
    pub async fn persist(&self, event: &Event) -> Result<(), Error> {
        match event.classify(self.replaceable_mode) {
            EventClass::Ephemeral => {
                debug!("ephemeral event {} not persisted", event.id);
                Ok(())
            }
            EventClass::Replaceable | EventClass::Addressable => {
                if self.pipeline.replace_event(event).await? {
                    Ok(())
                } else {
                    Err(Error::notice("replaced by newer"))
                }
            }
            EventClass::Regular => {
                if self.pipeline.store_event(event).await? {
                    Ok(())
                } else {
                    Err(Error::duplicate("duplicate: already have this event"))
                }
            }
        }
    }

    /// Pushes an accepted event to every live subscription. Callers must
    /// have queued the publisher's OK first.
    pub fn announce(&self, event: &Event) {
        if let Err(e) = self.event_tx.send(event.clone()) {
            // Only fails when nobody is listening.
            debug!("no live subscribers for event {}: {}", event.id, e);
        }
    }

    /// Signs, persists and announces a relay-authored event.
    pub async fn save_relay_event(&self, draft: EventDraft) -> Result<Event, Error> {
        let stamp = self.next_stamp(&self.draft_address(&draft));
        let event = self.keys.sign_draft_at(draft, stamp)?;
        self.persist(&event).await?;
        self.announce(&event);
        Ok(event)
    }

    fn draft_address(&self, draft: &EventDraft) -> String {
        match classify_kind(draft.kind, self.replaceable_mode) {
            EventClass::Addressable => {
                let d = draft
                    .tags
                    .iter()
                    .find(|t| t.name() == "d")
                    .and_then(Tag::value)
                    .unwrap_or_default();
                format!("{}:{}:{}", draft.kind, self.keys.public_key, d)
            }
            _ => format!("{}:{}", draft.kind, self.keys.public_key),
        }
    }

    fn next_stamp(&self, address: &str) -> u64 {
        let mut stamps = self
            .snapshot_stamps
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = unix_now();
        let stamp = stamps.get(address).map_or(now, |last| now.max(last + 1));
        stamps.insert(address.to_string(), stamp);
        stamp
    }

    /// Stored events matching the filters, with each filter's limit
    /// clamped to the configured maximum.
    pub async fn query(&self, filters: &[Filter]) -> Result<Vec<Event>, Error> {
        let clamped: Vec<Filter> = filters
            .iter()
            .map(|f| {
                let mut f = f.clone();
                f.limit = Some(f.limit.map_or(self.max_limit, |l| l.min(self.max_limit)));
                f
            })
            .collect();
        self.pipeline.query_events(&clamped).await
    }

    pub async fn count(&self, filters: &[Filter]) -> Result<usize, Error> {
        self.pipeline.count_events(filters).await
    }

    /// Author-scoped delete through the delete chain.
    pub async fn delete(&self, id: &str, pubkey: &str) -> Result<bool, Error> {
        self.pipeline.delete_event(id, pubkey).await
    }

    /// Deletes every stored event matching the filter, author-scoped per
    /// event. Failures on individual events are logged and skipped.
    pub async fn delete_matching(&self, filter: Filter) -> Result<usize, Error> {
        let events = self.pipeline.query_events(&[filter]).await?;
        let mut deleted = 0;
        for event in events {
            match self.pipeline.delete_event(&event.id, &event.pubkey).await {
                Ok(true) => deleted += 1,
                Ok(false) => {}
                Err(e) => error!("failed to delete event {}: {}", event.id, e),
            }
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Tag;
    use crate::test_utils::{sign_test_event, sign_test_event_at, test_relay_store};

    #[tokio::test]
    async fn regular_events_append_and_reject_duplicates() {
        let (store, keys) = test_relay_store().await;
        let event = sign_test_event(&keys, 1, vec![], "hi");

        store.persist(&event).await.unwrap();
        let err = store.persist(&event).await.unwrap_err();
        assert!(err.to_string().starts_with("duplicate"));

        let found = store.query(&[Filter::new().kinds([1])]).await.unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn ephemeral_events_are_never_stored() {
        let (store, keys) = test_relay_store().await;
        let event = sign_test_event(&keys, 21000, vec![], "gone");

        store.persist(&event).await.unwrap();
        let found = store.query(&[Filter::new().kinds([21000])]).await.unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn replaceable_resolution_rejects_stale_events() {
        let (store, keys) = test_relay_store().await;
        let newer = sign_test_event_at(&keys, 0, vec![], r#"{"name":"b"}"#, 200);
        let older = sign_test_event_at(&keys, 0, vec![], r#"{"name":"a"}"#, 100);

        store.persist(&newer).await.unwrap();
        let err = store.persist(&older).await.unwrap_err();
        assert_eq!(err.to_string(), "replaced by newer");

        let found = store.query(&[Filter::new().kinds([0])]).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, newer.id);
    }

    #[tokio::test]
    async fn nip01_mode_replaces_kind_10002() {
        let (store, keys) = test_relay_store().await;
        assert_eq!(store.replaceable_mode(), ReplaceableMode::Nip01);

        let first = sign_test_event_at(&keys, 10002, vec![], "", 100);
        let second = sign_test_event_at(&keys, 10002, vec![], "", 200);
        store.persist(&first).await.unwrap();
        store.persist(&second).await.unwrap();
        let found = store.query(&[Filter::new().kinds([10002])]).await.unwrap();
        assert_eq!(found.len(), 1, "nip01 mode keeps one relay-list");
    }

    #[tokio::test]
    async fn relay_events_are_signed_with_the_relay_key() {
        let (store, _) = test_relay_store().await;
        let draft = EventDraft::new(39002, "").tag(Tag::new(["d", "g1"]));
        let event = store.save_relay_event(draft).await.unwrap();

        assert_eq!(event.pubkey, store.relay_pubkey());
        assert!(event.verify().is_ok());

        let found = store.query(&[Filter::new().kinds([39002])]).await.unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn query_clamps_limits() {
        let (store, keys) = test_relay_store().await;
        for i in 0..5 {
            let event = sign_test_event_at(&keys, 1, vec![], &format!("{i}"), 100 + i);
            store.persist(&event).await.unwrap();
        }

        // test_relay_store caps max_limit at 3
        let found = store.query(&[Filter::new().kinds([1])]).await.unwrap();
        assert_eq!(found.len(), 3);
        assert_eq!(found[0].created_at, 104);
    }

    #[tokio::test]
    async fn delete_matching_scopes_by_author() {
        let (store, keys) = test_relay_store().await;
        let a = sign_test_event_at(&keys, 1, vec![Tag::new(["t", "x"])], "a", 1);
        let b = sign_test_event_at(&keys, 1, vec![], "b", 2);
        store.persist(&a).await.unwrap();
        store.persist(&b).await.unwrap();

        let deleted = store
            .delete_matching(Filter::new().tag("t", ["x"]))
            .await
            .unwrap();
        assert_eq!(deleted, 1);

        let found = store.query(&[Filter::new().kinds([1])]).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, b.id);
    }
}
