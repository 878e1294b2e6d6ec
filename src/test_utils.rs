use crate::event::{unix_now, Event, EventDraft, ReplaceableMode, Tag};
use crate::keys::RelayKeys;
use crate::policy::PolicyPipeline;
use crate::relay_store::RelayStore;
use crate::store::sqlite::SqliteStore;
use std::sync::Arc;

pub fn sign_test_event(keys: &RelayKeys, kind: u32, tags: Vec<Tag>, content: &str) -> Event {
    sign_test_event_at(keys, kind, tags, content, unix_now())
}

pub fn sign_test_event_at(
    keys: &RelayKeys,
    kind: u32,
    tags: Vec<Tag>,
    content: &str,
    created_at: u64,
) -> Event {
    keys.sign_draft_at(EventDraft::new(kind, content).tags(tags), created_at)
        .unwrap()
}

/// In-memory relay store with a small query cap, plus a client key pair.
pub async fn test_relay_store() -> (Arc<RelayStore>, RelayKeys) {
    let sqlite = SqliteStore::open_in_memory().unwrap();
    let pipeline = Arc::new(PolicyPipeline::new().with_store(Arc::new(sqlite)));
    pipeline.init_stores().await.unwrap();

    let relay_keys = Arc::new(RelayKeys::generate());
    let store = Arc::new(RelayStore::new(
        pipeline,
        relay_keys,
        ReplaceableMode::Nip01,
        3,
    ));
    (store, RelayKeys::generate())
}
