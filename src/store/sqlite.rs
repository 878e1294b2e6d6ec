//! Reference relational backend.
//!
//! One `events` table keyed by id, a side table indexing tag name/value
//! pairs, and the composite indices the query planner needs. Every filter
//! is folded into parameter-bound SQL; untrusted values never reach the
//! SQL text.

use crate::error::Error;
use crate::event::{classify_kind, Event, EventClass, ReplaceableMode, Tag};
use crate::filter::Filter;
use crate::store::EventStore;
use async_trait::async_trait;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, Transaction};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    id TEXT PRIMARY KEY,
    pubkey TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    kind INTEGER NOT NULL,
    tags TEXT NOT NULL,
    content TEXT NOT NULL,
    sig TEXT NOT NULL,
    d_tag TEXT NOT NULL DEFAULT ''
);

CREATE INDEX IF NOT EXISTS idx_events_pubkey ON events(pubkey);
CREATE INDEX IF NOT EXISTS idx_events_created_at ON events(created_at);
CREATE INDEX IF NOT EXISTS idx_events_kind ON events(kind);
CREATE INDEX IF NOT EXISTS idx_events_pubkey_kind ON events(pubkey, kind);
CREATE INDEX IF NOT EXISTS idx_events_created_kind ON events(created_at, kind);
CREATE INDEX IF NOT EXISTS idx_events_address ON events(pubkey, kind, d_tag);

CREATE TABLE IF NOT EXISTS event_tags (
    event_id TEXT NOT NULL,
    name TEXT NOT NULL,
    value TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_event_tags_name_value ON event_tags(name, value);
CREATE INDEX IF NOT EXISTS idx_event_tags_event ON event_tags(event_id);
"#;

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self, Error> {
        Ok(Self {
            conn: Arc::new(Mutex::new(Connection::open_in_memory()?)),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// WHERE clause plus bound parameters for one filter.
fn filter_clause(filter: &Filter) -> (String, Vec<SqlValue>) {
    let mut conditions: Vec<String> = Vec::new();
    let mut binds: Vec<SqlValue> = Vec::new();

    if let Some(ids) = &filter.ids {
        let mut alts = Vec::with_capacity(ids.len());
        for id in ids {
            alts.push("substr(id, 1, ?) = ?".to_string());
            binds.push(SqlValue::Integer(id.len() as i64));
            binds.push(SqlValue::Text(id.clone()));
        }
        conditions.push(format!("({})", alts.join(" OR ")));
    }

    if let Some(authors) = &filter.authors {
        let mut alts = Vec::with_capacity(authors.len());
        for author in authors {
            alts.push("substr(pubkey, 1, ?) = ?".to_string());
            binds.push(SqlValue::Integer(author.len() as i64));
            binds.push(SqlValue::Text(author.clone()));
        }
        conditions.push(format!("({})", alts.join(" OR ")));
    }

    if let Some(kinds) = &filter.kinds {
        let placeholders = vec!["?"; kinds.len()].join(", ");
        conditions.push(format!("kind IN ({placeholders})"));
        binds.extend(kinds.iter().map(|k| SqlValue::Integer(*k as i64)));
    }

    if let Some(since) = filter.since {
        conditions.push("created_at >= ?".to_string());
        binds.push(SqlValue::Integer(since as i64));
    }

    if let Some(until) = filter.until {
        conditions.push("created_at <= ?".to_string());
        binds.push(SqlValue::Integer(until as i64));
    }

    for (name, values) in &filter.tags {
        let placeholders = vec!["?"; values.len()].join(", ");
        conditions.push(format!(
            "EXISTS (SELECT 1 FROM event_tags \
             WHERE event_tags.event_id = events.id \
             AND event_tags.name = ? AND event_tags.value IN ({placeholders}))"
        ));
        binds.push(SqlValue::Text(name.clone()));
        binds.extend(values.iter().map(|v| SqlValue::Text(v.clone())));
    }

    if conditions.is_empty() {
        conditions.push("1 = 1".to_string());
    }

    (conditions.join(" AND "), binds)
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    let tags_json: String = row.get("tags")?;
    let tags: Vec<Tag> = serde_json::from_str(&tags_json).unwrap_or_default();
    Ok(Event {
        id: row.get("id")?,
        pubkey: row.get("pubkey")?,
        created_at: row.get::<_, i64>("created_at")? as u64,
        kind: row.get::<_, i64>("kind")? as u32,
        tags,
        content: row.get("content")?,
        sig: row.get("sig")?,
    })
}

/// Inserts an event and its tag index rows. Returns false on duplicate id.
fn insert_event(tx: &Transaction<'_>, event: &Event) -> Result<bool, Error> {
    let tags_json = serde_json::to_string(&event.tags)
        .map_err(|e| Error::internal(format!("tag serialization failed: {e}")))?;

    let inserted = tx.execute(
        "INSERT INTO events (id, pubkey, created_at, kind, tags, content, sig, d_tag) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
         ON CONFLICT(id) DO NOTHING",
        params![
            event.id,
            event.pubkey,
            event.created_at as i64,
            event.kind as i64,
            tags_json,
            event.content,
            event.sig,
            event.d_tag(),
        ],
    )?;

    if inserted == 0 {
        return Ok(false);
    }

    for tag in &event.tags {
        if let Some(value) = tag.value() {
            tx.execute(
                "INSERT INTO event_tags (event_id, name, value) VALUES (?1, ?2, ?3)",
                params![event.id, tag.name(), value],
            )?;
        }
    }

    Ok(true)
}

fn remove_event(tx: &Transaction<'_>, id: &str) -> Result<(), Error> {
    tx.execute("DELETE FROM events WHERE id = ?1", params![id])?;
    tx.execute("DELETE FROM event_tags WHERE event_id = ?1", params![id])?;
    Ok(())
}

#[async_trait]
impl EventStore for SqliteStore {
    async fn init(&self) -> Result<(), Error> {
        self.lock().execute_batch(SCHEMA)?;
        Ok(())
    }

    async fn save_event(&self, event: &Event) -> Result<bool, Error> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let inserted = insert_event(&tx, event)?;
        tx.commit()?;
        Ok(inserted)
    }

    async fn query(&self, filters: &[Filter]) -> Result<Vec<Event>, Error> {
        let conn = self.lock();
        let mut seen: HashSet<String> = HashSet::new();
        let mut results: Vec<Event> = Vec::new();

        for filter in filters {
            let (clause, mut binds) = filter_clause(filter);
            let mut sql = format!(
                "SELECT id, pubkey, created_at, kind, tags, content, sig FROM events \
                 WHERE {clause} ORDER BY created_at DESC, id ASC"
            );
            if let Some(limit) = filter.limit {
                sql.push_str(" LIMIT ?");
                binds.push(SqlValue::Integer(limit as i64));
            }

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(binds), row_to_event)?;
            for event in rows {
                let event = event?;
                if seen.insert(event.id.clone()) {
                    results.push(event);
                }
            }
        }

        Ok(results)
    }

    async fn count(&self, filters: &[Filter]) -> Result<usize, Error> {
        let conn = self.lock();
        let mut seen: HashSet<String> = HashSet::new();

        for filter in filters {
            let (clause, binds) = filter_clause(filter);
            let sql = format!("SELECT id FROM events WHERE {clause}");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(binds), |row| row.get::<_, String>(0))?;
            for id in rows {
                seen.insert(id?);
            }
        }

        Ok(seen.len())
    }

    async fn delete_event(&self, id: &str, pubkey: &str) -> Result<bool, Error> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let deleted = tx.execute(
            "DELETE FROM events WHERE id = ?1 AND pubkey = ?2",
            params![id, pubkey],
        )?;
        if deleted > 0 {
            tx.execute("DELETE FROM event_tags WHERE event_id = ?1", params![id])?;
        }
        tx.commit()?;
        Ok(deleted > 0)
    }

    async fn replace_event(&self, event: &Event) -> Result<bool, Error> {
        let addressable = matches!(
            classify_kind(event.kind, ReplaceableMode::Nip01),
            EventClass::Addressable
        );

        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let existing: Vec<(String, u64)> = {
            let (sql, binds): (&str, Vec<SqlValue>) = if addressable {
                (
                    "SELECT id, created_at FROM events \
                     WHERE pubkey = ?1 AND kind = ?2 AND d_tag = ?3",
                    vec![
                        SqlValue::Text(event.pubkey.clone()),
                        SqlValue::Integer(event.kind as i64),
                        SqlValue::Text(event.d_tag().to_string()),
                    ],
                )
            } else {
                (
                    "SELECT id, created_at FROM events WHERE pubkey = ?1 AND kind = ?2",
                    vec![
                        SqlValue::Text(event.pubkey.clone()),
                        SqlValue::Integer(event.kind as i64),
                    ],
                )
            };

            let mut stmt = tx.prepare(sql)?;
            let rows = stmt.query_map(params_from_iter(binds), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        let newest = existing.iter().all(|(id, created_at)| {
            event.created_at > *created_at
                || (event.created_at == *created_at && event.id < *id)
        });

        if !newest {
            return Ok(false);
        }

        for (id, _) in &existing {
            remove_event(&tx, id)?;
        }
        insert_event(&tx, event)?;
        tx.commit()?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::RelayKeys;
    use crate::test_utils::{sign_test_event, sign_test_event_at};

    async fn test_store() -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        store.init().await.unwrap();
        store
    }

    #[tokio::test]
    async fn init_is_idempotent() {
        let store = test_store().await;
        store.init().await.unwrap();
    }

    #[tokio::test]
    async fn save_rejects_duplicate_ids() {
        let store = test_store().await;
        let keys = RelayKeys::generate();
        let event = sign_test_event(&keys, 1, vec![], "hi");

        assert!(store.save_event(&event).await.unwrap());
        assert!(!store.save_event(&event).await.unwrap());

        let found = store.query(&[Filter::new().kinds([1])]).await.unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn query_matches_scalar_and_tag_filters() {
        let store = test_store().await;
        let keys = RelayKeys::generate();
        let tagged = sign_test_event_at(&keys, 1, vec![Tag::new(["t", "news"])], "a", 10);
        let plain = sign_test_event_at(&keys, 1, vec![], "b", 20);
        let other_kind = sign_test_event_at(&keys, 7, vec![], "c", 30);
        for event in [&tagged, &plain, &other_kind] {
            store.save_event(event).await.unwrap();
        }

        let by_kind = store.query(&[Filter::new().kinds([1])]).await.unwrap();
        assert_eq!(by_kind.len(), 2);

        let by_tag = store
            .query(&[Filter::new().tag("t", ["news"])])
            .await
            .unwrap();
        assert_eq!(by_tag.len(), 1);
        assert_eq!(by_tag[0].id, tagged.id);

        let by_author_prefix = store
            .query(&[Filter::new().authors([&keys.public_key[..10]])])
            .await
            .unwrap();
        assert_eq!(by_author_prefix.len(), 3);

        let by_id_prefix = store
            .query(&[Filter::new().ids([&plain.id[..12]])])
            .await
            .unwrap();
        assert_eq!(by_id_prefix.len(), 1);
        assert_eq!(by_id_prefix[0].id, plain.id);

        let windowed = store
            .query(&[Filter::new().since(15).until(25)])
            .await
            .unwrap();
        assert_eq!(windowed.len(), 1);
        assert_eq!(windowed[0].id, plain.id);
    }

    #[tokio::test]
    async fn query_orders_and_limits() {
        let store = test_store().await;
        let keys = RelayKeys::generate();
        for (content, created_at) in [("a", 10), ("b", 30), ("c", 20)] {
            let event = sign_test_event_at(&keys, 1, vec![], content, created_at);
            store.save_event(&event).await.unwrap();
        }

        let all = store.query(&[Filter::new().kinds([1])]).await.unwrap();
        let stamps: Vec<u64> = all.iter().map(|e| e.created_at).collect();
        assert_eq!(stamps, vec![30, 20, 10]);

        let capped = store
            .query(&[Filter::new().kinds([1]).limit(2)])
            .await
            .unwrap();
        assert_eq!(capped.len(), 2);
        assert_eq!(capped[0].created_at, 30);
    }

    #[tokio::test]
    async fn query_deduplicates_across_filters() {
        let store = test_store().await;
        let keys = RelayKeys::generate();
        let event = sign_test_event(&keys, 1, vec![], "hi");
        store.save_event(&event).await.unwrap();

        let found = store
            .query(&[
                Filter::new().kinds([1]),
                Filter::new().authors([keys.public_key.clone()]),
            ])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn replace_keeps_only_the_newest_per_address() {
        let store = test_store().await;
        let keys = RelayKeys::generate();
        let old = sign_test_event_at(&keys, 0, vec![], r#"{"name":"a"}"#, 100);
        let new = sign_test_event_at(&keys, 0, vec![], r#"{"name":"b"}"#, 200);

        assert!(store.replace_event(&old).await.unwrap());
        assert!(store.replace_event(&new).await.unwrap());

        let found = store.query(&[Filter::new().kinds([0])]).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, new.id);

        // A stale replacement leaves the store untouched.
        assert!(!store.replace_event(&old).await.unwrap());
        let found = store.query(&[Filter::new().kinds([0])]).await.unwrap();
        assert_eq!(found[0].id, new.id);
    }

    #[tokio::test]
    async fn replace_scopes_addressable_events_by_d_tag() {
        let store = test_store().await;
        let keys = RelayKeys::generate();
        let x1 = sign_test_event_at(&keys, 30000, vec![Tag::new(["d", "x"])], "", 1);
        let y1 = sign_test_event_at(&keys, 30000, vec![Tag::new(["d", "y"])], "", 1);
        assert!(store.replace_event(&x1).await.unwrap());
        assert!(store.replace_event(&y1).await.unwrap());

        let found = store.query(&[Filter::new().kinds([30000])]).await.unwrap();
        assert_eq!(found.len(), 2);

        let x2 = sign_test_event_at(&keys, 30000, vec![Tag::new(["d", "x"])], "", 2);
        assert!(store.replace_event(&x2).await.unwrap());

        let found = store.query(&[Filter::new().kinds([30000])]).await.unwrap();
        assert_eq!(found.len(), 2);
        assert!(found.iter().any(|e| e.id == x2.id));
        assert!(found.iter().all(|e| e.id != x1.id));
    }

    #[tokio::test]
    async fn replace_ties_go_to_the_smaller_id() {
        let store = test_store().await;
        let keys = RelayKeys::generate();
        let a = sign_test_event_at(&keys, 0, vec![], "a", 100);
        let b = sign_test_event_at(&keys, 0, vec![], "b", 100);
        let (small, large) = if a.id < b.id { (a, b) } else { (b, a) };

        assert!(store.replace_event(&large).await.unwrap());
        assert!(store.replace_event(&small).await.unwrap());
        assert!(!store.replace_event(&large).await.unwrap());

        let found = store.query(&[Filter::new().kinds([0])]).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, small.id);
    }

    #[tokio::test]
    async fn delete_is_scoped_to_the_author() {
        let store = test_store().await;
        let keys = RelayKeys::generate();
        let stranger = RelayKeys::generate();
        let event = sign_test_event(&keys, 1, vec![], "hi");
        store.save_event(&event).await.unwrap();

        assert!(!store
            .delete_event(&event.id, &stranger.public_key)
            .await
            .unwrap());
        assert!(store
            .delete_event(&event.id, &keys.public_key)
            .await
            .unwrap());
        assert!(store
            .query(&[Filter::new().kinds([1])])
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn count_deduplicates_across_filters() {
        let store = test_store().await;
        let keys = RelayKeys::generate();
        for content in ["a", "b"] {
            let event = sign_test_event(&keys, 1, vec![], content);
            store.save_event(&event).await.unwrap();
        }

        let count = store
            .count(&[
                Filter::new().kinds([1]),
                Filter::new().authors([keys.public_key.clone()]),
            ])
            .await
            .unwrap();
        assert_eq!(count, 2);
    }
}
