//! Ordered handler chains for rejection, storage, query, count, delete
//! and replacement, plus kind-specific rejection chains and the
//! rate-limiting hook.

use crate::error::Error;
use crate::event::Event;
use crate::filter::{sort_and_limit, Filter};
use crate::store::EventStore;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{error, warn};

/// Connection-scoped facts handed to every policy check.
#[derive(Debug, Clone)]
pub struct EventContext {
    pub connection_id: String,
    pub authed_pubkey: Option<String>,
    pub relay_pubkey: String,
}

impl EventContext {
    pub fn new(connection_id: String, authed_pubkey: Option<String>, relay_pubkey: String) -> Self {
        Self {
            connection_id,
            authed_pubkey,
            relay_pubkey,
        }
    }
}

/// One link of a rejection chain. `Err(reason)` rejects the event with
/// that reason; the first rejection in a chain wins.
pub trait RejectEventPolicy: Send + Sync + std::fmt::Debug {
    fn check(&self, event: &Event, ctx: &EventContext) -> Result<(), String>;
}

/// Filter-side counterpart; a rejection surfaces as a NOTICE and the
/// subscription is not created.
pub trait RejectFilterPolicy: Send + Sync + std::fmt::Debug {
    fn check(&self, filters: &[Filter], ctx: &EventContext) -> Result<(), String>;
}

/// Throttling hook. No built-in implementation ships; deployments plug
/// their own.
pub trait RateLimiter: Send + Sync + std::fmt::Debug {
    fn check(&self, ctx: &EventContext) -> Result<(), String>;
}

/// The relay's handler registry.
///
/// Iteration contracts: reject chains run in insertion order and
/// short-circuit on the first rejection; the store and replace chains
/// stop at the first backend that accepts; the query chain concatenates
/// every backend's output (deduplicated by id) before ordering; the
/// delete chain always runs every backend, logging failures without
/// blocking.
#[derive(Debug, Default)]
pub struct PolicyPipeline {
    reject_event: Vec<Arc<dyn RejectEventPolicy>>,
    kind_reject: HashMap<u32, Vec<Arc<dyn RejectEventPolicy>>>,
    reject_filter: Vec<Arc<dyn RejectFilterPolicy>>,
    stores: Vec<Arc<dyn EventStore>>,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
}

impl PolicyPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_reject_policy(mut self, policy: Arc<dyn RejectEventPolicy>) -> Self {
        self.reject_event.push(policy);
        self
    }

    #[must_use]
    pub fn with_reject_policies(mut self, policies: Vec<Arc<dyn RejectEventPolicy>>) -> Self {
        self.reject_event.extend(policies);
        self
    }

    #[must_use]
    pub fn with_kind_policy(mut self, kind: u32, policy: Arc<dyn RejectEventPolicy>) -> Self {
        self.kind_reject.entry(kind).or_default().push(policy);
        self
    }

    #[must_use]
    pub fn with_filter_policy(mut self, policy: Arc<dyn RejectFilterPolicy>) -> Self {
        self.reject_filter.push(policy);
        self
    }

    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn EventStore>) -> Self {
        self.stores.push(store);
        self
    }

    #[must_use]
    pub fn with_rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub async fn init_stores(&self) -> Result<(), Error> {
        for store in &self.stores {
            store.init().await?;
        }
        Ok(())
    }

    /// Runs the general rejection chain, then the chain registered for
    /// the event's kind.
    pub fn check_event(&self, event: &Event, ctx: &EventContext) -> Result<(), Error> {
        if let Some(limiter) = &self.rate_limiter {
            if let Err(reason) = limiter.check(ctx) {
                return Err(Error::restricted(reason));
            }
        }

        for policy in &self.reject_event {
            if let Err(reason) = policy.check(event, ctx) {
                return Err(Error::notice(reason));
            }
        }

        if let Some(chain) = self.kind_reject.get(&event.kind) {
            for policy in chain {
                if let Err(reason) = policy.check(event, ctx) {
                    return Err(Error::notice(reason));
                }
            }
        }

        Ok(())
    }

    pub fn check_filters(&self, filters: &[Filter], ctx: &EventContext) -> Result<(), Error> {
        for policy in &self.reject_filter {
            if let Err(reason) = policy.check(filters, ctx) {
                return Err(Error::notice(reason));
            }
        }
        Ok(())
    }

    /// First backend to accept wins; later backends are archivers and do
    /// not run.
    pub async fn store_event(&self, event: &Event) -> Result<bool, Error> {
        for store in &self.stores {
            if store.save_event(event).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Concatenated backend outputs, deduplicated by id, newest first.
    pub async fn query_events(&self, filters: &[Filter]) -> Result<Vec<Event>, Error> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut merged: Vec<Event> = Vec::new();

        for store in &self.stores {
            for event in store.query(filters).await? {
                if seen.insert(event.id.clone()) {
                    merged.push(event);
                }
            }
        }

        sort_and_limit(&mut merged, None);
        Ok(merged)
    }

    /// First backend's count; remaining backends only back it up when the
    /// primary errors.
    pub async fn count_events(&self, filters: &[Filter]) -> Result<usize, Error> {
        let mut last_error = None;
        for store in &self.stores {
            match store.count(filters).await {
                Ok(count) => return Ok(count),
                Err(e) => {
                    warn!("count handler failed, trying next: {}", e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| Error::internal("no store registered")))
    }

    /// Every backend runs; failures are logged but never block. True if
    /// any backend applied the delete.
    pub async fn delete_event(&self, id: &str, pubkey: &str) -> Result<bool, Error> {
        let mut applied = false;
        for store in &self.stores {
            match store.delete_event(id, pubkey).await {
                Ok(deleted) => applied = applied || deleted,
                Err(e) => error!("delete handler failed for {}: {}", id, e),
            }
        }
        Ok(applied)
    }

    /// Same contract as the store chain; backends implement replacement
    /// atomically.
    pub async fn replace_event(&self, event: &Event) -> Result<bool, Error> {
        for store in &self.stores {
            if store.replace_event(event).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::RelayKeys;
    use crate::store::sqlite::SqliteStore;
    use crate::test_utils::sign_test_event;

    #[derive(Debug)]
    struct RejectAll(&'static str);

    impl RejectEventPolicy for RejectAll {
        fn check(&self, _event: &Event, _ctx: &EventContext) -> Result<(), String> {
            Err(self.0.to_string())
        }
    }

    #[derive(Debug)]
    struct AcceptAll;

    impl RejectEventPolicy for AcceptAll {
        fn check(&self, _event: &Event, _ctx: &EventContext) -> Result<(), String> {
            Ok(())
        }
    }

    fn ctx() -> EventContext {
        EventContext::new("conn".into(), None, "00".repeat(32))
    }

    #[test]
    fn first_rejection_wins() {
        let pipeline = PolicyPipeline::new()
            .with_reject_policy(Arc::new(AcceptAll))
            .with_reject_policy(Arc::new(RejectAll("first")))
            .with_reject_policy(Arc::new(RejectAll("second")));

        let keys = RelayKeys::generate();
        let event = sign_test_event(&keys, 1, vec![], "");
        let err = pipeline.check_event(&event, &ctx()).unwrap_err();
        assert_eq!(err.to_string(), "first");
    }

    #[test]
    fn kind_chain_runs_after_general_chain() {
        let pipeline = PolicyPipeline::new()
            .with_reject_policy(Arc::new(AcceptAll))
            .with_kind_policy(7, Arc::new(RejectAll("no reactions")));

        let keys = RelayKeys::generate();
        let note = sign_test_event(&keys, 1, vec![], "");
        assert!(pipeline.check_event(&note, &ctx()).is_ok());

        let reaction = sign_test_event(&keys, 7, vec![], "+");
        let err = pipeline.check_event(&reaction, &ctx()).unwrap_err();
        assert_eq!(err.to_string(), "no reactions");
    }

    #[tokio::test]
    async fn store_chain_stops_at_first_acceptance() {
        let primary = SqliteStore::open_in_memory().unwrap();
        let archive = SqliteStore::open_in_memory().unwrap();
        let pipeline = PolicyPipeline::new()
            .with_store(Arc::new(primary.clone()))
            .with_store(Arc::new(archive.clone()));
        pipeline.init_stores().await.unwrap();

        let keys = RelayKeys::generate();
        let event = sign_test_event(&keys, 1, vec![], "hi");
        assert!(pipeline.store_event(&event).await.unwrap());

        // The archive never saw the event; the primary did.
        assert_eq!(primary.count(&[Filter::new().kinds([1])]).await.unwrap(), 1);
        assert_eq!(archive.count(&[Filter::new().kinds([1])]).await.unwrap(), 0);

        // A duplicate is rejected by the primary and falls through to the
        // archive, which accepts it.
        assert!(pipeline.store_event(&event).await.unwrap());
        assert_eq!(archive.count(&[Filter::new().kinds([1])]).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn query_chain_merges_and_deduplicates() {
        let primary = SqliteStore::open_in_memory().unwrap();
        let archive = SqliteStore::open_in_memory().unwrap();
        let pipeline = PolicyPipeline::new()
            .with_store(Arc::new(primary.clone()))
            .with_store(Arc::new(archive.clone()));
        pipeline.init_stores().await.unwrap();

        let keys = RelayKeys::generate();
        let shared = sign_test_event(&keys, 1, vec![], "both");
        let only_archived = sign_test_event(&keys, 1, vec![], "archive");
        primary.save_event(&shared).await.unwrap();
        archive.save_event(&shared).await.unwrap();
        archive.save_event(&only_archived).await.unwrap();

        let found = pipeline
            .query_events(&[Filter::new().kinds([1])])
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
    }

    #[tokio::test]
    async fn delete_chain_runs_every_store() {
        let primary = SqliteStore::open_in_memory().unwrap();
        let archive = SqliteStore::open_in_memory().unwrap();
        let pipeline = PolicyPipeline::new()
            .with_store(Arc::new(primary.clone()))
            .with_store(Arc::new(archive.clone()));
        pipeline.init_stores().await.unwrap();

        let keys = RelayKeys::generate();
        let event = sign_test_event(&keys, 1, vec![], "hi");
        primary.save_event(&event).await.unwrap();
        archive.save_event(&event).await.unwrap();

        assert!(pipeline
            .delete_event(&event.id, &keys.public_key)
            .await
            .unwrap());
        assert_eq!(primary.count(&[Filter::new().kinds([1])]).await.unwrap(), 0);
        assert_eq!(archive.count(&[Filter::new().kinds([1])]).await.unwrap(), 0);
    }

    #[derive(Debug)]
    struct AlwaysThrottled;

    impl RateLimiter for AlwaysThrottled {
        fn check(&self, _ctx: &EventContext) -> Result<(), String> {
            Err("slow down".to_string())
        }
    }

    #[test]
    fn rate_limiter_runs_before_reject_chain() {
        let pipeline = PolicyPipeline::new()
            .with_rate_limiter(Arc::new(AlwaysThrottled))
            .with_reject_policy(Arc::new(RejectAll("unreached")));

        let keys = RelayKeys::generate();
        let event = sign_test_event(&keys, 1, vec![], "");
        let err = pipeline.check_event(&event, &ctx()).unwrap_err();
        assert!(err.to_string().contains("slow down"));
    }
}
