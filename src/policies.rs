//! Built-in rejection policies, toggled from the `policies` section of
//! the configuration.

use crate::config::PolicySettings;
use crate::event::{unix_now, Event};
use crate::policy::{EventContext, RejectEventPolicy};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Rejects events of configured kinds outright.
#[derive(Debug)]
pub struct ForbiddenKinds {
    kinds: HashSet<u32>,
}

impl RejectEventPolicy for ForbiddenKinds {
    fn check(&self, event: &Event, _ctx: &EventContext) -> Result<(), String> {
        if self.kinds.contains(&event.kind) {
            return Err(format!("blocked: kind {} not accepted here", event.kind));
        }
        Ok(())
    }
}

/// Caps the number of tags per event.
#[derive(Debug)]
pub struct MaxTags {
    limit: usize,
}

impl RejectEventPolicy for MaxTags {
    fn check(&self, event: &Event, _ctx: &EventContext) -> Result<(), String> {
        if event.tags.len() > self.limit {
            return Err(format!("invalid: more than {} tags", self.limit));
        }
        Ok(())
    }
}

/// Caps the content size in bytes.
#[derive(Debug)]
pub struct MaxContentBytes {
    limit: usize,
}

impl RejectEventPolicy for MaxContentBytes {
    fn check(&self, event: &Event, _ctx: &EventContext) -> Result<(), String> {
        if event.content.len() > self.limit {
            return Err(format!("invalid: content longer than {} bytes", self.limit));
        }
        Ok(())
    }
}

/// Bounds `created_at` against the wall clock in both directions.
#[derive(Debug)]
pub struct CreatedAtBounds {
    max_future_secs: u64,
    max_past_secs: Option<u64>,
}

impl RejectEventPolicy for CreatedAtBounds {
    fn check(&self, event: &Event, _ctx: &EventContext) -> Result<(), String> {
        let now = unix_now();
        if event.created_at > now + self.max_future_secs {
            return Err("invalid: created_at is too far in the future".to_string());
        }
        if let Some(max_past) = self.max_past_secs {
            if event.created_at + max_past < now {
                return Err("invalid: created_at is too far in the past".to_string());
            }
        }
        Ok(())
    }
}

/// Rejects events from specific pubkeys.
#[derive(Debug)]
pub struct PubkeyBlocklist {
    pubkeys: HashSet<String>,
}

impl RejectEventPolicy for PubkeyBlocklist {
    fn check(&self, event: &Event, _ctx: &EventContext) -> Result<(), String> {
        if self.pubkeys.contains(&event.pubkey) {
            return Err("blocked: pubkey not accepted here".to_string());
        }
        Ok(())
    }
}

/// Only accepts events from an explicit pubkey set. The relay's own key
/// is always allowed.
#[derive(Debug)]
pub struct PubkeyAllowlist {
    pubkeys: HashSet<String>,
}

impl RejectEventPolicy for PubkeyAllowlist {
    fn check(&self, event: &Event, ctx: &EventContext) -> Result<(), String> {
        if event.pubkey == ctx.relay_pubkey || self.pubkeys.contains(&event.pubkey) {
            return Ok(());
        }
        Err("restricted: pubkey not on the allowlist".to_string())
    }
}

/// Requires an authenticated session for specific kinds.
#[derive(Debug)]
pub struct AuthRequiredKinds {
    kinds: HashSet<u32>,
}

impl RejectEventPolicy for AuthRequiredKinds {
    fn check(&self, event: &Event, ctx: &EventContext) -> Result<(), String> {
        if self.kinds.contains(&event.kind) && ctx.authed_pubkey.is_none() {
            return Err(format!(
                "auth-required: kind {} needs an authenticated session",
                event.kind
            ));
        }
        Ok(())
    }
}

/// Requires named tags to be present, per kind.
#[derive(Debug)]
pub struct RequiredTags {
    by_kind: HashMap<u32, Vec<String>>,
}

impl RejectEventPolicy for RequiredTags {
    fn check(&self, event: &Event, _ctx: &EventContext) -> Result<(), String> {
        if let Some(required) = self.by_kind.get(&event.kind) {
            for name in required {
                if !event.has_tag(name) {
                    return Err(format!(
                        "invalid: kind {} requires a '{}' tag",
                        event.kind, name
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Rejects empty content for specific kinds.
#[derive(Debug)]
pub struct NonEmptyContentKinds {
    kinds: HashSet<u32>,
}

impl RejectEventPolicy for NonEmptyContentKinds {
    fn check(&self, event: &Event, _ctx: &EventContext) -> Result<(), String> {
        if self.kinds.contains(&event.kind) && event.content.is_empty() {
            return Err(format!("invalid: kind {} requires content", event.kind));
        }
        Ok(())
    }
}

/// Rejects events carrying configured tag values.
#[derive(Debug)]
pub struct BlockedTagValues {
    by_name: HashMap<String, HashSet<String>>,
}

impl RejectEventPolicy for BlockedTagValues {
    fn check(&self, event: &Event, _ctx: &EventContext) -> Result<(), String> {
        for tag in &event.tags {
            if let (name, Some(value)) = (tag.name(), tag.value()) {
                if self
                    .by_name
                    .get(name)
                    .is_some_and(|blocked| blocked.contains(value))
                {
                    return Err(format!("blocked: tag value '{value}' not accepted here"));
                }
            }
        }
        Ok(())
    }
}

/// Cheap structural check before the real signature verification runs.
#[derive(Debug)]
pub struct SigLengthCheck;

impl RejectEventPolicy for SigLengthCheck {
    fn check(&self, event: &Event, _ctx: &EventContext) -> Result<(), String> {
        if event.sig.len() != 128 || !event.sig.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err("invalid: signature must be 128 hex characters".to_string());
        }
        Ok(())
    }
}

/// Kind-0 content must be a JSON object carrying a name.
#[derive(Debug)]
pub struct MetadataJsonName;

impl RejectEventPolicy for MetadataJsonName {
    fn check(&self, event: &Event, _ctx: &EventContext) -> Result<(), String> {
        let parsed: serde_json::Value = serde_json::from_str(&event.content)
            .map_err(|_| "invalid: kind 0 content is not valid JSON".to_string())?;
        let has_name = parsed
            .as_object()
            .is_some_and(|obj| obj.get("name").is_some_and(|n| n.is_string()));
        if !has_name {
            return Err("invalid: kind 0 content must carry a name".to_string());
        }
        Ok(())
    }
}

/// Instantiates the standard policies a configuration enables, in their
/// fixed chain order.
pub fn standard_policies(settings: &PolicySettings) -> Vec<Arc<dyn RejectEventPolicy>> {
    let mut chain: Vec<Arc<dyn RejectEventPolicy>> = Vec::new();

    if settings.check_sig_length {
        chain.push(Arc::new(SigLengthCheck));
    }
    if !settings.forbidden_kinds.is_empty() {
        chain.push(Arc::new(ForbiddenKinds {
            kinds: settings.forbidden_kinds.iter().copied().collect(),
        }));
    }
    if let Some(limit) = settings.max_tags {
        chain.push(Arc::new(MaxTags { limit }));
    }
    if let Some(limit) = settings.max_content_bytes {
        chain.push(Arc::new(MaxContentBytes { limit }));
    }
    chain.push(Arc::new(CreatedAtBounds {
        max_future_secs: settings.created_at_future_secs,
        max_past_secs: settings.created_at_past_secs,
    }));
    if !settings.blocked_pubkeys.is_empty() {
        chain.push(Arc::new(PubkeyBlocklist {
            pubkeys: settings.blocked_pubkeys.iter().cloned().collect(),
        }));
    }
    if let Some(allowed) = &settings.allowed_pubkeys {
        chain.push(Arc::new(PubkeyAllowlist {
            pubkeys: allowed.iter().cloned().collect(),
        }));
    }
    if !settings.auth_required_kinds.is_empty() {
        chain.push(Arc::new(AuthRequiredKinds {
            kinds: settings.auth_required_kinds.iter().copied().collect(),
        }));
    }
    if !settings.required_tags.is_empty() {
        chain.push(Arc::new(RequiredTags {
            by_kind: settings
                .required_tags
                .iter()
                .map(|rule| (rule.kind, rule.tags.clone()))
                .collect(),
        }));
    }
    if !settings.non_empty_content_kinds.is_empty() {
        chain.push(Arc::new(NonEmptyContentKinds {
            kinds: settings.non_empty_content_kinds.iter().copied().collect(),
        }));
    }
    if !settings.blocked_tag_values.is_empty() {
        chain.push(Arc::new(BlockedTagValues {
            by_name: settings
                .blocked_tag_values
                .iter()
                .map(|(name, values)| (name.clone(), values.iter().cloned().collect()))
                .collect(),
        }));
    }

    chain
}

/// The kind-specific chains a configuration enables. Kind 0 metadata
/// validation lives here rather than in the general chain.
pub fn standard_kind_policies(
    settings: &PolicySettings,
) -> Vec<(u32, Arc<dyn RejectEventPolicy>)> {
    let mut chains: Vec<(u32, Arc<dyn RejectEventPolicy>)> = Vec::new();
    if settings.validate_kind0_metadata {
        chains.push((0, Arc::new(MetadataJsonName)));
    }
    chains
}
