//! Nostr event model: parsing, canonical hashing, signature checks and
//! kind classification.

use crate::error::Error;
use secp256k1::{schnorr::Signature, Message, Secp256k1, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

/// Ordered tag fields; the first element is the tag name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tag(pub Vec<String>);

impl Tag {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(fields.into_iter().map(Into::into).collect())
    }

    pub fn name(&self) -> &str {
        self.0.first().map(String::as_str).unwrap_or_default()
    }

    /// Second element, by convention the tag's value.
    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }
}

/// Signed, immutable protocol record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    /// Hex SHA-256 of the canonical serialization.
    pub id: String,
    /// Author x-only public key (hex).
    pub pubkey: String,
    /// Unix timestamp in seconds.
    pub created_at: u64,
    /// Kind number; drives persistence semantics.
    pub kind: u32,
    pub tags: Vec<Tag>,
    pub content: String,
    /// Hex Schnorr signature over the id.
    pub sig: String,
}

/// How replaceable kinds are classified.
///
/// `Nip01` covers kind 0, kind 3 and the 10000..20000 range; `Legacy`
/// narrows replaceable semantics to kind 0 (addressable kinds behave the
/// same in both modes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplaceableMode {
    #[default]
    Nip01,
    Legacy,
}

/// Persistence class derived from an event's kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClass {
    Regular,
    Replaceable,
    Ephemeral,
    Addressable,
}

pub fn classify_kind(kind: u32, mode: ReplaceableMode) -> EventClass {
    match kind {
        20000..=29999 => EventClass::Ephemeral,
        30000..=39999 => EventClass::Addressable,
        0 => EventClass::Replaceable,
        3 | 10000..=19999 if mode == ReplaceableMode::Nip01 => EventClass::Replaceable,
        _ => EventClass::Regular,
    }
}

fn require_hex(value: &str, len: usize, field: &str) -> Result<(), Error> {
    if value.len() != len || !value.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::notice(format!(
            "invalid: {field} must be {len} hex characters"
        )));
    }
    Ok(())
}

impl Event {
    /// Parses an event object, checking field presence, types and hex
    /// lengths. Signature validity is a separate step ([`Event::verify`]).
    pub fn from_value(value: &Value) -> Result<Self, Error> {
        let obj = value
            .as_object()
            .ok_or_else(|| Error::notice("invalid: event is not a JSON object"))?;

        let field_str = |name: &str| -> Result<String, Error> {
            obj.get(name)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| Error::notice(format!("invalid: missing event field '{name}'")))
        };
        let field_u64 = |name: &str| -> Result<u64, Error> {
            obj.get(name)
                .and_then(Value::as_u64)
                .ok_or_else(|| Error::notice(format!("invalid: missing event field '{name}'")))
        };

        let id = field_str("id")?;
        let pubkey = field_str("pubkey")?;
        let created_at = field_u64("created_at")?;
        let kind = u32::try_from(field_u64("kind")?)
            .map_err(|_| Error::notice("invalid: event kind out of range"))?;
        let content = field_str("content")?;
        let sig = field_str("sig")?;

        require_hex(&id, 64, "id")?;
        require_hex(&pubkey, 64, "pubkey")?;
        require_hex(&sig, 128, "sig")?;

        let raw_tags = obj
            .get("tags")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::notice("invalid: missing event field 'tags'"))?;

        let mut tags = Vec::with_capacity(raw_tags.len());
        for raw_tag in raw_tags {
            let fields = raw_tag
                .as_array()
                .ok_or_else(|| Error::notice("invalid: tag is not an array"))?
                .iter()
                .map(|f| {
                    f.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| Error::notice("invalid: tag field is not a string"))
                })
                .collect::<Result<Vec<_>, _>>()?;
            if fields.is_empty() {
                return Err(Error::notice("invalid: empty tag"));
            }
            tags.push(Tag(fields));
        }

        Ok(Self {
            id,
            pubkey,
            created_at,
            kind,
            tags,
            content,
            sig,
        })
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).expect("event serialization is infallible")
    }

    /// SHA-256 over `[0, pubkey, created_at, kind, tags, content]`.
    pub fn compute_id_hash(&self) -> Result<[u8; 32], Error> {
        canonical_hash(&self.pubkey, self.created_at, self.kind, &self.tags, &self.content)
    }

    /// Checks that the id matches the canonical hash and that the
    /// signature is a valid Schnorr signature by `pubkey` over the id.
    pub fn verify(&self) -> Result<(), Error> {
        let hash = self.compute_id_hash()?;
        if hex::encode(hash) != self.id {
            return Err(Error::notice(
                "invalid: event id does not match its contents",
            ));
        }

        let sig_bytes = hex::decode(&self.sig)
            .map_err(|_| Error::notice("invalid: signature is not valid hex"))?;
        let sig = Signature::from_slice(&sig_bytes)
            .map_err(|_| Error::notice("invalid: malformed signature"))?;
        let pk_bytes = hex::decode(&self.pubkey)
            .map_err(|_| Error::notice("invalid: pubkey is not valid hex"))?;
        let pk = XOnlyPublicKey::from_slice(&pk_bytes)
            .map_err(|_| Error::notice("invalid: malformed pubkey"))?;

        let secp = Secp256k1::verification_only();
        let msg = Message::from_digest_slice(&hash)
            .map_err(|_| Error::internal("event hash is not a valid message digest"))?;
        secp.verify_schnorr(&sig, &msg, &pk)
            .map_err(|_| Error::notice("invalid: event signature verification failed"))
    }

    pub fn classify(&self, mode: ReplaceableMode) -> EventClass {
        classify_kind(self.kind, mode)
    }

    pub fn is_ephemeral(&self) -> bool {
        matches!(classify_kind(self.kind, ReplaceableMode::Nip01), EventClass::Ephemeral)
    }

    /// The replacement identity of this event, if it has one:
    /// `"kind:pubkey"` for replaceable kinds, `"kind:pubkey:d"` for
    /// addressable kinds (a missing `d` tag counts as the empty string).
    pub fn address(&self, mode: ReplaceableMode) -> Option<String> {
        match self.classify(mode) {
            EventClass::Replaceable => Some(format!("{}:{}", self.kind, self.pubkey)),
            EventClass::Addressable => Some(format!(
                "{}:{}:{}",
                self.kind,
                self.pubkey,
                self.d_tag()
            )),
            _ => None,
        }
    }

    /// The `d` tag value, with a missing tag coerced to the empty string.
    pub fn d_tag(&self) -> &str {
        self.tag_value("d").unwrap_or_default()
    }

    /// Value of the first tag with the given name.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.name() == name)
            .and_then(Tag::value)
    }

    /// Values of every tag with the given name.
    pub fn tag_values<'a>(&'a self, name: &str) -> Vec<&'a str> {
        self.tags
            .iter()
            .filter(|t| t.name() == name)
            .filter_map(Tag::value)
            .collect()
    }

    pub fn has_tag(&self, name: &str) -> bool {
        self.tags.iter().any(|t| t.name() == name)
    }

    /// Newest-wins comparison: greater `created_at` wins, ties go to the
    /// lexicographically smaller id.
    pub fn supersedes(&self, other: &Event) -> bool {
        self.created_at > other.created_at
            || (self.created_at == other.created_at && self.id < other.id)
    }
}

/// An event the relay is about to author itself; signed via
/// [`crate::keys::RelayKeys`].
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub kind: u32,
    pub content: String,
    pub tags: Vec<Tag>,
}

impl EventDraft {
    pub fn new<S: Into<String>>(kind: u32, content: S) -> Self {
        Self {
            kind,
            content: content.into(),
            tags: Vec::new(),
        }
    }

    #[must_use]
    pub fn tag(mut self, tag: Tag) -> Self {
        self.tags.push(tag);
        self
    }

    #[must_use]
    pub fn tags<I: IntoIterator<Item = Tag>>(mut self, tags: I) -> Self {
        self.tags.extend(tags);
        self
    }
}

pub(crate) fn canonical_hash(
    pubkey: &str,
    created_at: u64,
    kind: u32,
    tags: &[Tag],
    content: &str,
) -> Result<[u8; 32], Error> {
    let canonical = serde_json::json!([0, pubkey, created_at, kind, tags, content]);
    let bytes = serde_json::to_vec(&canonical)
        .map_err(|e| Error::internal(format!("canonical serialization failed: {e}")))?;
    Ok(Sha256::digest(&bytes).into())
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
