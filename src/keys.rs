//! The relay's own signing identity, used for relay-authored group
//! moderation and metadata events.

use crate::error::Error;
use crate::event::{canonical_hash, unix_now, Event, EventDraft};
use secp256k1::{All, Keypair, Message, Secp256k1, SecretKey};

pub struct RelayKeys {
    secp: Secp256k1<All>,
    keypair: Keypair,
    /// Hex x-only public key.
    pub public_key: String,
}

impl std::fmt::Debug for RelayKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayKeys")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

impl RelayKeys {
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let keypair = Keypair::new(&secp, &mut rand::thread_rng());
        let public_key = hex::encode(keypair.x_only_public_key().0.serialize());
        Self {
            secp,
            keypair,
            public_key,
        }
    }

    pub fn from_hex(secret_hex: &str) -> Result<Self, Error> {
        let bytes = hex::decode(secret_hex)
            .map_err(|_| Error::internal("relay secret key is not valid hex"))?;
        let secret = SecretKey::from_slice(&bytes)
            .map_err(|_| Error::internal("relay secret key is not a valid scalar"))?;
        let secp = Secp256k1::new();
        let keypair = Keypair::from_secret_key(&secp, &secret);
        let public_key = hex::encode(keypair.x_only_public_key().0.serialize());
        Ok(Self {
            secp,
            keypair,
            public_key,
        })
    }

    /// Signs a draft stamped with the current time.
    pub fn sign_draft(&self, draft: EventDraft) -> Result<Event, Error> {
        self.sign_draft_at(draft, unix_now())
    }

    pub fn sign_draft_at(&self, draft: EventDraft, created_at: u64) -> Result<Event, Error> {
        let hash = canonical_hash(
            &self.public_key,
            created_at,
            draft.kind,
            &draft.tags,
            &draft.content,
        )?;
        let msg = Message::from_digest_slice(&hash)
            .map_err(|_| Error::internal("event hash is not a valid message digest"))?;
        let sig = self.secp.sign_schnorr_no_aux_rand(&msg, &self.keypair);

        Ok(Event {
            id: hex::encode(hash),
            pubkey: self.public_key.clone(),
            created_at,
            kind: draft.kind,
            tags: draft.tags,
            content: draft.content,
            sig: hex::encode(sig.as_ref()),
        })
    }
}
