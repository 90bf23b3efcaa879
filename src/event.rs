//! Nostr event model and the fixed-size identifiers it is built from.

use std::{fmt, str::FromStr};

use bech32::{Bech32, Hrp};
use secp256k1::{schnorr::Signature, Keypair, Message, Secp256k1, XOnlyPublicKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Short text note.
pub const KIND_NOTE: u32 = 1;
/// NIP-04 encrypted direct message.
pub const KIND_ENCRYPTED_DIRECT_MESSAGE: u32 = 4;
/// NIP-25 reaction.
pub const KIND_REACTION: u32 = 7;
/// NIP-62 request to vanish.
pub const KIND_REQUEST_TO_VANISH: u32 = 62;

/// Name of the tag referencing another user's public key.
pub const PROFILE_TAG: &str = "p";

const NPUB_HRP: Hrp = Hrp::parse_unchecked("npub");

/// Reasons an identifier or event can be rejected at construction time.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("expected 32 bytes, got {0}")]
    Length(usize),
    #[error("invalid npub: {0}")]
    Npub(String),
    #[error("id does not match the event hash")]
    IdMismatch,
    #[error("signature verification failed: {0}")]
    Signature(#[from] secp256k1::Error),
    #[error("malformed event: {0}")]
    Json(#[from] serde_json::Error),
}

fn decode_hex32(s: &str) -> Result<[u8; 32], EventError> {
    let bytes = hex::decode(s.trim())?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| EventError::Length(bytes.len()))
}

/// Declares a 32-byte identifier that travels as lowercase hex.
macro_rules! hex32 {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name([u8; 32]);

        impl $name {
            pub fn from_bytes(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            /// Parse from hex; input case is ignored.
            pub fn from_hex(s: &str) -> Result<Self, EventError> {
                decode_hex32(s).map(Self)
            }

            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl FromStr for $name {
            type Err = EventError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::from_hex(s)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                Self::from_hex(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}

hex32!(
    /// Author or mentioned user key (x-only secp256k1 key).
    PublicKey
);

hex32!(
    /// SHA-256 of the canonical event serialization.
    EventId
);

impl PublicKey {
    /// Decode a NIP-19 `npub` string.
    pub fn from_npub(s: &str) -> Result<Self, EventError> {
        let (hrp, data) = bech32::decode(s).map_err(|e| EventError::Npub(e.to_string()))?;
        if hrp != NPUB_HRP {
            return Err(EventError::Npub(format!("unexpected prefix {hrp}")));
        }
        let bytes: [u8; 32] = data
            .as_slice()
            .try_into()
            .map_err(|_| EventError::Length(data.len()))?;
        Ok(Self(bytes))
    }

    /// Encode as a NIP-19 `npub` string.
    pub fn to_npub(&self) -> Result<String, EventError> {
        bech32::encode::<Bech32>(NPUB_HRP, &self.0).map_err(|e| EventError::Npub(e.to_string()))
    }
}

/// Wrapper for a Nostr tag expressed as an array of strings.
///
/// The first element names the tag and the second, when present, holds its
/// primary value. A `["p", "<hex key>"]` tag references another user and is
/// what mention extraction looks for. Tags are kept verbatim so custom tags
/// survive storage and re-verification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tag(pub Vec<String>);

impl Tag {
    pub fn name(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }

    pub fn is_profile(&self) -> bool {
        self.name() == Some(PROFILE_TAG)
    }
}

/// Event as it appears on the wire, before any validation.
#[derive(Deserialize)]
struct RawEvent {
    id: String,
    pubkey: String,
    created_at: u64,
    kind: u32,
    #[serde(default)]
    tags: Vec<Tag>,
    #[serde(default)]
    content: String,
    sig: String,
}

/// Canonical field order used whenever an event is written out.
#[derive(Serialize)]
struct EventRef<'a> {
    id: &'a EventId,
    pubkey: &'a PublicKey,
    created_at: u64,
    kind: u32,
    tags: &'a [Tag],
    content: &'a str,
    sig: &'a str,
}

/// Signed Nostr event. Instances only exist once the id and the Schnorr
/// signature have been checked.
///
/// ```json
/// {
///   "id": "…",
///   "pubkey": "…",
///   "created_at": 1700000000,
///   "kind": 1,
///   "tags": [["p", "…"]],
///   "content": "hello",
///   "sig": "…"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    id: EventId,
    pubkey: PublicKey,
    created_at: u64,
    kind: u32,
    tags: Vec<Tag>,
    content: String,
    sig: String,
    raw: String,
}

impl Event {
    /// Parse and verify an event from its JSON text.
    pub fn from_json(s: &str) -> Result<Self, EventError> {
        Self::from_raw(serde_json::from_str(s)?)
    }

    /// Parse and verify an event from an already decoded JSON value.
    pub fn from_value(val: Value) -> Result<Self, EventError> {
        Self::from_raw(serde_json::from_value(val)?)
    }

    /// Build and sign a new event with `keys`.
    pub fn sign(
        keys: &Keypair,
        created_at: u64,
        kind: u32,
        tags: Vec<Tag>,
        content: impl Into<String>,
    ) -> Result<Self, EventError> {
        let secp = Secp256k1::new();
        let pubkey = PublicKey(keys.x_only_public_key().0.serialize());
        let content = content.into();
        let hash = event_hash(&pubkey, created_at, kind, &tags, &content)?;
        let msg = Message::from_digest_slice(&hash)?;
        let sig = secp.sign_schnorr_no_aux_rand(&msg, keys);
        Self::from_raw(RawEvent {
            id: hex::encode(hash),
            pubkey: pubkey.to_hex(),
            created_at,
            kind,
            tags,
            content,
            sig: hex::encode(sig.as_ref()),
        })
    }

    fn from_raw(raw: RawEvent) -> Result<Self, EventError> {
        let id = EventId::from_hex(&raw.id)?;
        let pubkey = PublicKey::from_hex(&raw.pubkey)?;
        let hash = event_hash(&pubkey, raw.created_at, raw.kind, &raw.tags, &raw.content)?;
        if hash != id.0 {
            return Err(EventError::IdMismatch);
        }
        let sig_bytes = hex::decode(raw.sig.trim())?;
        let sig = Signature::from_slice(&sig_bytes)?;
        let key = XOnlyPublicKey::from_slice(&pubkey.0)?;
        let msg = Message::from_digest_slice(&hash)?;
        Secp256k1::verification_only().verify_schnorr(&sig, &msg, &key)?;

        let mut event = Event {
            id,
            pubkey,
            created_at: raw.created_at,
            kind: raw.kind,
            tags: raw.tags,
            content: raw.content,
            sig: hex::encode(sig_bytes),
            raw: String::new(),
        };
        event.raw = serde_json::to_string(&event.canonical())?;
        Ok(event)
    }

    fn canonical(&self) -> EventRef<'_> {
        EventRef {
            id: &self.id,
            pubkey: &self.pubkey,
            created_at: self.created_at,
            kind: self.kind,
            tags: &self.tags,
            content: &self.content,
            sig: &self.sig,
        }
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn pubkey(&self) -> PublicKey {
        self.pubkey
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn kind(&self) -> u32 {
        self.kind
    }

    pub fn tags(&self) -> &[Tag] {
        &self.tags
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn sig(&self) -> &str {
        &self.sig
    }

    /// Canonical serialized form, as persisted and re-verified on load.
    pub fn raw(&self) -> &str {
        &self.raw
    }
}

impl Serialize for Event {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.canonical().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Event {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawEvent::deserialize(deserializer)?;
        Event::from_raw(raw).map_err(serde::de::Error::custom)
    }
}

/// Recompute the Nostr event hash from its fields.
fn event_hash(
    pubkey: &PublicKey,
    created_at: u64,
    kind: u32,
    tags: &[Tag],
    content: &str,
) -> Result<[u8; 32], EventError> {
    let arr = serde_json::json!([0, pubkey.to_hex(), created_at, kind, tags, content]);
    let data = serde_json::to_vec(&arr)?;
    Ok(Sha256::digest(&data).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;

    #[test]
    fn signed_event_verifies_and_round_trips() {
        let keys = fixtures::keypair(1);
        let tagged = fixtures::public_key(2);
        let ev = Event::sign(
            &keys,
            1_700_000_000,
            KIND_NOTE,
            vec![Tag(vec!["p".into(), tagged.to_hex()])],
            "hello",
        )
        .unwrap();
        let parsed = Event::from_json(ev.raw()).unwrap();
        assert_eq!(parsed, ev);
        assert_eq!(parsed.tags()[0].value(), Some(tagged.to_hex().as_str()));
    }

    #[test]
    fn raw_uses_canonical_field_order() {
        let ev = fixtures::signed_event(1, KIND_NOTE, vec![], 5);
        let raw = ev.raw();
        let positions: Vec<usize> = ["\"id\"", "\"pubkey\"", "\"created_at\"", "\"kind\"", "\"tags\"", "\"content\"", "\"sig\""]
            .iter()
            .map(|k| raw.find(k).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn rejects_tampered_content() {
        let ev = fixtures::signed_event(1, KIND_NOTE, vec![], 5);
        let mut val: Value = serde_json::from_str(ev.raw()).unwrap();
        val["content"] = Value::String("changed".into());
        assert!(matches!(Event::from_value(val), Err(EventError::IdMismatch)));
    }

    #[test]
    fn rejects_bad_signature() {
        let ev = fixtures::signed_event(1, KIND_NOTE, vec![], 5);
        let mut val: Value = serde_json::from_str(ev.raw()).unwrap();
        val["sig"] = Value::String("00".repeat(64));
        assert!(matches!(Event::from_value(val), Err(EventError::Signature(_))));
    }

    #[test]
    fn uppercase_hex_is_canonicalized() {
        let ev = fixtures::signed_event(3, KIND_REACTION, vec![], 9);
        let mut val: Value = serde_json::from_str(ev.raw()).unwrap();
        val["id"] = Value::String(ev.id().to_hex().to_uppercase());
        val["pubkey"] = Value::String(ev.pubkey().to_hex().to_uppercase());
        let parsed = Event::from_value(val).unwrap();
        assert_eq!(parsed.id(), ev.id());
        assert_eq!(parsed.raw(), ev.raw());
    }

    #[test]
    fn identifiers_reject_wrong_length() {
        assert!(matches!(PublicKey::from_hex("abcd"), Err(EventError::Length(2))));
        assert!(EventId::from_hex("zz").is_err());
    }

    #[test]
    fn npub_matches_reference_vector() {
        let pk = PublicKey::from_hex(
            "3bf0c63fcb93463407af97a5e5ee64fa883d107ef9e558472c4eb9aaaefa459d",
        )
        .unwrap();
        let npub = pk.to_npub().unwrap();
        assert_eq!(
            npub,
            "npub180cvv07tjdrrgpa0j7j7tmnyl2yr6yr7l8j4s3evf6u64th6gkwsyjh6w6"
        );
        assert_eq!(PublicKey::from_npub(&npub).unwrap(), pk);
        assert!(PublicKey::from_npub("invalid").is_err());
    }
}
