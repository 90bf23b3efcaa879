//! Shared helpers for unit tests.

use secp256k1::{Keypair, Secp256k1};

use crate::event::{Event, PublicKey, Tag};
use crate::registration::{ApnsToken, RelayAddress};

pub fn keypair(seed: u8) -> Keypair {
    let secp = Secp256k1::new();
    Keypair::from_seckey_slice(&secp, &[seed; 32]).unwrap()
}

pub fn public_key(seed: u8) -> PublicKey {
    PublicKey::from_bytes(keypair(seed).x_only_public_key().0.serialize())
}

pub fn signed_event(seed: u8, kind: u32, tags: Vec<Tag>, created_at: u64) -> Event {
    Event::sign(&keypair(seed), created_at, kind, tags, "content").unwrap()
}

pub fn mention(pk: &PublicKey) -> Tag {
    Tag(vec!["p".into(), pk.to_hex()])
}

pub fn token(seed: u8) -> ApnsToken {
    ApnsToken::new(&hex::encode([seed; 32])).unwrap()
}

pub fn relay(addr: &str) -> RelayAddress {
    RelayAddress::parse(addr).unwrap()
}
