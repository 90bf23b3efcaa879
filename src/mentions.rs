//! Mention extraction from `p` tags.

use tracing::debug;

use crate::event::{Event, PublicKey};

/// Distinct public keys referenced by the event's `p` tags, in tag order.
/// Tags whose value is not a valid key are skipped.
pub fn mentions(ev: &Event) -> Vec<PublicKey> {
    let mut out: Vec<PublicKey> = Vec::new();
    for tag in ev.tags().iter().filter(|t| t.is_profile()) {
        let Some(value) = tag.value() else { continue };
        match PublicKey::from_hex(value) {
            Ok(pk) if !out.contains(&pk) => out.push(pk),
            Ok(_) => {}
            Err(err) => debug!(event_id = %ev.id(), %err, "skipping malformed p tag"),
        }
    }
    out
}
