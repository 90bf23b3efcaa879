//! Push payload construction for mentions and follow changes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::event::{
    Event, EventError, EventId, PublicKey, KIND_ENCRYPTED_DIRECT_MESSAGE, KIND_NOTE,
    KIND_REACTION,
};
use crate::follow_change::FollowChangeBatch;
use crate::registration::ApnsToken;

/// Largest payload APNs accepts, in bytes.
pub const MAX_PAYLOAD_SIZE: usize = 4096;
/// Largest follow list that fits under [`MAX_PAYLOAD_SIZE`].
pub const MAX_TOTAL_NPUBS: usize = 58;

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error(
        "follow change batch for followee {followee} has too many npubs ({count}), max is {max}"
    )]
    TooManyFollows {
        followee: PublicKey,
        count: usize,
        max: usize,
    },
    #[error("payload is {size} bytes, max is {max}")]
    TooLarge { size: usize, max: usize },
    #[error("error encoding key: {0}")]
    Encoding(#[from] EventError),
    #[error("error serializing payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Whether the follow-change builder enforces the size ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validation {
    Enforce,
    /// Only for measuring payload sizes; never used when dispatching.
    Bypass,
}

/// A push generated for one device because of one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub event_id: EventId,
    pub uuid: Uuid,
    pub token: ApnsToken,
    #[serde(with = "payload_text")]
    pub payload: Vec<u8>,
    pub created_at: Option<DateTime<Utc>>,
}

impl Notification {
    pub fn new(event_id: EventId, token: ApnsToken, payload: Vec<u8>) -> Self {
        Self {
            event_id,
            uuid: Uuid::new_v4(),
            token,
            payload,
            created_at: Some(Utc::now()),
        }
    }
}

/// Payloads are always JSON, so they are stored as text.
mod payload_text {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&String::from_utf8_lossy(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        Ok(String::deserialize(d)?.into_bytes())
    }
}

#[derive(Serialize)]
struct Alert {
    #[serde(rename = "loc-key")]
    loc_key: &'static str,
    #[serde(rename = "loc-args", skip_serializing_if = "Vec::is_empty")]
    loc_args: Vec<String>,
}

impl Alert {
    fn new(loc_key: &'static str) -> Self {
        Self {
            loc_key,
            loc_args: Vec::new(),
        }
    }
}

#[derive(Serialize)]
struct MentionPayload<'a> {
    aps: MentionAps,
    event: &'a Event,
}

#[derive(Serialize)]
struct MentionAps {
    alert: Alert,
    category: &'static str,
}

#[derive(Serialize)]
struct FollowPayload<'a> {
    aps: FollowAps,
    data: FollowData<'a>,
}

#[derive(Serialize)]
struct FollowAps {
    alert: Alert,
    sound: &'static str,
    badge: u32,
    #[serde(rename = "thread-id")]
    thread_id: String,
    #[serde(rename = "interruption-level")]
    interruption_level: &'static str,
}

#[derive(Serialize)]
struct FollowData<'a> {
    follows: Vec<String>,
    #[serde(rename = "friendlyFollower", skip_serializing_if = "Option::is_none")]
    friendly_follower: Option<&'a str>,
}

/// Localization key and category for a mention of the given kind.
fn mention_alert(kind: u32) -> Option<(&'static str, &'static str)> {
    match kind {
        KIND_NOTE => Some(("NOTIFICATION_TAGGED_IN_NOTE", "event.tagged.note")),
        KIND_REACTION => Some(("NOTIFICATION_TAGGED_IN_REACTION", "event.tagged.reaction")),
        KIND_ENCRYPTED_DIRECT_MESSAGE => Some((
            "NOTIFICATION_TAGGED_IN_ENCRYPTED_DIRECT_MESSAGE",
            "event.tagged.encryptedDirectMessage",
        )),
        _ => None,
    }
}

/// Payload telling `mention` about `ev`, or `None` for self-mentions and
/// unsupported kinds.
pub fn mention_payload(mention: &PublicKey, ev: &Event) -> Result<Option<Vec<u8>>, PayloadError> {
    if *mention == ev.pubkey() {
        return Ok(None);
    }
    let Some((loc_key, category)) = mention_alert(ev.kind()) else {
        debug!(event_id = %ev.id(), kind = ev.kind(), "kind does not notify");
        return Ok(None);
    };
    let payload = MentionPayload {
        aps: MentionAps {
            alert: Alert::new(loc_key),
            category,
        },
        event: ev,
    };
    Ok(Some(serde_json::to_vec(&payload)?))
}

/// Mention notification for one device, if the event warrants one.
pub fn mention_notification(
    mention: &PublicKey,
    token: &ApnsToken,
    ev: &Event,
) -> Result<Option<Notification>, PayloadError> {
    Ok(mention_payload(mention, ev)?.map(|payload| Notification::new(ev.id(), token.clone(), payload)))
}

/// Follow-change payload with the size ceiling enforced.
pub fn follow_change_payload(batch: &FollowChangeBatch) -> Result<Vec<u8>, PayloadError> {
    follow_change_payload_with(batch, Validation::Enforce)
}

pub fn follow_change_payload_with(
    batch: &FollowChangeBatch,
    validation: Validation,
) -> Result<Vec<u8>, PayloadError> {
    let count = batch.follows.len();
    if validation == Validation::Enforce && count > MAX_TOTAL_NPUBS {
        return Err(PayloadError::TooManyFollows {
            followee: batch.followee,
            count,
            max: MAX_TOTAL_NPUBS,
        });
    }

    let single = count == 1;
    let friendly = batch.friendly_follower.as_str();
    let alert = if !single {
        Alert {
            loc_key: "xNewFollowers",
            loc_args: vec![count.to_string()],
        }
    } else if friendly.is_empty() || friendly.starts_with("npub") {
        Alert::new("newFollower")
    } else {
        Alert {
            loc_key: "namedNewFollower",
            loc_args: vec![friendly.to_string()],
        }
    };

    let payload = FollowPayload {
        aps: FollowAps {
            alert,
            sound: "default",
            badge: 1,
            thread_id: batch.followee.to_npub()?,
            interruption_level: "passive",
        },
        data: FollowData {
            follows: batch
                .follows
                .iter()
                .map(PublicKey::to_npub)
                .collect::<Result<_, _>>()?,
            friendly_follower: single.then_some(friendly),
        },
    };
    let bytes = serde_json::to_vec(&payload)?;
    if validation == Validation::Enforce && bytes.len() > MAX_PAYLOAD_SIZE {
        return Err(PayloadError::TooLarge {
            size: bytes.len(),
            max: MAX_PAYLOAD_SIZE,
        });
    }
    Ok(bytes)
}
