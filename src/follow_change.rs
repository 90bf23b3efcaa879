//! Aggregated follow/unfollow notices for a single followee.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::event::PublicKey;

/// Batch of follow changes produced by the followers service. Keys travel as
/// `npub` strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FollowChangeBatch {
    #[serde(with = "npub")]
    pub followee: PublicKey,
    #[serde(default)]
    pub friendly_follower: String,
    #[serde(default, with = "npubs")]
    pub follows: Vec<PublicKey>,
    #[serde(default, with = "npubs")]
    pub unfollows: Vec<PublicKey>,
}

impl fmt::Display for FollowChangeBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let followee = self
            .followee
            .to_npub()
            .unwrap_or_else(|_| self.followee.to_hex());
        match (self.follows.len(), self.unfollows.len()) {
            (1, 0) => write!(f, "Follow: {} -----> {}", self.friendly_follower, followee),
            (0, 1) => write!(f, "Unfollow: {} --x--> {}", self.friendly_follower, followee),
            (follows, unfollows) => write!(
                f,
                "Follow aggregate: {follows} follows, {unfollows} unfollows for {followee}"
            ),
        }
    }
}

mod npub {
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::event::PublicKey;

    pub fn serialize<S: Serializer>(pk: &PublicKey, s: S) -> Result<S::Ok, S::Error> {
        let encoded = pk.to_npub().map_err(serde::ser::Error::custom)?;
        s.serialize_str(&encoded)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<PublicKey, D::Error> {
        let s = String::deserialize(d)?;
        PublicKey::from_npub(&s).map_err(serde::de::Error::custom)
    }
}

mod npubs {
    use serde::{ser::SerializeSeq, Deserialize, Deserializer, Serializer};

    use crate::event::PublicKey;

    pub fn serialize<S: Serializer>(keys: &[PublicKey], s: S) -> Result<S::Ok, S::Error> {
        let mut seq = s.serialize_seq(Some(keys.len()))?;
        for pk in keys {
            let encoded = pk.to_npub().map_err(serde::ser::Error::custom)?;
            seq.serialize_element(&encoded)?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<PublicKey>, D::Error> {
        Vec::<String>::deserialize(d)?
            .iter()
            .map(|s| PublicKey::from_npub(s).map_err(serde::de::Error::custom))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;

    #[test]
    fn decodes_npub_wire_form() {
        let followee = fixtures::public_key(1);
        let a = fixtures::public_key(2);
        let b = fixtures::public_key(3);
        let json = serde_json::json!({
            "followee": followee.to_npub().unwrap(),
            "friendlyFollower": "FriendlyUser",
            "follows": [a.to_npub().unwrap()],
            "unfollows": [b.to_npub().unwrap()]
        });
        let batch: FollowChangeBatch = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(batch.followee, followee);
        assert_eq!(batch.follows, vec![a]);
        assert_eq!(batch.unfollows, vec![b]);
        assert_eq!(serde_json::to_value(&batch).unwrap(), json);
    }

    #[test]
    fn rejects_hex_keys() {
        let json = serde_json::json!({
            "followee": fixtures::public_key(1).to_hex(),
            "follows": []
        });
        assert!(serde_json::from_value::<FollowChangeBatch>(json).is_err());
    }

    #[test]
    fn display_forms() {
        let followee = fixtures::public_key(1);
        let npub = followee.to_npub().unwrap();
        let mut batch = FollowChangeBatch {
            followee,
            friendly_follower: "FriendlyUser".into(),
            follows: vec![fixtures::public_key(2)],
            unfollows: vec![],
        };
        assert_eq!(batch.to_string(), format!("Follow: FriendlyUser -----> {npub}"));

        batch.unfollows = std::mem::take(&mut batch.follows);
        assert_eq!(batch.to_string(), format!("Unfollow: FriendlyUser --x--> {npub}"));

        batch.follows = vec![fixtures::public_key(3), fixtures::public_key(4)];
        assert_eq!(
            batch.to_string(),
            format!("Follow aggregate: 2 follows, 1 unfollows for {npub}")
        );
    }
}
