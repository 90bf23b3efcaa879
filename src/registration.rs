//! Device registrations: which push token wants mentions of which keys, and
//! on which relays those keys are read.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::event::{Event, EventError, PublicKey};

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("invalid relay address {0:?}: {1}")]
    RelayAddress(String, String),
    #[error("invalid apns token {0:?}")]
    Token(String),
    #[error("invalid public key: {0}")]
    PublicKey(#[from] EventError),
    #[error("malformed registration content: {0}")]
    Content(#[from] serde_json::Error),
    #[error("no public keys in registration")]
    NoKeys,
    #[error("missing relays for {0}")]
    MissingRelays(PublicKey),
    #[error("registration author {0} is not one of the registered keys")]
    ForeignAuthor(PublicKey),
}

/// Normalized `ws://` or `wss://` relay endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RelayAddress {
    url: String,
    host: String,
}

impl RelayAddress {
    pub fn parse(s: &str) -> Result<Self, RegistrationError> {
        let err = |reason: &str| RegistrationError::RelayAddress(s.to_string(), reason.to_string());
        let trimmed = s.trim().trim_end_matches('/');
        let parsed = Url::parse(trimmed).map_err(|e| err(&e.to_string()))?;
        if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
            return Err(err("invalid protocol"));
        }
        let host = parsed
            .host_str()
            .ok_or_else(|| err("missing host"))?
            .to_lowercase();
        let url = parsed.as_str().trim_end_matches('/').to_string();
        Ok(Self { url, host })
    }

    pub fn as_str(&self) -> &str {
        &self.url
    }

    /// Host without the port, used for suffix-based filtering.
    pub fn host_without_port(&self) -> &str {
        &self.host
    }

    pub fn is_secure(&self) -> bool {
        self.url.starts_with("wss://")
    }
}

impl fmt::Display for RelayAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

impl TryFrom<String> for RelayAddress {
    type Error = RegistrationError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<RelayAddress> for String {
    fn from(r: RelayAddress) -> Self {
        r.url
    }
}

/// Device push token, lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ApnsToken(String);

impl ApnsToken {
    pub fn new(s: &str) -> Result<Self, RegistrationError> {
        let s = s.trim();
        if s.is_empty() || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(RegistrationError::Token(s.to_string()));
        }
        Ok(Self(s.to_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ApnsToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ApnsToken {
    type Error = RegistrationError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(&s)
    }
}

impl From<ApnsToken> for String {
    fn from(t: ApnsToken) -> Self {
        t.0
    }
}

/// One public key and the relays it should be followed on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredKey {
    pub public_key: PublicKey,
    pub relays: Vec<RelayAddress>,
}

/// A push token bound to one or more keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub apns_token: ApnsToken,
    pub public_keys: Vec<RegisteredKey>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistrationContent {
    apns_token: String,
    public_key: Option<String>,
    #[serde(default)]
    relays: Vec<RelayContent>,
    public_keys: Option<Vec<KeyContent>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeyContent {
    public_key: String,
    #[serde(default)]
    relays: Vec<RelayContent>,
}

#[derive(Deserialize)]
struct RelayContent {
    address: String,
}

impl Registration {
    /// Build a registration from a signed registration event.
    ///
    /// The content is either the single key form
    /// `{"apnsToken", "publicKey", "relays": [{"address"}]}` or the multi key
    /// form `{"apnsToken", "publicKeys": [{"publicKey", "relays"}]}`.
    pub fn from_event(ev: &Event) -> Result<Self, RegistrationError> {
        let content: RegistrationContent = serde_json::from_str(ev.content())?;
        let apns_token = ApnsToken::new(&content.apns_token)?;

        let raw_keys = match (content.public_keys, content.public_key) {
            (Some(keys), _) => keys,
            (None, Some(public_key)) => vec![KeyContent {
                public_key,
                relays: content.relays,
            }],
            (None, None) => return Err(RegistrationError::NoKeys),
        };
        if raw_keys.is_empty() {
            return Err(RegistrationError::NoKeys);
        }

        let mut public_keys = Vec::with_capacity(raw_keys.len());
        for key in raw_keys {
            let public_key = PublicKey::from_hex(&key.public_key)?;
            let relays = key
                .relays
                .iter()
                .map(|r| RelayAddress::parse(&r.address))
                .collect::<Result<Vec<_>, _>>()?;
            if relays.is_empty() {
                return Err(RegistrationError::MissingRelays(public_key));
            }
            public_keys.push(RegisteredKey { public_key, relays });
        }

        if !public_keys.iter().any(|k| k.public_key == ev.pubkey()) {
            return Err(RegistrationError::ForeignAuthor(ev.pubkey()));
        }

        Ok(Self {
            apns_token,
            public_keys,
        })
    }
}
