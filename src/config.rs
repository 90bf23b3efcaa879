//! Configuration loading from `.env` files.

use std::{env, path::PathBuf, time::Duration};

use anyhow::{Context, Result};

use crate::{apns::ApnsEnvironment, relay::RelayOptions};

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root directory for all storage.
    pub store_root: PathBuf,
    /// HTTP bind address, e.g. `127.0.0.1:7777`.
    pub bind_http: String,
    /// WebSocket bind address, e.g. `127.0.0.1:7778`.
    pub bind_ws: String,
    /// Optional Tor SOCKS proxy (host:port).
    pub tor_socks: Option<String>,
    pub apns: Option<ApnsSettings>,
    /// How often the registry is polled for relays.
    pub relay_poll: Duration,
    pub reconnect_backoff: Duration,
    pub subscription_refresh: Duration,
    pub lookback: Duration,
    /// Relays whose host ends with one of these are never contacted.
    pub ignored_relay_suffixes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApnsSettings {
    pub topic: String,
    /// PEM file holding the client certificate and its private key.
    pub certificate_path: PathBuf,
    pub environment: ApnsEnvironment,
}

impl Settings {
    /// Load settings from the specified `.env` file.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        let store_root = PathBuf::from(env::var("STORE_ROOT").context("STORE_ROOT")?);
        let bind_http = env::var("BIND_HTTP").context("BIND_HTTP")?;
        let bind_ws = env::var("BIND_WS").context("BIND_WS")?;
        let tor_socks = non_empty("TOR_SOCKS");

        let apns = match (non_empty("APNS_TOPIC"), non_empty("APNS_CERTIFICATE_PATH")) {
            (Some(topic), Some(cert)) => Some(ApnsSettings {
                topic,
                certificate_path: PathBuf::from(cert),
                environment: non_empty("APNS_ENVIRONMENT")
                    .map(|s| s.parse::<ApnsEnvironment>())
                    .transpose()?
                    .unwrap_or(ApnsEnvironment::Development),
            }),
            _ => None,
        };

        Ok(Self {
            store_root,
            bind_http,
            bind_ws,
            tor_socks,
            apns,
            relay_poll: Duration::from_secs(secs("RELAY_POLL_SECS", 60)?),
            reconnect_backoff: Duration::from_secs(secs("RECONNECT_BACKOFF_SECS", 10)?),
            subscription_refresh: Duration::from_secs(secs("SUBSCRIPTION_REFRESH_SECS", 60)?),
            lookback: Duration::from_secs(secs("LOOKBACK_DAYS", 365)? * 24 * 60 * 60),
            ignored_relay_suffixes: csv_strings(env::var("IGNORED_RELAY_SUFFIXES").unwrap_or_default()),
        })
    }

    pub fn relay_options(&self) -> RelayOptions {
        RelayOptions {
            reconnect_backoff: self.reconnect_backoff,
            subscription_refresh: self.subscription_refresh,
            lookback: self.lookback,
            tor_socks: self.tor_socks.clone(),
        }
    }
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.trim().is_empty())
}

fn secs(key: &str, default: u64) -> Result<u64> {
    match non_empty(key) {
        Some(v) => v.trim().parse().with_context(|| format!("invalid {key}: {v:?}")),
        None => Ok(default),
    }
}

/// Split a comma-separated string into trimmed string values.
pub fn csv_strings(input: impl AsRef<str>) -> Vec<String> {
    input
        .as_ref()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
