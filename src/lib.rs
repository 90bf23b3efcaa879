//! Listens to Nostr relays on behalf of registered devices and turns
//! mentions and follow changes into push notifications.

pub mod apns;
pub mod bus;
pub mod config;
pub mod event;
pub mod filter;
pub mod follow_change;
pub mod mentions;
pub mod notifications;
pub mod pipeline;
pub mod registration;
pub mod relay;
pub mod server;
pub mod storage;
pub mod supervisor;
pub mod ws;

#[cfg(test)]
mod fixtures;
