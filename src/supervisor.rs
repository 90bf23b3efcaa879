//! Keeps one subscription manager running per registered relay.

use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    bus::Publisher,
    pipeline::ReceivedEvent,
    registration::RelayAddress,
    relay::{RelayOptions, SubscriptionManager},
    storage::Store,
};

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct Supervisor {
    store: Store,
    events: Publisher<ReceivedEvent>,
    relay_opts: RelayOptions,
    poll_interval: Duration,
    ignored_suffixes: Vec<String>,
    running: HashMap<RelayAddress, Running>,
}

impl Supervisor {
    pub fn new(
        store: Store,
        events: Publisher<ReceivedEvent>,
        relay_opts: RelayOptions,
        poll_interval: Duration,
        ignored_suffixes: Vec<String>,
    ) -> Self {
        Self {
            store,
            events,
            relay_opts,
            poll_interval,
            ignored_suffixes: ignored_suffixes
                .into_iter()
                .map(|s| s.to_lowercase())
                .collect(),
            running: HashMap::new(),
        }
    }

    /// Reconcile running managers with the registry every poll interval until
    /// `cancel` fires. A registry read failure ends the run.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let res = loop {
            if let Err(e) = self.reconcile(&cancel) {
                break Err(e);
            }
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        };
        self.shutdown().await;
        res
    }

    /// Relays with a running manager.
    pub fn running(&self) -> Vec<RelayAddress> {
        let mut relays: Vec<RelayAddress> = self.running.keys().cloned().collect();
        relays.sort();
        relays
    }

    fn ignored(&self, relay: &RelayAddress) -> bool {
        let host = relay.host_without_port();
        self.ignored_suffixes.iter().any(|s| host.ends_with(s.as_str()))
    }

    fn reconcile(&mut self, cancel: &CancellationToken) -> Result<()> {
        let relays = self.store.relays().context("error getting relays")?;

        let removed: Vec<RelayAddress> = self
            .running
            .keys()
            .filter(|r| !relays.contains(*r))
            .cloned()
            .collect();
        for relay in removed {
            if let Some(r) = self.running.remove(&relay) {
                info!(%relay, "stopping relay manager");
                r.cancel.cancel();
            }
        }

        for relay in relays {
            if self.running.contains_key(&relay) {
                continue;
            }
            if self.ignored(&relay) {
                debug!(%relay, "relay ignored");
                continue;
            }
            info!(%relay, "starting relay manager");
            let child = cancel.child_token();
            let manager = Arc::new(SubscriptionManager::new(
                relay.clone(),
                self.store.clone(),
                self.events.clone(),
                self.relay_opts.clone(),
            ));
            let handle = tokio::spawn(manager.run(child.clone()));
            self.running.insert(
                relay,
                Running {
                    cancel: child,
                    handle,
                },
            );
        }
        Ok(())
    }

    async fn shutdown(&mut self) {
        for (_, r) in self.running.drain() {
            r.cancel.cancel();
            let _ = r.handle.await;
        }
    }
}
