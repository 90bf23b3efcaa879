//! In-process message bus with at-least-once delivery.
//!
//! A failed handler run puts the message back on the queue after a delay, up
//! to a fixed number of attempts. Handlers must tolerate seeing the same
//! message more than once.

use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Consumer side of a bus topic.
#[async_trait]
pub trait Handler<T>: Send + Sync + 'static {
    async fn handle(&self, msg: T) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct BusOptions {
    /// Handler runs allowed in flight at once.
    pub concurrency: usize,
    /// Deliveries per message before it is dropped.
    pub max_attempts: u32,
    pub redelivery_delay: Duration,
}

impl Default for BusOptions {
    fn default() -> Self {
        Self {
            concurrency: 16,
            max_attempts: 5,
            redelivery_delay: Duration::from_secs(1),
        }
    }
}

struct Delivery<T> {
    msg: T,
    attempt: u32,
}

/// Producer handle. Cheap to clone.
pub struct Publisher<T> {
    tx: mpsc::Sender<Delivery<T>>,
}

impl<T> Clone for Publisher<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T: Send + 'static> Publisher<T> {
    pub async fn publish(&self, msg: T) -> Result<()> {
        self.tx
            .send(Delivery { msg, attempt: 1 })
            .await
            .map_err(|_| anyhow!("bus closed"))
    }
}

/// Receiving end, consumed by [`Subscriber::run`].
pub struct Subscriber<T> {
    name: &'static str,
    rx: mpsc::Receiver<Delivery<T>>,
    tx: mpsc::Sender<Delivery<T>>,
}

/// Create a topic named `name` holding up to `capacity` queued messages.
pub fn topic<T>(name: &'static str, capacity: usize) -> (Publisher<T>, Subscriber<T>) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        Publisher { tx: tx.clone() },
        Subscriber { name, rx, tx },
    )
}

impl<T: Clone + Send + 'static> Subscriber<T> {
    /// Take the next message directly, bypassing handler dispatch.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await.map(|d| d.msg)
    }

    /// Take a queued message without waiting.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok().map(|d| d.msg)
    }

    /// Dispatch messages to `handler` until `cancel` fires.
    pub async fn run<H: Handler<T>>(
        mut self,
        handler: Arc<H>,
        opts: BusOptions,
        cancel: CancellationToken,
    ) {
        let permits = Arc::new(Semaphore::new(opts.concurrency.max(1)));
        loop {
            let delivery = tokio::select! {
                _ = cancel.cancelled() => break,
                d = self.rx.recv() => match d {
                    Some(d) => d,
                    None => break,
                },
            };
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                p = permits.clone().acquire_owned() => match p {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };
            let handler = handler.clone();
            let requeue = self.tx.clone();
            let cancel = cancel.clone();
            let name = self.name;
            let opts = opts.clone();
            tokio::spawn(async move {
                let Delivery { msg, attempt } = delivery;
                let res = handler.handle(msg.clone()).await;
                drop(permit);
                let Err(err) = res else { return };
                if attempt >= opts.max_attempts {
                    error!(topic = name, attempt, "giving up on message: {err:#}");
                    return;
                }
                warn!(topic = name, attempt, "handler failed, redelivering: {err:#}");
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(opts.redelivery_delay) => {
                        let next = Delivery { msg, attempt: attempt + 1 };
                        if requeue.send(next).await.is_err() {
                            debug!(topic = name, "bus closed before redelivery");
                        }
                    }
                }
            });
        }
        debug!(topic = self.name, "subscriber stopped");
    }
}
