//! Event processing: persist what relays send, then notify mentioned users.
//!
//! Stage one ([`SaveReceivedEvent`]) deduplicates and stores events coming off
//! the received-events bus and announces each newly stored event on the
//! saved-events bus. Stage two ([`ProcessSavedEvent`]) indexes the event's
//! tags and pushes a notification to every device registered for a mentioned
//! key. [`FollowChangeNotifier`] handles follow-change batches the same way.
//!
//! Stage one stores a pending marker with the event and stage two removes it
//! once fan-out is done. A marker that outlives its bus message is picked up
//! again by a later redelivery or by [`replay_pending`] at startup.

use std::{num::NonZeroUsize, sync::Arc};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::{
    apns::{Push, PushSender},
    bus::{Handler, Publisher},
    event::{Event, EventId, PublicKey},
    follow_change::FollowChangeBatch,
    mentions::mentions,
    notifications::{self, Notification},
    registration::{ApnsToken, RelayAddress},
    storage::Store,
};

/// Events with more tags than this are stored but never indexed or notified.
pub const MAX_TAGS: usize = 500;
/// Tags indexed per transaction.
pub const TAG_BATCH_SIZE: usize = 150;
/// Tokens handled per transaction.
pub const TOKEN_BATCH_SIZE: usize = 500;

const SEEN_CACHE_SIZE: usize = 10_000;

/// An event as delivered by a relay.
#[derive(Debug, Clone)]
pub struct ReceivedEvent {
    pub relay: RelayAddress,
    pub event: Event,
}

/// Notice that an event has been persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventSaved(pub EventId);

/// Stage one: store each event once.
pub struct SaveReceivedEvent {
    store: Store,
    saved: Publisher<EventSaved>,
    /// Ids known to be on disk. Only a shortcut; storage stays authoritative.
    seen: Mutex<LruCache<EventId, ()>>,
}

impl SaveReceivedEvent {
    pub fn new(store: Store, saved: Publisher<EventSaved>) -> Self {
        let cap = NonZeroUsize::new(SEEN_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);
        Self {
            store,
            saved,
            seen: Mutex::new(LruCache::new(cap)),
        }
    }
}

#[async_trait]
impl Handler<ReceivedEvent> for SaveReceivedEvent {
    async fn handle(&self, msg: ReceivedEvent) -> Result<()> {
        let id = msg.event.id();
        if self.seen.lock().get(&id).is_some() {
            return Ok(());
        }
        debug!(relay = %msg.relay, event_id = %id, kind = msg.event.kind(), "saving received event");

        let announce = self.store.transact(|tx| {
            if tx.event_exists(&id)? {
                return tx.is_pending(&id);
            }
            tx.save_event(&msg.event)?;
            tx.mark_pending(&id)?;
            Ok(true)
        })?;

        if announce {
            self.saved.publish(EventSaved(id)).await?;
        }
        self.seen.lock().put(id, ());
        Ok(())
    }
}

/// Stage two: index tags and notify mentioned users.
pub struct ProcessSavedEvent {
    store: Store,
    sender: Arc<dyn PushSender>,
}

impl ProcessSavedEvent {
    pub fn new(store: Store, sender: Arc<dyn PushSender>) -> Self {
        Self { store, sender }
    }

    fn save_tags(&self, ev: &Event) -> Result<()> {
        if ev.tags().is_empty() {
            return Ok(());
        }
        debug!(event_id = %ev.id(), tags = ev.tags().len(), "saving tags");
        for batch in ev.tags().chunks(TAG_BATCH_SIZE) {
            self.store.transact(|tx| tx.save_tags(&ev.id(), batch))?;
        }
        Ok(())
    }

    async fn notify_mentions(&self, ev: &Event) -> Result<()> {
        let mentioned = mentions(ev);
        let mut targets: Vec<(PublicKey, Vec<ApnsToken>)> = Vec::new();
        self.store.transact(|tx| {
            for pk in &mentioned {
                let tokens = tx.tokens_for_public_key(pk)?;
                if !tokens.is_empty() {
                    targets.push((*pk, tokens));
                }
            }
            Ok(())
        })?;

        for (mention, tokens) in targets {
            debug!(event_id = %ev.id(), %mention, tokens = tokens.len(), "sending notifications");
            for batch in tokens.chunks(TOKEN_BATCH_SIZE) {
                self.notify_batch(ev, &mention, batch).await?;
            }
        }
        Ok(())
    }

    /// Build, send and record notifications for one batch of tokens. Pushes
    /// go out between two transactions; the existence check keeps a retried
    /// batch from recording a token twice.
    async fn notify_batch(&self, ev: &Event, mention: &PublicKey, tokens: &[ApnsToken]) -> Result<()> {
        let pending: Vec<Notification> = self.store.transact(|tx| {
            let mut out = Vec::new();
            for token in tokens {
                if tx.notification_exists(&ev.id(), token)? {
                    continue;
                }
                if let Some(n) = notifications::mention_notification(mention, token, ev)? {
                    out.push(n);
                }
            }
            Ok(out)
        })?;
        if pending.is_empty() {
            return Ok(());
        }

        let mut sent = Vec::with_capacity(pending.len());
        for n in pending {
            match self.sender.send(&Push::mention(&n)).await {
                Ok(()) => sent.push(n),
                Err(err) => warn!(event_id = %ev.id(), token = %n.token, "error sending notification: {err}"),
            }
        }

        self.store.transact(|tx| {
            for n in &sent {
                if !tx.notification_exists(&n.event_id, &n.token)? {
                    tx.save_notification(n)?;
                }
            }
            Ok(())
        })
    }
}

#[async_trait]
impl Handler<EventSaved> for ProcessSavedEvent {
    async fn handle(&self, EventSaved(id): EventSaved) -> Result<()> {
        debug!(event_id = %id, "processing saved event");
        let ev = self
            .store
            .transact(|tx| tx.get_event(&id))?
            .ok_or_else(|| anyhow!("saved event {id} not found"))?;

        if ev.tags().len() > MAX_TAGS {
            info!(event_id = %id, tags = ev.tags().len(), "too many tags, skipping");
        } else {
            self.save_tags(&ev)?;
            self.notify_mentions(&ev).await?;
        }
        self.store.transact(|tx| tx.clear_pending(&id))
    }
}

/// Re-announce every saved event whose fan-out never finished. Returns the
/// number of events published.
pub async fn replay_pending(store: &Store, saved: &Publisher<EventSaved>) -> Result<usize> {
    let pending = store.pending_events()?;
    for id in &pending {
        saved.publish(EventSaved(*id)).await?;
    }
    if !pending.is_empty() {
        info!(events = pending.len(), "replaying unfinished fan-out");
    }
    Ok(pending.len())
}

/// Tells a followee's devices about new followers.
pub struct FollowChangeNotifier {
    store: Store,
    sender: Arc<dyn PushSender>,
}

impl FollowChangeNotifier {
    pub fn new(store: Store, sender: Arc<dyn PushSender>) -> Self {
        Self { store, sender }
    }
}

#[async_trait]
impl Handler<FollowChangeBatch> for FollowChangeNotifier {
    async fn handle(&self, batch: FollowChangeBatch) -> Result<()> {
        let tokens = self.store.tokens_for_public_key(&batch.followee)?;
        if tokens.is_empty() {
            return Ok(());
        }
        debug!(followee = %batch.followee, "{batch}");

        let payload = match notifications::follow_change_payload(&batch) {
            Ok(payload) => payload,
            Err(err) => {
                error!(followee = %batch.followee, "dropping follow change: {err}");
                return Ok(());
            }
        };
        for token in tokens {
            let push = Push::follow_change(token, payload.clone());
            if let Err(err) = self.sender.send(&push).await {
                error!(
                    followee = %batch.followee,
                    token = %push.token,
                    "error sending follow change notification: {err}"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        apns::{PushError, PushType},
        bus::{self, Subscriber},
        event::{Tag, KIND_NOTE},
        fixtures,
        registration::{RegisteredKey, Registration},
    };
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingSender {
        pushes: Mutex<Vec<Push>>,
        fail_token: Option<ApnsToken>,
    }

    #[async_trait]
    impl PushSender for RecordingSender {
        async fn send(&self, push: &Push) -> Result<(), PushError> {
            if self.fail_token.as_ref() == Some(&push.token) {
                return Err(PushError::Rejected {
                    status: 410,
                    reason: "Unregistered".into(),
                });
            }
            self.pushes.lock().push(push.clone());
            Ok(())
        }
    }

    fn store() -> (TempDir, Store) {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path().to_path_buf());
        store.init().unwrap();
        (dir, store)
    }

    fn register(store: &Store, seed: u8, pk: PublicKey) -> ApnsToken {
        let token = fixtures::token(seed);
        let reg = Registration {
            apns_token: token.clone(),
            public_keys: vec![RegisteredKey {
                public_key: pk,
                relays: vec![fixtures::relay("wss://relay.example")],
            }],
        };
        store.transact(|tx| tx.save_registration(&reg)).unwrap();
        token
    }

    fn received(ev: &Event) -> ReceivedEvent {
        ReceivedEvent {
            relay: fixtures::relay("wss://relay.example"),
            event: ev.clone(),
        }
    }

    fn stage_one(store: &Store) -> (SaveReceivedEvent, Subscriber<EventSaved>) {
        let (publisher, subscriber) = bus::topic("saved", 16);
        (SaveReceivedEvent::new(store.clone(), publisher), subscriber)
    }

    #[tokio::test]
    async fn stage_one_is_idempotent() {
        let (_dir, store) = store();
        let (handler, mut saved) = stage_one(&store);
        let ev = fixtures::signed_event(1, KIND_NOTE, vec![], 10);

        handler.handle(received(&ev)).await.unwrap();
        assert_eq!(saved.recv().await, Some(EventSaved(ev.id())));
        assert_eq!(store.pending_events().unwrap(), vec![ev.id()]);
        store.transact(|tx| tx.clear_pending(&ev.id())).unwrap();

        // A fresh handler has an empty cache, so this hits storage.
        let (fresh, mut saved_again) = stage_one(&store);
        fresh.handle(received(&ev)).await.unwrap();
        handler.handle(received(&ev)).await.unwrap();
        assert!(saved_again.try_recv().is_none());
        assert!(saved.try_recv().is_none());
        assert!(store.transact(|tx| tx.event_exists(&ev.id())).unwrap());
    }

    #[tokio::test]
    async fn lost_announcement_is_repeated_on_redelivery() {
        let (_dir, store) = store();
        let ev = fixtures::signed_event(1, KIND_NOTE, vec![], 10);

        let (handler, saved) = stage_one(&store);
        drop(saved);
        assert!(handler.handle(received(&ev)).await.is_err());
        assert!(store.transact(|tx| tx.event_exists(&ev.id())).unwrap());

        let (fresh, mut saved) = stage_one(&store);
        fresh.handle(received(&ev)).await.unwrap();
        assert_eq!(saved.try_recv(), Some(EventSaved(ev.id())));

        ProcessSavedEvent::new(store.clone(), Arc::new(RecordingSender::default()))
            .handle(EventSaved(ev.id()))
            .await
            .unwrap();
        assert!(store.pending_events().unwrap().is_empty());

        let (after, mut saved) = stage_one(&store);
        after.handle(received(&ev)).await.unwrap();
        assert!(saved.try_recv().is_none());
    }

    #[tokio::test]
    async fn unfinished_fan_out_is_replayed() {
        let (_dir, store) = store();
        let ev = fixtures::signed_event(1, KIND_NOTE, vec![], 10);
        let done = fixtures::signed_event(1, KIND_NOTE, vec![], 11);
        store
            .transact(|tx| {
                tx.save_event(&ev)?;
                tx.mark_pending(&ev.id())?;
                tx.save_event(&done)
            })
            .unwrap();

        let (publisher, mut subscriber) = bus::topic("saved", 16);
        assert_eq!(replay_pending(&store, &publisher).await.unwrap(), 1);
        assert_eq!(subscriber.try_recv(), Some(EventSaved(ev.id())));
        assert!(subscriber.try_recv().is_none());
    }

    #[tokio::test]
    async fn stage_two_notifies_mentioned_tokens_once() {
        let (_dir, store) = store();
        let pk1 = fixtures::public_key(1);
        let pk2 = fixtures::public_key(2);
        let token1 = register(&store, 1, pk1);
        let _token2 = register(&store, 2, pk2);
        let ev = fixtures::signed_event(2, KIND_NOTE, vec![fixtures::mention(&pk1), fixtures::mention(&pk2)], 10);
        store.transact(|tx| tx.save_event(&ev)).unwrap();

        let sender = Arc::new(RecordingSender::default());
        let handler = ProcessSavedEvent::new(store.clone(), sender.clone());
        handler.handle(EventSaved(ev.id())).await.unwrap();
        handler.handle(EventSaved(ev.id())).await.unwrap();

        let pushes = sender.pushes.lock().clone();
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].token, token1);
        assert_eq!(pushes[0].push_type, PushType::Background);

        let stored = store.get_notifications(&ev.id()).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].token, token1);
        assert_eq!(stored[0].uuid, pushes[0].id);
    }

    #[tokio::test]
    async fn failed_push_is_logged_and_not_recorded() {
        let (_dir, store) = store();
        let pk1 = fixtures::public_key(1);
        let pk3 = fixtures::public_key(3);
        let bad = register(&store, 1, pk1);
        let good = register(&store, 3, pk3);
        let ev = fixtures::signed_event(2, KIND_NOTE, vec![fixtures::mention(&pk1), fixtures::mention(&pk3)], 10);
        store.transact(|tx| tx.save_event(&ev)).unwrap();

        let sender = Arc::new(RecordingSender {
            fail_token: Some(bad),
            ..Default::default()
        });
        ProcessSavedEvent::new(store.clone(), sender.clone())
            .handle(EventSaved(ev.id()))
            .await
            .unwrap();

        let stored = store.get_notifications(&ev.id()).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].token, good);
    }

    #[tokio::test]
    async fn stage_two_indexes_tags_but_skips_oversized_events() {
        let (_dir, store) = store();
        let pk1 = fixtures::public_key(1);
        register(&store, 1, pk1);
        let mut tags: Vec<Tag> = (0..MAX_TAGS).map(|i| Tag(vec!["t".into(), i.to_string()])).collect();
        tags.push(fixtures::mention(&pk1));
        let ev = fixtures::signed_event(2, KIND_NOTE, tags, 10);
        store.transact(|tx| tx.save_event(&ev)).unwrap();

        let sender = Arc::new(RecordingSender::default());
        ProcessSavedEvent::new(store.clone(), sender.clone())
            .handle(EventSaved(ev.id()))
            .await
            .unwrap();
        assert!(sender.pushes.lock().is_empty());
        assert!(store.get_notifications(&ev.id()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_event_is_an_error() {
        let (_dir, store) = store();
        let handler = ProcessSavedEvent::new(store, Arc::new(RecordingSender::default()));
        let id = fixtures::signed_event(1, KIND_NOTE, vec![], 1).id();
        assert!(handler.handle(EventSaved(id)).await.is_err());
    }

    #[tokio::test]
    async fn follow_change_goes_to_followee_tokens() {
        let (_dir, store) = store();
        let followee = fixtures::public_key(1);
        let token = register(&store, 1, followee);
        let sender = Arc::new(RecordingSender::default());
        let notifier = FollowChangeNotifier::new(store.clone(), sender.clone());

        let batch = FollowChangeBatch {
            followee,
            friendly_follower: "John Doe".into(),
            follows: vec![fixtures::public_key(2)],
            unfollows: vec![],
        };
        notifier.handle(batch.clone()).await.unwrap();

        let unknown = FollowChangeBatch {
            followee: fixtures::public_key(9),
            ..batch
        };
        notifier.handle(unknown).await.unwrap();

        let pushes = sender.pushes.lock().clone();
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].token, token);
        assert_eq!(pushes[0].push_type, PushType::Alert);
    }
}
