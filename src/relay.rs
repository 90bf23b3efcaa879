//! Per-relay connection and subscription management.
//!
//! Each relay gets a [`SubscriptionManager`] running two loops over one
//! WebSocket: the connection loop reads frames and forwards events to the
//! received-events bus, while the subscription loop keeps one `REQ` open per
//! public key registered for the relay.

use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
    time::Duration,
};

use anyhow::{anyhow, bail, Result};
use chrono::Utc;
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde_json::Value;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    sync::Mutex,
};
use tokio_socks::tcp::Socks5Stream;
use tokio_tungstenite::{
    client_async_tls,
    tungstenite::{client::IntoClientRequest, Message},
    MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    bus::Publisher,
    event::{Event, PublicKey, PROFILE_TAG},
    filter::Filter,
    pipeline::ReceivedEvent,
    registration::RelayAddress,
    storage::Store,
};

/// Timing knobs shared by all relay managers.
#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub reconnect_backoff: Duration,
    pub subscription_refresh: Duration,
    /// How far back each new subscription asks the relay to replay.
    pub lookback: Duration,
    pub tor_socks: Option<String>,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            reconnect_backoff: Duration::from_secs(10),
            subscription_refresh: Duration::from_secs(60),
            lookback: Duration::from_secs(365 * 24 * 60 * 60),
            tor_socks: None,
        }
    }
}

/// Frames a relay can send us.
#[derive(Debug, PartialEq)]
pub enum RelayMessage {
    Event { subscription: String, event: Value },
    EndOfStoredEvents(String),
    /// `NOTICE`, `OK`, `CLOSED` or `AUTH`; logged only.
    Other(String),
}

impl RelayMessage {
    pub fn parse(text: &str) -> Result<Self> {
        let val: Value = serde_json::from_str(text)?;
        let arr = val
            .as_array()
            .ok_or_else(|| anyhow!("relay message is not an array"))?;
        let sub = || {
            arr.get(1)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| anyhow!("missing subscription id"))
        };
        match arr.first().and_then(Value::as_str) {
            Some("EVENT") => Ok(Self::Event {
                subscription: sub()?,
                event: arr
                    .get(2)
                    .cloned()
                    .ok_or_else(|| anyhow!("missing event"))?,
            }),
            Some("EOSE") => Ok(Self::EndOfStoredEvents(sub()?)),
            Some(kind @ ("NOTICE" | "OK" | "CLOSED" | "AUTH")) => Ok(Self::Other(kind.to_string())),
            other => bail!("unknown relay message type {other:?}"),
        }
    }
}

/// Control messages produced by one diff pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SubscriptionDiff {
    pub close: Vec<PublicKey>,
    pub open: Vec<PublicKey>,
}

/// Compare the active subscriptions with the desired ones.
pub fn diff_subscriptions(
    active: &HashSet<PublicKey>,
    desired: &HashSet<PublicKey>,
) -> SubscriptionDiff {
    let mut close: Vec<PublicKey> = active.difference(desired).copied().collect();
    let mut open: Vec<PublicKey> = desired.difference(active).copied().collect();
    close.sort();
    open.sort();
    SubscriptionDiff { close, open }
}

/// `["REQ", <hex key>, {"#p": [<hex key>], "since": <since>}]`
pub fn req_message(pk: &PublicKey, since: u64) -> String {
    let filter = Filter {
        tags: BTreeMap::from([(PROFILE_TAG.to_string(), vec![pk.to_hex()])]),
        since: Some(since),
        ..Default::default()
    };
    serde_json::json!(["REQ", pk.to_hex(), filter.to_value()]).to_string()
}

/// `["CLOSE", <hex key>]`
pub fn close_message(pk: &PublicKey) -> String {
    serde_json::json!(["CLOSE", pk.to_hex()]).to_string()
}

type WsStream = WebSocketStream<MaybeTlsStream<Box<dyn AsyncReadWrite + Unpin + Send>>>;
type WsSink = SplitSink<WsStream, Message>;

/// Keeps one relay's subscriptions in step with the registry.
pub struct SubscriptionManager {
    relay: RelayAddress,
    store: Store,
    events: Publisher<ReceivedEvent>,
    opts: RelayOptions,
    active: Mutex<HashSet<PublicKey>>,
}

impl SubscriptionManager {
    pub fn new(
        relay: RelayAddress,
        store: Store,
        events: Publisher<ReceivedEvent>,
        opts: RelayOptions,
    ) -> Self {
        Self {
            relay,
            store,
            events,
            opts,
            active: Mutex::new(HashSet::new()),
        }
    }

    pub fn relay(&self) -> &RelayAddress {
        &self.relay
    }

    /// Keys with an open subscription on the current connection.
    pub async fn active_subscriptions(&self) -> HashSet<PublicKey> {
        self.active.lock().await.clone()
    }

    /// Connection loop: connect, serve, back off, repeat until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                break;
            }
            debug!(relay = %self.relay, "connecting");
            match self.clone().session(&cancel).await {
                Ok(()) => info!(relay = %self.relay, "connection closed"),
                Err(e) => warn!(relay = %self.relay, "connection error: {e:#}"),
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.opts.reconnect_backoff) => {}
            }
        }
        debug!(relay = %self.relay, "manager stopped");
    }

    async fn session(self: Arc<Self>, cancel: &CancellationToken) -> Result<()> {
        let ws = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            ws = connect_ws(&self.relay, self.opts.tor_socks.as_deref()) => ws?,
        };
        info!(relay = %self.relay, "connected");
        let (sink, stream) = ws.split();

        // Subscriptions do not survive a reconnect.
        self.active.lock().await.clear();

        let conn = cancel.child_token();
        let _stop_subscriptions = conn.clone().drop_guard();
        let manager = self.clone();
        let sub_conn = conn.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.subscription_loop(sink, &sub_conn).await {
                warn!(relay = %manager.relay, "subscription loop failed: {e:#}");
                sub_conn.cancel();
            }
        });

        self.read_loop(stream, &conn).await
    }

    async fn read_loop(&self, mut stream: SplitStream<WsStream>, conn: &CancellationToken) -> Result<()> {
        loop {
            let msg = tokio::select! {
                _ = conn.cancelled() => return Ok(()),
                msg = stream.next() => msg,
            };
            let Some(msg) = msg else { return Ok(()) };
            match msg? {
                Message::Text(txt) => self.handle_text(&txt).await?,
                Message::Close(_) => return Ok(()),
                _ => {}
            }
        }
    }

    async fn handle_text(&self, txt: &str) -> Result<()> {
        match RelayMessage::parse(txt)? {
            RelayMessage::Event { subscription, event } => match Event::from_value(event) {
                Ok(event) => {
                    debug!(relay = %self.relay, %subscription, event_id = %event.id(), "received event");
                    self.events
                        .publish(ReceivedEvent {
                            relay: self.relay.clone(),
                            event,
                        })
                        .await?;
                }
                Err(e) => warn!(relay = %self.relay, %subscription, "dropping invalid event: {e}"),
            },
            RelayMessage::EndOfStoredEvents(subscription) => {
                debug!(relay = %self.relay, %subscription, "end of stored events");
            }
            RelayMessage::Other(kind) => debug!(relay = %self.relay, kind, "ignoring relay message"),
        }
        Ok(())
    }

    async fn subscription_loop(&self, mut sink: WsSink, conn: &CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval(self.opts.subscription_refresh);
        loop {
            tokio::select! {
                _ = conn.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let desired = self.store.public_keys_for_relay(&self.relay)?;
            self.update_subscriptions(&mut sink, &desired).await?;
        }
        let _ = sink.close().await;
        Ok(())
    }

    async fn update_subscriptions(&self, sink: &mut WsSink, desired: &HashSet<PublicKey>) -> Result<()> {
        let mut active = self.active.lock().await;
        let diff = diff_subscriptions(&active, desired);
        for pk in diff.close {
            sink.send(Message::Text(close_message(&pk))).await?;
            active.remove(&pk);
            debug!(relay = %self.relay, public_key = %pk, "closed subscription");
        }
        let since = self.since();
        for pk in diff.open {
            sink.send(Message::Text(req_message(&pk, since))).await?;
            active.insert(pk);
            debug!(relay = %self.relay, public_key = %pk, "opened subscription");
        }
        Ok(())
    }

    fn since(&self) -> u64 {
        let lookback = i64::try_from(self.opts.lookback.as_secs()).unwrap_or(i64::MAX);
        Utc::now().timestamp().saturating_sub(lookback).max(0) as u64
    }
}

/// Establish a WebSocket connection, optionally via a SOCKS5 proxy. `wss`
/// addresses are wrapped in TLS.
async fn connect_ws(relay: &RelayAddress, tor_socks: Option<&str>) -> Result<WsStream> {
    let url = Url::parse(relay.as_str())?;
    let host = url.host_str().ok_or_else(|| anyhow!("missing host"))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| anyhow!("missing port"))?;
    let req = relay.as_str().into_client_request()?;
    let stream: Box<dyn AsyncReadWrite + Unpin + Send> = if let Some(proxy) = tor_socks {
        Box::new(Socks5Stream::connect(proxy, (host, port)).await?)
    } else {
        Box::new(TcpStream::connect((host, port)).await?)
    };
    let (ws, _) = client_async_tls(req, stream).await?;
    Ok(ws)
}

/// Blanket trait for boxed async read/write streams.
trait AsyncReadWrite: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bus::{self, Subscriber},
        event::KIND_NOTE,
        fixtures,
        registration::{RegisteredKey, Registration},
    };
    use tempfile::TempDir;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    fn fast() -> RelayOptions {
        RelayOptions {
            reconnect_backoff: Duration::from_millis(50),
            subscription_refresh: Duration::from_millis(50),
            ..Default::default()
        }
    }

    fn register(store: &Store, relay: &RelayAddress, keys: &[PublicKey]) {
        let reg = Registration {
            apns_token: fixtures::token(1),
            public_keys: keys
                .iter()
                .map(|pk| RegisteredKey {
                    public_key: *pk,
                    relays: vec![relay.clone()],
                })
                .collect(),
        };
        store.transact(|tx| tx.save_registration(&reg)).unwrap();
    }

    async fn setup() -> (TempDir, Store, TcpListener, RelayAddress) {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path().to_path_buf());
        store.init().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay = fixtures::relay(&format!("ws://{}", listener.local_addr().unwrap()));
        (dir, store, listener, relay)
    }

    async fn next_text<S>(ws: &mut WebSocketStream<S>) -> Value
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Text(txt) => return serde_json::from_str(&txt).unwrap(),
                _ => continue,
            }
        }
    }

    fn spawn_manager(
        store: &Store,
        relay: &RelayAddress,
    ) -> (Arc<SubscriptionManager>, Subscriber<ReceivedEvent>, CancellationToken) {
        let (publisher, subscriber) = bus::topic("received", 16);
        let manager = Arc::new(SubscriptionManager::new(
            relay.clone(),
            store.clone(),
            publisher,
            fast(),
        ));
        let cancel = CancellationToken::new();
        tokio::spawn(manager.clone().run(cancel.clone()));
        (manager, subscriber, cancel)
    }

    #[test]
    fn diff_closes_stale_and_opens_new() {
        let (a, b, c) = (fixtures::public_key(1), fixtures::public_key(2), fixtures::public_key(3));
        let mut active = HashSet::from([a, b]);
        let desired = HashSet::from([b, c]);
        let diff = diff_subscriptions(&active, &desired);
        assert_eq!(diff.close, vec![a]);
        assert_eq!(diff.open, vec![c]);
        for pk in &diff.close {
            active.remove(pk);
        }
        active.extend(diff.open);
        assert_eq!(active, desired);
    }

    #[test]
    fn control_messages_have_wire_shape() {
        let pk = fixtures::public_key(1);
        let req: Value = serde_json::from_str(&req_message(&pk, 42)).unwrap();
        assert_eq!(
            req,
            serde_json::json!(["REQ", pk.to_hex(), {"#p": [pk.to_hex()], "since": 42}])
        );
        let close: Value = serde_json::from_str(&close_message(&pk)).unwrap();
        assert_eq!(close, serde_json::json!(["CLOSE", pk.to_hex()]));
    }

    #[test]
    fn parses_relay_frames() {
        assert_eq!(
            RelayMessage::parse(r#"["EOSE","abc"]"#).unwrap(),
            RelayMessage::EndOfStoredEvents("abc".into())
        );
        assert_eq!(
            RelayMessage::parse(r#"["NOTICE","hi"]"#).unwrap(),
            RelayMessage::Other("NOTICE".into())
        );
        assert!(matches!(
            RelayMessage::parse(r#"["EVENT","s",{"id":"x"}]"#).unwrap(),
            RelayMessage::Event { .. }
        ));
        assert!(RelayMessage::parse("not json").is_err());
        assert!(RelayMessage::parse(r#"{"EVENT":1}"#).is_err());
        assert!(RelayMessage::parse(r#"["WHAT"]"#).is_err());
        assert!(RelayMessage::parse(r#"["EVENT","s"]"#).is_err());
    }

    #[tokio::test]
    async fn forwards_valid_events_and_drops_invalid_ones() {
        let (_dir, store, listener, relay) = setup().await;
        let pk = fixtures::public_key(1);
        register(&store, &relay, &[pk]);
        let ev = fixtures::signed_event(2, KIND_NOTE, vec![fixtures::mention(&pk)], 5);
        let ev_json: Value = serde_json::from_str(ev.raw()).unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let req = next_text(&mut ws).await;
            assert_eq!(req[0], "REQ");
            let mut bad = ev_json.clone();
            bad["content"] = Value::String("tampered".into());
            for frame in [
                serde_json::json!(["EVENT", pk.to_hex(), bad]),
                serde_json::json!(["EVENT", pk.to_hex(), ev_json]),
                serde_json::json!(["EOSE", pk.to_hex()]),
            ] {
                ws.send(Message::Text(frame.to_string())).await.unwrap();
            }
            ws
        });

        let (_manager, mut subscriber, cancel) = spawn_manager(&store, &relay);
        let _ws = server.await.unwrap();
        let received = tokio::time::timeout(Duration::from_secs(5), subscriber.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.event, ev);
        assert_eq!(received.relay, relay);
        cancel.cancel();
    }

    #[tokio::test]
    async fn subscriptions_follow_registry_changes() {
        let (_dir, store, listener, relay) = setup().await;
        let (a, b, c) = (fixtures::public_key(1), fixtures::public_key(2), fixtures::public_key(3));
        register(&store, &relay, &[a, b]);

        let (_manager, _subscriber, cancel) = spawn_manager(&store, &relay);
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();

        let mut opened = HashSet::new();
        for _ in 0..2 {
            let msg = next_text(&mut ws).await;
            assert_eq!(msg[0], "REQ");
            opened.insert(msg[1].as_str().unwrap().to_string());
        }
        assert_eq!(opened, HashSet::from([a.to_hex(), b.to_hex()]));

        register(&store, &relay, &[b, c]);
        let close = next_text(&mut ws).await;
        assert_eq!(close, serde_json::json!(["CLOSE", a.to_hex()]));
        let open = next_text(&mut ws).await;
        assert_eq!(open[0], "REQ");
        assert_eq!(open[1], c.to_hex());
        cancel.cancel();
    }

    #[tokio::test]
    async fn reconnect_resets_active_subscriptions() {
        let (_dir, store, listener, relay) = setup().await;
        let pk = fixtures::public_key(1);
        register(&store, &relay, &[pk]);

        let (manager, _subscriber, cancel) = spawn_manager(&store, &relay);

        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        assert_eq!(next_text(&mut ws).await[1], pk.to_hex());
        assert_eq!(manager.active_subscriptions().await, HashSet::from([pk]));
        // An unparseable frame is fatal for the connection.
        ws.send(Message::Text("garbage".into())).await.unwrap();

        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let req = next_text(&mut ws).await;
        assert_eq!(req[0], "REQ");
        assert_eq!(req[1], pk.to_hex());
        cancel.cancel();
    }

    #[tokio::test]
    async fn cancellation_stops_the_manager() {
        let (_dir, store, _listener, relay) = setup().await;
        let (publisher, _subscriber) = bus::topic("received", 1);
        let manager = Arc::new(SubscriptionManager::new(relay, store, publisher, fast()));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(manager.run(cancel.clone()));
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
    }
}
