//! WebSocket endpoint speaking a subset of NIP-01.
//!
//! Clients submit signed registration events with `EVENT` and read stored
//! events with `REQ`. A signed NIP-62 request to vanish deletes everything
//! stored for its author. Every `EVENT` is answered with `OK`.

use std::{future::Future, net::SocketAddr};

use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::StreamExt;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::{
    event::{Event, KIND_REQUEST_TO_VANISH},
    filter::FilterSet,
    registration::Registration,
    storage::{QueryItem, Store},
};

/// Start the WebSocket server on `addr`.
pub async fn serve_ws(
    addr: SocketAddr,
    store: Store,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "websocket listening");
    axum::serve(listener, router(store).into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

fn router(store: Store) -> Router {
    Router::new().route("/", get(handler)).with_state(store)
}

async fn handler(ws: WebSocketUpgrade, State(store): State<Store>) -> impl IntoResponse {
    ws.on_upgrade(|socket| process(socket, store))
}

async fn process(mut socket: WebSocket, store: Store) {
    while let Some(Ok(msg)) = socket.next().await {
        let Message::Text(txt) = msg else { continue };
        for reply in dispatch(&store, &txt) {
            if socket.send(Message::Text(reply.to_string())).await.is_err() {
                return;
            }
        }
    }
    debug!("websocket client gone");
}

/// Answer one client frame.
fn dispatch(store: &Store, txt: &str) -> Vec<Value> {
    let Ok(Value::Array(arr)) = serde_json::from_str::<Value>(txt) else {
        return vec![json!(["NOTICE", "invalid: could not parse message"])];
    };
    match arr.first().and_then(Value::as_str) {
        Some("EVENT") if arr.len() >= 2 => vec![submit(store, arr[1].clone())],
        Some("REQ") if arr.len() >= 2 => {
            let sub = arr[1].as_str().unwrap_or_default().to_string();
            query(store, &sub, &arr[2..])
        }
        Some("CLOSE") => vec![],
        other => {
            debug!(?other, "unsupported message");
            vec![json!(["NOTICE", "unsupported message type"])]
        }
    }
}

fn submit(store: &Store, val: Value) -> Value {
    let id = val.get("id").and_then(Value::as_str).unwrap_or_default().to_string();
    match Event::from_value(val) {
        Ok(ev) if ev.kind() == KIND_REQUEST_TO_VANISH => vanish(store, &ev),
        Ok(ev) => register(store, &ev),
        Err(e) => json!(["OK", id, false, format!("invalid: {e}")]),
    }
}

fn vanish(store: &Store, event: &Event) -> Value {
    let id = event.id().to_hex();
    let pk = event.pubkey();
    match store.transact(|tx| tx.delete_public_key(&pk)) {
        Ok(events) => {
            info!(public_key = %pk, events, "removed public key");
            json!(["OK", id, true, ""])
        }
        Err(e) => {
            warn!(public_key = %pk, "error removing public key: {e:#}");
            json!(["OK", id, false, "error: could not remove public key"])
        }
    }
}

fn register(store: &Store, event: &Event) -> Value {
    let id = event.id().to_hex();
    let reg = match Registration::from_event(event) {
        Ok(reg) => reg,
        Err(e) => return json!(["OK", id, false, format!("invalid: {e}")]),
    };
    match store.transact(|tx| tx.save_registration(&reg)) {
        Ok(()) => {
            info!(token = %reg.apns_token, keys = reg.public_keys.len(), "saved registration");
            json!(["OK", id, true, ""])
        }
        Err(e) => {
            warn!(event_id = %event.id(), "error saving registration: {e:#}");
            json!(["OK", id, false, "error: could not save registration"])
        }
    }
}

fn query(store: &Store, sub: &str, filters: &[Value]) -> Vec<Value> {
    let filters = match FilterSet::from_value(&Value::Array(filters.to_vec())) {
        Ok(f) => f,
        Err(e) => return vec![json!(["CLOSED", sub, format!("invalid: {e}")])],
    };
    let mut out = Vec::new();
    for item in store.get_events(filters) {
        match item {
            QueryItem::Event(ev) => out.push(json!(["EVENT", sub, ev])),
            QueryItem::Error(e) => {
                warn!(subscription = sub, "query item failed: {e:#}");
                out.push(json!(["NOTICE", format!("error: {sub}: could not read event")]));
            }
            QueryItem::EndOfStoredEvents => out.push(json!(["EOSE", sub])),
        }
    }
    out
}
