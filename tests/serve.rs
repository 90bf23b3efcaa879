use assert_cmd::prelude::*;
use futures_util::{SinkExt, StreamExt};
use pushr::event::Event;
use secp256k1::{Keypair, Secp256k1};
use std::{fs, net::TcpListener, process::Command, time::Duration};
use tempfile::TempDir;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::protocol::Message;

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

async fn next_json<S>(ws: &mut S) -> serde_json::Value
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        match ws.next().await.unwrap().unwrap() {
            Message::Text(t) => return serde_json::from_str(&t).unwrap(),
            _ => continue,
        }
    }
}

#[tokio::test]
async fn serve_cli_runs_http_and_ws() {
    let dir = TempDir::new().unwrap();
    let http_port = free_port();
    let ws_port = free_port();
    let env_path = dir.path().join("env");
    fs::write(
        &env_path,
        format!(
            "STORE_ROOT={}\nBIND_HTTP=127.0.0.1:{}\nBIND_WS=127.0.0.1:{}\nRELAY_POLL_SECS=1\nIGNORED_RELAY_SUFFIXES=relay.example\n",
            dir.path().display(),
            http_port,
            ws_port
        ),
    )
    .unwrap();

    let mut child = Command::cargo_bin("pushr")
        .unwrap()
        .args(["--env", env_path.to_str().unwrap(), "serve"])
        .spawn()
        .unwrap();

    // allow servers to start
    sleep(Duration::from_millis(300)).await;

    // HTTP health check
    let url = format!("http://127.0.0.1:{}/healthz", http_port);
    let body: serde_json::Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
    assert_eq!(body["status"], "ok");

    let ws_url = format!("ws://127.0.0.1:{}/", ws_port);
    let (mut ws_stream, _) = tokio_tungstenite::connect_async(ws_url).await.unwrap();

    // registration is acknowledged
    let kp = Keypair::from_seckey_slice(&Secp256k1::new(), &[7u8; 32]).unwrap();
    let pubkey = hex::encode(kp.x_only_public_key().0.serialize());
    let content = serde_json::json!({
        "apnsToken": "ab".repeat(32),
        "publicKey": pubkey,
        "relays": [{"address": "wss://relay.example"}],
    });
    let reg = Event::sign(&kp, 1, 12345, vec![], content.to_string()).unwrap();
    ws_stream
        .send(Message::Text(serde_json::json!(["EVENT", reg]).to_string()))
        .await
        .unwrap();
    let ok = next_json(&mut ws_stream).await;
    assert_eq!(ok, serde_json::json!(["OK", reg.id().to_hex(), true, ""]));
    assert!(dir
        .path()
        .join("registrations")
        .join(format!("{}.json", "ab".repeat(32)))
        .exists());

    // read query ends with EOSE
    let req = serde_json::json!(["REQ", "s", {}]);
    ws_stream
        .send(Message::Text(req.to_string()))
        .await
        .unwrap();
    let mut got_eose = false;
    for _ in 0..10 {
        let msg = next_json(&mut ws_stream).await;
        if msg[0] == "EOSE" {
            assert_eq!(msg[1], "s");
            got_eose = true;
            break;
        }
    }
    assert!(got_eose);

    // the supervisor keeps running after picking up the ignored relay
    sleep(Duration::from_millis(1500)).await;
    assert!(child.try_wait().unwrap().is_none());

    child.kill().unwrap();
    let _ = child.wait();
}
