//! Shared harness for wire-level tests: spawns a full relay on an
//! ephemeral port and drives it with a raw WebSocket client.

use agora_relay::config::{
    PolicySettings, RateLimitSettings, RelayInfoSettings, RelaySettings, WebSocketSettings,
};
use agora_relay::event::{unix_now, Event, EventDraft, ReplaceableMode, Tag};
use agora_relay::keys::RelayKeys;
use agora_relay::server;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as TungMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub struct TestRelay {
    pub addr: SocketAddr,
    pub url: String,
    pub relay_pubkey: String,
}

pub async fn spawn_relay() -> TestRelay {
    spawn_relay_with(|_| {}).await
}

pub async fn spawn_relay_with<F: FnOnce(&mut RelaySettings)>(mutate: F) -> TestRelay {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let url = format!("ws://{addr}");

    let mut settings = RelaySettings {
        relay_secret_key: "01".repeat(32),
        local_addr: addr.to_string(),
        relay_url: url.clone(),
        db_path: ":memory:".to_string(),
        info: RelayInfoSettings::default(),
        policies: PolicySettings::default(),
        websocket: WebSocketSettings::default(),
        rate_limiting: RateLimitSettings::default(),
        replaceable_mode: ReplaceableMode::Nip01,
        max_limit: 500,
        max_subscriptions: 50,
    };
    mutate(&mut settings);

    let app = server::build(settings).await.unwrap();
    let relay_pubkey = app.relay_pubkey.clone();

    tokio::spawn(async move {
        axum::serve(
            listener,
            app.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    TestRelay {
        addr,
        url,
        relay_pubkey,
    }
}

pub struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    /// NIP-42 challenge pushed by the relay on connect.
    pub challenge: String,
}

impl TestClient {
    pub async fn connect(relay: &TestRelay) -> Self {
        let (ws, _) = tokio_tungstenite::connect_async(&relay.url).await.unwrap();
        let mut client = Self {
            ws,
            challenge: String::new(),
        };

        // The first frame is always the AUTH challenge.
        let frame = client.recv().await;
        assert_eq!(frame[0], "AUTH");
        client.challenge = frame[1].as_str().unwrap().to_string();
        client
    }

    pub async fn send(&mut self, value: Value) {
        self.ws
            .send(TungMessage::Text(value.to_string()))
            .await
            .unwrap();
    }

    pub async fn recv(&mut self) -> Value {
        loop {
            let frame = tokio::time::timeout(std::time::Duration::from_secs(5), self.ws.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("connection closed")
                .unwrap();
            if let TungMessage::Text(text) = frame {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    /// Next frame, or None if the relay stays quiet for the window.
    pub async fn try_recv(&mut self, millis: u64) -> Option<Value> {
        let frame = tokio::time::timeout(
            std::time::Duration::from_millis(millis),
            self.ws.next(),
        )
        .await
        .ok()??
        .ok()?;
        match frame {
            TungMessage::Text(text) => serde_json::from_str(&text).ok(),
            _ => None,
        }
    }

    pub async fn publish(&mut self, event: &Event) -> Value {
        self.send(serde_json::json!(["EVENT", event])).await;
        loop {
            let frame = self.recv().await;
            if frame[0] == "OK" && frame[1] == event.id.as_str() {
                return frame;
            }
        }
    }

    /// Publishes and asserts acceptance.
    pub async fn publish_ok(&mut self, event: &Event) {
        let frame = self.publish(event).await;
        assert_eq!(
            frame[2], true,
            "event {} rejected: {}",
            event.id, frame[3]
        );
    }

    /// Opens a subscription and collects stored events until EOSE.
    pub async fn subscribe(&mut self, sub_id: &str, filters: Vec<Value>) -> Vec<Event> {
        let mut frame = vec![serde_json::json!("REQ"), serde_json::json!(sub_id)];
        frame.extend(filters);
        self.send(Value::Array(frame)).await;

        let mut stored = Vec::new();
        loop {
            let frame = self.recv().await;
            match frame[0].as_str().unwrap() {
                "EVENT" if frame[1] == sub_id => {
                    stored.push(serde_json::from_value(frame[2].clone()).unwrap());
                }
                "EOSE" if frame[1] == sub_id => return stored,
                _ => {}
            }
        }
    }

    pub async fn close_subscription(&mut self, sub_id: &str) {
        self.send(serde_json::json!(["CLOSE", sub_id])).await;
    }

    /// Completes the NIP-42 handshake with the given keys.
    pub async fn authenticate(&mut self, relay: &TestRelay, keys: &RelayKeys) {
        let auth_event = sign_event_at(
            keys,
            22242,
            vec![
                Tag::new(["relay", relay.url.as_str()]),
                Tag::new(["challenge", self.challenge.as_str()]),
            ],
            "",
            unix_now(),
        );
        self.send(serde_json::json!(["AUTH", auth_event])).await;
        let frame = self.recv().await;
        assert_eq!(frame[0], "OK");
        assert_eq!(frame[2], true, "authentication failed: {}", frame[3]);
    }
}

pub fn sign_event(keys: &RelayKeys, kind: u32, tags: Vec<Tag>, content: &str) -> Event {
    sign_event_at(keys, kind, tags, content, unix_now())
}

pub fn sign_event_at(
    keys: &RelayKeys,
    kind: u32,
    tags: Vec<Tag>,
    content: &str,
    created_at: u64,
) -> Event {
    keys.sign_draft_at(EventDraft::new(kind, content).tags(tags), created_at)
        .unwrap()
}
