mod common;

use chatmirror_core::messenger_api::serve;
use chatmirror_core::Mirror;
use common::{ChatDb, RecordingBridge};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

struct TestServer {
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: tokio::task::JoinHandle<chatmirror_core::Result<()>>,
}

impl TestServer {
    async fn start(db: &ChatDb) -> (Self, Arc<Mirror>, Arc<RecordingBridge>) {
        let (mirror, bridge) = db.mirror();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(serve(
            listener,
            mirror.clone(),
            db.dir.path().join("Attachments"),
            rx,
        ));
        (Self { addr, shutdown, task }, mirror, bridge)
    }

    async fn request(&self, method: &str, path: &str, body: &str) -> (u16, String, Vec<u8>) {
        let mut stream = TcpStream::connect(self.addr).await.unwrap();
        let req = format!(
            "{} {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\nContent-Length: {}\r\n\r\n{}",
            method,
            path,
            body.len(),
            body
        );
        stream.write_all(req.as_bytes()).await.unwrap();
        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await.unwrap();

        let split = raw.windows(4).position(|w| w == b"\r\n\r\n").unwrap();
        let head = String::from_utf8_lossy(&raw[..split]).to_string();
        let status = head.split_whitespace().nth(1).unwrap().parse().unwrap();
        (status, head, raw[split + 4..].to_vec())
    }

    async fn get_json(&self, path: &str) -> (u16, Value) {
        let (status, _, body) = self.request("GET", path, "").await;
        (status, serde_json::from_slice(&body).unwrap())
    }

    async fn stop(self) {
        self.shutdown.send(true).unwrap();
        self.task.await.unwrap().unwrap();
    }
}

fn seeded() -> ChatDb {
    let db = ChatDb::new();
    let alice = db.add_handle("+15550001111");
    let a = db.add_chat("+15550001111", None, &[alice]);
    db.add_message(a, Some(alice), Some("hello"), 10);
    db.add_message(a, None, Some("hi back"), 20);
    let bob = db.add_handle("bob@example.com");
    let b = db.add_chat("bob@example.com", None, &[bob]);
    let m = db.add_message(b, Some(bob), None, 5);
    db.add_attachment(m, "~/Library/Messages/Attachments/ef/03/map.png", "image/png");
    db
}

#[tokio::test]
async fn test_liveness_and_envelope() {
    let db = seeded();
    let (server, _, _) = TestServer::start(&db).await;

    let (status, head, body) = server.request("GET", "/", "").await;
    assert_eq!(status, 200);
    assert!(head.to_ascii_lowercase().contains("access-control-allow-origin: *"));
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["ok"], true);
    assert_eq!(json["output"], "OK");

    server.stop().await;
}

#[tokio::test]
async fn test_chats_route_forces_refresh() {
    let db = seeded();
    let (server, mirror, _) = TestServer::start(&db).await;

    let (status, json) = server.get_json("/chats").await;
    assert_eq!(status, 200);
    let chats = json["output"].as_array().unwrap();
    assert_eq!(chats.len(), 2);
    assert_eq!(chats[0]["id"], "+15550001111");
    assert_eq!(chats[0]["last_message_date"], 20);
    assert_eq!(chats[0]["messages"][0]["handle"]["id"], "me");
    assert_eq!(mirror.cache().len().await, 2);

    server.stop().await;
}

#[tokio::test]
async fn test_messages_and_last_routes() {
    let db = seeded();
    let (server, _, _) = TestServer::start(&db).await;

    let (status, json) = server.get_json("/chats/%2B15550001111").await;
    assert_eq!(status, 200);
    assert_eq!(json["output"].as_array().unwrap().len(), 2);

    let (status, json) = server.get_json("/chats/%2B15550001111/last").await;
    assert_eq!(status, 200);
    assert_eq!(json["output"]["text"], "hi back");

    let (status, json) = server.get_json("/chats/nobody%40example.com/last").await;
    assert_eq!(status, 200);
    assert!(json["output"].is_null());

    server.stop().await;
}

#[tokio::test]
async fn test_attachment_routes() {
    let db = seeded();
    let (server, _, _) = TestServer::start(&db).await;

    let (_, json) = server.get_json("/attachments").await;
    assert!(json["output"].as_array().unwrap().is_empty());

    server.get_json("/chats").await;
    let (_, json) = server.get_json("/attachments").await;
    let list = json["output"].as_array().unwrap();
    assert_eq!(list.len(), 1);
    let message_id = list[0]["message_id"].as_i64().unwrap();

    let (status, json) = server.get_json(&format!("/attachments/{}", message_id)).await;
    assert_eq!(status, 200);
    assert_eq!(json["output"]["mime_type"], "image/png");

    let (status, json) = server.get_json("/attachments/999").await;
    assert_eq!(status, 404);
    assert_eq!(json["ok"], false);

    let (status, _) = server.get_json("/attachments/abc").await;
    assert_eq!(status, 400);

    server.stop().await;
}

#[tokio::test]
async fn test_file_route_serves_payload() {
    let db = seeded();
    let dir = db.dir.path().join("Attachments/ef/03");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("map.png"), b"\x89PNG fake").unwrap();
    let (server, _, _) = TestServer::start(&db).await;

    let (status, head, body) = server.request("GET", "/file/ef/03/map.png", "").await;
    assert_eq!(status, 200);
    assert!(head.to_ascii_lowercase().contains("content-type: image/png"));
    assert_eq!(body, b"\x89PNG fake");

    let (status, _, _) = server.request("GET", "/file/ef/03/missing.png", "").await;
    assert_eq!(status, 404);

    let (status, _, _) = server.request("GET", "/file/..%2F..%2Fetc%2Fpasswd", "").await;
    assert_eq!(status, 400);

    server.stop().await;
}

#[tokio::test]
async fn test_send_route() {
    let db = seeded();
    let (server, _, bridge) = TestServer::start(&db).await;

    let (status, _, _) = server.request("POST", "/chats/bob%40example.com/send", "hey").await;
    assert_eq!(status, 404);

    server.get_json("/chats").await;
    let (status, _, body) = server
        .request("POST", "/chats/bob%40example.com/send", r#"{"text":"on my way"}"#)
        .await;
    assert_eq!(status, 200);
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["ok"], true);

    let (status, _, _) = server.request("POST", "/chats/bob%40example.com/send", "plain words").await;
    assert_eq!(status, 200);

    let sent = bridge.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].text, "on my way");
    assert_eq!(sent[1].text, "plain words");
    assert_eq!(sent[0].recipients, vec!["bob@example.com".to_string()]);

    server.stop().await;
}

#[tokio::test]
async fn test_status_and_unknown_routes() {
    let db = seeded();
    let (server, _, _) = TestServer::start(&db).await;

    let (status, json) = server.get_json("/status").await;
    assert_eq!(status, 200);
    assert_eq!(json["output"]["state"], "idle");
    assert_eq!(json["output"]["conversations"], 0);

    let (status, json) = server.get_json("/nope").await;
    assert_eq!(status, 404);
    assert_eq!(json["ok"], false);

    let (status, _, _) = server.request("DELETE", "/chats/x", "").await;
    assert_eq!(status, 404);

    server.stop().await;
}
