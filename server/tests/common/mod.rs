//! Shared harness: a server on a random port plus raw socket helpers.
#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use rideshare_server::auth::Role;
use rideshare_server::state::AppState;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

pub type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

pub struct TestServer {
    pub addr: SocketAddr,
    pub base_url: String,
    pub ws_url: String,
    pub state: AppState,
    _tmp: tempfile::TempDir,
}

impl TestServer {
    pub fn token(&self, user_id: &str, role: Role) -> String {
        rideshare_server::auth::jwt::issue_access_token(
            &self.state.jwt_secret,
            user_id,
            role,
            Some(user_id),
        )
        .expect("Failed to issue token")
    }

    pub async fn ws(&self, user_id: &str, role: Role) -> WsStream {
        let url = format!("{}?token={}", self.ws_url, self.token(user_id, role));
        let (mut ws, _) = tokio_tungstenite::connect_async(&url)
            .await
            .expect("Failed to connect");
        let connected = recv_event(&mut ws, "connected").await;
        assert_eq!(connected["data"]["userId"], user_id);
        ws
    }

    pub async fn open_ride(&self, passenger_id: &str, ride_id: &str) -> reqwest::Response {
        reqwest::Client::new()
            .post(format!("{}/api/rides", self.base_url))
            .bearer_auth(self.token(passenger_id, Role::User))
            .json(&json!({
                "rideId": ride_id,
                "pickupLocationName": "Central Station",
                "dropoffLocationName": "Airport",
            }))
            .send()
            .await
            .unwrap()
    }

    pub async fn get(&self, path: &str, token: &str) -> (u16, Value) {
        let resp = reqwest::Client::new()
            .get(format!("{}{}", self.base_url, path))
            .bearer_auth(token)
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap_or(Value::Null))
    }

    pub async fn post(&self, path: &str, token: &str, body: Value) -> (u16, Value) {
        let resp = reqwest::Client::new()
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap_or(Value::Null))
    }
}

/// Start the server on a random port.
pub async fn start_test_server(ride_expiry: Duration) -> TestServer {
    let tmp = tempfile::tempdir().expect("Failed to create temp dir");
    let data_dir = tmp.path().to_str().unwrap().to_string();

    let db = rideshare_server::db::init_db(&data_dir).expect("Failed to init DB");
    let jwt_secret = rideshare_server::auth::jwt::load_or_generate_jwt_secret(&data_dir)
        .expect("Failed to generate JWT secret");
    let state = AppState::new(db, jwt_secret, ride_expiry);

    let app = rideshare_server::routes::build_router(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    TestServer {
        addr,
        base_url: format!("http://{}", addr),
        ws_url: format!("ws://{}/ws", addr),
        state,
        _tmp: tmp,
    }
}

pub async fn send_json(ws: &mut WsStream, value: Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .expect("Failed to send frame");
}

/// Next text frame as JSON, or `None` on timeout or close.
pub async fn next_json(ws: &mut WsStream, wait: Duration) -> Option<Value> {
    loop {
        match tokio::time::timeout(wait, ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                return Some(serde_json::from_str(text.as_str()).expect("Invalid JSON frame"));
            }
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) | Ok(Some(Err(_))) | Err(_) => {
                return None
            }
            Ok(Some(Ok(_))) => continue,
        }
    }
}

/// Skip frames until one with `event`, failing after 5 seconds.
pub async fn recv_event(ws: &mut WsStream, event: &str) -> Value {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match next_json(ws, remaining).await {
            Some(frame) if frame["event"] == event => return frame,
            Some(_) => continue,
            None => panic!("Did not receive `{}`", event),
        }
    }
}

/// Every frame with `event` received within `wait`.
pub async fn collect_events(ws: &mut WsStream, event: &str, wait: Duration) -> Vec<Value> {
    let deadline = tokio::time::Instant::now() + wait;
    let mut out = Vec::new();
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return out;
        }
        match next_json(ws, remaining).await {
            Some(frame) if frame["event"] == event => out.push(frame),
            Some(_) => continue,
            None => return out,
        }
    }
}

/// Close code of the next close frame.
pub async fn recv_close_code(ws: &mut WsStream) -> Option<u16> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(remaining, ws.next()).await {
            Ok(Some(Ok(Message::Close(frame)))) => return frame.map(|f| u16::from(f.code)),
            Ok(Some(Ok(_))) => continue,
            _ => return None,
        }
    }
}

pub fn accept_frame(request_id: &str, ride_id: &str, driver_id: &str, passenger_id: &str) -> Value {
    json!({
        "event": "ride_accepted",
        "data": {
            "requestId": request_id,
            "rideId": ride_id,
            "driverId": driver_id,
            "driverName": driver_id,
            "driverPhone": "+100000000",
            "passengerId": passenger_id,
        }
    })
}

/// Every text frame received within `wait`.
pub async fn collect_all(ws: &mut WsStream, wait: Duration) -> Vec<Value> {
    let deadline = tokio::time::Instant::now() + wait;
    let mut out = Vec::new();
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return out;
        }
        match next_json(ws, remaining).await {
            Some(frame) => out.push(frame),
            None => return out,
        }
    }
}

pub fn of_event<'a>(frames: &'a [Value], event: &str) -> Vec<&'a Value> {
    frames.iter().filter(|f| f["event"] == event).collect()
}

/// Poll `check` until it holds, failing after 5 seconds.
pub async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        if tokio::time::Instant::now() >= deadline {
            panic!("Timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// TCP relay in front of a test server. Lets a test drop live links the way a
/// flaky network would, without the server closing anything itself.
pub struct Relay {
    pub ws_url: String,
    links: Arc<Mutex<Vec<JoinHandle<()>>>>,
    silenced: Arc<AtomicBool>,
    refusing: Arc<AtomicBool>,
}

impl Relay {
    pub async fn start(target: SocketAddr) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let links: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));
        let silenced = Arc::new(AtomicBool::new(false));
        let refusing = Arc::new(AtomicBool::new(false));

        let (accept_links, accept_silenced, accept_refusing) =
            (links.clone(), silenced.clone(), refusing.clone());
        tokio::spawn(async move {
            while let Ok((client, _)) = listener.accept().await {
                if accept_refusing.load(Ordering::SeqCst) {
                    drop(client);
                    continue;
                }
                let Ok(server) = TcpStream::connect(target).await else {
                    continue;
                };
                let link = tokio::spawn(pipe(client, server, accept_silenced.clone()));
                accept_links.lock().unwrap().push(link);
            }
        });

        Self {
            ws_url: format!("ws://{}/ws", addr),
            links,
            silenced,
            refusing,
        }
    }

    /// Keep forwarding client frames but discard everything the server sends.
    pub fn silence(&self) {
        self.silenced.store(true, Ordering::SeqCst);
    }

    /// Drop new connections as soon as they are accepted.
    pub fn refuse_new(&self) {
        self.refusing.store(true, Ordering::SeqCst);
    }

    /// Tear down every live link. Later links forward normally again.
    pub fn cut(&self) {
        for link in self.links.lock().unwrap().drain(..) {
            link.abort();
        }
        self.silenced.store(false, Ordering::SeqCst);
    }
}

async fn pipe(client: TcpStream, server: TcpStream, silenced: Arc<AtomicBool>) {
    let (mut client_rx, mut client_tx) = client.into_split();
    let (mut server_rx, mut server_tx) = server.into_split();

    let upstream = tokio::io::copy(&mut client_rx, &mut server_tx);
    let downstream = async {
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            let n = match server_rx.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            if silenced.load(Ordering::SeqCst) {
                continue;
            }
            if client_tx.write_all(&buf[..n]).await.is_err() {
                break;
            }
        }
    };

    tokio::select! {
        _ = upstream => {}
        _ = downstream => {}
    }
}
