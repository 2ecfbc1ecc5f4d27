//! Test harnesses: a scripted WebSocket server standing in for GitHound
//! Explore, and a scripted HTTP responder standing in for the code host.
//! Each test binary uses its slice of this module.
#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

/// Scripted server behavior.
#[derive(Clone, Default)]
pub struct DashboardScript {
    /// Close the first connection right after acknowledging the search, to
    /// exercise the client's reconnect path.
    pub drop_after_ack: bool,
    /// Send one ping after authentication.
    pub ping_after_auth: bool,
    /// For tokenless banners: run the account-link flow and hand this token
    /// over instead of confirming immediately.
    pub link_token: Option<&'static str>,
}

pub struct MockDashboard {
    pub url: String,
    /// Every frame any connection received, in arrival order.
    pub frames: mpsc::UnboundedReceiver<Value>,
    pub connections: Arc<AtomicUsize>,
}

/// Bind a scripted dashboard on a loopback port and serve connections until
/// the test ends.
pub async fn spawn_dashboard(script: DashboardScript) -> MockDashboard {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock dashboard");
    let addr = listener.local_addr().unwrap();
    let (frame_tx, frame_rx) = mpsc::unbounded_channel();
    let connections = Arc::new(AtomicUsize::new(0));

    let conn_counter = Arc::clone(&connections);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else { break };
            let n = conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
            let script = script.clone();
            let frame_tx = frame_tx.clone();
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else { return };

                // Banner first.
                let Some(Ok(Message::Text(banner))) = ws.next().await else { return };
                let banner: Value = serde_json::from_str(&banner).unwrap_or(Value::Null);
                let _ = frame_tx.send(banner.clone());
                if banner["event"].as_str() != Some("gh_banner") {
                    return;
                }
                if banner["insertToken"].is_null() {
                    let Some(token) = script.link_token else { return };
                    // Account-link flow: hand out a link first, then confirm
                    // with the token after a beat.
                    let link = json!({
                        "logged_in": false,
                        "url": "https://app.githoundexplore.com/link/abc123",
                    });
                    let _ = ws.send(Message::text(link.to_string())).await;
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    let confirm = json!({"logged_in": true, "insert_token": token});
                    let _ = ws.send(Message::text(confirm.to_string())).await;
                } else {
                    let _ =
                        ws.send(Message::text(json!({"logged_in": true}).to_string())).await;
                }

                if script.ping_after_auth {
                    let _ = ws.send(Message::text(json!({"event": "ping"}).to_string())).await;
                }

                while let Some(Ok(msg)) = ws.next().await {
                    let Message::Text(text) = msg else { continue };
                    let Ok(frame) = serde_json::from_str::<Value>(&text) else { continue };
                    let event = frame["event"].as_str().unwrap_or("").to_string();
                    let _ = frame_tx.send(frame);

                    if event == "start_search" {
                        let ack = json!({
                            "event": "search_ack",
                            "searchID": "search-0001",
                            "url": "https://app.githoundexplore.com/search/search-0001",
                        });
                        let _ = ws.send(Message::text(ack.to_string())).await;
                        if script.drop_after_ack && n == 1 {
                            // Hard drop, no close frame: the client should
                            // treat this as a lost connection and redial.
                            return;
                        }
                    }
                }
            });
        }
    });

    MockDashboard { url: format!("ws://{addr}"), frames: frame_rx, connections }
}

/// Drain every frame currently queued from the server.
pub async fn drain_frames(dash: &mut MockDashboard) -> Vec<Value> {
    let mut frames = Vec::new();
    while let Ok(frame) =
        tokio::time::timeout(std::time::Duration::from_millis(200), dash.frames.recv()).await
    {
        match frame {
            Some(frame) => frames.push(frame),
            None => break,
        }
    }
    frames
}

// ---------------------------------------------------------------------------
// Scripted HTTP responder
// ---------------------------------------------------------------------------

/// One canned HTTP response.
#[derive(Clone)]
pub struct CannedResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: String,
}

impl CannedResponse {
    pub fn json(status: u16, body: impl Into<String>) -> Self {
        Self { status, content_type: "application/json", body: body.into() }
    }

    pub fn html(status: u16, body: impl Into<String>) -> Self {
        Self { status, content_type: "text/html", body: body.into() }
    }
}

/// A plain-thread HTTP/1.1 responder that serves a fixed script of responses
/// in request order. Runs outside the tokio runtime on purpose, so tests that
/// pause tokio time still do real I/O against it.
pub struct MockHost {
    pub url: String,
    remaining: Arc<std::sync::Mutex<Vec<CannedResponse>>>,
}

impl MockHost {
    pub fn serve(mut script: Vec<CannedResponse>) -> Self {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind mock host");
        let addr = listener.local_addr().unwrap();
        // Served with pop(), so keep request order at the tail.
        script.reverse();
        let remaining = Arc::new(std::sync::Mutex::new(script));

        let queue = Arc::clone(&remaining);
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { break };
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || {
                    use std::io::{Read, Write};
                    // Read until the end of the request headers.
                    let mut buf = Vec::new();
                    let mut byte = [0u8; 1];
                    while !buf.ends_with(b"\r\n\r\n") {
                        match stream.read(&mut byte) {
                            Ok(1) => buf.push(byte[0]),
                            _ => return,
                        }
                    }
                    let response = queue.lock().unwrap().pop();
                    let response = response.unwrap_or(CannedResponse {
                        status: 404,
                        content_type: "text/plain",
                        body: "script exhausted".to_string(),
                    });
                    let reply = format!(
                        "HTTP/1.1 {} X\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        response.status,
                        response.content_type,
                        response.body.len(),
                        response.body
                    );
                    let _ = stream.write_all(reply.as_bytes());
                });
            }
        });

        MockHost { url: format!("http://{addr}"), remaining }
    }

    /// Responses not yet served.
    pub fn unserved(&self) -> usize {
        self.remaining.lock().unwrap().len()
    }
}
